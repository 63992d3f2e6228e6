//! Leader-side HTTP surface of the recovery protocol.
//!
//! Four endpoints per node: `/cores/{core}/get` (versions, updates,
//! fingerprints), `/cores/{core}/update` (commit), `/cores/{core}/replication`
//! (file list / file content / fetch trigger) and `/admin/cores`
//! (prep-recovery). Everything speaks JSON except file content, which is raw
//! bytes.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;

use crate::cluster::{ReplicaState, ReplicaType};
use crate::fingerprint;
use crate::index_fetcher::{FetchOptions, IndexFetcher};
use crate::runtime::Runtime;
use crate::update_log::UpdatesSpec;

/// Wait slice while the prep-recovery handler polls the projection.
const PREP_POLL: Duration = Duration::from_millis(250);

#[derive(Debug)]
enum ApiError {
    /// The core is not (yet) registered on this node; retryable.
    CoreNotReady(String),
    /// `onlyIfLeader` was set and this replica is not the elected leader.
    NotLeader(String),
    BadRequest(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::CoreNotReady(core) => (
                StatusCode::SERVICE_UNAVAILABLE,
                format!("core {core} is not ready"),
            ),
            ApiError::NotLeader(core) => (
                StatusCode::SERVICE_UNAVAILABLE,
                format!("{core} is not the leader"),
            ),
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::Internal(message) => (StatusCode::INTERNAL_SERVER_ERROR, message),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

/// Build the node's router.
pub fn router(runtime: Arc<Runtime>) -> Router {
    Router::new()
        .route("/cores/:core/get", get(handle_get).post(handle_get))
        .route("/cores/:core/update", post(handle_update))
        .route(
            "/cores/:core/replication",
            get(handle_replication).post(handle_replication),
        )
        .route("/admin/cores", get(handle_admin).post(handle_admin))
        .with_state(runtime)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GetParams {
    get_versions: Option<usize>,
    #[serde(default)]
    fingerprint: bool,
    get_updates: Option<String>,
    get_fingerprint: Option<i64>,
    #[serde(default)]
    only_if_leader: bool,
    #[serde(default)]
    skip_dbq: bool,
    #[allow(dead_code)]
    distrib: Option<bool>,
}

async fn handle_get(
    State(runtime): State<Arc<Runtime>>,
    Path(core_name): Path<String>,
    Query(params): Query<GetParams>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let core = runtime
        .core(&core_name)
        .ok_or_else(|| ApiError::CoreNotReady(core_name.clone()))?;
    if params.only_if_leader {
        ensure_local_leader(&runtime, &core_name).await?;
    }

    if let Some(raw_spec) = params.get_updates {
        let spec = UpdatesSpec::parse(&raw_spec)
            .map_err(|err| ApiError::BadRequest(format!("bad updates spec: {err:#}")))?;
        let ulog = core
            .ulog()
            .ok_or_else(|| ApiError::BadRequest(format!("core {core_name} has no update log")))?;
        let mut updates = ulog.get_updates(&spec);
        if params.skip_dbq {
            updates.retain(|entry| entry.op != crate::update_log::OP_DELETE_BY_QUERY);
        }
        return Ok(Json(json!({ "updates": updates })));
    }

    if let Some(max_version) = params.get_fingerprint {
        let fp = fingerprint::compute(&core.index, max_version);
        return Ok(Json(json!({ "fingerprint": fp })));
    }

    if let Some(n) = params.get_versions {
        let ulog = core
            .ulog()
            .ok_or_else(|| ApiError::BadRequest(format!("core {core_name} has no update log")))?;
        let versions = ulog.recent_versions(n);
        let mut body = json!({ "versions": versions });
        if params.fingerprint {
            body["fingerprint"] =
                serde_json::to_value(fingerprint::compute(&core.index, i64::MAX))
                    .map_err(|err| ApiError::Internal(err.to_string()))?;
        }
        return Ok(Json(body));
    }

    Err(ApiError::BadRequest(
        "one of getVersions, getUpdates, getFingerprint is required".to_string(),
    ))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateParams {
    #[serde(default)]
    commit: bool,
    #[serde(default)]
    open_searcher: Option<bool>,
    #[allow(dead_code)]
    #[serde(rename = "commit_end_point")]
    commit_end_point: Option<String>,
}

async fn handle_update(
    State(runtime): State<Arc<Runtime>>,
    Path(core_name): Path<String>,
    Query(params): Query<UpdateParams>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let core = runtime
        .core(&core_name)
        .ok_or_else(|| ApiError::CoreNotReady(core_name.clone()))?;
    if !params.commit {
        return Err(ApiError::BadRequest("only commit is supported".to_string()));
    }
    core.index
        .commit(params.open_searcher.unwrap_or(true))
        .map_err(|err| ApiError::Internal(format!("{err:#}")))?;
    Ok(Json(json!({ "status": "ok" })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReplicationParams {
    command: String,
    file: Option<String>,
    /// `tlog` reads from the transaction log directory instead of the index.
    dir: Option<String>,
    master_url: Option<String>,
    #[serde(default)]
    include_tlog: bool,
    #[serde(default)]
    skip_commit_on_master_version_zero: bool,
    #[serde(default)]
    download_tlog: bool,
}

async fn handle_replication(
    State(runtime): State<Arc<Runtime>>,
    Path(core_name): Path<String>,
    Query(params): Query<ReplicationParams>,
) -> Result<Response, ApiError> {
    let core = runtime
        .core(&core_name)
        .ok_or_else(|| ApiError::CoreNotReady(core_name.clone()))?;
    match params.command.as_str() {
        "filelist" => {
            let files = core
                .index
                .list_files()
                .map_err(|err| ApiError::Internal(format!("{err:#}")))?;
            let mut body = json!({ "generation": core.index.generation(), "files": files });
            if params.include_tlog {
                if let Some(ulog) = core.ulog() {
                    let tlog_files = ulog
                        .log_files()
                        .map_err(|err| ApiError::Internal(format!("{err:#}")))?;
                    body["tlogFiles"] = serde_json::to_value(tlog_files)
                        .map_err(|err| ApiError::Internal(err.to_string()))?;
                }
            }
            Ok(Json(body).into_response())
        }
        "filecontent" => {
            let name = params
                .file
                .ok_or_else(|| ApiError::BadRequest("file parameter required".to_string()))?;
            let data = if params.dir.as_deref() == Some("tlog") {
                let ulog = core.ulog().ok_or_else(|| {
                    ApiError::BadRequest(format!("core {core_name} has no update log"))
                })?;
                ulog.read_log_file(&name)
                    .map_err(|err| ApiError::BadRequest(format!("{err:#}")))?
            } else {
                core.index
                    .read_file(&name)
                    .map_err(|err| ApiError::BadRequest(format!("{err:#}")))?
            };
            Ok((
                StatusCode::OK,
                [(header::CONTENT_TYPE, "application/octet-stream")],
                data,
            )
                .into_response())
        }
        "fetchindex" => {
            let leader_url = params
                .master_url
                .ok_or_else(|| ApiError::BadRequest("masterUrl parameter required".to_string()))?;
            let options = FetchOptions {
                skip_commit_on_leader_version_zero: params.skip_commit_on_master_version_zero
                    && core.replica_type == ReplicaType::Tlog,
                download_tlog: params.download_tlog,
            };
            let fetcher = IndexFetcher::new(
                runtime.client.clone(),
                runtime.tuning.fetch_idle_timeout,
            );
            tokio::spawn(async move {
                let result = fetcher.fetch(&core, &leader_url, options).await;
                if !result.successful {
                    tracing::warn!(message = %result.message, "triggered fetch failed");
                }
            });
            Ok(Json(json!({ "status": "ok" })).into_response())
        }
        other => Err(ApiError::BadRequest(format!(
            "unknown replication command {other:?}"
        ))),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AdminParams {
    action: String,
    core_name: Option<String>,
    leader_name: Option<String>,
    collection: Option<String>,
    #[allow(dead_code)]
    state: Option<String>,
    #[serde(default)]
    check_is_leader: bool,
}

/// `PREPRECOVERY`: block until the named follower is visible as BUFFERING in
/// this node's cluster projection, re-verifying our own leadership while
/// waiting.
async fn handle_admin(
    State(runtime): State<Arc<Runtime>>,
    Query(params): Query<AdminParams>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if params.action.to_ascii_uppercase() != "PREPRECOVERY" {
        return Err(ApiError::BadRequest(format!(
            "unknown admin action {:?}",
            params.action
        )));
    }
    let follower = params
        .core_name
        .ok_or_else(|| ApiError::BadRequest("coreName required".to_string()))?;
    let leader_name = params
        .leader_name
        .ok_or_else(|| ApiError::BadRequest("leaderName required".to_string()))?;
    let collection = params
        .collection
        .ok_or_else(|| ApiError::BadRequest("collection required".to_string()))?;

    runtime.state_reader.watch_collection(&collection);
    let deadline = tokio::time::Instant::now() + runtime.tuning.prep_recovery_timeout;
    loop {
        if params.check_is_leader {
            let still_leader = match runtime.elector(&leader_name) {
                Some(elector) => elector.is_leader().await,
                None => false,
            };
            if !still_leader {
                tracing::info!(
                    leader = %leader_name,
                    follower = %follower,
                    "prep recovery refused, not the leader"
                );
                return Ok(Json(json!({ "success": false })));
            }
        }

        let follower_name = follower.clone();
        let visible = runtime
            .state_reader
            .wait_for_state(&collection, PREP_POLL, move |_live, coll| {
                coll.and_then(|c| c.replica_by_name(&follower_name))
                    .map(|rep| rep.state == ReplicaState::Buffering)
                    .unwrap_or(false)
            })
            .await;
        if visible {
            tracing::info!(
                leader = %leader_name,
                follower = %follower,
                "prep recovery acknowledged"
            );
            return Ok(Json(json!({ "success": true })));
        }
        if tokio::time::Instant::now() >= deadline {
            tracing::info!(
                leader = %leader_name,
                follower = %follower,
                "prep recovery timed out waiting for buffering state"
            );
            return Ok(Json(json!({ "success": false })));
        }
        runtime.state_reader.request_update(&collection, true);
    }
}

async fn ensure_local_leader(runtime: &Arc<Runtime>, core_name: &str) -> Result<(), ApiError> {
    let is_leader = match runtime.elector(core_name) {
        Some(elector) => elector.is_leader().await,
        None => false,
    };
    if is_leader {
        Ok(())
    } else {
        Err(ApiError::NotLeader(core_name.to_string()))
    }
}
