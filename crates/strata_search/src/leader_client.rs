//! Typed HTTP client for the follower→leader recovery protocol.
//!
//! One `reqwest::Client` (and therefore one connection pool) is shared by
//! every recovery attempt on a node; each call sets its own timeout. All
//! recovery calls carry `distrib=false` and, unless noted, `onlyIfLeader=true`.

use std::time::Duration;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::fingerprint::Fingerprint;
use crate::index::FileMeta;
use crate::update_log::{LogEntry, UpdatesSpec};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("leader returned status {status}: {message}")]
    Api { status: u16, message: String },
    #[error("unexpected response shape: {0}")]
    InvalidResponse(String),
}

impl ClientError {
    /// Timeouts and connection errors may resolve on retry; protocol
    /// mismatches will not.
    pub fn is_transient(&self) -> bool {
        match self {
            ClientError::Http(err) => err.is_timeout() || err.is_connect() || err.is_request(),
            ClientError::Api { status, .. } => *status >= 500,
            ClientError::InvalidResponse(_) => false,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct VersionsResponse {
    pub versions: Vec<i64>,
    pub fingerprint: Option<Fingerprint>,
}

#[derive(Debug, Deserialize)]
struct UpdatesResponse {
    updates: Vec<LogEntry>,
}

#[derive(Debug, Deserialize)]
struct FingerprintResponse {
    fingerprint: Fingerprint,
}

#[derive(Debug, Deserialize)]
pub struct FileListResponse {
    pub generation: u64,
    pub files: Vec<FileMeta>,
    /// Present when the follower asked for the leader's transaction log too.
    #[serde(default, rename = "tlogFiles")]
    pub tlog_files: Vec<FileMeta>,
}

#[derive(Debug, Deserialize)]
struct SuccessResponse {
    success: bool,
}

/// Parameters of the prep-recovery command sent to the leader's node.
#[derive(Debug, Clone)]
pub struct PrepRecoveryParams {
    pub core_name: String,
    pub leader_name: String,
    pub collection: String,
}

/// Follower-side client for the recovery wire protocol.
#[derive(Clone)]
pub struct LeaderClient {
    http: reqwest::Client,
    default_timeout: Duration,
}

impl LeaderClient {
    pub fn new(http: reqwest::Client, default_timeout: Duration) -> Self {
        Self {
            http,
            default_timeout,
        }
    }

    /// `GET {core}/get?getVersions=N&fingerprint=...&onlyIfLeader=true`.
    pub async fn get_versions(
        &self,
        leader_core_url: &str,
        n_updates: usize,
        with_fingerprint: bool,
    ) -> Result<VersionsResponse, ClientError> {
        let url = format!(
            "{}/get?distrib=false&onlyIfLeader=true&getVersions={}&fingerprint={}",
            leader_core_url.trim_end_matches('/'),
            n_updates,
            with_fingerprint
        );
        self.get_json(&url, self.default_timeout).await
    }

    /// `GET {core}/get?getFingerprint=<maxVersion>&onlyIfLeader=true`.
    /// `i64::MAX` means "at head".
    pub async fn get_fingerprint(
        &self,
        leader_core_url: &str,
        max_version: i64,
    ) -> Result<Fingerprint, ClientError> {
        let url = format!(
            "{}/get?distrib=false&onlyIfLeader=true&getFingerprint={}",
            leader_core_url.trim_end_matches('/'),
            max_version
        );
        let response: FingerprintResponse = self.get_json(&url, self.default_timeout).await?;
        Ok(response.fingerprint)
    }

    /// `POST {core}/get?getUpdates=<spec>&skipDbq=true&onlyIfLeader=true`.
    pub async fn get_updates(
        &self,
        leader_core_url: &str,
        spec: &UpdatesSpec,
    ) -> Result<Vec<LogEntry>, ClientError> {
        let url = format!(
            "{}/get?distrib=false&onlyIfLeader=true&skipDbq=true&getUpdates={}",
            leader_core_url.trim_end_matches('/'),
            spec.to_param()
        );
        let response = self
            .http
            .post(&url)
            .timeout(self.default_timeout)
            .send()
            .await?;
        let response: UpdatesResponse = decode(response).await?;
        Ok(response.updates)
    }

    /// Empty commit on the leader to stabilize its index view before a full
    /// fetch. `POST {core}/update?commit=true&openSearcher=false`.
    pub async fn commit(&self, leader_core_url: &str) -> Result<(), ClientError> {
        let url = format!(
            "{}/update?commit=true&openSearcher=false&commit_end_point=terminal",
            leader_core_url.trim_end_matches('/')
        );
        let response = self
            .http
            .post(&url)
            .timeout(self.default_timeout)
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }

    /// Prep-recovery: the leader acknowledges the follower's BUFFERING state
    /// before the follower begins fetching. Bounded by `timeout` end to end.
    pub async fn prep_recovery(
        &self,
        leader_base_url: &str,
        params: &PrepRecoveryParams,
        timeout: Duration,
    ) -> Result<bool, ClientError> {
        let url = format!(
            "{}/admin/cores?action=PREPRECOVERY&coreName={}&leaderName={}&collection={}&state=buffering&checkIsLeader=true",
            leader_base_url.trim_end_matches('/'),
            params.core_name,
            params.leader_name,
            params.collection
        );
        let response = self.http.post(&url).timeout(timeout).send().await?;
        let response: SuccessResponse = decode(response).await?;
        Ok(response.success)
    }

    /// `GET {core}/replication?command=filelist[&includeTlog=true]`.
    pub async fn file_list(
        &self,
        leader_core_url: &str,
        include_tlog: bool,
    ) -> Result<FileListResponse, ClientError> {
        let url = format!(
            "{}/replication?command=filelist&includeTlog={}",
            leader_core_url.trim_end_matches('/'),
            include_tlog
        );
        self.get_json(&url, self.default_timeout).await
    }

    /// `GET {core}/replication?command=filecontent&file=<name>[&dir=tlog]`.
    pub async fn file_content(
        &self,
        leader_core_url: &str,
        name: &str,
        tlog: bool,
        idle_timeout: Duration,
    ) -> Result<Bytes, ClientError> {
        let url = format!(
            "{}/replication?command=filecontent&file={}{}",
            leader_core_url.trim_end_matches('/'),
            name,
            if tlog { "&dir=tlog" } else { "" }
        );
        let response = self.http.get(&url).timeout(idle_timeout).send().await?;
        let response = check_status(response).await?;
        Ok(response.bytes().await?)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        timeout: Duration,
    ) -> Result<T, ClientError> {
        let response = self.http.get(url).timeout(timeout).send().await?;
        decode(response).await
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    Err(ClientError::Api {
        status: status.as_u16(),
        message,
    })
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ClientError> {
    let response = check_status(response).await?;
    let body = response.bytes().await?;
    serde_json::from_slice(&body).map_err(|err| {
        ClientError::InvalidResponse(format!(
            "{err} in {}",
            String::from_utf8_lossy(&body[..body.len().min(256)])
        ))
    })
}
