//! Node bootstrap: CLI arguments, core mounting, HTTP serving, shutdown.
//!
//! `start_node` is also the embedded entry point: integration tests run
//! several nodes in one process against a shared in-memory coordination
//! store, each with its own listener and runtime.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use strata_coord::{CoordStore, MemCoordStore};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::cluster::{ReplicaId, ReplicaType};
use crate::config::RecoveryTuning;
use crate::core::{CoreDescriptor, ReplicaCore};
use crate::http_api;
use crate::runtime::Runtime;

/// One `--core` mount: `collection:shard:name:id:type`.
#[derive(Debug, Clone)]
pub struct CoreSpec {
    pub collection: String,
    pub shard: String,
    pub name: String,
    pub replica_id: ReplicaId,
    pub replica_type: ReplicaType,
}

impl FromStr for CoreSpec {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = raw.split(':').collect();
        let [collection, shard, name, id, rtype] = parts.as_slice() else {
            return Err(format!(
                "expected collection:shard:name:id:type, got {raw:?}"
            ));
        };
        let replica_id = id.parse().map_err(|_| format!("bad replica id {id:?}"))?;
        let replica_type = match rtype.to_ascii_uppercase().as_str() {
            "NRT" => ReplicaType::Nrt,
            "TLOG" => ReplicaType::Tlog,
            "PULL" => ReplicaType::Pull,
            other => return Err(format!("unknown replica type {other:?}")),
        };
        Ok(Self {
            collection: collection.to_string(),
            shard: shard.to_string(),
            name: name.to_string(),
            replica_id,
            replica_type,
        })
    }
}

#[derive(Debug, Parser)]
#[command(name = "strata-search", about = "strata search-index node")]
pub struct NodeArgs {
    /// Node identity; defaults to the bound listen address.
    #[arg(long)]
    pub node_name: Option<String>,

    /// HTTP listen address (port 0 picks a free port).
    #[arg(long, default_value = "127.0.0.1:0")]
    pub listen_http: SocketAddr,

    /// Data directory; each core lives in a subdirectory by name.
    #[arg(long)]
    pub data_dir: PathBuf,

    /// Replica cores to mount, `collection:shard:name:id:type` each.
    #[arg(long = "core")]
    pub cores: Vec<CoreSpec>,

    /// Start recovery for every log-carrying core after mounting, as after
    /// a crash-restart.
    #[arg(long, default_value_t = false)]
    pub recover_on_start: bool,
}

/// A running node, embedded or standalone.
pub struct NodeHandle {
    pub runtime: Arc<Runtime>,
    pub addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<std::io::Result<()>>,
}

impl NodeHandle {
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Stop serving and tear the runtime down.
    pub async fn shutdown(mut self) -> anyhow::Result<()> {
        self.runtime.begin_shutdown();
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        match self.task.await {
            Ok(result) => result.context("http server"),
            Err(err) => Err(anyhow::anyhow!("node task join failed: {err}")),
        }
    }
}

/// Bind, mount cores, and serve. Returns once the listener is ready.
pub async fn start_node(args: NodeArgs, store: Arc<dyn CoordStore>) -> anyhow::Result<NodeHandle> {
    start_node_with_tuning(args, store, RecoveryTuning::default()).await
}

/// `start_node` with explicit tunables; embedded tests shrink the retry
/// budget and delays through this.
pub async fn start_node_with_tuning(
    args: NodeArgs,
    store: Arc<dyn CoordStore>,
    tuning: RecoveryTuning,
) -> anyhow::Result<NodeHandle> {
    let listener = tokio::net::TcpListener::bind(args.listen_http)
        .await
        .with_context(|| format!("bind {}", args.listen_http))?;
    let addr = listener.local_addr().context("resolve listen addr")?;
    let base_url = format!("http://{addr}");
    let node_name = args.node_name.unwrap_or_else(|| addr.to_string());
    let runtime = Runtime::new(&node_name, &base_url, store, tuning)?;
    runtime.register_live_node().await?;

    for spec in &args.cores {
        let descriptor = CoreDescriptor {
            name: spec.name.clone(),
            collection: spec.collection.clone(),
            shard: spec.shard.clone(),
            replica_id: spec.replica_id,
            replica_type: spec.replica_type,
        };
        let core = ReplicaCore::open(
            args.data_dir.join(&spec.name),
            descriptor,
            tuning.peer_sync_window,
        )?;
        runtime.register_core(Arc::clone(&core)).await?;
        if spec.replica_type.background_replication() {
            core.start_background_replication(Arc::clone(&runtime));
        }
        if args.recover_on_start && spec.replica_type.uses_update_log() {
            core.start_recovery(Arc::clone(&runtime), true, None);
        }
        tracing::info!(
            node = %node_name,
            core = %spec.name,
            collection = %spec.collection,
            shard = %spec.shard,
            replica_type = ?spec.replica_type,
            "core mounted"
        );
    }

    let router = http_api::router(Arc::clone(&runtime));
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
    });

    tracing::info!(node = %runtime.node_name, addr = %addr, "node serving");
    Ok(NodeHandle {
        runtime,
        addr,
        shutdown_tx: Some(shutdown_tx),
        task,
    })
}

/// Standalone entry point. The in-memory coordination store makes a single
/// node self-contained; clustered deployments plug a shared store in behind
/// the same trait.
pub async fn run_cli() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = NodeArgs::parse();
    let store: Arc<dyn CoordStore> = Arc::new(MemCoordStore::new());
    let handle = start_node(args, store).await?;

    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    tracing::info!("shutting down");
    handle.shutdown().await
}
