//! One replica's locally mounted state: index, update log, and the locks
//! and task handles that serialize writer quiesce, recovery, and background
//! replication.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::cluster::{ReplicaId, ReplicaType};
use crate::index::IndexCore;
use crate::index_fetcher::{FetchOptions, IndexFetcher};
use crate::recovery::{RecoveryListener, RecoveryOutcome, RecoveryStrategy};
use crate::runtime::Runtime;
use crate::update_log::{LogEntry, LogState, UpdateLog};

/// Identity of a core hosted on this node.
#[derive(Debug, Clone)]
pub struct CoreDescriptor {
    pub name: String,
    pub collection: String,
    pub shard: String,
    pub replica_id: ReplicaId,
    pub replica_type: ReplicaType,
}

struct RecoveryHandle {
    close: Arc<AtomicBool>,
    wake: Arc<Notify>,
    task: Option<JoinHandle<RecoveryOutcome>>,
}

struct BackgroundReplication {
    stop: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

/// A replica core. At most one recovery attempt is outstanding at a time;
/// starting a new one cancels its predecessor.
pub struct ReplicaCore {
    pub name: String,
    pub collection: String,
    pub shard: String,
    pub replica_id: ReplicaId,
    pub replica_type: ReplicaType,
    pub data_dir: PathBuf,
    pub index: Arc<IndexCore>,
    ulog: Option<Arc<UpdateLog>>,
    /// Serializes writer quiesce / index swap / reopen.
    pub core_state: tokio::sync::Mutex<()>,
    recovery: Mutex<Option<RecoveryHandle>>,
    background_repl: Mutex<Option<BackgroundReplication>>,
}

impl ReplicaCore {
    /// Mount a core under `data_dir`. PULL replicas carry no update log.
    pub fn open(
        data_dir: impl AsRef<Path>,
        descriptor: CoreDescriptor,
        num_records_to_keep: usize,
    ) -> anyhow::Result<Arc<Self>> {
        let data_dir = data_dir.as_ref().to_path_buf();
        let index = Arc::new(
            IndexCore::open(data_dir.join("index"))
                .with_context(|| format!("open index for core {}", descriptor.name))?,
        );
        let ulog = if descriptor.replica_type.uses_update_log() {
            Some(Arc::new(
                UpdateLog::open(data_dir.join("tlog"), num_records_to_keep)
                    .with_context(|| format!("open update log for core {}", descriptor.name))?,
            ))
        } else {
            None
        };
        Ok(Arc::new(Self {
            name: descriptor.name,
            collection: descriptor.collection,
            shard: descriptor.shard,
            replica_id: descriptor.replica_id,
            replica_type: descriptor.replica_type,
            data_dir,
            index,
            ulog,
            core_state: tokio::sync::Mutex::new(()),
            recovery: Mutex::new(None),
            background_repl: Mutex::new(None),
        }))
    }

    pub fn ulog(&self) -> Option<&Arc<UpdateLog>> {
        self.ulog.as_ref()
    }

    pub fn require_ulog(&self) -> anyhow::Result<Arc<UpdateLog>> {
        self.ulog
            .clone()
            .with_context(|| format!("core {} has no update log", self.name))
    }

    /// Entry point of the (out-of-scope) update pipeline: log the update
    /// and, outside buffering, apply it to the index immediately.
    pub fn ingest(&self, entry: LogEntry) -> anyhow::Result<()> {
        let ulog = self.require_ulog()?;
        let buffering = !matches!(ulog.state(), LogState::Applying);
        ulog.append_update(entry.clone())?;
        if !buffering {
            self.index.apply(&entry);
            self.index.commit(false)?;
        }
        Ok(())
    }

    /// Kick off a recovery attempt, cancelling any outstanding one.
    pub fn start_recovery(
        self: &Arc<Self>,
        runtime: Arc<Runtime>,
        after_startup: bool,
        listener: Option<Arc<dyn RecoveryListener>>,
    ) {
        self.cancel_recovery();
        let close = Arc::new(AtomicBool::new(false));
        let wake = Arc::new(Notify::new());
        let strategy = RecoveryStrategy::new(
            runtime,
            Arc::clone(self),
            after_startup,
            listener,
            Arc::clone(&close),
            Arc::clone(&wake),
        );
        let task = tokio::spawn(strategy.run());
        let mut slot = self.recovery.lock().unwrap();
        *slot = Some(RecoveryHandle {
            close,
            wake,
            task: Some(task),
        });
    }

    /// Flip the close flag on the outstanding recovery attempt, if any. The
    /// attempt observes it at its next suspension point.
    pub fn cancel_recovery(&self) {
        let slot = self.recovery.lock().unwrap();
        if let Some(handle) = slot.as_ref() {
            handle.close.store(true, Ordering::SeqCst);
            handle.wake.notify_waiters();
        }
    }

    /// Await the outstanding recovery attempt's outcome.
    pub async fn wait_recovery(&self) -> Option<RecoveryOutcome> {
        let task = {
            let mut slot = self.recovery.lock().unwrap();
            slot.as_mut().and_then(|handle| handle.task.take())
        };
        match task {
            Some(task) => task.await.ok(),
            None => None,
        }
    }

    pub fn recovery_running(&self) -> bool {
        self.recovery
            .lock()
            .unwrap()
            .as_ref()
            .and_then(|handle| handle.task.as_ref())
            .map(|task| !task.is_finished())
            .unwrap_or(false)
    }

    /// Periodic segment replication from the shard leader (TLOG and PULL
    /// replicas). Recovery stops this before a full fetch and restarts it on
    /// success.
    pub fn start_background_replication(self: &Arc<Self>, runtime: Arc<Runtime>) {
        if !self.replica_type.background_replication() {
            return;
        }
        let mut slot = self.background_repl.lock().unwrap();
        if let Some(existing) = slot.as_ref() {
            if !existing.task.is_finished() {
                return;
            }
        }
        let stop = Arc::new(AtomicBool::new(false));
        let core = Arc::clone(self);
        let stop_flag = Arc::clone(&stop);
        let task = tokio::spawn(async move {
            let interval = runtime.tuning.background_repl_interval;
            let fetcher = IndexFetcher::new(
                runtime.client.clone(),
                runtime.tuning.fetch_idle_timeout,
            );
            loop {
                tokio::time::sleep(interval).await;
                if stop_flag.load(Ordering::SeqCst) || runtime.is_closing() {
                    break;
                }
                let leader = match runtime
                    .state_reader
                    .get_leader_retry(
                        &core.collection,
                        &core.shard,
                        std::time::Duration::from_secs(2),
                    )
                    .await
                {
                    Ok(leader) => leader,
                    Err(_) => continue,
                };
                if leader.name == core.name {
                    continue;
                }
                let result = fetcher
                    .fetch(
                        &core,
                        &leader.core_url(),
                        FetchOptions {
                            skip_commit_on_leader_version_zero: core.replica_type
                                == ReplicaType::Tlog,
                            download_tlog: false,
                        },
                    )
                    .await;
                if !result.successful {
                    tracing::debug!(
                        core = %core.name,
                        message = %result.message,
                        "background replication poll failed"
                    );
                }
            }
            tracing::debug!(core = %core.name, "background replication stopped");
        });
        *slot = Some(BackgroundReplication { stop, task });
    }

    pub fn stop_background_replication(&self) {
        let mut slot = self.background_repl.lock().unwrap();
        if let Some(handle) = slot.take() {
            handle.stop.store(true, Ordering::SeqCst);
            handle.task.abort();
        }
    }

    /// Tear the core down: recovery and replication both stop.
    pub fn close(&self) {
        self.cancel_recovery();
        self.stop_background_replication();
    }
}
