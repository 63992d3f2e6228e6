//! The per-replica recovery state machine.
//!
//! One attempt walks: check leader → publish BUFFERING → buffer updates →
//! prep-recovery → peer sync (falling back to a full index fetch) → replay →
//! publish ACTIVE. Failures loop back through a close-aware backoff ladder
//! until the retry budget is exhausted, at which point RECOVERY_FAILED is
//! published exactly once. The close flag is observed at every suspension
//! point; a closed attempt exits without publishing anything.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::timeout;

use crate::cluster::{Replica, ReplicaState, ReplicaType};
use crate::core::ReplicaCore;
use crate::index_fetcher::{FetchOptions, IndexFetcher};
use crate::leader_client::{ClientError, PrepRecoveryParams};
use crate::peer_sync::PeerSyncWithLeader;
use crate::runtime::Runtime;
use crate::update_log::LogState;

/// Terminal result of a recovery attempt, as seen by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// Caught up and published ACTIVE.
    Recovered,
    /// This replica is the elected leader; recovering would be illegal.
    SkippedIsLeader,
    /// Retry budget exhausted; RECOVERY_FAILED published.
    FailedMaxRetries,
    /// Host is tearing down; nothing was published.
    AbortedClosing,
}

/// Callback pair notified of the terminal outcome.
pub trait RecoveryListener: Send + Sync {
    fn recovered(&self);
    fn failed(&self);
}

/// Result of one pass through the recovery pipeline.
enum Attempt {
    Success,
    Failed,
    /// Unexpected response shape from the leader; retrying cannot help.
    Fatal,
    Aborted,
    IsLeader,
}

enum PrepOutcome {
    Acknowledged,
    Refused,
    Mismatch,
    Closed,
}

pub struct RecoveryStrategy {
    runtime: Arc<Runtime>,
    core: Arc<ReplicaCore>,
    recovering_after_startup: bool,
    listener: Option<Arc<dyn RecoveryListener>>,
    close: Arc<AtomicBool>,
    wake: Arc<Notify>,
}

impl RecoveryStrategy {
    pub fn new(
        runtime: Arc<Runtime>,
        core: Arc<ReplicaCore>,
        recovering_after_startup: bool,
        listener: Option<Arc<dyn RecoveryListener>>,
        close: Arc<AtomicBool>,
        wake: Arc<Notify>,
    ) -> Self {
        Self {
            runtime,
            core,
            recovering_after_startup,
            listener,
            close,
            wake,
        }
    }

    fn is_closed(&self) -> bool {
        self.close.load(Ordering::SeqCst)
            || self.runtime.is_closing()
            || self.runtime.session_expired()
    }

    /// Resolves when the attempt is closed; used to abort in-flight calls.
    async fn closed_signal(&self) {
        loop {
            if self.is_closed() {
                return;
            }
            let _ = timeout(Duration::from_millis(100), self.wake.notified()).await;
        }
    }

    /// Run `future` unless the attempt is closed first; a close cancels the
    /// in-flight call by dropping it.
    async fn abortable<T>(&self, future: impl std::future::Future<Output = T>) -> Option<T> {
        tokio::select! {
            result = future => Some(result),
            _ = self.closed_signal() => None,
        }
    }

    async fn local_is_leader(&self) -> bool {
        match self.runtime.elector(&self.core.name) {
            Some(elector) => elector.is_leader().await,
            None => false,
        }
    }

    fn publish(&self, state: ReplicaState) {
        self.runtime
            .publisher
            .publish(&self.core.collection, self.core.replica_id, state);
    }

    /// Drive recovery to a terminal outcome.
    pub async fn run(self) -> RecoveryOutcome {
        tracing::info!(
            core = %self.core.name,
            after_startup = self.recovering_after_startup,
            "starting recovery"
        );
        let max_retries = self.runtime.tuning.max_retries;
        let mut tries = 0u32;

        loop {
            if self.is_closed() {
                tracing::info!(core = %self.core.name, "recovery closed, stopping");
                return RecoveryOutcome::AbortedClosing;
            }
            tries += 1;
            if tries > 1 && !self.wait_for_retry(tries).await {
                return RecoveryOutcome::AbortedClosing;
            }

            // CHECK_LEADER: the election may have gone our way while we were
            // down or sleeping. A leader must never recover.
            if self.local_is_leader().await {
                tracing::warn!(core = %self.core.name, "we are the leader, stopping recovery");
                self.publish(ReplicaState::Leader);
                return RecoveryOutcome::SkippedIsLeader;
            }

            let leader = match self
                .abortable(self.runtime.state_reader.get_leader_retry(
                    &self.core.collection,
                    &self.core.shard,
                    self.runtime.tuning.leader_resolve_timeout,
                ))
                .await
            {
                None => return RecoveryOutcome::AbortedClosing,
                Some(Ok(leader)) => leader,
                Some(Err(err)) => {
                    tracing::info!(core = %self.core.name, error = %err, "could not resolve leader, try={tries}");
                    if let Some(outcome) = self.account_failure(tries, max_retries) {
                        return outcome;
                    }
                    continue;
                }
            };

            if leader.name == self.core.name {
                // The projection believes we lead but the elector disagrees;
                // wait for the two views to settle.
                tracing::info!(core = %self.core.name, "cluster state says we are leader, repeating check");
                let _ = self.abortable(tokio::time::sleep(Duration::from_millis(50))).await;
                continue;
            }

            let attempt = if self.core.replica_type.uses_update_log() {
                self.sync_or_replicate(&leader, tries).await
            } else {
                self.replicate_only(&leader).await
            };

            match attempt {
                Attempt::Success => {
                    tracing::info!(core = %self.core.name, tries, "recovery successful");
                    return RecoveryOutcome::Recovered;
                }
                Attempt::IsLeader => {
                    tracing::warn!(core = %self.core.name, "became leader mid-recovery, stopping");
                    self.publish(ReplicaState::Leader);
                    return RecoveryOutcome::SkippedIsLeader;
                }
                Attempt::Aborted => return RecoveryOutcome::AbortedClosing,
                Attempt::Fatal => {
                    tracing::error!(
                        core = %self.core.name,
                        "protocol mismatch talking to leader, giving up"
                    );
                    if !self.is_closed() {
                        self.publish(ReplicaState::RecoveryFailed);
                    }
                    if let Some(listener) = &self.listener {
                        listener.failed();
                    }
                    return RecoveryOutcome::FailedMaxRetries;
                }
                Attempt::Failed => {
                    if self.is_closed() {
                        return RecoveryOutcome::AbortedClosing;
                    }
                    if let Some(outcome) = self.account_failure(tries, max_retries) {
                        return outcome;
                    }
                    tracing::info!(core = %self.core.name, "recovery failed, trying another loop, try={tries}");
                }
            }
        }
    }

    /// Returns the terminal outcome once the retry budget is spent.
    fn account_failure(&self, tries: u32, max_retries: u32) -> Option<RecoveryOutcome> {
        if tries < max_retries {
            return None;
        }
        tracing::error!(
            core = %self.core.name,
            tries,
            "recovery failed, max retries exceeded, giving up"
        );
        if !self.is_closed() {
            self.publish(ReplicaState::RecoveryFailed);
        }
        if let Some(listener) = &self.listener {
            listener.failed();
        }
        Some(RecoveryOutcome::FailedMaxRetries)
    }

    /// Backoff ladder: the first attempts retry fast, later ones back off to
    /// one second, then ten. Sleeps in one-second ticks so a close lands
    /// promptly.
    async fn wait_for_retry(&self, tries: u32) -> bool {
        let wait = if tries < 20 {
            self.runtime.tuning.starting_recovery_delay
        } else if tries < 40 {
            Duration::from_secs(1)
        } else {
            Duration::from_secs(10)
        };
        tracing::info!(
            core = %self.core.name,
            wait_ms = wait.as_millis() as u64,
            attempt = tries,
            "waiting before next recovery attempt"
        );
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if self.is_closed() {
                tracing::info!(core = %self.core.name, "recovery closed during retry wait");
                return false;
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return true;
            }
            let tick = (deadline - now).min(Duration::from_secs(1));
            let _ = timeout(tick, self.wake.notified()).await;
        }
    }

    /// NRT/TLOG path: delta sync first, full replication as the fallback,
    /// replay before anything is published.
    async fn sync_or_replicate(&self, leader: &Replica, tries: u32) -> Attempt {
        let Ok(ulog) = self.core.require_ulog() else {
            tracing::error!(core = %self.core.name, "no update log, cannot recover");
            return Attempt::Failed;
        };

        // Both log-carrying replica types start with a delta sync; only a
        // log with no usable anchor forces replication outright.
        let mut try_peer_sync = true;

        let mut sync_anchor = ulog.recent_versions(ulog.num_records_to_keep());
        let starting_versions = ulog.starting_versions();
        if self.recovering_after_startup {
            // We were down: what matters is what the log held when we went
            // down, not what has buffered since.
            sync_anchor = starting_versions.clone();
        }
        if ulog.exist_old_buffer_log() {
            // A buffer tlog survived from a replication recovery that never
            // drained; the log is not a trustworthy anchor.
            tracing::info!(
                core = %self.core.name,
                "previous replication recovery did not complete, skipping peer sync"
            );
            try_peer_sync = false;
        }
        if starting_versions.is_empty() {
            try_peer_sync = false;
        }

        if self.core.replica_type == ReplicaType::Tlog {
            self.core.stop_background_replication();
        }

        if self.local_is_leader().await {
            return Attempt::IsLeader;
        }

        self.publish(ReplicaState::Buffering);
        if ulog.state() != LogState::Buffering {
            if let Err(err) = ulog.buffer_updates() {
                tracing::error!(core = %self.core.name, error = ?err, "could not enter buffering");
                return Attempt::Failed;
            }
        }

        // The election outcome may have changed while we were publishing.
        if self.local_is_leader().await {
            return Attempt::IsLeader;
        }
        if self.is_closed() {
            return Attempt::Aborted;
        }

        // PREP: without the leader's acknowledgement of our buffering state
        // we do not fetch anything from it.
        match self.send_prep_recovery(leader).await {
            PrepOutcome::Closed => return Attempt::Aborted,
            PrepOutcome::Mismatch => return Attempt::Fatal,
            PrepOutcome::Refused => {
                tracing::info!(core = %self.core.name, "prep recovery unsuccessful");
                return Attempt::Failed;
            }
            PrepOutcome::Acknowledged => {}
        }

        let mut recovered = false;
        if try_peer_sync {
            tracing::info!(
                core = %self.core.name,
                leader = %leader.core_url(),
                "attempting peer sync"
            );
            let peer_sync = PeerSyncWithLeader::new(
                &self.core.name,
                &leader.core_url(),
                ulog.num_records_to_keep(),
                Arc::clone(&self.core.index),
                Arc::clone(&ulog),
                self.runtime.client.clone(),
                !self.runtime.tuning.disable_fingerprint,
            );
            match self.abortable(peer_sync.sync(&sync_anchor)).await {
                None => return Attempt::Aborted,
                Some(result) if result.is_success() => {
                    // Commit to force open a new searcher, then drain what
                    // buffered while we were syncing.
                    if let Err(err) = self.core.index.commit(true) {
                        tracing::error!(core = %self.core.name, error = ?err, "post-sync commit failed");
                    } else {
                        match self.replay().await {
                            None => return Attempt::Aborted,
                            Some(true) => recovered = true,
                            Some(false) => {}
                        }
                    }
                }
                Some(_) => {}
            }
            if !recovered {
                tracing::info!(core = %self.core.name, "peer sync unsuccessful, trying replication");
            }
        }

        if !recovered {
            // Re-enter buffering if replay already drained the buffer; a
            // stale buffer from the failed branch is dropped either way.
            if ulog.state() != LogState::Buffering {
                if let Err(err) = ulog.buffer_updates() {
                    tracing::error!(core = %self.core.name, error = ?err, "could not re-enter buffering");
                    return Attempt::Failed;
                }
            }
            let fetcher = IndexFetcher::new(
                self.runtime.client.clone(),
                self.runtime.tuning.fetch_idle_timeout,
            );
            if tries > 3 {
                tracing::info!(core = %self.core.name, tries, "repeated replication attempt");
            }
            let options = FetchOptions {
                skip_commit_on_leader_version_zero: self.core.replica_type == ReplicaType::Tlog,
                download_tlog: false,
            };
            let abort_handle = fetcher.abort_handle();
            let leader_core_url = leader.core_url();
            let result = tokio::select! {
                result = fetcher.fetch(&self.core, &leader_core_url, options) => result,
                _ = self.closed_signal() => {
                    abort_handle.store(true, Ordering::SeqCst);
                    return Attempt::Aborted;
                }
            };
            if !result.successful {
                tracing::error!(
                    core = %self.core.name,
                    message = %result.message,
                    "replication fetch reported as failed"
                );
                return Attempt::Failed;
            }
            tracing::info!(core = %self.core.name, "replication fetch reported as success");
            match self.replay().await {
                None => return Attempt::Aborted,
                Some(true) => recovered = true,
                Some(false) => return Attempt::Failed,
            }
        }

        if !recovered {
            return Attempt::Failed;
        }

        if self.is_closed() {
            return Attempt::Aborted;
        }
        if self.core.replica_type == ReplicaType::Tlog {
            self.core
                .start_background_replication(Arc::clone(&self.runtime));
        }
        self.publish(ReplicaState::Active);
        if let Some(listener) = &self.listener {
            listener.recovered();
        }
        Attempt::Success
    }

    /// PULL path: no log, no replay; stop background replication, fetch,
    /// restart it.
    async fn replicate_only(&self, leader: &Replica) -> Attempt {
        tracing::info!(
            core = %self.core.name,
            leader = %leader.name,
            "starting replicate-only recovery"
        );
        self.core.stop_background_replication();

        let fetcher = IndexFetcher::new(
            self.runtime.client.clone(),
            self.runtime.tuning.fetch_idle_timeout,
        );
        let abort_handle = fetcher.abort_handle();
        let leader_core_url = leader.core_url();
        let result = tokio::select! {
            result = fetcher.fetch(&self.core, &leader_core_url, FetchOptions::default()) => result,
            _ = self.closed_signal() => {
                abort_handle.store(true, Ordering::SeqCst);
                return Attempt::Aborted;
            }
        };
        if !result.successful {
            tracing::error!(
                core = %self.core.name,
                message = %result.message,
                "replication fetch reported as failed"
            );
            return Attempt::Failed;
        }

        if self.is_closed() {
            return Attempt::Aborted;
        }
        self.core
            .start_background_replication(Arc::clone(&self.runtime));
        self.publish(ReplicaState::Active);
        if let Some(listener) = &self.listener {
            listener.recovered();
        }
        Attempt::Success
    }

    /// Send prep-recovery to the leader's node.
    async fn send_prep_recovery(&self, leader: &Replica) -> PrepOutcome {
        // When the leader lives on this node, check its elector locally
        // before asking over the wire.
        if leader.node == self.runtime.node_name {
            if let Some(elector) = self.runtime.elector(&leader.name) {
                if !elector.is_leader().await {
                    tracing::warn!(
                        core = %self.core.name,
                        leader = %leader.name,
                        "local check says leader is not currently valid"
                    );
                    return PrepOutcome::Refused;
                }
            }
        }

        let params = PrepRecoveryParams {
            core_name: self.core.name.clone(),
            leader_name: leader.name.clone(),
            collection: self.core.collection.clone(),
        };
        tracing::info!(
            core = %self.core.name,
            leader_url = %leader.base_url,
            leader = %leader.name,
            "sending prep recovery command"
        );
        let call = self.runtime.client.prep_recovery(
            &leader.base_url,
            &params,
            self.runtime.tuning.prep_recovery_timeout,
        );
        match self.abortable(call).await {
            None => PrepOutcome::Closed,
            Some(Ok(true)) => PrepOutcome::Acknowledged,
            Some(Ok(false)) => PrepOutcome::Refused,
            Some(Err(ClientError::InvalidResponse(message))) => {
                tracing::error!(core = %self.core.name, %message, "prep recovery protocol mismatch");
                PrepOutcome::Mismatch
            }
            Some(Err(err)) => {
                tracing::info!(core = %self.core.name, error = %err, "prep recovery failed");
                PrepOutcome::Refused
            }
        }
    }

    /// Wait for buffered-update replay; failure is fatal to this attempt.
    /// `None` means closed.
    async fn replay(&self) -> Option<bool> {
        let Ok(ulog) = self.core.require_ulog() else {
            return Some(false);
        };
        tracing::info!(core = %self.core.name, "replaying buffered updates");
        let future = ulog.apply_buffered_updates(Arc::clone(&self.core.index));
        let report = tokio::select! {
            result = timeout(self.runtime.tuning.replay_timeout, future) => match result {
                Ok(Ok(report)) => report,
                Ok(Err(_)) => {
                    tracing::error!(core = %self.core.name, "replay task dropped");
                    return Some(false);
                }
                Err(_) => {
                    tracing::error!(core = %self.core.name, "replay timed out");
                    return Some(false);
                }
            },
            _ = self.closed_signal() => return None,
        };
        if report.failed {
            tracing::error!(core = %self.core.name, "replay failed");
            return Some(false);
        }
        tracing::info!(core = %self.core.name, replayed = report.count, "replay finished");
        Some(true)
    }
}
