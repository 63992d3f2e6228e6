//! Full-index replication from the leader.
//!
//! Used when delta sync cannot close the gap: commit on the leader to
//! stabilize its view, diff file lists, download what we lack into a staging
//! directory, then atomically swap the staged index into place. A restarted
//! fetch resumes from the staging directory instead of re-downloading files
//! that already verified.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use crate::core::ReplicaCore;
use crate::leader_client::LeaderClient;

const STAGING_DIR: &str = "index.staging";
const FETCHED_TLOG_DIR: &str = "tlog.fetched";

/// Outcome of one fetch. Failures are data, not errors; the recovery loop
/// decides whether to retry.
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub successful: bool,
    pub message: String,
}

impl FetchResult {
    fn success(message: impl Into<String>) -> Self {
        Self {
            successful: true,
            message: message.into(),
        }
    }

    fn failure(message: impl Into<String>) -> Self {
        Self {
            successful: false,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FetchOptions {
    /// Advisory: when the leader's index generation is zero there is nothing
    /// to copy; skip instead of installing an empty index. Set for TLOG
    /// replicas.
    pub skip_commit_on_leader_version_zero: bool,
    /// Also copy the leader's transaction log segments, so a later leader
    /// failover cannot lose documents that never reached a segment. The copy
    /// lands beside the index and is not spliced into the live log.
    pub download_tlog: bool,
}

/// Streams a consistent index snapshot from the leader.
pub struct IndexFetcher {
    client: LeaderClient,
    idle_timeout: Duration,
    abort: Arc<AtomicBool>,
}

impl IndexFetcher {
    pub fn new(client: LeaderClient, idle_timeout: Duration) -> Self {
        Self {
            client,
            idle_timeout,
            abort: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Handle for aborting an in-flight fetch from another task.
    pub fn abort_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.abort)
    }

    pub fn abort_fetch(&self) {
        self.abort.store(true, Ordering::SeqCst);
    }

    fn aborted(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }

    /// Fetch the leader's index into `core`. On success the core's index is
    /// byte-equivalent to the leader's at commit time.
    pub async fn fetch(
        &self,
        core: &ReplicaCore,
        leader_core_url: &str,
        options: FetchOptions,
    ) -> FetchResult {
        match self.try_fetch(core, leader_core_url, options).await {
            Ok(result) => result,
            Err(err) => {
                tracing::error!(core = %core.name, error = ?err, "replication fetch failed");
                FetchResult::failure(format!("{err:#}"))
            }
        }
    }

    async fn try_fetch(
        &self,
        core: &ReplicaCore,
        leader_core_url: &str,
        options: FetchOptions,
    ) -> anyhow::Result<FetchResult> {
        tracing::info!(core = %core.name, leader = %leader_core_url, "replication fetch start");

        // An empty commit pins the leader's current view so the file list
        // stays consistent for the duration of the download.
        self.client
            .commit(leader_core_url)
            .await
            .context("commit on leader")?;

        let listing = self
            .client
            .file_list(leader_core_url, options.download_tlog)
            .await
            .context("fetch leader file list")?;

        if listing.generation == 0 && options.skip_commit_on_leader_version_zero {
            return Ok(FetchResult::success("leader index empty, nothing to fetch"));
        }

        let staging = self.staging_dir(core);
        fs::create_dir_all(&staging).context("create staging dir")?;

        let mut downloaded = 0usize;
        let mut reused = 0usize;
        for meta in &listing.files {
            if self.aborted() {
                return Ok(FetchResult::failure("fetch aborted"));
            }
            let target = staging.join(&meta.name);
            if file_matches(&target, meta.size, meta.checksum) {
                reused += 1;
                continue;
            }
            let bytes = self
                .client
                .file_content(leader_core_url, &meta.name, false, self.idle_timeout)
                .await
                .with_context(|| format!("download {}", meta.name))?;
            anyhow::ensure!(
                bytes.len() as u64 == meta.size && crc32fast::hash(&bytes) == meta.checksum,
                "downloaded file {} does not match leader metadata",
                meta.name
            );
            fs::write(&target, &bytes).with_context(|| format!("stage {}", meta.name))?;
            downloaded += 1;
        }

        if self.aborted() {
            return Ok(FetchResult::failure("fetch aborted"));
        }

        if options.download_tlog && !listing.tlog_files.is_empty() {
            self.fetch_tlog(core, leader_core_url, &listing.tlog_files)
                .await?;
        }

        // Quiesce the writer while the new index goes in.
        {
            let _core_state = core.core_state.lock().await;
            core.index
                .swap_in(&staging)
                .context("swap staged index into place")?;
        }
        let _ = fs::remove_dir_all(&staging);

        tracing::info!(
            core = %core.name,
            generation = listing.generation,
            downloaded,
            reused,
            "replication fetch complete"
        );
        Ok(FetchResult::success(format!(
            "fetched generation {} ({downloaded} files, {reused} reused)",
            listing.generation
        )))
    }

    /// Copy the leader's tlog segments into `tlog.fetched/`. Kept out of
    /// the live log directory; replay after a failover decides what to do
    /// with them.
    async fn fetch_tlog(
        &self,
        core: &ReplicaCore,
        leader_core_url: &str,
        files: &[crate::index::FileMeta],
    ) -> anyhow::Result<()> {
        let dir = core.data_dir.join(FETCHED_TLOG_DIR);
        fs::create_dir_all(&dir).context("create fetched tlog dir")?;
        for meta in files {
            let target = dir.join(&meta.name);
            if file_matches(&target, meta.size, meta.checksum) {
                continue;
            }
            let bytes = self
                .client
                .file_content(leader_core_url, &meta.name, true, self.idle_timeout)
                .await
                .with_context(|| format!("download tlog {}", meta.name))?;
            fs::write(&target, &bytes).with_context(|| format!("stage tlog {}", meta.name))?;
        }
        Ok(())
    }

    fn staging_dir(&self, core: &ReplicaCore) -> PathBuf {
        core.data_dir.join(STAGING_DIR)
    }
}

fn file_matches(path: &Path, size: u64, checksum: u32) -> bool {
    match fs::read(path) {
        Ok(data) => data.len() as u64 == size && crc32fast::hash(&data) == checksum,
        Err(_) => false,
    }
}
