//! The coordination-store contract and its failure taxonomy.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;

/// Session lifecycle as observed by clients.
///
/// On `Expired` every ephemeral node created by this session is gone and
/// every registered watch is invalid; higher layers must tear down anything
/// derived from the session (locks, leadership) and rebuild.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Connected,
    Expired,
}

/// Failure taxonomy for coordination-store calls.
///
/// `NoNode` is expected in several control paths and callers match on it;
/// `ConnectionLoss` is the only retryable kind.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CoordError {
    #[error("no node at {0}")]
    NoNode(String),
    #[error("node already exists at {0}")]
    NodeExists(String),
    #[error("version mismatch at {path}: expected {expected}, actual {actual}")]
    VersionMismatch {
        path: String,
        expected: i64,
        actual: i64,
    },
    #[error("session expired")]
    SessionExpired,
    #[error("connection loss")]
    ConnectionLoss,
}

impl CoordError {
    /// Transient errors may be retried with backoff; everything else is
    /// surfaced to the caller.
    pub fn is_transient(&self) -> bool {
        matches!(self, CoordError::ConnectionLoss)
    }
}

/// Node creation modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    Persistent,
    /// Removed automatically when the creating session expires.
    Ephemeral,
    /// Ephemeral with a monotonically increasing suffix assigned by the
    /// store; used for ordered election queues.
    EphemeralSequential,
}

/// What a fired watch observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchKind {
    DataChanged,
    Deleted,
    ChildrenChanged,
}

/// A single watch firing. Watches are fire-once: the callback runs at most
/// one time and must be re-registered to observe further changes.
#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub path: String,
    pub kind: WatchKind,
}

pub type WatchCallback = Box<dyn Fn(WatchEvent) + Send + Sync>;

/// Versioned get/set/watch/ephemeral over a hierarchical key space.
///
/// All paths are absolute, `/`-separated. Versions start at 0 on create and
/// increase by one per data write.
#[async_trait]
pub trait CoordStore: Send + Sync {
    /// Read a node's data and current version.
    async fn get(&self, path: &str) -> Result<(Vec<u8>, i64), CoordError>;

    /// Compare-and-set write. `expected_version` of `None` writes
    /// unconditionally; otherwise the write fails with `VersionMismatch`
    /// when the node has moved on. Returns the new version.
    async fn set_data(
        &self,
        path: &str,
        data: Vec<u8>,
        expected_version: Option<i64>,
    ) -> Result<i64, CoordError>;

    /// Create a node. For `EphemeralSequential` the returned path carries
    /// the store-assigned suffix.
    async fn create(
        &self,
        path: &str,
        data: Vec<u8>,
        mode: CreateMode,
    ) -> Result<String, CoordError>;

    async fn delete(&self, path: &str) -> Result<(), CoordError>;

    /// Version of the node if it exists.
    async fn exists(&self, path: &str) -> Result<Option<i64>, CoordError>;

    /// Child names (not full paths), unordered.
    async fn children(&self, path: &str) -> Result<Vec<String>, CoordError>;

    /// Register a fire-once data watch. The callback fires on the next data
    /// change or delete of `path`, then is discarded.
    async fn watch(&self, path: &str, callback: WatchCallback) -> Result<(), CoordError>;

    /// Register a fire-once child watch on `path`.
    async fn watch_children(&self, path: &str, callback: WatchCallback) -> Result<(), CoordError>;

    /// Subscribe to session lifecycle transitions.
    fn session(&self) -> tokio::sync::watch::Receiver<SessionState>;
}

/// Exponential backoff for transient coordination-store failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base: Duration,
    pub ceiling: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(50),
            ceiling: Duration::from_secs(5),
            max_attempts: 8,
        }
    }
}

impl RetryPolicy {
    /// Run `op`, retrying transient failures with exponential backoff and
    /// jitter. Non-transient failures are returned immediately.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T, CoordError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CoordError>>,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt + 1 < self.max_attempts => {
                    let backoff = self.delay(attempt);
                    tracing::debug!(attempt, backoff_ms = backoff.as_millis() as u64,
                        "transient coordination-store failure, retrying");
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn delay(&self, attempt: u32) -> Duration {
        let exp = self.base.saturating_mul(1u32 << attempt.min(16));
        let capped = exp.min(self.ceiling);
        // Full jitter keeps concurrent retriers from synchronizing.
        let micros = capped.as_micros().max(1) as u64;
        Duration::from_micros(rand::thread_rng().gen_range(micros / 2..=micros))
    }
}
