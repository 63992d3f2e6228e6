//! Recovery tunables with environment overrides.

use std::env;
use std::str::FromStr;
use std::time::Duration;

const MAX_RETRIES: u32 = 500;
const STARTING_RECOVERY_DELAY_MS: u64 = 100;
const PREP_RECOVERY_TIMEOUT_MS: u64 = 8_000;
const LEADER_RESOLVE_TIMEOUT_MS: u64 = 8_000;
const REPLAY_TIMEOUT_MS: u64 = 600_000;
const FETCH_IDLE_TIMEOUT_MS: u64 = 60_000;
const PEER_SYNC_WINDOW: usize = 100;
const BACKGROUND_REPL_INTERVAL_MS: u64 = 3_000;

/// Knobs for a node's recovery machinery. Every value can be overridden via
/// a `STRATA_*` environment variable.
#[derive(Debug, Clone, Copy)]
pub struct RecoveryTuning {
    /// Give up and publish RECOVERY_FAILED after this many attempts.
    pub max_retries: u32,
    /// Backoff for the first twenty attempts.
    pub starting_recovery_delay: Duration,
    /// Follower-side timeout on the prep-recovery call.
    pub prep_recovery_timeout: Duration,
    /// How long to wait for a leader to appear in the cluster projection.
    pub leader_resolve_timeout: Duration,
    /// Upper bound on waiting for buffered-update replay to finish.
    pub replay_timeout: Duration,
    /// Idle timeout for full-fetch HTTP calls.
    pub fetch_idle_timeout: Duration,
    /// PeerSync window: how many recent versions each side exchanges.
    pub peer_sync_window: usize,
    /// Poll interval for background replication on TLOG/PULL replicas.
    pub background_repl_interval: Duration,
    /// Disable fingerprint verification (testing escape hatch).
    pub disable_fingerprint: bool,
}

impl Default for RecoveryTuning {
    fn default() -> Self {
        Self {
            max_retries: read_env("STRATA_RECOVERY_MAX_RETRIES", MAX_RETRIES),
            starting_recovery_delay: Duration::from_millis(read_env(
                "STRATA_RECOVERY_STARTING_DELAY_MS",
                STARTING_RECOVERY_DELAY_MS,
            )),
            prep_recovery_timeout: Duration::from_millis(read_env(
                "STRATA_PREP_RECOVERY_TIMEOUT_MS",
                PREP_RECOVERY_TIMEOUT_MS,
            )),
            leader_resolve_timeout: Duration::from_millis(read_env(
                "STRATA_LEADER_RESOLVE_TIMEOUT_MS",
                LEADER_RESOLVE_TIMEOUT_MS,
            )),
            replay_timeout: Duration::from_millis(read_env(
                "STRATA_REPLAY_TIMEOUT_MS",
                REPLAY_TIMEOUT_MS,
            )),
            fetch_idle_timeout: Duration::from_millis(read_env(
                "STRATA_FETCH_IDLE_TIMEOUT_MS",
                FETCH_IDLE_TIMEOUT_MS,
            )),
            peer_sync_window: read_env("STRATA_PEER_SYNC_WINDOW", PEER_SYNC_WINDOW),
            background_repl_interval: Duration::from_millis(read_env(
                "STRATA_BACKGROUND_REPL_INTERVAL_MS",
                BACKGROUND_REPL_INTERVAL_MS,
            )),
            disable_fingerprint: read_env_bool("STRATA_DISABLE_FINGERPRINT", false),
        }
    }
}

fn read_env<T: FromStr + Copy>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| T::from_str(&v).ok())
        .unwrap_or(default)
}

fn read_env_bool(name: &str, default: bool) -> bool {
    env::var(name)
        .ok()
        .map(|v| {
            matches!(
                v.to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "y" | "on"
            )
        })
        .unwrap_or(default)
}
