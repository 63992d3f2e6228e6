//! Delta catch-up against the shard leader.
//!
//! If a follower is only a bounded number of updates behind, it fetches
//! exactly the missing updates instead of copying the whole index. Failure
//! here is not an error condition; the caller escalates to a full copy.

use std::collections::HashSet;
use std::sync::Arc;

use crate::fingerprint::{self, Fingerprint};
use crate::index::IndexCore;
use crate::leader_client::LeaderClient;
use crate::update_log::{LogEntry, UpdateLog, UpdatesSpec};

/// Outcome of one sync attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerSyncResult {
    Success,
    Failure,
}

impl PeerSyncResult {
    pub fn is_success(self) -> bool {
        matches!(self, PeerSyncResult::Success)
    }
}

/// What the missed-updates comparison concluded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MissedUpdates {
    AlreadyInSync,
    UnableToSync,
    Request { spec: UpdatesSpec, total: usize },
}

/// Sort signed versions by absolute value, largest first.
pub fn sort_abs_desc(versions: &mut [i64]) {
    versions.sort_by_key(|v| std::cmp::Reverse(v.unsigned_abs()));
}

/// Absolute value of the element `frac` of the way into an abs-descending
/// list. `frac = 0.8` picks a "plenty old" cutoff, `0.2` a "still recent"
/// one.
pub fn percentile(sorted_abs_desc: &[i64], frac: f32) -> i64 {
    debug_assert!(!sorted_abs_desc.is_empty());
    let idx = ((sorted_abs_desc.len() as f32 * frac) as usize).min(sorted_abs_desc.len() - 1);
    sorted_abs_desc[idx].abs()
}

/// Compares our version list against the leader's to decide what to fetch.
pub struct MissedUpdatesFinder {
    ours: HashSet<i64>,
    our_highest: i64,
    our_low_threshold: i64,
    n_updates: usize,
}

impl MissedUpdatesFinder {
    /// `our_updates` must be sorted by absolute value descending.
    pub fn new(our_updates: &[i64], n_updates: usize, our_low_threshold: i64) -> Self {
        Self {
            ours: our_updates.iter().copied().collect(),
            our_highest: our_updates.first().copied().unwrap_or(0),
            our_low_threshold,
            n_updates,
        }
    }

    pub fn find(&self, leader_versions: &mut Vec<i64>, can_handle_ranges: bool) -> MissedUpdates {
        if leader_versions.is_empty() {
            return MissedUpdates::UnableToSync;
        }
        sort_abs_desc(leader_versions);

        let leader_lowest = *leader_versions.last().expect("non-empty");
        if self.our_highest.abs() < leader_lowest.abs() {
            tracing::info!(
                our_highest = self.our_highest,
                leader_lowest,
                "our versions are too old compared to leader"
            );
            return MissedUpdates::UnableToSync;
        }
        // We may also be AHEAD of the leader (we were the old leader and hold
        // updates nobody else has). That is not detected here; the final
        // fingerprint comparison fails and the caller replicates.

        let complete_list = leader_versions.len() < self.n_updates;
        let missing: Vec<i64> = leader_versions
            .iter()
            .copied()
            .filter(|v| !self.ours.contains(v))
            .filter(|v| complete_list || v.abs() >= self.our_low_threshold)
            .collect();

        if missing.is_empty() {
            return MissedUpdates::AlreadyInSync;
        }
        if missing.len() > self.n_updates {
            tracing::info!(
                missing = missing.len(),
                window = self.n_updates,
                "too many missed updates for delta sync"
            );
            return MissedUpdates::UnableToSync;
        }

        let total = missing.len();
        let spec = if can_handle_ranges {
            UpdatesSpec::Ranges(to_ranges(leader_versions, &missing))
        } else {
            UpdatesSpec::Versions(missing)
        };
        MissedUpdates::Request { spec, total }
    }
}

/// Compress the missing versions into `[lo, hi)` absolute-value ranges.
///
/// A range may only span leader versions that are all missing from ours;
/// runs are broken wherever the leader's list holds a version we already
/// have, so the leader's answer for the ranges is exactly the missing set.
fn to_ranges(leader_versions_abs_desc: &[i64], missing: &[i64]) -> Vec<(u64, u64)> {
    let missing_set: HashSet<i64> = missing.iter().copied().collect();
    let mut ranges = Vec::new();
    let mut run: Option<(u64, u64)> = None;
    for version in leader_versions_abs_desc.iter().rev() {
        let abs = version.unsigned_abs();
        if missing_set.contains(version) {
            run = match run {
                None => Some((abs, abs + 1)),
                Some((lo, _)) => Some((lo, abs + 1)),
            };
        } else if let Some(done) = run.take() {
            ranges.push(done);
        }
    }
    if let Some(done) = run {
        ranges.push(done);
    }
    ranges
}

/// One follower's delta catch-up against its current leader.
pub struct PeerSyncWithLeader {
    core_name: String,
    leader_core_url: String,
    n_updates: usize,
    index: Arc<IndexCore>,
    ulog: Arc<UpdateLog>,
    client: LeaderClient,
    do_fingerprint: bool,
}

impl PeerSyncWithLeader {
    pub fn new(
        core_name: &str,
        leader_core_url: &str,
        n_updates: usize,
        index: Arc<IndexCore>,
        ulog: Arc<UpdateLog>,
        client: LeaderClient,
        do_fingerprint: bool,
    ) -> Self {
        Self {
            core_name: core_name.to_string(),
            leader_core_url: leader_core_url.to_string(),
            n_updates,
            index,
            ulog,
            client,
            do_fingerprint,
        }
    }

    /// Sync with the leader. `start_versions` are the versions present when
    /// this replica last went down; they anchor the overlap check.
    pub async fn sync(&self, start_versions: &[i64]) -> PeerSyncResult {
        let mut starting_versions = start_versions.to_vec();
        if starting_versions.is_empty() {
            tracing::warn!(
                core = %self.core_name,
                "no frame of reference to tell if we missed updates"
            );
            return PeerSyncResult::Failure;
        }

        tracing::info!(
            core = %self.core_name,
            leader = %self.leader_core_url,
            n_updates = self.n_updates,
            "peer sync start"
        );

        if self.do_fingerprint && self.already_in_sync().await {
            return PeerSyncResult::Success;
        }

        let mut our_updates = self.ulog.recent_versions(self.n_updates);
        let buffered_versions = self.ulog.buffered_versions();
        sort_abs_desc(&mut our_updates);
        sort_abs_desc(&mut starting_versions);

        let our_low_threshold = percentile(&starting_versions, 0.8);
        let our_high_threshold = percentile(&starting_versions, 0.2);
        tracing::debug!(
            core = %self.core_name,
            our_low_threshold,
            our_high_threshold,
            starting = starting_versions.len(),
            "peer sync thresholds"
        );

        // The starting updates must overlap what is now in our log; there are
        // no reorders, so any overlap will do.
        let smallest_new_update = our_updates
            .last()
            .map(|v| v.unsigned_abs())
            .unwrap_or_default();
        if starting_versions[0].unsigned_abs() < smallest_new_update {
            tracing::warn!(
                core = %self.core_name,
                "too many updates received since start, starting versions no longer overlap"
            );
            return PeerSyncResult::Failure;
        }

        for version in &starting_versions {
            if version.unsigned_abs() < smallest_new_update {
                our_updates.push(*version);
            }
        }

        let success = self
            .do_sync(&mut our_updates, our_low_threshold, &buffered_versions)
            .await;
        tracing::info!(core = %self.core_name, success, "peer sync done");
        if success {
            PeerSyncResult::Success
        } else {
            PeerSyncResult::Failure
        }
    }

    async fn do_sync(
        &self,
        our_updates: &mut Vec<i64>,
        our_low_threshold: i64,
        buffered_versions: &[i64],
    ) -> bool {
        // Fetching the leader's versions after reading our buffer guarantees
        // the leader's list is a superset of our buffered updates.
        let leader = match self
            .client
            .get_versions(&self.leader_core_url, self.n_updates, self.do_fingerprint)
            .await
        {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!(core = %self.core_name, error = %err, "get versions from leader failed");
                return false;
            }
        };
        let leader_fingerprint = leader.fingerprint;
        if self.do_fingerprint && leader_fingerprint.is_none() {
            tracing::warn!(core = %self.core_name, "leader did not return a fingerprint");
            return false;
        }

        sort_abs_desc(our_updates);
        let finder = MissedUpdatesFinder::new(our_updates, self.n_updates, our_low_threshold);
        let mut leader_versions = leader.versions;
        let missed = finder.find(&mut leader_versions, true);

        match missed {
            MissedUpdates::AlreadyInSync => true,
            MissedUpdates::UnableToSync => false,
            MissedUpdates::Request { spec, total } => {
                let updates = match self.client.get_updates(&self.leader_core_url, &spec).await {
                    Ok(updates) => updates,
                    Err(err) => {
                        tracing::warn!(core = %self.core_name, error = %err, "get missed updates failed");
                        return false;
                    }
                };
                if !self
                    .handle_updates(updates, total, leader_fingerprint.as_ref(), buffered_versions)
                {
                    return false;
                }
                match leader_fingerprint {
                    Some(fp) if self.do_fingerprint => self.compare_fingerprint(&fp),
                    _ => true,
                }
            }
        }
    }

    fn handle_updates(
        &self,
        mut updates: Vec<LogEntry>,
        num_requested: usize,
        leader_fingerprint: Option<&Fingerprint>,
        buffered_versions: &[i64],
    ) -> bool {
        if updates.len() < num_requested {
            tracing::warn!(
                core = %self.core_name,
                requested = num_requested,
                received = updates.len(),
                "leader returned fewer updates than requested"
            );
            return false;
        }

        // The leader's response does not include our own buffered updates;
        // merging them in is what makes the post-apply fingerprint match.
        updates.extend(self.ulog.lookup_buffered(buffered_versions));

        // The leader computes its fingerprint before it snapshots its recent
        // versions, so the gap between maxVersionEncountered and the version
        // list may hold updates that are not in its index yet. Adds in the
        // gap can be dropped (they will arrive again); a delete in the gap
        // forces us to apply everything.
        if let Some(fp) = leader_fingerprint {
            let delete_in_gap = updates
                .iter()
                .any(|e| e.version.abs() > fp.max_version_encountered && e.is_delete());
            if !delete_in_gap {
                updates.retain(|e| e.version.abs() <= fp.max_version_encountered);
            }
        }

        updates.sort_by_key(|entry| entry.version.unsigned_abs());
        for entry in &updates {
            self.index.apply(entry);
            if let Err(err) = self.ulog.append_synced(entry.clone()) {
                tracing::error!(core = %self.core_name, error = ?err, "could not log synced update");
                return false;
            }
        }
        if let Err(err) = self.index.commit(false) {
            tracing::error!(core = %self.core_name, error = ?err, "could not apply synced updates");
            return false;
        }
        true
    }

    async fn already_in_sync(&self) -> bool {
        match self
            .client
            .get_fingerprint(&self.leader_core_url, i64::MAX)
            .await
        {
            Ok(leader_fp) => self.compare_fingerprint(&leader_fp),
            Err(err) => {
                tracing::warn!(core = %self.core_name, error = %err, "fingerprint probe failed");
                false
            }
        }
    }

    fn compare_fingerprint(&self, leader_fingerprint: &Fingerprint) -> bool {
        let ours = fingerprint::compute(&self.index, i64::MAX);
        let equal = fingerprint::equal(leader_fingerprint, &ours);
        if !equal {
            tracing::debug!(
                core = %self.core_name,
                leader = ?leader_fingerprint,
                ours = ?ours,
                "fingerprint mismatch"
            );
        }
        equal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentile_picks_old_and_recent_cutoffs() {
        let versions = vec![100, 99, 98, 97, 96, 95, 94, 93, 92, 91];
        assert_eq!(percentile(&versions, 0.8), 92);
        assert_eq!(percentile(&versions, 0.2), 98);
        assert_eq!(percentile(&[42], 0.8), 42);
    }

    #[test]
    fn finder_requests_exactly_the_missing_versions() {
        let mut ours = vec![100, 99, 98, 97];
        sort_abs_desc(&mut ours);
        let finder = MissedUpdatesFinder::new(&ours, 100, 97);
        let mut leader = vec![103, 102, 101, 100, 99, 98, 97];
        match finder.find(&mut leader, false) {
            MissedUpdates::Request { spec, total } => {
                assert_eq!(total, 3);
                assert_eq!(spec, UpdatesSpec::Versions(vec![103, 102, 101]));
            }
            other => panic!("expected a request, got {other:?}"),
        }
    }

    #[test]
    fn finder_compresses_contiguous_missing_versions_into_ranges() {
        let ours = vec![100, 98];
        let finder = MissedUpdatesFinder::new(&ours, 100, 0);
        let mut leader = vec![103, 102, 101, 100, 99, 98];
        match finder.find(&mut leader, true) {
            MissedUpdates::Request { spec, total } => {
                assert_eq!(total, 4);
                assert_eq!(spec, UpdatesSpec::Ranges(vec![(99, 100), (101, 104)]));
            }
            other => panic!("expected a request, got {other:?}"),
        }
    }

    #[test]
    fn finder_reports_in_sync_when_leader_is_covered() {
        let ours = vec![103, 102, 101, 100];
        let finder = MissedUpdatesFinder::new(&ours, 100, 100);
        let mut leader = vec![103, 102, 101];
        assert_eq!(finder.find(&mut leader, true), MissedUpdates::AlreadyInSync);
    }

    #[test]
    fn finder_refuses_when_leader_window_moved_past_us() {
        let ours = vec![50, 49, 48];
        let finder = MissedUpdatesFinder::new(&ours, 100, 48);
        let mut leader = vec![250, 249, 201];
        assert_eq!(finder.find(&mut leader, true), MissedUpdates::UnableToSync);
    }

    #[test]
    fn finder_refuses_oversized_missing_sets() {
        let ours = vec![10];
        let finder = MissedUpdatesFinder::new(&ours, 2, 0);
        let mut leader = vec![13, 12, 11, 10];
        assert_eq!(finder.find(&mut leader, true), MissedUpdates::UnableToSync);
    }

    #[test]
    fn deletes_keep_their_sign_through_comparison() {
        let ours = vec![100, -99, 98];
        let finder = MissedUpdatesFinder::new(&ours, 100, 98);
        let mut leader = vec![101, 100, -99, 98];
        match finder.find(&mut leader, false) {
            MissedUpdates::Request { spec, total } => {
                assert_eq!(total, 1);
                assert_eq!(spec, UpdatesSpec::Versions(vec![101]));
            }
            other => panic!("expected a request, got {other:?}"),
        }
    }
}
