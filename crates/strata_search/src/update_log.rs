//! Recovery-aware transaction log.
//!
//! Appends are normally applied and logged (`APPLYING`). During recovery the
//! log is switched to `BUFFERING`: incoming updates land in a side buffer
//! and the main window is left untouched until `apply_buffered_updates`
//! drains the buffer into the index (`REPLAYING`) and the log returns to
//! `APPLYING`.
//!
//! Records are length+crc32 framed on disk; a truncated tail is tolerated on
//! open.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tokio::sync::oneshot;

use crate::index::IndexCore;

pub const OP_ADD: u8 = 0;
pub const OP_DELETE: u8 = 1;
pub const OP_DELETE_BY_QUERY: u8 = 2;

const MAIN_LOG_FILE: &str = "tlog_0000000000";
const BUFFER_DIR: &str = "buffer";
const BUFFER_LOG_FILE: &str = "buffer.tlog";

/// One logged update. On the wire and on disk this is the triple
/// `[op, version, payload]`; the version's sign bit distinguishes deletes
/// from adds, the op word additionally marks deletes-by-query.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub op: u8,
    pub version: i64,
    pub payload: serde_json::Value,
}

impl LogEntry {
    pub fn add(version: i64, payload: serde_json::Value) -> Self {
        debug_assert!(version > 0, "add versions are positive");
        Self {
            op: OP_ADD,
            version,
            payload,
        }
    }

    pub fn delete(version: i64, id: &str) -> Self {
        debug_assert!(version < 0, "delete versions carry the sign bit");
        Self {
            op: OP_DELETE,
            version,
            payload: serde_json::Value::String(id.to_string()),
        }
    }

    pub fn delete_by_query(version: i64, query: &str) -> Self {
        debug_assert!(version < 0, "delete versions carry the sign bit");
        Self {
            op: OP_DELETE_BY_QUERY,
            version,
            payload: serde_json::Value::String(query.to_string()),
        }
    }

    /// Document id this entry addresses, when it addresses one.
    pub fn doc_id(&self) -> Option<String> {
        match self.op {
            OP_ADD => self
                .payload
                .get("id")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            OP_DELETE => self.payload.as_str().map(str::to_string),
            _ => None,
        }
    }

    pub fn is_delete(&self) -> bool {
        matches!(self.op, OP_DELETE | OP_DELETE_BY_QUERY)
    }
}

impl Serialize for LogEntry {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        (self.op, self.version, &self.payload).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for LogEntry {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let (op, version, payload): (u8, i64, serde_json::Value) =
            Deserialize::deserialize(deserializer)?;
        if op > OP_DELETE_BY_QUERY {
            return Err(D::Error::custom(format!("unknown log op {op}")));
        }
        Ok(Self {
            op,
            version,
            payload,
        })
    }
}

/// What a caller may ask `get_updates` for: explicit signed versions, or
/// half-open `[lo, hi)` ranges by absolute value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdatesSpec {
    Versions(Vec<i64>),
    Ranges(Vec<(u64, u64)>),
}

impl UpdatesSpec {
    /// Wire encoding: `v1,v2,...` for versions, `lo..hi,lo..hi` for ranges.
    pub fn to_param(&self) -> String {
        match self {
            UpdatesSpec::Versions(versions) => versions
                .iter()
                .map(|v| v.to_string())
                .collect::<Vec<_>>()
                .join(","),
            UpdatesSpec::Ranges(ranges) => ranges
                .iter()
                .map(|(lo, hi)| format!("{lo}..{hi}"))
                .collect::<Vec<_>>()
                .join(","),
        }
    }

    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        if raw.trim().is_empty() {
            anyhow::bail!("empty updates spec");
        }
        if raw.contains("..") {
            let mut ranges = Vec::new();
            for part in raw.split(',') {
                let (lo, hi) = part
                    .split_once("..")
                    .with_context(|| format!("malformed range {part:?}"))?;
                ranges.push((
                    lo.parse().with_context(|| format!("range lo {lo:?}"))?,
                    hi.parse().with_context(|| format!("range hi {hi:?}"))?,
                ));
            }
            Ok(UpdatesSpec::Ranges(ranges))
        } else {
            let mut versions = Vec::new();
            for part in raw.split(',') {
                versions.push(part.parse().with_context(|| format!("version {part:?}"))?);
            }
            Ok(UpdatesSpec::Versions(versions))
        }
    }

    /// How many updates this spec asks for, given the window it was built
    /// against is dense over the ranges.
    pub fn requested_count(&self) -> usize {
        match self {
            UpdatesSpec::Versions(versions) => versions.len(),
            UpdatesSpec::Ranges(ranges) => ranges
                .iter()
                .map(|(lo, hi)| (hi.saturating_sub(*lo)) as usize)
                .sum(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogState {
    Applying,
    Buffering,
    Replaying,
}

/// Outcome of draining the buffer.
#[derive(Debug, Clone, Copy)]
pub struct ReplayReport {
    pub failed: bool,
    pub count: usize,
}

struct LogInner {
    state: LogState,
    main_file: File,
    /// Recent window keyed by absolute version, newest retained.
    window: BTreeMap<u64, LogEntry>,
    buffer: Option<BufferLog>,
}

struct BufferLog {
    file: File,
    entries: Vec<LogEntry>,
}

/// The per-replica update log.
pub struct UpdateLog {
    dir: PathBuf,
    inner: Mutex<LogInner>,
    starting_versions: Vec<i64>,
    old_buffer_on_open: bool,
    num_records_to_keep: usize,
}

impl UpdateLog {
    /// Open the log under `dir` (the replica's `tlog/` directory), loading
    /// the recent-versions window and taking the starting-versions snapshot.
    pub fn open(dir: impl AsRef<Path>, num_records_to_keep: usize) -> anyhow::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).context("create tlog dir")?;
        let main_path = dir.join(MAIN_LOG_FILE);
        let entries = read_log_entries(&main_path)?;
        let mut window = BTreeMap::new();
        for entry in entries {
            window.insert(entry.version.unsigned_abs(), entry);
        }
        trim_window(&mut window, num_records_to_keep);

        let starting_versions: Vec<i64> = window.values().rev().map(|e| e.version).collect();

        let buffer_path = dir.join(BUFFER_DIR).join(BUFFER_LOG_FILE);
        let old_buffer_on_open = buffer_path.exists();

        let main_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&main_path)
            .context("open tlog for append")?;

        Ok(Self {
            dir,
            inner: Mutex::new(LogInner {
                state: LogState::Applying,
                main_file,
                window,
                buffer: None,
            }),
            starting_versions,
            old_buffer_on_open,
            num_records_to_keep,
        })
    }

    pub fn state(&self) -> LogState {
        self.inner.lock().unwrap().state
    }

    pub fn num_records_to_keep(&self) -> usize {
        self.num_records_to_keep
    }

    /// Versions present when the process started, newest first. The anchor
    /// for "what happened while I was down".
    pub fn starting_versions(&self) -> Vec<i64> {
        self.starting_versions.clone()
    }

    /// True iff a previous process died while buffering and never drained.
    pub fn exist_old_buffer_log(&self) -> bool {
        self.old_buffer_on_open
    }

    /// Metadata of the main log segments, for replication. The buffer tlog
    /// is never served.
    pub fn log_files(&self) -> anyhow::Result<Vec<crate::index::FileMeta>> {
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.dir).context("list tlog dir")? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            let data = fs::read(entry.path()).with_context(|| format!("read tlog {name}"))?;
            files.push(crate::index::FileMeta {
                name,
                size: data.len() as u64,
                checksum: crc32fast::hash(&data),
            });
        }
        files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(files)
    }

    pub fn read_log_file(&self, name: &str) -> anyhow::Result<Vec<u8>> {
        anyhow::ensure!(
            !name.contains('/') && !name.contains(".."),
            "invalid tlog file name {name:?}"
        );
        fs::read(self.dir.join(name)).with_context(|| format!("read tlog file {name}"))
    }

    /// Append one update. While buffering (or replaying) the update goes to
    /// the side buffer and the main window is untouched.
    pub fn append_update(&self, entry: LogEntry) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            LogState::Applying => append_to_main(&mut inner, entry, self.num_records_to_keep),
            LogState::Buffering | LogState::Replaying => {
                let buffer = inner
                    .buffer
                    .as_mut()
                    .context("buffering with no buffer log")?;
                let payload = serde_json::to_vec(&entry).context("serialize buffered entry")?;
                write_record(&mut buffer.file, &payload)?;
                buffer.file.flush()?;
                buffer.entries.push(entry);
                Ok(())
            }
        }
    }

    /// Append an update fetched from the leader (peer sync, replay). These
    /// bypass buffering: they land in the main log and window regardless of
    /// mode.
    pub fn append_synced(&self, entry: LogEntry) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        append_to_main(&mut inner, entry, self.num_records_to_keep)
    }

    /// Up to `n` newest versions, sorted by absolute value descending.
    pub fn recent_versions(&self, n: usize) -> Vec<i64> {
        let inner = self.inner.lock().unwrap();
        inner
            .window
            .values()
            .rev()
            .take(n)
            .map(|entry| entry.version)
            .collect()
    }

    /// Signed versions currently sitting in the buffer.
    pub fn buffered_versions(&self) -> Vec<i64> {
        let inner = self.inner.lock().unwrap();
        inner
            .buffer
            .as_ref()
            .map(|buffer| buffer.entries.iter().map(|e| e.version).collect())
            .unwrap_or_default()
    }

    /// Materialize buffered entries for the given signed versions.
    pub fn lookup_buffered(&self, versions: &[i64]) -> Vec<LogEntry> {
        let inner = self.inner.lock().unwrap();
        let Some(buffer) = inner.buffer.as_ref() else {
            return Vec::new();
        };
        versions
            .iter()
            .filter_map(|v| buffer.entries.iter().rev().find(|e| e.version == *v))
            .cloned()
            .collect()
    }

    /// Materialize updates from the main window for a spec, sorted by
    /// absolute version ascending. Requested versions absent from the window
    /// are silently omitted; the caller compares counts.
    pub fn get_updates(&self, spec: &UpdatesSpec) -> Vec<LogEntry> {
        let inner = self.inner.lock().unwrap();
        let mut out: Vec<LogEntry> = match spec {
            UpdatesSpec::Versions(versions) => versions
                .iter()
                .filter_map(|v| inner.window.get(&v.unsigned_abs()))
                .cloned()
                .collect(),
            UpdatesSpec::Ranges(ranges) => ranges
                .iter()
                .flat_map(|(lo, hi)| inner.window.range(*lo..*hi).map(|(_, e)| e.clone()))
                .collect(),
        };
        out.sort_by_key(|entry| entry.version.unsigned_abs());
        out
    }

    /// Enter buffering mode. Idempotent: calling while already buffering
    /// drops the prior buffer.
    pub fn buffer_updates(&self) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let buffer_dir = self.dir.join(BUFFER_DIR);
        fs::create_dir_all(&buffer_dir).context("create buffer dir")?;
        let path = buffer_dir.join(BUFFER_LOG_FILE);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .context("open buffer tlog")?;
        inner.buffer = Some(BufferLog {
            file,
            entries: Vec::new(),
        });
        inner.state = LogState::Buffering;
        tracing::debug!(dir = %self.dir.display(), "update log entered buffering");
        Ok(())
    }

    /// Drain the buffer into the index. Returns a future completing with the
    /// replay report; when it completes the log is back in `APPLYING` and a
    /// fresh realtime searcher is open on success.
    ///
    /// Calling outside buffering mode completes immediately with a clean
    /// report (no replay needed).
    pub fn apply_buffered_updates(
        self: &Arc<Self>,
        index: Arc<IndexCore>,
    ) -> oneshot::Receiver<ReplayReport> {
        let (tx, rx) = oneshot::channel();
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.state != LogState::Buffering {
                let _ = tx.send(ReplayReport {
                    failed: false,
                    count: 0,
                });
                return rx;
            }
            inner.state = LogState::Replaying;
        }
        let log = Arc::clone(self);
        tokio::task::spawn_blocking(move || {
            let report = log.drain_buffer(&index);
            let _ = tx.send(report);
        });
        rx
    }

    fn drain_buffer(&self, index: &IndexCore) -> ReplayReport {
        let mut count = 0usize;
        loop {
            // Appends arriving mid-replay keep landing in the buffer; drain
            // until it runs dry.
            let batch: Vec<LogEntry> = {
                let mut inner = self.inner.lock().unwrap();
                match inner.buffer.as_mut() {
                    Some(buffer) if !buffer.entries.is_empty() => {
                        std::mem::take(&mut buffer.entries)
                    }
                    _ => break,
                }
            };
            for entry in batch {
                index.apply(&entry);
                if let Err(err) = self.append_synced(entry) {
                    tracing::error!(error = ?err, "replay append failed");
                    self.finish_replay();
                    return ReplayReport {
                        failed: true,
                        count,
                    };
                }
                count += 1;
            }
            if let Err(err) = index.commit(false) {
                tracing::error!(error = ?err, "replay commit failed");
                self.finish_replay();
                return ReplayReport {
                    failed: true,
                    count,
                };
            }
        }
        self.finish_replay();
        index.open_realtime_searcher();
        tracing::info!(replayed = count, "buffered updates replayed");
        ReplayReport {
            failed: false,
            count,
        }
    }

    /// Leave replay: clear the buffer (file included) and return to
    /// `APPLYING`. Replay failure is fatal to the recovery attempt, not to
    /// the log.
    fn finish_replay(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.buffer = None;
        inner.state = LogState::Applying;
        let buffer_dir = self.dir.join(BUFFER_DIR);
        if buffer_dir.exists() {
            if let Err(err) = fs::remove_dir_all(&buffer_dir) {
                tracing::warn!(error = ?err, "could not remove drained buffer dir");
            }
        }
    }
}

fn append_to_main(
    inner: &mut LogInner,
    entry: LogEntry,
    num_records_to_keep: usize,
) -> anyhow::Result<()> {
    let payload = serde_json::to_vec(&entry).context("serialize log entry")?;
    write_record(&mut inner.main_file, &payload)?;
    inner.main_file.flush()?;
    inner.window.insert(entry.version.unsigned_abs(), entry);
    trim_window(&mut inner.window, num_records_to_keep);
    Ok(())
}

fn trim_window(window: &mut BTreeMap<u64, LogEntry>, keep: usize) {
    while window.len() > keep {
        let oldest = *window.keys().next().expect("non-empty window");
        window.remove(&oldest);
    }
}

fn write_record(file: &mut File, payload: &[u8]) -> anyhow::Result<()> {
    let len = payload.len() as u32;
    let checksum = crc32fast::hash(payload);
    file.write_all(&len.to_be_bytes())?;
    file.write_all(&checksum.to_be_bytes())?;
    file.write_all(payload)?;
    Ok(())
}

fn read_log_entries(path: &Path) -> anyhow::Result<Vec<LogEntry>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };
    let mut reader = std::io::BufReader::new(file);
    let mut entries = Vec::new();
    loop {
        let mut len_buf = [0u8; 4];
        match reader.read_exact(&mut len_buf) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(err) => return Err(err.into()),
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut crc_buf = [0u8; 4];
        reader.read_exact(&mut crc_buf)?;
        let expected_crc = u32::from_be_bytes(crc_buf);
        let mut payload = vec![0u8; len];
        match reader.read_exact(&mut payload) {
            Ok(()) => {}
            // A torn tail write is not corruption; stop at the last whole record.
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(err) => return Err(err.into()),
        }
        anyhow::ensure!(
            crc32fast::hash(&payload) == expected_crc,
            "tlog checksum mismatch in {}",
            path.display()
        );
        entries.push(serde_json::from_slice(&payload).context("decode tlog entry")?);
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(version: i64) -> LogEntry {
        LogEntry::add(
            version,
            serde_json::json!({"id": format!("doc{version}"), "v": version}),
        )
    }

    #[test]
    fn recent_versions_sorted_abs_desc_and_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let log = UpdateLog::open(dir.path(), 3).unwrap();
        log.append_update(entry(5)).unwrap();
        log.append_update(LogEntry::delete(-7, "doc5")).unwrap();
        log.append_update(entry(6)).unwrap();
        log.append_update(entry(9)).unwrap();
        assert_eq!(log.recent_versions(10), vec![9, -7, 6]);
        assert_eq!(log.recent_versions(2), vec![9, -7]);
    }

    #[test]
    fn window_survives_reopen_and_anchors_starting_versions() {
        let dir = tempfile::tempdir().unwrap();
        {
            let log = UpdateLog::open(dir.path(), 100).unwrap();
            for v in [97, 98, 99, 100] {
                log.append_update(entry(v)).unwrap();
            }
        }
        let log = UpdateLog::open(dir.path(), 100).unwrap();
        assert_eq!(log.starting_versions(), vec![100, 99, 98, 97]);
        assert_eq!(log.recent_versions(10), vec![100, 99, 98, 97]);
        assert!(!log.exist_old_buffer_log());
    }

    #[test]
    fn buffering_leaves_recent_versions_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let log = UpdateLog::open(dir.path(), 100).unwrap();
        log.append_update(entry(10)).unwrap();
        log.buffer_updates().unwrap();
        log.append_update(entry(11)).unwrap();
        log.append_update(entry(12)).unwrap();
        assert_eq!(log.recent_versions(10), vec![10]);
        assert_eq!(log.buffered_versions(), vec![11, 12]);
        assert_eq!(log.state(), LogState::Buffering);
    }

    #[test]
    fn buffer_updates_is_idempotent_and_drops_prior_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let log = UpdateLog::open(dir.path(), 100).unwrap();
        log.buffer_updates().unwrap();
        log.append_update(entry(20)).unwrap();
        log.buffer_updates().unwrap();
        assert!(log.buffered_versions().is_empty());
    }

    #[tokio::test]
    async fn replay_moves_buffer_into_main_log_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let index_dir = tempfile::tempdir().unwrap();
        let log = Arc::new(UpdateLog::open(dir.path(), 100).unwrap());
        let index = Arc::new(IndexCore::open(index_dir.path()).unwrap());

        log.append_update(entry(1)).unwrap();
        log.buffer_updates().unwrap();
        for v in [2, 3, 4] {
            log.append_update(entry(v)).unwrap();
        }
        let report = log.apply_buffered_updates(index.clone()).await.unwrap();
        assert!(!report.failed);
        assert_eq!(report.count, 3);
        assert_eq!(log.state(), LogState::Applying);
        assert_eq!(log.recent_versions(10), vec![4, 3, 2, 1]);
        assert_eq!(index.num_docs(), 3);
        assert!(!dir.path().join(BUFFER_DIR).exists());
    }

    #[tokio::test]
    async fn replay_without_buffering_is_a_clean_noop() {
        let dir = tempfile::tempdir().unwrap();
        let index_dir = tempfile::tempdir().unwrap();
        let log = Arc::new(UpdateLog::open(dir.path(), 100).unwrap());
        let index = Arc::new(IndexCore::open(index_dir.path()).unwrap());
        let report = log.apply_buffered_updates(index).await.unwrap();
        assert!(!report.failed);
        assert_eq!(report.count, 0);
    }

    #[test]
    fn crashed_buffer_is_detected_on_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let log = UpdateLog::open(dir.path(), 100).unwrap();
            log.buffer_updates().unwrap();
            log.append_update(entry(42)).unwrap();
            // Dropped while buffering: the buffer tlog stays on disk.
        }
        let log = UpdateLog::open(dir.path(), 100).unwrap();
        assert!(log.exist_old_buffer_log());
    }

    #[test]
    fn get_updates_by_versions_and_ranges() {
        let dir = tempfile::tempdir().unwrap();
        let log = UpdateLog::open(dir.path(), 100).unwrap();
        for v in [100, 101, 103] {
            log.append_update(entry(v)).unwrap();
        }
        log.append_update(LogEntry::delete(-102, "doc100")).unwrap();

        let by_versions = log.get_updates(&UpdatesSpec::Versions(vec![101, -102]));
        assert_eq!(
            by_versions.iter().map(|e| e.version).collect::<Vec<_>>(),
            vec![101, -102]
        );

        let by_range = log.get_updates(&UpdatesSpec::Ranges(vec![(101, 104)]));
        assert_eq!(
            by_range.iter().map(|e| e.version).collect::<Vec<_>>(),
            vec![101, -102, 103]
        );
    }

    #[test]
    fn updates_spec_wire_round_trip() {
        let versions = UpdatesSpec::Versions(vec![100, -102, 103]);
        assert_eq!(versions.to_param(), "100,-102,103");
        assert_eq!(UpdatesSpec::parse("100,-102,103").unwrap(), versions);

        let ranges = UpdatesSpec::Ranges(vec![(101, 104), (200, 201)]);
        assert_eq!(ranges.to_param(), "101..104,200..201");
        assert_eq!(UpdatesSpec::parse("101..104,200..201").unwrap(), ranges);
        assert_eq!(ranges.requested_count(), 4);
    }
}
