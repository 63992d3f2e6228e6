//! Minimal document store behind the index-engine seam.
//!
//! Recovery consumes the index engine through a handful of opaque
//! primitives: apply an update, commit, enumerate committed documents at a
//! version cutoff, list/read/swap segment files. This module implements just
//! that surface over immutable per-commit segment files plus a manifest, so
//! the recovery protocol can be exercised end to end without a real search
//! engine underneath.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::update_log::{LogEntry, OP_ADD, OP_DELETE, OP_DELETE_BY_QUERY};

const MANIFEST_FILE: &str = "manifest.json";

/// A committed, searcher-visible document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VisibleDoc {
    pub version: i64,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Manifest {
    generation: u64,
    max_doc: u64,
    segments: Vec<String>,
}

/// Metadata for one index file, as exchanged over the replication protocol.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileMeta {
    pub name: String,
    pub size: u64,
    pub checksum: u32,
}

struct IndexInner {
    committed: BTreeMap<String, VisibleDoc>,
    pending: Vec<LogEntry>,
    generation: u64,
    max_doc: u64,
    segments: Vec<String>,
}

/// One replica's locally mounted index.
pub struct IndexCore {
    dir: PathBuf,
    inner: RwLock<IndexInner>,
    searcher_generation: AtomicU64,
}

impl IndexCore {
    /// Open (or initialize) the index under `dir`.
    pub fn open(dir: impl AsRef<Path>) -> anyhow::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).context("create index dir")?;
        let inner = load_inner(&dir)?;
        Ok(Self {
            dir,
            inner: RwLock::new(inner),
            searcher_generation: AtomicU64::new(1),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Stage one update; it becomes visible at the next commit.
    pub fn apply(&self, entry: &LogEntry) {
        let mut inner = self.inner.write().unwrap();
        inner.pending.push(entry.clone());
    }

    /// Fold pending updates into the committed view and persist them as a
    /// new immutable segment. An empty commit is a no-op apart from opening
    /// a searcher when asked.
    pub fn commit(&self, open_searcher: bool) -> anyhow::Result<()> {
        {
            let mut inner = self.inner.write().unwrap();
            if !inner.pending.is_empty() {
                let pending = std::mem::take(&mut inner.pending);
                let generation = inner.generation + 1;
                let name = format!("seg_{generation:010}.json");
                let data = serde_json::to_vec(&pending).context("serialize segment")?;
                fs::write(self.dir.join(&name), data).context("write segment")?;

                let inner = &mut *inner;
                for entry in &pending {
                    fold_entry(&mut inner.committed, &mut inner.max_doc, entry);
                }
                inner.generation = generation;
                inner.segments.push(name);
                persist_manifest(&self.dir, &inner)?;
            }
        }
        if open_searcher {
            self.open_realtime_searcher();
        }
        Ok(())
    }

    /// Make the latest committed state visible to readers.
    pub fn open_realtime_searcher(&self) -> u64 {
        self.searcher_generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn searcher_generation(&self) -> u64 {
        self.searcher_generation.load(Ordering::SeqCst)
    }

    pub fn generation(&self) -> u64 {
        self.inner.read().unwrap().generation
    }

    pub fn num_docs(&self) -> u64 {
        self.inner.read().unwrap().committed.len() as u64
    }

    pub fn max_doc(&self) -> u64 {
        self.inner.read().unwrap().max_doc
    }

    /// Committed `(doc id, version)` pairs with `version <= max_version`.
    pub fn visible_versions(&self, max_version: i64) -> Vec<(String, i64)> {
        let inner = self.inner.read().unwrap();
        inner
            .committed
            .iter()
            .filter(|(_, doc)| doc.version <= max_version)
            .map(|(id, doc)| (id.clone(), doc.version))
            .collect()
    }

    pub fn get_doc(&self, id: &str) -> Option<VisibleDoc> {
        self.inner.read().unwrap().committed.get(id).cloned()
    }

    /// Index files the replication protocol may serve, manifest included.
    pub fn list_files(&self) -> anyhow::Result<Vec<FileMeta>> {
        let inner = self.inner.read().unwrap();
        let mut files = Vec::with_capacity(inner.segments.len() + 1);
        for name in inner.segments.iter().chain([&MANIFEST_FILE.to_string()]) {
            let data = fs::read(self.dir.join(name))
                .with_context(|| format!("read index file {name}"))?;
            files.push(FileMeta {
                name: name.clone(),
                size: data.len() as u64,
                checksum: crc32fast::hash(&data),
            });
        }
        Ok(files)
    }

    pub fn read_file(&self, name: &str) -> anyhow::Result<Vec<u8>> {
        anyhow::ensure!(
            !name.contains('/') && !name.contains(".."),
            "invalid index file name {name:?}"
        );
        fs::read(self.dir.join(name)).with_context(|| format!("read index file {name}"))
    }

    /// Replace the on-disk index with the contents of `staging` and reload.
    /// The caller holds the core-state lock so no writer is active.
    pub fn swap_in(&self, staging: &Path) -> anyhow::Result<()> {
        let mut inner = self.inner.write().unwrap();
        for existing in fs::read_dir(&self.dir).context("list index dir")? {
            let existing = existing?;
            fs::remove_file(existing.path())
                .with_context(|| format!("remove {:?}", existing.path()))?;
        }
        for staged in fs::read_dir(staging).context("list staging dir")? {
            let staged = staged?;
            let target = self.dir.join(staged.file_name());
            fs::rename(staged.path(), &target)
                .or_else(|_| fs::copy(staged.path(), &target).map(|_| ()))
                .with_context(|| format!("install {:?}", staged.file_name()))?;
        }
        *inner = load_inner(&self.dir)?;
        drop(inner);
        self.open_realtime_searcher();
        Ok(())
    }
}

fn load_inner(dir: &Path) -> anyhow::Result<IndexInner> {
    let manifest_path = dir.join(MANIFEST_FILE);
    let manifest: Manifest = match fs::read(&manifest_path) {
        Ok(data) => serde_json::from_slice(&data).context("parse index manifest")?,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            let manifest = Manifest {
                generation: 0,
                max_doc: 0,
                segments: Vec::new(),
            };
            fs::write(&manifest_path, serde_json::to_vec_pretty(&manifest)?)
                .context("write initial manifest")?;
            manifest
        }
        Err(err) => return Err(err).context("read index manifest"),
    };

    let mut committed = BTreeMap::new();
    let mut max_doc = 0u64;
    for name in &manifest.segments {
        let data =
            fs::read(dir.join(name)).with_context(|| format!("read index segment {name}"))?;
        let entries: Vec<LogEntry> =
            serde_json::from_slice(&data).with_context(|| format!("parse index segment {name}"))?;
        for entry in &entries {
            fold_entry(&mut committed, &mut max_doc, entry);
        }
    }
    // The manifest's max_doc is authoritative after a segment swap.
    max_doc = max_doc.max(manifest.max_doc);
    Ok(IndexInner {
        committed,
        pending: Vec::new(),
        generation: manifest.generation,
        max_doc,
        segments: manifest.segments,
    })
}

fn persist_manifest(dir: &Path, inner: &IndexInner) -> anyhow::Result<()> {
    let manifest = Manifest {
        generation: inner.generation,
        max_doc: inner.max_doc,
        segments: inner.segments.clone(),
    };
    let data = serde_json::to_vec_pretty(&manifest).context("serialize manifest")?;
    fs::write(dir.join(MANIFEST_FILE), data).context("write manifest")?;
    Ok(())
}

fn fold_entry(committed: &mut BTreeMap<String, VisibleDoc>, max_doc: &mut u64, entry: &LogEntry) {
    match entry.op {
        OP_ADD => {
            let Some(id) = entry.doc_id() else { return };
            let stale = committed
                .get(&id)
                .map(|doc| doc.version.abs() >= entry.version.abs())
                .unwrap_or(false);
            if !stale {
                committed.insert(
                    id,
                    VisibleDoc {
                        version: entry.version.abs(),
                        payload: entry.payload.clone(),
                    },
                );
            }
            *max_doc += 1;
        }
        OP_DELETE => {
            if let Some(id) = entry.doc_id() {
                let stale = committed
                    .get(&id)
                    .map(|doc| doc.version.abs() > entry.version.abs())
                    .unwrap_or(false);
                if !stale {
                    committed.remove(&id);
                }
            }
        }
        OP_DELETE_BY_QUERY => {
            if let Some(query) = entry.payload.as_str() {
                committed.retain(|_, doc| !matches_query(&doc.payload, query));
            }
        }
        other => {
            tracing::warn!(op = other, "ignoring unknown index op");
        }
    }
}

/// The only query shapes deletes-by-query use on this surface: `*:*` and
/// `field:value` equality against the document payload.
pub fn matches_query(payload: &serde_json::Value, query: &str) -> bool {
    if query == "*:*" {
        return true;
    }
    let Some((field, value)) = query.split_once(':') else {
        return false;
    };
    match payload.get(field) {
        Some(serde_json::Value::String(s)) => s == value,
        Some(other) => other.to_string() == value,
        None => false,
    }
}
