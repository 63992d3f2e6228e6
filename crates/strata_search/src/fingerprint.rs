//! Deterministic index fingerprints.
//!
//! A fingerprint summarizes the committed index content at a version cutoff.
//! Two replicas holding the same committed updates up to the same cutoff
//! produce equal fingerprints, so equality substitutes for transferring and
//! diffing the data itself.

use serde::{Deserialize, Serialize};

use crate::index::IndexCore;

/// Summary of committed index content at `max_version_specified`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fingerprint {
    /// The cutoff the fingerprint was requested at (`i64::MAX` = at head).
    pub max_version_specified: i64,
    /// Largest version actually present at or below the cutoff.
    pub max_version_encountered: i64,
    pub max_doc: u64,
    pub num_docs: u64,
    /// Commutative hash over (doc id, version) pairs.
    pub hash: u64,
}

/// Compute the fingerprint of `index` at the given cutoff.
///
/// The hash is a sum of mixed per-document terms, so it is independent of
/// iteration order and therefore comparable across replicas with different
/// segment layouts.
pub fn compute(index: &IndexCore, max_version_specified: i64) -> Fingerprint {
    let mut hash = 0u64;
    let mut max_version_encountered = 0i64;
    let mut num_docs = 0u64;
    for (id, version) in index.visible_versions(max_version_specified) {
        hash = hash.wrapping_add(mix64(fnv1a(id.as_bytes()) ^ version as u64));
        max_version_encountered = max_version_encountered.max(version);
        num_docs += 1;
    }
    Fingerprint {
        max_version_specified,
        max_version_encountered,
        max_doc: index.max_doc(),
        num_docs,
        hash,
    }
}

/// Semantic equality: same content hash, document count, and highest
/// version. `max_doc` is not compared; replicas that converged via
/// different routes (delta sync vs segment copy) may disagree on it.
pub fn compare(a: &Fingerprint, b: &Fingerprint) -> std::cmp::Ordering {
    (a.hash, a.num_docs, a.max_version_encountered).cmp(&(
        b.hash,
        b.num_docs,
        b.max_version_encountered,
    ))
}

pub fn equal(a: &Fingerprint, b: &Fingerprint) -> bool {
    compare(a, b) == std::cmp::Ordering::Equal
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash = 0xcbf29ce484222325u64;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

/// Final mixing step of murmur3's 64-bit variant.
fn mix64(mut x: u64) -> u64 {
    x ^= x >> 33;
    x = x.wrapping_mul(0xff51afd7ed558ccd);
    x ^= x >> 33;
    x = x.wrapping_mul(0xc4ceb9fe1a85ec53);
    x ^= x >> 33;
    x
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::update_log::LogEntry;

    fn seeded_index(dir: &std::path::Path, versions: &[i64]) -> IndexCore {
        let index = IndexCore::open(dir).unwrap();
        for v in versions {
            index.apply(&LogEntry::add(
                *v,
                serde_json::json!({"id": format!("doc{v}"), "v": v}),
            ));
        }
        index.commit(false).unwrap();
        index
    }

    #[test]
    fn equal_content_means_equal_fingerprint() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        // Same documents committed in different order.
        let a = seeded_index(dir_a.path(), &[97, 98, 99, 100]);
        let b = seeded_index(dir_b.path(), &[100, 99, 98, 97]);
        let fa = compute(&a, i64::MAX);
        let fb = compute(&b, i64::MAX);
        assert!(equal(&fa, &fb));
        assert_eq!(fa.max_version_encountered, 100);
        assert_eq!(fa.num_docs, 4);
    }

    #[test]
    fn cutoff_bounds_what_is_hashed() {
        let dir = tempfile::tempdir().unwrap();
        let index = seeded_index(dir.path(), &[97, 98, 99, 100]);
        let full = compute(&index, i64::MAX);
        let cut = compute(&index, 98);
        assert_eq!(cut.num_docs, 2);
        assert_eq!(cut.max_version_encountered, 98);
        assert!(!equal(&full, &cut));
    }

    #[test]
    fn diverged_content_is_detected() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let a = seeded_index(dir_a.path(), &[97, 98, 99]);
        let b = seeded_index(dir_b.path(), &[97, 98, 100]);
        assert!(!equal(&compute(&a, i64::MAX), &compute(&b, i64::MAX)));
    }

    #[test]
    fn wire_form_uses_camel_case_keys() {
        let fp = Fingerprint {
            max_version_specified: i64::MAX,
            max_version_encountered: 100,
            max_doc: 4,
            num_docs: 4,
            hash: 42,
        };
        let json = serde_json::to_value(&fp).unwrap();
        assert!(json.get("maxVersionSpecified").is_some());
        assert!(json.get("maxVersionEncountered").is_some());
        assert!(json.get("numDocs").is_some());
    }
}
