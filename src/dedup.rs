//! Exact and near-duplicate rejection by content fingerprint.
//!
//! Exact: SHA-256 over normalized text (trimmed, whitespace-collapsed).
//! Near: a 64-bit SimHash over word shingles; any registered document within
//! the configured Hamming distance counts as a near-duplicate.
//!
//! The registry's check-and-insert is atomic under one lock, so two
//! identical documents submitted simultaneously yield exactly one winner;
//! the loser's error names the winner's id.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;

use sha2::{Digest, Sha256};

use crate::error::SiftError;

/// Normalize text for fingerprinting: trim, collapse all whitespace runs to
/// single spaces.
pub fn normalize_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// SHA-256 lowercase hex over the normalized text.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_text(text).as_bytes());
    format!("{:x}", hasher.finalize())
}

/// 64-bit SimHash over word 3-shingles of the normalized text. Shingling
/// keeps only alphanumeric word content, so documents that differ in
/// whitespace, casing, or punctuation land on (or within a few bits of)
/// the same fingerprint.
pub fn simhash(text: &str) -> u64 {
    let normalized = normalize_text(text).to_lowercase();
    let words: Vec<&str> = normalized
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();
    if words.is_empty() {
        return 0;
    }

    let mut weights = [0i32; 64];
    let mut add_feature = |feature: &str| {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        feature.hash(&mut hasher);
        let h = hasher.finish();
        for (bit, weight) in weights.iter_mut().enumerate() {
            if (h >> bit) & 1 == 1 {
                *weight += 1;
            } else {
                *weight -= 1;
            }
        }
    };

    if words.len() < 3 {
        for w in &words {
            add_feature(w);
        }
    } else {
        for shingle in words.windows(3) {
            add_feature(&shingle.join(" "));
        }
    }

    let mut fingerprint = 0u64;
    for (bit, weight) in weights.iter().enumerate() {
        if *weight > 0 {
            fingerprint |= 1 << bit;
        }
    }
    fingerprint
}

/// Bits differing between two fingerprints.
pub fn hamming_distance(a: u64, b: u64) -> u32 {
    (a ^ b).count_ones()
}

struct Inner {
    /// content hash → winning doc id
    by_hash: HashMap<String, String>,
    /// (simhash, doc id) for near-dup scans
    fingerprints: Vec<(u64, String)>,
}

/// In-process duplicate registry, rebuildable from the store at startup.
pub struct DedupIndex {
    threshold: u32,
    inner: Mutex<Inner>,
}

impl DedupIndex {
    pub fn new(hamming_threshold: u32) -> Self {
        Self {
            threshold: hamming_threshold,
            inner: Mutex::new(Inner {
                by_hash: HashMap::new(),
                fingerprints: Vec::new(),
            }),
        }
    }

    /// Seed the registry from persisted documents.
    pub fn load(&self, entries: impl IntoIterator<Item = (String, u64, String)>) {
        let mut inner = self.inner.lock().unwrap();
        for (hash, fingerprint, doc_id) in entries {
            inner.by_hash.insert(hash, doc_id.clone());
            inner.fingerprints.push((fingerprint, doc_id));
        }
    }

    /// Atomic check-and-insert for one document.
    ///
    /// Errors with `Duplicate` on an exact hash hit (fatal), or
    /// `NearDuplicate` when a registered fingerprint is within the Hamming
    /// threshold and `override_near` is not set. On success the hash is
    /// claimed; a near match that was overridden is reported back so the
    /// caller can correlate.
    pub fn claim(
        &self,
        hash: &str,
        fingerprint: u64,
        doc_id: &str,
        override_near: bool,
    ) -> Result<Option<String>, SiftError> {
        let mut inner = self.inner.lock().unwrap();

        if let Some(winner) = inner.by_hash.get(hash) {
            return Err(SiftError::Duplicate { of: winner.clone() });
        }

        let near = inner
            .fingerprints
            .iter()
            .map(|(fp, id)| (hamming_distance(*fp, fingerprint), id))
            .filter(|(d, _)| *d <= self.threshold)
            .min_by_key(|(d, _)| *d)
            .map(|(d, id)| (d, id.clone()));

        if let Some((distance, of)) = near {
            if !override_near {
                return Err(SiftError::NearDuplicate { of, distance });
            }
            inner.by_hash.insert(hash.to_string(), doc_id.to_string());
            inner.fingerprints.push((fingerprint, doc_id.to_string()));
            return Ok(Some(of));
        }

        inner.by_hash.insert(hash.to_string(), doc_id.to_string());
        inner.fingerprints.push((fingerprint, doc_id.to_string()));
        Ok(None)
    }

    /// Roll back a claim after a failed ingest.
    pub fn release(&self, hash: &str, doc_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.by_hash.remove(hash);
        inner.fingerprints.retain(|(_, id)| id != doc_id);
    }

    /// Forget a deleted document.
    pub fn remove_doc(&self, doc_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.by_hash.retain(|_, id| id != doc_id);
        inner.fingerprints.retain(|(_, id)| id != doc_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_collapses_whitespace() {
        assert_eq!(normalize_text("  a \t b\n\nc  "), "a b c");
    }

    #[test]
    fn content_hash_ignores_whitespace_runs() {
        assert_eq!(content_hash("a  b"), content_hash("a b"));
        assert_ne!(content_hash("a b"), content_hash("a c"));
    }

    #[test]
    fn simhash_ignores_punctuation_and_case() {
        let a = "Project Alpha kick-off on 2026-03-01 in Berlin. Daniel will present.";
        let b = "project alpha Kick-Off on 2026-03-01 in Berlin.  Daniel will present! ";
        assert_eq!(simhash(a), simhash(b));

        let c = "Quarterly finance review scheduled with auditors in Lisbon next month.";
        let far = hamming_distance(simhash(a), simhash(c));
        assert!(far > 3, "unrelated text should be far, distance {far}");
    }

    #[test]
    fn exact_duplicate_is_fatal_and_names_winner() {
        let index = DedupIndex::new(3);
        index.claim("h1", 0b1010, "doc-a", false).unwrap();
        let err = index.claim("h1", 0b1010, "doc-b", false).unwrap_err();
        match err {
            SiftError::Duplicate { of } => assert_eq!(of, "doc-a"),
            other => panic!("expected Duplicate, got {other:?}"),
        }
    }

    #[test]
    fn near_duplicate_is_advisory_and_overridable() {
        let index = DedupIndex::new(3);
        index.claim("h1", 0b0000, "doc-a", false).unwrap();

        let err = index.claim("h2", 0b0001, "doc-b", false).unwrap_err();
        assert!(matches!(err, SiftError::NearDuplicate { .. }));

        let overridden = index.claim("h2", 0b0001, "doc-b", true).unwrap();
        assert_eq!(overridden.as_deref(), Some("doc-a"));
    }

    #[test]
    fn release_frees_the_hash() {
        let index = DedupIndex::new(3);
        index.claim("h1", u64::MAX, "doc-a", false).unwrap();
        index.release("h1", "doc-a");
        index.claim("h1", u64::MAX, "doc-b", false).unwrap();
    }

    #[test]
    fn distant_fingerprints_are_unique() {
        let index = DedupIndex::new(3);
        index.claim("h1", 0, "doc-a", false).unwrap();
        assert!(index.claim("h2", u64::MAX, "doc-b", false).unwrap().is_none());
    }
}
