//! In-process BM25 lexical index over the chunk population.
//!
//! Keyed by chunk id, guarded by an `RwLock` (concurrent reads, exclusive
//! writes held only for the duration of add/remove), and rebuildable from
//! the vector store's chunk scan at startup. Writes are batched per
//! document: all chunks of one document enter under a single lock
//! acquisition.

use std::collections::HashMap;
use std::sync::RwLock;

const BM25_K1: f64 = 1.2;
const BM25_B: f64 = 0.75;

/// Lowercased alphanumeric terms.
fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

struct Entry {
    doc_id: String,
    len: u64,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    /// term → chunk_id → term frequency
    postings: HashMap<String, HashMap<String, u64>>,
    total_len: u64,
}

/// BM25-style sparse index.
#[derive(Default)]
pub struct SparseIndex {
    inner: RwLock<Inner>,
}

impl SparseIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add all chunks of one document in a single exclusive section.
    pub fn add_document<'a>(
        &self,
        doc_id: &str,
        chunks: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) {
        let mut inner = self.inner.write().unwrap();
        for (chunk_id, text) in chunks {
            let terms = tokenize(text);
            let len = terms.len() as u64;
            // Re-adding a chunk id replaces its previous postings.
            if inner.entries.contains_key(chunk_id) {
                Self::remove_chunk(&mut inner, chunk_id);
            }
            for term in &terms {
                *inner
                    .postings
                    .entry(term.clone())
                    .or_default()
                    .entry(chunk_id.to_string())
                    .or_insert(0) += 1;
            }
            inner.entries.insert(
                chunk_id.to_string(),
                Entry {
                    doc_id: doc_id.to_string(),
                    len,
                },
            );
            inner.total_len += len;
        }
    }

    /// Drop every chunk belonging to a document.
    pub fn remove_by_doc(&self, doc_id: &str) {
        let mut inner = self.inner.write().unwrap();
        let chunk_ids: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, e)| e.doc_id == doc_id)
            .map(|(id, _)| id.clone())
            .collect();
        for chunk_id in chunk_ids {
            Self::remove_chunk(&mut inner, &chunk_id);
        }
    }

    fn remove_chunk(inner: &mut Inner, chunk_id: &str) {
        if let Some(entry) = inner.entries.remove(chunk_id) {
            inner.total_len -= entry.len;
        }
        inner.postings.retain(|_, chunk_tfs| {
            chunk_tfs.remove(chunk_id);
            !chunk_tfs.is_empty()
        });
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// BM25 top-k: (chunk_id, score) sorted by score descending, chunk id
    /// ascending on ties.
    pub fn query(&self, text: &str, top_k: usize) -> Vec<(String, f64)> {
        let inner = self.inner.read().unwrap();
        let n = inner.entries.len();
        if n == 0 {
            return Vec::new();
        }
        let avg_len = inner.total_len as f64 / n as f64;

        let mut scores: HashMap<&str, f64> = HashMap::new();
        for term in tokenize(text) {
            let Some(chunk_tfs) = inner.postings.get(&term) else {
                continue;
            };
            let df = chunk_tfs.len() as f64;
            let idf = (((n as f64 - df + 0.5) / (df + 0.5)) + 1.0).ln();
            for (chunk_id, tf) in chunk_tfs {
                let len = inner
                    .entries
                    .get(chunk_id)
                    .map(|e| e.len as f64)
                    .unwrap_or(avg_len);
                let tf = *tf as f64;
                let denom = tf + BM25_K1 * (1.0 - BM25_B + BM25_B * len / avg_len.max(1.0));
                *scores.entry(chunk_id.as_str()).or_insert(0.0) +=
                    idf * tf * (BM25_K1 + 1.0) / denom;
            }
        }

        let mut ranked: Vec<(String, f64)> = scores
            .into_iter()
            .map(|(id, s)| (id.to_string(), s))
            .collect();
        ranked.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        ranked.truncate(top_k);
        ranked
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded() -> SparseIndex {
        let index = SparseIndex::new();
        index.add_document(
            "d1",
            [
                ("d1:0", "project alpha kick-off meeting in berlin"),
                ("d1:1", "budget review for the finance team"),
            ],
        );
        index.add_document("d2", [("d2:0", "gardening tips for tomato plants")]);
        index
    }

    #[test]
    fn query_ranks_matching_chunk_first() {
        let index = seeded();
        let hits = index.query("alpha kick-off", 10);
        assert!(!hits.is_empty());
        assert_eq!(hits[0].0, "d1:0");
        assert!(hits[0].1 > 0.0);
    }

    #[test]
    fn query_misses_return_empty() {
        let index = seeded();
        assert!(index.query("quantum chromodynamics", 10).is_empty());
        assert!(SparseIndex::new().query("anything", 5).is_empty());
    }

    #[test]
    fn remove_by_doc_clears_postings() {
        let index = seeded();
        index.remove_by_doc("d1");
        assert_eq!(index.len(), 1);
        assert!(index.query("alpha", 10).is_empty());
        // The remaining document is still searchable.
        assert_eq!(index.query("tomato", 10)[0].0, "d2:0");
    }

    #[test]
    fn re_adding_a_chunk_replaces_it() {
        let index = seeded();
        index.add_document("d2", [("d2:0", "now about sailing instead")]);
        assert!(index.query("tomato", 10).is_empty());
        assert_eq!(index.query("sailing", 10)[0].0, "d2:0");
        assert_eq!(index.len(), 3);
    }

    #[test]
    fn rarer_terms_score_higher() {
        let index = SparseIndex::new();
        index.add_document(
            "d1",
            [
                ("d1:0", "common common common rare"),
                ("d1:1", "common words only here"),
                ("d1:2", "common again"),
            ],
        );
        let hits = index.query("rare", 10);
        assert_eq!(hits[0].0, "d1:0");
        let common_hits = index.query("common", 10);
        assert!(common_hits[0].1 < hits[0].1);
    }

    #[test]
    fn top_k_truncates() {
        let index = seeded();
        let hits = index.query("for", 1);
        assert_eq!(hits.len(), 1);
    }
}
