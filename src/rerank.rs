//! Cross-encoder reranking over the retrieval shortlist.
//!
//! The default scorer is a deterministic lexical cross-scorer: no model,
//! same inputs → same scores, which keeps the confidence gate meaningful
//! offline. A fastembed cross-encoder is available behind the
//! `local-rerank` feature. When reranking is disabled the MMR order is
//! preserved untouched.

use crate::error::Result;
use crate::retrieve::RetrievedChunk;

/// Pairwise (query, candidate) scorer. Scores are in [0,1], higher is more
/// relevant, deterministic for the same inputs.
pub trait Reranker: Send + Sync {
    fn name(&self) -> &str;
    fn score_pairs(&self, query: &str, texts: &[&str]) -> Result<Vec<f64>>;
}

/// Instantiate the configured reranker; `None` means reranking is
/// disabled and MMR order stands.
pub fn create_reranker(mode: &str) -> anyhow::Result<Option<Box<dyn Reranker>>> {
    match mode {
        "lexical" => Ok(Some(Box::new(LexicalReranker))),
        #[cfg(feature = "local-rerank")]
        "local" => Ok(Some(Box::new(LocalReranker))),
        #[cfg(not(feature = "local-rerank"))]
        "local" => anyhow::bail!(
            "rerank.mode = \"local\" requires building with --features local-rerank"
        ),
        "disabled" => Ok(None),
        other => anyhow::bail!("Unknown rerank mode: {}", other),
    }
}

/// A reranked candidate.
#[derive(Debug, Clone)]
pub struct RerankedChunk {
    pub retrieved: RetrievedChunk,
    pub rerank_score: f64,
}

/// Score and re-sort candidates descending; ties break on chunk id so the
/// output is stable.
pub fn rerank_candidates(
    reranker: &dyn Reranker,
    query: &str,
    candidates: Vec<RetrievedChunk>,
) -> Result<Vec<RerankedChunk>> {
    let texts: Vec<&str> = candidates.iter().map(|c| c.chunk.text.as_str()).collect();
    let scores = reranker.score_pairs(query, &texts)?;
    let mut reranked: Vec<RerankedChunk> = candidates
        .into_iter()
        .zip(scores)
        .map(|(retrieved, rerank_score)| RerankedChunk {
            retrieved,
            rerank_score,
        })
        .collect();
    reranked.sort_by(|a, b| {
        b.rerank_score
            .partial_cmp(&a.rerank_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.retrieved.chunk.chunk_id.cmp(&b.retrieved.chunk.chunk_id))
    });
    Ok(reranked)
}

// ============ Lexical ============

/// Terms too common to carry relevance signal on their own.
const STOPWORDS: [&str; 24] = [
    "a", "an", "and", "are", "as", "at", "be", "by", "do", "for", "from", "how", "i", "in", "is",
    "it", "of", "on", "or", "the", "to", "was", "what", "with",
];

/// Deterministic lexical cross-scorer: the fraction of informative query
/// terms that occur in the candidate, with mild saturation for repeats.
pub struct LexicalReranker;

impl Reranker for LexicalReranker {
    fn name(&self) -> &str {
        "lexical"
    }

    fn score_pairs(&self, query: &str, texts: &[&str]) -> Result<Vec<f64>> {
        let query_terms: Vec<String> = tokenize(query)
            .into_iter()
            .filter(|t| !STOPWORDS.contains(&t.as_str()))
            .collect();

        Ok(texts
            .iter()
            .map(|text| {
                if query_terms.is_empty() {
                    return 0.0;
                }
                let text_terms = tokenize(text);
                let mut matched = 0.0;
                for term in &query_terms {
                    let occurrences = text_terms.iter().filter(|t| *t == term).count();
                    if occurrences > 0 {
                        // 1.0 for the first occurrence, a mild bonus capped
                        // for repeats.
                        matched += 1.0 + 0.25 * ((occurrences - 1).min(2) as f64);
                    }
                }
                (matched / (query_terms.len() as f64 * 1.5)).min(1.0)
            })
            .collect())
    }
}

fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

// ============ Local cross-encoder ============

#[cfg(feature = "local-rerank")]
pub struct LocalReranker;

#[cfg(feature = "local-rerank")]
impl Reranker for LocalReranker {
    fn name(&self) -> &str {
        "local-cross-encoder"
    }

    fn score_pairs(&self, query: &str, texts: &[&str]) -> Result<Vec<f64>> {
        use crate::error::SiftError;
        let mut model = fastembed::TextRerank::try_new(
            fastembed::RerankInitOptions::new(fastembed::RerankerModel::JINARerankerV1TurboEn)
                .with_show_download_progress(false),
        )
        .map_err(|e| SiftError::storage(format!("reranker init: {e}")))?;
        let documents: Vec<&str> = texts.to_vec();
        let results = model
            .rerank(query, documents, false, None)
            .map_err(|e| SiftError::storage(format!("rerank: {e}")))?;
        // fastembed returns (index, score) sorted by score; restore input
        // order and squash scores into [0,1].
        let mut scores = vec![0.0f64; texts.len()];
        for r in results {
            scores[r.index] = 1.0 / (1.0 + (-r.score as f64).exp());
        }
        Ok(scores)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Provenance;
    use crate::store::StoredChunk;
    use std::collections::BTreeMap;

    fn retrieved(id: &str, text: &str, combined: f64) -> RetrievedChunk {
        RetrievedChunk {
            chunk: StoredChunk {
                chunk_id: id.into(),
                doc_id: "d1".into(),
                ordinal: 0,
                kind: crate::models::ChunkKind::Paragraph,
                section_path: vec![],
                text: text.into(),
                token_estimate: 4,
                metadata: BTreeMap::new(),
                embedding: None,
            },
            combined_score: combined,
            provenance: Provenance::Dense,
        }
    }

    #[test]
    fn lexical_scores_overlap() {
        let scores = LexicalReranker
            .score_pairs(
                "alpha kick-off",
                &[
                    "Project Alpha kick-off on 2026-03-01 in Berlin.",
                    "Gardening tips for tomato plants.",
                ],
            )
            .unwrap();
        assert!(scores[0] > 0.4, "relevant chunk scored {}", scores[0]);
        assert!(scores[1] < 0.1, "irrelevant chunk scored {}", scores[1]);
    }

    #[test]
    fn lexical_ignores_stopword_only_queries() {
        let scores = LexicalReranker
            .score_pairs("how do i the", &["how do i do the thing"])
            .unwrap();
        assert_eq!(scores[0], 0.0);
    }

    #[test]
    fn lexical_is_deterministic() {
        let texts = ["alpha beta gamma", "delta epsilon"];
        let a = LexicalReranker.score_pairs("alpha delta", &texts).unwrap();
        let b = LexicalReranker.score_pairs("alpha delta", &texts).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn rerank_resorts_descending() {
        let candidates = vec![
            retrieved("d1:0", "nothing relevant here", 0.9),
            retrieved("d1:1", "the tls handshake configuration guide", 0.1),
        ];
        let reranked =
            rerank_candidates(&LexicalReranker, "tls handshake", candidates).unwrap();
        assert_eq!(reranked[0].retrieved.chunk.chunk_id, "d1:1");
        assert!(reranked[0].rerank_score > reranked[1].rerank_score);
    }

    #[test]
    fn disabled_mode_yields_none() {
        assert!(create_reranker("disabled").unwrap().is_none());
        assert!(create_reranker("lexical").unwrap().is_some());
        assert!(create_reranker("mystery").is_err());
    }
}
