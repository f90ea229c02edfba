//! Hybrid retrieval: dense + sparse candidates, min-max normalization,
//! weighted merge, and MMR diversification.
//!
//! Both branches fetch `candidate_multiplier × top_k` candidates under the
//! same metadata filter and run concurrently. Scores are min-max
//! normalized per branch, merged as `α·dense + (1−α)·sparse`, then the
//! merged pool is diversified with maximal marginal relevance before
//! truncation to `top_k`. Ties break on document recency, chunk ordinal,
//! then chunk id.
//!
//! Optional HyDE: a short hypothetical answer is synthesized and its
//! embedding averaged with the query embedding before the dense query; a
//! router failure falls back to the plain query embedding.

use std::collections::HashMap;

use chrono::DateTime;
use tracing::{debug, warn};

use crate::config::RetrievalConfig;
use crate::embedding::{cosine_similarity, embed_one, mean_vector, Embedder};
use crate::error::Result;
use crate::llm::LlmRouter;
use crate::models::Provenance;
use crate::sparse::SparseIndex;
use crate::store::{ChunkFilter, StoredChunk, VectorStore};

/// A merged candidate leaving the retriever, reranker input downstream.
#[derive(Debug, Clone)]
pub struct RetrievedChunk {
    pub chunk: StoredChunk,
    pub combined_score: f64,
    pub provenance: Provenance,
}

/// Run hybrid retrieval for one query.
pub async fn retrieve(
    config: &RetrievalConfig,
    embedder: &dyn Embedder,
    store: &dyn VectorStore,
    sparse: &SparseIndex,
    router: Option<&LlmRouter>,
    query: &str,
    filter: &ChunkFilter,
    top_k: usize,
    hyde: bool,
) -> Result<Vec<RetrievedChunk>> {
    if query.trim().is_empty() {
        return Ok(Vec::new());
    }

    let query_vector = build_query_vector(embedder, router, query, hyde).await?;
    let candidate_k = config.candidate_multiplier * top_k;

    let dense_branch = store.query_similar(&query_vector, filter, candidate_k);
    let sparse_branch = async {
        let mut hits = Vec::new();
        for (chunk_id, score) in sparse.query(query, candidate_k * 2) {
            if let Some(chunk) = store.get_chunk(&chunk_id).await? {
                if chunk.kind != crate::models::ChunkKind::Ignored && filter.matches(&chunk.metadata)
                {
                    hits.push((chunk, score));
                    if hits.len() >= candidate_k {
                        break;
                    }
                }
            }
        }
        Ok::<_, crate::error::SiftError>(hits)
    };
    let (dense, sparse_hits) = tokio::join!(dense_branch, sparse_branch);
    let dense = dense?;
    let sparse_hits = sparse_hits?;

    debug!(
        dense = dense.len(),
        sparse = sparse_hits.len(),
        "hybrid candidate pools"
    );

    // Per-branch min-max normalization.
    let dense_norm = min_max_normalize(dense.iter().map(|c| c.score));
    let sparse_norm = min_max_normalize(sparse_hits.iter().map(|(_, s)| *s));

    struct Pooled {
        chunk: StoredChunk,
        dense: Option<f64>,
        sparse: Option<f64>,
    }

    let mut pool: HashMap<String, Pooled> = HashMap::new();
    for (candidate, norm) in dense.into_iter().zip(dense_norm) {
        pool.insert(
            candidate.chunk.chunk_id.clone(),
            Pooled {
                chunk: candidate.chunk,
                dense: Some(norm),
                sparse: None,
            },
        );
    }
    for ((chunk, _), norm) in sparse_hits.into_iter().zip(sparse_norm) {
        pool.entry(chunk.chunk_id.clone())
            .and_modify(|p| p.sparse = Some(norm))
            .or_insert(Pooled {
                chunk,
                dense: None,
                sparse: Some(norm),
            });
    }

    let alpha = config.hybrid_alpha;
    let mut candidates: Vec<RetrievedChunk> = pool
        .into_values()
        .map(|p| {
            let combined =
                alpha * p.dense.unwrap_or(0.0) + (1.0 - alpha) * p.sparse.unwrap_or(0.0);
            let provenance = match (p.dense.is_some(), p.sparse.is_some()) {
                (true, true) => Provenance::Both,
                (true, false) => Provenance::Dense,
                (false, _) => Provenance::Sparse,
            };
            RetrievedChunk {
                chunk: p.chunk,
                combined_score: combined,
                provenance,
            }
        })
        .collect();

    // Deterministic input order for the greedy selection.
    candidates.sort_by(compare_candidates);

    Ok(mmr_select(candidates, config.mmr_lambda, top_k))
}

async fn build_query_vector(
    embedder: &dyn Embedder,
    router: Option<&LlmRouter>,
    query: &str,
    hyde: bool,
) -> Result<Vec<f32>> {
    let query_vector = embed_one(embedder, query).await?;
    if !hyde {
        return Ok(query_vector);
    }
    let Some(router) = router else {
        return Ok(query_vector);
    };
    let prompt = format!(
        "Write a short hypothetical passage (3 to 4 sentences) that would directly answer this question. Output only the passage.\n\nQuestion: {query}"
    );
    match router.call("hyde", &prompt, None, 0.7, 256).await {
        Ok(reply) => {
            let hyde_vector = embed_one(embedder, &reply.text).await?;
            Ok(mean_vector(&query_vector, &hyde_vector))
        }
        Err(e) => {
            warn!(error = %e, "hyde synthesis unavailable, using the plain query embedding");
            Ok(query_vector)
        }
    }
}

/// Min-max normalize to [0,1]; a constant list normalizes to 1.0.
fn min_max_normalize(scores: impl Iterator<Item = f64>) -> Vec<f64> {
    let scores: Vec<f64> = scores.collect();
    if scores.is_empty() {
        return Vec::new();
    }
    let min = scores.iter().copied().fold(f64::INFINITY, f64::min);
    let max = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    scores
        .iter()
        .map(|s| {
            if (max - min).abs() < f64::EPSILON {
                1.0
            } else {
                (s - min) / (max - min)
            }
        })
        .collect()
}

/// Tie-break order whenever scores draw: recency (newer first), then
/// ordinal, then chunk id.
fn compare_candidates(a: &RetrievedChunk, b: &RetrievedChunk) -> std::cmp::Ordering {
    b.combined_score
        .partial_cmp(&a.combined_score)
        .unwrap_or(std::cmp::Ordering::Equal)
        .then_with(|| doc_timestamp(&b.chunk).cmp(&doc_timestamp(&a.chunk)))
        .then_with(|| a.chunk.ordinal.cmp(&b.chunk.ordinal))
        .then_with(|| a.chunk.chunk_id.cmp(&b.chunk.chunk_id))
}

fn doc_timestamp(chunk: &StoredChunk) -> i64 {
    chunk
        .metadata
        .get("created_at")
        .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
        .map(|d| d.timestamp())
        .unwrap_or(0)
}

/// Greedy maximal-marginal-relevance selection:
/// `argmax λ·combined − (1−λ)·max_sim_to_selected`, using the chunk
/// embeddings already fetched. Candidates without embeddings are deferred
/// to the last slots. The output is a permutation of a subset of the
/// input, truncated to `top_k`.
fn mmr_select(
    candidates: Vec<RetrievedChunk>,
    lambda: f64,
    top_k: usize,
) -> Vec<RetrievedChunk> {
    let (mut embedded, deferred): (Vec<RetrievedChunk>, Vec<RetrievedChunk>) = candidates
        .into_iter()
        .partition(|c| c.chunk.embedding.is_some());

    let mut selected: Vec<RetrievedChunk> = Vec::new();

    while selected.len() < top_k && !embedded.is_empty() {
        let mut best_idx = 0;
        let mut best_score = f64::NEG_INFINITY;
        for (idx, candidate) in embedded.iter().enumerate() {
            let max_sim = selected
                .iter()
                .filter_map(|s| {
                    let a = candidate.chunk.embedding.as_ref()?;
                    let b = s.chunk.embedding.as_ref()?;
                    Some(cosine_similarity(a, b) as f64)
                })
                .fold(0.0f64, f64::max);
            let mmr = lambda * candidate.combined_score - (1.0 - lambda) * max_sim;
            if mmr > best_score + f64::EPSILON {
                best_score = mmr;
                best_idx = idx;
            }
        }
        selected.push(embedded.remove(best_idx));
    }

    for candidate in deferred {
        if selected.len() >= top_k {
            break;
        }
        selected.push(candidate);
    }
    selected
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn candidate(id: &str, score: f64, embedding: Option<Vec<f32>>) -> RetrievedChunk {
        RetrievedChunk {
            chunk: StoredChunk {
                chunk_id: id.to_string(),
                doc_id: id.split(':').next().unwrap_or("d").to_string(),
                ordinal: id
                    .split(':')
                    .nth(1)
                    .and_then(|o| o.parse().ok())
                    .unwrap_or(0),
                kind: crate::models::ChunkKind::Paragraph,
                section_path: vec![],
                text: format!("text for {id}"),
                token_estimate: 4,
                metadata: BTreeMap::new(),
                embedding,
            },
            combined_score: score,
            provenance: Provenance::Dense,
        }
    }

    #[test]
    fn normalize_maps_to_unit_interval() {
        let n = min_max_normalize([10.0, 5.0, 0.0].into_iter());
        assert!((n[0] - 1.0).abs() < 1e-9);
        assert!((n[1] - 0.5).abs() < 1e-9);
        assert!((n[2] - 0.0).abs() < 1e-9);
    }

    #[test]
    fn normalize_constant_scores_become_one() {
        let n = min_max_normalize([3.0, 3.0].into_iter());
        assert!(n.iter().all(|v| (*v - 1.0).abs() < 1e-9));
        assert!(min_max_normalize(std::iter::empty()).is_empty());
    }

    #[test]
    fn mmr_is_a_truncated_permutation() {
        let input = vec![
            candidate("d1:0", 0.9, Some(vec![1.0, 0.0])),
            candidate("d1:1", 0.8, Some(vec![0.9, 0.1])),
            candidate("d2:0", 0.7, Some(vec![0.0, 1.0])),
        ];
        let ids: Vec<String> = input.iter().map(|c| c.chunk.chunk_id.clone()).collect();
        let selected = mmr_select(input, 0.5, 2);
        assert_eq!(selected.len(), 2);
        // No duplicates, all drawn from the input.
        let mut seen = std::collections::HashSet::new();
        for s in &selected {
            assert!(ids.contains(&s.chunk.chunk_id));
            assert!(seen.insert(s.chunk.chunk_id.clone()));
        }
    }

    #[test]
    fn mmr_prefers_diversity_over_redundancy() {
        // Two near-identical top candidates and one diverse candidate:
        // with λ=0.5 the diverse one must enter before the duplicate.
        let input = vec![
            candidate("d1:0", 1.0, Some(vec![1.0, 0.0])),
            candidate("d1:1", 0.95, Some(vec![1.0, 0.001])),
            candidate("d2:0", 0.6, Some(vec![0.0, 1.0])),
        ];
        let selected = mmr_select(input, 0.5, 2);
        assert_eq!(selected[0].chunk.chunk_id, "d1:0");
        assert_eq!(selected[1].chunk.chunk_id, "d2:0");
    }

    #[test]
    fn mmr_defers_unembedded_candidates() {
        let input = vec![
            candidate("d1:0", 0.99, None),
            candidate("d2:0", 0.5, Some(vec![1.0, 0.0])),
        ];
        let selected = mmr_select(input, 0.5, 2);
        assert_eq!(selected[0].chunk.chunk_id, "d2:0");
        assert_eq!(selected[1].chunk.chunk_id, "d1:0");
    }

    #[test]
    fn tie_breaks_prefer_recent_then_ordinal_then_id() {
        let mut a = candidate("d1:1", 0.5, None);
        let mut b = candidate("d1:0", 0.5, None);
        a.chunk
            .metadata
            .insert("created_at".into(), "2026-01-01T00:00:00+00:00".into());
        b.chunk
            .metadata
            .insert("created_at".into(), "2026-02-01T00:00:00+00:00".into());
        // More recent document wins even with a higher ordinal elsewhere.
        assert_eq!(compare_candidates(&b, &a), std::cmp::Ordering::Less);

        let c = candidate("d1:0", 0.5, None);
        let d = candidate("d1:1", 0.5, None);
        assert_eq!(compare_candidates(&c, &d), std::cmp::Ordering::Less);
    }
}
