//! Confidence gating and answer synthesis.
//!
//! The gate inspects the reranked shortlist before any model call:
//! coverage is the number of candidates scoring above τ, and both coverage
//! and the top score must clear their minimums or the operation returns
//! `insufficient_evidence` — with the failed candidates, and without
//! spending a single token on synthesis.
//!
//! Synthesis builds a prompt of numbered context blocks (section path and
//! document id included), demands citations by block number, and demands
//! refusal when the evidence does not answer the question.

use regex::Regex;
use std::sync::OnceLock;

use crate::config::GateConfig;
use crate::error::Result;
use crate::llm::LlmRouter;
use crate::models::{AnswerOutcome, SearchHit};
use crate::rerank::RerankedChunk;

/// Outcome of the coverage/top-score check.
#[derive(Debug, Clone, Copy)]
pub struct GateDecision {
    pub passed: bool,
    pub coverage: usize,
    pub top: f64,
}

/// Evaluate the confidence gate over rerank scores.
pub fn evaluate_gate(config: &GateConfig, scores: &[f64]) -> GateDecision {
    let coverage = scores.iter().filter(|s| **s > config.tau).count();
    let top = scores.iter().copied().fold(0.0f64, f64::max);
    GateDecision {
        passed: coverage >= config.min_coverage && top >= config.min_top,
        coverage,
        top,
    }
}

/// Render reranked candidates as search hits.
pub fn to_search_hits(candidates: &[RerankedChunk], with_rerank: bool) -> Vec<SearchHit> {
    candidates
        .iter()
        .map(|c| SearchHit {
            chunk_id: c.retrieved.chunk.chunk_id.clone(),
            doc_id: c.retrieved.chunk.doc_id.clone(),
            section_path: c.retrieved.chunk.section_path.clone(),
            snippet: snippet(&c.retrieved.chunk.text),
            combined_score: c.retrieved.combined_score,
            rerank_score: with_rerank.then_some(c.rerank_score),
            provenance: c.retrieved.provenance,
        })
        .collect()
}

fn snippet(text: &str) -> String {
    const SNIPPET_CHARS: usize = 240;
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.len() <= SNIPPET_CHARS {
        return flat;
    }
    let mut end = SNIPPET_CHARS;
    while end > 0 && !flat.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &flat[..end])
}

/// Build the synthesis prompt from the question and the gated shortlist.
pub fn build_synthesis_prompt(question: &str, candidates: &[RerankedChunk]) -> String {
    let mut blocks = String::new();
    for (i, c) in candidates.iter().enumerate() {
        let section = if c.retrieved.chunk.section_path.is_empty() {
            String::from("(document root)")
        } else {
            c.retrieved.chunk.section_path.join(" > ")
        };
        blocks.push_str(&format!(
            "[{}] (doc {}, section: {})\n{}\n\n",
            i + 1,
            c.retrieved.chunk.doc_id,
            section,
            c.retrieved.chunk.text.trim()
        ));
    }

    format!(
        r#"Answer the question using ONLY the numbered context blocks below.

Rules:
- Cite every claim with the block number in square brackets, e.g. [2].
- If the blocks do not contain the answer, reply exactly: "I don't have enough evidence to answer that." and cite nothing.
- Do not use outside knowledge.

Question: {question}

Context:
{blocks}"#
    )
}

/// Block numbers cited in the answer text, mapped back to chunk ids.
pub fn parse_citations(answer_text: &str, candidates: &[RerankedChunk]) -> Vec<String> {
    static CITATION: OnceLock<Regex> = OnceLock::new();
    let re = CITATION.get_or_init(|| Regex::new(r"\[(\d+)\]").unwrap());
    let mut cited = Vec::new();
    for caps in re.captures_iter(answer_text) {
        if let Ok(n) = caps[1].parse::<usize>() {
            if n >= 1 {
                if let Some(c) = candidates.get(n - 1) {
                    let id = c.retrieved.chunk.chunk_id.clone();
                    if !cited.contains(&id) {
                        cited.push(id);
                    }
                }
            }
        }
    }
    cited
}

/// Gate, then synthesize. `candidates` must already be reranked
/// (descending). The gate refusal path never touches the router.
pub async fn synthesize(
    router: &LlmRouter,
    gate: &GateConfig,
    model: Option<&str>,
    question: &str,
    candidates: Vec<RerankedChunk>,
    max_blocks: usize,
) -> Result<AnswerOutcome> {
    let scores: Vec<f64> = candidates.iter().map(|c| c.rerank_score).collect();
    let decision = evaluate_gate(gate, &scores);
    if !decision.passed {
        return Ok(AnswerOutcome::InsufficientEvidence {
            candidates: to_search_hits(&candidates, true),
        });
    }

    let shortlist: Vec<RerankedChunk> = candidates.into_iter().take(max_blocks).collect();
    let prompt = build_synthesis_prompt(question, &shortlist);
    let reply = router.call("synthesis", &prompt, model, 0.2, 1024).await?;
    let citations = parse_citations(&reply.text, &shortlist);

    Ok(AnswerOutcome::Answer {
        text: reply.text,
        citations,
        cost: reply.cost,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Provenance;
    use crate::retrieve::RetrievedChunk;
    use crate::store::StoredChunk;
    use std::collections::BTreeMap;

    fn reranked(id: &str, text: &str, score: f64) -> RerankedChunk {
        RerankedChunk {
            retrieved: RetrievedChunk {
                chunk: StoredChunk {
                    chunk_id: id.into(),
                    doc_id: id.split(':').next().unwrap_or("d").into(),
                    ordinal: 0,
                    kind: crate::models::ChunkKind::Paragraph,
                    section_path: vec!["Report".into()],
                    text: text.into(),
                    token_estimate: 4,
                    metadata: BTreeMap::new(),
                    embedding: None,
                },
                combined_score: score,
                provenance: Provenance::Both,
            },
            rerank_score: score,
        }
    }

    #[test]
    fn gate_requires_coverage_and_top() {
        let config = GateConfig::default(); // tau 0.3, coverage 2, top 0.4

        let pass = evaluate_gate(&config, &[0.8, 0.5, 0.1]);
        assert!(pass.passed);
        assert_eq!(pass.coverage, 2);

        // Only one candidate above tau.
        let thin = evaluate_gate(&config, &[0.8, 0.2]);
        assert!(!thin.passed);

        // Coverage fine but no strong top.
        let weak = evaluate_gate(&config, &[0.35, 0.32, 0.31]);
        assert!(!weak.passed);

        let empty = evaluate_gate(&config, &[]);
        assert!(!empty.passed);
        assert_eq!(empty.top, 0.0);
    }

    #[test]
    fn prompt_numbers_blocks_and_demands_citations() {
        let candidates = vec![
            reranked("d1:0", "Alpha kick-off is on March first.", 0.9),
            reranked("d2:0", "The budget was approved.", 0.5),
        ];
        let prompt = build_synthesis_prompt("When is the kick-off?", &candidates);
        assert!(prompt.contains("[1] (doc d1, section: Report)"));
        assert!(prompt.contains("[2] (doc d2"));
        assert!(prompt.contains("Cite every claim"));
        assert!(prompt.contains("I don't have enough evidence"));
    }

    #[test]
    fn citations_map_to_chunk_ids() {
        let candidates = vec![
            reranked("d1:0", "a", 0.9),
            reranked("d2:0", "b", 0.5),
        ];
        let cited = parse_citations("The kick-off is March 1 [1]. Budget approved [2][1].", &candidates);
        assert_eq!(cited, vec!["d1:0".to_string(), "d2:0".to_string()]);

        // Out-of-range citations are ignored.
        let cited = parse_citations("See [7].", &candidates);
        assert!(cited.is_empty());
    }

    #[tokio::test]
    async fn failed_gate_skips_the_router_entirely() {
        // A router with zero providers errors on any call; the gate path
        // must never reach it.
        let router = crate::llm::LlmRouter::with_clients(vec![], 10.0, None);
        let outcome = synthesize(
            &router,
            &GateConfig::default(),
            None,
            "How do I configure the TLS handshake?",
            vec![reranked("d1:0", "Project Alpha kick-off.", 0.05)],
            8,
        )
        .await
        .unwrap();
        match outcome {
            AnswerOutcome::InsufficientEvidence { candidates } => {
                assert_eq!(candidates.len(), 1);
                assert_eq!(candidates[0].chunk_id, "d1:0");
            }
            other => panic!("expected insufficient evidence, got {other:?}"),
        }
        assert_eq!(router.ledger().summary().call_count, 0);
    }

    #[test]
    fn snippet_is_bounded() {
        let s = snippet(&"word ".repeat(200));
        assert!(s.len() <= 244);
        assert!(s.ends_with("..."));
    }
}
