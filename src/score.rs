//! Quality, novelty, actionability, and the indexing gate.
//!
//! The combined formula is fixed and tested:
//! `signalness = 0.4·quality + 0.3·novelty + 0.3·actionability`.
//! A document is indexed only when its quality and signalness both clear
//! the per-type gate thresholds.

use chrono::NaiveDate;

use crate::config::ScoringConfig;
use crate::embedding::cosine_similarity;
use crate::models::{Block, CanonicalType, ScoreBundle};

fn clamp01(v: f64) -> f64 {
    v.clamp(0.0, 1.0)
}

/// Quality: equally weighted mean of extraction success, structural
/// richness, length band, and OCR confidence (1.0 when OCR never ran).
pub fn quality_score(
    text: &str,
    blocks: &[Block],
    ocr_confidence: Option<f64>,
    ocr_fallback: bool,
) -> f64 {
    let extraction_success = if ocr_fallback {
        0.5
    } else if text.trim().len() >= 50 {
        1.0
    } else {
        0.0
    };

    let structural_richness = structural_richness(blocks);
    let length_band = length_band(word_count(text));
    let ocr = ocr_confidence.map_or(1.0, clamp01);

    clamp01((extraction_success + structural_richness + length_band + ocr) / 4.0)
}

fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

fn structural_richness(blocks: &[Block]) -> f64 {
    let has_structure = blocks.iter().any(|b| {
        matches!(
            b,
            Block::Heading { .. } | Block::Table { .. } | Block::List { .. }
        )
    });
    if has_structure {
        return 1.0;
    }
    let paragraphs = blocks
        .iter()
        .filter(|b| matches!(b, Block::Paragraph { .. }))
        .count();
    if paragraphs >= 2 {
        0.5
    } else {
        0.2
    }
}

/// 1.0 inside [200, 20000] words, linear decay outside.
fn length_band(words: usize) -> f64 {
    const LOW: f64 = 200.0;
    const HIGH: f64 = 20_000.0;
    let w = words as f64;
    if w < LOW {
        clamp01(w / LOW)
    } else if w > HIGH {
        clamp01(1.0 - (w - HIGH) / HIGH)
    } else {
        1.0
    }
}

/// Novelty: 1 − the maximum cosine similarity between this document's
/// summary embedding and any existing one. An empty corpus (or a missing
/// embedding) scores 1.
pub fn novelty_score(summary_embedding: Option<&[f32]>, existing: &[(String, Vec<f32>)]) -> f64 {
    let Some(vector) = summary_embedding else {
        return 1.0;
    };
    let max_similarity = existing
        .iter()
        .map(|(_, other)| cosine_similarity(vector, other) as f64)
        .fold(f64::NEG_INFINITY, f64::max);
    if max_similarity.is_finite() {
        clamp01(1.0 - max_similarity)
    } else {
        1.0
    }
}

/// Actionability: watchlist density, a project-match bonus, and a
/// future-dated-event bonus, capped at 1.
pub fn actionability_score(
    watchlist_hits: usize,
    project_matched: bool,
    future_event: bool,
) -> f64 {
    let hits = watchlist_hits.min(5) as f64;
    let project_bonus = if project_matched { 0.3 } else { 0.0 };
    let event_bonus = if future_event { 0.3 } else { 0.0 };
    (0.4 * hits / 5.0 + project_bonus + event_bonus).min(1.0)
}

/// Whether any extracted ISO date lies strictly after `today`.
pub fn has_future_event(dates: &[String], today: NaiveDate) -> bool {
    dates
        .iter()
        .filter_map(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
        .any(|d| d > today)
}

/// The exact combined formula.
pub fn signalness(quality: f64, novelty: f64, actionability: f64) -> f64 {
    0.4 * quality + 0.3 * novelty + 0.3 * actionability
}

pub fn bundle(quality: f64, novelty: f64, actionability: f64) -> ScoreBundle {
    ScoreBundle {
        quality,
        novelty,
        actionability,
        signalness: signalness(quality, novelty, actionability),
    }
}

/// The per-type gate: index only when both thresholds are met.
pub fn gate_decision(config: &ScoringConfig, doc_type: CanonicalType, scores: &ScoreBundle) -> bool {
    let gate = config.gate_for(doc_type);
    scores.quality >= gate.min_quality && scores.signalness >= gate.min_signal
}
