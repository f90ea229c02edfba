//! LLM enrichment: title, summary, controlled tags, entities, key points.
//!
//! One structured call per document. The prompt inlines the closed
//! vocabulary sets and states the hard constraints (select only from the
//! lists, never fabricate entities, ignore the examples). The response is
//! parsed against a strict schema; whatever the model claims is then
//! post-validated here — unknown tags are demoted to `suggested_tags`,
//! free-text entities that are not literally present in the text are
//! dropped.
//!
//! Enrichment never fails an ingest: budget refusal or provider exhaustion
//! produce a degraded result (fallback title, empty tags, confidence 0.1)
//! and the pipeline continues.

use serde::Deserialize;
use tracing::warn;

use crate::config::EnrichmentConfig;
use crate::llm::LlmRouter;
use crate::models::{
    Block, CanonicalType, EnrichmentResult, TitleStrategy, ENRICHMENT_VERSION,
};
use crate::structure::find_iso_dates;
use crate::vocab::{contains_token, Vocabulary};

const SUMMARY_MAX_CHARS: usize = 400;
const TITLE_LOW_CONFIDENCE: f64 = 0.3;

/// Strict response schema. Unknown fields are a parse failure, which sends
/// the router down its chain.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct EnrichmentSchema {
    #[serde(default)]
    title: String,
    #[serde(default)]
    summary: String,
    #[serde(default)]
    topics: Vec<String>,
    #[serde(default)]
    projects: Vec<String>,
    #[serde(default)]
    places: Vec<String>,
    #[serde(default)]
    role_mentions: Vec<String>,
    #[serde(default)]
    organizations: Vec<String>,
    #[serde(default)]
    locations: Vec<String>,
    #[serde(default)]
    dates: Vec<String>,
    #[serde(default)]
    key_points: Vec<String>,
    #[serde(default)]
    confidence: f64,
}

/// Enrich one document. Uses a bounded prefix of the text; absorbs router
/// failures into a degraded result.
pub async fn enrich(
    router: &LlmRouter,
    vocab: &Vocabulary,
    config: &EnrichmentConfig,
    text: &str,
    doc_type: CanonicalType,
    blocks: &[Block],
    source_name: Option<&str>,
) -> EnrichmentResult {
    let prefix = truncate_chars(text, config.max_prefix_tokens * 4);
    let prompt = build_prompt(vocab, doc_type, prefix);

    let reply = router
        .call_structured::<EnrichmentSchema>(
            "enrichment",
            &prompt,
            config.model.as_deref(),
            0.0,
            1500,
        )
        .await;

    match reply {
        Ok(reply) => validate(
            reply.value,
            vocab,
            text,
            blocks,
            source_name,
            reply.model_used,
            reply.cost,
        ),
        Err(e) => {
            warn!(error = %e, "enrichment unavailable, storing degraded result");
            let (title, strategy) = fallback_title(blocks, text, source_name);
            let mut degraded = EnrichmentResult::degraded(title, strategy);
            degraded.dates = find_iso_dates(text);
            // Watchlist matching needs no model.
            degraded.projects = vocab.match_projects(text, None).into_iter().collect();
            degraded
        }
    }
}

fn build_prompt(vocab: &Vocabulary, doc_type: CanonicalType, text: &str) -> String {
    let topics = vocab.list_all_topics().join(", ");
    let projects = {
        let mut ids: Vec<&str> = vocab.iter_projects().map(|p| p.id.as_str()).collect();
        ids.sort_unstable();
        ids.join(", ")
    };
    let places = vocab.iter_places().collect::<Vec<_>>().join(", ");
    let roles = vocab.iter_roles().collect::<Vec<_>>().join(", ");

    format!(
        r#"You are a document analyst. Extract structured metadata from the document below.

Document type: {doc_type}

Respond with a single JSON object, no prose, with exactly these fields:
{{"title": string, "summary": string (at most 400 characters), "topics": [string], "projects": [string], "places": [string], "role_mentions": [string], "organizations": [string], "locations": [string], "dates": [string, ISO-8601], "key_points": [string], "confidence": number between 0 and 1}}

Hard constraints:
- Select topics ONLY from this list; if none match, return an empty list: [{topics}]
- Select projects ONLY from this list: [{projects}]
- Select places ONLY from this list: [{places}]
- Select role_mentions ONLY from this list: [{roles}]
- Do not fabricate people, organizations, or locations — only extract strings that appear verbatim in the text.
- Do not use example entries from these instructions as values to include.

Document:
---
{text}
---"#
    )
}

#[allow(clippy::too_many_arguments)]
fn validate(
    schema: EnrichmentSchema,
    vocab: &Vocabulary,
    text: &str,
    blocks: &[Block],
    source_name: Option<&str>,
    model_used: String,
    cost: f64,
) -> EnrichmentResult {
    let haystack = text.to_lowercase();
    let mut suggested_tags: Vec<String> = Vec::new();

    let mut keep_known =
        |values: Vec<String>, known: &dyn Fn(&str) -> bool| -> Vec<String> {
            let mut kept = Vec::new();
            for v in values {
                let v = v.trim().to_string();
                if v.is_empty() {
                    continue;
                }
                if known(&v) {
                    if !kept.contains(&v) {
                        kept.push(v);
                    }
                } else if !suggested_tags.contains(&v) {
                    suggested_tags.push(v);
                }
            }
            kept
        };

    let topics = keep_known(schema.topics, &|s| vocab.contains_topic(s));
    let mut projects = keep_known(schema.projects, &|s| vocab.contains_project(s));
    let places = keep_known(schema.places, &|s| vocab.contains_place(s));
    let role_mentions = keep_known(schema.role_mentions, &|s| vocab.contains_role(s));

    // Watchlist auto-match is unioned in regardless of what the model said.
    for id in vocab.match_projects(text, None) {
        if !projects.contains(&id) {
            projects.push(id);
        }
    }
    projects.sort_unstable();

    // Free-text entities must occur verbatim (case-insensitive whole word).
    let literally_present = |v: &String| contains_token(&haystack, &v.to_lowercase());
    let organizations: Vec<String> = schema
        .organizations
        .into_iter()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .filter(literally_present)
        .collect();
    let locations_free: Vec<String> = schema
        .locations
        .into_iter()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .filter(literally_present)
        .collect();

    // Model dates must be well-formed; dates literally in the text are
    // always included.
    let mut dates: Vec<String> = schema
        .dates
        .into_iter()
        .filter(|d| chrono::NaiveDate::parse_from_str(d, "%Y-%m-%d").is_ok())
        .collect();
    for d in find_iso_dates(text) {
        if !dates.contains(&d) {
            dates.push(d);
        }
    }

    let confidence = schema.confidence.clamp(0.0, 1.0);

    let (title, title_strategy) = {
        let model_title = schema.title.trim().to_string();
        if model_title.is_empty() || confidence < TITLE_LOW_CONFIDENCE {
            fallback_title(blocks, text, source_name)
        } else {
            (model_title, TitleStrategy::Model)
        }
    };

    EnrichmentResult {
        title,
        title_strategy,
        summary: truncate_chars(&schema.summary, SUMMARY_MAX_CHARS).trim().to_string(),
        topics,
        projects,
        places,
        role_mentions,
        suggested_tags,
        organizations,
        locations_free,
        dates,
        key_points: schema
            .key_points
            .into_iter()
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .collect(),
        confidence,
        source_model_id: Some(model_used),
        cost,
        degraded: false,
        schema_version: ENRICHMENT_VERSION,
    }
}

/// Title fallback chain: first heading with ≥3 words, first sentence ≤120
/// chars, normalized filename stem, then a literal placeholder.
pub fn fallback_title(
    blocks: &[Block],
    text: &str,
    source_name: Option<&str>,
) -> (String, TitleStrategy) {
    for block in blocks {
        if let Block::Heading { text, .. } = block {
            if text.split_whitespace().count() >= 3 {
                return (text.clone(), TitleStrategy::FirstHeading);
            }
        }
    }

    if let Some(sentence) = first_sentence(text) {
        if sentence.len() <= 120 {
            return (sentence, TitleStrategy::FirstSentence);
        }
    }

    if let Some(name) = source_name {
        let stem = name
            .rsplit('/')
            .next()
            .unwrap_or(name)
            .rsplit_once('.')
            .map(|(stem, _)| stem)
            .unwrap_or(name);
        let normalized = stem
            .replace(['_', '-'], " ")
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ");
        if !normalized.is_empty() {
            return (normalized, TitleStrategy::FilenameStem);
        }
    }

    ("Untitled document".to_string(), TitleStrategy::Fallback)
}

fn first_sentence(text: &str) -> Option<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    let end = trimmed
        .char_indices()
        .find(|(_, c)| matches!(c, '.' | '!' | '?' | '\n'))
        .map(|(i, _)| i)
        .unwrap_or(trimmed.len());
    let sentence = trimmed[..end].trim().to_string();
    if sentence.is_empty() {
        None
    } else {
        Some(sentence)
    }
}

fn truncate_chars(text: &str, max_chars: usize) -> &str {
    if text.len() <= max_chars {
        return text;
    }
    let mut end = max_chars;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderConfig;
    use crate::llm::{ChatClient, ChatCompletion};
    use crate::vocab::Project;
    use async_trait::async_trait;
    use std::sync::Arc;

    fn vocab() -> Vocabulary {
        Vocabulary::from_parts(
            vec!["ai/ml".into(), "finance".into()],
            vec![Project {
                id: "project-alpha".into(),
                keywords: vec!["alpha".into()],
                start: None,
                end: None,
            }],
            vec!["Berlin".into()],
            vec!["presenter".into()],
        )
    }

    struct ScriptedClient {
        reply: String,
    }

    #[async_trait]
    impl ChatClient for ScriptedClient {
        async fn complete(
            &self,
            _model: &str,
            _prompt: &str,
            _temperature: f32,
            _max_tokens: u32,
        ) -> anyhow::Result<ChatCompletion> {
            Ok(ChatCompletion {
                text: self.reply.clone(),
                input_tokens: 100,
                output_tokens: 50,
            })
        }
    }

    fn router_with_reply(reply: &str) -> LlmRouter {
        LlmRouter::with_clients(
            vec![(
                ProviderConfig {
                    name: "scripted".into(),
                    endpoint: "http://localhost:0".into(),
                    api_key_env: None,
                    model: "test-model".into(),
                    input_price: 0.0,
                    output_price: 0.0,
                    rpm: 0,
                },
                Arc::new(ScriptedClient {
                    reply: reply.into(),
                }) as Arc<dyn ChatClient>,
            )],
            10.0,
            None,
        )
        .with_max_attempts(1)
    }

    #[test]
    fn prompt_states_hard_constraints() {
        let prompt = build_prompt(&vocab(), CanonicalType::Text, "body");
        assert!(prompt.contains("ONLY from this list"));
        assert!(prompt.contains("Do not fabricate"));
        assert!(prompt.contains("ai/ml, finance"));
        assert!(prompt.contains("project-alpha"));
    }

    #[tokio::test]
    async fn unknown_topics_become_suggested_tags() {
        let reply = r#"{"title": "Alpha kick-off", "summary": "s", "topics": ["ai/ml", "blockchain"], "projects": [], "places": [], "role_mentions": [], "organizations": [], "locations": [], "dates": [], "key_points": [], "confidence": 0.9}"#;
        let router = router_with_reply(reply);
        let result = enrich(
            &router,
            &vocab(),
            &EnrichmentConfig::default(),
            "Project Alpha kick-off",
            CanonicalType::Text,
            &[],
            None,
        )
        .await;
        assert_eq!(result.topics, vec!["ai/ml"]);
        assert_eq!(result.suggested_tags, vec!["blockchain"]);
        assert!(!result.degraded);
        assert_eq!(result.source_model_id.as_deref(), Some("test-model"));
    }

    #[tokio::test]
    async fn fabricated_entities_are_dropped() {
        let reply = r#"{"title": "t", "summary": "", "topics": [], "projects": [], "places": [], "role_mentions": [], "organizations": ["Acme Corp", "Globex"], "locations": ["Narnia"], "dates": [], "key_points": [], "confidence": 0.8}"#;
        let router = router_with_reply(reply);
        let result = enrich(
            &router,
            &vocab(),
            &EnrichmentConfig::default(),
            "Meeting with Acme Corp about the rollout.",
            CanonicalType::Text,
            &[],
            None,
        )
        .await;
        assert_eq!(result.organizations, vec!["Acme Corp"]);
        assert!(result.locations_free.is_empty());
    }

    #[tokio::test]
    async fn watchlist_projects_are_auto_matched() {
        let reply = r#"{"title": "t", "summary": "", "topics": [], "projects": [], "places": [], "role_mentions": [], "organizations": [], "locations": [], "dates": [], "key_points": [], "confidence": 0.9}"#;
        let router = router_with_reply(reply);
        let result = enrich(
            &router,
            &vocab(),
            &EnrichmentConfig::default(),
            "The alpha rollout starts 2026-03-01.",
            CanonicalType::Text,
            &[],
            None,
        )
        .await;
        assert_eq!(result.projects, vec!["project-alpha"]);
        assert_eq!(result.dates, vec!["2026-03-01"]);
    }

    #[tokio::test]
    async fn no_providers_degrades() {
        let router = LlmRouter::with_clients(vec![], 10.0, None);
        let result = enrich(
            &router,
            &vocab(),
            &EnrichmentConfig::default(),
            "Some alpha text mentioning 2026-05-01.",
            CanonicalType::Text,
            &[],
            Some("notes/budget-plan.md"),
        )
        .await;
        assert!(result.degraded);
        assert!((result.confidence - 0.1).abs() < 1e-9);
        assert!(result.topics.is_empty());
        // Watchlist matching still works without a model.
        assert_eq!(result.projects, vec!["project-alpha"]);
        assert_eq!(result.dates, vec!["2026-05-01"]);
    }

    #[test]
    fn title_fallback_chain() {
        let heading_blocks = vec![Block::Heading {
            level: 1,
            text: "Quarterly Budget Review".into(),
        }];
        let (title, strategy) = fallback_title(&heading_blocks, "irrelevant", None);
        assert_eq!(title, "Quarterly Budget Review");
        assert_eq!(strategy, TitleStrategy::FirstHeading);

        // Heading with fewer than three words is skipped.
        let short_heading = vec![Block::Heading {
            level: 1,
            text: "Budget".into(),
        }];
        let (title, strategy) =
            fallback_title(&short_heading, "The plan is ready. More text.", None);
        assert_eq!(title, "The plan is ready");
        assert_eq!(strategy, TitleStrategy::FirstSentence);

        let long = "x".repeat(300);
        let (title, strategy) = fallback_title(&[], &long, Some("docs/q3_budget-plan.md"));
        assert_eq!(title, "q3 budget plan");
        assert_eq!(strategy, TitleStrategy::FilenameStem);

        let (title, strategy) = fallback_title(&[], &long, None);
        assert_eq!(title, "Untitled document");
        assert_eq!(strategy, TitleStrategy::Fallback);
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let s = "héllo wörld";
        let t = truncate_chars(s, 3);
        assert!(t.len() <= 3);
        assert!(s.starts_with(t));
    }
}
