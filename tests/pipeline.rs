//! End-to-end pipeline scenarios: ingest, dedup, gating, chunk storage,
//! hybrid search, the confidence gate, and answer synthesis — driven
//! through the library API with the hash embedder and a scripted LLM
//! transport.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use docsift::config::{self, Config, ProviderConfig};
use docsift::context::{AppContext, CancelFlag, SearchOptions};
use docsift::ingest::{ingest_bytes, IngestOptions};
use docsift::llm::{ChatClient, ChatCompletion, LlmRouter};
use docsift::models::AnswerOutcome;

const S1_BYTES: &[u8] = b"Project Alpha kick-off on 2026-03-01 in Berlin. Daniel will present.";

const VOCAB_YAML: &str = r#"
topics:
  - events
  - ai/ml
projects:
  - id: project-alpha
    keywords: [alpha, kick-off]
places:
  - Berlin
roles:
  - presenter
"#;

const ENRICHMENT_JSON: &str = r#"{
  "title": "Project Alpha Kick-off",
  "summary": "Project Alpha kick-off in Berlin on March 1.",
  "topics": ["events"],
  "projects": ["project-alpha"],
  "places": ["Berlin"],
  "role_mentions": ["presenter"],
  "organizations": [],
  "locations": [],
  "dates": ["2026-03-01"],
  "key_points": ["Kick-off scheduled", "Daniel presents"],
  "confidence": 0.9
}"#;

struct ScriptedClient;

#[async_trait]
impl ChatClient for ScriptedClient {
    async fn complete(
        &self,
        _model: &str,
        prompt: &str,
        _temperature: f32,
        _max_tokens: u32,
    ) -> anyhow::Result<ChatCompletion> {
        let text = if prompt.contains("Cite every claim") {
            "The kick-off is on 2026-03-01 in Berlin [1].".to_string()
        } else {
            ENRICHMENT_JSON.to_string()
        };
        Ok(ChatCompletion {
            text,
            input_tokens: 500,
            output_tokens: 100,
        })
    }
}

fn scripted_router(daily_budget: f64) -> LlmRouter {
    LlmRouter::with_clients(
        vec![(
            ProviderConfig {
                name: "scripted".into(),
                endpoint: "http://localhost:0".into(),
                api_key_env: None,
                model: "test-model".into(),
                input_price: 1.0,
                output_price: 2.0,
                rpm: 0,
            },
            Arc::new(ScriptedClient) as Arc<dyn ChatClient>,
        )],
        daily_budget,
        None,
    )
    .with_max_attempts(1)
}

fn write_config(root: &Path) -> Config {
    std::fs::write(root.join("vocab.yaml"), VOCAB_YAML).unwrap();
    let toml = format!(
        r#"
[db]
path = "{root}/sift.sqlite"

[vocabulary]
path = "{root}/vocab.yaml"

[embedding]
provider = "hash"
dims = 128

[export]
enabled = true
root = "{root}/vault"

[scoring.gates.text]
min_quality = 0.5
min_signal = 0.4
"#,
        root = root.display()
    );
    let path = root.join("sift.toml");
    std::fs::write(&path, toml).unwrap();
    config::load_config(&path).unwrap()
}

async fn test_context(root: &Path) -> AppContext {
    let config = write_config(root);
    AppContext::init(config)
        .await
        .unwrap()
        .with_router(scripted_router(10.0))
}

#[tokio::test]
async fn s1_minimal_text_ingest_and_search() {
    let tmp = tempfile::tempdir().unwrap();
    let ctx = test_context(tmp.path()).await;

    let receipts = ingest_bytes(
        &ctx,
        S1_BYTES,
        Some("note.txt"),
        &IngestOptions::default(),
        &CancelFlag::new(),
    )
    .await
    .unwrap();
    assert_eq!(receipts.len(), 1);
    let receipt = &receipts[0];

    assert!(receipt.do_index, "scores: {:?}", receipt.scores);
    assert!(receipt.scores.quality >= 0.5);
    assert_eq!(receipt.chunk_count, 1);

    // Enrichment tags are drawn from the vocabulary only.
    let vocab = ctx.vocab();
    for topic in &receipt.enrichment.topics {
        assert!(vocab.contains_topic(topic));
    }
    assert!(receipt.enrichment.projects.contains(&"project-alpha".to_string()));
    assert!(receipt.enrichment.places.contains(&"Berlin".to_string()));

    // Signalness is exactly the weighted combination.
    let s = &receipt.scores;
    assert!(
        (s.signalness - (0.4 * s.quality + 0.3 * s.novelty + 0.3 * s.actionability)).abs()
            < 1e-6
    );

    // The canonical export exists and records the decision.
    let export = receipt.export_path.as_ref().expect("export path");
    let rendered = std::fs::read_to_string(export).unwrap();
    assert!(rendered.contains("do_index: true"));
    assert!(rendered.contains("content_hash:"));

    // Search finds the chunk with a non-zero rerank score.
    let hits = ctx
        .search("kick-off", &SearchOptions::new())
        .await
        .unwrap();
    assert!(!hits.is_empty());
    assert_eq!(hits[0].chunk_id, format!("{}:0", receipt.doc_id));
    assert!(hits[0].rerank_score.unwrap() > 0.0);
}

#[tokio::test]
async fn s2_exact_duplicate_is_rejected_and_store_unchanged() {
    let tmp = tempfile::tempdir().unwrap();
    let ctx = test_context(tmp.path()).await;
    let options = IngestOptions::default();
    let cancel = CancelFlag::new();

    let first = ingest_bytes(&ctx, S1_BYTES, Some("note.txt"), &options, &cancel)
        .await
        .unwrap();
    let first_id = first[0].doc_id.clone();
    let chunks_before = ctx.store.count_chunks().await.unwrap();

    let err = ingest_bytes(&ctx, S1_BYTES, Some("note.txt"), &options, &cancel)
        .await
        .unwrap_err();
    match err {
        docsift::error::SiftError::Duplicate { of } => assert_eq!(of, first_id),
        other => panic!("expected duplicate, got {other:?}"),
    }
    assert_eq!(ctx.store.count_chunks().await.unwrap(), chunks_before);
    assert_eq!(ctx.store.count_documents().await.unwrap(), 1);
}

#[tokio::test]
async fn s3_near_duplicate_is_advisory_and_overridable() {
    let tmp = tempfile::tempdir().unwrap();
    let ctx = test_context(tmp.path()).await;
    let options = IngestOptions::default();
    let cancel = CancelFlag::new();

    let first = ingest_bytes(&ctx, S1_BYTES, Some("note.txt"), &options, &cancel)
        .await
        .unwrap();
    let first_id = first[0].doc_id.clone();

    // Trailing space and a punctuation swap: superficially different.
    let variant = b"Project Alpha kick-off on 2026-03-01 in Berlin. Daniel will present! ";
    let err = ingest_bytes(&ctx, variant, Some("note2.txt"), &options, &cancel)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "near_duplicate");

    let overridden = ingest_bytes(
        &ctx,
        variant,
        Some("note2.txt"),
        &IngestOptions {
            override_near_dup: true,
            ..Default::default()
        },
        &cancel,
    )
    .await
    .unwrap();
    assert_ne!(overridden[0].doc_id, first_id);
    assert_eq!(overridden[0].near_duplicate_of.as_deref(), Some(first_id.as_str()));
    assert_eq!(ctx.store.count_documents().await.unwrap(), 2);
}

#[tokio::test]
async fn s4_low_signal_document_is_gated_out_but_exported() {
    let tmp = tempfile::tempdir().unwrap();
    let ctx = test_context(tmp.path()).await;

    let receipts = ingest_bytes(
        &ctx,
        b"                    ok.",
        Some("scrap.txt"),
        &IngestOptions::default(),
        &CancelFlag::new(),
    )
    .await
    .unwrap();
    let receipt = &receipts[0];

    assert!(!receipt.do_index);
    assert_eq!(receipt.chunk_count, 0);
    assert_eq!(ctx.store.count_chunks().await.unwrap(), 0);

    // Export is still emitted, with the gate decision in the header.
    let export = receipt.export_path.as_ref().expect("export path");
    let rendered = std::fs::read_to_string(export).unwrap();
    assert!(rendered.contains("do_index: false"));
}

#[tokio::test]
async fn s5_structure_aware_chunking_via_ingest() {
    let tmp = tempfile::tempdir().unwrap();
    let ctx = test_context(tmp.path()).await;

    let markdown = br#"# Report

## Intro

First intro paragraph.

Second intro paragraph.

Third intro paragraph.

| col_a | col_b |
|-------|-------|
| 1     | 2     |
| 3     | 4     |
| 5     | 6     |
| 7     | 8     |
| 9     | 10    |

## Methods

First methods paragraph.

Second methods paragraph.

Third methods paragraph.

```rust
fn line_0() {}
fn line_1() {}
fn line_2() {}
```
"#;
    let receipts = ingest_bytes(
        &ctx,
        markdown,
        Some("report.md"),
        &IngestOptions {
            force_reindex: true,
            ..Default::default()
        },
        &CancelFlag::new(),
    )
    .await
    .unwrap();
    let receipt = &receipts[0];
    assert_eq!(receipt.chunk_count, 4);

    let stored = ctx.store.scan_chunks().await.unwrap();
    assert_eq!(stored.len(), 4);
    let kinds: Vec<&str> = stored.iter().map(|c| c.kind.as_str()).collect();
    assert_eq!(
        kinds,
        vec!["heading_section", "table", "heading_section", "code"]
    );
    assert_eq!(stored[0].section_path, vec!["Report", "Intro"]);
    assert_eq!(stored[2].section_path, vec!["Report", "Methods"]);
}

#[tokio::test]
async fn s6_confidence_gate_refuses_without_spending() {
    let tmp = tempfile::tempdir().unwrap();
    let ctx = test_context(tmp.path()).await;
    ingest_bytes(
        &ctx,
        S1_BYTES,
        Some("note.txt"),
        &IngestOptions::default(),
        &CancelFlag::new(),
    )
    .await
    .unwrap();

    let calls_before = ctx.router.ledger().summary().call_count;
    let outcome = ctx
        .answer(
            "How do I configure the TLS handshake?",
            &SearchOptions::new(),
            None,
        )
        .await
        .unwrap();

    match outcome {
        AnswerOutcome::InsufficientEvidence { candidates } => {
            assert!(!candidates.is_empty());
        }
        other => panic!("expected insufficient evidence, got {other:?}"),
    }
    // No synthesis call was made: the ledger is unchanged.
    assert_eq!(ctx.router.ledger().summary().call_count, calls_before);
}

#[tokio::test]
async fn answer_cites_context_blocks_when_evidence_is_strong() {
    let tmp = tempfile::tempdir().unwrap();
    let ctx = test_context(tmp.path()).await;
    ingest_bytes(
        &ctx,
        S1_BYTES,
        Some("note.txt"),
        &IngestOptions::default(),
        &CancelFlag::new(),
    )
    .await
    .unwrap();

    // One strong candidate is not enough coverage (min_coverage 2). Add a
    // second relevant document; its novelty is near zero (the scripted
    // enrichment reuses the same summary), so force it past the gate.
    ingest_bytes(
        &ctx,
        b"Alpha kick-off agenda: Daniel will present the roadmap in Berlin on 2026-03-01.",
        Some("agenda.txt"),
        &IngestOptions {
            force_reindex: true,
            override_near_dup: true,
            skip_export: false,
        },
        &CancelFlag::new(),
    )
    .await
    .unwrap();

    let outcome = ctx
        .answer("When is the Alpha kick-off in Berlin?", &SearchOptions::new(), None)
        .await
        .unwrap();
    match outcome {
        AnswerOutcome::Answer {
            text,
            citations,
            cost,
        } => {
            assert!(text.contains("[1]"));
            assert!(!citations.is_empty());
            assert!(citations[0].contains(':'));
            assert!(cost > 0.0);
        }
        other => panic!("expected an answer, got {other:?}"),
    }

    // A synthesis record joined the enrichment records in the ledger.
    let records = ctx.router.ledger().records();
    assert!(records.iter().any(|r| r.operation == "synthesis"));
    assert!(records.iter().any(|r| r.operation == "enrichment"));
}

#[tokio::test]
async fn ignored_content_is_never_indexed_or_retrieved() {
    let tmp = tempfile::tempdir().unwrap();
    let ctx = test_context(tmp.path()).await;

    let bytes = br#"# Visible section

Visible paragraph about quarterly planning and roadmaps for the team.

<!-- IGNORE -->
zebrafish watermark hidden payload
<!-- /IGNORE -->
"#;
    let receipts = ingest_bytes(
        &ctx,
        bytes,
        Some("mixed.md"),
        &IngestOptions {
            force_reindex: true,
            ..Default::default()
        },
        &CancelFlag::new(),
    )
    .await
    .unwrap();

    // Only the visible chunk is stored.
    assert_eq!(receipts[0].chunk_count, 1);
    let stored = ctx.store.scan_chunks().await.unwrap();
    assert!(stored.iter().all(|c| !c.text.contains("zebrafish")));

    let hits = ctx
        .search("zebrafish watermark", &SearchOptions::new())
        .await
        .unwrap();
    assert!(
        hits.iter().all(|h| !h.snippet.contains("zebrafish")),
        "ignored content leaked into retrieval"
    );
}

#[tokio::test]
async fn all_ignored_document_stores_zero_chunks() {
    let tmp = tempfile::tempdir().unwrap();
    let ctx = test_context(tmp.path()).await;

    let bytes = b"<!-- IGNORE -->\nonly hidden text\n<!-- /IGNORE -->\n";
    let receipts = ingest_bytes(
        &ctx,
        bytes,
        Some("hidden.md"),
        &IngestOptions::default(),
        &CancelFlag::new(),
    )
    .await
    .unwrap();
    assert!(!receipts[0].do_index);
    assert_eq!(receipts[0].chunk_count, 0);
    assert_eq!(ctx.store.count_chunks().await.unwrap(), 0);
}

#[tokio::test]
async fn zero_budget_degrades_enrichment_but_stores_the_document() {
    let tmp = tempfile::tempdir().unwrap();
    let config = write_config(tmp.path());
    let ctx = AppContext::init(config)
        .await
        .unwrap()
        .with_router(scripted_router(0.0));

    let receipts = ingest_bytes(
        &ctx,
        S1_BYTES,
        Some("note.txt"),
        &IngestOptions::default(),
        &CancelFlag::new(),
    )
    .await
    .unwrap();
    let receipt = &receipts[0];

    assert!(receipt.enrichment.degraded);
    assert!(receipt.enrichment.topics.is_empty());
    // Watchlist matching still applies without a model.
    assert!(receipt.enrichment.projects.contains(&"project-alpha".to_string()));
    assert_eq!(ctx.store.count_documents().await.unwrap(), 1);
    assert_eq!(ctx.router.ledger().summary().call_count, 0);
}

#[tokio::test]
async fn cancelled_ingest_aborts_and_rolls_back() {
    let tmp = tempfile::tempdir().unwrap();
    let ctx = test_context(tmp.path()).await;

    let cancel = CancelFlag::new();
    cancel.cancel();
    let err = ingest_bytes(
        &ctx,
        S1_BYTES,
        Some("note.txt"),
        &IngestOptions::default(),
        &cancel,
    )
    .await
    .unwrap_err();
    assert_eq!(err.kind(), "aborted");
    assert_eq!(ctx.store.count_documents().await.unwrap(), 0);

    // The hash was released: the same bytes ingest cleanly afterwards.
    let receipts = ingest_bytes(
        &ctx,
        S1_BYTES,
        Some("note.txt"),
        &IngestOptions::default(),
        &CancelFlag::new(),
    )
    .await
    .unwrap();
    assert_eq!(receipts.len(), 1);
}

#[tokio::test]
async fn indexes_rebuild_from_store_on_restart() {
    let tmp = tempfile::tempdir().unwrap();
    let first_id;
    {
        let ctx = test_context(tmp.path()).await;
        let receipts = ingest_bytes(
            &ctx,
            S1_BYTES,
            Some("note.txt"),
            &IngestOptions::default(),
            &CancelFlag::new(),
        )
        .await
        .unwrap();
        first_id = receipts[0].doc_id.clone();
    }

    // A fresh context over the same database: dedup and sparse come back.
    let ctx = test_context(tmp.path()).await;
    assert_eq!(ctx.sparse.len(), 1);

    let err = ingest_bytes(
        &ctx,
        S1_BYTES,
        Some("note.txt"),
        &IngestOptions::default(),
        &CancelFlag::new(),
    )
    .await
    .unwrap_err();
    match err {
        docsift::error::SiftError::Duplicate { of } => assert_eq!(of, first_id),
        other => panic!("expected duplicate after restart, got {other:?}"),
    }

    let hits = ctx.search("kick-off", &SearchOptions::new()).await.unwrap();
    assert_eq!(hits[0].doc_id, first_id);
}

#[tokio::test]
async fn delete_removes_document_from_store_and_indexes() {
    let tmp = tempfile::tempdir().unwrap();
    let ctx = test_context(tmp.path()).await;
    let receipts = ingest_bytes(
        &ctx,
        S1_BYTES,
        Some("note.txt"),
        &IngestOptions::default(),
        &CancelFlag::new(),
    )
    .await
    .unwrap();
    let doc_id = receipts[0].doc_id.clone();
    let export = receipts[0].export_path.clone().unwrap();

    assert!(ctx.delete_document(&doc_id, false).await.unwrap());
    assert_eq!(ctx.store.count_documents().await.unwrap(), 0);
    assert!(ctx.search("kick-off", &SearchOptions::new()).await.unwrap().is_empty());
    // The export is immutable on disk unless explicitly deleted.
    assert!(export.exists());

    // And the content hash is free again.
    ingest_bytes(
        &ctx,
        S1_BYTES,
        Some("note.txt"),
        &IngestOptions::default(),
        &CancelFlag::new(),
    )
    .await
    .unwrap();
}

#[tokio::test]
async fn chat_export_produces_one_document_per_day() {
    let tmp = tempfile::tempdir().unwrap();
    let ctx = test_context(tmp.path()).await;

    let chat = b"[2026-03-01 09:15] ana: alpha planning for the kick-off\n[2026-03-01 09:16] ben: agreed, Berlin works\n[2026-03-02 10:00] ana: different day entirely";
    let receipts = ingest_bytes(
        &ctx,
        chat,
        Some("export.txt"),
        &IngestOptions::default(),
        &CancelFlag::new(),
    )
    .await
    .unwrap();
    assert_eq!(receipts.len(), 2);
    assert!(receipts
        .iter()
        .all(|r| r.doc_type == docsift::models::CanonicalType::ChatDaily));
    assert_eq!(ctx.store.count_documents().await.unwrap(), 2);
}
