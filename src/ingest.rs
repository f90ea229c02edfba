//! Ingestion pipeline orchestration.
//!
//! For each document the stages run strictly in order: extraction →
//! deduplication → enrichment → scoring → (if indexed) chunking →
//! embedding + sparse indexing → canonical export. Every stage runs under
//! its configured deadline and checks the cancellation flag between
//! stages; a cancelled or storage-failed document is rolled back (partial
//! chunks deleted, dedup claim released) before the error propagates.
//!
//! Directory ingest walks the tree and processes files with bounded
//! concurrency; per-document stage order is unaffected.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use tokio::time::timeout;
use tracing::{info, warn};
use uuid::Uuid;

use crate::chunk::chunk_document;
use crate::context::{AppContext, CancelFlag};
use crate::dedup::{content_hash, simhash};
use crate::embedding::embed_one;
use crate::enrich::enrich;
use crate::error::{Result, SiftError};
use crate::extract::{extract, Extracted};
use crate::models::{Chunk, ChunkKind, Document, IngestReceipt};
use crate::score;
use crate::store::archive_bytes;

/// Caller overrides for one ingest call.
#[derive(Debug, Clone, Copy, Default)]
pub struct IngestOptions {
    /// Index the document even when the quality gate says otherwise.
    pub force_reindex: bool,
    /// Skip the canonical export for this call.
    pub skip_export: bool,
    /// Accept a near-duplicate instead of rejecting it.
    pub override_near_dup: bool,
}

/// Ingest raw bytes. Most inputs produce one receipt; chat exports produce
/// one per day. Fatal errors (`extraction_failed`, `duplicate`,
/// `storage_failed`, `aborted`) propagate; everything else is recorded in
/// the receipts.
pub async fn ingest_bytes(
    ctx: &AppContext,
    bytes: &[u8],
    filename: Option<&str>,
    options: &IngestOptions,
    cancel: &CancelFlag,
) -> Result<Vec<IngestReceipt>> {
    cancel.check()?;

    let extracted = {
        let bytes_owned = bytes.to_vec();
        let filename_owned = filename.map(str::to_string);
        // The config switch wins over the installed engine.
        let ocr: Arc<dyn crate::extract::OcrEngine> = if ctx.config.ocr.enabled {
            Arc::clone(&ctx.ocr)
        } else {
            Arc::new(crate::extract::DisabledOcr)
        };
        let languages = ctx.config.ocr.languages.clone();
        let deadline = Duration::from_secs(ctx.config.timeouts.extraction_secs);
        timeout(
            deadline,
            tokio::task::spawn_blocking(move || {
                extract(&bytes_owned, filename_owned.as_deref(), ocr.as_ref(), &languages)
            }),
        )
        .await
        .map_err(|_| SiftError::extraction("extraction deadline exceeded"))?
        .map_err(|e| SiftError::extraction(format!("extraction task: {e}")))??
    };

    if ctx.config.archive.enabled {
        if let Some(root) = &ctx.config.archive.root {
            use sha2::{Digest, Sha256};
            let raw_hash = format!("{:x}", Sha256::digest(bytes));
            if let Err(e) = archive_bytes(root, &raw_hash, bytes) {
                warn!(error = %e, "failed to archive original bytes");
            }
        }
    }

    let mut receipts = Vec::with_capacity(extracted.len());
    for doc in extracted {
        cancel.check()?;
        receipts.push(ingest_extracted(ctx, doc, filename, options, cancel).await?);
    }
    Ok(receipts)
}

async fn ingest_extracted(
    ctx: &AppContext,
    extracted: Extracted,
    filename: Option<&str>,
    options: &IngestOptions,
    cancel: &CancelFlag,
) -> Result<IngestReceipt> {
    let hash = content_hash(&extracted.text);
    let fingerprint = simhash(&extracted.text);
    let doc_id = Uuid::new_v4().to_string();

    // Atomic check-and-insert: concurrent identical submissions produce
    // exactly one winner, and the loser's error names it.
    let near_duplicate_of =
        ctx.dedup
            .claim(&hash, fingerprint, &doc_id, options.override_near_dup)?;

    match ingest_claimed(
        ctx,
        extracted,
        filename,
        options,
        cancel,
        &doc_id,
        &hash,
        fingerprint,
        near_duplicate_of.clone(),
    )
    .await
    {
        Ok(receipt) => Ok(receipt),
        Err(e) => {
            // Single best-effort rollback of everything attributable to
            // this document.
            ctx.dedup.release(&hash, &doc_id);
            ctx.sparse.remove_by_doc(&doc_id);
            if let Err(rollback) = ctx.store.delete_document(&doc_id).await {
                warn!(doc_id = %doc_id, error = %rollback, "rollback failed after ingest error");
            }
            Err(e)
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn ingest_claimed(
    ctx: &AppContext,
    extracted: Extracted,
    filename: Option<&str>,
    options: &IngestOptions,
    cancel: &CancelFlag,
    doc_id: &str,
    hash: &str,
    fingerprint: u64,
    near_duplicate_of: Option<String>,
) -> Result<IngestReceipt> {
    let vocab = ctx.vocab();
    let now = Utc::now();

    // Enrichment. A deadline overrun degrades exactly like provider
    // exhaustion does inside `enrich`.
    cancel.check()?;
    let enrichment = match timeout(
        Duration::from_secs(ctx.config.timeouts.enrichment_secs),
        enrich(
            &ctx.router,
            &vocab,
            &ctx.config.enrichment,
            &extracted.text,
            extracted.doc_type,
            &extracted.blocks,
            filename,
        ),
    )
    .await
    {
        Ok(enrichment) => enrichment,
        Err(_) => {
            warn!(doc_id, "enrichment deadline exceeded, storing degraded result");
            let (title, strategy) =
                crate::enrich::fallback_title(&extracted.blocks, &extracted.text, filename);
            crate::models::EnrichmentResult::degraded(title, strategy)
        }
    };

    // Summary embedding feeds novelty; absence just means novelty 1.
    cancel.check()?;
    let summary_text = if enrichment.summary.is_empty() {
        extracted.text.chars().take(1000).collect::<String>()
    } else {
        enrichment.summary.clone()
    };
    let summary_embedding = match timeout(
        Duration::from_secs(ctx.config.timeouts.embedding_secs),
        embed_one(ctx.embedder.as_ref(), &summary_text),
    )
    .await
    {
        Ok(Ok(v)) => Some(v),
        Ok(Err(e)) => {
            warn!(doc_id, error = %e, "summary embedding unavailable");
            None
        }
        Err(_) => {
            warn!(doc_id, "summary embedding deadline exceeded");
            None
        }
    };

    // Scores and the gate.
    let quality = score::quality_score(
        &extracted.text,
        &extracted.blocks,
        extracted.ocr_confidence,
        extracted.ocr_fallback,
    );
    let existing = ctx.store.summary_embeddings().await?;
    let novelty = score::novelty_score(summary_embedding.as_deref(), &existing);
    let watchlist_hits = vocab.watchlist_hits(&extracted.text);
    let future_event = score::has_future_event(&enrichment.dates, now.date_naive());
    let actionability = score::actionability_score(
        watchlist_hits,
        !enrichment.projects.is_empty(),
        future_event,
    );
    let scores = score::bundle(quality, novelty, actionability);
    let gate_passed = score::gate_decision(&ctx.config.scoring, extracted.doc_type, &scores);
    let do_index = gate_passed || options.force_reindex;

    let doc = Document {
        id: doc_id.to_string(),
        content_hash: hash.to_string(),
        simhash: fingerprint,
        source_name: filename.map(str::to_string),
        doc_type: extracted.doc_type,
        text: extracted.text.clone(),
        blocks: extracted.blocks.clone(),
        enrichment,
        scores,
        do_index,
        created_at: extracted.created_at.unwrap_or(now),
        ingested_at: now,
        ocr_confidence: extracted.ocr_confidence,
        ocr_fallback: extracted.ocr_fallback,
    };

    cancel.check()?;
    ctx.store
        .upsert_document(&doc, summary_embedding.as_deref())
        .await?;

    // Chunk, embed, and index only documents that passed the gate.
    let mut stored_chunks = 0usize;
    if do_index {
        cancel.check()?;
        let all_chunks = chunk_document(&doc, &ctx.config.chunking);
        let indexable: Vec<Chunk> = all_chunks
            .into_iter()
            .filter(|c| c.kind != ChunkKind::Ignored)
            .collect();

        if !indexable.is_empty() {
            let texts: Vec<String> = indexable.iter().map(|c| c.text.clone()).collect();
            let embeddings = timeout(
                Duration::from_secs(ctx.config.timeouts.embedding_secs),
                ctx.embedder.embed(&texts),
            )
            .await
            .map_err(|_| SiftError::storage("chunk embedding deadline exceeded"))??;
            let embeddings: Vec<Option<Vec<f32>>> = embeddings.into_iter().map(Some).collect();

            cancel.check()?;
            timeout(
                Duration::from_secs(ctx.config.timeouts.vector_secs),
                ctx.store.upsert_chunks(doc_id, &indexable, &embeddings),
            )
            .await
            .map_err(|_| SiftError::storage("vector upsert deadline exceeded"))??;

            let entries: Vec<(String, &str)> = indexable
                .iter()
                .map(|c| (c.chunk_id(), c.text.as_str()))
                .collect();
            ctx.sparse
                .add_document(doc_id, entries.iter().map(|(id, t)| (id.as_str(), *t)));
            stored_chunks = indexable.len();
        }
    }

    // Canonical export is emitted for gated-out documents too; only the
    // explicit skip flag suppresses it.
    let export_path = if ctx.config.export.enabled && !options.skip_export {
        match crate::export::export_document(&ctx.config.export, &doc) {
            Ok(paths) => Some(paths.main),
            Err(e) => {
                warn!(doc_id, error = %e, "canonical export failed");
                None
            }
        }
    } else {
        None
    };

    info!(
        doc_id,
        doc_type = %doc.doc_type,
        do_index,
        chunks = stored_chunks,
        signalness = scores.signalness,
        "ingested document"
    );

    Ok(IngestReceipt {
        doc_id: doc_id.to_string(),
        doc_type: doc.doc_type,
        do_index,
        scores,
        cost: doc.enrichment.cost,
        enrichment: doc.enrichment,
        chunk_count: stored_chunks,
        export_path,
        near_duplicate_of,
    })
}

/// Summary of a multi-file ingest run.
#[derive(Debug, Default)]
pub struct IngestRunSummary {
    pub receipts: Vec<IngestReceipt>,
    pub failures: Vec<(PathBuf, SiftError)>,
}

/// Ingest a file, or walk a directory and ingest every regular file with
/// bounded concurrency. Per-file errors are collected, not fatal to the
/// run.
pub async fn ingest_path(
    ctx: &AppContext,
    path: &Path,
    options: &IngestOptions,
    cancel: &CancelFlag,
) -> Result<IngestRunSummary> {
    let files: Vec<PathBuf> = if path.is_dir() {
        walkdir::WalkDir::new(path)
            .follow_links(false)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .collect()
    } else if path.is_file() {
        vec![path.to_path_buf()]
    } else {
        return Err(SiftError::invalid(format!(
            "no such file or directory: {}",
            path.display()
        )));
    };

    let mut summary = IngestRunSummary::default();
    let mut jobs = Vec::new();
    for file in files {
        let name = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        match std::fs::read(&file) {
            Ok(bytes) => jobs.push((file, name, bytes)),
            Err(e) => summary
                .failures
                .push((file, SiftError::invalid(format!("read failed: {e}")))),
        }
    }

    let results: Vec<(PathBuf, Result<Vec<IngestReceipt>>)> = stream::iter(jobs)
        .map(|(file, name, bytes)| async move {
            let result = ingest_bytes(ctx, &bytes, Some(&name), options, cancel).await;
            (file, result)
        })
        .buffer_unordered(ctx.config.pipeline.workers)
        .collect()
        .await;

    for (file, result) in results {
        match result {
            Ok(receipts) => summary.receipts.extend(receipts),
            Err(e) => {
                warn!(file = %file.display(), kind = e.kind(), "ingest failed");
                summary.failures.push((file, e));
            }
        }
    }
    Ok(summary)
}
