//! Vector store abstraction and the SQLite-backed implementation.
//!
//! The pipeline talks to the store through [`VectorStore`]: per-document
//! atomic chunk upserts, cosine top-k with a metadata filter, get by chunk
//! id, delete by document, and the scans that rebuild the in-process
//! indexes on startup. The shipped implementation keeps documents and
//! chunks in SQLite with embeddings as little-endian f32 blobs; similarity
//! is a brute-force cosine scan, which is exact and fine at this corpus
//! scale.
//!
//! Write operations retry transient failures with exponential backoff
//! (base 0.5s, factor 2, cap 30s, max 4 attempts); persistent failure
//! surfaces as `storage_failed`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::{Row, SqlitePool};
use tracing::warn;

use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::error::{Result, SiftError};
use crate::models::{Chunk, ChunkKind, Document};

const WRITE_RETRY_BASE_MS: u64 = 500;
const WRITE_RETRY_CAP_MS: u64 = 30_000;
const WRITE_RETRY_MAX_ATTEMPTS: u32 = 4;

/// A chunk as persisted, embeddings included when present.
#[derive(Debug, Clone)]
pub struct StoredChunk {
    pub chunk_id: String,
    pub doc_id: String,
    pub ordinal: usize,
    pub kind: ChunkKind,
    pub section_path: Vec<String>,
    pub text: String,
    pub token_estimate: usize,
    pub metadata: BTreeMap<String, String>,
    pub embedding: Option<Vec<f32>>,
}

/// Metadata filter applied to similarity queries and scans.
#[derive(Debug, Clone, Default)]
pub struct ChunkFilter {
    pub doc_type: Option<String>,
    pub topic: Option<String>,
    pub project: Option<String>,
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
    /// Prefix match on the original source filename.
    pub path_prefix: Option<String>,
}

impl ChunkFilter {
    pub fn is_empty(&self) -> bool {
        self.doc_type.is_none()
            && self.topic.is_none()
            && self.project.is_none()
            && self.date_from.is_none()
            && self.date_to.is_none()
            && self.path_prefix.is_none()
    }

    /// Whether a chunk's flattened metadata passes the filter.
    pub fn matches(&self, metadata: &BTreeMap<String, String>) -> bool {
        if let Some(t) = &self.doc_type {
            if metadata.get("doc_type").map(String::as_str) != Some(t.as_str()) {
                return false;
            }
        }
        if let Some(topic) = &self.topic {
            if !list_contains(metadata.get("topics"), topic) {
                return false;
            }
        }
        if let Some(project) = &self.project {
            if !list_contains(metadata.get("projects"), project) {
                return false;
            }
        }
        if self.date_from.is_some() || self.date_to.is_some() {
            let created = metadata
                .get("created_at")
                .and_then(|v| v.get(..10))
                .and_then(|v| NaiveDate::parse_from_str(v, "%Y-%m-%d").ok());
            let Some(created) = created else { return false };
            if let Some(from) = self.date_from {
                if created < from {
                    return false;
                }
            }
            if let Some(to) = self.date_to {
                if created > to {
                    return false;
                }
            }
        }
        if let Some(prefix) = &self.path_prefix {
            let source = metadata.get("source_name").map(String::as_str).unwrap_or("");
            if !source.starts_with(prefix.as_str()) {
                return false;
            }
        }
        true
    }
}

fn list_contains(joined: Option<&String>, needle: &str) -> bool {
    joined
        .map(|v| v.split(',').any(|item| item.trim() == needle))
        .unwrap_or(false)
}

/// A similarity query result.
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub chunk: StoredChunk,
    pub score: f64,
}

/// Lightweight document row used by stats and delete.
#[derive(Debug, Clone)]
pub struct DocumentRow {
    pub id: String,
    pub doc_type: String,
    pub title: String,
    pub do_index: bool,
    pub created_at: i64,
    pub ingested_at: i64,
}

/// The external vector store interface the core depends on. Assumed to
/// produce cosine similarities.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Persist the document record (scores, enrichment, fingerprints, and
    /// the summary embedding used for novelty).
    async fn upsert_document(
        &self,
        doc: &Document,
        summary_embedding: Option<&[f32]>,
    ) -> Result<()>;

    /// Replace all chunks of one document atomically. `embeddings` aligns
    /// with `chunks`; ignored chunks carry `None`.
    async fn upsert_chunks(
        &self,
        doc_id: &str,
        chunks: &[Chunk],
        embeddings: &[Option<Vec<f32>>],
    ) -> Result<()>;

    /// Cosine top-k over embedded, non-ignored chunks passing the filter.
    async fn query_similar(
        &self,
        vector: &[f32],
        filter: &ChunkFilter,
        top_k: usize,
    ) -> Result<Vec<ScoredChunk>>;

    async fn get_chunk(&self, chunk_id: &str) -> Result<Option<StoredChunk>>;

    async fn get_document(&self, doc_id: &str) -> Result<Option<DocumentRow>>;

    /// Remove the document and every chunk under its id prefix.
    async fn delete_document(&self, doc_id: &str) -> Result<()>;

    /// All non-ignored chunks; rebuilds the sparse index on startup.
    async fn scan_chunks(&self) -> Result<Vec<StoredChunk>>;

    /// (content_hash, simhash, doc_id) for every document; rebuilds the
    /// dedup registry on startup.
    async fn scan_fingerprints(&self) -> Result<Vec<(String, u64, String)>>;

    /// Summary embeddings of all documents, for novelty scoring.
    async fn summary_embeddings(&self) -> Result<Vec<(String, Vec<f32>)>>;

    async fn count_documents(&self) -> Result<i64>;
    async fn count_indexed_documents(&self) -> Result<i64>;
    async fn count_chunks(&self) -> Result<i64>;
    async fn last_ingest_at(&self) -> Result<Option<i64>>;
}

// ============ SQLite implementation ============

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (and migrate) the store at the configured path. The pool runs
    /// in WAL mode so retrieval reads never wait on ingest writes.
    pub async fn open(db_path: &Path) -> anyhow::Result<Self> {
        use std::str::FromStr;
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let options = sqlx::sqlite::SqliteConnectOptions::from_str(&format!(
            "sqlite:{}",
            db_path.display()
        ))?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        crate::migrate::run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Run a write closure with the transient-failure retry schedule.
    async fn with_write_retries<F, Fut, T>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
    {
        let mut last: Option<sqlx::Error> = None;
        for attempt in 0..WRITE_RETRY_MAX_ATTEMPTS {
            if attempt > 0 {
                let ms = WRITE_RETRY_BASE_MS
                    .saturating_mul(1u64 << (attempt - 1))
                    .min(WRITE_RETRY_CAP_MS);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                warn!(attempt, "retrying store write");
            }
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) => last = Some(e),
            }
        }
        Err(SiftError::storage(
            last.map(|e| e.to_string())
                .unwrap_or_else(|| "store write failed".into()),
        ))
    }
}

fn row_to_chunk(row: &sqlx::sqlite::SqliteRow) -> StoredChunk {
    let section_path: Vec<String> =
        serde_json::from_str(row.get::<String, _>("section_path").as_str()).unwrap_or_default();
    let metadata: BTreeMap<String, String> =
        serde_json::from_str(row.get::<String, _>("metadata_json").as_str()).unwrap_or_default();
    let kind: ChunkKind = row
        .get::<String, _>("kind")
        .parse()
        .unwrap_or(ChunkKind::Paragraph);
    StoredChunk {
        chunk_id: row.get("chunk_id"),
        doc_id: row.get("doc_id"),
        ordinal: row.get::<i64, _>("ordinal") as usize,
        kind,
        section_path,
        text: row.get("text"),
        token_estimate: row.get::<i64, _>("token_estimate") as usize,
        metadata,
        embedding: row
            .get::<Option<Vec<u8>>, _>("embedding")
            .map(|b| blob_to_vec(&b)),
    }
}

#[async_trait]
impl VectorStore for SqliteStore {
    async fn upsert_document(
        &self,
        doc: &Document,
        summary_embedding: Option<&[f32]>,
    ) -> Result<()> {
        let enrichment_json =
            serde_json::to_string(&doc.enrichment).map_err(SiftError::storage)?;
        let summary_blob = summary_embedding.map(vec_to_blob);

        self.with_write_retries(|| {
            let enrichment_json = enrichment_json.clone();
            let summary_blob = summary_blob.clone();
            async move {
                sqlx::query(
                    r#"
                    INSERT INTO documents (id, content_hash, simhash, source_name, doc_type,
                        title, body, enrichment_json, quality, novelty, actionability,
                        signalness, do_index, created_at, ingested_at, enrichment_version,
                        summary_embedding)
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                    ON CONFLICT(id) DO UPDATE SET
                        enrichment_json = excluded.enrichment_json,
                        title = excluded.title,
                        quality = excluded.quality,
                        novelty = excluded.novelty,
                        actionability = excluded.actionability,
                        signalness = excluded.signalness,
                        do_index = excluded.do_index,
                        enrichment_version = excluded.enrichment_version,
                        summary_embedding = excluded.summary_embedding
                    "#,
                )
                .bind(&doc.id)
                .bind(&doc.content_hash)
                .bind(doc.simhash as i64)
                .bind(&doc.source_name)
                .bind(doc.doc_type.as_str())
                .bind(&doc.enrichment.title)
                .bind(&doc.text)
                .bind(&enrichment_json)
                .bind(doc.scores.quality)
                .bind(doc.scores.novelty)
                .bind(doc.scores.actionability)
                .bind(doc.scores.signalness)
                .bind(doc.do_index as i64)
                .bind(doc.created_at.timestamp())
                .bind(doc.ingested_at.timestamp())
                .bind(doc.enrichment.schema_version as i64)
                .bind(summary_blob)
                .execute(&self.pool)
                .await
                .map(|_| ())
            }
        })
        .await
    }

    async fn upsert_chunks(
        &self,
        doc_id: &str,
        chunks: &[Chunk],
        embeddings: &[Option<Vec<f32>>],
    ) -> Result<()> {
        if chunks.len() != embeddings.len() {
            return Err(SiftError::storage(
                "chunk and embedding counts do not align",
            ));
        }

        self.with_write_retries(|| async move {
            let mut tx = self.pool.begin().await?;
            sqlx::query("DELETE FROM chunks WHERE doc_id = ?")
                .bind(doc_id)
                .execute(&mut *tx)
                .await?;
            for (chunk, embedding) in chunks.iter().zip(embeddings.iter()) {
                let section_path =
                    serde_json::to_string(&chunk.section_path).unwrap_or_else(|_| "[]".into());
                let metadata =
                    serde_json::to_string(&chunk.metadata).unwrap_or_else(|_| "{}".into());
                sqlx::query(
                    r#"
                    INSERT INTO chunks (chunk_id, doc_id, ordinal, kind, section_path,
                        text, token_estimate, metadata_json, embedding)
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(chunk.chunk_id())
                .bind(&chunk.doc_id)
                .bind(chunk.ordinal as i64)
                .bind(chunk.kind.as_str())
                .bind(section_path)
                .bind(&chunk.text)
                .bind(chunk.token_estimate as i64)
                .bind(metadata)
                .bind(embedding.as_ref().map(|e| vec_to_blob(e)))
                .execute(&mut *tx)
                .await?;
            }
            tx.commit().await
        })
        .await
    }

    async fn query_similar(
        &self,
        vector: &[f32],
        filter: &ChunkFilter,
        top_k: usize,
    ) -> Result<Vec<ScoredChunk>> {
        let rows = sqlx::query(
            "SELECT chunk_id, doc_id, ordinal, kind, section_path, text, token_estimate, \
             metadata_json, embedding FROM chunks \
             WHERE embedding IS NOT NULL AND kind != 'ignored'",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut scored: Vec<ScoredChunk> = rows
            .iter()
            .map(row_to_chunk)
            .filter(|c| filter.matches(&c.metadata))
            .filter_map(|chunk| {
                let embedding = chunk.embedding.as_ref()?;
                let score = cosine_similarity(vector, embedding) as f64;
                Some(ScoredChunk { chunk, score })
            })
            .collect();

        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.chunk.chunk_id.cmp(&b.chunk.chunk_id))
        });
        scored.truncate(top_k);
        Ok(scored)
    }

    async fn get_chunk(&self, chunk_id: &str) -> Result<Option<StoredChunk>> {
        let row = sqlx::query(
            "SELECT chunk_id, doc_id, ordinal, kind, section_path, text, token_estimate, \
             metadata_json, embedding FROM chunks WHERE chunk_id = ?",
        )
        .bind(chunk_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(row_to_chunk))
    }

    async fn get_document(&self, doc_id: &str) -> Result<Option<DocumentRow>> {
        let row = sqlx::query(
            "SELECT id, doc_type, title, do_index, created_at, ingested_at \
             FROM documents WHERE id = ?",
        )
        .bind(doc_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| DocumentRow {
            id: r.get("id"),
            doc_type: r.get("doc_type"),
            title: r.get("title"),
            do_index: r.get::<i64, _>("do_index") != 0,
            created_at: r.get("created_at"),
            ingested_at: r.get("ingested_at"),
        }))
    }

    async fn delete_document(&self, doc_id: &str) -> Result<()> {
        self.with_write_retries(|| async move {
            let mut tx = self.pool.begin().await?;
            sqlx::query("DELETE FROM chunks WHERE doc_id = ?")
                .bind(doc_id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM documents WHERE id = ?")
                .bind(doc_id)
                .execute(&mut *tx)
                .await?;
            tx.commit().await
        })
        .await
    }

    async fn scan_chunks(&self) -> Result<Vec<StoredChunk>> {
        let rows = sqlx::query(
            "SELECT chunk_id, doc_id, ordinal, kind, section_path, text, token_estimate, \
             metadata_json, embedding FROM chunks WHERE kind != 'ignored' \
             ORDER BY doc_id, ordinal",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_chunk).collect())
    }

    async fn scan_fingerprints(&self) -> Result<Vec<(String, u64, String)>> {
        let rows = sqlx::query("SELECT content_hash, simhash, id FROM documents")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(|r| {
                (
                    r.get::<String, _>("content_hash"),
                    r.get::<i64, _>("simhash") as u64,
                    r.get::<String, _>("id"),
                )
            })
            .collect())
    }

    async fn summary_embeddings(&self) -> Result<Vec<(String, Vec<f32>)>> {
        let rows = sqlx::query(
            "SELECT id, summary_embedding FROM documents WHERE summary_embedding IS NOT NULL",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|r| {
                (
                    r.get::<String, _>("id"),
                    blob_to_vec(&r.get::<Vec<u8>, _>("summary_embedding")),
                )
            })
            .collect())
    }

    async fn count_documents(&self) -> Result<i64> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM documents")
            .fetch_one(&self.pool)
            .await?)
    }

    async fn count_indexed_documents(&self) -> Result<i64> {
        Ok(
            sqlx::query_scalar("SELECT COUNT(*) FROM documents WHERE do_index = 1")
                .fetch_one(&self.pool)
                .await?,
        )
    }

    async fn count_chunks(&self) -> Result<i64> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(&self.pool)
            .await?)
    }

    async fn last_ingest_at(&self) -> Result<Option<i64>> {
        Ok(
            sqlx::query_scalar("SELECT MAX(ingested_at) FROM documents")
                .fetch_one(&self.pool)
                .await?,
        )
    }
}

/// Write original bytes into the hash-addressed archive:
/// `{root}/{hash[0..2]}/{hash}`. Idempotent.
pub fn archive_bytes(root: &Path, content_hash: &str, bytes: &[u8]) -> Result<PathBuf> {
    let shard = root.join(&content_hash[..2.min(content_hash.len())]);
    std::fs::create_dir_all(&shard).map_err(SiftError::storage)?;
    let path = shard.join(content_hash);
    if !path.exists() {
        std::fs::write(&path, bytes).map_err(SiftError::storage)?;
    }
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn filter_matches_doc_type_and_lists() {
        let md = metadata(&[
            ("doc_type", "note"),
            ("topics", "ai/ml, finance"),
            ("projects", "project-alpha"),
            ("created_at", "2026-03-01T10:00:00Z"),
            ("source_name", "inbox/report.md"),
        ]);

        assert!(ChunkFilter::default().matches(&md));
        assert!(ChunkFilter {
            doc_type: Some("note".into()),
            ..Default::default()
        }
        .matches(&md));
        assert!(!ChunkFilter {
            doc_type: Some("legal".into()),
            ..Default::default()
        }
        .matches(&md));
        assert!(ChunkFilter {
            topic: Some("finance".into()),
            ..Default::default()
        }
        .matches(&md));
        assert!(!ChunkFilter {
            topic: Some("fin".into()),
            ..Default::default()
        }
        .matches(&md));
        assert!(ChunkFilter {
            project: Some("project-alpha".into()),
            ..Default::default()
        }
        .matches(&md));
        assert!(ChunkFilter {
            path_prefix: Some("inbox/".into()),
            ..Default::default()
        }
        .matches(&md));
    }

    #[test]
    fn filter_date_range() {
        let md = metadata(&[("created_at", "2026-03-01T10:00:00Z")]);
        let from = |d: &str| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok();

        assert!(ChunkFilter {
            date_from: from("2026-02-01"),
            date_to: from("2026-04-01"),
            ..Default::default()
        }
        .matches(&md));
        assert!(!ChunkFilter {
            date_from: from("2026-03-02"),
            ..Default::default()
        }
        .matches(&md));
        assert!(!ChunkFilter {
            date_to: from("2026-02-28"),
            ..Default::default()
        }
        .matches(&md));
    }

    #[test]
    fn archive_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let hash = "abcdef0123456789";
        let p1 = archive_bytes(tmp.path(), hash, b"bytes").unwrap();
        let p2 = archive_bytes(tmp.path(), hash, b"other").unwrap();
        assert_eq!(p1, p2);
        // First write wins; the archive is content-addressed.
        assert_eq!(std::fs::read(&p1).unwrap(), b"bytes");
        assert!(p1.ends_with(format!("ab/{hash}")));
    }
}
