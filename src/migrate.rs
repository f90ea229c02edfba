//! Database schema migrations.
//!
//! Creates the document and chunk tables and ensures idempotent execution.
//! Designed to be run via `sift init`; the store also runs it on first
//! open so test databases need no separate step.

use anyhow::Result;
use sqlx::SqlitePool;

pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            id TEXT PRIMARY KEY,
            content_hash TEXT NOT NULL UNIQUE,
            simhash INTEGER NOT NULL,
            source_name TEXT,
            doc_type TEXT NOT NULL,
            title TEXT NOT NULL,
            body TEXT NOT NULL,
            enrichment_json TEXT NOT NULL,
            quality REAL NOT NULL,
            novelty REAL NOT NULL,
            actionability REAL NOT NULL,
            signalness REAL NOT NULL,
            do_index INTEGER NOT NULL,
            created_at INTEGER NOT NULL,
            ingested_at INTEGER NOT NULL,
            enrichment_version INTEGER NOT NULL,
            summary_embedding BLOB
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            chunk_id TEXT PRIMARY KEY,
            doc_id TEXT NOT NULL,
            ordinal INTEGER NOT NULL,
            kind TEXT NOT NULL,
            section_path TEXT NOT NULL,
            text TEXT NOT NULL,
            token_estimate INTEGER NOT NULL,
            metadata_json TEXT NOT NULL,
            embedding BLOB,
            UNIQUE(doc_id, ordinal),
            FOREIGN KEY (doc_id) REFERENCES documents(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_doc_id ON chunks(doc_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_documents_ingested_at ON documents(ingested_at DESC)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_documents_doc_type ON documents(doc_type)")
        .execute(pool)
        .await?;

    Ok(())
}
