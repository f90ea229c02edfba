//! `sift` — the docsift command line.
//!
//! Thin dispatch over the library operations: `init`, `ingest`, `search`,
//! `answer`, `stats`, `delete`, and `reload-vocab`. Configuration comes
//! from a TOML file (default `./config/sift.toml`); logging is controlled
//! with `RUST_LOG`.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use docsift::config;
use docsift::context::{AppContext, CancelFlag, SearchOptions};
use docsift::ingest::{ingest_path, IngestOptions};
use docsift::models::AnswerOutcome;
use docsift::stats;
use docsift::store::{ChunkFilter, SqliteStore};

#[derive(Parser)]
#[command(
    name = "sift",
    about = "docsift — document ingestion, enrichment, and hybrid retrieval with confidence-gated answering",
    version
)]
struct Cli {
    /// Path to configuration file
    #[arg(long, global = true, default_value = "./config/sift.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema
    Init,

    /// Ingest a file or directory
    Ingest {
        /// File or directory to ingest
        path: PathBuf,

        /// Index even when the quality gate says otherwise
        #[arg(long)]
        force_reindex: bool,

        /// Skip the canonical Markdown export
        #[arg(long)]
        skip_export: bool,

        /// Accept near-duplicates instead of rejecting them
        #[arg(long)]
        override_near_dup: bool,
    },

    /// Search indexed chunks
    Search {
        /// Search query
        query: String,

        #[command(flatten)]
        filters: FilterArgs,

        /// Maximum number of results
        #[arg(long)]
        top_k: Option<usize>,

        /// Expand the query with a hypothetical answer (HyDE)
        #[arg(long)]
        hyde: bool,

        /// Keep MMR order, skip reranking
        #[arg(long)]
        no_rerank: bool,
    },

    /// Answer a question from the indexed corpus
    Answer {
        /// The question
        question: String,

        #[command(flatten)]
        filters: FilterArgs,

        /// Candidate pool size before the gate
        #[arg(long)]
        top_k: Option<usize>,

        /// Expand the query with a hypothetical answer (HyDE)
        #[arg(long)]
        hyde: bool,

        /// Synthesis model id (must be in the provider chain)
        #[arg(long)]
        model: Option<String>,
    },

    /// Corpus and cost statistics
    Stats,

    /// Delete a document from the store and indexes
    Delete {
        /// Document ID
        id: String,

        /// Also remove the canonical export from disk
        #[arg(long)]
        delete_export: bool,
    },

    /// Re-parse the vocabulary file and swap it in
    ReloadVocab,
}

#[derive(clap::Args)]
struct FilterArgs {
    /// Filter by canonical type (e.g. note, pdf_report)
    #[arg(long = "type")]
    doc_type: Option<String>,

    /// Filter by vocabulary topic
    #[arg(long)]
    topic: Option<String>,

    /// Filter by project id
    #[arg(long)]
    project: Option<String>,

    /// Only documents created on or after this date (YYYY-MM-DD)
    #[arg(long)]
    since: Option<String>,

    /// Only documents created on or before this date (YYYY-MM-DD)
    #[arg(long)]
    until: Option<String>,

    /// Filter by source filename prefix
    #[arg(long)]
    path_prefix: Option<String>,
}

impl FilterArgs {
    fn into_filter(self) -> Result<ChunkFilter> {
        let parse_date = |s: Option<String>| -> Result<Option<chrono::NaiveDate>> {
            s.map(|v| {
                chrono::NaiveDate::parse_from_str(&v, "%Y-%m-%d")
                    .map_err(|e| anyhow::anyhow!("invalid date '{v}': {e}"))
            })
            .transpose()
        };
        Ok(ChunkFilter {
            doc_type: self.doc_type,
            topic: self.topic,
            project: self.project,
            date_from: parse_date(self.since)?,
            date_to: parse_date(self.until)?,
            path_prefix: self.path_prefix,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            SqliteStore::open(&cfg.db.path).await?;
            println!("Database initialized successfully.");
        }
        Commands::Ingest {
            path,
            force_reindex,
            skip_export,
            override_near_dup,
        } => {
            let ctx = AppContext::init(cfg).await?;
            let options = IngestOptions {
                force_reindex,
                skip_export,
                override_near_dup,
            };
            let summary = ingest_path(&ctx, &path, &options, &CancelFlag::new()).await?;

            println!("ingest {}", path.display());
            println!("  documents: {}", summary.receipts.len());
            for receipt in &summary.receipts {
                println!(
                    "  {} [{}] do_index={} chunks={} signalness={:.3}{}",
                    receipt.doc_id,
                    receipt.doc_type,
                    receipt.do_index,
                    receipt.chunk_count,
                    receipt.scores.signalness,
                    receipt
                        .near_duplicate_of
                        .as_deref()
                        .map(|of| format!(" near_duplicate_of={of}"))
                        .unwrap_or_default()
                );
                if receipt.enrichment.degraded {
                    println!("    note: enrichment degraded");
                }
                if let Some(export) = &receipt.export_path {
                    println!("    export: {}", export.display());
                }
            }
            for (file, error) in &summary.failures {
                println!("  FAILED {}: {} ({})", file.display(), error, error.kind());
            }
            println!("ok");
        }
        Commands::Search {
            query,
            filters,
            top_k,
            hyde,
            no_rerank,
        } => {
            let ctx = AppContext::init(cfg).await?;
            let options = SearchOptions {
                top_k,
                filter: filters.into_filter()?,
                hyde: hyde.then_some(true),
                rerank: !no_rerank,
            };
            let hits = ctx.search(&query, &options).await?;

            if hits.is_empty() {
                println!("No results.");
                return Ok(());
            }
            for (i, hit) in hits.iter().enumerate() {
                let section = if hit.section_path.is_empty() {
                    String::from("(root)")
                } else {
                    hit.section_path.join(" > ")
                };
                println!(
                    "{}. [{:.2}{}] {}",
                    i + 1,
                    hit.combined_score,
                    hit.rerank_score
                        .map(|r| format!(" / rerank {r:.2}"))
                        .unwrap_or_default(),
                    hit.chunk_id
                );
                println!("    section: {}", section);
                println!("    excerpt: \"{}\"", hit.snippet);
                println!();
            }
        }
        Commands::Answer {
            question,
            filters,
            top_k,
            hyde,
            model,
        } => {
            let ctx = AppContext::init(cfg).await?;
            let options = SearchOptions {
                top_k,
                filter: filters.into_filter()?,
                hyde: hyde.then_some(true),
                rerank: true,
            };
            match ctx.answer(&question, &options, model.as_deref()).await? {
                AnswerOutcome::Answer {
                    text,
                    citations,
                    cost,
                } => {
                    println!("{text}");
                    println!();
                    println!("cited: {}", citations.join(", "));
                    println!("cost: ${cost:.4}");
                }
                AnswerOutcome::InsufficientEvidence { candidates } => {
                    println!("insufficient evidence — no answer synthesized");
                    for hit in candidates.iter().take(5) {
                        println!(
                            "  candidate {} rerank={:.2}",
                            hit.chunk_id,
                            hit.rerank_score.unwrap_or(0.0)
                        );
                    }
                }
            }
        }
        Commands::Stats => {
            let ctx = AppContext::init(cfg).await?;
            stats::run_stats(&ctx).await?;
        }
        Commands::Delete { id, delete_export } => {
            let ctx = AppContext::init(cfg).await?;
            if ctx.delete_document(&id, delete_export).await? {
                println!("deleted {id}");
            } else {
                println!("no such document: {id}");
            }
        }
        Commands::ReloadVocab => {
            let ctx = AppContext::init(cfg).await?;
            ctx.reload_vocabulary()?;
            println!("vocabulary reloaded");
        }
    }

    Ok(())
}
