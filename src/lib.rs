//! # docsift
//!
//! **A document ingestion, enrichment, and hybrid retrieval engine with
//! confidence-gated answering.**
//!
//! docsift takes raw bytes in many formats, extracts text with structural
//! hints, rejects duplicates, enriches each document with an LLM bound to a
//! controlled vocabulary, scores its signal value, chunks it along
//! structural boundaries, and stores chunks with embeddings. Retrieval
//! combines lexical (BM25) and dense (embedding) candidates with MMR
//! diversification and cross-encoder reranking; a confidence gate refuses
//! to synthesize answers from weak evidence.
//!
//! ## Architecture
//!
//! ```text
//! bytes → Extract → Dedup → Enrich → Score ──gate──▶ Chunk → Embed + BM25 → Export
//!                    (LLM router: providers, fallback, cost ledger, budget)
//!
//! query → [HyDE] → Dense ─┐
//!                         ├─ merge α + MMR → Rerank → Gate → Synthesize
//!         Sparse (BM25) ──┘
//! ```
//!
//! ## Ingestion Flow
//!
//! 1. [`extract`] identifies the format by magic bytes and produces UTF-8
//!    text plus a structural block stream; email and chat exports become
//!    conversation threads.
//! 2. [`dedup`] rejects exact hash collisions and flags near-duplicates by
//!    SimHash distance.
//! 3. [`enrich`] issues one strict-JSON LLM call through the [`llm`]
//!    router; tags are post-validated against the [`vocab`] closed sets.
//! 4. [`score`] computes quality, novelty, actionability, and signalness;
//!    the per-type gate decides `do_index`.
//! 5. [`chunk`] segments along headings, tables, code, and ignore-blocks.
//! 6. [`embedding`] + [`store`] persist vectors; [`sparse`] maintains the
//!    in-process BM25 index; [`export`] emits the canonical Markdown
//!    artifact and entity stubs.
//!
//! ## Retrieval Flow
//!
//! [`retrieve`] runs dense and sparse branches concurrently, normalizes and
//! merges their scores, and diversifies with MMR. [`rerank`] re-sorts the
//! shortlist with a pairwise scorer, and [`answer`] applies the confidence
//! gate before any synthesis call is spent.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`models`] | Core data types: `Document`, `Block`, `Chunk`, `EnrichmentResult`, receipts |
//! | [`error`] | Closed pipeline error kinds |
//! | [`extract`] | Format detection and multi-format text extraction |
//! | [`structure`] | Markdown block parsing, email threads, chat exports |
//! | [`dedup`] | SHA-256 + SimHash duplicate registry |
//! | [`vocab`] | Controlled vocabulary store and watchlist matching |
//! | [`enrich`] | LLM enrichment with vocabulary post-validation |
//! | [`score`] | Quality/novelty/actionability scoring and the gate |
//! | [`chunk`] | Structure-aware chunker |
//! | [`embedding`] | Embedding provider trait and implementations |
//! | [`migrate`] | SQLite schema migrations |
//! | [`store`] | Vector store trait and the SQLite implementation |
//! | [`sparse`] | In-process BM25 index |
//! | [`retrieve`] | Hybrid retrieval with MMR and optional HyDE |
//! | [`rerank`] | Pairwise reranking |
//! | [`answer`] | Confidence gate and answer synthesis |
//! | [`export`] | Canonical Markdown export and entity stubs |
//! | [`llm`] | Provider chain, cost ledger, budget enforcement |
//! | [`ingest`] | Pipeline orchestration with rollback and cancellation |
//! | [`context`] | Process-scoped application context |
//! | [`stats`] | Corpus and cost statistics |

pub mod answer;
pub mod chunk;
pub mod config;
pub mod context;
pub mod dedup;
pub mod embedding;
pub mod enrich;
pub mod error;
pub mod export;
pub mod extract;
pub mod ingest;
pub mod llm;
pub mod migrate;
pub mod models;
pub mod rerank;
pub mod retrieve;
pub mod score;
pub mod sparse;
pub mod stats;
pub mod store;
pub mod structure;
pub mod vocab;
