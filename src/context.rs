//! Process-scoped application context.
//!
//! Startup builds one [`AppContext`] — configuration, vocabulary, router,
//! embedder, store, sparse index, dedup registry — and everything else
//! receives it explicitly. No global mutables; the cost ledger inside the
//! router is the only internally synchronized shared structure. The
//! in-process indexes (sparse, dedup) are rebuilt from the store scan on
//! startup, so a cold start needs nothing beyond the database file.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tracing::info;

use crate::config::Config;
use crate::dedup::DedupIndex;
use crate::embedding::{create_embedder, Embedder};
use crate::extract::{DisabledOcr, OcrEngine};
use crate::error::{Result, SiftError};
use crate::llm::LlmRouter;
use crate::models::{AnswerOutcome, SearchHit};
use crate::rerank::{create_reranker, RerankedChunk, Reranker};
use crate::retrieve::retrieve;
use crate::sparse::SparseIndex;
use crate::store::{ChunkFilter, SqliteStore, VectorStore};
use crate::vocab::Vocabulary;

/// Cooperative cancellation signal checked between pipeline stages.
#[derive(Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Error with `Aborted` when the signal is set.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(SiftError::Aborted)
        } else {
            Ok(())
        }
    }
}

/// Options for the search operation.
#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    pub top_k: Option<usize>,
    pub filter: ChunkFilter,
    /// Overrides the configured HyDE default when set.
    pub hyde: Option<bool>,
    /// Disables reranking for this call when false.
    pub rerank: bool,
}

impl SearchOptions {
    pub fn new() -> Self {
        Self {
            rerank: true,
            ..Default::default()
        }
    }
}

/// Everything the pipeline shares, built once at startup.
pub struct AppContext {
    pub config: Config,
    vocab: RwLock<Arc<Vocabulary>>,
    pub router: LlmRouter,
    pub embedder: Box<dyn Embedder>,
    pub store: Box<dyn VectorStore>,
    pub sparse: SparseIndex,
    pub dedup: DedupIndex,
    pub ocr: Arc<dyn OcrEngine>,
    reranker: Option<Box<dyn Reranker>>,
}

impl AppContext {
    /// Initialize against the configured SQLite store.
    pub async fn init(config: Config) -> anyhow::Result<Self> {
        let store = SqliteStore::open(&config.db.path).await?;
        Self::init_with_store(config, Box::new(store)).await
    }

    /// Initialize with an injected store implementation (tests).
    pub async fn init_with_store(
        config: Config,
        store: Box<dyn VectorStore>,
    ) -> anyhow::Result<Self> {
        let vocab = Arc::new(Vocabulary::load(&config.vocabulary.path)?);
        let embedder = create_embedder(&config.embedding)?;
        let router = LlmRouter::from_config(
            &config.llm,
            Duration::from_secs(config.timeouts.synthesis_secs),
        )?;
        let reranker = create_reranker(&config.rerank.mode)?;

        let dedup = DedupIndex::new(config.dedup.hamming_threshold);
        dedup.load(store.scan_fingerprints().await?);

        let sparse = SparseIndex::new();
        let stored = store.scan_chunks().await?;
        let mut by_doc: std::collections::BTreeMap<String, Vec<(String, String)>> =
            std::collections::BTreeMap::new();
        for chunk in stored {
            by_doc
                .entry(chunk.doc_id.clone())
                .or_default()
                .push((chunk.chunk_id, chunk.text));
        }
        let rebuilt_docs = by_doc.len();
        for (doc_id, chunks) in by_doc {
            sparse.add_document(
                &doc_id,
                chunks.iter().map(|(id, text)| (id.as_str(), text.as_str())),
            );
        }
        info!(
            documents = rebuilt_docs,
            chunks = sparse.len(),
            "rebuilt in-process indexes from store"
        );

        Ok(Self {
            config,
            vocab: RwLock::new(vocab),
            router,
            embedder,
            store,
            sparse,
            dedup,
            ocr: Arc::new(DisabledOcr),
            reranker,
        })
    }

    /// Replace the router (tests inject scripted transports).
    pub fn with_router(mut self, router: LlmRouter) -> Self {
        self.router = router;
        self
    }

    /// Install an OCR engine. The default engine refuses every call, so
    /// scanned inputs fail extraction until one is provided.
    pub fn with_ocr(mut self, ocr: Arc<dyn OcrEngine>) -> Self {
        self.ocr = ocr;
        self
    }

    pub fn vocab(&self) -> Arc<Vocabulary> {
        self.vocab.read().unwrap().clone()
    }

    /// Re-parse the vocabulary file and swap it in. Lookups issued after
    /// this call see the new sets.
    pub fn reload_vocabulary(&self) -> anyhow::Result<()> {
        let fresh = Arc::new(Vocabulary::load(&self.config.vocabulary.path)?);
        *self.vocab.write().unwrap() = fresh;
        info!("vocabulary reloaded");
        Ok(())
    }

    /// Hybrid search: retrieve, optionally rerank, render hits.
    pub async fn search(&self, query: &str, options: &SearchOptions) -> Result<Vec<SearchHit>> {
        let top_k = options.top_k.unwrap_or(self.config.retrieval.top_k);
        let hyde = options.hyde.unwrap_or(self.config.retrieval.hyde);
        let candidates = retrieve(
            &self.config.retrieval,
            self.embedder.as_ref(),
            self.store.as_ref(),
            &self.sparse,
            Some(&self.router),
            query,
            &options.filter,
            top_k,
            hyde,
        )
        .await?;

        match (&self.reranker, options.rerank) {
            (Some(reranker), true) => {
                let reranked =
                    crate::rerank::rerank_candidates(reranker.as_ref(), query, candidates)?;
                Ok(crate::answer::to_search_hits(&reranked, true))
            }
            _ => {
                let passthrough = passthrough_rerank(candidates);
                Ok(crate::answer::to_search_hits(&passthrough, false))
            }
        }
    }

    /// Question answering: retrieve, rerank, gate, synthesize. With
    /// reranking disabled the combined scores feed the gate instead.
    pub async fn answer(
        &self,
        question: &str,
        options: &SearchOptions,
        synthesis_model: Option<&str>,
    ) -> Result<AnswerOutcome> {
        let top_k = options.top_k.unwrap_or(self.config.retrieval.top_k);
        let hyde = options.hyde.unwrap_or(self.config.retrieval.hyde);
        let candidates = retrieve(
            &self.config.retrieval,
            self.embedder.as_ref(),
            self.store.as_ref(),
            &self.sparse,
            Some(&self.router),
            question,
            &options.filter,
            top_k,
            hyde,
        )
        .await?;

        let reranked = match (&self.reranker, options.rerank) {
            (Some(reranker), true) => {
                crate::rerank::rerank_candidates(reranker.as_ref(), question, candidates)?
            }
            _ => passthrough_rerank(candidates),
        };

        let model = synthesis_model.or(self.config.llm.synthesis_model.as_deref());
        crate::answer::synthesize(
            &self.router,
            &self.config.gate,
            model,
            question,
            reranked,
            self.config.llm.context_blocks,
        )
        .await
    }

    /// Remove a document from the store and the in-process indexes. The
    /// canonical export stays on disk unless `delete_export` is set.
    pub async fn delete_document(&self, doc_id: &str, delete_export: bool) -> Result<bool> {
        let Some(row) = self.store.get_document(doc_id).await? else {
            return Ok(false);
        };
        self.store.delete_document(doc_id).await?;
        self.sparse.remove_by_doc(doc_id);
        self.dedup.remove_doc(doc_id);

        if delete_export {
            let path = crate::export::locate_export(&self.config.export, &row);
            if path.exists() {
                std::fs::remove_file(&path).map_err(SiftError::storage)?;
            }
        }
        Ok(true)
    }
}

/// MMR order preserved, combined scores standing in for rerank scores.
fn passthrough_rerank(candidates: Vec<crate::retrieve::RetrievedChunk>) -> Vec<RerankedChunk> {
    candidates
        .into_iter()
        .map(|retrieved| RerankedChunk {
            rerank_score: retrieved.combined_score,
            retrieved,
        })
        .collect()
}
