//! Configuration parsing and validation.
//!
//! docsift is configured via a TOML file (default: `config/sift.toml`). The
//! config defines the database path, chunking parameters, retrieval tuning,
//! scoring gates, the LLM provider chain with unit prices and the daily
//! budget, embedding provider settings, canonical export layout, vocabulary
//! location, OCR settings, and per-stage timeouts.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::models::CanonicalType;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub archive: ArchiveConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub rerank: RerankConfig,
    #[serde(default)]
    pub gate: GateConfig,
    #[serde(default)]
    pub scoring: ScoringConfig,
    #[serde(default)]
    pub enrichment: EnrichmentConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub export: ExportConfig,
    pub vocabulary: VocabularyConfig,
    #[serde(default)]
    pub ocr: OcrConfig,
    #[serde(default)]
    pub dedup: DedupConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

/// Hash-addressed archive of original bytes.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ArchiveConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub root: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    /// Target chunk size in estimated tokens. Valid range 400–800.
    #[serde(default = "default_target_tokens")]
    pub target_tokens: usize,
    /// Hard cap; only tables and code blocks may exceed it.
    #[serde(default = "default_hard_cap_tokens")]
    pub hard_cap_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            target_tokens: default_target_tokens(),
            hard_cap_tokens: default_hard_cap_tokens(),
        }
    }
}

fn default_target_tokens() -> usize {
    512
}
fn default_hard_cap_tokens() -> usize {
    800
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    /// Dense weight in the hybrid mix: combined = α·dense + (1−α)·sparse.
    #[serde(default = "default_hybrid_alpha")]
    pub hybrid_alpha: f64,
    /// MMR diversification trade-off.
    #[serde(default = "default_mmr_lambda")]
    pub mmr_lambda: f64,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Each branch fetches `candidate_multiplier × top_k` candidates.
    #[serde(default = "default_candidate_multiplier")]
    pub candidate_multiplier: usize,
    /// Synthesize a hypothetical answer and blend its embedding with the
    /// query embedding before the dense query.
    #[serde(default)]
    pub hyde: bool,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            hybrid_alpha: default_hybrid_alpha(),
            mmr_lambda: default_mmr_lambda(),
            top_k: default_top_k(),
            candidate_multiplier: default_candidate_multiplier(),
            hyde: false,
        }
    }
}

fn default_hybrid_alpha() -> f64 {
    0.6
}
fn default_mmr_lambda() -> f64 {
    0.5
}
fn default_top_k() -> usize {
    8
}
fn default_candidate_multiplier() -> usize {
    4
}

#[derive(Debug, Deserialize, Clone)]
pub struct RerankConfig {
    /// `lexical` (deterministic, no model), `local` (fastembed
    /// cross-encoder, requires the `local-rerank` feature), or `disabled`.
    #[serde(default = "default_rerank_mode")]
    pub mode: String,
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self {
            mode: default_rerank_mode(),
        }
    }
}

fn default_rerank_mode() -> String {
    "lexical".to_string()
}

/// Confidence gate thresholds.
#[derive(Debug, Deserialize, Clone)]
pub struct GateConfig {
    /// A candidate counts toward coverage when its rerank score exceeds τ.
    #[serde(default = "default_gate_tau")]
    pub tau: f64,
    #[serde(default = "default_min_coverage")]
    pub min_coverage: usize,
    #[serde(default = "default_min_top")]
    pub min_top: f64,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            tau: default_gate_tau(),
            min_coverage: default_min_coverage(),
            min_top: default_min_top(),
        }
    }
}

fn default_gate_tau() -> f64 {
    0.3
}
fn default_min_coverage() -> usize {
    2
}
fn default_min_top() -> f64 {
    0.4
}

/// Per-type indexing gate: both thresholds must be met for `do_index`.
#[derive(Debug, Deserialize, Clone, Copy)]
pub struct TypeGate {
    pub min_quality: f64,
    pub min_signal: f64,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ScoringConfig {
    /// Overrides keyed by canonical type name; unset types use the built-in
    /// defaults from [`ScoringConfig::gate_for`].
    #[serde(default)]
    pub gates: HashMap<String, TypeGate>,
}

impl ScoringConfig {
    pub fn gate_for(&self, doc_type: CanonicalType) -> TypeGate {
        if let Some(g) = self.gates.get(doc_type.as_str()) {
            return *g;
        }
        let (min_quality, min_signal) = match doc_type {
            CanonicalType::EmailThread => (0.70, 0.60),
            CanonicalType::ChatDaily => (0.65, 0.60),
            CanonicalType::PdfReport => (0.75, 0.65),
            CanonicalType::WebArticle => (0.70, 0.60),
            CanonicalType::Note => (0.60, 0.50),
            CanonicalType::Text => (0.65, 0.55),
            CanonicalType::Legal => (0.80, 0.70),
            CanonicalType::Generic => (0.65, 0.55),
        };
        TypeGate {
            min_quality,
            min_signal,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct EnrichmentConfig {
    /// Truncate the text handed to the enricher to this many estimated
    /// tokens.
    #[serde(default = "default_enrich_prefix_tokens")]
    pub max_prefix_tokens: usize,
    /// Preferred model id for enrichment; unset picks the chain head.
    #[serde(default)]
    pub model: Option<String>,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            max_prefix_tokens: default_enrich_prefix_tokens(),
            model: None,
        }
    }
}

fn default_enrich_prefix_tokens() -> usize {
    8000
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// `openai`, `ollama`, `local`, `hash`, or `disabled`.
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_embedding_provider() -> String {
    "hash".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    4
}

/// One entry in the ordered provider chain.
#[derive(Debug, Deserialize, Clone)]
pub struct ProviderConfig {
    pub name: String,
    /// OpenAI-compatible chat completions base URL.
    pub endpoint: String,
    /// Environment variable holding the credential; empty means none.
    #[serde(default)]
    pub api_key_env: Option<String>,
    pub model: String,
    /// USD per million input tokens.
    #[serde(default)]
    pub input_price: f64,
    /// USD per million output tokens.
    #[serde(default)]
    pub output_price: f64,
    /// Per-minute request cap. Zero means uncapped.
    #[serde(default)]
    pub rpm: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    /// Providers tried in order: primary, fallback, emergency.
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    /// Daily cost cap in USD. Calls are refused once spent.
    #[serde(default = "default_daily_budget")]
    pub daily_budget_usd: f64,
    /// Append-only JSONL ledger snapshot, one record per call.
    #[serde(default)]
    pub ledger_path: Option<PathBuf>,
    /// Preferred model id for answer synthesis; unset picks the chain head.
    #[serde(default)]
    pub synthesis_model: Option<String>,
    /// Context blocks handed to synthesis.
    #[serde(default = "default_context_blocks")]
    pub context_blocks: usize,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            providers: Vec::new(),
            daily_budget_usd: default_daily_budget(),
            ledger_path: None,
            synthesis_model: None,
            context_blocks: default_context_blocks(),
        }
    }
}

fn default_daily_budget() -> f64 {
    10.0
}
fn default_context_blocks() -> usize {
    8
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExportConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_export_root")]
    pub root: PathBuf,
    /// `flat` → `YYYY-MM-DD__{type}__{slug}__{shortid}.md`;
    /// `dated` → `{type}/{yyyy-mm-dd}/{slug}__{shortid}.md`.
    #[serde(default = "default_export_layout")]
    pub layout: String,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            root: default_export_root(),
            layout: default_export_layout(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_export_root() -> PathBuf {
    PathBuf::from("./vault")
}
fn default_export_layout() -> String {
    "flat".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct VocabularyConfig {
    /// YAML file holding topics, projects, places, and role identifiers.
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct OcrConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Language hints passed to the OCR engine.
    #[serde(default = "default_ocr_languages")]
    pub languages: Vec<String>,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            languages: default_ocr_languages(),
        }
    }
}

fn default_ocr_languages() -> Vec<String> {
    vec!["eng".to_string()]
}

#[derive(Debug, Deserialize, Clone)]
pub struct DedupConfig {
    /// Maximum Hamming distance between SimHash fingerprints treated as a
    /// near-duplicate.
    #[serde(default = "default_hamming_threshold")]
    pub hamming_threshold: u32,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            hamming_threshold: default_hamming_threshold(),
        }
    }
}

fn default_hamming_threshold() -> u32 {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    /// Concurrent documents in flight for directory ingest.
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
        }
    }
}

fn default_workers() -> usize {
    4
}

/// Per-stage deadlines, in seconds.
#[derive(Debug, Deserialize, Clone)]
pub struct TimeoutConfig {
    #[serde(default = "default_extraction_secs")]
    pub extraction_secs: u64,
    #[serde(default = "default_enrichment_secs")]
    pub enrichment_secs: u64,
    #[serde(default = "default_embedding_secs")]
    pub embedding_secs: u64,
    #[serde(default = "default_vector_secs")]
    pub vector_secs: u64,
    #[serde(default = "default_synthesis_secs")]
    pub synthesis_secs: u64,
    #[serde(default = "default_ocr_page_secs")]
    pub ocr_page_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            extraction_secs: default_extraction_secs(),
            enrichment_secs: default_enrichment_secs(),
            embedding_secs: default_embedding_secs(),
            vector_secs: default_vector_secs(),
            synthesis_secs: default_synthesis_secs(),
            ocr_page_secs: default_ocr_page_secs(),
        }
    }
}

fn default_extraction_secs() -> u64 {
    60
}
fn default_enrichment_secs() -> u64 {
    30
}
fn default_embedding_secs() -> u64 {
    20
}
fn default_vector_secs() -> u64 {
    10
}
fn default_synthesis_secs() -> u64 {
    60
}
fn default_ocr_page_secs() -> u64 {
    120
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if !(400..=800).contains(&config.chunking.target_tokens) {
        anyhow::bail!("chunking.target_tokens must be in [400, 800]");
    }
    if config.chunking.hard_cap_tokens < config.chunking.target_tokens {
        anyhow::bail!("chunking.hard_cap_tokens must be >= target_tokens");
    }

    if !(0.0..=1.0).contains(&config.retrieval.hybrid_alpha) {
        anyhow::bail!("retrieval.hybrid_alpha must be in [0.0, 1.0]");
    }
    if !(0.0..=1.0).contains(&config.retrieval.mmr_lambda) {
        anyhow::bail!("retrieval.mmr_lambda must be in [0.0, 1.0]");
    }
    if config.retrieval.top_k == 0 {
        anyhow::bail!("retrieval.top_k must be >= 1");
    }
    if config.retrieval.candidate_multiplier == 0 {
        anyhow::bail!("retrieval.candidate_multiplier must be >= 1");
    }

    match config.rerank.mode.as_str() {
        "lexical" | "local" | "disabled" => {}
        other => anyhow::bail!(
            "rerank.mode must be lexical, local, or disabled (got '{}')",
            other
        ),
    }

    for (name, gate) in &config.scoring.gates {
        name.parse::<CanonicalType>()
            .map_err(|e| anyhow::anyhow!("scoring.gates: {e}"))?;
        if !(0.0..=1.0).contains(&gate.min_quality) || !(0.0..=1.0).contains(&gate.min_signal) {
            anyhow::bail!("scoring.gates.{}: thresholds must be in [0.0, 1.0]", name);
        }
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" | "local" | "hash" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, ollama, local, or hash.",
            other
        ),
    }
    if matches!(config.embedding.provider.as_str(), "openai" | "ollama")
        && config.embedding.model.is_none()
    {
        anyhow::bail!(
            "embedding.model must be specified when provider is '{}'",
            config.embedding.provider
        );
    }

    if config.llm.daily_budget_usd < 0.0 {
        anyhow::bail!("llm.daily_budget_usd must be >= 0");
    }
    for p in &config.llm.providers {
        if p.name.is_empty() || p.endpoint.is_empty() || p.model.is_empty() {
            anyhow::bail!("llm.providers entries require name, endpoint, and model");
        }
        if p.input_price < 0.0 || p.output_price < 0.0 {
            anyhow::bail!("llm.providers.{}: prices must be >= 0", p.name);
        }
    }

    match config.export.layout.as_str() {
        "flat" | "dated" => {}
        other => anyhow::bail!("export.layout must be flat or dated (got '{}')", other),
    }

    if config.pipeline.workers == 0 {
        anyhow::bail!("pipeline.workers must be >= 1");
    }

    Ok(())
}
