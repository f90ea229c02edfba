//! Core data models used throughout docsift.
//!
//! These types represent the documents, structural blocks, enrichment
//! results, score bundles, and chunks that flow through the ingestion and
//! retrieval pipeline.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Current enrichment schema version. Bumped when the enrichment shape
/// changes; re-enrichment replaces older versions.
pub const ENRICHMENT_VERSION: u32 = 2;

/// Canonical document type. Closed set; everything unrecognized is `Generic`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CanonicalType {
    EmailThread,
    ChatDaily,
    PdfReport,
    WebArticle,
    Note,
    Text,
    Legal,
    Generic,
}

impl CanonicalType {
    pub const ALL: [CanonicalType; 8] = [
        CanonicalType::EmailThread,
        CanonicalType::ChatDaily,
        CanonicalType::PdfReport,
        CanonicalType::WebArticle,
        CanonicalType::Note,
        CanonicalType::Text,
        CanonicalType::Legal,
        CanonicalType::Generic,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CanonicalType::EmailThread => "email_thread",
            CanonicalType::ChatDaily => "chat_daily",
            CanonicalType::PdfReport => "pdf_report",
            CanonicalType::WebArticle => "web_article",
            CanonicalType::Note => "note",
            CanonicalType::Text => "text",
            CanonicalType::Legal => "legal",
            CanonicalType::Generic => "generic",
        }
    }
}

impl std::str::FromStr for CanonicalType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "email_thread" => Ok(CanonicalType::EmailThread),
            "chat_daily" => Ok(CanonicalType::ChatDaily),
            "pdf_report" => Ok(CanonicalType::PdfReport),
            "web_article" => Ok(CanonicalType::WebArticle),
            "note" => Ok(CanonicalType::Note),
            "text" => Ok(CanonicalType::Text),
            "legal" => Ok(CanonicalType::Legal),
            "generic" => Ok(CanonicalType::Generic),
            other => Err(format!("unknown document type: {other}")),
        }
    }
}

impl std::fmt::Display for CanonicalType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A structural block produced by extraction. The chunker walks this stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Block {
    Heading { level: u8, text: String },
    Paragraph { text: String },
    List { items: Vec<String> },
    Table { rows: Vec<Vec<String>> },
    Code { language: Option<String>, text: String },
    /// Content bounded by explicit IGNORE markers; kept for audit, never
    /// embedded or retrieved.
    Ignore { text: String },
}

impl Block {
    /// Plain-text rendering of the block, used for chunk text and length
    /// accounting.
    pub fn text(&self) -> String {
        match self {
            Block::Heading { text, .. } | Block::Paragraph { text } | Block::Ignore { text } => {
                text.clone()
            }
            Block::List { items } => items.join("\n"),
            Block::Table { rows } => rows
                .iter()
                .map(|r| r.join(" | "))
                .collect::<Vec<_>>()
                .join("\n"),
            Block::Code { text, .. } => text.clone(),
        }
    }
}

/// One message inside a conversation thread.
#[derive(Debug, Clone, PartialEq)]
pub struct ThreadMessage {
    pub sender: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub body: String,
}

/// A conversation thread: one logical document composed of many messages.
/// Email threads key on the normalized subject; chat threads on the day.
#[derive(Debug, Clone, PartialEq)]
pub struct Thread {
    pub thread_id: String,
    pub messages: Vec<ThreadMessage>,
}

impl Thread {
    /// Canonical text: the in-order concatenation of all messages with
    /// sender prefixes. Enrichment and scoring see the thread as a whole.
    pub fn canonical_text(&self) -> String {
        self.messages
            .iter()
            .map(|m| format!("{}: {}", m.sender, m.body.trim()))
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

/// Which strategy produced the document title.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TitleStrategy {
    Model,
    FirstHeading,
    FirstSentence,
    FilenameStem,
    Fallback,
}

/// Result of the enrichment stage. Controlled-vocabulary fields are always
/// subsets of the loaded vocabulary; unknown candidates land in
/// `suggested_tags`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichmentResult {
    pub title: String,
    pub title_strategy: TitleStrategy,
    pub summary: String,
    pub topics: Vec<String>,
    pub projects: Vec<String>,
    pub places: Vec<String>,
    pub role_mentions: Vec<String>,
    /// Tag candidates the model proposed that are not in the vocabulary.
    pub suggested_tags: Vec<String>,
    /// Free-text entities, only ones literally present in the text.
    pub organizations: Vec<String>,
    pub locations_free: Vec<String>,
    /// ISO-8601 dates extracted from the text.
    pub dates: Vec<String>,
    pub key_points: Vec<String>,
    pub confidence: f64,
    pub source_model_id: Option<String>,
    pub cost: f64,
    /// True when every provider failed and the fallback enrichment was used.
    pub degraded: bool,
    pub schema_version: u32,
}

impl EnrichmentResult {
    /// The weak enrichment used when all providers are exhausted. The ingest
    /// proceeds with this rather than failing.
    pub fn degraded(title: String, strategy: TitleStrategy) -> Self {
        Self {
            title,
            title_strategy: strategy,
            summary: String::new(),
            topics: Vec::new(),
            projects: Vec::new(),
            places: Vec::new(),
            role_mentions: Vec::new(),
            suggested_tags: Vec::new(),
            organizations: Vec::new(),
            locations_free: Vec::new(),
            dates: Vec::new(),
            key_points: Vec::new(),
            confidence: 0.1,
            source_model_id: None,
            cost: 0.0,
            degraded: true,
            schema_version: ENRICHMENT_VERSION,
        }
    }
}

/// Quality, novelty, actionability, and the combined signalness that gates
/// indexing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ScoreBundle {
    pub quality: f64,
    pub novelty: f64,
    pub actionability: f64,
    pub signalness: f64,
}

/// A fully processed document.
#[derive(Debug, Clone)]
pub struct Document {
    /// Stable UUID assigned at ingest.
    pub id: String,
    /// SHA-256 (lowercase hex) over the normalized text.
    pub content_hash: String,
    /// 64-bit SimHash fingerprint over shingles, for near-dup detection.
    pub simhash: u64,
    /// Original filename, when known.
    pub source_name: Option<String>,
    pub doc_type: CanonicalType,
    /// Extracted plain text.
    pub text: String,
    /// Structural block stream from extraction.
    pub blocks: Vec<Block>,
    pub enrichment: EnrichmentResult,
    pub scores: ScoreBundle,
    pub do_index: bool,
    /// From content when extractable, else the ingest time.
    pub created_at: DateTime<Utc>,
    pub ingested_at: DateTime<Utc>,
    /// OCR mean confidence in [0,1] when OCR ran.
    pub ocr_confidence: Option<f64>,
    /// True when extraction fell back to OCR for a paginated format.
    pub ocr_fallback: bool,
}

/// Kind of a chunk, mirroring the block kind that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkKind {
    HeadingSection,
    Paragraph,
    List,
    Table,
    Code,
    Ignored,
}

impl ChunkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkKind::HeadingSection => "heading_section",
            ChunkKind::Paragraph => "paragraph",
            ChunkKind::List => "list",
            ChunkKind::Table => "table",
            ChunkKind::Code => "code",
            ChunkKind::Ignored => "ignored",
        }
    }
}

impl std::str::FromStr for ChunkKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "heading_section" => Ok(ChunkKind::HeadingSection),
            "paragraph" => Ok(ChunkKind::Paragraph),
            "list" => Ok(ChunkKind::List),
            "table" => Ok(ChunkKind::Table),
            "code" => Ok(ChunkKind::Code),
            "ignored" => Ok(ChunkKind::Ignored),
            other => Err(format!("unknown chunk kind: {other}")),
        }
    }
}

/// The retrieval unit: a structurally aligned segment of one document.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub doc_id: String,
    /// 0-based position within the document. Total order per document.
    pub ordinal: usize,
    pub kind: ChunkKind,
    /// Stack of enclosing heading titles, root first.
    pub section_path: Vec<String>,
    pub text: String,
    /// Estimated tokens (~4 chars per token, monotonic in text length).
    pub token_estimate: usize,
    /// Flattened copy of the owning document's enrichment plus positional
    /// fields, rendered vector-store compatible (lists comma-joined).
    pub metadata: BTreeMap<String, String>,
}

impl Chunk {
    /// Per-chunk store id of the form `{doc_id}:{ordinal}`.
    pub fn chunk_id(&self) -> String {
        format!("{}:{}", self.doc_id, self.ordinal)
    }
}

/// Which retrieval branch produced a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    Dense,
    Sparse,
    Both,
}

/// A search result returned by the hybrid retriever.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub chunk_id: String,
    pub doc_id: String,
    pub section_path: Vec<String>,
    pub snippet: String,
    pub combined_score: f64,
    /// Present when the reranker ran.
    pub rerank_score: Option<f64>,
    pub provenance: Provenance,
}

/// Result record returned by every ingest, including partial successes.
#[derive(Debug, Clone)]
pub struct IngestReceipt {
    pub doc_id: String,
    pub doc_type: CanonicalType,
    pub do_index: bool,
    pub scores: ScoreBundle,
    pub enrichment: EnrichmentResult,
    pub chunk_count: usize,
    pub cost: f64,
    pub export_path: Option<PathBuf>,
    /// Set when a near-duplicate was detected but overridden.
    pub near_duplicate_of: Option<String>,
}

/// Outcome of the answer operation.
#[derive(Debug, Clone)]
pub enum AnswerOutcome {
    Answer {
        text: String,
        /// Chunk ids of the cited context blocks.
        citations: Vec<String>,
        cost: f64,
    },
    /// The confidence gate refused synthesis; the failed candidate list is
    /// returned for inspection.
    InsufficientEvidence { candidates: Vec<SearchHit> },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_type_round_trips() {
        for t in CanonicalType::ALL {
            let parsed: CanonicalType = t.as_str().parse().unwrap();
            assert_eq!(parsed, t);
        }
        assert!("pdf".parse::<CanonicalType>().is_err());
    }

    #[test]
    fn chunk_id_format() {
        let c = Chunk {
            doc_id: "d-1".into(),
            ordinal: 3,
            kind: ChunkKind::Paragraph,
            section_path: vec![],
            text: String::new(),
            token_estimate: 0,
            metadata: BTreeMap::new(),
        };
        assert_eq!(c.chunk_id(), "d-1:3");
    }

    #[test]
    fn thread_canonical_text_preserves_order() {
        let t = Thread {
            thread_id: "2026-03-01".into(),
            messages: vec![
                ThreadMessage {
                    sender: "ana".into(),
                    timestamp: None,
                    body: "first".into(),
                },
                ThreadMessage {
                    sender: "ben".into(),
                    timestamp: None,
                    body: "second".into(),
                },
            ],
        };
        assert_eq!(t.canonical_text(), "ana: first\n\nben: second");
    }
}
