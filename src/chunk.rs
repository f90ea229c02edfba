//! Structure-aware chunker.
//!
//! Walks a document's structural block stream and emits retrieval chunks:
//! - each heading opens a section whose `section_path` is the stack of
//!   enclosing heading titles; accumulation never crosses a section
//!   boundary,
//! - tables and code blocks are exactly one chunk each, however large
//!   (the token estimate stays honest),
//! - paragraphs and list items accumulate until the target token budget,
//!   then a new chunk opens within the same section,
//! - ignore-blocks become `ignored` chunks that are never embedded.
//!
//! Token counts are estimated at ~4 chars per token; the estimate is
//! monotonic in text length, which is all downstream consumers rely on.

use std::collections::BTreeMap;

use crate::config::ChunkingConfig;
use crate::models::{Block, Chunk, ChunkKind, Document};

/// Approximate chars-per-token ratio.
pub const CHARS_PER_TOKEN: usize = 4;

/// Monotonic token estimate.
pub fn estimate_tokens(text: &str) -> usize {
    text.len().div_ceil(CHARS_PER_TOKEN)
}

struct Accumulator {
    parts: Vec<String>,
    tokens: usize,
    all_list_items: bool,
}

impl Accumulator {
    fn new() -> Self {
        Self {
            parts: Vec::new(),
            tokens: 0,
            all_list_items: true,
        }
    }

    fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    fn push(&mut self, text: String, is_list_item: bool) {
        self.tokens += estimate_tokens(&text);
        self.parts.push(text);
        self.all_list_items &= is_list_item;
    }

    fn take_text(&mut self) -> String {
        let text = self.parts.join("\n\n");
        self.parts.clear();
        self.tokens = 0;
        self.all_list_items = true;
        text
    }
}

/// Chunk a document's block stream. Chunks come back totally ordered by
/// `ordinal`, ignored blocks included.
pub fn chunk_document(doc: &Document, config: &ChunkingConfig) -> Vec<Chunk> {
    let base_metadata = flatten_metadata(doc);
    let mut out: Vec<Chunk> = Vec::new();
    let mut section_stack: Vec<(u8, String)> = Vec::new();
    let mut acc = Accumulator::new();

    let section_path =
        |stack: &[(u8, String)]| stack.iter().map(|(_, t)| t.clone()).collect::<Vec<_>>();

    macro_rules! flush {
        () => {
            if !acc.is_empty() {
                let kind = if acc.all_list_items {
                    ChunkKind::List
                } else if section_stack.is_empty() {
                    ChunkKind::Paragraph
                } else {
                    ChunkKind::HeadingSection
                };
                let text = acc.take_text();
                push_chunk(
                    &mut out,
                    doc,
                    &base_metadata,
                    kind,
                    section_path(&section_stack),
                    text,
                );
            }
        };
    }

    for block in &doc.blocks {
        match block {
            Block::Heading { level, text } => {
                flush!();
                while section_stack
                    .last()
                    .is_some_and(|(l, _)| *l >= *level)
                {
                    section_stack.pop();
                }
                section_stack.push((*level, text.clone()));
            }
            Block::Table { .. } => {
                flush!();
                push_chunk(
                    &mut out,
                    doc,
                    &base_metadata,
                    ChunkKind::Table,
                    section_path(&section_stack),
                    block.text(),
                );
            }
            Block::Code { .. } => {
                flush!();
                push_chunk(
                    &mut out,
                    doc,
                    &base_metadata,
                    ChunkKind::Code,
                    section_path(&section_stack),
                    block.text(),
                );
            }
            Block::Ignore { text } => {
                flush!();
                push_chunk(
                    &mut out,
                    doc,
                    &base_metadata,
                    ChunkKind::Ignored,
                    section_path(&section_stack),
                    text.clone(),
                );
            }
            Block::Paragraph { text } => {
                for piece in split_oversized(text, config.hard_cap_tokens) {
                    if !acc.is_empty()
                        && acc.tokens + estimate_tokens(&piece) > config.target_tokens
                    {
                        flush!();
                    }
                    acc.push(piece, false);
                    if acc.tokens >= config.target_tokens {
                        flush!();
                    }
                }
            }
            Block::List { items } => {
                for item in items {
                    if !acc.is_empty()
                        && acc.tokens + estimate_tokens(item) > config.target_tokens
                    {
                        flush!();
                    }
                    acc.push(format!("- {item}"), true);
                    if acc.tokens >= config.target_tokens {
                        flush!();
                    }
                }
            }
        }
    }
    flush!();
    out
}

fn push_chunk(
    out: &mut Vec<Chunk>,
    doc: &Document,
    base_metadata: &BTreeMap<String, String>,
    kind: ChunkKind,
    section_path: Vec<String>,
    text: String,
) {
    if text.trim().is_empty() {
        return;
    }
    let ordinal = out.len();
    let mut metadata = base_metadata.clone();
    metadata.insert(
        "section_title".into(),
        section_path.last().cloned().unwrap_or_default(),
    );
    metadata.insert("sequence".into(), ordinal.to_string());
    metadata.insert("chunk_type".into(), kind.as_str().to_string());

    out.push(Chunk {
        doc_id: doc.id.clone(),
        ordinal,
        kind,
        section_path,
        token_estimate: estimate_tokens(&text),
        text,
        metadata,
    });
}

/// Split a single paragraph that exceeds the hard cap at whitespace
/// boundaries. Paragraphs under the cap come back whole.
fn split_oversized(text: &str, hard_cap_tokens: usize) -> Vec<String> {
    let max_chars = hard_cap_tokens * CHARS_PER_TOKEN;
    if text.len() <= max_chars {
        return vec![text.to_string()];
    }
    let mut pieces = Vec::new();
    let mut remaining = text;
    while !remaining.is_empty() {
        if remaining.len() <= max_chars {
            pieces.push(remaining.to_string());
            break;
        }
        let window = &remaining[..max_chars];
        let split_at = window
            .rfind('\n')
            .or_else(|| window.rfind(' '))
            .map(|p| p + 1)
            .unwrap_or(max_chars);
        pieces.push(remaining[..split_at].trim_end().to_string());
        remaining = &remaining[split_at..];
    }
    pieces
}

/// Flattened metadata shared by every chunk of a document: enrichment with
/// vocabulary lists comma-joined, scores, type, and provenance.
fn flatten_metadata(doc: &Document) -> BTreeMap<String, String> {
    let e = &doc.enrichment;
    let mut md = BTreeMap::new();
    md.insert("doc_id".into(), doc.id.clone());
    md.insert("doc_type".into(), doc.doc_type.as_str().to_string());
    md.insert("title".into(), e.title.clone());
    md.insert("summary".into(), e.summary.clone());
    md.insert("topics".into(), e.topics.join(", "));
    md.insert("projects".into(), e.projects.join(", "));
    md.insert("places".into(), e.places.join(", "));
    md.insert("roles".into(), e.role_mentions.join(", "));
    md.insert("quality".into(), format!("{:.4}", doc.scores.quality));
    md.insert("novelty".into(), format!("{:.4}", doc.scores.novelty));
    md.insert(
        "actionability".into(),
        format!("{:.4}", doc.scores.actionability),
    );
    md.insert("signalness".into(), format!("{:.4}", doc.scores.signalness));
    md.insert("content_hash".into(), doc.content_hash.clone());
    md.insert("created_at".into(), doc.created_at.to_rfc3339());
    md.insert(
        "enrichment_version".into(),
        e.schema_version.to_string(),
    );
    if let Some(name) = &doc.source_name {
        md.insert("source_name".into(), name.clone());
    }
    md
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CanonicalType, EnrichmentResult, ScoreBundle, TitleStrategy};
    use chrono::Utc;

    fn test_doc(blocks: Vec<Block>) -> Document {
        let mut enrichment =
            EnrichmentResult::degraded("Test".into(), TitleStrategy::Fallback);
        enrichment.topics = vec!["ai/ml".into(), "finance".into()];
        Document {
            id: "doc-1".into(),
            content_hash: "cafe".into(),
            simhash: 0,
            source_name: Some("test.md".into()),
            doc_type: CanonicalType::Note,
            text: String::new(),
            blocks,
            enrichment,
            scores: ScoreBundle {
                quality: 0.8,
                novelty: 1.0,
                actionability: 0.0,
                signalness: 0.62,
            },
            do_index: true,
            created_at: Utc::now(),
            ingested_at: Utc::now(),
            ocr_confidence: None,
            ocr_fallback: false,
        }
    }

    fn config() -> ChunkingConfig {
        ChunkingConfig {
            target_tokens: 512,
            hard_cap_tokens: 800,
        }
    }

    fn paragraph(text: &str) -> Block {
        Block::Paragraph { text: text.into() }
    }

    fn heading(level: u8, text: &str) -> Block {
        Block::Heading {
            level,
            text: text.into(),
        }
    }

    #[test]
    fn estimate_is_monotonic() {
        assert!(estimate_tokens("abcd") <= estimate_tokens("abcdefgh"));
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[test]
    fn structure_aware_section_grouping() {
        // One H1, two H2 sections with paragraphs, a table, a code block.
        let doc = test_doc(vec![
            heading(1, "Report"),
            heading(2, "Intro"),
            paragraph("First intro paragraph."),
            paragraph("Second intro paragraph."),
            paragraph("Third intro paragraph."),
            Block::Table {
                rows: vec![
                    vec!["a".into(), "b".into()],
                    vec!["1".into(), "2".into()],
                    vec!["3".into(), "4".into()],
                    vec!["5".into(), "6".into()],
                    vec!["7".into(), "8".into()],
                ],
            },
            heading(2, "Methods"),
            paragraph("First methods paragraph."),
            paragraph("Second methods paragraph."),
            paragraph("Third methods paragraph."),
            Block::Code {
                language: Some("rust".into()),
                text: (0..30).map(|i| format!("let x{i} = {i};")).collect::<Vec<_>>().join("\n"),
            },
        ]);

        let chunks = chunk_document(&doc, &config());
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[0].kind, ChunkKind::HeadingSection);
        assert_eq!(chunks[0].section_path, vec!["Report", "Intro"]);
        assert_eq!(chunks[1].kind, ChunkKind::Table);
        assert_eq!(chunks[2].kind, ChunkKind::HeadingSection);
        assert_eq!(chunks[2].section_path, vec!["Report", "Methods"]);
        assert_eq!(chunks[3].kind, ChunkKind::Code);
        // Ordinals are contiguous from zero.
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.ordinal, i);
        }
    }

    #[test]
    fn huge_table_is_one_honest_chunk() {
        let rows: Vec<Vec<String>> = (0..600)
            .map(|i| vec![format!("row {i} cell one"), format!("row {i} cell two")])
            .collect();
        let doc = test_doc(vec![Block::Table { rows }]);
        let chunks = chunk_document(&doc, &config());
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].kind, ChunkKind::Table);
        assert!(chunks[0].token_estimate > config().hard_cap_tokens);
    }

    #[test]
    fn paragraphs_accumulate_until_target() {
        let para = "word ".repeat(300); // ~375 tokens
        let doc = test_doc(vec![
            paragraph(&para),
            paragraph(&para),
            paragraph(&para),
        ]);
        let chunks = chunk_document(&doc, &config());
        assert!(chunks.len() >= 2, "three ~375-token paragraphs exceed one 512 target");
        for c in &chunks {
            assert_eq!(c.kind, ChunkKind::Paragraph);
        }
    }

    #[test]
    fn oversized_paragraph_is_split_at_whitespace() {
        let para = "word ".repeat(2000); // ~2500 tokens, over the hard cap
        let doc = test_doc(vec![paragraph(&para)]);
        let chunks = chunk_document(&doc, &config());
        assert!(chunks.len() > 1);
        for c in &chunks {
            assert!(c.token_estimate <= config().hard_cap_tokens);
            assert!(!c.text.starts_with(' '));
        }
    }

    #[test]
    fn ignore_blocks_become_ignored_chunks() {
        let doc = test_doc(vec![
            paragraph("visible"),
            Block::Ignore {
                text: "hidden link farm".into(),
            },
        ]);
        let chunks = chunk_document(&doc, &config());
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1].kind, ChunkKind::Ignored);
    }

    #[test]
    fn pure_list_chunk_has_list_kind() {
        let doc = test_doc(vec![Block::List {
            items: vec!["one".into(), "two".into()],
        }]);
        let chunks = chunk_document(&doc, &config());
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].kind, ChunkKind::List);
        assert_eq!(chunks[0].text, "- one\n\n- two");
    }

    #[test]
    fn metadata_is_flattened_with_comma_joined_lists() {
        let doc = test_doc(vec![paragraph("body")]);
        let chunks = chunk_document(&doc, &config());
        let md = &chunks[0].metadata;
        assert_eq!(md.get("topics").unwrap(), "ai/ml, finance");
        assert_eq!(md.get("doc_type").unwrap(), "note");
        assert_eq!(md.get("chunk_type").unwrap(), "paragraph");
        assert_eq!(md.get("sequence").unwrap(), "0");
        assert_eq!(md.get("content_hash").unwrap(), "cafe");
        assert!(md.contains_key("created_at"));
    }

    #[test]
    fn section_boundary_never_mixes() {
        let doc = test_doc(vec![
            heading(1, "A"),
            paragraph("under a"),
            heading(1, "B"),
            paragraph("under b"),
        ]);
        let chunks = chunk_document(&doc, &config());
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].section_path, vec!["A"]);
        assert_eq!(chunks[1].section_path, vec!["B"]);
    }
}
