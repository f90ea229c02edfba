//! Content detection and multi-format text extraction.
//!
//! Accepts raw bytes plus an optional filename hint, identifies the format
//! by magic bytes (extension as tiebreaker), and produces normalized UTF-8
//! text with a best-effort structural block stream. Paginated formats also
//! carry a byte→page map. Conversation formats (email, chat exports) come
//! back as threads; a chat export yields one document per day.
//!
//! Failure ladder: per-format extraction errors fall back to a strict raw
//! UTF-8 decode; when that fails too the document fails with
//! `extraction_failed`.

use std::io::Read;

use chrono::{DateTime, Utc};
use scraper::{ElementRef, Html};
use tracing::{debug, warn};

use crate::error::{Result, SiftError};
use crate::models::{Block, CanonicalType, Thread};
use crate::structure;

/// Decompressed bytes cap per ZIP entry (zip-bomb protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;
/// Sheets processed per workbook.
const XLSX_MAX_SHEETS: usize = 100;
/// Text-layer length below which a PDF is considered scanned.
const PDF_TEXT_LAYER_MIN_CHARS: usize = 50;

/// Detected input format. Dispatch is a value-level match, not a trait
/// hierarchy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DetectedFormat {
    Pdf,
    Docx,
    Pptx,
    Xlsx,
    Html,
    Email,
    ChatExport,
    Markdown,
    SourceCode(String),
    Image,
    PlainText,
}

/// Byte offset where a page starts in the extracted text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageSpan {
    pub page: u32,
    pub byte_offset: usize,
}

/// One extracted document. Chat exports produce several (one per day).
#[derive(Debug, Clone)]
pub struct Extracted {
    pub text: String,
    pub blocks: Vec<Block>,
    pub doc_type: CanonicalType,
    pub page_map: Option<Vec<PageSpan>>,
    /// Creation timestamp recovered from content (thread dates), when any.
    pub created_at: Option<DateTime<Utc>>,
    pub ocr_confidence: Option<f64>,
    pub ocr_fallback: bool,
    pub thread: Option<Thread>,
}

/// OCR output: recognized text plus mean confidence in [0,1].
#[derive(Debug, Clone)]
pub struct OcrOutcome {
    pub text: String,
    pub confidence: f64,
}

/// Seam for optical character recognition. The engine owns rasterization;
/// it receives the original bytes (image or scanned PDF) and language
/// hints.
pub trait OcrEngine: Send + Sync {
    fn recognize(&self, bytes: &[u8], languages: &[String]) -> Result<OcrOutcome>;
}

/// Default engine when OCR is not configured: every call fails, so scanned
/// inputs surface `extraction_failed` instead of silently producing nothing.
pub struct DisabledOcr;

impl OcrEngine for DisabledOcr {
    fn recognize(&self, _bytes: &[u8], _languages: &[String]) -> Result<OcrOutcome> {
        Err(SiftError::extraction("OCR is disabled"))
    }
}

/// Identify the input format: magic bytes first, filename extension as the
/// tiebreaker for text-like content.
pub fn detect_format(bytes: &[u8], filename: Option<&str>) -> DetectedFormat {
    if bytes.starts_with(b"%PDF-") {
        return DetectedFormat::Pdf;
    }
    if bytes.starts_with(b"PK\x03\x04") {
        return match ooxml_kind(bytes) {
            Some(kind) => kind,
            None => DetectedFormat::PlainText,
        };
    }
    if bytes.starts_with(b"\x89PNG\r\n\x1a\n")
        || bytes.starts_with(b"\xff\xd8\xff")
        || bytes.starts_with(b"GIF8")
    {
        return DetectedFormat::Image;
    }

    let ext = filename
        .and_then(|f| f.rsplit_once('.'))
        .map(|(_, e)| e.to_ascii_lowercase());

    let Ok(text) = std::str::from_utf8(bytes) else {
        return DetectedFormat::PlainText;
    };
    let head = text.trim_start();
    let head_lower: String = head.chars().take(256).collect::<String>().to_lowercase();

    if head_lower.starts_with("<!doctype html") || head_lower.starts_with("<html") {
        return DetectedFormat::Html;
    }

    match ext.as_deref() {
        Some("html") | Some("htm") => return DetectedFormat::Html,
        Some("eml") | Some("mbox") => return DetectedFormat::Email,
        Some("md") | Some("markdown") => return DetectedFormat::Markdown,
        Some("rs") => return DetectedFormat::SourceCode("rust".into()),
        Some("py") => return DetectedFormat::SourceCode("python".into()),
        Some("js") => return DetectedFormat::SourceCode("javascript".into()),
        Some("ts") => return DetectedFormat::SourceCode("typescript".into()),
        Some("go") => return DetectedFormat::SourceCode("go".into()),
        Some("java") => return DetectedFormat::SourceCode("java".into()),
        Some("c") | Some("h") => return DetectedFormat::SourceCode("c".into()),
        Some("cpp") | Some("cc") | Some("hpp") => return DetectedFormat::SourceCode("cpp".into()),
        Some("rb") => return DetectedFormat::SourceCode("ruby".into()),
        Some("sh") => return DetectedFormat::SourceCode("bash".into()),
        Some("sql") => return DetectedFormat::SourceCode("sql".into()),
        _ => {}
    }

    if looks_like_email(text) {
        return DetectedFormat::Email;
    }
    if looks_like_chat_export(text) {
        return DetectedFormat::ChatExport;
    }
    if matches!(ext.as_deref(), Some("txt") | Some("text") | None) && head.starts_with('#') {
        return DetectedFormat::Markdown;
    }
    DetectedFormat::PlainText
}

fn ooxml_kind(bytes: &[u8]) -> Option<DetectedFormat> {
    let archive = zip::ZipArchive::new(std::io::Cursor::new(bytes)).ok()?;
    let names: Vec<&str> = archive.file_names().collect();
    if names.iter().any(|n| *n == "word/document.xml") {
        Some(DetectedFormat::Docx)
    } else if names.iter().any(|n| n.starts_with("ppt/slides/")) {
        Some(DetectedFormat::Pptx)
    } else if names.iter().any(|n| n.starts_with("xl/")) {
        Some(DetectedFormat::Xlsx)
    } else {
        None
    }
}

fn looks_like_email(text: &str) -> bool {
    let head: Vec<&str> = text.lines().take(20).collect();
    let has_subject = head.iter().any(|l| l.starts_with("Subject:"));
    let has_sender = head
        .iter()
        .any(|l| l.starts_with("From:") || l.starts_with("From "));
    has_subject && has_sender
}

fn looks_like_chat_export(text: &str) -> bool {
    let matching = text
        .lines()
        .take(20)
        .filter(|l| {
            l.starts_with('[')
                && l.len() > 18
                && l.as_bytes().get(5) == Some(&b'-')
                && l.as_bytes().get(8) == Some(&b'-')
        })
        .count();
    matching >= 2
}

/// Extract one input into one or more documents.
pub fn extract(
    bytes: &[u8],
    filename: Option<&str>,
    ocr: &dyn OcrEngine,
    ocr_languages: &[String],
) -> Result<Vec<Extracted>> {
    if bytes.is_empty() {
        return Err(SiftError::extraction("empty input"));
    }

    let format = detect_format(bytes, filename);
    debug!(?format, filename, "detected input format");

    let result = match &format {
        DetectedFormat::Pdf => extract_pdf(bytes, ocr, ocr_languages).map(|e| vec![e]),
        DetectedFormat::Docx => extract_docx(bytes).map(|e| vec![e]),
        DetectedFormat::Pptx => extract_pptx(bytes).map(|e| vec![e]),
        DetectedFormat::Xlsx => extract_xlsx(bytes).map(|e| vec![e]),
        DetectedFormat::Html => utf8(bytes).map(|t| vec![extract_html(&t)]),
        DetectedFormat::Email => utf8(bytes).and_then(|t| extract_email(&t)).map(|e| vec![e]),
        DetectedFormat::ChatExport => utf8(bytes).and_then(|t| extract_chat(&t)),
        DetectedFormat::Markdown => utf8(bytes).map(|t| vec![extract_markdown(&t)]),
        DetectedFormat::SourceCode(lang) => {
            utf8(bytes).map(|t| vec![extract_source(&t, lang.clone())])
        }
        DetectedFormat::Image => extract_image(bytes, ocr, ocr_languages).map(|e| vec![e]),
        DetectedFormat::PlainText => utf8(bytes).map(|t| vec![extract_plain(&t)]),
    };

    match result {
        Ok(docs) if docs.iter().any(|d| !d.text.trim().is_empty()) => Ok(docs),
        Ok(_) => Err(SiftError::extraction("no text recovered")),
        Err(e) => {
            // Per-format failures fall back to a strict raw UTF-8 decode.
            warn!(?format, error = %e, "format extraction failed, trying raw decode");
            let text = utf8(bytes)?;
            if text.trim().is_empty() {
                return Err(SiftError::extraction("no text recovered"));
            }
            Ok(vec![extract_plain(&text)])
        }
    }
}

fn utf8(bytes: &[u8]) -> Result<String> {
    std::str::from_utf8(bytes)
        .map(str::to_string)
        .map_err(|_| SiftError::extraction("input is not valid UTF-8"))
}

// ============ Text-like formats ============

fn extract_markdown(text: &str) -> Extracted {
    Extracted {
        text: text.to_string(),
        blocks: structure::parse_markdown(text),
        doc_type: CanonicalType::Note,
        page_map: None,
        created_at: None,
        ocr_confidence: None,
        ocr_fallback: false,
        thread: None,
    }
}

fn extract_plain(text: &str) -> Extracted {
    let doc_type = if looks_like_legal(text) {
        CanonicalType::Legal
    } else {
        CanonicalType::Text
    };
    Extracted {
        text: text.to_string(),
        blocks: structure::parse_markdown(text),
        doc_type,
        page_map: None,
        created_at: None,
        ocr_confidence: None,
        ocr_fallback: false,
        thread: None,
    }
}

/// Legal prose markers. Deliberately conservative: two distinct markers
/// required.
fn looks_like_legal(text: &str) -> bool {
    let lowered = text.to_lowercase();
    ["hereinafter", "whereas", "indemnif", "governing law", "party of the"]
        .iter()
        .filter(|m| lowered.contains(*m))
        .count()
        >= 2
}

fn extract_source(text: &str, language: String) -> Extracted {
    Extracted {
        text: text.to_string(),
        blocks: vec![Block::Code {
            language: Some(language),
            text: text.to_string(),
        }],
        doc_type: CanonicalType::Generic,
        page_map: None,
        created_at: None,
        ocr_confidence: None,
        ocr_fallback: false,
        thread: None,
    }
}

fn extract_email(text: &str) -> Result<Extracted> {
    let thread = structure::parse_email(text)?;
    let created_at = thread.messages.iter().filter_map(|m| m.timestamp).min();
    let canonical = thread.canonical_text();
    let blocks = thread
        .messages
        .iter()
        .map(|m| Block::Paragraph {
            text: format!("{}: {}", m.sender, m.body.trim()),
        })
        .collect();
    Ok(Extracted {
        text: canonical,
        blocks,
        doc_type: CanonicalType::EmailThread,
        page_map: None,
        created_at,
        ocr_confidence: None,
        ocr_fallback: false,
        thread: Some(thread),
    })
}

fn extract_chat(text: &str) -> Result<Vec<Extracted>> {
    let threads = structure::parse_chat_export(text);
    if threads.is_empty() {
        return Err(SiftError::extraction("no parsable chat messages"));
    }
    Ok(threads
        .into_iter()
        .map(|thread| {
            let created_at = thread.messages.iter().filter_map(|m| m.timestamp).min();
            let canonical = thread.canonical_text();
            let blocks = thread
                .messages
                .iter()
                .map(|m| Block::Paragraph {
                    text: format!("{}: {}", m.sender, m.body.trim()),
                })
                .collect();
            Extracted {
                text: canonical,
                blocks,
                doc_type: CanonicalType::ChatDaily,
                page_map: None,
                created_at,
                ocr_confidence: None,
                ocr_fallback: false,
                thread: Some(thread),
            }
        })
        .collect())
}

// ============ HTML ============

const HTML_BOILERPLATE_TAGS: [&str; 7] =
    ["script", "style", "nav", "header", "footer", "aside", "noscript"];

fn extract_html(raw: &str) -> Extracted {
    let document = Html::parse_document(raw);
    let mut blocks = Vec::new();
    walk_html(document.root_element(), &mut blocks);

    let text = blocks
        .iter()
        .map(Block::text)
        .filter(|t| !t.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n\n");

    Extracted {
        text,
        blocks,
        doc_type: CanonicalType::WebArticle,
        page_map: None,
        created_at: None,
        ocr_confidence: None,
        ocr_fallback: false,
        thread: None,
    }
}

fn walk_html(element: ElementRef, blocks: &mut Vec<Block>) {
    let tag = element.value().name();
    if HTML_BOILERPLATE_TAGS.contains(&tag) {
        return;
    }

    match tag {
        "h1" | "h2" | "h3" | "h4" | "h5" | "h6" => {
            let level = tag.as_bytes()[1] - b'0';
            let text = element_text(element);
            if !text.is_empty() {
                blocks.push(Block::Heading { level, text });
            }
        }
        "p" | "blockquote" => {
            let text = element_text(element);
            if !text.is_empty() {
                blocks.push(Block::Paragraph { text });
            }
        }
        "ul" | "ol" => {
            let items: Vec<String> = element
                .children()
                .filter_map(ElementRef::wrap)
                .filter(|c| c.value().name() == "li")
                .map(element_text)
                .filter(|t| !t.is_empty())
                .collect();
            if !items.is_empty() {
                blocks.push(Block::List { items });
            }
        }
        "table" => {
            let mut rows = Vec::new();
            for row in element
                .descendants()
                .filter_map(ElementRef::wrap)
                .filter(|e| e.value().name() == "tr")
            {
                let cells: Vec<String> = row
                    .children()
                    .filter_map(ElementRef::wrap)
                    .filter(|c| matches!(c.value().name(), "td" | "th"))
                    .map(element_text)
                    .collect();
                if !cells.is_empty() {
                    rows.push(cells);
                }
            }
            if !rows.is_empty() {
                blocks.push(Block::Table { rows });
            }
        }
        "pre" => {
            let text: String = element.text().collect();
            if !text.trim().is_empty() {
                blocks.push(Block::Code {
                    language: None,
                    text: text.trim_matches('\n').to_string(),
                });
            }
        }
        _ => {
            for child in element.children().filter_map(ElementRef::wrap) {
                walk_html(child, blocks);
            }
        }
    }
}

fn element_text(element: ElementRef) -> String {
    element
        .text()
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

// ============ PDF ============

fn extract_pdf(bytes: &[u8], ocr: &dyn OcrEngine, ocr_languages: &[String]) -> Result<Extracted> {
    let text_layer = pdf_extract::extract_text_from_mem(bytes)
        .map_err(|e| SiftError::extraction(format!("pdf: {e}")))?;

    if text_layer.trim().len() >= PDF_TEXT_LAYER_MIN_CHARS {
        let (text, page_map) = split_pdf_pages(&text_layer);
        return Ok(Extracted {
            blocks: structure::parse_markdown(&text),
            text,
            doc_type: CanonicalType::PdfReport,
            page_map: Some(page_map),
            created_at: None,
            ocr_confidence: None,
            ocr_fallback: false,
            thread: None,
        });
    }

    // Thin or absent text layer: scanned document, raster + OCR.
    let outcome = ocr.recognize(bytes, ocr_languages)?;
    Ok(Extracted {
        blocks: structure::parse_markdown(&outcome.text),
        text: outcome.text,
        doc_type: CanonicalType::PdfReport,
        page_map: None,
        created_at: None,
        ocr_confidence: Some(outcome.confidence),
        ocr_fallback: true,
        thread: None,
    })
}

/// The extractor separates pages with form feeds; turn those into a page
/// map over the cleaned text.
fn split_pdf_pages(raw: &str) -> (String, Vec<PageSpan>) {
    let mut text = String::new();
    let mut page_map = Vec::new();
    for (i, page) in raw.split('\x0c').enumerate() {
        page_map.push(PageSpan {
            page: i as u32 + 1,
            byte_offset: text.len(),
        });
        if i > 0 {
            text.push_str("\n\n");
        }
        text.push_str(page.trim_matches('\n'));
    }
    (text, page_map)
}

// ============ Images ============

fn extract_image(bytes: &[u8], ocr: &dyn OcrEngine, ocr_languages: &[String]) -> Result<Extracted> {
    let outcome = ocr.recognize(bytes, ocr_languages)?;
    Ok(Extracted {
        blocks: structure::parse_markdown(&outcome.text),
        text: outcome.text,
        doc_type: CanonicalType::Generic,
        page_map: None,
        created_at: None,
        ocr_confidence: Some(outcome.confidence),
        ocr_fallback: true,
        thread: None,
    })
}

// ============ OOXML ============

type ZipBytes<'a> = zip::ZipArchive<std::io::Cursor<&'a [u8]>>;

fn open_zip(bytes: &[u8]) -> Result<ZipBytes<'_>> {
    zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| SiftError::extraction(format!("ooxml: {e}")))
}

fn read_zip_entry(archive: &mut ZipBytes<'_>, name: &str) -> Result<Vec<u8>> {
    let entry = archive
        .by_name(name)
        .map_err(|e| SiftError::extraction(format!("ooxml entry {name}: {e}")))?;
    let mut out = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut out)
        .map_err(|e| SiftError::extraction(format!("ooxml entry {name}: {e}")))?;
    if out.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(SiftError::extraction(format!(
            "ooxml entry {name} exceeds size limit"
        )));
    }
    Ok(out)
}

/// Word document: `w:t` runs grouped into paragraphs at `w:p` boundaries.
fn extract_docx(bytes: &[u8]) -> Result<Extracted> {
    let mut archive = open_zip(bytes)?;
    let xml = read_zip_entry(&mut archive, "word/document.xml")?;

    let mut paragraphs: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut reader = quick_xml::Reader::from_reader(xml.as_slice());
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) if e.local_name().as_ref() == b"t" => {
                if let Ok(quick_xml::events::Event::Text(te)) = reader.read_event_into(&mut buf) {
                    current.push_str(te.unescape().unwrap_or_default().as_ref());
                }
            }
            Ok(quick_xml::events::Event::End(e)) if e.local_name().as_ref() == b"p" => {
                if !current.trim().is_empty() {
                    paragraphs.push(current.trim().to_string());
                }
                current.clear();
            }
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => return Err(SiftError::extraction(format!("docx xml: {e}"))),
            _ => {}
        }
        buf.clear();
    }
    if !current.trim().is_empty() {
        paragraphs.push(current.trim().to_string());
    }

    let text = paragraphs.join("\n\n");
    Ok(Extracted {
        blocks: paragraphs
            .into_iter()
            .map(|text| Block::Paragraph { text })
            .collect(),
        text,
        doc_type: CanonicalType::Generic,
        page_map: None,
        created_at: None,
        ocr_confidence: None,
        ocr_fallback: false,
        thread: None,
    })
}

/// Presentation: one paragraph block per slide, slides in numeric order.
fn extract_pptx(bytes: &[u8]) -> Result<Extracted> {
    let mut archive = open_zip(bytes)?;
    let mut slide_names: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with("ppt/slides/slide") && n.ends_with(".xml"))
        .map(str::to_string)
        .collect();
    slide_names.sort_by_key(|name| {
        name.trim_start_matches("ppt/slides/slide")
            .trim_end_matches(".xml")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });

    let mut blocks = Vec::new();
    for name in slide_names {
        let xml = read_zip_entry(&mut archive, &name)?;
        let runs = collect_text_runs(&xml, b"t")?;
        let slide_text = runs.join(" ");
        if !slide_text.trim().is_empty() {
            blocks.push(Block::Paragraph { text: slide_text });
        }
    }

    let text = blocks
        .iter()
        .map(Block::text)
        .collect::<Vec<_>>()
        .join("\n\n");
    Ok(Extracted {
        blocks,
        text,
        doc_type: CanonicalType::Generic,
        page_map: None,
        created_at: None,
        ocr_confidence: None,
        ocr_fallback: false,
        thread: None,
    })
}

/// Workbook: shared strings resolved, one table block per sheet with one
/// row per spreadsheet row.
fn extract_xlsx(bytes: &[u8]) -> Result<Extracted> {
    let mut archive = open_zip(bytes)?;
    let shared = match read_zip_entry(&mut archive, "xl/sharedStrings.xml") {
        Ok(xml) => collect_text_runs(&xml, b"t")?,
        Err(_) => Vec::new(),
    };

    let mut sheet_names: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with("xl/worksheets/sheet") && n.ends_with(".xml"))
        .map(str::to_string)
        .collect();
    sheet_names.sort_by_key(|name| {
        name.trim_start_matches("xl/worksheets/sheet")
            .trim_end_matches(".xml")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });

    let mut blocks = Vec::new();
    for name in sheet_names.into_iter().take(XLSX_MAX_SHEETS) {
        let xml = read_zip_entry(&mut archive, &name)?;
        let rows = extract_sheet_rows(&xml, &shared)?;
        if !rows.is_empty() {
            blocks.push(Block::Table { rows });
        }
    }

    let text = blocks
        .iter()
        .map(Block::text)
        .collect::<Vec<_>>()
        .join("\n\n");
    Ok(Extracted {
        blocks,
        text,
        doc_type: CanonicalType::Generic,
        page_map: None,
        created_at: None,
        ocr_confidence: None,
        ocr_fallback: false,
        thread: None,
    })
}

/// Collect the text content of every `<tag>` element in document order.
fn collect_text_runs(xml: &[u8], tag: &[u8]) -> Result<Vec<String>> {
    let mut out = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) if e.local_name().as_ref() == tag => {
                if let Ok(quick_xml::events::Event::Text(te)) = reader.read_event_into(&mut buf) {
                    out.push(te.unescape().unwrap_or_default().into_owned());
                }
            }
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => return Err(SiftError::extraction(format!("ooxml xml: {e}"))),
            _ => {}
        }
        buf.clear();
    }
    Ok(out)
}

fn extract_sheet_rows(xml: &[u8], shared: &[String]) -> Result<Vec<Vec<String>>> {
    let mut rows: Vec<Vec<String>> = Vec::new();
    let mut current: Vec<String> = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut in_value = false;
    let mut shared_cell = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => match e.local_name().as_ref() {
                b"row" => current.clear(),
                b"c" => {
                    shared_cell = e.attributes().any(|a| {
                        a.as_ref()
                            .map(|a| a.key.as_ref() == b"t" && a.value.as_ref() == b"s")
                            .unwrap_or(false)
                    });
                }
                b"v" => in_value = true,
                _ => {}
            },
            Ok(quick_xml::events::Event::Text(te)) if in_value => {
                let value = te.unescape().unwrap_or_default();
                let v = value.trim();
                if !v.is_empty() {
                    if shared_cell {
                        if let Ok(i) = v.parse::<usize>() {
                            if let Some(s) = shared.get(i) {
                                current.push(s.clone());
                            }
                        }
                    } else {
                        current.push(v.to_string());
                    }
                }
                in_value = false;
            }
            Ok(quick_xml::events::Event::End(e)) => match e.local_name().as_ref() {
                b"row" => {
                    if !current.is_empty() {
                        rows.push(std::mem::take(&mut current));
                    }
                }
                b"v" => in_value = false,
                b"c" => shared_cell = false,
                _ => {}
            },
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => return Err(SiftError::extraction(format!("xlsx xml: {e}"))),
            _ => {}
        }
        buf.clear();
    }
    Ok(rows)
}
