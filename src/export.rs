//! Canonical Markdown export and entity stubs.
//!
//! Each exported document is a Markdown artifact with a `---`-fenced
//! key/value header carrying the enrichment and score fields, a structured
//! body derived from the summary and key points, and an XRef block of
//! wiki-links to entity stubs. The XRef block is wrapped in IGNORE markers
//! so re-ingesting an export never embeds the link farm.
//!
//! Entity stubs are deterministic, idempotent files under
//! `refs/{projects,places,roles}/`; their body is a read-time back-link
//! query, never a list that must be maintained on every ingest.

use std::path::{Path, PathBuf};

use crate::config::ExportConfig;
use crate::error::{Result, SiftError};
use crate::models::Document;
use crate::structure::{IGNORE_BEGIN, IGNORE_END};

/// Paths written by one export.
#[derive(Debug, Clone)]
pub struct ExportPaths {
    pub main: PathBuf,
    pub stubs: Vec<PathBuf>,
}

/// Write the canonical artifact (and any missing entity stubs) for a
/// document. Exports are emitted for gated-out documents too; the header's
/// `do_index: false` records the decision.
pub fn export_document(config: &ExportConfig, doc: &Document) -> Result<ExportPaths> {
    let main = main_path(config, doc);
    if let Some(parent) = main.parent() {
        std::fs::create_dir_all(parent).map_err(SiftError::storage)?;
    }
    std::fs::write(&main, render_document(doc)).map_err(SiftError::storage)?;

    let mut stubs = Vec::new();
    for (kind, names) in [
        ("projects", &doc.enrichment.projects),
        ("places", &doc.enrichment.places),
        ("roles", &doc.enrichment.role_mentions),
    ] {
        for name in names {
            stubs.push(write_stub(&config.root, kind, name)?);
        }
    }

    Ok(ExportPaths { main, stubs })
}

fn main_path(config: &ExportConfig, doc: &Document) -> PathBuf {
    artifact_path(
        config,
        &doc.created_at.format("%Y-%m-%d").to_string(),
        doc.doc_type.as_str(),
        &doc.enrichment.title,
        &doc.id,
    )
}

/// Recompute the artifact path for a stored document row; `delete` uses
/// this to honor `delete_export`.
pub fn locate_export(config: &ExportConfig, row: &crate::store::DocumentRow) -> PathBuf {
    let date = chrono::DateTime::from_timestamp(row.created_at, 0)
        .map(|d| d.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| "1970-01-01".to_string());
    artifact_path(config, &date, &row.doc_type, &row.title, &row.id)
}

fn artifact_path(
    config: &ExportConfig,
    date: &str,
    doc_type: &str,
    title: &str,
    id: &str,
) -> PathBuf {
    let slug = slugify(title);
    let shortid: String = id.chars().filter(|c| c.is_ascii_hexdigit()).take(4).collect();
    match config.layout.as_str() {
        "dated" => config
            .root
            .join(doc_type)
            .join(date)
            .join(format!("{slug}__{shortid}.md")),
        _ => config
            .root
            .join(format!("{date}__{doc_type}__{slug}__{shortid}.md")),
    }
}

fn render_document(doc: &Document) -> String {
    let e = &doc.enrichment;
    let mut out = String::from("---\n");
    push_scalar(&mut out, "id", &doc.id);
    push_scalar(&mut out, "title", &e.title);
    push_scalar(&mut out, "type", doc.doc_type.as_str());
    push_scalar(
        &mut out,
        "created_at",
        &doc.created_at.format("%Y-%m-%dT%H:%M:%S%:z").to_string(),
    );
    push_list(&mut out, "topics", &e.topics);
    push_list(&mut out, "projects", &e.projects);
    push_list(&mut out, "places", &e.places);
    push_scalar(&mut out, "summary", &e.summary);
    push_raw(&mut out, "quality_score", &format!("{:.4}", doc.scores.quality));
    push_raw(&mut out, "novelty_score", &format!("{:.4}", doc.scores.novelty));
    push_raw(
        &mut out,
        "actionability_score",
        &format!("{:.4}", doc.scores.actionability),
    );
    push_raw(&mut out, "signalness", &format!("{:.4}", doc.scores.signalness));
    push_raw(&mut out, "do_index", if doc.do_index { "true" } else { "false" });
    push_raw(
        &mut out,
        "enrichment_version",
        &e.schema_version.to_string(),
    );
    push_scalar(&mut out, "content_hash", &doc.content_hash);
    // Extra keys beyond the required set; readers must preserve them.
    if let Some(name) = &doc.source_name {
        push_scalar(&mut out, "source_name", name);
    }
    if !e.suggested_tags.is_empty() {
        push_list(&mut out, "suggested_tags", &e.suggested_tags);
    }
    out.push_str("---\n\n");

    out.push_str(&format!("# {}\n\n", e.title));
    if !e.summary.is_empty() {
        out.push_str(&format!("{}\n\n", e.summary));
    }
    if !e.key_points.is_empty() {
        out.push_str("## Key Points\n\n");
        for point in &e.key_points {
            out.push_str(&format!("- {point}\n"));
        }
        out.push('\n');
    }

    let mut links: Vec<String> = Vec::new();
    for (kind, names) in [
        ("projects", &e.projects),
        ("places", &e.places),
        ("roles", &e.role_mentions),
    ] {
        for name in names {
            links.push(format!("- [[refs/{kind}/{}]]", slugify(name)));
        }
    }
    if !links.is_empty() {
        out.push_str(&format!("{IGNORE_BEGIN}\n## XRef\n\n"));
        for link in links {
            out.push_str(&link);
            out.push('\n');
        }
        out.push_str(&format!("{IGNORE_END}\n"));
    }
    out
}

/// Create the stub once; later exports leave it untouched.
fn write_stub(root: &Path, kind: &str, name: &str) -> Result<PathBuf> {
    let dir = root.join("refs").join(kind);
    std::fs::create_dir_all(&dir).map_err(SiftError::storage)?;
    let path = dir.join(format!("{}.md", slugify(name)));
    if path.exists() {
        return Ok(path);
    }

    let singular = kind.trim_end_matches('s');
    let flag = match kind {
        "projects" => format!("--project \"{name}\""),
        "places" => format!("--topic \"{name}\""),
        _ => format!("\"{name}\""),
    };
    let mut out = String::from("---\n");
    push_scalar(&mut out, "entity", name);
    push_scalar(&mut out, "kind", singular);
    out.push_str("---\n\n");
    out.push_str(&format!("# {name}\n\n"));
    out.push_str("Documents referring to this entity are resolved at read time:\n\n");
    out.push_str(&format!("```\nsift search {flag}\n```\n"));
    std::fs::write(&path, out).map_err(SiftError::storage)?;
    Ok(path)
}

fn push_scalar(out: &mut String, key: &str, value: &str) {
    out.push_str(&format!("{key}: {}\n", yaml_scalar(value)));
}

/// Raw (unquoted) primitive values: numbers and booleans.
fn push_raw(out: &mut String, key: &str, value: &str) {
    out.push_str(&format!("{key}: {value}\n"));
}

fn push_list(out: &mut String, key: &str, values: &[String]) {
    if values.is_empty() {
        out.push_str(&format!("{key}: []\n"));
        return;
    }
    out.push_str(&format!("{key}:\n"));
    for v in values {
        out.push_str(&format!("  - {}\n", yaml_scalar(v)));
    }
}

/// Quote strings containing structural characters; plain strings pass
/// through bare.
fn yaml_scalar(value: &str) -> String {
    let needs_quoting = value.is_empty()
        || value.starts_with(['-', '?', '*', '&', '!', '|', '>', '\'', '"', '%', '@', ' '])
        || value.ends_with(' ')
        || value
            .chars()
            .any(|c| matches!(c, ':' | '#' | '[' | ']' | '{' | '}' | ',' | '\n' | '"'));
    if needs_quoting {
        format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\"").replace('\n', " "))
    } else {
        value.to_string()
    }
}

fn slugify(text: &str) -> String {
    let mut slug = String::new();
    let mut last_dash = true;
    for c in text.to_lowercase().chars() {
        if c.is_alphanumeric() {
            slug.push(c);
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
        if slug.len() >= 60 {
            break;
        }
    }
    let slug = slug.trim_matches('-').to_string();
    if slug.is_empty() {
        "untitled".to_string()
    } else {
        slug
    }
}
