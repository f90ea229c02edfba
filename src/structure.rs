//! Structural parsing of extracted text.
//!
//! Turns plain text into the block stream the chunker walks: headings,
//! paragraphs, lists, tables, fenced code, and explicit ignore-blocks. Also
//! builds conversation threads from email message files (grouped by
//! normalized subject and reply headers) and chat exports (one thread per
//! day).

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use regex::Regex;
use std::sync::OnceLock;

use crate::error::{Result, SiftError};
use crate::models::{Block, Thread, ThreadMessage};

/// Markers bounding content that must never be embedded. The canonical
/// export wraps its XRef section in these.
pub const IGNORE_BEGIN: &str = "<!-- IGNORE -->";
pub const IGNORE_END: &str = "<!-- /IGNORE -->";

/// Parse Markdown (or plain text) into a structural block stream.
///
/// Line-oriented: ATX headings, fenced code, pipe tables, bullet/numbered
/// lists, ignore-blocks, and blank-line-separated paragraphs. Anything that
/// fails to parse as structure falls back to paragraphs, so the worst case
/// is a single-blob document, never an error.
pub fn parse_markdown(text: &str) -> Vec<Block> {
    let mut blocks = Vec::new();
    let mut paragraph: Vec<String> = Vec::new();
    let mut lines = text.lines().peekable();

    fn flush_paragraph(paragraph: &mut Vec<String>, blocks: &mut Vec<Block>) {
        if !paragraph.is_empty() {
            blocks.push(Block::Paragraph {
                text: paragraph.join("\n"),
            });
            paragraph.clear();
        }
    }

    while let Some(line) = lines.next() {
        let trimmed = line.trim_end();

        // Ignore-block: collect verbatim until the end marker.
        if trimmed.trim() == IGNORE_BEGIN {
            flush_paragraph(&mut paragraph, &mut blocks);
            let mut ignored = Vec::new();
            for inner in lines.by_ref() {
                if inner.trim() == IGNORE_END {
                    break;
                }
                ignored.push(inner);
            }
            blocks.push(Block::Ignore {
                text: ignored.join("\n"),
            });
            continue;
        }

        // Fenced code block.
        if let Some(fence_rest) = trimmed.strip_prefix("```") {
            flush_paragraph(&mut paragraph, &mut blocks);
            let language = {
                let lang = fence_rest.trim();
                if lang.is_empty() {
                    None
                } else {
                    Some(lang.to_string())
                }
            };
            let mut code = Vec::new();
            for inner in lines.by_ref() {
                if inner.trim_end().starts_with("```") {
                    break;
                }
                code.push(inner);
            }
            blocks.push(Block::Code {
                language,
                text: code.join("\n"),
            });
            continue;
        }

        // ATX heading.
        if let Some((level, title)) = parse_heading(trimmed) {
            flush_paragraph(&mut paragraph, &mut blocks);
            blocks.push(Block::Heading { level, text: title });
            continue;
        }

        // Pipe table: consecutive lines starting with '|'.
        if is_table_row(trimmed) {
            flush_paragraph(&mut paragraph, &mut blocks);
            let mut rows = Vec::new();
            if let Some(row) = parse_table_row(trimmed) {
                rows.push(row);
            }
            while let Some(next) = lines.peek() {
                if is_table_row(next.trim_end()) {
                    if let Some(row) = parse_table_row(next.trim_end()) {
                        rows.push(row);
                    }
                    lines.next();
                } else {
                    break;
                }
            }
            blocks.push(Block::Table { rows });
            continue;
        }

        // List: consecutive bullet/numbered items.
        if let Some(item) = parse_list_item(trimmed) {
            flush_paragraph(&mut paragraph, &mut blocks);
            let mut items = vec![item];
            while let Some(next) = lines.peek() {
                if let Some(item) = parse_list_item(next.trim_end()) {
                    items.push(item);
                    lines.next();
                } else {
                    break;
                }
            }
            blocks.push(Block::List { items });
            continue;
        }

        if trimmed.trim().is_empty() {
            flush_paragraph(&mut paragraph, &mut blocks);
        } else {
            paragraph.push(trimmed.trim().to_string());
        }
    }

    flush_paragraph(&mut paragraph, &mut blocks);
    blocks
}

fn parse_heading(line: &str) -> Option<(u8, String)> {
    let hashes = line.chars().take_while(|c| *c == '#').count();
    if hashes == 0 || hashes > 6 {
        return None;
    }
    let rest = &line[hashes..];
    if !rest.starts_with(' ') {
        return None;
    }
    let title = rest.trim().trim_end_matches('#').trim().to_string();
    if title.is_empty() {
        return None;
    }
    Some((hashes as u8, title))
}

fn is_table_row(line: &str) -> bool {
    let t = line.trim();
    t.starts_with('|') && t.len() > 1 && t[1..].contains('|')
}

/// Parse a pipe-table row into cells; separator rows (`|---|---|`) yield
/// `None`.
fn parse_table_row(line: &str) -> Option<Vec<String>> {
    let cells: Vec<String> = line
        .trim()
        .trim_matches('|')
        .split('|')
        .map(|c| c.trim().to_string())
        .collect();
    let is_separator = cells
        .iter()
        .all(|c| !c.is_empty() && c.chars().all(|ch| ch == '-' || ch == ':'));
    if is_separator {
        None
    } else {
        Some(cells)
    }
}

fn parse_list_item(line: &str) -> Option<String> {
    let t = line.trim_start();
    for marker in ["- ", "* ", "+ "] {
        if let Some(rest) = t.strip_prefix(marker) {
            return Some(rest.trim().to_string());
        }
    }
    // Numbered item: digits followed by '.' or ')' and a space.
    let digits = t.chars().take_while(|c| c.is_ascii_digit()).count();
    if digits > 0 {
        let rest = &t[digits..];
        if let Some(stripped) = rest.strip_prefix(". ").or_else(|| rest.strip_prefix(") ")) {
            return Some(stripped.trim().to_string());
        }
    }
    None
}

/// Strip reply/forward prefixes and collapse whitespace; the result keys an
/// email thread.
pub fn normalize_subject(subject: &str) -> String {
    let mut s = subject.trim();
    loop {
        let lowered = s.to_lowercase();
        let stripped = ["re:", "fwd:", "fw:", "aw:"]
            .iter()
            .find_map(|p| lowered.starts_with(p).then(|| s[p.len()..].trim_start()));
        match stripped {
            Some(rest) => s = rest,
            None => break,
        }
    }
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

struct RawMessage {
    subject: String,
    from: String,
    date: Option<DateTime<Utc>>,
    message_id: Option<String>,
    in_reply_to: Option<String>,
    body: String,
}

/// Parse an email message file into a conversation thread.
///
/// Accepts a single RFC-822 message or an mbox-style concatenation
/// (`From ` separators). Messages are ordered by reply chain (a message
/// follows the one its `In-Reply-To` names) and then by date; the thread id
/// is the normalized subject of the earliest message.
pub fn parse_email(raw: &str) -> Result<Thread> {
    let mut messages: Vec<RawMessage> = split_mbox(raw)
        .into_iter()
        .filter_map(parse_message)
        .collect();
    if messages.is_empty() {
        return Err(SiftError::extraction("no parsable email message"));
    }

    messages.sort_by_key(|m| m.date.map(|d| d.timestamp()).unwrap_or(i64::MAX));
    stable_reply_order(&mut messages);

    let thread_id = {
        let subject = normalize_subject(&messages[0].subject);
        if subject.is_empty() {
            "untitled-thread".to_string()
        } else {
            subject
        }
    };

    Ok(Thread {
        thread_id,
        messages: messages
            .into_iter()
            .map(|m| ThreadMessage {
                sender: m.from,
                timestamp: m.date,
                body: m.body,
            })
            .collect(),
    })
}

fn split_mbox(raw: &str) -> Vec<&str> {
    if raw.starts_with("From ") {
        let mut parts = Vec::new();
        let mut start = 0;
        for (idx, _) in raw.match_indices("\nFrom ") {
            parts.push(&raw[start..idx]);
            start = idx + 1;
        }
        parts.push(&raw[start..]);
        parts
    } else {
        vec![raw]
    }
}

fn parse_message(raw: &str) -> Option<RawMessage> {
    let raw = raw.trim_start_matches(|c| c == '\n' || c == '\r');
    let (header_part, body_part) = match raw.find("\n\n").or_else(|| raw.find("\r\n\r\n")) {
        Some(pos) => {
            let body_start = if raw[pos..].starts_with("\r\n\r\n") {
                pos + 4
            } else {
                pos + 2
            };
            (&raw[..pos], &raw[body_start..])
        }
        None => (raw, ""),
    };

    // Unfold continuation lines.
    let mut headers: Vec<(String, String)> = Vec::new();
    for line in header_part.lines() {
        if line.starts_with("From ") && headers.is_empty() {
            continue; // mbox separator line
        }
        if (line.starts_with(' ') || line.starts_with('\t')) && !headers.is_empty() {
            let last = headers.last_mut().unwrap();
            last.1.push(' ');
            last.1.push_str(line.trim());
        } else if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_lowercase(), value.trim().to_string()));
        }
    }

    let get = |name: &str| {
        headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.clone())
    };

    let subject = get("subject").unwrap_or_default();
    let from = get("from").unwrap_or_else(|| "unknown".to_string());
    let date = get("date")
        .and_then(|d| DateTime::parse_from_rfc2822(&d).ok())
        .map(|d| d.with_timezone(&Utc));
    let message_id = get("message-id");
    // References carries the whole ancestor chain; the last entry is the
    // direct parent when In-Reply-To is absent.
    let in_reply_to = get("in-reply-to").or_else(|| {
        get("references").and_then(|r| r.split_whitespace().last().map(str::to_string))
    });
    let body = plain_body(body_part, get("content-type").as_deref());

    if subject.is_empty() && body.trim().is_empty() {
        return None;
    }
    Some(RawMessage {
        subject,
        from,
        date,
        message_id,
        in_reply_to,
        body,
    })
}

/// Extract the text/plain part from a (possibly multipart) body.
fn plain_body(body: &str, content_type: Option<&str>) -> String {
    let Some(ct) = content_type else {
        return body.trim().to_string();
    };
    if !ct.to_lowercase().contains("multipart") {
        return body.trim().to_string();
    }
    let boundary = ct
        .split(';')
        .filter_map(|p| p.trim().strip_prefix("boundary="))
        .map(|b| b.trim_matches('"').to_string())
        .next();
    let Some(boundary) = boundary else {
        return body.trim().to_string();
    };
    let marker = format!("--{boundary}");
    for part in body.split(&marker) {
        let lowered = part.to_lowercase();
        if lowered.contains("content-type: text/plain") {
            if let Some(pos) = part.find("\n\n").or_else(|| part.find("\r\n\r\n")) {
                return part[pos..].trim().trim_end_matches("--").trim().to_string();
            }
        }
    }
    body.trim().to_string()
}

/// Bubble any reply ahead of its parent behind it. Dates already give the
/// order in well-formed mail; this fixes clockless exports where only the
/// headers link the chain.
fn stable_reply_order(messages: &mut [RawMessage]) {
    for i in 0..messages.len() {
        let Some(reply_to) = messages[i].in_reply_to.clone() else {
            continue;
        };
        let parent = messages
            .iter()
            .position(|m| m.message_id.as_deref() == Some(reply_to.as_str()));
        if let Some(parent) = parent {
            if parent > i {
                messages.swap(i, parent);
            }
        }
    }
}

/// Parse a chat export into one thread per day.
///
/// Recognized line shape: `[YYYY-MM-DD HH:MM] sender: body` (seconds
/// optional). Lines that do not match continue the previous message.
pub fn parse_chat_export(text: &str) -> Vec<Thread> {
    static LINE: OnceLock<Regex> = OnceLock::new();
    let line_re = LINE.get_or_init(|| {
        Regex::new(
            r"^\[(\d{4}-\d{2}-\d{2})[ T](\d{2}):(\d{2})(?::(\d{2}))?\]\s*([^:]+):\s*(.*)$",
        )
        .unwrap()
    });

    let mut days: std::collections::BTreeMap<String, Vec<ThreadMessage>> =
        std::collections::BTreeMap::new();
    let mut current_day: Option<String> = None;

    for line in text.lines() {
        if let Some(caps) = line_re.captures(line) {
            let day = caps[1].to_string();
            let hour: u32 = caps[2].parse().unwrap_or(0);
            let minute: u32 = caps[3].parse().unwrap_or(0);
            let second: u32 = caps.get(4).map_or(0, |s| s.as_str().parse().unwrap_or(0));
            let sender = caps[5].trim().to_string();
            let body = caps[6].to_string();

            let timestamp = NaiveDate::parse_from_str(&day, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(hour, minute, second))
                .map(|naive| Utc.from_utc_datetime(&naive));

            days.entry(day.clone()).or_default().push(ThreadMessage {
                sender,
                timestamp,
                body,
            });
            current_day = Some(day);
        } else if !line.trim().is_empty() {
            // Continuation of the previous message body.
            if let Some(day) = &current_day {
                if let Some(last) = days.get_mut(day).and_then(|m| m.last_mut()) {
                    last.body.push('\n');
                    last.body.push_str(line.trim());
                }
            }
        }
    }

    days.into_iter()
        .map(|(day, messages)| Thread {
            thread_id: day,
            messages,
        })
        .collect()
}

/// ISO-8601 dates (`YYYY-MM-DD`) literally present in the text, in order of
/// appearance, deduplicated.
pub fn find_iso_dates(text: &str) -> Vec<String> {
    static DATE: OnceLock<Regex> = OnceLock::new();
    let re = DATE.get_or_init(|| Regex::new(r"\b(\d{4}-\d{2}-\d{2})\b").unwrap());
    let mut seen = Vec::new();
    for caps in re.captures_iter(text) {
        let date = caps[1].to_string();
        if NaiveDate::parse_from_str(&date, "%Y-%m-%d").is_ok() && !seen.contains(&date) {
            seen.push(date);
        }
    }
    seen
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn markdown_headings_and_paragraphs() {
        let blocks = parse_markdown("# Title\n\nFirst paragraph.\n\nSecond paragraph.");
        assert_eq!(blocks.len(), 3);
        assert_eq!(
            blocks[0],
            Block::Heading {
                level: 1,
                text: "Title".into()
            }
        );
        assert!(matches!(&blocks[1], Block::Paragraph { text } if text == "First paragraph."));
    }

    #[test]
    fn markdown_fenced_code_keeps_language() {
        let blocks = parse_markdown("```rust\nfn main() {}\n```");
        assert_eq!(blocks.len(), 1);
        match &blocks[0] {
            Block::Code { language, text } => {
                assert_eq!(language.as_deref(), Some("rust"));
                assert_eq!(text, "fn main() {}");
            }
            other => panic!("expected code block, got {other:?}"),
        }
    }

    #[test]
    fn markdown_table_skips_separator_row() {
        let blocks = parse_markdown("| a | b |\n|---|---|\n| 1 | 2 |");
        assert_eq!(blocks.len(), 1);
        match &blocks[0] {
            Block::Table { rows } => {
                assert_eq!(rows.len(), 2);
                assert_eq!(rows[0], vec!["a", "b"]);
                assert_eq!(rows[1], vec!["1", "2"]);
            }
            other => panic!("expected table, got {other:?}"),
        }
    }

    #[test]
    fn markdown_lists_group_items() {
        let blocks = parse_markdown("- one\n- two\n1. three\n");
        // Bulleted and numbered runs are separate lists.
        assert_eq!(blocks.len(), 2);
        assert!(matches!(&blocks[0], Block::List { items } if items.len() == 2));
    }

    #[test]
    fn ignore_blocks_are_isolated() {
        let text = format!("before\n\n{IGNORE_BEGIN}\nhidden\n{IGNORE_END}\n\nafter");
        let blocks = parse_markdown(&text);
        assert_eq!(blocks.len(), 3);
        assert!(matches!(&blocks[1], Block::Ignore { text } if text == "hidden"));
    }

    #[test]
    fn subject_normalization_strips_prefixes() {
        assert_eq!(normalize_subject("Re: Re: Fwd:  Budget  plan "), "Budget plan");
        assert_eq!(normalize_subject("Budget plan"), "Budget plan");
    }

    #[test]
    fn email_single_message() {
        let raw = "Subject: Quarterly report\nFrom: ana@example.com\nDate: Mon, 2 Mar 2026 10:00:00 +0000\n\nNumbers attached.";
        let thread = parse_email(raw).unwrap();
        assert_eq!(thread.thread_id, "Quarterly report");
        assert_eq!(thread.messages.len(), 1);
        assert_eq!(thread.messages[0].sender, "ana@example.com");
        assert!(thread.messages[0].timestamp.is_some());
    }

    #[test]
    fn email_mbox_orders_by_date() {
        let raw = "From a@example.com Mon Mar 2 2026\nSubject: Plan\nFrom: ana@example.com\nDate: Mon, 2 Mar 2026 12:00:00 +0000\n\nSecond message.\nFrom b@example.com Mon Mar 2 2026\nSubject: Re: Plan\nFrom: ben@example.com\nDate: Mon, 2 Mar 2026 09:00:00 +0000\n\nFirst message.";
        let thread = parse_email(raw).unwrap();
        assert_eq!(thread.messages.len(), 2);
        assert_eq!(thread.messages[0].sender, "ben@example.com");
        assert_eq!(thread.thread_id, "Plan");
    }

    #[test]
    fn email_multipart_picks_plain_part() {
        let raw = "Subject: Mixed\nFrom: ana@example.com\nContent-Type: multipart/alternative; boundary=\"XYZ\"\n\n--XYZ\nContent-Type: text/plain\n\nplain text body\n--XYZ\nContent-Type: text/html\n\n<p>html body</p>\n--XYZ--";
        let thread = parse_email(raw).unwrap();
        assert_eq!(thread.messages[0].body, "plain text body");
    }

    #[test]
    fn empty_email_fails() {
        assert!(parse_email("\n\n").is_err());
    }

    #[test]
    fn chat_export_groups_by_day() {
        let text = "[2026-03-01 09:15] ana: morning\n[2026-03-01 09:16] ben: hi\nstill ben talking\n[2026-03-02 10:00] ana: new day";
        let threads = parse_chat_export(text);
        assert_eq!(threads.len(), 2);
        assert_eq!(threads[0].thread_id, "2026-03-01");
        assert_eq!(threads[0].messages.len(), 2);
        assert!(threads[0].messages[1].body.contains("still ben talking"));
        assert_eq!(threads[1].thread_id, "2026-03-02");
    }

    #[test]
    fn iso_dates_found_and_deduped() {
        let dates = find_iso_dates("due 2026-03-01, again 2026-03-01, then 2026-13-40 invalid");
        assert_eq!(dates, vec!["2026-03-01"]);
    }
}
