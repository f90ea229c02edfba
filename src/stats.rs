//! Corpus statistics and cost overview.
//!
//! A quick summary of what's stored: document and chunk counts, gate pass
//! rate, last ingest time, and the day's LLM spend per provider. Used by
//! `sift stats` to give confidence that ingestion and budgets are behaving.

use anyhow::Result;

use crate::context::AppContext;

pub async fn run_stats(ctx: &AppContext) -> Result<()> {
    let total_docs = ctx.store.count_documents().await?;
    let indexed_docs = ctx.store.count_indexed_documents().await?;
    let total_chunks = ctx.store.count_chunks().await?;
    let last_ingest = ctx.store.last_ingest_at().await?;
    let costs = ctx.router.ledger().summary();

    let db_size = std::fs::metadata(&ctx.config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("docsift — Corpus Stats");
    println!("======================");
    println!();
    println!("  Database:    {}", ctx.config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!();
    println!("  Documents:   {}", total_docs);
    println!(
        "  Indexed:     {} / {} ({}%)",
        indexed_docs,
        total_docs,
        if total_docs > 0 {
            (indexed_docs * 100) / total_docs
        } else {
            0
        }
    );
    println!("  Chunks:      {}", total_chunks);
    println!("  Sparse idx:  {} chunks in memory", ctx.sparse.len());
    println!(
        "  Last ingest: {}",
        match last_ingest {
            Some(ts) => format_ts_relative(ts),
            None => "never".to_string(),
        }
    );
    println!();
    println!("  Today's LLM spend: ${:.4} across {} calls", costs.daily_total, costs.call_count);
    println!(
        "  Remaining budget:  ${:.4}",
        ctx.router.remaining_budget()
    );
    if !costs.per_provider.is_empty() {
        println!();
        println!("  {:<24} {:>12}", "PROVIDER", "SPEND");
        println!("  {}", "-".repeat(38));
        for (provider, spend) in &costs.per_provider {
            println!("  {:<24} {:>12}", provider, format!("${spend:.4}"));
        }
    }
    println!();

    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

/// Format a Unix timestamp relative to now ("3 hours ago"), absolute when
/// old or in the future.
fn format_ts_relative(ts: i64) -> String {
    let delta = chrono::Utc::now().timestamp() - ts;
    match delta {
        d if d < 0 => format_ts_iso(ts),
        d if d < 60 => "just now".to_string(),
        d if d < 3600 => format!("{} min ago", d / 60),
        d if d < 86_400 => format!("{} h ago", d / 3600),
        d if d < 30 * 86_400 => format!("{} d ago", d / 86_400),
        _ => format_ts_iso(ts),
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_formatting() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.0 MB");
    }
}
