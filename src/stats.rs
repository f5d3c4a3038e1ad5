//! Ledger page rendering.
//!
//! Turns a [`LedgerPage`] into the table printed by `ingest stats`: one row
//! per record, most recent first, followed by page navigation and per-status
//! totals. Used by the CLI only; the library hands out the typed page.

use chrono::{DateTime, Utc};
use std::fmt::Write;

use crate::models::{LedgerPage, StatusCounts};

/// Render `page` as a plain-text table.
pub fn render_page(page: &LedgerPage, counts: &StatusCounts, now: DateTime<Utc>) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Ingestion Ledger");
    let _ = writeln!(out, "================");
    let _ = writeln!(out);
    let _ = writeln!(
        out,
        "  Files:       {} ({} processed, {} skipped, {} failed)",
        page.total_files, counts.processed, counts.skipped, counts.failed
    );
    let _ = writeln!(
        out,
        "  Page:        {} of {}",
        page.current_page,
        page.total_pages.max(1)
    );

    if page.records.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(out, "  (no records on this page)");
    } else {
        let _ = writeln!(out);
        let _ = writeln!(
            out,
            "  {:>6}  {:<9}  {:<9}  {:>6}  {:>5}  {:>9}  {:<14}  {}",
            "SEQ", "STATUS", "CHANGE", "CHUNKS", "SCORE", "SIZE", "WHEN", "FILE"
        );
        let _ = writeln!(out, "  {}", "-".repeat(96));
        for r in &page.records {
            let _ = writeln!(
                out,
                "  {:>6}  {:<9}  {:<9}  {:>6}  {:>5.2}  {:>9}  {:<14}  {}",
                r.sequence,
                r.status.as_str(),
                r.change.map(|c| c.as_str()).unwrap_or("-"),
                r.chunks_written,
                r.score,
                format_bytes(r.size_bytes),
                format_ts_relative(r.timestamp, now),
                r.file_path
            );
            if let Some(err) = &r.error {
                let _ = writeln!(out, "  {:>6}  error: {}", "", err);
            }
        }
    }

    let mut nav = Vec::new();
    if page.has_prev {
        nav.push(format!("--page {} for newer", page.current_page - 1));
    }
    if page.has_next {
        nav.push(format!("--page {} for older", page.current_page + 1));
    }
    if !nav.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(out, "  {}", nav.join(", "));
    }
    out
}

/// Format a byte count as a human-readable string.
pub fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a timestamp relative to `now` (e.g. "3 hours ago").
pub fn format_ts_relative(ts: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let delta = (now - ts).num_seconds();

    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M").to_string()
}
