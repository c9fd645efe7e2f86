//! Run reports, manifest status, and the failure report.
//!
//! Backs the output of `csync sync`, `csync status`, and `csync failures`.
//! Text goes to stdout; `--json` prints the same data as JSON for scripts.

use anyhow::{Context, Result};

use crate::config::Config;
use crate::index::{IndexFilter, VectorIndex};
use crate::models::{FailureInfo, RunReport};
use crate::sqlite_index::SqliteIndex;
use crate::store::ChunkStore;

pub fn print_report(report: &RunReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
    } else {
        print!("{}", render_report(report));
    }
    Ok(())
}

fn render_report(report: &RunReport) -> String {
    let mut out = String::new();
    out.push_str("sync\n");
    out.push_str(&format!("  new:              {}\n", report.new));
    out.push_str(&format!("  changed:          {}\n", report.changed));
    out.push_str(&format!("  unchanged:        {}\n", report.unchanged));
    out.push_str(&format!("  removed:          {}\n", report.removed));
    out.push_str(&format!("  failed:           {}\n", report.failed));
    out.push_str(&format!("  chunks written:   {}\n", report.chunks_written));
    out.push_str(&format!("  vectors upserted: {}\n", report.vectors_upserted));
    out.push_str(&format!("  vectors deleted:  {}\n", report.vectors_deleted));
    out.push_str(&format!("  duration:         {} ms\n", report.duration_ms));
    if !report.failures.is_empty() {
        out.push('\n');
        out.push_str(&render_failures(&report.failures));
    }
    if report.aborted {
        out.push_str("aborted (fail-fast)\n");
    } else if report.is_success() {
        out.push_str("ok\n");
    }
    out
}

fn render_failures(failures: &[FailureInfo]) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "  {:<40} {:<20} {:<14} {}\n",
        "SOURCE", "KIND", "STAGE", "MESSAGE"
    ));
    out.push_str(&format!("  {}\n", "-".repeat(96)));
    for f in failures {
        out.push_str(&format!(
            "  {:<40} {:<20} {:<14} {}\n",
            f.source_path, f.error_kind, f.stage, f.message
        ));
    }
    out
}

/// Run the status command: summarise the manifest and, when embedding is on, the index.
pub async fn run_status(config: &Config) -> Result<()> {
    let store = ChunkStore::open(&config.store.root)
        .await
        .with_context(|| format!("Failed to open chunk store at {}", config.store.root.display()))?;
    let summary = store.summary().await;
    let failures = store.load_failures().await?;
    let last_ingested = store
        .manifest()
        .await
        .values()
        .map(|e| e.ingestion_timestamp.timestamp())
        .max();

    println!("corpus-sync status");
    println!("==================");
    println!();
    println!("  Corpus:        {}", config.corpus.root.display());
    println!("  Store:         {}", config.store.root.display());
    println!("  Preset:        {}", config.normalization.preset);
    println!();
    println!("  Active docs:   {}", summary.active);
    println!("  Removed docs:  {}", summary.removed);
    println!("  Chunks:        {}", summary.chunks);
    println!("  Pending index: {}", summary.pending_index);
    println!("  Last failures: {}", failures.len());
    println!(
        "  Last ingest:   {}",
        last_ingested
            .map(format_ts_relative)
            .unwrap_or_else(|| "never".to_string())
    );

    if config.embedding.is_enabled() {
        let size = std::fs::metadata(&config.index.path)
            .map(|m| m.len())
            .unwrap_or(0);
        let index = SqliteIndex::open(&config.index.path).await?;
        let records = index.count(&IndexFilter::default()).await?;
        index.close().await;
        println!();
        println!("  Index:         {}", config.index.path.display());
        println!("  Size:          {}", format_bytes(size));
        println!("  Records:       {}", records);
    } else {
        println!();
        println!("  Index:         disabled (no embedding provider)");
    }
    println!();
    Ok(())
}

/// Print the failure report written by the most recent run.
pub async fn run_failures(config: &Config, json: bool) -> Result<()> {
    let store = ChunkStore::open(&config.store.root).await?;
    let failures = store.load_failures().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&failures)?);
    } else if failures.is_empty() {
        println!("No failures recorded.");
    } else {
        print!("{}", render_failures(&failures));
    }
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
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

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
fn format_ts_relative(ts: i64) -> String {
    let delta = chrono::Utc::now().timestamp() - ts;
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

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}
