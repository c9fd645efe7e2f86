//! # corpus-sync CLI (`csync`)
//!
//! The `csync` binary keeps a chunk store and vector index converged with a
//! document corpus.
//!
//! ## Usage
//!
//! ```bash
//! csync --config ./config/csync.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `csync init` | Create the chunk store and, if embedding is on, the index |
//! | `csync sync` | Discover, chunk, embed, and reconcile the corpus |
//! | `csync status` | Summarise the manifest and index |
//! | `csync failures` | Print the last run's failure report |
//! | `csync search "<query>"` | Query the vector index |
//!
//! ## Examples
//!
//! ```bash
//! # Full sync, stop at the first failing document
//! csync sync --fail-fast
//!
//! # Re-run only what failed last time
//! csync sync --retry-failed
//!
//! # Re-process two documents with a different normalization preset
//! csync sync --doc-id guides-setup-md --doc-id faq-docx --preset aggressive
//!
//! # Search PDFs only
//! csync search "retention policy" --ext pdf -k 10
//! ```
//!
//! Logs go to stderr (`--verbose` or `RUST_LOG` to adjust); stdout carries
//! only command output. `csync sync` exits non-zero when any document failed
//! or the run was aborted.

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use corpus_sync::config::{self, Config};
use corpus_sync::index::IndexFilter;
use corpus_sync::normalize::NormalizationPreset;
use corpus_sync::pipeline::Orchestrator;
use corpus_sync::progress::ProgressMode;
use corpus_sync::sqlite_index::SqliteIndex;
use corpus_sync::store::ChunkStore;
use corpus_sync::{search, stats};

/// corpus-sync: keep a chunk store and vector index converged with a corpus
/// of PDF, DOCX, XLSX, Markdown, and text documents.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file.
#[derive(Parser)]
#[command(
    name = "csync",
    about = "Keep a chunk store and vector index converged with a document corpus",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/csync.toml")]
    config: PathBuf,

    /// Log at debug level. `RUST_LOG` takes precedence.
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the chunk store directory and the index schema.
    ///
    /// Idempotent; running it multiple times is safe.
    Init,

    /// Bring the chunk store and index up to date with the corpus.
    ///
    /// Unchanged documents are skipped by content hash. Removed documents
    /// are tombstoned and their vectors deleted.
    Sync {
        /// Stop starting new documents after the first failure.
        #[arg(long)]
        fail_fast: bool,

        /// Only re-run documents that failed in the most recent run.
        #[arg(long)]
        retry_failed: bool,

        /// Restrict the run to this doc id (repeatable).
        #[arg(long = "doc-id")]
        doc_ids: Vec<String>,

        /// Normalization preset: default, minimal, aggressive, or none.
        #[arg(long)]
        preset: Option<NormalizationPreset>,

        /// Number of documents processed concurrently.
        #[arg(long)]
        workers: Option<usize>,

        /// Progress on stderr: auto, human, json, or off.
        #[arg(long, default_value = "auto")]
        progress: String,

        /// Print the run report as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Summarise the manifest and index.
    Status,

    /// Print the failure report from the most recent run.
    Failures {
        #[arg(long)]
        json: bool,
    },

    /// Search the vector index. Requires an embedding provider.
    Search {
        /// The search query string.
        query: String,

        /// Maximum number of results.
        #[arg(short, long, default_value_t = 5)]
        k: usize,

        /// Only chunks of this document.
        #[arg(long)]
        doc_id: Option<String>,

        /// Only chunks from files with this extension (e.g. `pdf`).
        #[arg(long)]
        ext: Option<String>,

        /// Only documents modified on or after this date (YYYY-MM-DD).
        #[arg(long)]
        since: Option<String>,

        /// Only documents modified on or before this date (YYYY-MM-DD).
        #[arg(long)]
        until: Option<String>,

        /// Lowest page number (PDF pages, XLSX sheets).
        #[arg(long)]
        page_min: Option<u32>,

        /// Highest page number.
        #[arg(long)]
        page_max: Option<u32>,

        #[arg(long)]
        json: bool,
    },
}

fn init_tracing(verbose: bool) {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else if verbose {
        EnvFilter::new("warn,corpus_sync=debug,csync=debug")
    } else {
        EnvFilter::new("warn,corpus_sync=info,csync=info")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn parse_progress(mode: &str) -> Result<ProgressMode> {
    match mode {
        "auto" => Ok(ProgressMode::default_for_tty()),
        "human" => Ok(ProgressMode::Human),
        "json" => Ok(ProgressMode::Json),
        "off" => Ok(ProgressMode::Off),
        other => bail!(
            "Unknown progress mode: '{}'. Use auto, human, json, or off.",
            other
        ),
    }
}

/// Start (or end) of a `YYYY-MM-DD` day as Unix seconds.
fn parse_day(value: &str, end_of_day: bool) -> Result<i64> {
    let date = NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .with_context(|| format!("Invalid date '{}', expected YYYY-MM-DD", value))?;
    let time = if end_of_day {
        date.and_hms_opt(23, 59, 59)
    } else {
        date.and_hms_opt(0, 0, 0)
    };
    Ok(time
        .with_context(|| format!("Invalid date '{}'", value))?
        .and_utc()
        .timestamp())
}

async fn run_init(cfg: &Config) -> Result<()> {
    ChunkStore::open(&cfg.store.root)
        .await
        .with_context(|| format!("Failed to create chunk store at {}", cfg.store.root.display()))?;
    println!("Chunk store ready at {}", cfg.store.root.display());

    if cfg.embedding.is_enabled() {
        let index = SqliteIndex::open(&cfg.index.path).await?;
        index.close().await;
        println!("Index initialized at {}", cfg.index.path.display());
    } else {
        println!("Embedding disabled; no index created.");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => run_init(&cfg).await?,
        Commands::Sync {
            fail_fast,
            retry_failed,
            doc_ids,
            preset,
            workers,
            progress,
            json,
        } => {
            cfg.run.fail_fast |= fail_fast;
            cfg.run.retry_failed_only |= retry_failed;
            cfg.run.doc_id_filter.extend(doc_ids);
            if let Some(preset) = preset {
                cfg.normalization.preset = preset;
            }
            if let Some(workers) = workers {
                cfg.run.workers = workers;
            }
            config::validate(&cfg)?;

            let orchestrator = Orchestrator::from_config(&cfg)
                .await?
                .with_progress(parse_progress(&progress)?.reporter());
            let report = orchestrator.run(&cfg.corpus).await?;
            stats::print_report(&report, json)?;
            if !report.is_success() {
                std::io::stdout().flush()?;
                std::process::exit(1);
            }
        }
        Commands::Status => stats::run_status(&cfg).await?,
        Commands::Failures { json } => stats::run_failures(&cfg, json).await?,
        Commands::Search {
            query,
            k,
            doc_id,
            ext,
            since,
            until,
            page_min,
            page_max,
            json,
        } => {
            let filter = IndexFilter {
                doc_id,
                file_extension: ext,
                timestamp_min: since.as_deref().map(|s| parse_day(s, false)).transpose()?,
                timestamp_max: until.as_deref().map(|s| parse_day(s, true)).transpose()?,
                page_min,
                page_max,
            };
            search::run_search(&cfg, &query, k, filter, json).await?;
        }
    }

    Ok(())
}
