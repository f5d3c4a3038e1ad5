//! # Ingest Harness CLI (`ingest`)
//!
//! The `ingest` binary drives incremental scans of a document directory,
//! previews what a scan would do, pages through the ingestion ledger, and
//! searches the vector index.
//!
//! ## Usage
//!
//! ```bash
//! ingest --config ./config/ingest.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `ingest init` | Create the SQLite database, tables and index directory |
//! | `ingest preview` | Count new, modified and unchanged files without writing |
//! | `ingest scan` | Ingest new and modified files |
//! | `ingest stats` | Show one page of the ingestion ledger |
//! | `ingest search "<query>"` | Nearest chunks to a query |
//!
//! Logs go to stderr (`RUST_LOG` overrides the default `warn` level); command
//! output goes to stdout.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

use ingest_harness::config::{self, Config};
use ingest_harness::coordinator::IngestionCoordinator;
use ingest_harness::embedding::create_embedder;
use ingest_harness::progress::ProgressMode;
use ingest_harness::storage::FsStorage;
use ingest_harness::{db, stats};

/// Ingest Harness CLI: incremental document ingestion with a durable vector
/// index and a paginated ingestion ledger.
#[derive(Parser)]
#[command(
    name = "ingest",
    about = "Incremental document ingestion with a durable vector index",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/ingest.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema and index directory.
    ///
    /// Idempotent: running it multiple times is safe.
    Init,

    /// Show what a scan would do without embedding or writing anything.
    Preview {
        /// Directory to scan. Defaults to `[connectors.filesystem] root`.
        #[arg(long)]
        source: Option<PathBuf>,

        /// File extension to include (repeatable). Replaces the configured
        /// include globs.
        #[arg(long = "type")]
        file_types: Vec<String>,

        /// Print the summary as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Ingest new and modified files. Ctrl-C stops after the current file.
    Scan {
        /// Directory to scan. Defaults to `[connectors.filesystem] root`.
        #[arg(long)]
        source: Option<PathBuf>,

        /// File extension to include (repeatable).
        #[arg(long = "type")]
        file_types: Vec<String>,

        /// Report what would be processed without embedding or writing.
        #[arg(long)]
        dry_run: bool,

        /// Print the summary as JSON.
        #[arg(long)]
        json: bool,

        /// Progress on stderr: `off`, `human`, or `json`. Defaults to human
        /// on a terminal, off otherwise.
        #[arg(long, value_parser = parse_progress_mode)]
        progress: Option<ProgressMode>,
    },

    /// Show one page of the ingestion ledger, most recent first.
    Stats {
        /// Page number, starting at 1.
        #[arg(long, default_value_t = 1)]
        page: u64,

        /// Records per page. Defaults to `[stats] page_size`.
        #[arg(long)]
        page_size: Option<u64>,

        /// Print the page as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Search the vector index.
    Search {
        /// The search query string.
        query: String,

        /// Number of results.
        #[arg(long, default_value_t = 10)]
        k: usize,

        /// Print results as JSON.
        #[arg(long)]
        json: bool,
    },
}

fn parse_progress_mode(s: &str) -> Result<ProgressMode, String> {
    match s {
        "off" => Ok(ProgressMode::Off),
        "human" => Ok(ProgressMode::Human),
        "json" => Ok(ProgressMode::Json),
        other => Err(format!(
            "invalid progress mode '{}': expected off, human, or json",
            other
        )),
    }
}

fn init_logging() {
    // warn+ to stderr unless RUST_LOG overrides
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();
}

fn resolve_source(cfg: &Config, source: Option<PathBuf>) -> Result<PathBuf> {
    match source {
        Some(path) => Ok(path),
        None => match &cfg.connectors.filesystem {
            Some(fs) => Ok(fs.root.clone()),
            None => bail!("No --source given and [connectors.filesystem] root is not configured"),
        },
    }
}

async fn open_coordinator(cfg: &Config) -> Result<IngestionCoordinator> {
    let embedder = create_embedder(&cfg.embedding).context("Failed to create embedder")?;
    IngestionCoordinator::open(cfg, embedder)
        .await
        .with_context(|| format!("Failed to open store at {}", cfg.db.path.display()))
}

/// Database-only coordinator for commands that never embed or search.
async fn open_ledger_only(cfg: &Config) -> Result<IngestionCoordinator> {
    IngestionCoordinator::open_without_index(cfg)
        .await
        .with_context(|| format!("Failed to open database {}", cfg.db.path.display()))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run_init(cfg: &Config) -> Result<()> {
    let pool = db::open(&cfg.db.path)
        .await
        .with_context(|| format!("Failed to initialize database {}", cfg.db.path.display()))?;
    pool.close().await;
    FsStorage::new(cfg.index.dir.clone())
        .with_context(|| format!("Failed to create index dir {}", cfg.index.dir.display()))?;
    println!("Database initialized successfully.");
    Ok(())
}

async fn run_preview(cfg: &Config, source: &Path, file_types: &[String], json: bool) -> Result<()> {
    let coordinator = open_ledger_only(cfg).await?;
    let summary = coordinator.preview(source, file_types).await?;
    if json {
        return print_json(&summary);
    }
    println!("preview {}", source.display());
    println!("  files found: {}", summary.total_found);
    println!("  new or modified: {}", summary.new_or_modified);
    println!("  already processed: {}", summary.already_processed);
    println!("  unreadable: {}", summary.unreadable);
    println!("  efficiency: {:.1}%", summary.efficiency_ratio * 100.0);
    Ok(())
}

async fn run_scan(
    cfg: &Config,
    source: &Path,
    file_types: &[String],
    dry_run: bool,
    json: bool,
    progress: ProgressMode,
) -> Result<()> {
    let coordinator = open_coordinator(cfg)
        .await?
        .with_progress(progress.reporter());

    let cancel = coordinator.cancel_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("cancelling after the current file...");
            cancel.cancel();
        }
    });

    let summary = coordinator.scan(source, file_types, dry_run).await?;
    if json {
        return print_json(&summary);
    }

    let suffix = if summary.dry_run { " (dry-run)" } else { "" };
    println!("scan {}{}", source.display(), suffix);
    println!("  files found: {}", summary.total_found);
    println!("  new or modified: {}", summary.new_files);
    println!("  already processed: {}", summary.already_processed);
    println!("  failed: {}", summary.failed);
    if !summary.dry_run {
        println!("  chunks written: {}", summary.chunks_written);
    }
    println!("  efficiency: {:.1}%", summary.efficiency_ratio * 100.0);
    if summary.cancelled {
        println!("cancelled");
    } else {
        println!("ok");
    }
    Ok(())
}

async fn run_stats(cfg: &Config, page: u64, page_size: Option<u64>, json: bool) -> Result<()> {
    let coordinator = open_ledger_only(cfg).await?;
    let ledger_page = coordinator.get_stats(page, page_size).await?;
    if json {
        return print_json(&ledger_page);
    }
    let counts = coordinator.ledger().status_counts(None).await?;
    print!(
        "{}",
        stats::render_page(&ledger_page, &counts, chrono::Utc::now())
    );
    Ok(())
}

async fn run_search(cfg: &Config, query: &str, k: usize, json: bool) -> Result<()> {
    let coordinator = open_coordinator(cfg).await?;
    let hits = coordinator.search(query, k).await?;
    if json {
        return print_json(&hits);
    }
    if hits.is_empty() {
        println!("No results.");
        return Ok(());
    }
    for (rank, hit) in hits.iter().enumerate() {
        println!("{:>3}. {:.4}  {}", rank + 1, hit.distance, hit.chunk_id);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging();

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => run_init(&cfg).await?,
        Commands::Preview {
            source,
            file_types,
            json,
        } => {
            let source = resolve_source(&cfg, source)?;
            run_preview(&cfg, &source, &file_types, json).await?;
        }
        Commands::Scan {
            source,
            file_types,
            dry_run,
            json,
            progress,
        } => {
            let source = resolve_source(&cfg, source)?;
            let progress = progress.unwrap_or_else(ProgressMode::default_for_tty);
            run_scan(&cfg, &source, &file_types, dry_run, json, progress).await?;
        }
        Commands::Stats {
            page,
            page_size,
            json,
        } => run_stats(&cfg, page, page_size, json).await?,
        Commands::Search { query, k, json } => run_search(&cfg, &query, k, json).await?,
    }

    Ok(())
}
