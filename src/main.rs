// =============================================================================
// kline-ingest: Main Entry Point
// =============================================================================
//
// Loads the ingestion config, installs logging, wires the sources and runs
// every task once.  Ctrl+C cancels whatever is still running; the tasks that
// finished are still reported.
// =============================================================================

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use kline_ingest::config::IngestionConfig;
use kline_ingest::ingestion::Ingestion;
use kline_ingest::{bootstrap, logging};

#[derive(Parser)]
#[command(name = "kline-ingest")]
#[command(about = "Fetch historical klines for every configured task", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to the JSON ingestion config
    #[arg(short, long)]
    config: PathBuf,

    /// Override `logging.level` (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Override `runner.max_concurrent_tasks`
    #[arg(long)]
    concurrency: Option<usize>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    let mut config = IngestionConfig::load(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    if let Some(n) = cli.concurrency {
        config.runner.max_concurrent_tasks = n;
    }

    // ── 2. Logging (guard flushes the file writer on exit) ───────────────
    let _log_guard = logging::init(&config.logging)?;
    info!(
        config = %cli.config.display(),
        tasks = config.tasks.len(),
        concurrency = config.runner.max_concurrent_tasks,
        "kline-ingest starting"
    );

    // ── 3. Sources ───────────────────────────────────────────────────────
    let registry = bootstrap::build_registry(&config).context("failed to set up data sources")?;

    // ── 4. Cancellation on Ctrl+C ────────────────────────────────────────
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("shutdown signal received, cancelling remaining tasks");
                cancel.cancel();
            }
        });
    }

    // ── 5. Run ───────────────────────────────────────────────────────────
    let report = Ingestion::new(registry)
        .with_concurrency(config.runner.max_concurrent_tasks)
        .with_cancellation(cancel)
        .run(&config)
        .await;

    for outcome in &report.outcomes {
        match &outcome.result {
            Ok(data) => {
                println!("[{}]", outcome.name);
                for (symbol, series) in &data.series {
                    println!("{symbol}: {} rows fetched", series.len());
                }
                for (symbol, err) in &data.skipped {
                    println!("{symbol}: skipped ({err})");
                }
            }
            Err(e) => println!("[{}] failed: {e}", outcome.name),
        }
    }

    Ok(())
}
