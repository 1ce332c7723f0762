use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use recsync_sync::{pipeline_from_config, recent_runs_markdown, SyncConfig, SyncRunSummary};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "recsync")]
#[command(about = "Reconcile roster exports into a keyed Postgres table")]
struct Cli {
    /// Job config; overrides RECSYNC_CONFIG.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Reconcile an export and apply the changes.
    Sync {
        #[arg(long)]
        file: PathBuf,
    },
    /// Reconcile an export and report what would change, without writing.
    Plan {
        #[arg(long)]
        file: PathBuf,
    },
    /// Create the target table or verify an existing one.
    Migrate,
    /// Print a digest of recent runs.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
}

fn print_summary(verb: &str, summary: &SyncRunSummary) {
    let r = &summary.result;
    println!(
        "{verb}: run_id={} table={} inserted={} updated={} unchanged={} skipped={} reports={}",
        summary.run_id,
        summary.table,
        r.inserted,
        r.updated,
        r.unchanged,
        r.skipped,
        summary.report_dir.as_deref().unwrap_or("-")
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = SyncConfig::from_env();
    if let Some(path) = cli.config {
        config.job_config = path;
    }
    tracing::debug!(config = %config.job_config.display(), command = ?cli.command, "recsync starting");

    match cli.command {
        Commands::Sync { file } => {
            let summary = pipeline_from_config(&config).await?.run_file(&file).await?;
            print_summary("sync complete", &summary);
        }
        Commands::Plan { file } => {
            let summary = pipeline_from_config(&config).await?.plan_file(&file).await?;
            print_summary("plan (nothing written)", &summary);
        }
        Commands::Migrate => {
            let pipeline = pipeline_from_config(&config).await?;
            pipeline.migrate().await?;
            println!("table {} is ready", pipeline.schema().qualified_name());
        }
        Commands::Report { runs } => {
            println!("{}", recent_runs_markdown(&config.reports_dir, runs)?);
        }
    }

    Ok(())
}
