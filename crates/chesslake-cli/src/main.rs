use anyhow::{bail, Result};
use chesslake_core::{Period, Platform};
use chesslake_sync::{previous_period, ExtractPipeline, LoadPipeline, PipelineConfig, RunSummary};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "chesslake")]
#[command(about = "Extract chess.com and lichess game history and load it into a warehouse")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Extract one month of games (default: last month).
    Extract {
        #[arg(long)]
        platform: Platform,
        #[arg(long)]
        period: Option<Period>,
    },
    /// Extract every month in an inclusive range.
    Backfill {
        #[arg(long)]
        platform: Platform,
        #[arg(long)]
        from: Period,
        #[arg(long)]
        to: Period,
    },
    /// Extract games played between two dates, one file per month.
    ExtractRange {
        #[arg(long)]
        platform: Platform,
        #[arg(long)]
        since: Option<NaiveDate>,
        #[arg(long)]
        until: Option<NaiveDate>,
    },
    /// Load one month's file into the warehouse (default: last month).
    Load {
        #[arg(long)]
        platform: Platform,
        #[arg(long)]
        period: Option<Period>,
    },
    /// Load every month in an inclusive range, skipping missing files.
    LoadBackfill {
        #[arg(long)]
        platform: Platform,
        #[arg(long)]
        from: Period,
        #[arg(long)]
        to: Period,
    },
}

fn print_run(label: &str, summary: &RunSummary) -> Result<()> {
    for report in &summary.periods {
        println!(
            "{} {}: {} written, {} skipped -> {}",
            report.platform,
            report.period,
            report.written,
            report.skipped,
            report.path.display()
        );
    }
    println!(
        "{label} complete: run_id={} platform={} periods={} games={} failed={}",
        summary.run_id,
        summary.platform,
        summary.periods.len(),
        summary.games_written(),
        summary.failed.len()
    );
    for failed in &summary.failed {
        eprintln!("{} failed: {}", failed.period, failed.error);
    }
    if !summary.failed.is_empty() {
        bail!("{} period(s) failed", summary.failed.len());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = PipelineConfig::from_env()?;

    match cli.command {
        Commands::Extract { platform, period } => {
            let period = period.unwrap_or_else(previous_period);
            let report = ExtractPipeline::from_config(&config, platform)?
                .extract_period(period)
                .await?;
            println!(
                "extract complete: {} {} written={} skipped={} path={}",
                report.platform,
                report.period,
                report.written,
                report.skipped,
                report.path.display()
            );
        }
        Commands::Backfill { platform, from, to } => {
            let summary = ExtractPipeline::from_config(&config, platform)?.backfill(from, to).await?;
            print_run("backfill", &summary)?;
        }
        Commands::ExtractRange { platform, since, until } => {
            let summary = ExtractPipeline::from_config(&config, platform)?
                .extract_range(since, until)
                .await?;
            print_run("extract-range", &summary)?;
        }
        Commands::Load { platform, period } => {
            let period = period.unwrap_or_else(previous_period);
            let report = LoadPipeline::from_config(&config, platform)?.load_period(period).await?;
            println!("{}", report.message);
        }
        Commands::LoadBackfill { platform, from, to } => {
            let pipeline = LoadPipeline::from_config(&config, platform)?;
            let summary = pipeline.load_backfill(from, to).await?;
            for report in &summary.loads {
                println!("{}: {}", report.period, report.message);
            }
            info!(table = %pipeline.table(), missing = summary.missing.len(), "load backfill finished");
            println!(
                "load-backfill complete: files={} rows={} missing={}",
                summary.loads.len(),
                summary.rows_loaded(),
                summary.missing.len()
            );
        }
    }

    Ok(())
}
