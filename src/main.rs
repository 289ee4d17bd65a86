use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use cellwatch::config::AppConfig;
use cellwatch::orchestrator::RunOrchestrator;

/// LiFePO4 cell catalog monitor: scrape, probe, diff, notify.
///
/// One invocation is one run; scheduling is cron's job.
#[derive(Parser, Debug)]
#[command(name = "cellwatch", version, about)]
struct Cli {
    /// Compose and log notifications without sending them
    #[arg(long)]
    dry_run: bool,

    /// Config layer to use (reads config/<run_mode>.*), defaults to RUN_MODE
    #[arg(long)]
    run_mode: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let file_appender = tracing_appender::rolling::daily("logs", "cellwatch.log");
    let (file_writer, _guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,cellwatch=debug")),
        )
        .with(fmt::layer())
        .with(fmt::layer().with_ansi(false).with_writer(file_writer))
        .init();

    info!("Starting cellwatch...");

    let config = AppConfig::load(cli.run_mode.as_deref())?;
    let orchestrator = RunOrchestrator::new(config);
    let report = orchestrator.run_once(cli.dry_run).await?;

    if report.skipped {
        warn!("run skipped: another run holds the lock");
        return Ok(());
    }

    for warning in &report.warnings {
        warn!("{warning}");
    }
    info!(
        products = report.products,
        events = report.events.len(),
        sent = report.messages_sent,
        "cellwatch finished"
    );

    Ok(())
}
