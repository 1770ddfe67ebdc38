use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use ecoh_core::Category;
use ecoh_sync::{
    orchestrator_from_config, CycleCancel, CycleSummary, HarvestConfig, HarvestScheduler,
};
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "ecoh-cli")]
#[command(about = "Incremental environmental-records harvester")]
struct Cli {
    /// Root directory for category snapshots (overrides ECOH_DATA_DIR).
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    /// Directory for per-endpoint diagnostic logs (overrides ECOH_LOG_DIR).
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run a single harvest cycle and exit.
    Run {
        /// Replace snapshots instead of extending them.
        #[arg(long)]
        initial: bool,
    },
    /// Run an initial cycle, then an incremental one on every schedule tick.
    Schedule,
    /// Print the geo points the fan-out phase would target.
    Discover { category: String },
    /// List the configured endpoints.
    Endpoints,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = HarvestConfig::from_env();
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }
    if let Some(dir) = cli.log_dir {
        config.log_dir = dir;
    }

    match cli.command.unwrap_or(Commands::Schedule) {
        Commands::Run { initial } => {
            let orchestrator = orchestrator_from_config(&config).await?;
            let cancel = CycleCancel::new();
            cancel_on_ctrl_c(cancel.clone());
            let summary = orchestrator.run_cycle(initial, &cancel).await;
            print_summary(&summary);
        }
        Commands::Schedule => {
            let orchestrator = Arc::new(orchestrator_from_config(&config).await?);
            let mut scheduler = HarvestScheduler::new(orchestrator, config.schedule.clone());
            let cancel = scheduler.cancel_handle();
            cancel_on_ctrl_c(cancel.clone());

            if let Some(summary) = scheduler.run_now(true).await {
                print_summary(&summary);
            }
            if cancel.is_cancelled() {
                return Ok(());
            }

            scheduler.start().await?;
            cancel.cancelled().await;
            info!("shutting down");
            scheduler.shutdown().await?;
        }
        Commands::Discover { category } => {
            let Some(category) = Category::parse(&category) else {
                bail!("unknown category {category:?}");
            };
            let orchestrator = orchestrator_from_config(&config).await?;
            match orchestrator.discover(category).await {
                Some(points) => {
                    for point in &points {
                        println!("{point}");
                    }
                    eprintln!("{} geo points in {category}", points.len());
                }
                None => bail!("category {category} has no configured endpoints"),
            }
        }
        Commands::Endpoints => {
            let registry = config.load_registry()?;
            for plan in registry.plan(&config.base_url) {
                println!("{} ({:?})", plan.category, plan.discovery);
                for endpoint in plan.endpoints {
                    println!(
                        "  {:<40} {}",
                        endpoint.spec.collection_name(),
                        endpoint.spec.url
                    );
                }
            }
        }
    }

    Ok(())
}

/// First Ctrl-C stops the cycle cooperatively; snapshots being written finish.
fn cancel_on_ctrl_c(cancel: CycleCancel) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted; stopping after in-flight writes");
            cancel.cancel();
        }
    });
}

fn print_summary(summary: &CycleSummary) {
    for category in &summary.categories {
        for endpoint in &category.endpoints {
            println!(
                "{}/{}: {} ({} nodes, {} attempts)",
                category.category,
                endpoint.collection,
                endpoint.status,
                endpoint.fetched,
                endpoint.attempts
            );
        }
        for target in &category.targets {
            println!(
                "{}/point_{}: {}",
                category.category, target.geo_point, target.status
            );
        }
    }
    println!(
        "harvest {}: run_id={} endpoints={} targets={} added={} failures={} elapsed={:.1}s",
        if summary.cancelled { "cancelled" } else { "complete" },
        summary.run_id,
        summary.endpoint_count(),
        summary.target_count(),
        summary.records_added(),
        summary.failures(),
        summary.elapsed.as_secs_f64()
    );
}
