//! Harvest pipeline orchestration: primary fetch, geo-point discovery,
//! fan-out, scheduling.

pub mod cancel;
pub mod config;
pub mod discovery;
pub mod fanout;
pub mod orchestrator;
pub mod report;
pub mod scheduler;

use std::sync::Arc;

use anyhow::Result;
use ecoh_storage::FileDiagnostics;

pub use cancel::CycleCancel;
pub use config::{HarvestConfig, HarvestSchedule, DEFAULT_BASE_URL, DEFAULT_SCHEDULE_INTERVAL};
pub use discovery::GeoPointIndex;
pub use fanout::{expand_embedded, FanOutHarvester, EXPANDED_FIELD};
pub use orchestrator::{CyclePhase, HarvestOrchestrator};
pub use report::{CategoryReport, CycleSummary, EndpointReport, PersistStatus, TargetReport};
pub use scheduler::HarvestScheduler;

pub const CRATE_NAME: &str = "ecoh-sync";

/// Build an orchestrator with file diagnostics under `config.log_dir`.
pub async fn orchestrator_from_config(config: &HarvestConfig) -> Result<HarvestOrchestrator> {
    let registry = config.load_registry()?;
    let diagnostics = Arc::new(FileDiagnostics::open(config.log_dir.clone())?);
    let orchestrator = HarvestOrchestrator::new(config, &registry, diagnostics)?;
    orchestrator.prepare_directories().await?;
    Ok(orchestrator)
}
