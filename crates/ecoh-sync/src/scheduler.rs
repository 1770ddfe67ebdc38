use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler, JobSchedulerError};
use tracing::{info, warn};

use crate::cancel::CycleCancel;
use crate::config::HarvestSchedule;
use crate::orchestrator::HarvestOrchestrator;
use crate::report::CycleSummary;

/// Runs harvest cycles on a schedule. At most one cycle runs at a time;
/// a tick that fires while a cycle is in flight is skipped.
pub struct HarvestScheduler {
    orchestrator: Arc<HarvestOrchestrator>,
    schedule: HarvestSchedule,
    guard: Arc<Mutex<()>>,
    cancel: CycleCancel,
    scheduler: Option<JobScheduler>,
}

impl HarvestScheduler {
    pub fn new(orchestrator: Arc<HarvestOrchestrator>, schedule: HarvestSchedule) -> Self {
        Self {
            orchestrator,
            schedule,
            guard: Arc::new(Mutex::new(())),
            cancel: CycleCancel::new(),
            scheduler: None,
        }
    }

    /// Handle that stops the running cycle and every later one.
    pub fn cancel_handle(&self) -> CycleCancel {
        self.cancel.clone()
    }

    /// Run one cycle now unless another one is in flight.
    pub async fn run_now(&self, initial: bool) -> Option<CycleSummary> {
        run_guarded(&self.orchestrator, &self.guard, &self.cancel, initial).await
    }

    /// Register the incremental job and start ticking.
    pub async fn start(&mut self) -> Result<()> {
        let sched = JobScheduler::new().await.context("creating scheduler")?;

        let orchestrator = self.orchestrator.clone();
        let guard = self.guard.clone();
        let cancel = self.cancel.clone();
        let job = build_job(&self.schedule, move || {
            let orchestrator = orchestrator.clone();
            let guard = guard.clone();
            let cancel = cancel.clone();
            async move {
                if let Some(summary) = run_guarded(&orchestrator, &guard, &cancel, false).await {
                    info!(
                        run_id = %summary.run_id,
                        added = summary.records_added(),
                        failures = summary.failures(),
                        cancelled = summary.cancelled,
                        "scheduled harvest cycle complete"
                    );
                }
            }
        })
        .with_context(|| format!("creating scheduler job for {}", self.schedule))?;

        sched.add(job).await.context("adding scheduler job")?;
        sched.start().await.context("starting scheduler")?;
        info!(schedule = %self.schedule, "harvest scheduler started");
        self.scheduler = Some(sched);
        Ok(())
    }

    /// Cancel the running cycle, wait for it to wind down, then stop ticking.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.cancel.cancel();
        let _idle = self.guard.lock().await;
        if let Some(mut sched) = self.scheduler.take() {
            sched.shutdown().await.context("stopping scheduler")?;
            info!("harvest scheduler stopped");
        }
        Ok(())
    }
}

fn build_job<F, Fut>(schedule: &HarvestSchedule, tick: F) -> Result<Job, JobSchedulerError>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    match schedule {
        HarvestSchedule::Interval(every) => {
            Job::new_repeated_async(*every, move |_uuid, _l| Box::pin(tick()))
        }
        HarvestSchedule::Cron(expr) => {
            Job::new_async(expr.as_str(), move |_uuid, _l| Box::pin(tick()))
        }
    }
}

async fn run_guarded(
    orchestrator: &HarvestOrchestrator,
    guard: &Mutex<()>,
    cancel: &CycleCancel,
    initial: bool,
) -> Option<CycleSummary> {
    if cancel.is_cancelled() {
        return None;
    }
    let Ok(_running) = guard.try_lock() else {
        warn!("previous harvest cycle still running; skipping this tick");
        return None;
    };
    Some(orchestrator.run_cycle(initial, cancel).await)
}
