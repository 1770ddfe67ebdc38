//! One harvest cycle: primary collections, then per-category discovery and
//! fan-out.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::Local;
use ecoh_adapters::{
    CategoryPlan, EndpointRegistry, NoteSeverity, PlannedEndpoint, TransformContext,
};
use ecoh_core::{Category, GeoPointId};
use ecoh_storage::{
    DiagnosticSink, MergeMode, PoliteFetcher, ScopedLog, SnapshotId, SnapshotStore,
};
use futures::future::join_all;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::cancel::CycleCancel;
use crate::config::HarvestConfig;
use crate::discovery::GeoPointIndex;
use crate::fanout::FanOutHarvester;
use crate::report::{CategoryReport, CycleSummary, EndpointReport, PersistStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CyclePhase {
    Idle,
    FetchingPrimary,
    Persisting,
    DiscoveringTargets,
    FanningOut,
}

impl fmt::Display for CyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CyclePhase::Idle => "idle",
            CyclePhase::FetchingPrimary => "fetching_primary",
            CyclePhase::Persisting => "persisting",
            CyclePhase::DiscoveringTargets => "discovering_targets",
            CyclePhase::FanningOut => "fanning_out",
        })
    }
}

pub struct HarvestOrchestrator {
    plans: Vec<CategoryPlan>,
    fetcher: Arc<PoliteFetcher>,
    store: Arc<SnapshotStore>,
    diagnostics: Arc<dyn DiagnosticSink>,
    index: GeoPointIndex,
    fanout: FanOutHarvester,
}

impl HarvestOrchestrator {
    pub fn new(
        config: &HarvestConfig,
        registry: &EndpointRegistry,
        diagnostics: Arc<dyn DiagnosticSink>,
    ) -> Result<Self> {
        let fetcher = Arc::new(PoliteFetcher::new(config.http.clone(), diagnostics.clone())?);
        let store = Arc::new(SnapshotStore::new(config.data_dir.clone()));
        Ok(Self {
            plans: registry.plan(&config.base_url),
            index: GeoPointIndex::new(store.clone(), diagnostics.clone()),
            fanout: FanOutHarvester::new(
                fetcher.clone(),
                store.clone(),
                diagnostics.clone(),
                config.base_url.clone(),
            ),
            fetcher,
            store,
            diagnostics,
        })
    }

    /// Create every category directory. Failing here is the only fatal error
    /// of the pipeline.
    pub async fn prepare_directories(&self) -> Result<()> {
        for plan in &self.plans {
            let dir = self.store.category_dir(plan.category);
            tokio::fs::create_dir_all(&dir)
                .await
                .with_context(|| format!("creating data directory {}", dir.display()))?;
        }
        Ok(())
    }

    /// Geo points the fan-out phase would target for `category` right now.
    pub async fn discover(&self, category: Category) -> Option<BTreeSet<GeoPointId>> {
        let plan = self.plans.iter().find(|p| p.category == category)?;
        Some(self.index.discover(category, &plan.discovery).await)
    }

    /// Run one full cycle. Individual failures are reported, never raised.
    /// Once `cancel` fires, in-flight fetches are abandoned and no further
    /// snapshot is started; a write already under way completes.
    pub async fn run_cycle(&self, initial: bool, cancel: &CycleCancel) -> CycleSummary {
        let run_id = Uuid::new_v4();
        let span = info_span!("harvest_cycle", %run_id, initial);
        self.run_cycle_inner(run_id, initial, cancel)
            .instrument(span)
            .await
    }

    async fn run_cycle_inner(
        &self,
        run_id: Uuid,
        initial: bool,
        cancel: &CycleCancel,
    ) -> CycleSummary {
        let started_at = Local::now();
        let clock = Instant::now();
        let mode = MergeMode::from_initial(initial);
        let ctx = TransformContext::now();
        info!(categories = self.plans.len(), "harvest cycle started");

        let categories = join_all(
            self.plans
                .iter()
                .map(|plan| self.harvest_category(plan, mode, &ctx, cancel)),
        )
        .await;

        let summary = CycleSummary {
            run_id,
            initial,
            cancelled: cancel.is_cancelled(),
            started_at,
            finished_at: Local::now(),
            elapsed: clock.elapsed(),
            categories,
        };
        info!(
            phase = %CyclePhase::Idle,
            endpoints = summary.endpoint_count(),
            targets = summary.target_count(),
            added = summary.records_added(),
            failures = summary.failures(),
            cancelled = summary.cancelled,
            elapsed_ms = summary.elapsed.as_millis() as u64,
            "harvest cycle finished"
        );
        summary
    }

    async fn harvest_category(
        &self,
        plan: &CategoryPlan,
        mode: MergeMode,
        ctx: &TransformContext,
        cancel: &CycleCancel,
    ) -> CategoryReport {
        let category = plan.category;
        info!(%category, phase = %CyclePhase::FetchingPrimary, endpoints = plan.endpoints.len());
        let endpoints = join_all(
            plan.endpoints
                .iter()
                .map(|endpoint| self.harvest_endpoint(category, endpoint, mode, ctx, cancel)),
        )
        .await;

        if cancel.is_cancelled() {
            warn!(%category, "cycle cancelled; skipping discovery and fan-out");
            return CategoryReport {
                category,
                endpoints,
                targets: Vec::new(),
            };
        }

        info!(%category, phase = %CyclePhase::DiscoveringTargets);
        let targets = self.index.discover(category, &plan.discovery).await;

        info!(%category, phase = %CyclePhase::FanningOut, targets = targets.len());
        let targets = self
            .fanout
            .harvest(category, &plan.discovery, &targets, mode, cancel)
            .await;

        CategoryReport {
            category,
            endpoints,
            targets,
        }
    }

    async fn harvest_endpoint(
        &self,
        category: Category,
        endpoint: &PlannedEndpoint,
        mode: MergeMode,
        ctx: &TransformContext,
        cancel: &CycleCancel,
    ) -> EndpointReport {
        let spec = &endpoint.spec;
        let log = ScopedLog::new(self.diagnostics.clone(), spec.name.clone());
        let collection = spec.collection_name();
        let mut report = EndpointReport {
            name: spec.name.clone(),
            collection: collection.clone(),
            attempts: 0,
            fetched: 0,
            skipped: 0,
            status: PersistStatus::NothingFetched,
        };

        if cancel.is_cancelled() {
            report.status = PersistStatus::Cancelled;
            return report;
        }
        let outcome = tokio::select! {
            outcome = self.fetcher.fetch(&spec.name, &spec.url) => outcome,
            _ = cancel.cancelled() => {
                log.warn("fetch abandoned: cycle cancelled");
                report.status = PersistStatus::Cancelled;
                return report;
            }
        };
        report.attempts = outcome.attempts;
        let response = match outcome.result {
            Ok(response) => response,
            Err(err) => {
                report.status = PersistStatus::failed(err);
                return report;
            }
        };
        report.fetched = response.nodes.len();
        if response.is_empty() {
            log.info("response carried no nodes");
            return report;
        }

        let mut records = Vec::with_capacity(response.nodes.len());
        for node in response.node_bodies() {
            match endpoint.transform.transform(node, ctx) {
                Ok(transformed) => {
                    for note in &transformed.notes {
                        match note.severity {
                            NoteSeverity::Info => log.info(&note.message),
                            NoteSeverity::Warn => log.warn(&note.message),
                            NoteSeverity::Error => log.error(&note.message),
                        }
                    }
                    records.push(transformed.record);
                }
                Err(err) => {
                    report.skipped += 1;
                    log.warn(format!("skipping node: {err}"));
                }
            }
        }

        if cancel.is_cancelled() {
            report.status = PersistStatus::Cancelled;
            return report;
        }
        info!(endpoint = %spec.name, phase = %CyclePhase::Persisting, records = records.len());
        let id = SnapshotId::Collection {
            category,
            name: &collection,
        };
        report.status = PersistStatus::from_merge(self.store.merge(id, records, mode).await);
        match &report.status {
            PersistStatus::Failed { reason } => log.error(format!("{id}: {reason}")),
            status => log.info(format!("{id}: {status}")),
        }
        report
    }
}
