//! What one harvest cycle did, per category, endpoint and fan-out target.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Local};
use ecoh_core::{Category, GeoPointId};
use ecoh_storage::{MergeOutcome, SnapshotError};
use serde::Serialize;
use uuid::Uuid;

/// Result of fetching and persisting one snapshot. "Nothing new" and
/// "nothing fetched" are not failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PersistStatus {
    Written {
        previous: usize,
        added: usize,
        total: usize,
    },
    NoNewRecords {
        previous: usize,
    },
    NothingFetched,
    /// The cycle was stopped before this snapshot was written.
    Cancelled,
    Failed {
        reason: String,
    },
}

impl PersistStatus {
    pub fn failed(reason: impl fmt::Display) -> Self {
        PersistStatus::Failed {
            reason: reason.to_string(),
        }
    }

    pub fn from_merge(result: Result<MergeOutcome, SnapshotError>) -> Self {
        match result {
            Ok(MergeOutcome::Written {
                previous,
                added,
                total,
            }) => PersistStatus::Written {
                previous,
                added,
                total,
            },
            Ok(MergeOutcome::NoNewRecords { previous }) => PersistStatus::NoNewRecords { previous },
            Ok(MergeOutcome::NothingToPersist) => PersistStatus::NothingFetched,
            Err(err) => PersistStatus::failed(err),
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, PersistStatus::Failed { .. })
    }

    pub fn added(&self) -> usize {
        match self {
            PersistStatus::Written { added, .. } => *added,
            _ => 0,
        }
    }
}

impl fmt::Display for PersistStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PersistStatus::Written {
                previous,
                added,
                total,
            } => write!(f, "written (+{added}, {previous} -> {total})"),
            PersistStatus::NoNewRecords { previous } => write!(f, "no new records ({previous} kept)"),
            PersistStatus::NothingFetched => f.write_str("nothing fetched"),
            PersistStatus::Cancelled => f.write_str("cancelled"),
            PersistStatus::Failed { reason } => write!(f, "failed: {reason}"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EndpointReport {
    pub name: String,
    pub collection: String,
    pub attempts: u32,
    pub fetched: usize,
    pub skipped: usize,
    pub status: PersistStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct TargetReport {
    pub geo_point: GeoPointId,
    pub status: PersistStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct CategoryReport {
    pub category: Category,
    pub endpoints: Vec<EndpointReport>,
    pub targets: Vec<TargetReport>,
}

impl CategoryReport {
    pub fn failures(&self) -> usize {
        self.endpoints.iter().filter(|e| e.status.is_failure()).count()
            + self.targets.iter().filter(|t| t.status.is_failure()).count()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleSummary {
    pub run_id: Uuid,
    pub initial: bool,
    pub cancelled: bool,
    pub started_at: DateTime<Local>,
    pub finished_at: DateTime<Local>,
    pub elapsed: Duration,
    pub categories: Vec<CategoryReport>,
}

impl CycleSummary {
    pub fn endpoint_count(&self) -> usize {
        self.categories.iter().map(|c| c.endpoints.len()).sum()
    }

    pub fn target_count(&self) -> usize {
        self.categories.iter().map(|c| c.targets.len()).sum()
    }

    pub fn records_added(&self) -> usize {
        self.categories
            .iter()
            .flat_map(|c| {
                c.endpoints
                    .iter()
                    .map(|e| &e.status)
                    .chain(c.targets.iter().map(|t| &t.status))
            })
            .map(PersistStatus::added)
            .sum()
    }

    pub fn failures(&self) -> usize {
        self.categories.iter().map(CategoryReport::failures).sum()
    }

    pub fn category(&self, category: Category) -> Option<&CategoryReport> {
        self.categories.iter().find(|c| c.category == category)
    }
}
