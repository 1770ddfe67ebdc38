//! Derive the fan-out targets of a category from its persisted snapshots.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ecoh_core::{Category, DiscoveryStrategy, GeoPointId, GEO_POINT_FIELD, NODE_ID_FIELD};
use ecoh_storage::{DiagnosticSink, ScopedLog, SnapshotStore};
use serde_json::Value as JsonValue;
use tokio::fs;

#[derive(Clone)]
pub struct GeoPointIndex {
    store: Arc<SnapshotStore>,
    diagnostics: Arc<dyn DiagnosticSink>,
}

/// Where to look for the geo point of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GeoField {
    Strict,
    FallbackToNodeId,
}

impl GeoField {
    fn extract(self, record: &JsonValue) -> Option<GeoPointId> {
        match (record.get(GEO_POINT_FIELD), self) {
            (Some(value), _) => GeoPointId::from_json(value),
            (None, GeoField::FallbackToNodeId) => {
                record.get(NODE_ID_FIELD).and_then(GeoPointId::from_json)
            }
            (None, GeoField::Strict) => None,
        }
    }
}

impl GeoPointIndex {
    pub fn new(store: Arc<SnapshotStore>, diagnostics: Arc<dyn DiagnosticSink>) -> Self {
        Self { store, diagnostics }
    }

    /// Distinct, valid geo points referenced by the category's snapshots.
    /// Unreadable files are logged and skipped; this never fails.
    pub async fn discover(
        &self,
        category: Category,
        strategy: &DiscoveryStrategy,
    ) -> BTreeSet<GeoPointId> {
        let log = ScopedLog::new(self.diagnostics.clone(), format!("{category}_geo_points"));
        let dir = self.store.category_dir(category);

        let (files, field) = match strategy {
            DiscoveryStrategy::SuffixScan { suffixes } => {
                let endings: Vec<String> = suffixes
                    .iter()
                    .map(|kind| format!("_{}.json", kind.suffix()))
                    .collect();
                (scan_dir(&dir, &endings, &log).await, GeoField::FallbackToNodeId)
            }
            DiscoveryStrategy::NamedCollections { collections } => (
                collections
                    .iter()
                    .map(|name| dir.join(format!("{name}.json")))
                    .collect(),
                GeoField::Strict,
            ),
            DiscoveryStrategy::RegroupLocal { collection } => {
                (vec![dir.join(format!("{collection}.json"))], GeoField::Strict)
            }
        };

        let mut points = BTreeSet::new();
        for path in files {
            match SnapshotStore::load_path(&path).await {
                Ok(Some(records)) => {
                    let before = points.len();
                    points.extend(records.iter().filter_map(|r| field.extract(r)));
                    log.debug(format!(
                        "{}: {} records, {} new geo points",
                        path.display(),
                        records.len(),
                        points.len() - before
                    ));
                }
                Ok(None) => log.warn(format!("{} does not exist", path.display())),
                Err(err) => log.error(format!("skipping {err}")),
            }
        }

        log.info(format!("{} geo points discovered for {category}", points.len()));
        points
    }
}

/// Top-level snapshot files in `dir` ending with one of `endings`, sorted.
async fn scan_dir(dir: &Path, endings: &[String], log: &ScopedLog) -> Vec<PathBuf> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) => {
            log.warn(format!("cannot list {}: {err}", dir.display()));
            return Vec::new();
        }
    };

    let mut files = Vec::new();
    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(err) => {
                log.warn(format!("error while listing {}: {err}", dir.display()));
                break;
            }
        };
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') || !endings.iter().any(|e| name.ends_with(e.as_str())) {
            continue;
        }
        if entry.file_type().await.map(|t| t.is_file()).unwrap_or(false) {
            files.push(entry.path());
        }
    }
    files.sort();
    files
}
