//! Per-geo-point harvesting into `point_data/` snapshots.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use ecoh_core::{
    decode_embedded, Category, DiscoveryStrategy, EmbeddedDoc, GeoPointId, IdentityConvention,
    NormalizedRecord, EMBEDDED_FIELD, GEO_POINT_FIELD, PERIOD_FIELD, UNKNOWN,
};
use ecoh_storage::{
    DiagnosticSink, MergeMode, PoliteFetcher, ScopedLog, SnapshotId, SnapshotStore,
};
use reqwest::Url;
use serde_json::{json, Value as JsonValue};

use crate::cancel::CycleCancel;
use crate::report::{PersistStatus, TargetReport};

/// Field the decoded embedded list is stored under in fan-out records.
pub const EXPANDED_FIELD: &str = "substances";

pub struct FanOutHarvester {
    fetcher: Arc<PoliteFetcher>,
    store: Arc<SnapshotStore>,
    diagnostics: Arc<dyn DiagnosticSink>,
    base_url: String,
}

impl FanOutHarvester {
    pub fn new(
        fetcher: Arc<PoliteFetcher>,
        store: Arc<SnapshotStore>,
        diagnostics: Arc<dyn DiagnosticSink>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            fetcher,
            store,
            diagnostics,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// `<base_url>/sources_values?geo_point=<id>`, with the id query-encoded.
    pub fn target_url(&self, geo_point: &GeoPointId) -> String {
        let endpoint = format!("{}/sources_values", self.base_url);
        match Url::parse_with_params(&endpoint, &[("geo_point", geo_point.as_str())]) {
            Ok(url) => url.to_string(),
            Err(_) => format!("{endpoint}?geo_point={geo_point}"),
        }
    }

    /// Harvest every target in order. One target's failure never stops the
    /// rest; cancellation marks the remaining targets `Cancelled`.
    pub async fn harvest(
        &self,
        category: Category,
        strategy: &DiscoveryStrategy,
        targets: &BTreeSet<GeoPointId>,
        mode: MergeMode,
        cancel: &CycleCancel,
    ) -> Vec<TargetReport> {
        match strategy {
            DiscoveryStrategy::RegroupLocal { collection } => {
                self.regroup_local(category, collection, targets, mode, cancel)
                    .await
            }
            DiscoveryStrategy::SuffixScan { .. } | DiscoveryStrategy::NamedCollections { .. } => {
                let mut reports = Vec::with_capacity(targets.len());
                for geo_point in targets {
                    let status = if cancel.is_cancelled() {
                        PersistStatus::Cancelled
                    } else {
                        self.harvest_remote(category, geo_point, mode, cancel).await
                    };
                    reports.push(TargetReport {
                        geo_point: geo_point.clone(),
                        status,
                    });
                }
                reports
            }
        }
    }

    async fn harvest_remote(
        &self,
        category: Category,
        geo_point: &GeoPointId,
        mode: MergeMode,
        cancel: &CycleCancel,
    ) -> PersistStatus {
        let scope = format!("sources_values_{geo_point}");
        let log = ScopedLog::new(self.diagnostics.clone(), scope.clone());
        let url = self.target_url(geo_point);

        let outcome = tokio::select! {
            outcome = self.fetcher.fetch(&scope, &url) => outcome,
            _ = cancel.cancelled() => {
                log.warn("fetch abandoned: cycle cancelled");
                return PersistStatus::Cancelled;
            }
        };
        let response = match outcome.result {
            Ok(response) => response,
            Err(err) => return PersistStatus::failed(err),
        };
        if response.is_empty() {
            log.info(format!("no data for geo point {geo_point}"));
            return PersistStatus::NothingFetched;
        }

        let mut records = Vec::with_capacity(response.nodes.len());
        for mut wrapper in response.nodes {
            expand_embedded(&mut wrapper, &log);
            match NormalizedRecord::from_value(IdentityConvention::Period, wrapper) {
                Some(record) => records.push(record),
                None => log.warn("skipping fan-out node without field_period"),
            }
        }

        if cancel.is_cancelled() {
            return PersistStatus::Cancelled;
        }
        let id = SnapshotId::Target {
            category,
            geo_point,
        };
        let status = PersistStatus::from_merge(self.store.merge(id, records, mode).await);
        log.info(format!("{id}: {status}"));
        status
    }

    /// Split one local collection into per-point snapshots without any
    /// network traffic.
    async fn regroup_local(
        &self,
        category: Category,
        collection: &str,
        targets: &BTreeSet<GeoPointId>,
        mode: MergeMode,
        cancel: &CycleCancel,
    ) -> Vec<TargetReport> {
        let log = ScopedLog::new(self.diagnostics.clone(), format!("{category}_regroup"));
        let source = SnapshotId::Collection {
            category,
            name: collection,
        };

        let records = match self.store.load(&source).await {
            Ok(Some(records)) => records,
            Ok(None) => {
                log.warn(format!("{source} does not exist; nothing to regroup"));
                return Vec::new();
            }
            Err(err) => {
                log.error(format!("cannot regroup: {err}"));
                return targets
                    .iter()
                    .map(|geo_point| TargetReport {
                        geo_point: geo_point.clone(),
                        status: PersistStatus::failed(&err),
                    })
                    .collect();
            }
        };

        let mut groups: BTreeMap<GeoPointId, Vec<NormalizedRecord>> = BTreeMap::new();
        for record in records {
            let Some(geo_point) = record.get(GEO_POINT_FIELD).and_then(GeoPointId::from_json) else {
                continue;
            };
            if !targets.contains(&geo_point) {
                continue;
            }
            match NormalizedRecord::from_value(IdentityConvention::Period, json!({ "node": record })) {
                Some(wrapped) => groups.entry(geo_point).or_default().push(wrapped),
                None => log.warn(format!("record for {geo_point} has no field_period")),
            }
        }

        let mut reports = Vec::with_capacity(targets.len());
        for geo_point in targets {
            let batch = groups.remove(geo_point).unwrap_or_default();
            let id = SnapshotId::Target {
                category,
                geo_point,
            };
            let status = if cancel.is_cancelled() {
                PersistStatus::Cancelled
            } else {
                PersistStatus::from_merge(self.store.merge(id, batch, mode).await)
            };
            log.debug(format!("{id}: {status}"));
            reports.push(TargetReport {
                geo_point: geo_point.clone(),
                status,
            });
        }
        log.info(format!("regrouped {collection} into {} point snapshots", reports.len()));
        reports
    }
}

/// Replace the wrapped node's embedded text document with its decoded list.
/// A malformed document, including the `"Unknown"` placeholder, leaves an
/// empty list next to the raw text; a missing or empty one leaves the node
/// untouched.
pub fn expand_embedded(wrapper: &mut JsonValue, log: &ScopedLog) {
    let decoded = match wrapper.get("node") {
        Some(node) => match node.get(EMBEDDED_FIELD).and_then(JsonValue::as_str) {
            Some(text) if text.trim() == UNKNOWN => Err(format!("{text:?} is not a JSON document")),
            _ => decode_embedded(node, EMBEDDED_FIELD).map_err(|err| err.to_string()),
        },
        None => return,
    };
    let Some(node) = wrapper.get_mut("node").and_then(JsonValue::as_object_mut) else {
        return;
    };

    match decoded {
        Ok(EmbeddedDoc::Absent) => {}
        Ok(doc) => {
            node.remove(EMBEDDED_FIELD);
            node.insert(EXPANDED_FIELD.into(), JsonValue::Array(doc.into_items()));
        }
        Err(err) => {
            let period = node
                .get(PERIOD_FIELD)
                .map(ToString::to_string)
                .unwrap_or_default();
            log.error(format!("failed to parse {EMBEDDED_FIELD} of period {period}: {err}"));
            node.insert(EXPANDED_FIELD.into(), JsonValue::Array(Vec::new()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ecoh_storage::{HttpClientConfig, JitterWindow, MemoryDiagnostics, NoopDiagnostics};

    fn harvester(root: &std::path::Path, base_url: &str) -> FanOutHarvester {
        let diagnostics: Arc<dyn DiagnosticSink> = Arc::new(NoopDiagnostics);
        let fetcher = PoliteFetcher::new(
            HttpClientConfig {
                jitter: JitterWindow::none(),
                ..Default::default()
            },
            diagnostics.clone(),
        )
        .expect("client");
        FanOutHarvester::new(
            Arc::new(fetcher),
            Arc::new(SnapshotStore::new(root)),
            diagnostics,
            base_url,
        )
    }

    #[test]
    fn target_url_encodes_the_id() {
        let dir = tempfile::tempdir().expect("tempdir");
        let h = harvester(dir.path(), "https://example.test/api/");
        let id = GeoPointId::new("12 A&B").expect("id");
        assert_eq!(
            h.target_url(&id),
            "https://example.test/api/sources_values?geo_point=12+A%26B"
        );
    }

    #[test]
    fn embedded_expansion_outcomes() {
        let sink = Arc::new(MemoryDiagnostics::new());
        let log = ScopedLog::new(sink.clone(), "sources_values_A");

        let mut ok = json!({ "node": { "field_period": "2024", "php": "[{\"v\":1}]" } });
        expand_embedded(&mut ok, &log);
        assert_eq!(ok["node"]["substances"], json!([{ "v": 1 }]));
        assert!(ok["node"].get("php").is_none());

        let mut bad = json!({ "node": { "field_period": "2024", "php": "not valid json" } });
        expand_embedded(&mut bad, &log);
        assert_eq!(bad["node"]["substances"], json!([]));
        assert_eq!(bad["node"]["php"], "not valid json");
        assert_eq!(sink.lines_for("sources_values_A").len(), 1);

        let mut absent = json!({ "node": { "field_period": "2024" } });
        let before = absent.clone();
        expand_embedded(&mut absent, &log);
        assert_eq!(absent, before);

        let mut empty = json!({ "node": { "field_period": "2024", "php": "[]" } });
        expand_embedded(&mut empty, &log);
        assert_eq!(empty["node"]["substances"], json!([]));
        assert!(empty["node"].get("php").is_none());

        let mut blank = json!({ "node": { "field_period": "2024", "php": "" } });
        let before = blank.clone();
        expand_embedded(&mut blank, &log);
        assert_eq!(blank, before);
    }

    #[test]
    fn unknown_placeholder_is_a_parse_failure_in_fan_out() {
        let sink = Arc::new(MemoryDiagnostics::new());
        let log = ScopedLog::new(sink.clone(), "sources_values_B");

        let mut node = json!({ "node": { "field_period": "2024", "php": "Unknown" } });
        expand_embedded(&mut node, &log);

        assert_eq!(node["node"]["substances"], json!([]));
        assert_eq!(node["node"]["php"], "Unknown");
        let lines = sink.lines_for("sources_values_B");
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].level, ecoh_storage::DiagLevel::Error);
    }

    #[tokio::test]
    async fn regroup_splits_collection_per_point() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("air")).expect("mkdir");
        std::fs::write(
            dir.path().join("air/orsha-ap-substances_data.json"),
            serde_json::to_vec(&json!([
                { "Nid": "1", "field_geo_point": "P1", "field_period": "2023" },
                { "Nid": "2", "field_geo_point": "P1", "field_period": "2024" },
                { "Nid": "3", "field_geo_point": "P2", "field_period": "2024" },
                { "Nid": "4", "field_geo_point": "Unknown", "field_period": "2024" }
            ]))
            .expect("json"),
        )
        .expect("write");

        let h = harvester(dir.path(), "http://127.0.0.1:9");
        let targets: BTreeSet<GeoPointId> = ["P1", "P2"]
            .into_iter()
            .filter_map(GeoPointId::new)
            .collect();
        let strategy = DiscoveryStrategy::RegroupLocal {
            collection: "orsha-ap-substances_data".into(),
        };
        let reports = h
            .harvest(
                Category::Air,
                &strategy,
                &targets,
                MergeMode::Initial,
                &CycleCancel::new(),
            )
            .await;

        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].status.added(), 2);
        assert_eq!(reports[1].status.added(), 1);

        let p1: Vec<JsonValue> = serde_json::from_slice(
            &std::fs::read(dir.path().join("air/point_data/point_P1.json")).expect("read"),
        )
        .expect("json");
        assert_eq!(p1[1]["node"]["Nid"], "2");
    }

    #[tokio::test]
    async fn cancelled_cycle_skips_every_remaining_target() {
        let dir = tempfile::tempdir().expect("tempdir");
        let h = harvester(dir.path(), "http://127.0.0.1:9");
        let targets: BTreeSet<GeoPointId> = ["A", "B"]
            .into_iter()
            .filter_map(GeoPointId::new)
            .collect();
        let cancel = CycleCancel::new();
        cancel.cancel();

        let strategy = DiscoveryStrategy::NamedCollections {
            collections: vec!["nsmos_substances_substances".into()],
        };
        let reports = h
            .harvest(Category::Water, &strategy, &targets, MergeMode::Incremental, &cancel)
            .await;

        assert_eq!(reports.len(), 2);
        assert!(reports.iter().all(|r| r.status == PersistStatus::Cancelled));
        assert!(!dir.path().join("water/point_data").exists());
    }
}
