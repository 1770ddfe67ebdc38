//! Append-only JSON snapshots keyed by record identity.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ecoh_core::{Category, GeoPointId, IdentityConvention, IdentityKey, NormalizedRecord};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

/// Directory under a category that holds per-geo-point snapshots.
pub const POINT_DATA_DIR: &str = "point_data";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeMode {
    /// Replace whatever is persisted.
    Initial,
    /// Append records whose identity is not yet persisted.
    Incremental,
}

impl MergeMode {
    pub fn from_initial(initial: bool) -> Self {
        if initial {
            MergeMode::Initial
        } else {
            MergeMode::Incremental
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum SnapshotId<'a> {
    Collection {
        category: Category,
        name: &'a str,
    },
    Target {
        category: Category,
        geo_point: &'a GeoPointId,
    },
}

impl SnapshotId<'_> {
    pub fn convention(&self) -> IdentityConvention {
        match self {
            SnapshotId::Collection { .. } => IdentityConvention::NodeId,
            SnapshotId::Target { .. } => IdentityConvention::Period,
        }
    }
}

impl fmt::Display for SnapshotId<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SnapshotId::Collection { category, name } => write!(f, "{category}/{name}"),
            SnapshotId::Target {
                category,
                geo_point,
            } => write!(f, "{category}/{POINT_DATA_DIR}/{geo_point}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Written {
        previous: usize,
        added: usize,
        total: usize,
    },
    /// Every incoming identity was already persisted; nothing was written.
    NoNewRecords { previous: usize },
    /// The incoming batch was empty; the snapshot was not touched.
    NothingToPersist,
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot {} is unreadable: {reason}", .path.display())]
    Unreadable { path: PathBuf, reason: String },
    #[error("serializing snapshot {} failed: {source}", .path.display())]
    Serialize {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("writing snapshot {} failed: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug)]
pub struct SnapshotStore {
    root: PathBuf,
    locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl SnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn category_dir(&self, category: Category) -> PathBuf {
        self.root.join(category.as_str())
    }

    pub fn path_for(&self, id: &SnapshotId<'_>) -> PathBuf {
        match id {
            SnapshotId::Collection { category, name } => {
                self.category_dir(*category).join(format!("{name}.json"))
            }
            SnapshotId::Target {
                category,
                geo_point,
            } => self
                .category_dir(*category)
                .join(POINT_DATA_DIR)
                .join(format!("point_{}.json", geo_point.file_stem())),
        }
    }

    pub async fn load(&self, id: &SnapshotId<'_>) -> Result<Option<Vec<JsonValue>>, SnapshotError> {
        Self::load_path(&self.path_for(id)).await
    }

    /// `Ok(None)` when the file does not exist yet.
    pub async fn load_path(path: &Path) -> Result<Option<Vec<JsonValue>>, SnapshotError> {
        let text = match fs::read_to_string(path).await {
            Ok(text) => text,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(SnapshotError::Unreadable {
                    path: path.to_path_buf(),
                    reason: err.to_string(),
                })
            }
        };

        match serde_json::from_str::<JsonValue>(&text) {
            Ok(JsonValue::Array(items)) => Ok(Some(items)),
            Ok(other) => Err(SnapshotError::Unreadable {
                path: path.to_path_buf(),
                reason: format!("expected a JSON array, found {}", json_kind(&other)),
            }),
            Err(err) => Err(SnapshotError::Unreadable {
                path: path.to_path_buf(),
                reason: err.to_string(),
            }),
        }
    }

    /// Read-merge-write one snapshot. Writers to the same file are serialized.
    pub async fn merge(
        &self,
        id: SnapshotId<'_>,
        records: Vec<NormalizedRecord>,
        mode: MergeMode,
    ) -> Result<MergeOutcome, SnapshotError> {
        if records.is_empty() {
            return Ok(MergeOutcome::NothingToPersist);
        }

        let convention = id.convention();
        let path = self.path_for(&id);
        let lock = self.lock_for(&path).await;
        let _guard = lock.lock().await;

        let (previous, mut merged, mut seen) = match mode {
            MergeMode::Initial => {
                let previous = match Self::load_path(&path).await {
                    Ok(existing) => existing.map_or(0, |items| items.len()),
                    Err(err) => {
                        debug!(error = %err, "replacing unreadable snapshot");
                        0
                    }
                };
                (previous, Vec::with_capacity(records.len()), HashSet::new())
            }
            MergeMode::Incremental => {
                let existing = Self::load_path(&path).await?.unwrap_or_default();
                let seen: HashSet<IdentityKey> =
                    existing.iter().filter_map(|v| convention.key_of(v)).collect();
                (existing.len(), existing, seen)
            }
        };

        let mut added = 0usize;
        for record in records {
            if !convention.accepts(record.key()) {
                warn!(snapshot = %id, key = %record.key(), "dropping record with foreign identity");
                continue;
            }
            if seen.insert(record.key().clone()) {
                merged.push(record.into_body());
                added += 1;
            }
        }

        if added == 0 {
            return Ok(match mode {
                MergeMode::Incremental => MergeOutcome::NoNewRecords { previous },
                MergeMode::Initial => MergeOutcome::NothingToPersist,
            });
        }

        let bytes = serde_json::to_vec_pretty(&merged).map_err(|source| SnapshotError::Serialize {
            path: path.clone(),
            source,
        })?;
        write_atomic(&path, &bytes).await?;

        Ok(MergeOutcome::Written {
            previous,
            added,
            total: merged.len(),
        })
    }

    async fn lock_for(&self, path: &Path) -> Arc<Mutex<()>> {
        let mut map = self.locks.lock().await;
        map.entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

/// Write through a temp file in the same directory and rename it over the
/// target, so readers see either the old or the new snapshot.
async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), SnapshotError> {
    let write_err = |source: std::io::Error| SnapshotError::Write {
        path: path.to_path_buf(),
        source,
    };

    let parent = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    fs::create_dir_all(&parent).await.map_err(write_err)?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp_path = parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));
    let mut temp = TempFileGuard::new(temp_path.clone());

    let written = async {
        // Opened synchronously so a dropped future cannot leave an open in
        // flight that recreates the temp file after the guard ran.
        let file = std::fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)?;
        let mut file = fs::File::from_std(file);
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&temp_path, path).await
    }
    .await;

    if let Err(err) = written {
        let _ = fs::remove_file(&temp_path).await;
        temp.disarm();
        return Err(write_err(err));
    }
    temp.disarm();
    Ok(())
}

/// Removes a temp file whose write was abandoned, including when the writing
/// future is dropped before the rename.
struct TempFileGuard {
    path: Option<PathBuf>,
}

impl TempFileGuard {
    fn new(path: PathBuf) -> Self {
        Self { path: Some(path) }
    }

    fn disarm(&mut self) {
        self.path = None;
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            if let Err(err) = std::fs::remove_file(&path) {
                if err.kind() != ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %err, "could not remove abandoned temp file");
                }
            }
        }
    }
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "a boolean",
        JsonValue::Number(_) => "a number",
        JsonValue::String(_) => "a string",
        JsonValue::Array(_) => "an array",
        JsonValue::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn entity(nid: u64, title: &str) -> NormalizedRecord {
        NormalizedRecord::from_value(
            IdentityConvention::NodeId,
            json!({ "Nid": nid.to_string(), "title": title }),
        )
        .expect("keyed")
    }

    fn collection(name: &str) -> SnapshotId<'_> {
        SnapshotId::Collection {
            category: Category::Water,
            name,
        }
    }

    fn nids(items: &[JsonValue]) -> Vec<String> {
        items
            .iter()
            .map(|v| v["Nid"].as_str().unwrap_or_default().to_string())
            .collect()
    }

    #[tokio::test]
    async fn initial_merge_replaces_with_exactly_the_batch() {
        let dir = tempdir().expect("tempdir");
        let store = SnapshotStore::new(dir.path());
        let id = collection("nsmos_place_place");

        store
            .merge(id, vec![entity(9, "old")], MergeMode::Initial)
            .await
            .expect("seed");
        let outcome = store
            .merge(id, vec![entity(1, "a"), entity(2, "b")], MergeMode::Initial)
            .await
            .expect("initial");

        assert_eq!(
            outcome,
            MergeOutcome::Written {
                previous: 1,
                added: 2,
                total: 2
            }
        );
        let items = store.load(&id).await.expect("load").expect("present");
        assert_eq!(nids(&items), vec!["1", "2"]);
    }

    #[tokio::test]
    async fn incremental_merge_appends_only_unseen_identities() {
        let dir = tempdir().expect("tempdir");
        let store = SnapshotStore::new(dir.path());
        let id = collection("nsmos_place_place");

        store
            .merge(id, vec![entity(1, "first")], MergeMode::Initial)
            .await
            .expect("seed");
        let outcome = store
            .merge(
                id,
                vec![entity(1, "changed upstream"), entity(2, "second")],
                MergeMode::Incremental,
            )
            .await
            .expect("merge");

        assert_eq!(
            outcome,
            MergeOutcome::Written {
                previous: 1,
                added: 1,
                total: 2
            }
        );
        let items = store.load(&id).await.expect("load").expect("present");
        assert_eq!(nids(&items), vec!["1", "2"]);
        assert_eq!(items[0]["title"], "first");
    }

    #[tokio::test]
    async fn repeating_a_merge_is_a_no_op() {
        let dir = tempdir().expect("tempdir");
        let store = SnapshotStore::new(dir.path());
        let id = collection("sg_water_place");
        let batch = || vec![entity(1, "a"), entity(2, "b"), entity(2, "b again")];

        let first = store
            .merge(id, batch(), MergeMode::Incremental)
            .await
            .expect("first");
        assert_eq!(
            first,
            MergeOutcome::Written {
                previous: 0,
                added: 2,
                total: 2
            }
        );
        let before = std::fs::read(store.path_for(&id)).expect("bytes");

        let second = store
            .merge(id, batch(), MergeMode::Incremental)
            .await
            .expect("second");
        assert_eq!(second, MergeOutcome::NoNewRecords { previous: 2 });
        assert_eq!(std::fs::read(store.path_for(&id)).expect("bytes"), before);
    }

    #[tokio::test]
    async fn incremental_merges_grow_monotonically() {
        let dir = tempdir().expect("tempdir");
        let store = SnapshotStore::new(dir.path());
        let id = collection("lgm_water_place");

        let mut previous: Vec<JsonValue> = Vec::new();
        for round in 0u64..6 {
            let batch = (round..round + 4)
                .map(|n| entity(n % 7, &format!("round {round}")))
                .collect();
            store
                .merge(id, batch, MergeMode::Incremental)
                .await
                .expect("merge");
            let current = store.load(&id).await.expect("load").expect("present");

            assert!(current.len() >= previous.len());
            assert_eq!(&current[..previous.len()], &previous[..]);
            let unique: HashSet<_> = nids(&current).into_iter().collect();
            assert_eq!(unique.len(), current.len());
            previous = current;
        }
        assert_eq!(previous.len(), 7);
    }

    #[tokio::test]
    async fn empty_batch_never_touches_disk() {
        let dir = tempdir().expect("tempdir");
        let store = SnapshotStore::new(dir.path());
        let id = collection("nsmos_place_place");

        for mode in [MergeMode::Initial, MergeMode::Incremental] {
            let outcome = store.merge(id, Vec::new(), mode).await.expect("merge");
            assert_eq!(outcome, MergeOutcome::NothingToPersist);
        }
        assert!(!store.path_for(&id).exists());
    }

    #[tokio::test]
    async fn corrupt_snapshot_aborts_incremental_merge_untouched() {
        let dir = tempdir().expect("tempdir");
        let store = SnapshotStore::new(dir.path());
        let id = collection("nsmos_place_place");
        let path = store.path_for(&id);
        std::fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        std::fs::write(&path, b"[{\"Nid\": \"1\"").expect("seed corrupt");

        let err = store
            .merge(id, vec![entity(2, "b")], MergeMode::Incremental)
            .await
            .expect_err("unreadable");
        assert!(matches!(err, SnapshotError::Unreadable { .. }));
        assert_eq!(std::fs::read(&path).expect("bytes"), b"[{\"Nid\": \"1\"");
    }

    #[tokio::test]
    async fn failed_rename_leaves_no_temp_files() {
        let dir = tempdir().expect("tempdir");
        let store = SnapshotStore::new(dir.path());
        let id = collection("blocked");
        let path = store.path_for(&id);
        std::fs::create_dir_all(path.join("inner")).expect("dir in the way");

        let err = store
            .merge(id, vec![entity(1, "a")], MergeMode::Initial)
            .await
            .expect_err("rename over directory");
        assert!(matches!(err, SnapshotError::Write { .. }));

        let leftovers: Vec<_> = std::fs::read_dir(path.parent().expect("parent"))
            .expect("list")
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
        assert!(path.join("inner").is_dir());
    }

    #[tokio::test]
    async fn target_snapshots_are_keyed_by_period() {
        let dir = tempdir().expect("tempdir");
        let store = SnapshotStore::new(dir.path());
        let geo = GeoPointId::new("301").expect("geo");
        let id = SnapshotId::Target {
            category: Category::Soils,
            geo_point: &geo,
        };
        let wrap = |period: &str, nid: &str| {
            NormalizedRecord::from_value(
                IdentityConvention::Period,
                json!({ "node": { "field_period": period, "Nid": nid } }),
            )
            .expect("period key")
        };

        store
            .merge(id, vec![wrap("2023", "1"), wrap("2024", "2")], MergeMode::Incremental)
            .await
            .expect("first");
        let outcome = store
            .merge(id, vec![wrap("2024", "3"), wrap("2025", "4")], MergeMode::Incremental)
            .await
            .expect("second");

        assert_eq!(
            outcome,
            MergeOutcome::Written {
                previous: 2,
                added: 1,
                total: 3
            }
        );
        assert!(store
            .path_for(&id)
            .ends_with("soils/point_data/point_301.json"));

        let foreign = store
            .merge(id, vec![entity(5, "entity")], MergeMode::Incremental)
            .await
            .expect("foreign");
        assert_eq!(foreign, MergeOutcome::NoNewRecords { previous: 3 });
    }

    #[tokio::test]
    async fn concurrent_writers_to_one_file_do_not_lose_records() {
        let dir = tempdir().expect("tempdir");
        let store = SnapshotStore::new(dir.path());
        let id = collection("shared");

        let (a, b) = tokio::join!(
            store.merge(id, vec![entity(1, "a"), entity(2, "b")], MergeMode::Incremental),
            store.merge(id, vec![entity(3, "c"), entity(4, "d")], MergeMode::Incremental),
        );
        a.expect("a");
        b.expect("b");

        let items = store.load(&id).await.expect("load").expect("present");
        assert_eq!(items.len(), 4);
    }

    #[tokio::test]
    async fn targets_with_similar_ids_get_separate_files() {
        let dir = tempdir().expect("tempdir");
        let store = SnapshotStore::new(dir.path());
        let spaced = GeoPointId::new("12 3").expect("geo");
        let underscored = GeoPointId::new("12_3").expect("geo");
        let wrap = |period: &str, geo: &str| {
            NormalizedRecord::from_value(
                IdentityConvention::Period,
                json!({ "node": { "field_period": period, "geo": geo } }),
            )
            .expect("period key")
        };
        let spaced_id = SnapshotId::Target {
            category: Category::Water,
            geo_point: &spaced,
        };
        let underscored_id = SnapshotId::Target {
            category: Category::Water,
            geo_point: &underscored,
        };

        store
            .merge(spaced_id, vec![wrap("2024", "12 3")], MergeMode::Incremental)
            .await
            .expect("spaced");
        let outcome = store
            .merge(
                underscored_id,
                vec![wrap("2024", "12_3"), wrap("2025", "12_3")],
                MergeMode::Incremental,
            )
            .await
            .expect("underscored");

        assert_eq!(
            outcome,
            MergeOutcome::Written {
                previous: 0,
                added: 2,
                total: 2
            }
        );
        assert_ne!(store.path_for(&spaced_id), store.path_for(&underscored_id));
        let items = store.load(&underscored_id).await.expect("load").expect("present");
        assert!(items.iter().all(|v| v["node"]["geo"] == "12_3"));
        let items = store.load(&spaced_id).await.expect("load").expect("present");
        assert_eq!(items.len(), 1);
    }

    #[tokio::test]
    async fn abandoned_merge_leaves_no_temp_files() {
        let dir = tempdir().expect("tempdir");
        let store = SnapshotStore::new(dir.path());
        let id = collection("large");
        let batch: Vec<NormalizedRecord> = (0..200_000).map(|n| entity(n, "bulk")).collect();

        let _ = tokio::time::timeout(
            std::time::Duration::from_millis(2),
            store.merge(id, batch, MergeMode::Initial),
        )
        .await;

        let water = dir.path().join("water");
        let leftovers: Vec<_> = std::fs::read_dir(&water)
            .map(|entries| {
                entries
                    .filter_map(Result::ok)
                    .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
                    .collect()
            })
            .unwrap_or_default();
        assert!(leftovers.is_empty());
    }
}
