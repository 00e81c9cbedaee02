use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// The durable subset of workflow state. Field names stay camelCase on
/// disk so a snapshot written by the browser build reads back unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub reference_image_preview_url: String,
    pub generated_yaml: String,
    pub character_sheet_url: Option<String>,
}

/// Single-slot snapshot store: one fixed file, overwritten on every save,
/// never versioned.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn save(&self, snapshot: &Snapshot) -> Result<()> {
        let serialized = serde_json::to_string(snapshot)?;
        fs::write(&self.path, serialized)
            .with_context(|| format!("Failed to write snapshot to {}", self.path.display()))
    }

    /// A missing slot is not an error, and a corrupt one is discarded on
    /// the spot so the next load starts clean.
    pub fn load(&self) -> Option<Snapshot> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(err) if err.kind() == ErrorKind::NotFound => return None,
            Err(err) => {
                warn!(
                    "Failed to read snapshot at {}: {}; discarding it",
                    self.path.display(),
                    err
                );
                self.clear();
                return None;
            }
        };

        match serde_json::from_str::<Snapshot>(&raw) {
            Ok(snapshot) => Some(snapshot),
            Err(err) => {
                warn!(
                    "Failed to parse snapshot at {}: {}; discarding it",
                    self.path.display(),
                    err
                );
                self.clear();
                None
            }
        }
    }

    pub fn clear(&self) {
        if let Err(err) = fs::remove_file(&self.path) {
            if err.kind() != ErrorKind::NotFound {
                warn!(
                    "Failed to remove snapshot at {}: {}",
                    self.path.display(),
                    err
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_snapshot() -> Snapshot {
        Snapshot {
            reference_image_preview_url: "data:image/png;base64,AAAA".to_string(),
            generated_yaml: "metadata: {}".to_string(),
            character_sheet_url: Some("data:image/png;base64,BBBB".to_string()),
        }
    }

    #[test]
    fn save_then_load_round_trips_all_fields() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("snapshot.json"));

        let snapshot = sample_snapshot();
        store.save(&snapshot).unwrap();
        assert_eq!(store.load(), Some(snapshot));
    }

    #[test]
    fn disk_layout_uses_camel_case_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("snapshot.json"));
        store.save(&sample_snapshot()).unwrap();

        let raw = fs::read_to_string(store.path()).unwrap();
        assert!(raw.contains("referenceImagePreviewUrl"));
        assert!(raw.contains("generatedYaml"));
        assert!(raw.contains("characterSheetUrl"));
    }

    #[test]
    fn missing_slot_loads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("missing.json"));
        assert_eq!(store.load(), None);
    }

    #[test]
    fn corrupt_slot_is_deleted_and_second_load_is_clean() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot.json");
        fs::write(&path, "{not json").unwrap();

        let store = SnapshotStore::new(&path);
        assert_eq!(store.load(), None);
        assert!(!path.exists());
        assert_eq!(store.load(), None);
    }

    #[test]
    fn sheet_field_may_be_null() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("snapshot.json"));
        let snapshot = Snapshot {
            character_sheet_url: None,
            ..sample_snapshot()
        };
        store.save(&snapshot).unwrap();
        assert_eq!(store.load(), Some(snapshot));
    }

    #[test]
    fn clear_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("snapshot.json"));
        store.save(&sample_snapshot()).unwrap();
        store.clear();
        store.clear();
        assert_eq!(store.load(), None);
    }
}
