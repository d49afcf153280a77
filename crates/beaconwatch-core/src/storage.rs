//! Persistent storage for region monitoring state.
//!
//! Monitoring state is written as a single versioned JSON document so a
//! restarted process can resume without firing spurious "entered" events
//! for regions it was already inside. Writes go to a temporary sibling file
//! and are renamed into place.

use std::fs::{self, File};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::region::RegionCriteria;

/// Current document version.
pub const SNAPSHOT_VERSION: u32 = 1;

/// File name used inside the state directory.
pub const MONITORING_STATE_FILE: &str = "monitoring_status.json";

/// Errors reading or writing monitoring state.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Filesystem operation failed.
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        /// File involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The file exists but is not a snapshot this version understands.
    #[error("Corrupt monitoring state in {}: {message}", path.display())]
    Corrupt {
        /// File involved.
        path: PathBuf,
        /// What was wrong.
        message: String,
    },

    /// The snapshot could not be encoded.
    #[error("Failed to serialize monitoring state: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Result alias for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// One region as it is persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedRegion {
    /// Region criteria.
    pub region: RegionCriteria,
    /// Whether the region was occupied.
    #[serde(default)]
    pub inside: bool,
    /// Monotonic time of the last matching sighting, if any.
    #[serde(default)]
    pub last_seen_ms: Option<i64>,
    /// Subscriber that receives this region's events.
    #[serde(default = "default_target")]
    pub target: String,
}

fn default_target() -> String {
    crate::monitoring::DEFAULT_TARGET.to_string()
}

/// The whole persisted document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoringSnapshot {
    /// Document version.
    #[serde(default)]
    pub version: u32,
    /// When the snapshot was written.
    #[serde(default = "Utc::now")]
    pub saved_at_utc: DateTime<Utc>,
    /// Monitored regions.
    #[serde(default)]
    pub regions: Vec<PersistedRegion>,
}

impl MonitoringSnapshot {
    /// Creates a current-version snapshot.
    #[must_use]
    pub fn new(regions: Vec<PersistedRegion>) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            saved_at_utc: Utc::now(),
            regions,
        }
    }
}

/// Where monitoring state lives between runs.
pub trait MonitoringStore: Send + Sync + std::fmt::Debug {
    /// Replaces the stored snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot cannot be written.
    fn save(&self, snapshot: &MonitoringSnapshot) -> StorageResult<()>;

    /// Reads the stored snapshot, `None` if nothing is stored.
    ///
    /// # Errors
    ///
    /// Returns an error if the stored data cannot be read or decoded.
    fn load(&self) -> StorageResult<Option<MonitoringSnapshot>>;

    /// When the snapshot was last written or touched.
    ///
    /// # Errors
    ///
    /// Returns an error if the timestamp cannot be read.
    fn last_modified(&self) -> StorageResult<Option<SystemTime>>;

    /// Refreshes the modification time without rewriting the content.
    ///
    /// # Errors
    ///
    /// Returns an error if the timestamp cannot be updated.
    fn touch(&self, time: SystemTime) -> StorageResult<()>;

    /// Removes the snapshot. Missing data is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if existing data cannot be removed.
    fn delete(&self) -> StorageResult<()>;
}

/// JSON file store.
#[derive(Debug, Clone)]
pub struct FileMonitoringStore {
    path: PathBuf,
}

impl FileMonitoringStore {
    /// Stores state at `path`.
    #[must_use]
    pub const fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Stores state in `dir` under the standard file name.
    #[must_use]
    pub fn in_directory(dir: &Path) -> Self {
        Self::new(dir.join(MONITORING_STATE_FILE))
    }

    /// File backing this store.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> StorageError {
        StorageError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl MonitoringStore for FileMonitoringStore {
    fn save(&self, snapshot: &MonitoringSnapshot) -> StorageResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;
        }
        let content = serde_json::to_string_pretty(snapshot)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, content).map_err(|e| self.io_error(e))?;
        fs::rename(&tmp, &self.path).map_err(|e| self.io_error(e))?;
        Ok(())
    }

    fn load(&self) -> StorageResult<Option<MonitoringSnapshot>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.io_error(e)),
        };
        let snapshot: MonitoringSnapshot =
            serde_json::from_str(&content).map_err(|e| StorageError::Corrupt {
                path: self.path.clone(),
                message: e.to_string(),
            })?;
        if snapshot.version == 0 || snapshot.version > SNAPSHOT_VERSION {
            return Err(StorageError::Corrupt {
                path: self.path.clone(),
                message: format!("unsupported version {}", snapshot.version),
            });
        }
        Ok(Some(snapshot))
    }

    fn last_modified(&self) -> StorageResult<Option<SystemTime>> {
        match fs::metadata(&self.path) {
            Ok(meta) => meta.modified().map(Some).map_err(|e| self.io_error(e)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(self.io_error(e)),
        }
    }

    fn touch(&self, time: SystemTime) -> StorageResult<()> {
        let file = match File::options().write(true).open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(self.io_error(e)),
        };
        file.set_modified(time).map_err(|e| self.io_error(e))
    }

    fn delete(&self) -> StorageResult<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.io_error(e)),
        }
    }
}

/// In-process store, handy when persistence across restarts is not wanted.
#[derive(Debug, Default)]
pub struct MemoryMonitoringStore {
    inner: Mutex<Option<(MonitoringSnapshot, SystemTime)>>,
}

impl MemoryMonitoringStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl MonitoringStore for MemoryMonitoringStore {
    fn save(&self, snapshot: &MonitoringSnapshot) -> StorageResult<()> {
        *self.inner.lock().unwrap_or_else(PoisonError::into_inner) =
            Some((snapshot.clone(), SystemTime::now()));
        Ok(())
    }

    fn load(&self) -> StorageResult<Option<MonitoringSnapshot>> {
        Ok(self
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|(snapshot, _)| snapshot.clone()))
    }

    fn last_modified(&self) -> StorageResult<Option<SystemTime>> {
        Ok(self
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|(_, time)| *time))
    }

    fn touch(&self, time: SystemTime) -> StorageResult<()> {
        if let Some(entry) = self
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_mut()
        {
            entry.1 = time;
        }
        Ok(())
    }

    fn delete(&self) -> StorageResult<()> {
        *self.inner.lock().unwrap_or_else(PoisonError::into_inner) = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identifier::Identifier;
    use std::time::Duration;
    use tempfile::TempDir;

    fn snapshot() -> MonitoringSnapshot {
        let region =
            RegionCriteria::new("lobby", vec![Some(Identifier::from_int(1)), None]).unwrap();
        MonitoringSnapshot::new(vec![PersistedRegion {
            region,
            inside: true,
            last_seen_ms: Some(1_234),
            target: "default".into(),
        }])
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let store = FileMonitoringStore::in_directory(&dir.path().join("nested"));
        assert!(store.load().unwrap().is_none());
        assert!(store.last_modified().unwrap().is_none());

        store.save(&snapshot()).unwrap();
        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded, snapshot_with_time(loaded.saved_at_utc));
        assert!(store.last_modified().unwrap().is_some());
        assert!(!store.path().with_extension("json.tmp").exists());
    }

    fn snapshot_with_time(saved_at_utc: DateTime<Utc>) -> MonitoringSnapshot {
        MonitoringSnapshot {
            saved_at_utc,
            ..snapshot()
        }
    }

    #[test]
    fn test_missing_fields_take_defaults() {
        let dir = TempDir::new().unwrap();
        let store = FileMonitoringStore::in_directory(dir.path());
        fs::write(
            store.path(),
            r#"{"version":1,"regions":[{"region":{"unique_id":"r"}}],"future_field":true}"#,
        )
        .unwrap();
        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.regions.len(), 1);
        assert!(!loaded.regions[0].inside);
        assert_eq!(loaded.regions[0].target, "default");
        assert!(loaded.regions[0].last_seen_ms.is_none());
    }

    #[test]
    fn test_corrupt_and_unversioned_files_are_rejected() {
        let dir = TempDir::new().unwrap();
        let store = FileMonitoringStore::in_directory(dir.path());
        fs::write(store.path(), "not json").unwrap();
        assert!(matches!(store.load(), Err(StorageError::Corrupt { .. })));

        fs::write(store.path(), r#"{"regions":[]}"#).unwrap();
        assert!(matches!(store.load(), Err(StorageError::Corrupt { .. })));

        fs::write(store.path(), r#"{"version":99,"regions":[]}"#).unwrap();
        assert!(matches!(store.load(), Err(StorageError::Corrupt { .. })));
    }

    #[test]
    fn test_touch_updates_modified_time() {
        let dir = TempDir::new().unwrap();
        let store = FileMonitoringStore::in_directory(dir.path());
        store.touch(SystemTime::now()).unwrap();
        assert!(!store.path().exists(), "touch never creates the file");

        store.save(&snapshot()).unwrap();
        let past = SystemTime::now() - Duration::from_secs(3_600);
        store.touch(past).unwrap();
        let modified = store.last_modified().unwrap().unwrap();
        let drift = modified
            .duration_since(past)
            .unwrap_or_else(|e| e.duration());
        assert!(drift < Duration::from_secs(1));
    }

    #[test]
    fn test_delete_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = FileMonitoringStore::in_directory(dir.path());
        store.save(&snapshot()).unwrap();
        store.delete().unwrap();
        store.delete().unwrap();
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryMonitoringStore::new();
        assert!(store.load().unwrap().is_none());
        store.save(&snapshot()).unwrap();
        assert_eq!(store.load().unwrap().unwrap().regions.len(), 1);
        let past = SystemTime::UNIX_EPOCH;
        store.touch(past).unwrap();
        assert_eq!(store.last_modified().unwrap(), Some(past));
        store.delete().unwrap();
        assert!(store.last_modified().unwrap().is_none());
    }
}
