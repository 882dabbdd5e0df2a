//! Persisted port assignments
//!
//! Assignments are keyed by project hash (a stable digest of the absolute,
//! symlink-resolved project path) so two projects may reuse the same port
//! number independently. The backing store is a small JSON file replaced
//! atomically on every write; an in-memory store stands in when no file
//! location is available (tests).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Errors from the assignment store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt port store: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// Stable digest of an absolute, symlink-resolved project path
pub fn project_hash(project_dir: &Path) -> String {
    let canonical = project_dir
        .canonicalize()
        .unwrap_or_else(|_| project_dir.to_path_buf());

    let mut hasher = Sha256::new();
    hasher.update(canonical.to_string_lossy().as_bytes());
    hex::encode(hasher.finalize())
}

/// One persisted `(service -> port)` record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortAssignment {
    /// Service name within the project
    pub service: String,

    /// Assigned port
    pub port: u16,

    /// Advanced on every lookup; drives stale eviction
    pub last_used: DateTime<Utc>,
}

impl PortAssignment {
    /// Create a fresh assignment stamped now
    pub fn new(service: impl Into<String>, port: u16) -> Self {
        Self {
            service: service.into(),
            port,
            last_used: Utc::now(),
        }
    }
}

/// Backing store interface for port assignments
///
/// One entry per `(project_hash, service)`. Implementations are shared
/// behind an `Arc` and must be safe for concurrent use.
pub trait AssignmentStore: Send + Sync {
    /// Look up a service's assignment, advancing `last_used` on hit
    fn get(&self, project_hash: &str, service: &str) -> Result<Option<PortAssignment>, StoreError>;

    /// Insert or replace an assignment
    fn put(&self, project_hash: &str, assignment: PortAssignment) -> Result<(), StoreError>;

    /// Drop a service's assignment; absent records are a no-op
    fn remove(&self, project_hash: &str, service: &str) -> Result<(), StoreError>;

    /// All assignments for one project
    fn list_project(&self, project_hash: &str) -> Result<Vec<PortAssignment>, StoreError>;

    /// Remove assignments untouched for longer than `threshold`.
    ///
    /// Returns the number of records evicted.
    fn clean_stale(&self, threshold: Duration) -> Result<usize, StoreError>;
}

type StoreData = HashMap<String, HashMap<String, PortAssignment>>;

/// JSON-file-backed store, whole-file replace (write-temp, rename) on writes
pub struct JsonFileStore {
    path: PathBuf,
    data: Mutex<StoreData>,
}

impl JsonFileStore {
    /// Open (or create) the store at `path`
    pub fn open(path: PathBuf) -> Result<Self, StoreError> {
        let data = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            if content.trim().is_empty() {
                StoreData::default()
            } else {
                serde_json::from_str(&content)?
            }
        } else {
            StoreData::default()
        };

        Ok(Self {
            path,
            data: Mutex::new(data),
        })
    }

    fn flush(&self, data: &StoreData) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(data)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl AssignmentStore for JsonFileStore {
    fn get(&self, project_hash: &str, service: &str) -> Result<Option<PortAssignment>, StoreError> {
        let mut data = self.data.lock();
        let Some(assignment) = data
            .get_mut(project_hash)
            .and_then(|project| project.get_mut(service))
        else {
            return Ok(None);
        };

        assignment.last_used = Utc::now();
        let found = assignment.clone();
        self.flush(&data)?;
        Ok(Some(found))
    }

    fn put(&self, project_hash: &str, assignment: PortAssignment) -> Result<(), StoreError> {
        let mut data = self.data.lock();
        data.entry(project_hash.to_string())
            .or_default()
            .insert(assignment.service.clone(), assignment);
        self.flush(&data)
    }

    fn remove(&self, project_hash: &str, service: &str) -> Result<(), StoreError> {
        let mut data = self.data.lock();
        let mut removed = false;
        if let Some(project) = data.get_mut(project_hash) {
            removed = project.remove(service).is_some();
            if project.is_empty() {
                data.remove(project_hash);
            }
        }
        if removed {
            self.flush(&data)?;
        }
        Ok(())
    }

    fn list_project(&self, project_hash: &str) -> Result<Vec<PortAssignment>, StoreError> {
        let data = self.data.lock();
        Ok(data
            .get(project_hash)
            .map(|project| project.values().cloned().collect())
            .unwrap_or_default())
    }

    fn clean_stale(&self, threshold: Duration) -> Result<usize, StoreError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(threshold).unwrap_or_else(|_| chrono::Duration::days(7));

        let mut data = self.data.lock();
        let mut evicted = 0;
        data.retain(|_, project| {
            project.retain(|_, assignment| {
                let keep = assignment.last_used >= cutoff;
                if !keep {
                    evicted += 1;
                }
                keep
            });
            !project.is_empty()
        });

        if evicted > 0 {
            self.flush(&data)?;
        }
        Ok(evicted)
    }
}

/// In-memory store used when no persistent location is available
#[derive(Default)]
pub struct MemoryStore {
    data: Mutex<StoreData>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AssignmentStore for MemoryStore {
    fn get(&self, project_hash: &str, service: &str) -> Result<Option<PortAssignment>, StoreError> {
        let mut data = self.data.lock();
        Ok(data
            .get_mut(project_hash)
            .and_then(|project| project.get_mut(service))
            .map(|assignment| {
                assignment.last_used = Utc::now();
                assignment.clone()
            }))
    }

    fn put(&self, project_hash: &str, assignment: PortAssignment) -> Result<(), StoreError> {
        self.data
            .lock()
            .entry(project_hash.to_string())
            .or_default()
            .insert(assignment.service.clone(), assignment);
        Ok(())
    }

    fn remove(&self, project_hash: &str, service: &str) -> Result<(), StoreError> {
        let mut data = self.data.lock();
        if let Some(project) = data.get_mut(project_hash) {
            project.remove(service);
            if project.is_empty() {
                data.remove(project_hash);
            }
        }
        Ok(())
    }

    fn list_project(&self, project_hash: &str) -> Result<Vec<PortAssignment>, StoreError> {
        Ok(self
            .data
            .lock()
            .get(project_hash)
            .map(|project| project.values().cloned().collect())
            .unwrap_or_default())
    }

    fn clean_stale(&self, threshold: Duration) -> Result<usize, StoreError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(threshold).unwrap_or_else(|_| chrono::Duration::days(7));

        let mut data = self.data.lock();
        let mut evicted = 0;
        data.retain(|_, project| {
            project.retain(|_, assignment| {
                let keep = assignment.last_used >= cutoff;
                if !keep {
                    evicted += 1;
                }
                keep
            });
            !project.is_empty()
        });
        Ok(evicted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_project_hash_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let a = project_hash(dir.path());
        let b = project_hash(dir.path());
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_project_hash_differs_per_directory() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        assert_ne!(project_hash(a.path()), project_hash(b.path()));
    }

    #[test]
    fn test_file_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ports.json");

        {
            let store = JsonFileStore::open(path.clone()).unwrap();
            store.put("p1", PortAssignment::new("web", 3000)).unwrap();
            store.put("p1", PortAssignment::new("api", 4000)).unwrap();
            store.put("p2", PortAssignment::new("web", 3000)).unwrap();
        }

        // Reload from disk: same (service -> port) map
        let store = JsonFileStore::open(path).unwrap();
        let p1 = store.list_project("p1").unwrap();
        assert_eq!(p1.len(), 2);
        assert_eq!(store.get("p1", "web").unwrap().unwrap().port, 3000);
        assert_eq!(store.get("p1", "api").unwrap().unwrap().port, 4000);
        // Two projects may hold the same number independently
        assert_eq!(store.get("p2", "web").unwrap().unwrap().port, 3000);
    }

    #[test]
    fn test_get_advances_last_used() {
        let store = MemoryStore::new();
        let mut stale = PortAssignment::new("web", 3000);
        stale.last_used = Utc::now() - chrono::Duration::days(30);
        store.put("p1", stale.clone()).unwrap();

        let fetched = store.get("p1", "web").unwrap().unwrap();
        assert!(fetched.last_used > stale.last_used);
    }

    #[test]
    fn test_clean_stale_removes_exactly_old_records() {
        let store = MemoryStore::new();

        let mut old = PortAssignment::new("old", 3000);
        old.last_used = Utc::now() - chrono::Duration::days(8);
        store.put("p1", old).unwrap();
        store.put("p1", PortAssignment::new("fresh", 3001)).unwrap();

        let evicted = store.clean_stale(Duration::from_secs(7 * 24 * 3600)).unwrap();
        assert_eq!(evicted, 1);

        let remaining = store.list_project("p1").unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].service, "fresh");
    }

    #[test]
    fn test_remove_is_idempotent() {
        let store = MemoryStore::new();
        store.put("p1", PortAssignment::new("web", 3000)).unwrap();
        store.remove("p1", "web").unwrap();
        store.remove("p1", "web").unwrap();
        assert!(store.get("p1", "web").unwrap().is_none());
    }
}
