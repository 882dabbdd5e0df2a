//! Service registry: the authoritative per-project record of service state
//!
//! Every subsystem writes here (supervisor, prober, orchestrator) and
//! external observers read the persisted snapshot. Writes are serialized by
//! a single mutex; readers get copies. The snapshot survives supervisor
//! crashes: on startup every record is reconciled against OS process
//! existence and stale PIDs are cleared.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::events::{HealthState, ServiceStatus};
use crate::process::signal;

/// Bounded per-service health history
const HISTORY_LIMIT: usize = 32;

/// Registry persistence errors
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Service not registered: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt registry snapshot: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// One probe outcome retained for history queries
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSample {
    pub health: HealthState,
    pub checked_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Mutable state of one service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub name: String,

    /// 0 when not running
    #[serde(default)]
    pub pid: u32,

    #[serde(default)]
    pub language: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub framework: Option<String>,

    /// Primary port actually granted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Port the manifest declared, kept when it differs from `port`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub declared_port: Option<u16>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(default)]
    pub status: ServiceStatus,

    #[serde(default)]
    pub health: HealthState,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_checked: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    /// Recent probe outcomes, newest last
    #[serde(default, skip_serializing_if = "VecDeque::is_empty")]
    pub history: VecDeque<HealthSample>,
}

impl ServiceRecord {
    /// Fresh record for a declared service
    pub fn new(name: impl Into<String>, language: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pid: 0,
            language: language.into(),
            framework: None,
            port: None,
            declared_port: None,
            url: None,
            status: ServiceStatus::Pending,
            health: HealthState::Unknown,
            start_time: None,
            last_checked: None,
            last_error: None,
            history: VecDeque::new(),
        }
    }

    /// Derived local URL for the primary port
    pub fn derive_url(&self) -> Option<String> {
        self.port.map(|p| format!("http://localhost:{}", p))
    }
}

/// Persisted snapshot format read by external observers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    pub project: String,

    pub updated_at: DateTime<Utc>,

    /// Address of the read-only HTTP observer, when one is running
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observer_addr: Option<String>,

    #[serde(default)]
    pub services: Vec<ServiceRecord>,
}

/// Authoritative per-project service state store
pub struct Registry {
    project: String,
    /// Snapshot location; `None` keeps the registry memory-only (tests)
    path: Option<PathBuf>,
    observer_addr: Mutex<Option<String>>,
    records: Mutex<HashMap<String, ServiceRecord>>,
}

impl Registry {
    /// Memory-only registry
    pub fn new(project: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            path: None,
            observer_addr: Mutex::new(None),
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Registry persisted at `path`, seeded from an existing snapshot when
    /// one is present (readers tolerate absent fields)
    pub fn open(project: impl Into<String>, path: PathBuf) -> Result<Self, RegistryError> {
        let mut records = HashMap::new();

        if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            if !content.trim().is_empty() {
                match serde_json::from_str::<RegistrySnapshot>(&content) {
                    Ok(snapshot) => {
                        for record in snapshot.services {
                            records.insert(record.name.clone(), record);
                        }
                    }
                    Err(e) => {
                        warn!("Ignoring unreadable registry snapshot: {}", e);
                    }
                }
            }
        }

        Ok(Self {
            project: project.into(),
            path: Some(path),
            observer_addr: Mutex::new(None),
            records: Mutex::new(records),
        })
    }

    /// Project name this registry belongs to
    pub fn project(&self) -> &str {
        &self.project
    }

    /// Record the observer address published in the snapshot
    pub fn set_observer_addr(&self, addr: Option<String>) {
        *self.observer_addr.lock() = addr;
        self.persist();
    }

    /// Register (or replace) a service record
    pub fn register(&self, record: ServiceRecord) {
        self.records.lock().insert(record.name.clone(), record);
        self.persist();
    }

    /// Update lifecycle status, clearing or setting the last error
    pub fn update_status(&self, name: &str, status: ServiceStatus, error: Option<String>) {
        {
            let mut records = self.records.lock();
            let Some(record) = records.get_mut(name) else {
                return;
            };
            record.status = status;
            if error.is_some() {
                record.last_error = error;
            }
            if status == ServiceStatus::Starting {
                record.start_time = Some(Utc::now());
            }
        }
        self.persist();
    }

    /// Update health state and append to the bounded history ring
    pub fn update_health(&self, name: &str, health: HealthState, error: Option<String>) {
        {
            let mut records = self.records.lock();
            let Some(record) = records.get_mut(name) else {
                return;
            };
            record.health = health;
            record.last_checked = Some(Utc::now());
            if let Some(e) = &error {
                record.last_error = Some(e.clone());
            }

            if record.history.len() == HISTORY_LIMIT {
                record.history.pop_front();
            }
            record.history.push_back(HealthSample {
                health,
                checked_at: Utc::now(),
                error,
            });
        }
        self.persist();
    }

    /// Update the recorded PID (0 clears it)
    pub fn update_pid(&self, name: &str, pid: u32) {
        {
            let mut records = self.records.lock();
            let Some(record) = records.get_mut(name) else {
                return;
            };
            record.pid = pid;
        }
        self.persist();
    }

    /// Record the granted port (and declared port when they differ)
    pub fn update_port(&self, name: &str, port: u16, declared: Option<u16>) {
        {
            let mut records = self.records.lock();
            let Some(record) = records.get_mut(name) else {
                return;
            };
            record.port = Some(port);
            record.declared_port = declared.filter(|d| *d != port);
            record.url = record.derive_url();
        }
        self.persist();
    }

    /// Snapshot copy of one record
    pub fn get(&self, name: &str) -> Option<ServiceRecord> {
        self.records.lock().get(name).cloned()
    }

    /// Snapshot copies of all records, sorted by name
    pub fn list_all(&self) -> Vec<ServiceRecord> {
        let mut all: Vec<ServiceRecord> = self.records.lock().values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Drop a record
    pub fn remove(&self, name: &str) {
        self.records.lock().remove(name);
        self.persist();
    }

    /// Reconcile every record against OS process existence.
    ///
    /// Records whose PID no longer exists become `exited` with the PID
    /// cleared; the port is retained for diagnostics. Returns the names of
    /// reconciled services.
    pub fn reconcile(&self) -> Vec<String> {
        let mut stale = Vec::new();
        {
            let mut records = self.records.lock();
            for record in records.values_mut() {
                if record.pid != 0 && !signal::pid_alive(record.pid) {
                    info!(
                        "Service {} pid {} is gone, marking exited",
                        record.name, record.pid
                    );
                    record.pid = 0;
                    record.status = ServiceStatus::Exited;
                    record.health = HealthState::Unknown;
                    stale.push(record.name.clone());
                }
            }
        }
        if !stale.is_empty() {
            self.persist();
        }
        stale
    }

    /// Build the snapshot document
    pub fn snapshot(&self) -> RegistrySnapshot {
        RegistrySnapshot {
            project: self.project.clone(),
            updated_at: Utc::now(),
            observer_addr: self.observer_addr.lock().clone(),
            services: self.list_all(),
        }
    }

    /// Write the snapshot (whole-file replace); failures are logged, not
    /// fatal, so a read-only filesystem cannot take the supervisor down
    fn persist(&self) {
        let Some(path) = &self.path else {
            return;
        };

        let snapshot = self.snapshot();
        if let Err(e) = write_snapshot(path, &snapshot) {
            warn!("Could not persist registry snapshot: {}", e);
        } else {
            debug!("Persisted registry snapshot to {}", path.display());
        }
    }
}

/// Read a snapshot without constructing a registry (status/health commands)
pub fn read_snapshot(path: &Path) -> Result<RegistrySnapshot, RegistryError> {
    let content = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

fn write_snapshot(path: &Path, snapshot: &RegistrySnapshot) -> Result<(), RegistryError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let content = serde_json::to_string_pretty(snapshot)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, content)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_get() {
        let registry = Registry::new("demo");
        registry.register(ServiceRecord::new("web", "node"));

        let record = registry.get("web").unwrap();
        assert_eq!(record.name, "web");
        assert_eq!(record.status, ServiceStatus::Pending);
        assert_eq!(record.health, HealthState::Unknown);
    }

    #[test]
    fn test_update_status_sets_start_time() {
        let registry = Registry::new("demo");
        registry.register(ServiceRecord::new("web", "node"));

        registry.update_status("web", ServiceStatus::Starting, None);
        assert!(registry.get("web").unwrap().start_time.is_some());
    }

    #[test]
    fn test_update_port_tracks_declared_mismatch() {
        let registry = Registry::new("demo");
        registry.register(ServiceRecord::new("web", "node"));

        registry.update_port("web", 3001, Some(3000));
        let record = registry.get("web").unwrap();
        assert_eq!(record.port, Some(3001));
        assert_eq!(record.declared_port, Some(3000));
        assert_eq!(record.url.as_deref(), Some("http://localhost:3001"));

        // Matching declared port is not worth recording
        registry.update_port("web", 3000, Some(3000));
        assert_eq!(registry.get("web").unwrap().declared_port, None);
    }

    #[test]
    fn test_health_history_is_bounded() {
        let registry = Registry::new("demo");
        registry.register(ServiceRecord::new("web", "node"));

        for _ in 0..(HISTORY_LIMIT + 10) {
            registry.update_health("web", HealthState::Healthy, None);
        }

        assert_eq!(registry.get("web").unwrap().history.len(), HISTORY_LIMIT);
    }

    #[test]
    fn test_reconcile_clears_dead_pids() {
        let registry = Registry::new("demo");
        let mut record = ServiceRecord::new("web", "node");
        // Spawn-and-wait gives us a certainly-dead PID
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let dead_pid = child.id();
        let _ = child.wait();

        record.pid = dead_pid;
        record.status = ServiceStatus::Running;
        record.port = Some(3000);
        registry.register(record);

        let reconciled = registry.reconcile();
        assert_eq!(reconciled, vec!["web".to_string()]);

        let record = registry.get("web").unwrap();
        assert_eq!(record.pid, 0);
        assert_eq!(record.status, ServiceStatus::Exited);
        // Port retained for diagnostics
        assert_eq!(record.port, Some(3000));
    }

    #[test]
    fn test_reconcile_keeps_live_pids() {
        let registry = Registry::new("demo");
        let mut record = ServiceRecord::new("web", "node");
        record.pid = std::process::id();
        record.status = ServiceStatus::Running;
        registry.register(record);

        assert!(registry.reconcile().is_empty());
        assert_eq!(registry.get("web").unwrap().status, ServiceStatus::Running);
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");

        {
            let registry = Registry::open("demo", path.clone()).unwrap();
            registry.register(ServiceRecord::new("web", "node"));
            registry.update_status("web", ServiceStatus::Running, None);
            registry.update_port("web", 3000, None);
        }

        let snapshot = read_snapshot(&path).unwrap();
        assert_eq!(snapshot.project, "demo");
        assert_eq!(snapshot.services.len(), 1);
        assert_eq!(snapshot.services[0].status, ServiceStatus::Running);

        // Reopening seeds from the snapshot
        let registry = Registry::open("demo", path).unwrap();
        assert_eq!(registry.get("web").unwrap().port, Some(3000));
    }

    #[test]
    fn test_readers_tolerate_sparse_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");
        std::fs::write(
            &path,
            r#"{"project":"demo","updated_at":"2026-01-01T00:00:00Z","services":[{"name":"web"}]}"#,
        )
        .unwrap();

        let snapshot = read_snapshot(&path).unwrap();
        assert_eq!(snapshot.services[0].pid, 0);
        assert_eq!(snapshot.services[0].status, ServiceStatus::Pending);
    }
}
