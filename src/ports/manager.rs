//! Port allocation and reservation
//!
//! The manager hands out ports from a configured range, preferring a
//! service's previously persisted assignment so port numbers stay stable
//! across runs. Explicitly pinned ports are never silently changed: a
//! conflict is resolved interactively (or by the saved "always kill"
//! preference). The manager is safe for concurrent use behind a single
//! async mutex, which is released around user prompts and the state
//! re-validated on re-entry.

use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use lru::LruCache;
use rand::rngs::OsRng;
use rand::RngCore;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::config::{PortRange, Preferences};

use super::conflict::{
    identify_holder, kill_holder, ConflictPrompt, PortConflict, Resolution, StdinPrompt,
};
use super::reservation::{is_available, Reservation};
use super::store::{project_hash, AssignmentStore, MemoryStore, PortAssignment};
use super::PortError;

/// Bound on the project-path hash cache
const PROJECT_CACHE_SIZE: usize = 50;

/// Candidates probed before declaring the range exhausted
const MAX_SCAN_CANDIDATES: u32 = 100;

/// Default eviction threshold for stale assignments
pub const STALE_THRESHOLD: Duration = Duration::from_secs(7 * 24 * 3600);

/// Result of an assignment request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Assigned {
    /// The granted port
    pub port: u16,

    /// Whether the manager picked the number (as opposed to honoring a
    /// pinned or persisted one)
    pub auto_assigned: bool,
}

struct ManagerState {
    /// Canonical-path -> project-hash cache, LRU bounded
    hashes: LruCache<PathBuf, String>,
}

/// Cross-run port allocator for a machine's projects
pub struct PortManager {
    range: PortRange,
    store: Arc<dyn AssignmentStore>,
    prompt: Arc<dyn ConflictPrompt>,
    prefs: parking_lot::Mutex<Preferences>,
    state: Mutex<ManagerState>,
}

impl PortManager {
    /// Create a manager over the given store and preferences, prompting on
    /// stdin for conflicts
    pub fn new(range: PortRange, store: Arc<dyn AssignmentStore>, prefs: Preferences) -> Self {
        Self::with_prompt(range, store, prefs, Arc::new(StdinPrompt))
    }

    /// Create a manager with an explicit conflict prompt (tests, `--yes`
    /// style non-interactive runs)
    pub fn with_prompt(
        range: PortRange,
        store: Arc<dyn AssignmentStore>,
        prefs: Preferences,
        prompt: Arc<dyn ConflictPrompt>,
    ) -> Self {
        Self {
            range,
            store,
            prompt,
            prefs: parking_lot::Mutex::new(prefs),
            state: Mutex::new(ManagerState {
                hashes: LruCache::new(NonZeroUsize::new(PROJECT_CACHE_SIZE).unwrap()),
            }),
        }
    }

    /// In-memory manager for tests
    pub fn in_memory(range: PortRange) -> Self {
        Self::with_prompt(
            range,
            Arc::new(MemoryStore::new()),
            Preferences::default(),
            Arc::new(super::conflict::FixedPrompt(Resolution::Cancel)),
        )
    }

    /// Bind-and-close probe
    pub fn is_available(&self, port: u16) -> bool {
        is_available(port)
    }

    /// Reserve a specific port, validating it first
    pub fn reserve(&self, port: u16) -> Result<Reservation, PortError> {
        if port == 0 {
            return Err(PortError::Invalid {
                port: 0,
                reason: "port 0 cannot be reserved".into(),
            });
        }
        Reservation::bind(port).map_err(|_| PortError::InUse {
            port,
            service: String::new(),
            pid: None,
            process: None,
        })
    }

    /// Assign a port to `service` in `project_dir`.
    ///
    /// Explicit mode (`explicit = true`, `preferred` pinned by the manifest):
    /// the port is granted as-is or the conflict is resolved interactively;
    /// the number is never silently changed. A `Reassign` answer returns a
    /// scanned port with `auto_assigned = true`, signaling the caller to
    /// rewrite the manifest.
    ///
    /// Flexible mode: the service's persisted assignment is reused when
    /// free, then the preferred hint is tried, then the range is scanned.
    pub async fn assign(
        &self,
        project_dir: &Path,
        service: &str,
        preferred: Option<u16>,
        explicit: bool,
    ) -> Result<Assigned, PortError> {
        if explicit {
            let port = preferred.ok_or_else(|| PortError::Invalid {
                port: 0,
                reason: "explicit assignment requires a port".into(),
            })?;
            // A pinned port outside the allocatable range is a manifest
            // error, never silently moved
            self.validate(port)?;
            self.assign_explicit(project_dir, service, port).await
        } else {
            let mut state = self.state.lock().await;
            let hash = self.hash_for(&mut state, project_dir);
            let preferred = self.usable_hint(preferred);
            let port = self.pick_flexible(&hash, service, preferred)?;
            self.record(&hash, service, port.port)?;
            Ok(port)
        }
    }

    /// A flexible preference is only a hint; out-of-range hints are
    /// dropped with a warning rather than failing the assignment
    fn usable_hint(&self, preferred: Option<u16>) -> Option<u16> {
        preferred.filter(|port| {
            let usable = self.range.contains(*port);
            if !usable {
                warn!(
                    "Preferred port {} is outside the range {}-{}, ignoring hint",
                    port, self.range.start, self.range.end
                );
            }
            usable
        })
    }

    async fn assign_explicit(
        &self,
        project_dir: &Path,
        service: &str,
        port: u16,
    ) -> Result<Assigned, PortError> {
        let mut state = self.state.lock().await;
        let hash = self.hash_for(&mut state, project_dir);

        if is_available(port) {
            self.record(&hash, service, port)?;
            return Ok(Assigned {
                port,
                auto_assigned: false,
            });
        }

        let holder = identify_holder(port).await;

        if self.prefs.lock().always_kill_port_conflicts {
            if let Some(holder) = &holder {
                info!(
                    "Port {} conflict auto-resolved by saved preference (killing pid {})",
                    port, holder.pid
                );
                kill_holder(port, holder).await?;
                self.record(&hash, service, port)?;
                return Ok(Assigned {
                    port,
                    auto_assigned: false,
                });
            }
            return Err(self.in_use_error(port, service, holder));
        }

        let conflict = PortConflict {
            port,
            service: service.to_string(),
            holder: holder.clone(),
        };

        // Release the manager lock while the user thinks; stdin can block
        // indefinitely and other callers must not deadlock behind it.
        drop(state);

        let prompt = self.prompt.clone();
        let resolution =
            tokio::task::spawn_blocking(move || prompt.ask(&conflict))
                .await
                .map_err(|_| PortError::Cancelled)?;

        // Re-enter and re-validate: the world may have changed while the
        // prompt was open.
        let mut state = self.state.lock().await;
        let hash = self.hash_for(&mut state, project_dir);

        match resolution {
            Resolution::Cancel => Err(PortError::Cancelled),
            Resolution::Reassign => {
                let taken = self.ports_of_others(&hash, service)?;
                let port = self.scan(&taken)?;
                self.record(&hash, service, port)?;
                Ok(Assigned {
                    port,
                    auto_assigned: true,
                })
            }
            Resolution::Kill | Resolution::AlwaysKill => {
                if resolution == Resolution::AlwaysKill {
                    let mut prefs = self.prefs.lock();
                    prefs.always_kill_port_conflicts = true;
                    if let Err(e) = prefs.save() {
                        warn!("Could not persist always-kill preference: {:#}", e);
                    }
                }

                if is_available(port) {
                    // Holder vanished while we were prompting
                    self.record(&hash, service, port)?;
                    return Ok(Assigned {
                        port,
                        auto_assigned: false,
                    });
                }

                let holder = match identify_holder(port).await {
                    Some(h) => h,
                    None => return Err(self.in_use_error(port, service, None)),
                };
                kill_holder(port, &holder).await?;
                self.record(&hash, service, port)?;
                Ok(Assigned {
                    port,
                    auto_assigned: false,
                })
            }
        }
    }

    /// Choose a port in flexible mode without binding it
    fn pick_flexible(
        &self,
        hash: &str,
        service: &str,
        preferred: Option<u16>,
    ) -> Result<Assigned, PortError> {
        // Persisted assignment first: stable across runs when possible
        if let Some(existing) = self.store.get(hash, service)? {
            if is_available(existing.port) {
                debug!(
                    "Reusing persisted port {} for service {}",
                    existing.port, service
                );
                return Ok(Assigned {
                    port: existing.port,
                    auto_assigned: false,
                });
            }
            debug!(
                "Persisted port {} for service {} is taken, rescanning",
                existing.port, service
            );
        }

        let taken = self.ports_of_others(hash, service)?;

        if let Some(port) = preferred {
            if !taken.contains(&port) && is_available(port) {
                return Ok(Assigned {
                    port,
                    auto_assigned: false,
                });
            }
        }

        let port = self.scan(&taken)?;
        Ok(Assigned {
            port,
            auto_assigned: true,
        })
    }

    /// Find a free port and hold it bound until the caller releases it
    /// just before spawning the child. Under concurrent calls each caller
    /// gets a distinct port because the listener itself is the claim.
    pub async fn find_and_reserve(
        &self,
        project_dir: &Path,
        service: &str,
        preferred: Option<u16>,
    ) -> Result<(Reservation, bool), PortError> {
        let mut state = self.state.lock().await;
        let hash = self.hash_for(&mut state, project_dir);

        // Persisted assignment
        if let Some(existing) = self.store.get(&hash, service)? {
            if let Ok(reservation) = Reservation::bind(existing.port) {
                self.record(&hash, service, existing.port)?;
                return Ok((reservation, false));
            }
        }

        let taken = self.ports_of_others(&hash, service)?;

        // Preferred hint
        if let Some(port) = self.usable_hint(preferred) {
            if !taken.contains(&port) {
                if let Ok(reservation) = Reservation::bind(port) {
                    self.record(&hash, service, port)?;
                    return Ok((reservation, false));
                }
            }
        }

        // Scan, claiming by bind
        let offset = random_offset(self.range.size());
        for k in 0..MAX_SCAN_CANDIDATES.min(self.range.size()) {
            let candidate =
                (u32::from(self.range.start) + (offset + k) % self.range.size()) as u16;
            if taken.contains(&candidate) {
                continue;
            }
            if let Ok(reservation) = Reservation::bind(candidate) {
                self.record(&hash, service, candidate)?;
                return Ok((reservation, true));
            }
        }

        Err(PortError::RangeExhausted {
            start: self.range.start,
            end: self.range.end,
        })
    }

    /// Drop the persisted assignment for a service; running children are
    /// unaffected
    pub async fn release(&self, project_dir: &Path, service: &str) -> Result<(), PortError> {
        let mut state = self.state.lock().await;
        let hash = self.hash_for(&mut state, project_dir);
        self.store.remove(&hash, service)?;
        Ok(())
    }

    /// Evict assignments untouched for longer than `threshold`
    pub fn clean_stale(&self, threshold: Duration) -> Result<usize, PortError> {
        Ok(self.store.clean_stale(threshold)?)
    }

    /// All persisted assignments for a project
    pub async fn assignments(&self, project_dir: &Path) -> Result<Vec<PortAssignment>, PortError> {
        let mut state = self.state.lock().await;
        let hash = self.hash_for(&mut state, project_dir);
        Ok(self.store.list_project(&hash)?)
    }

    fn hash_for(&self, state: &mut MutexGuard<'_, ManagerState>, project_dir: &Path) -> String {
        let key = project_dir.to_path_buf();
        if let Some(hash) = state.hashes.get(&key) {
            return hash.clone();
        }
        let hash = project_hash(project_dir);
        state.hashes.put(key, hash.clone());
        hash
    }

    fn ports_of_others(&self, hash: &str, service: &str) -> Result<HashSet<u16>, PortError> {
        Ok(self
            .store
            .list_project(hash)?
            .into_iter()
            .filter(|a| a.service != service)
            .map(|a| a.port)
            .collect())
    }

    /// Probe up to [`MAX_SCAN_CANDIDATES`] ports starting at a random
    /// offset, skipping ports assigned to other services in the project
    fn scan(&self, taken: &HashSet<u16>) -> Result<u16, PortError> {
        let size = self.range.size();
        let offset = random_offset(size);

        for k in 0..MAX_SCAN_CANDIDATES.min(size) {
            let candidate = (u32::from(self.range.start) + (offset + k) % size) as u16;
            if taken.contains(&candidate) {
                continue;
            }
            if is_available(candidate) {
                return Ok(candidate);
            }
        }

        Err(PortError::RangeExhausted {
            start: self.range.start,
            end: self.range.end,
        })
    }

    fn record(&self, hash: &str, service: &str, port: u16) -> Result<(), PortError> {
        self.store.put(hash, PortAssignment::new(service, port))?;
        Ok(())
    }

    fn validate(&self, port: u16) -> Result<(), PortError> {
        if !self.range.contains(port) {
            return Err(PortError::Invalid {
                port: i64::from(port),
                reason: format!(
                    "outside the allocatable range {}-{}",
                    self.range.start, self.range.end
                ),
            });
        }
        Ok(())
    }

    fn in_use_error(
        &self,
        port: u16,
        service: &str,
        holder: Option<super::conflict::PortHolder>,
    ) -> PortError {
        PortError::InUse {
            port,
            service: service.to_string(),
            pid: holder.as_ref().map(|h| h.pid),
            process: holder.map(|h| h.name),
        }
    }
}

/// Cryptographically random scan offset in `[0, size)`
fn random_offset(size: u32) -> u32 {
    OsRng.next_u32() % size.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::conflict::FixedPrompt;

    fn manager() -> PortManager {
        PortManager::in_memory(PortRange {
            start: 3000,
            end: 65535,
        })
    }

    #[tokio::test]
    async fn test_flexible_assignment_is_stable_across_calls() {
        let m = manager();
        let dir = tempfile::tempdir().unwrap();

        let first = m.assign(dir.path(), "web", None, false).await.unwrap();
        let second = m.assign(dir.path(), "web", None, false).await.unwrap();

        assert_eq!(first.port, second.port);
        assert!(first.auto_assigned);
        assert!(!second.auto_assigned);
    }

    #[tokio::test]
    async fn test_preferred_hint_honored_when_free() {
        let m = manager();
        let dir = tempfile::tempdir().unwrap();

        // Find a port that is actually free right now
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let free = probe.local_addr().unwrap().port();
        drop(probe);

        let assigned = m.assign(dir.path(), "web", Some(free), false).await.unwrap();
        assert_eq!(assigned.port, free);
        assert!(!assigned.auto_assigned);
    }

    #[tokio::test]
    async fn test_distinct_services_get_distinct_ports() {
        let m = manager();
        let dir = tempfile::tempdir().unwrap();

        let (r1, _) = m.find_and_reserve(dir.path(), "a", None).await.unwrap();
        let (r2, _) = m.find_and_reserve(dir.path(), "b", None).await.unwrap();
        let (r3, _) = m.find_and_reserve(dir.path(), "c", None).await.unwrap();

        assert_ne!(r1.port(), r2.port());
        assert_ne!(r2.port(), r3.port());
        assert_ne!(r1.port(), r3.port());
    }

    #[tokio::test]
    async fn test_reservation_blocks_reuse_until_release() {
        let m = manager();
        let dir = tempfile::tempdir().unwrap();

        let (reservation, _) = m.find_and_reserve(dir.path(), "a", None).await.unwrap();
        let port = reservation.port();

        assert!(!m.is_available(port));
        reservation.release();
        assert!(m.is_available(port));
    }

    #[tokio::test]
    async fn test_range_exhausted() {
        // A one-port range occupied by a held listener cannot be scanned
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = probe.local_addr().unwrap().port();

        let m = PortManager::in_memory(PortRange {
            start: port,
            end: port,
        });
        let dir = tempfile::tempdir().unwrap();

        let err = m.assign(dir.path(), "web", None, false).await.unwrap_err();
        assert!(matches!(err, PortError::RangeExhausted { .. }));
    }

    #[tokio::test]
    async fn test_explicit_port_outside_range_rejected() {
        let m = manager();
        let dir = tempfile::tempdir().unwrap();

        let err = m.assign(dir.path(), "web", Some(2999), true).await.unwrap_err();
        assert!(matches!(err, PortError::Invalid { port: 2999, .. }));
    }

    #[tokio::test]
    async fn test_out_of_range_hint_is_ignored() {
        let m = manager();
        let dir = tempfile::tempdir().unwrap();

        // The hint is below the range, so the manager scans instead of
        // failing or honoring it
        let assigned = m.assign(dir.path(), "web", Some(2999), false).await.unwrap();
        assert!(assigned.port >= 3000);
        assert!(assigned.auto_assigned);
    }

    #[tokio::test]
    async fn test_explicit_conflict_cancel() {
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = probe.local_addr().unwrap().port();

        let m = PortManager::with_prompt(
            PortRange::default(),
            Arc::new(MemoryStore::new()),
            Preferences::default(),
            Arc::new(FixedPrompt(Resolution::Cancel)),
        );
        let dir = tempfile::tempdir().unwrap();

        let err = m.assign(dir.path(), "web", Some(port), true).await.unwrap_err();
        assert!(matches!(err, PortError::Cancelled));
    }

    #[tokio::test]
    async fn test_explicit_conflict_reassign() {
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = probe.local_addr().unwrap().port();

        let m = PortManager::with_prompt(
            PortRange::default(),
            Arc::new(MemoryStore::new()),
            Preferences::default(),
            Arc::new(FixedPrompt(Resolution::Reassign)),
        );
        let dir = tempfile::tempdir().unwrap();

        let assigned = m.assign(dir.path(), "web", Some(port), true).await.unwrap();
        assert_ne!(assigned.port, port);
        assert!(assigned.auto_assigned);
    }

    #[tokio::test]
    async fn test_release_forgets_assignment() {
        let m = manager();
        let dir = tempfile::tempdir().unwrap();

        let first = m.assign(dir.path(), "web", None, false).await.unwrap();
        m.release(dir.path(), "web").await.unwrap();
        assert!(m.assignments(dir.path()).await.unwrap().is_empty());

        // A later assignment is free to differ
        let _ = first;
    }
}
