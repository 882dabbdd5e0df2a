//! Per-service lifecycle locks
//!
//! Stop, restart and kill must never interleave for the same service.
//! The set hands out one lock per service name on demand, and each guard
//! records which operation is holding it, so a contending caller can be
//! told what it lost the race to. Kill paths use the non-waiting acquire;
//! everything else queues.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

/// Why a lifecycle lock could not be taken
#[derive(Debug, Error)]
pub enum LockError {
    #[error("another lifecycle operation is in progress")]
    Contended {
        /// Operation currently holding the lock, when it identified itself
        held_by: Option<&'static str>,
    },

    #[error("lock set is shutting down")]
    Closed,
}

#[derive(Debug)]
struct OpLock {
    semaphore: Arc<Semaphore>,
    holder: Mutex<Option<&'static str>>,
}

impl OpLock {
    fn new() -> Self {
        Self {
            // One permit per service: lifecycle operations are exclusive
            semaphore: Arc::new(Semaphore::new(1)),
            holder: Mutex::new(None),
        }
    }
}

/// Guard for one service's lifecycle lock; released on drop
pub struct OpGuard {
    lock: Arc<OpLock>,
    _permit: OwnedSemaphorePermit,
}

impl Drop for OpGuard {
    fn drop(&mut self) {
        *self.lock.holder.lock() = None;
    }
}

/// Named lifecycle locks, one per service
#[derive(Debug, Default)]
pub struct LockSet {
    locks: DashMap<String, Arc<OpLock>>,
}

impl LockSet {
    pub fn new() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }

    fn lock_for(&self, name: &str) -> Arc<OpLock> {
        self.locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(OpLock::new()))
            .clone()
    }

    /// Take the lock for `name`, waiting behind whoever holds it.
    ///
    /// `operation` is recorded for the benefit of contending callers.
    pub async fn acquire(&self, name: &str, operation: &'static str) -> Result<OpGuard, LockError> {
        let lock = self.lock_for(name);
        let permit = lock
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| LockError::Closed)?;

        *lock.holder.lock() = Some(operation);
        Ok(OpGuard {
            lock,
            _permit: permit,
        })
    }

    /// Take the lock for `name` without waiting.
    ///
    /// The error names the operation that holds the lock, when known.
    pub fn try_acquire(&self, name: &str, operation: &'static str) -> Result<OpGuard, LockError> {
        let lock = self.lock_for(name);
        match lock.semaphore.clone().try_acquire_owned() {
            Ok(permit) => {
                *lock.holder.lock() = Some(operation);
                Ok(OpGuard {
                    lock,
                    _permit: permit,
                })
            }
            Err(TryAcquireError::NoPermits) => Err(LockError::Contended {
                held_by: *lock.holder.lock(),
            }),
            Err(TryAcquireError::Closed) => Err(LockError::Closed),
        }
    }

    /// Which operation holds a service's lock right now, if any
    pub fn holder(&self, name: &str) -> Option<&'static str> {
        self.locks.get(name).and_then(|lock| *lock.holder.lock())
    }

    /// Whether a service's lock is currently held
    pub fn is_locked(&self, name: &str) -> bool {
        self.locks
            .get(name)
            .map(|lock| lock.semaphore.available_permits() == 0)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_exclusive_per_service() {
        let locks = LockSet::new();

        assert!(!locks.is_locked("web"));
        let guard = locks.acquire("web", "stop").await.unwrap();
        assert!(locks.is_locked("web"));
        assert_eq!(locks.holder("web"), Some("stop"));

        // A contending try_acquire learns who has it
        match locks.try_acquire("web", "kill") {
            Err(LockError::Contended { held_by }) => assert_eq!(held_by, Some("stop")),
            other => panic!("expected contention, got {:?}", other.err()),
        }

        drop(guard);
        assert!(!locks.is_locked("web"));
        assert_eq!(locks.holder("web"), None);
    }

    #[tokio::test]
    async fn test_services_do_not_contend_with_each_other() {
        let locks = LockSet::new();

        let _web = locks.acquire("web", "restart").await.unwrap();
        // A different service's lock is unaffected
        let _api = locks.try_acquire("api", "stop").unwrap();

        assert!(locks.is_locked("web"));
        assert!(locks.is_locked("api"));
    }

    #[tokio::test]
    async fn test_waiting_acquire_proceeds_after_release() {
        let locks = Arc::new(LockSet::new());

        let guard = locks.acquire("web", "stop").await.unwrap();

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.acquire("web", "restart").await.unwrap();
                locks.holder("web")
            })
        };

        // The waiter is queued until the stop guard goes away
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        drop(guard);

        assert_eq!(waiter.await.unwrap(), Some("restart"));
    }
}
