//! Crash detection for supervised restarts
//!
//! A service with `on_exit: restart` is respawned when it dies, but a
//! crash-looping process must not be restarted forever: crashes inside a
//! rolling window are counted and auto-restart is disabled at the limit.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};

/// Time window for counting crashes (10 minutes)
const CRASH_WINDOW: Duration = Duration::from_secs(600);

/// Number of crashes before disabling auto-restart
const CRASH_LIMIT: u32 = 3;

/// Minimum runtime before an exit stops counting as a crash (10 seconds)
const MIN_RUNTIME_FOR_CRASH: Duration = Duration::from_secs(10);

/// Crash detection for one service
#[derive(Debug)]
pub struct CrashTracker {
    /// Number of crashes in the current window
    crash_count: AtomicU32,

    /// Timestamp of first crash in window
    window_start: AtomicU64,

    /// Whether crash counting is enabled
    enabled: AtomicBool,

    /// Last spawn time (for calculating runtime)
    last_start: parking_lot::Mutex<Option<Instant>>,
}

impl CrashTracker {
    pub fn new() -> Self {
        Self {
            crash_count: AtomicU32::new(0),
            window_start: AtomicU64::new(0),
            enabled: AtomicBool::new(true),
            last_start: parking_lot::Mutex::new(None),
        }
    }

    /// Record a spawn
    pub fn record_start(&self) {
        *self.last_start.lock() = Some(Instant::now());
    }

    /// Whether an exit should be treated as a crash.
    ///
    /// Exit code 0 is never a crash. A non-zero exit after a short runtime
    /// is; a long-running service that finally failed is not a crash loop.
    pub fn is_crash(&self, exit_code: Option<i32>) -> bool {
        match exit_code {
            Some(0) => return false,
            None => {} // killed by signal: count it
            Some(_) => {}
        }

        let last_start = self.last_start.lock();
        if let Some(start) = *last_start {
            let runtime = start.elapsed();
            if runtime < MIN_RUNTIME_FOR_CRASH {
                debug!(
                    "Service ran for {:?}, treating exit code {:?} as crash",
                    runtime, exit_code
                );
                return true;
            }
        }

        false
    }

    /// Record a crash and check if the limit was hit.
    ///
    /// Returns true if auto-restart should be disabled.
    pub fn record_crash(&self) -> bool {
        if !self.enabled.load(Ordering::SeqCst) {
            return true;
        }

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        let window_start = self.window_start.load(Ordering::SeqCst);

        // Outside the crash window: start a new one
        if window_start == 0 || now - window_start > CRASH_WINDOW.as_secs() {
            self.window_start.store(now, Ordering::SeqCst);
            self.crash_count.store(1, Ordering::SeqCst);
            info!("First crash in new window, count: 1");
            return false;
        }

        let count = self.crash_count.fetch_add(1, Ordering::SeqCst) + 1;
        info!("Crash #{} in current window", count);

        if count >= CRASH_LIMIT {
            warn!(
                "Service has crashed {} times in {:?}, disabling auto-restart",
                count, CRASH_WINDOW
            );
            return true;
        }

        false
    }

    /// Reset the crash counter
    pub fn reset(&self) {
        self.crash_count.store(0, Ordering::SeqCst);
        self.window_start.store(0, Ordering::SeqCst);
    }

    /// Current crash count
    pub fn crash_count(&self) -> u32 {
        self.crash_count.load(Ordering::SeqCst)
    }
}

impl Default for CrashTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_exit_is_not_a_crash() {
        let tracker = CrashTracker::new();
        tracker.record_start();
        assert!(!tracker.is_crash(Some(0)));
    }

    #[test]
    fn test_fast_failure_is_a_crash() {
        let tracker = CrashTracker::new();
        tracker.record_start();
        assert!(tracker.is_crash(Some(1)));
        assert!(tracker.is_crash(None));
    }

    #[test]
    fn test_crash_limit() {
        let tracker = CrashTracker::new();

        assert!(!tracker.record_crash());
        assert_eq!(tracker.crash_count(), 1);

        assert!(!tracker.record_crash());
        assert_eq!(tracker.crash_count(), 2);

        // Third crash disables restart
        assert!(tracker.record_crash());
        assert_eq!(tracker.crash_count(), 3);
    }

    #[test]
    fn test_reset() {
        let tracker = CrashTracker::new();
        tracker.record_crash();
        tracker.record_crash();
        tracker.reset();
        assert_eq!(tracker.crash_count(), 0);
    }
}
