//! Output sink for captured child output
//!
//! Each service gets one sink: an append-only bounded ring of recent lines
//! plus a broadcast channel for live subscribers (log tailing, the streaming
//! health command, output-pattern probes).

use std::collections::VecDeque;

use parking_lot::RwLock;
use tokio::sync::broadcast;

/// Default number of lines retained per service
const DEFAULT_RING_CAPACITY: usize = 1000;

/// A sink for one service's captured stdout/stderr.
///
/// Lines pushed here are retained in a bounded ring (for `logs` and for
/// output-pattern health checks that attach after the process started) and
/// broadcast to any live subscribers.
#[derive(Debug)]
pub struct OutputSink {
    sender: broadcast::Sender<String>,
    // Keep a receiver to prevent the channel from closing
    _receiver: broadcast::Receiver<String>,
    ring: RwLock<VecDeque<String>>,
    capacity: usize,
}

impl OutputSink {
    /// Create a new sink with the default ring capacity
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_RING_CAPACITY)
    }

    /// Create a new sink with custom ring capacity
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _receiver) = broadcast::channel(1024);
        Self {
            sender,
            _receiver,
            ring: RwLock::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Subscribe to live output
    ///
    /// Returns a receiver that will receive all lines pushed after subscribing.
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.sender.subscribe()
    }

    /// Push one line of output
    ///
    /// The line is appended to the ring (evicting the oldest when full) and
    /// broadcast to live subscribers.
    pub fn push(&self, line: String) {
        {
            let mut ring = self.ring.write();
            if ring.len() == self.capacity {
                ring.pop_front();
            }
            ring.push_back(line.clone());
        }
        // Ignore send errors (no receivers)
        let _ = self.sender.send(line);
    }

    /// Read the most recent `n` lines (oldest first)
    pub fn tail(&self, n: usize) -> Vec<String> {
        let ring = self.ring.read();
        let skip = ring.len().saturating_sub(n);
        ring.iter().skip(skip).cloned().collect()
    }

    /// All retained lines, oldest first
    pub fn snapshot(&self) -> Vec<String> {
        self.ring.read().iter().cloned().collect()
    }

    /// Number of lines currently retained
    pub fn len(&self) -> usize {
        self.ring.read().len()
    }

    /// Whether the ring is empty
    pub fn is_empty(&self) -> bool {
        self.ring.read().is_empty()
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for OutputSink {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for OutputSink {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            _receiver: self.sender.subscribe(),
            ring: RwLock::new(self.ring.read().clone()),
            capacity: self.capacity,
        }
    }
}
