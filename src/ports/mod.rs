//! Port management: allocation, reservation, conflict resolution and
//! persistence

mod conflict;
mod manager;
mod reservation;
mod store;

use thiserror::Error;

pub use conflict::{ConflictPrompt, FixedPrompt, PortConflict, PortHolder, Resolution, StdinPrompt};
pub use manager::{Assigned, PortManager, STALE_THRESHOLD};
pub use reservation::{is_available, Reservation};
pub use store::{project_hash, AssignmentStore, JsonFileStore, MemoryStore, PortAssignment, StoreError};

/// Errors from port management
#[derive(Debug, Error)]
pub enum PortError {
    #[error("Port {port} needed by service {service} is already in use")]
    InUse {
        port: u16,
        service: String,
        pid: Option<u32>,
        process: Option<String>,
    },

    #[error("No free port in range {start}-{end}")]
    RangeExhausted { start: u16, end: u16 },

    #[error("Invalid port {port}: {reason}")]
    Invalid { port: i64, reason: String },

    #[error("Could not reclaim port {port} from pid {pid}; process may be protected")]
    KillFailed { port: u16, pid: u32 },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Port store error: {0}")]
    Store(#[from] StoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
