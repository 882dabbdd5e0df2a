//! Shared system primitives

mod locker;
mod sink;

pub use locker::{LockError, LockSet, OpGuard};
pub use sink::OutputSink;
