//! Service lifecycle events

mod bus;

pub use bus::{Event, EventBus, HealthState, ServiceStatus};
