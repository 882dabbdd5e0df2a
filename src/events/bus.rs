//! Event bus for pub/sub messaging
//!
//! Provides a broadcast mechanism for service lifecycle events: status
//! transitions, health changes, console output and install progress.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Lifecycle status of a managed service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Pending,
    Starting,
    Running,
    Stopped,
    Error,
    Exited,
}

impl std::fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceStatus::Pending => write!(f, "pending"),
            ServiceStatus::Starting => write!(f, "starting"),
            ServiceStatus::Running => write!(f, "running"),
            ServiceStatus::Stopped => write!(f, "stopped"),
            ServiceStatus::Error => write!(f, "error"),
            ServiceStatus::Exited => write!(f, "exited"),
        }
    }
}

impl Default for ServiceStatus {
    fn default() -> Self {
        ServiceStatus::Pending
    }
}

/// Health state of a managed service as reported by the prober
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Unknown,
    Starting,
    Healthy,
    Degraded,
    Unhealthy,
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthState::Unknown => write!(f, "unknown"),
            HealthState::Starting => write!(f, "starting"),
            HealthState::Healthy => write!(f, "healthy"),
            HealthState::Degraded => write!(f, "degraded"),
            HealthState::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

impl Default for HealthState {
    fn default() -> Self {
        HealthState::Unknown
    }
}

/// Events that can be published through the event bus
#[derive(Debug, Clone)]
pub enum Event {
    /// Service lifecycle status changed
    StatusChange {
        service: String,
        status: ServiceStatus,
    },

    /// Service health changed
    HealthChange {
        service: String,
        health: HealthState,
    },

    /// One line of console output from a service
    ConsoleOutput {
        service: String,
        line: String,
    },

    /// A service process exited
    ServiceExited {
        service: String,
        code: Option<i32>,
    },

    /// Dependency installation started for a project directory
    InstallStarted {
        project: String,
    },

    /// Dependency installation completed for a project directory
    InstallCompleted {
        project: String,
        successful: bool,
    },

    /// A startup wave began executing
    WaveStarted {
        wave: usize,
        services: Vec<String>,
    },

    /// Orchestrated shutdown began
    ShutdownStarted,
}

/// Event bus for broadcasting events to multiple subscribers
///
/// Uses tokio broadcast channels for efficient pub/sub messaging.
/// Subscribers that fall behind will lose messages (lagged).
pub struct EventBus {
    sender: broadcast::Sender<Event>,
    // Keep a receiver to prevent the channel from closing
    _receiver: broadcast::Receiver<Event>,
}

impl EventBus {
    /// Create a new event bus with default capacity (4096 events)
    /// Higher capacity to handle console output bursts without lagging
    pub fn new() -> Self {
        Self::with_capacity(4096)
    }

    /// Create a new event bus with custom capacity
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _receiver) = broadcast::channel(capacity);
        Self { sender, _receiver }
    }

    /// Subscribe to the event bus
    ///
    /// Returns a receiver that will receive all events published after subscribing.
    /// If the subscriber falls behind, it will receive a `RecvError::Lagged` error.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Publish an event to all subscribers
    ///
    /// If there are no subscribers, the event is silently dropped.
    /// Returns the number of receivers that received the event.
    pub fn publish(&self, event: Event) -> usize {
        // Ignore send errors (no receivers)
        self.sender.send(event).unwrap_or(0)
    }

    /// Publish a status change for a service
    pub fn publish_status(&self, service: &str, status: ServiceStatus) -> usize {
        self.publish(Event::StatusChange {
            service: service.to_string(),
            status,
        })
    }

    /// Publish a health change for a service
    pub fn publish_health(&self, service: &str, health: HealthState) -> usize {
        self.publish(Event::HealthChange {
            service: service.to_string(),
            health,
        })
    }

    /// Publish one line of console output
    pub fn publish_console(&self, service: &str, line: String) -> usize {
        self.publish(Event::ConsoleOutput {
            service: service.to_string(),
            line,
        })
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            _receiver: self.sender.subscribe(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_event_bus_pubsub() {
        let bus = EventBus::new();

        // Subscribe
        let mut rx = bus.subscribe();

        // Publish event
        bus.publish_status("api", ServiceStatus::Running);

        // Receive
        let event = rx.recv().await.unwrap();
        match event {
            Event::StatusChange { service, status } => {
                assert_eq!(service, "api");
                assert_eq!(status, ServiceStatus::Running);
            }
            other => panic!("Expected StatusChange, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let bus = EventBus::new();

        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.publish_health("db", HealthState::Healthy);

        let event1 = rx1.recv().await.unwrap();
        let event2 = rx2.recv().await.unwrap();

        assert!(matches!(event1, Event::HealthChange { .. }));
        assert!(matches!(event2, Event::HealthChange { .. }));
    }

    #[test]
    fn test_subscriber_count() {
        let bus = EventBus::new();

        assert_eq!(bus.subscriber_count(), 0);

        let _rx1 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);

        let _rx2 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);
    }

    #[test]
    fn test_status_display() {
        assert_eq!(ServiceStatus::Pending.to_string(), "pending");
        assert_eq!(ServiceStatus::Running.to_string(), "running");
        assert_eq!(ServiceStatus::Exited.to_string(), "exited");
        assert_eq!(HealthState::Degraded.to_string(), "degraded");
        assert_eq!(HealthState::Unhealthy.to_string(), "unhealthy");
    }
}
