//! Probe scheduling: static rounds and the streaming aggregator
//!
//! Static mode fans out one probe per service, aggregates, and exits.
//! Streaming mode repeats every interval under a concurrency cap and emits
//! one complete summary per cycle; cancellation lets the current cycle
//! finish and emits a final summary.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::events::{EventBus, HealthState};
use crate::registry::Registry;

use super::prober::{Prober, ProbeTarget, ServiceProbe};
use super::{HealthReport, HealthResult};

/// Default streaming interval
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);

/// Default probe concurrency cap
pub const DEFAULT_CONCURRENCY: usize = 10;

/// Scheduling knobs
#[derive(Debug, Clone, Copy)]
pub struct MonitorConfig {
    pub interval: Duration,
    pub concurrency: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            concurrency: DEFAULT_CONCURRENCY,
        }
    }
}

/// Drives probes for a set of services
pub struct HealthMonitor {
    prober: Prober,
    probes: Vec<ServiceProbe>,
    project: String,
    registry: Option<Arc<Registry>>,
    events: Option<EventBus>,
    config: MonitorConfig,
    last_seen: parking_lot::Mutex<HashMap<String, HealthState>>,
}

impl HealthMonitor {
    /// Prepare probes (strategy selection happens here, once) and build the
    /// monitor
    pub async fn new(project: &str, targets: Vec<ProbeTarget>, config: MonitorConfig) -> Self {
        let prober = Prober::new();
        let mut probes = Vec::with_capacity(targets.len());
        for target in targets {
            probes.push(prober.prepare(target).await);
        }

        Self {
            prober,
            probes,
            project: project.to_string(),
            registry: None,
            events: None,
            config,
            last_seen: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// Record results into a registry as cycles complete
    pub fn with_registry(mut self, registry: Arc<Registry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Publish health transitions onto an event bus
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// The prepared probes (orchestrator gating inspects strategies)
    pub fn probes(&self) -> &[ServiceProbe] {
        &self.probes
    }

    /// One fan-out round: every probe runs under the concurrency cap and
    /// its own timeout; results arrive in declaration order.
    async fn round(&self) -> Vec<HealthResult> {
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency));

        let futures = self.probes.iter().map(|probe| {
            let prober = self.prober.clone();
            let probe = probe.clone();
            let semaphore = semaphore.clone();
            async move {
                let _permit = semaphore.acquire().await;
                prober.probe(&probe).await
            }
        });

        futures::future::join_all(futures).await
    }

    /// Run one cycle: probe, record, publish transitions, build the report
    pub async fn run_once(&self) -> HealthReport {
        let results = self.round().await;

        for result in &results {
            if let Some(registry) = &self.registry {
                registry.update_health(&result.service_name, result.status, result.error.clone());
            }

            let mut last_seen = self.last_seen.lock();
            let previous = last_seen.insert(result.service_name.clone(), result.status);
            if previous != Some(result.status) {
                debug!(
                    "Service {} health: {} -> {}",
                    result.service_name,
                    previous.map(|p| p.to_string()).unwrap_or_else(|| "none".into()),
                    result.status
                );
                if let Some(events) = &self.events {
                    events.publish_health(&result.service_name, result.status);
                }
            }
        }

        HealthReport::new(&self.project, results)
    }

    /// Static mode: one round, one report
    pub async fn run_static(&self) -> HealthReport {
        self.run_once().await
    }

    /// Streaming mode: one report per interval until cancelled. On
    /// cancellation one final cycle is emitted before returning.
    pub async fn run_streaming(
        &self,
        token: CancellationToken,
        tx: mpsc::Sender<HealthReport>,
    ) {
        loop {
            let report = self.run_once().await;
            if tx.send(report).await.is_err() {
                debug!("Health stream consumer went away");
                return;
            }

            tokio::select! {
                _ = token.cancelled() => {
                    info!("Health stream cancelled, emitting final summary");
                    let report = self.run_once().await;
                    let _ = tx.send(report).await;
                    return;
                }
                _ = tokio::time::sleep(self.config.interval) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{Healthcheck, ProbeTiming, ServiceType};

    fn tcp_target(name: &str, port: u16) -> ProbeTarget {
        ProbeTarget {
            service: name.to_string(),
            pid: None,
            port: Some(port),
            service_type: ServiceType::Tcp,
            declared: Some(Healthcheck::Tcp {
                port: Some(port),
                timing: ProbeTiming::default(),
            }),
            sink: None,
        }
    }

    #[tokio::test]
    async fn test_static_round_aggregates() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let open_port = listener.local_addr().unwrap().port();

        let closed = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let closed_port = closed.local_addr().unwrap().port();
        drop(closed);

        let monitor = HealthMonitor::new(
            "demo",
            vec![tcp_target("up", open_port), tcp_target("down", closed_port)],
            MonitorConfig::default(),
        )
        .await;

        let report = monitor.run_static().await;
        assert_eq!(report.summary.total, 2);
        assert_eq!(report.summary.healthy, 1);
        assert_eq!(report.summary.unhealthy, 1);
        assert_eq!(report.summary.overall, HealthState::Unhealthy);
        drop(listener);
    }

    #[tokio::test]
    async fn test_streaming_emits_final_cycle_on_cancel() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let monitor = HealthMonitor::new(
            "demo",
            vec![tcp_target("up", port)],
            MonitorConfig {
                interval: Duration::from_millis(50),
                concurrency: 2,
            },
        )
        .await;

        let token = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(16);

        let stream_token = token.clone();
        let handle = tokio::spawn(async move {
            monitor.run_streaming(stream_token, tx).await;
        });

        // First cycle arrives, then cancel
        let first = rx.recv().await.unwrap();
        assert_eq!(first.summary.overall, HealthState::Healthy);
        token.cancel();

        // At most one more cycle after the signal, then the stream ends
        let mut extra = 0;
        while rx.recv().await.is_some() {
            extra += 1;
        }
        assert!(extra <= 2, "{} cycles after cancel", extra);
        handle.await.unwrap();
        drop(listener);
    }

    #[tokio::test]
    async fn test_registry_updated_per_cycle() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let registry = Arc::new(Registry::new("demo"));
        registry.register(crate::registry::ServiceRecord::new("up", "node"));

        let monitor = HealthMonitor::new(
            "demo",
            vec![tcp_target("up", port)],
            MonitorConfig::default(),
        )
        .await
        .with_registry(registry.clone());

        monitor.run_static().await;
        let record = registry.get("up").unwrap();
        assert_eq!(record.health, HealthState::Healthy);
        assert!(record.last_checked.is_some());
        drop(listener);
    }
}
