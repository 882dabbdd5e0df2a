//! Process supervision: spawn, signal, stop, restart
//!
//! The supervisor owns the running children. Each service is spawned in its
//! own process group with stdout/stderr pumped into a per-service output
//! sink; an exit watcher reaps the child and reports through the registry
//! and the event bus. Stopping is graceful-then-forceful: SIGTERM to the
//! group, a bounded wait, then a tree kill with the children going first.

pub mod command;
pub mod crash;
pub mod signal;

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use command_group::AsyncCommandGroup;
use dashmap::DashMap;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

pub use command::{resolve_invocation, CommandError, Invocation, PORT_PLACEHOLDER};
pub use crash::CrashTracker;

use crate::events::{Event, EventBus, ServiceStatus};
use crate::manifest::{OnExitPolicy, ServiceMode};
use crate::registry::Registry;
use crate::system::{LockError, LockSet, OutputSink};

/// Default graceful-stop window
pub const GRACEFUL_STOP_TIMEOUT: Duration = Duration::from_secs(30);

/// Exit verification: attempts x delay, shared with the port manager's
/// reclaim loop
const EXIT_VERIFY_ATTEMPTS: u32 = 4;
const EXIT_VERIFY_DELAY: Duration = Duration::from_millis(500);

/// Errors from supervision
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Failed to spawn {service}: {source}")]
    Spawn {
        service: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Service not running: {0}")]
    NotRunning(String),

    #[error("Service already running: {0}")]
    AlreadyRunning(String),

    #[error("Service {0} did not exit within the forceful window")]
    StopFailed(String),

    #[error("Another lifecycle operation is already running on {0}")]
    Busy(String),

    #[error(transparent)]
    Command(#[from] CommandError),
}

/// Everything needed to spawn (and respawn) one service
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub name: String,
    pub invocation: Invocation,
    pub cwd: PathBuf,
    /// Environment overlay applied on top of the parent environment
    pub env: Vec<(String, String)>,
    pub port: Option<u16>,
    pub mode: ServiceMode,
    pub on_exit: OnExitPolicy,
}

/// Exit information delivered by the watcher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
}

/// Handle to one supervised service
pub struct RunningService {
    pub name: String,
    pub pid: u32,
    pub port: Option<u16>,
    pub mode: ServiceMode,
    spec: SpawnSpec,
    sink: Arc<OutputSink>,
    exit_rx: watch::Receiver<Option<ExitInfo>>,
    expected_running: Arc<AtomicBool>,
    crash: Arc<CrashTracker>,
}

impl RunningService {
    /// Spawn spec used for restarts
    pub fn spec(&self) -> &SpawnSpec {
        &self.spec
    }

    /// Output sink for tailing and output-pattern probes
    pub fn sink(&self) -> Arc<OutputSink> {
        self.sink.clone()
    }

    /// Crash tracker guarding `on_exit: restart`
    pub fn crash_tracker(&self) -> Arc<CrashTracker> {
        self.crash.clone()
    }

    /// Exit info once the child is gone
    pub fn exit_info(&self) -> Option<ExitInfo> {
        *self.exit_rx.borrow()
    }

    /// Wait (bounded) for the child to exit
    pub async fn wait_exit(&self, timeout: Duration) -> Option<ExitInfo> {
        let mut rx = self.exit_rx.clone();
        if rx.borrow().is_some() {
            return *rx.borrow();
        }
        match tokio::time::timeout(timeout, rx.changed()).await {
            Ok(Ok(())) => *rx.borrow(),
            _ => None,
        }
    }
}

/// Supervisor for all services in one project
pub struct Supervisor {
    registry: Arc<Registry>,
    events: EventBus,
    services: DashMap<String, Arc<RunningService>>,
    /// Per-service lifecycle locks, so stop/restart never interleave
    locks: LockSet,
}

impl Supervisor {
    pub fn new(registry: Arc<Registry>, events: EventBus) -> Self {
        Self {
            registry,
            events,
            services: DashMap::new(),
            locks: LockSet::new(),
        }
    }

    fn busy_error(&self, name: &str, cause: LockError) -> SupervisorError {
        match cause {
            LockError::Contended { held_by: Some(op) } => {
                SupervisorError::Busy(format!("{} (busy with {})", name, op))
            }
            _ => SupervisorError::Busy(name.to_string()),
        }
    }

    /// Event bus used for lifecycle notifications
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Handle for a running service
    pub fn get(&self, name: &str) -> Option<Arc<RunningService>> {
        self.services.get(name).map(|s| s.value().clone())
    }

    /// All running services
    pub fn all(&self) -> Vec<Arc<RunningService>> {
        self.services.iter().map(|s| s.value().clone()).collect()
    }

    /// Spawn a service and begin supervising it.
    ///
    /// The caller must have released any port reservation for
    /// `spec.port` immediately before calling; the child performs its own
    /// bind and a failure there surfaces as a fast exit.
    pub async fn spawn(&self, spec: SpawnSpec) -> Result<Arc<RunningService>, SupervisorError> {
        if self.services.contains_key(&spec.name) {
            return Err(SupervisorError::AlreadyRunning(spec.name.clone()));
        }

        info!("Spawning service {}: {}", spec.name, spec.invocation.describe());

        let mut cmd = spec.invocation.to_command();
        cmd.current_dir(&spec.cwd)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        // Own process group so the whole tree can be signaled together
        let mut child = cmd.group_spawn().map_err(|source| {
            self.registry.update_status(
                &spec.name,
                ServiceStatus::Error,
                Some(source.to_string()),
            );
            SupervisorError::Spawn {
                service: spec.name.clone(),
                source,
            }
        })?;

        let pid = child.inner().id().unwrap_or(0);
        debug!("Service {} spawned with pid {}", spec.name, pid);

        let sink = Arc::new(OutputSink::new());
        let crash = Arc::new(CrashTracker::new());
        crash.record_start();

        // Output pumps
        if let Some(stdout) = child.inner().stdout.take() {
            self.pump_output(&spec.name, stdout, sink.clone());
        }
        if let Some(stderr) = child.inner().stderr.take() {
            self.pump_output(&spec.name, stderr, sink.clone());
        }

        // Status must say starting before the exit watcher can race a
        // fast-exiting child into `exited`
        self.registry.update_pid(&spec.name, pid);
        self.registry
            .update_status(&spec.name, ServiceStatus::Starting, None);
        self.events.publish_status(&spec.name, ServiceStatus::Starting);

        let (exit_tx, exit_rx) = watch::channel(None);
        let expected_running = Arc::new(AtomicBool::new(true));

        // Exit watcher owns the child
        {
            let name = spec.name.clone();
            let registry = self.registry.clone();
            let events = self.events.clone();
            let expected = expected_running.clone();
            tokio::spawn(async move {
                let status = child.wait().await;
                let code = status.as_ref().ok().and_then(|s| s.code());
                debug!("Service {} exited with {:?}", name, code);

                registry.update_pid(&name, 0);
                if expected.load(Ordering::SeqCst) {
                    registry.update_status(&name, ServiceStatus::Exited, None);
                    events.publish(Event::ServiceExited {
                        service: name.clone(),
                        code,
                    });
                }

                let _ = exit_tx.send(Some(ExitInfo { code }));
            });
        }

        let service = Arc::new(RunningService {
            name: spec.name.clone(),
            pid,
            port: spec.port,
            mode: spec.mode,
            spec,
            sink,
            exit_rx,
            expected_running,
            crash,
        });

        self.services
            .insert(service.name.clone(), service.clone());
        Ok(service)
    }

    fn pump_output<R>(&self, name: &str, reader: R, sink: Arc<OutputSink>)
    where
        R: tokio::io::AsyncRead + Unpin + Send + 'static,
    {
        let name = name.to_string();
        let events = self.events.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                sink.push(line.clone());
                events.publish_console(&name, line);
            }
        });
    }

    /// Gracefully stop a service: SIGTERM to the group, wait up to `grace`,
    /// then escalate to a tree kill (children first), then verify the exit.
    pub async fn stop(&self, name: &str, grace: Duration) -> Result<(), SupervisorError> {
        let _guard = self
            .locks
            .acquire(name, "stop")
            .await
            .map_err(|cause| self.busy_error(name, cause))?;
        self.stop_inner(name, grace).await
    }

    async fn stop_inner(&self, name: &str, grace: Duration) -> Result<(), SupervisorError> {
        let Some((_, service)) = self.services.remove(name) else {
            return Err(SupervisorError::NotRunning(name.to_string()));
        };

        service.expected_running.store(false, Ordering::SeqCst);
        info!("Stopping service {} (pid {})", name, service.pid);

        signal::terminate_group(service.pid);

        if service.wait_exit(grace).await.is_none() {
            warn!(
                "Service {} did not stop within {:?}, escalating",
                name, grace
            );
            signal::kill_tree(service.pid).await;
        }

        // The OS must confirm the exit before the port is considered free
        if !signal::wait_gone(service.pid, EXIT_VERIFY_ATTEMPTS, EXIT_VERIFY_DELAY).await {
            error!("Service {} (pid {}) refused to die", name, service.pid);
            self.registry.update_status(
                name,
                ServiceStatus::Error,
                Some("graceful stop timed out and force kill failed".into()),
            );
            return Err(SupervisorError::StopFailed(name.to_string()));
        }

        self.registry.update_pid(name, 0);
        self.registry
            .update_status(name, ServiceStatus::Stopped, None);
        self.events.publish_status(name, ServiceStatus::Stopped);
        info!("Service {} stopped", name);
        Ok(())
    }

    /// Force kill a service without the graceful window. Unlike stop,
    /// kill does not wait its turn behind another lifecycle operation.
    pub async fn kill(&self, name: &str) -> Result<(), SupervisorError> {
        let _guard = self
            .locks
            .try_acquire(name, "kill")
            .map_err(|cause| self.busy_error(name, cause))?;

        let Some((_, service)) = self.services.remove(name) else {
            return Err(SupervisorError::NotRunning(name.to_string()));
        };

        service.expected_running.store(false, Ordering::SeqCst);
        info!("Killing service {} (pid {})", name, service.pid);

        signal::kill_tree(service.pid).await;

        if !signal::wait_gone(service.pid, EXIT_VERIFY_ATTEMPTS, EXIT_VERIFY_DELAY).await {
            return Err(SupervisorError::StopFailed(name.to_string()));
        }

        self.registry.update_pid(name, 0);
        self.registry
            .update_status(name, ServiceStatus::Stopped, None);
        self.events.publish_status(name, ServiceStatus::Stopped);
        Ok(())
    }

    /// Restart: graceful stop, then respawn with the same spec (and
    /// therefore the same port preference)
    pub async fn restart(&self, name: &str) -> Result<Arc<RunningService>, SupervisorError> {
        let _guard = self
            .locks
            .acquire(name, "restart")
            .await
            .map_err(|cause| self.busy_error(name, cause))?;

        let spec = self
            .get(name)
            .map(|s| s.spec().clone())
            .ok_or_else(|| SupervisorError::NotRunning(name.to_string()))?;

        self.stop_inner(name, GRACEFUL_STOP_TIMEOUT).await?;
        self.spawn(spec).await
    }

    /// Respawn a service that already exited (restart-on-crash path);
    /// unlike [`restart`](Self::restart) there is nothing to stop first.
    pub async fn respawn(&self, spec: SpawnSpec) -> Result<Arc<RunningService>, SupervisorError> {
        self.services.remove(&spec.name);
        self.spawn(spec).await
    }

    /// Current registry status for a service
    pub fn status(&self, name: &str) -> Option<ServiceStatus> {
        self.registry.get(name).map(|r| r.status)
    }

    /// Stop every service in the given order (callers pass reverse
    /// topological order so dependents go down before dependencies)
    pub async fn stop_all(&self, order: &[String], grace: Duration) {
        for name in order {
            if self.services.contains_key(name) {
                if let Err(e) = self.stop(name, grace).await {
                    warn!("Error stopping {}: {}", name, e);
                }
            }
        }

        // Anything not covered by the ordering
        let stragglers: Vec<String> =
            self.services.iter().map(|s| s.key().clone()).collect();
        for name in stragglers {
            if let Err(e) = self.stop(&name, grace).await {
                warn!("Error stopping {}: {}", name, e);
            }
        }
    }
}
