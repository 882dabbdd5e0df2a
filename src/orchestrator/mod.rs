//! Orchestration: requirements gate, install fan-out, wave execution
//!
//! The orchestrator turns the manifest into a minimally-waved startup plan
//! and executes it: tools are checked, dependencies installed in parallel,
//! then each wave reserves ports, spawns processes and waits for health
//! before the next wave is released. Shutdown walks the plan in reverse.

pub mod graph;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub use graph::ServiceGraph;

use crate::events::{Event, EventBus, ServiceStatus};
use crate::health::prober::{ProbeTarget, Prober};
use crate::install::Installer;
use crate::manifest::{
    Healthcheck, Manifest, ManifestError, OnExitPolicy, PortSpec, ProbeTiming, ServiceMode,
    ServiceSpec,
};
use crate::ports::{PortError, PortManager, Reservation};
use crate::process::{
    crash::CrashTracker, resolve_invocation, CommandError, SpawnSpec, Supervisor, SupervisorError,
    GRACEFUL_STOP_TIMEOUT,
};
use crate::registry::{Registry, ServiceRecord};
use crate::reqs::{self, RequirementOutcome};
use crate::events::HealthState;

/// Floor on the per-wave readiness window
const MIN_LAYER_TIMEOUT: Duration = Duration::from_secs(60);

/// Window in which a fresh child exiting non-zero is treated as a bind
/// race worth one respawn
const BIND_RETRY_WINDOW: Duration = Duration::from_millis(1000);

/// Orchestration failures
#[derive(Debug, Error)]
pub enum OrchestrateError {
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error("{} requirement(s) not satisfied", failed.len())]
    RequirementsNotMet { failed: Vec<RequirementOutcome> },

    #[error("{} dependency install(s) failed", failures.len())]
    InstallFailed { failures: Vec<String> },

    #[error(transparent)]
    Port(#[from] PortError),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("Service {service} was not ready within the wave {wave} window")]
    LayerTimeout { wave: usize, service: String },

    #[error("Service {service} failed (exit {code:?})")]
    ServiceFailed {
        service: String,
        code: Option<i32>,
    },

    #[error("Operation cancelled")]
    Cancelled,
}

impl OrchestrateError {
    /// Process exit code this failure maps to
    pub fn exit_code(&self) -> i32 {
        match self {
            OrchestrateError::Cancelled => 130,
            _ => 2,
        }
    }
}

/// Executes the startup plan and supervises the fleet afterwards
pub struct Orchestrator {
    manifest: Manifest,
    graph: ServiceGraph,
    registry: Arc<Registry>,
    supervisor: Arc<Supervisor>,
    ports: Arc<PortManager>,
    events: EventBus,
    token: CancellationToken,
    prober: Prober,
    /// Crash windows survive respawns, one tracker per service
    crash_trackers: Mutex<HashMap<String, Arc<CrashTracker>>>,
}

impl Orchestrator {
    pub fn new(
        manifest: Manifest,
        registry: Arc<Registry>,
        supervisor: Arc<Supervisor>,
        ports: Arc<PortManager>,
        events: EventBus,
        token: CancellationToken,
    ) -> Result<Self, OrchestrateError> {
        let graph = ServiceGraph::build(&manifest)?;

        // Seed the registry so observers see declared services immediately;
        // existing records (a concurrent or prior run) are left alone
        for (name, spec) in &manifest.services {
            if registry.get(name).is_none() {
                registry.register(ServiceRecord::new(name.clone(), spec.language.clone()));
            }
        }

        Ok(Self {
            manifest,
            graph,
            registry,
            supervisor,
            ports,
            events,
            token,
            prober: Prober::new(),
            crash_trackers: Mutex::new(HashMap::new()),
        })
    }

    pub fn graph(&self) -> &ServiceGraph {
        &self.graph
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// Run the full startup plan. On failure services already started are
    /// stopped in reverse order before the error propagates.
    pub async fn run(&self) -> Result<(), OrchestrateError> {
        if let Err(e) = self.run_inner().await {
            error!("Orchestration failed: {}", e);
            self.shutdown().await;
            return Err(e);
        }
        Ok(())
    }

    async fn run_inner(&self) -> Result<(), OrchestrateError> {
        self.check_requirements().await?;
        self.install_dependencies().await?;

        let waves = self.graph.waves()?;
        info!(
            "Starting {} service(s) in {} wave(s)",
            self.manifest.services.len(),
            waves.len()
        );

        for (index, wave) in waves.iter().enumerate() {
            if self.token.is_cancelled() {
                return Err(OrchestrateError::Cancelled);
            }

            info!("Wave {}: starting {}", index + 1, wave.join(", "));
            self.events.publish(Event::WaveStarted {
                wave: index + 1,
                services: wave.clone(),
            });

            let spawns = wave.iter().map(|name| self.start_service(name));
            for result in futures::future::join_all(spawns).await {
                result?;
            }

            let gates = wave.iter().map(|name| self.await_ready(index + 1, name));
            for result in futures::future::join_all(gates).await {
                result?;
            }

            info!("Wave {} ready", index + 1);
        }

        Ok(())
    }

    /// Gate startup on the manifest's tool requirements
    async fn check_requirements(&self) -> Result<(), OrchestrateError> {
        if self.manifest.reqs.is_empty() {
            return Ok(());
        }

        info!("Checking {} requirement(s)", self.manifest.reqs.len());
        let outcomes = reqs::check_all(&self.manifest.reqs, &self.token).await;

        let failed: Vec<RequirementOutcome> = outcomes
            .into_iter()
            .filter(|outcome| !outcome.satisfied)
            .collect();

        if failed.is_empty() {
            return Ok(());
        }

        for outcome in &failed {
            match &outcome.install_url {
                Some(url) => error!("Requirement {}: {} ({})", outcome.id, outcome.message, url),
                None => error!("Requirement {}: {}", outcome.id, outcome.message),
            }
        }
        Err(OrchestrateError::RequirementsNotMet { failed })
    }

    /// Materialize per-project dependencies before any service spawns
    async fn install_dependencies(&self) -> Result<(), OrchestrateError> {
        let tasks = Installer::detect_tasks(&self.manifest);
        if tasks.is_empty() {
            return Ok(());
        }

        let installer = Installer::new().with_events(self.events.clone());
        let reports = installer.run_all(tasks, &self.token).await;

        let failures: Vec<String> = reports
            .iter()
            .filter_map(|report| report.result.as_ref().err().map(|e| e.to_string()))
            .collect();

        if failures.is_empty() {
            return Ok(());
        }

        for failure in &failures {
            error!("Install: {}", failure);
        }
        Err(OrchestrateError::InstallFailed { failures })
    }

    /// Reserve the service's port, resolve the invocation, merge the
    /// environment, release the reservation and spawn.
    async fn start_service(&self, name: &str) -> Result<(), OrchestrateError> {
        let spec = &self.manifest.services[name];
        let project_dir = self.manifest.project_dir(spec);
        let port_specs = spec.port_specs(name)?;

        let (reservation, granted, declared): (Option<Reservation>, Option<u16>, Option<u16>) =
            match port_specs.first() {
                Some(PortSpec::Fixed(pinned)) => {
                    // Assignments are namespaced by the manifest's project
                    // root, not the service's own directory
                    let assigned = self
                        .ports
                        .assign(&self.manifest.root, name, Some(*pinned), true)
                        .await?;
                    // Hold the port until just before the spawn; the kill
                    // path may leave a tiny gap where a rebind loses a race
                    let reservation = self.ports.reserve(assigned.port).ok();
                    (reservation, Some(assigned.port), Some(*pinned))
                }
                Some(PortSpec::Auto) => {
                    let (reservation, _) = self
                        .ports
                        .find_and_reserve(&self.manifest.root, name, None)
                        .await?;
                    let port = reservation.port();
                    (Some(reservation), Some(port), None)
                }
                None => (None, None, None),
            };

        if let Some(port) = granted {
            self.registry.update_port(name, port, declared);
        }

        let mut invocation = resolve_invocation(spec, &project_dir)?;
        if let Some(port) = granted {
            invocation.substitute_port(port);
        }

        let env = self.build_env(name, spec, granted);

        let spawn_spec = SpawnSpec {
            name: name.to_string(),
            invocation,
            cwd: project_dir,
            env,
            port: granted,
            mode: spec.mode,
            on_exit: spec.on_exit,
        };

        self.crash_tracker(name).record_start();

        // The reservation's listener must be gone before the child binds
        if let Some(reservation) = &reservation {
            reservation.release();
        }

        let handle = self.supervisor.spawn(spawn_spec.clone()).await?;

        // The residual reserve-to-bind window is irreducible; one quick
        // respawn covers a lost race
        if granted.is_some() {
            if let Some(exit) = handle.wait_exit(BIND_RETRY_WINDOW).await {
                if exit.code != Some(0) && spec.mode == ServiceMode::Daemon {
                    warn!(
                        "Service {} exited immediately (code {:?}), respawning once",
                        name, exit.code
                    );
                    self.crash_tracker(name).record_start();
                    self.supervisor.respawn(spawn_spec).await?;
                }
            }
        }

        Ok(())
    }

    /// Environment overlay: `.env` file, manifest environment, then the
    /// injected PORT and peer SERVICE_* variables
    fn build_env(&self, name: &str, spec: &ServiceSpec, port: Option<u16>) -> Vec<(String, String)> {
        let mut env: Vec<(String, String)> = Vec::new();

        if let Some(env_file) = &spec.env_file {
            let path = self.manifest.root.join(env_file);
            match dotenvy::from_path_iter(&path) {
                Ok(entries) => {
                    for entry in entries.flatten() {
                        env.push(entry);
                    }
                }
                Err(e) => warn!("Could not read env file {}: {}", path.display(), e),
            }
        }

        for (key, value) in &spec.environment {
            env.push((key.clone(), value.clone()));
        }

        if let Some(port) = port {
            env.push(("PORT".to_string(), port.to_string()));
        }

        // Peers that already have a port (earlier waves, persisted runs)
        for record in self.registry.list_all() {
            if record.name == name {
                continue;
            }
            let Some(peer_port) = record.port else {
                continue;
            };
            let upper = env_var_name(&record.name);
            env.push((
                format!("SERVICE_{}_URL", upper),
                format!("http://localhost:{}", peer_port),
            ));
            env.push((format!("SERVICE_{}_PORT", upper), peer_port.to_string()));
        }

        env
    }

    /// Wait until a service satisfies its wave gate.
    ///
    /// Daemon services must reach `healthy`; process-checked services in
    /// watch mode are gated on being alive; build/task services are gated
    /// on a clean exit.
    async fn await_ready(&self, wave: usize, name: &str) -> Result<(), OrchestrateError> {
        let spec = &self.manifest.services[name];
        let declared = spec.resolved_healthcheck(name)?;
        let timing = declared
            .as_ref()
            .map(Healthcheck::timing)
            .unwrap_or_default();

        let deadline = tokio::time::Instant::now() + layer_timeout(&timing);
        let poll = if timing.start_interval.is_zero() {
            Duration::from_secs(1)
        } else {
            timing.start_interval
        };

        loop {
            if self.token.is_cancelled() {
                return Err(OrchestrateError::Cancelled);
            }

            match self.gate_state(name, spec, &declared).await {
                GateState::Ready => {
                    if spec.mode == ServiceMode::Daemon || spec.mode == ServiceMode::Watch {
                        self.registry.update_status(name, ServiceStatus::Running, None);
                        self.events.publish_status(name, ServiceStatus::Running);
                    }
                    info!("Service {} is ready", name);
                    return Ok(());
                }
                GateState::Failed(code) => {
                    return Err(OrchestrateError::ServiceFailed {
                        service: name.to_string(),
                        code,
                    });
                }
                GateState::Waiting => {}
            }

            if tokio::time::Instant::now() >= deadline {
                error!("Service {} missed its wave {} readiness window", name, wave);
                return Err(OrchestrateError::LayerTimeout {
                    wave,
                    service: name.to_string(),
                });
            }

            tokio::time::sleep(poll).await;
        }
    }

    async fn gate_state(
        &self,
        name: &str,
        spec: &ServiceSpec,
        declared: &Option<Healthcheck>,
    ) -> GateState {
        let record = self.registry.get(name).unwrap_or_else(|| {
            ServiceRecord::new(name.to_string(), spec.language.clone())
        });
        let handle = self.supervisor.get(name);

        // Exits first: build/task completion vs daemon failure
        if record.status == ServiceStatus::Exited || record.status == ServiceStatus::Error {
            let code = handle.as_ref().and_then(|h| h.exit_info()).and_then(|e| e.code);
            return match spec.mode {
                ServiceMode::Build | ServiceMode::Task if code == Some(0) => GateState::Ready,
                _ => GateState::Failed(code),
            };
        }

        // Build/task services are only ready once they have exited cleanly
        if matches!(spec.mode, ServiceMode::Build | ServiceMode::Task) {
            return GateState::Waiting;
        }

        // Watch-mode process checks gate on liveness alone
        let is_process_check = match declared {
            Some(Healthcheck::Process) | Some(Healthcheck::Disabled) => true,
            None => record.port.is_none(),
            _ => false,
        };
        if is_process_check && spec.mode == ServiceMode::Watch {
            return match record.pid {
                0 => GateState::Waiting,
                pid if crate::process::signal::pid_alive(pid) => GateState::Ready,
                _ => GateState::Waiting,
            };
        }

        // Everything else: probe. Strategy selection is retried while the
        // service comes up; the steady-state monitor caches its choice.
        let target = ProbeTarget {
            service: name.to_string(),
            pid: (record.pid != 0).then_some(record.pid),
            port: record.port,
            service_type: spec.effective_type(),
            declared: declared.clone(),
            sink: handle.map(|h| h.sink()),
        };

        let probe = self.prober.prepare(target).await;
        let result = self.prober.probe(&probe).await;
        self.registry
            .update_health(name, result.status, result.error.clone());

        match result.status {
            HealthState::Healthy => GateState::Ready,
            _ => {
                debug!(
                    "Service {} not ready yet: {} ({})",
                    name,
                    result.status,
                    result.error.as_deref().unwrap_or("no detail")
                );
                GateState::Waiting
            }
        }
    }

    /// Start and gate a single service (the `restart <service>` path).
    /// Requirements and installs are assumed settled.
    pub async fn run_single(&self, name: &str) -> Result<(), OrchestrateError> {
        if !self.manifest.services.contains_key(name) {
            return Err(OrchestrateError::Supervisor(SupervisorError::NotRunning(
                name.to_string(),
            )));
        }
        self.start_service(name).await?;
        self.await_ready(1, name).await
    }

    /// Supervise after startup: apply `on_exit` policy to exits until the
    /// root token is cancelled (user shutdown).
    pub async fn supervise(&self) -> Result<(), OrchestrateError> {
        let mut rx = self.events.subscribe();

        loop {
            tokio::select! {
                _ = self.token.cancelled() => return Ok(()),
                event = rx.recv() => {
                    match event {
                        Ok(Event::ServiceExited { service, code }) => {
                            self.handle_exit(&service, code).await?;
                        }
                        Ok(_) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => return Ok(()),
                    }
                }
            }
        }
    }

    async fn handle_exit(&self, service: &str, code: Option<i32>) -> Result<(), OrchestrateError> {
        let Some(spec) = self.manifest.services.get(service) else {
            return Ok(());
        };

        match spec.on_exit {
            OnExitPolicy::Ignore => {
                info!(
                    "Service {} exited (code {:?}); policy is ignore",
                    service, code
                );
                Ok(())
            }
            OnExitPolicy::Fail => {
                error!(
                    "Service {} exited (code {:?}); policy is fail, aborting",
                    service, code
                );
                Err(OrchestrateError::ServiceFailed {
                    service: service.to_string(),
                    code,
                })
            }
            OnExitPolicy::Restart => {
                if spec.mode != ServiceMode::Daemon {
                    info!(
                        "Service {} exited but is not a daemon; not restarting",
                        service
                    );
                    return Ok(());
                }

                let tracker = self.crash_tracker(service);
                if tracker.is_crash(code) && tracker.record_crash() {
                    warn!(
                        "Service {} is crash-looping; auto-restart disabled",
                        service
                    );
                    return Ok(());
                }

                let Some(handle) = self.supervisor.get(service) else {
                    return Ok(());
                };
                info!("Restarting service {} (exit code {:?})", service, code);
                tracker.record_start();
                self.supervisor.respawn(handle.spec().clone()).await?;
                Ok(())
            }
        }
    }

    fn crash_tracker(&self, name: &str) -> Arc<CrashTracker> {
        self.crash_trackers
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CrashTracker::new()))
            .clone()
    }

    /// Stop everything in reverse topological order
    pub async fn shutdown(&self) {
        info!("Stopping all services");
        self.events.publish(Event::ShutdownStarted);
        self.supervisor
            .stop_all(&self.graph.reverse_order(), GRACEFUL_STOP_TIMEOUT)
            .await;
    }
}

enum GateState {
    Ready,
    Waiting,
    Failed(Option<i32>),
}

/// Per-wave readiness window: generous enough for the slowest declared
/// healthcheck, never below the floor
fn layer_timeout(timing: &ProbeTiming) -> Duration {
    let declared = timing.start_period + timing.interval * timing.retries;
    declared.max(MIN_LAYER_TIMEOUT)
}

/// SERVICE_<NAME>_URL style identifier
fn env_var_name(service: &str) -> String {
    service
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PortRange;

    fn harness(yaml: &str) -> (Orchestrator, Arc<Registry>, Arc<Supervisor>) {
        let manifest = Manifest::from_str(yaml).unwrap();
        let registry = Arc::new(Registry::new(manifest.name.clone()));
        let events = EventBus::new();
        let supervisor = Arc::new(Supervisor::new(registry.clone(), events.clone()));
        let ports = Arc::new(PortManager::in_memory(PortRange::default()));

        let orchestrator = Orchestrator::new(
            manifest,
            registry.clone(),
            supervisor.clone(),
            ports,
            events,
            CancellationToken::new(),
        )
        .unwrap();
        (orchestrator, registry, supervisor)
    }

    #[test]
    fn test_env_var_name() {
        assert_eq!(env_var_name("api"), "API");
        assert_eq!(env_var_name("my-worker"), "MY_WORKER");
        assert_eq!(env_var_name("db2"), "DB2");
    }

    #[test]
    fn test_layer_timeout_floor() {
        let timing = ProbeTiming::default();
        // 0 + 30s * 3 = 90s, above the floor
        assert_eq!(layer_timeout(&timing), Duration::from_secs(90));

        let quick = ProbeTiming {
            interval: Duration::from_secs(1),
            retries: 3,
            start_period: Duration::ZERO,
            ..ProbeTiming::default()
        };
        assert_eq!(layer_timeout(&quick), MIN_LAYER_TIMEOUT);
    }

    #[test]
    fn test_registry_seeded_on_construction() {
        let (_, registry, _) = harness(
            r#"
name: demo
services:
  web: {language: node, project: ./web}
  api: {language: python, project: ./api, uses: [web]}
"#,
        );
        assert_eq!(registry.list_all().len(), 2);
        assert_eq!(registry.get("web").unwrap().status, ServiceStatus::Pending);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_single_wave_run_with_process_services() {
        let (orchestrator, registry, supervisor) = harness(
            r#"
name: demo
services:
  sleeper:
    language: process
    project: .
    command: sleep
    args: ["30"]
    mode: watch
"#,
        );

        orchestrator.run().await.unwrap();

        let record = registry.get("sleeper").unwrap();
        assert_eq!(record.status, ServiceStatus::Running);
        assert!(record.pid != 0);

        orchestrator.shutdown().await;
        assert_eq!(
            registry.get("sleeper").unwrap().status,
            ServiceStatus::Stopped
        );
        assert!(supervisor.get("sleeper").is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_build_service_gates_on_clean_exit() {
        let (orchestrator, registry, _) = harness(
            r#"
name: demo
services:
  prep:
    language: process
    project: .
    command: "true"
    mode: build
"#,
        );

        orchestrator.run().await.unwrap();
        assert_eq!(registry.get("prep").unwrap().status, ServiceStatus::Exited);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failing_build_aborts() {
        let (orchestrator, _, _) = harness(
            r#"
name: demo
services:
  prep:
    language: process
    project: .
    command: "false"
    mode: build
"#,
        );

        let err = orchestrator.run().await.unwrap_err();
        assert!(matches!(err, OrchestrateError::ServiceFailed { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_dependency_ordering() {
        // `api` must not start until `db` is ready; both are watch-mode
        // process services so readiness is liveness
        let (orchestrator, registry, _) = harness(
            r#"
name: demo
services:
  db:
    language: process
    project: .
    command: sleep
    args: ["30"]
    mode: watch
  api:
    language: process
    project: .
    command: sleep
    args: ["30"]
    mode: watch
    uses: [db]
"#,
        );

        orchestrator.run().await.unwrap();

        let db = registry.get("db").unwrap();
        let api = registry.get("api").unwrap();
        assert_eq!(db.status, ServiceStatus::Running);
        assert_eq!(api.status, ServiceStatus::Running);
        // db reached Starting before api did
        assert!(db.start_time.unwrap() <= api.start_time.unwrap());

        orchestrator.shutdown().await;
    }
}
