//! Lifecycle commands: run, stop, restart

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Args;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use flotilla::events::{Event, EventBus};
use flotilla::health::sse::{self, ObserverState};
use flotilla::health::{HealthMonitor, MonitorConfig};
use flotilla::orchestrator::{Orchestrator, ServiceGraph};
use flotilla::process::{signal, Supervisor};

use super::{health::build_targets, ProjectContext};

#[derive(Args)]
pub struct RunArgs {
    /// Serve the read-only health observer (SSE) on this address
    #[arg(long, value_name = "ADDR")]
    pub listen: Option<String>,

    /// Do not echo child output to the console
    #[arg(short, long)]
    pub quiet: bool,
}

#[derive(Args)]
pub struct StopArgs {
    /// Stop only this service
    pub service: Option<String>,

    /// Seconds to wait for a graceful exit before force killing
    #[arg(long, default_value_t = 30)]
    pub grace: u64,
}

#[derive(Args)]
pub struct RestartArgs {
    /// Restart only this service
    pub service: Option<String>,

    /// Do not echo child output to the console
    #[arg(short, long)]
    pub quiet: bool,
}

/// `flotilla run`: orchestrate startup, then supervise until interrupted
pub async fn run(manifest_path: &Path, args: RunArgs) -> Result<i32> {
    let ctx = ProjectContext::load(manifest_path)?;
    ctx.registry.reconcile();

    let events = EventBus::new();
    let supervisor = Arc::new(Supervisor::new(ctx.registry.clone(), events.clone()));
    let ports = ctx.port_manager();
    let token = CancellationToken::new();

    spawn_signal_handler(token.clone());
    if !args.quiet {
        spawn_console_echo(&events);
    }

    let orchestrator = Orchestrator::new(
        ctx.manifest.clone(),
        ctx.registry.clone(),
        supervisor.clone(),
        ports,
        events.clone(),
        token.clone(),
    )?;

    if let Err(e) = orchestrator.run().await {
        // A user interrupt during startup is a clean shutdown
        return Ok(if token.is_cancelled() { 0 } else { e.exit_code() });
    }

    info!("All services are up");

    // Steady-state health monitoring; strategies are selected now that the
    // services answer
    let targets = build_targets(&ctx.manifest, &ctx.registry, Some(&supervisor))?;
    let monitor = HealthMonitor::new(&ctx.manifest.name, targets, MonitorConfig::default())
        .await
        .with_registry(ctx.registry.clone())
        .with_events(events.clone());

    let (report_tx, mut report_rx) = mpsc::channel(8);
    let (watch_tx, watch_rx) = watch::channel(None);

    // Whatever happens below, a stale observer address must not linger in
    // the snapshot
    let _observer_cleanup = scopeguard::guard(ctx.registry.clone(), |registry| {
        registry.set_observer_addr(None);
    });

    if let Some(addr) = &args.listen {
        let state = ObserverState {
            report_rx: watch_rx,
            registry: ctx.registry.clone(),
            supervisor: Some(supervisor.clone()),
        };
        match sse::serve(addr, state, token.clone()).await {
            Ok(bound) => ctx.registry.set_observer_addr(Some(bound.to_string())),
            Err(e) => warn!("Could not start observer on {}: {}", addr, e),
        }
    }

    let monitor_task = {
        let token = token.clone();
        tokio::spawn(async move { monitor.run_streaming(token, report_tx).await })
    };
    let forward_task = tokio::spawn(async move {
        while let Some(report) = report_rx.recv().await {
            let _ = watch_tx.send(Some(report));
        }
    });

    // Apply on_exit policies until the user interrupts (or one says fail)
    let supervise_result = orchestrator.supervise().await;

    token.cancel();
    orchestrator.shutdown().await;
    let _ = monitor_task.await;
    let _ = forward_task.await;

    match supervise_result {
        Ok(()) => Ok(0),
        Err(e) => Ok(e.exit_code()),
    }
}

/// `flotilla stop`: signal recorded PIDs, dependents before dependencies
pub async fn stop(manifest_path: &Path, args: StopArgs) -> Result<i32> {
    let ctx = ProjectContext::load(manifest_path)?;
    ctx.registry.reconcile();

    let order = match &args.service {
        Some(service) => vec![service.clone()],
        None => ServiceGraph::build(&ctx.manifest)?.reverse_order(),
    };

    let mut failures = 0;
    for name in order {
        let Some(record) = ctx.registry.get(&name) else {
            continue;
        };
        if record.pid == 0 {
            continue;
        }

        info!("Stopping {} (pid {})", name, record.pid);
        signal::terminate_group(record.pid);

        // Poll through the graceful window, then escalate
        let attempts = (args.grace * 2).max(1) as u32;
        if !signal::wait_gone(record.pid, attempts, Duration::from_millis(500)).await {
            warn!("{} did not stop within {}s, force killing", name, args.grace);
            signal::kill_tree(record.pid).await;
        }

        if signal::wait_gone(record.pid, 4, Duration::from_millis(500)).await {
            ctx.registry.update_pid(&name, 0);
            ctx.registry.update_status(
                &name,
                flotilla::events::ServiceStatus::Stopped,
                None,
            );
            info!("{} stopped", name);
        } else {
            warn!("{} (pid {}) could not be stopped", name, record.pid);
            failures += 1;
        }
    }

    Ok(if failures > 0 { 1 } else { 0 })
}

/// `flotilla restart`: stop what is recorded, then start again. With a
/// service name only that service is bounced; its port preference is
/// persisted, so it comes back on the same number.
pub async fn restart(manifest_path: &Path, args: RestartArgs) -> Result<i32> {
    match &args.service {
        None => {
            let code = stop(
                manifest_path,
                StopArgs {
                    service: None,
                    grace: 30,
                },
            )
            .await?;
            if code != 0 {
                return Ok(code);
            }
            run(
                manifest_path,
                RunArgs {
                    listen: None,
                    quiet: args.quiet,
                },
            )
            .await
        }
        Some(service) => {
            let code = stop(
                manifest_path,
                StopArgs {
                    service: Some(service.clone()),
                    grace: 30,
                },
            )
            .await?;
            if code != 0 {
                return Ok(code);
            }

            let ctx = ProjectContext::load(manifest_path)?;
            let events = EventBus::new();
            let supervisor = Arc::new(Supervisor::new(ctx.registry.clone(), events.clone()));
            let ports = ctx.port_manager();
            let token = CancellationToken::new();
            spawn_signal_handler(token.clone());
            if !args.quiet {
                spawn_console_echo(&events);
            }

            let orchestrator = Orchestrator::new(
                ctx.manifest.clone(),
                ctx.registry.clone(),
                supervisor,
                ports,
                events,
                token.clone(),
            )?;

            match orchestrator.run_single(service).await {
                Ok(()) => {
                    info!("Service {} restarted", service);
                    Ok(0)
                }
                Err(_) if token.is_cancelled() => Ok(0),
                Err(e) => Ok(e.exit_code()),
            }
        }
    }
}

/// Cancel the root token on SIGINT/SIGTERM
fn spawn_signal_handler(token: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal as unix_signal, SignalKind};
            let mut term = match unix_signal(SignalKind::terminate()) {
                Ok(term) => term,
                Err(e) => {
                    warn!("Could not install SIGTERM handler: {}", e);
                    let _ = tokio::signal::ctrl_c().await;
                    token.cancel();
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }

        warn!("Received shutdown signal, stopping services...");
        token.cancel();
    });
}

/// Echo child output and lifecycle transitions to the console
fn spawn_console_echo(events: &EventBus) {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(Event::ConsoleOutput { service, line }) => {
                    println!("{} | {}", service, line);
                }
                Ok(Event::StatusChange { service, status }) => {
                    info!("{} is {}", service, status);
                }
                Ok(Event::HealthChange { service, health }) => {
                    info!("{} health: {}", service, health);
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    warn!("Console echo lagged, {} lines dropped", missed);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            }
        }
    });
}
