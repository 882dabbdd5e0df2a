//! Health command: one-shot and streaming probing

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Args, ValueEnum};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use flotilla::events::HealthState;
use flotilla::health::prober::ProbeTarget;
use flotilla::health::sse::{self, ObserverState};
use flotilla::health::{output, HealthMonitor, HealthReport, MonitorConfig};
use flotilla::manifest::Manifest;
use flotilla::process::Supervisor;
use flotilla::registry::Registry;

use super::ProjectContext;

#[derive(Args)]
pub struct HealthArgs {
    /// Repeat probing until interrupted
    #[arg(long)]
    pub stream: bool,

    /// Output format
    #[arg(long, value_enum, default_value_t = Format::Text)]
    pub format: Format,

    /// Seconds between streaming cycles
    #[arg(long, default_value_t = 5)]
    pub interval: u64,

    /// Serve the stream as SSE on this address (implies --stream)
    #[arg(long, value_name = "ADDR")]
    pub listen: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Format {
    Text,
    Table,
    Json,
    Ndjson,
}

/// Build probe targets for every declared service from the registry's
/// view of the world. A supervisor handle adds captured-output sinks for
/// output-pattern checks.
pub fn build_targets(
    manifest: &Manifest,
    registry: &Arc<Registry>,
    supervisor: Option<&Arc<Supervisor>>,
) -> Result<Vec<ProbeTarget>> {
    let mut targets = Vec::with_capacity(manifest.services.len());

    for (name, spec) in &manifest.services {
        let record = registry.get(name);
        let declared = spec.resolved_healthcheck(name)?;
        // A pinned manifest port still works when nothing has run yet
        let pinned = spec.port_specs(name)?.first().and_then(|p| p.fixed());

        targets.push(ProbeTarget {
            service: name.clone(),
            pid: record.as_ref().map(|r| r.pid).filter(|pid| *pid != 0),
            port: record.as_ref().and_then(|r| r.port).or(pinned),
            service_type: spec.effective_type(),
            declared,
            sink: supervisor
                .and_then(|s| s.get(name))
                .map(|handle| handle.sink()),
        });
    }

    Ok(targets)
}

pub async fn run(manifest_path: &Path, args: HealthArgs) -> Result<i32> {
    let ctx = ProjectContext::load(manifest_path)?;
    ctx.registry.reconcile();

    let targets = build_targets(&ctx.manifest, &ctx.registry, None)?;
    let config = MonitorConfig {
        interval: Duration::from_secs(args.interval.max(1)),
        ..MonitorConfig::default()
    };

    let monitor = HealthMonitor::new(&ctx.manifest.name, targets, config)
        .await
        .with_registry(ctx.registry.clone());

    if !args.stream && args.listen.is_none() {
        let report = monitor.run_static().await;
        print_report(args.format, &report);
        return Ok(exit_code_for(&report));
    }

    stream(ctx, monitor, args).await
}

async fn stream(ctx: ProjectContext, monitor: HealthMonitor, args: HealthArgs) -> Result<i32> {
    let token = CancellationToken::new();

    {
        let token = token.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            token.cancel();
        });
    }

    let (report_tx, mut report_rx) = mpsc::channel::<HealthReport>(8);

    let _observer_cleanup = scopeguard::guard(ctx.registry.clone(), |registry| {
        registry.set_observer_addr(None);
    });

    // Optional SSE observers ride along on the same stream
    let mut watch_tx = None;
    if let Some(addr) = &args.listen {
        let (tx, rx) = watch::channel(None);
        let state = ObserverState {
            report_rx: rx,
            registry: ctx.registry.clone(),
            supervisor: None,
        };
        match sse::serve(addr, state, token.clone()).await {
            Ok(bound) => {
                ctx.registry.set_observer_addr(Some(bound.to_string()));
                watch_tx = Some(tx);
            }
            Err(e) => warn!("Could not start observer on {}: {}", addr, e),
        }
    }

    let monitor_task = {
        let token = token.clone();
        tokio::spawn(async move { monitor.run_streaming(token, report_tx).await })
    };

    let mut last_report: Option<HealthReport> = None;
    while let Some(report) = report_rx.recv().await {
        print_report(args.format, &report);
        if let Some(tx) = &watch_tx {
            let _ = tx.send(Some(report.clone()));
        }
        last_report = Some(report);
    }

    let _ = monitor_task.await;

    // User interrupt: clean exit when the fleet was healthy at last
    // reading, 1 when it was not, 130 when no cycle ever completed
    Ok(match &last_report {
        Some(report) if report.summary.overall == HealthState::Healthy => 0,
        Some(report) => exit_code_for(report),
        None => 130,
    })
}

fn print_report(format: Format, report: &HealthReport) {
    match format {
        Format::Text => print!("{}", output::render_text(report)),
        Format::Table => print!("{}", output::render_table(report)),
        Format::Json => match output::render_json(report) {
            Ok(json) => println!("{}", json),
            Err(e) => warn!("Could not render report: {}", e),
        },
        Format::Ndjson => match output::render_ndjson_line(report) {
            Ok(line) => print!("{}", line),
            Err(e) => warn!("Could not render report: {}", e),
        },
    }
}

fn exit_code_for(report: &HealthReport) -> i32 {
    if report.summary.unhealthy > 0 {
        1
    } else {
        0
    }
}
