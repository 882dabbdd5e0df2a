//! Install command: dependency materialization without starting services

use std::path::Path;

use anyhow::Result;
use clap::Args;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use flotilla::install::{InstallOutcome, Installer};

use super::ProjectContext;

#[derive(Args)]
pub struct InstallArgs {}

pub async fn run(manifest_path: &Path, _args: InstallArgs) -> Result<i32> {
    let ctx = ProjectContext::load(manifest_path)?;

    let tasks = Installer::detect_tasks(&ctx.manifest);
    if tasks.is_empty() {
        info!("Nothing to install");
        return Ok(0);
    }

    let token = CancellationToken::new();
    {
        let token = token.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            token.cancel();
        });
    }

    let installer = Installer::new();
    let reports = installer.run_all(tasks, &token).await;

    let mut failures = 0;
    for report in &reports {
        match &report.result {
            Ok(InstallOutcome::Installed) => {
                info!(
                    "{} ({}): installed",
                    report.task.project_dir.display(),
                    report.task.manager
                );
            }
            Ok(InstallOutcome::Skipped(reason)) => {
                info!(
                    "{} ({}): skipped, {}",
                    report.task.project_dir.display(),
                    report.task.manager,
                    reason
                );
            }
            Err(failure) => {
                failures += 1;
                error!("{}", failure);
            }
        }
    }

    Ok(if failures > 0 { 1 } else { 0 })
}
