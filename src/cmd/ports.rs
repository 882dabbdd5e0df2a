//! Ports command: inspect and clean persisted assignments

use std::path::Path;

use anyhow::Result;
use clap::Args;
use tracing::info;

use flotilla::ports::STALE_THRESHOLD;

use super::ProjectContext;

#[derive(Args)]
pub struct PortsArgs {
    /// Evict assignments untouched for more than seven days
    #[arg(long)]
    pub clean: bool,

    /// Forget one service's persisted assignment
    #[arg(long, value_name = "SERVICE")]
    pub release: Option<String>,
}

pub async fn run(manifest_path: &Path, args: PortsArgs) -> Result<i32> {
    let ctx = ProjectContext::load(manifest_path)?;
    let manager = ctx.port_manager();

    if args.clean {
        let evicted = manager.clean_stale(STALE_THRESHOLD)?;
        info!("Evicted {} stale assignment(s)", evicted);
    }

    if let Some(service) = &args.release {
        manager.release(&ctx.manifest.root, service).await?;
        info!("Released assignment for {}", service);
    }

    let assignments = manager.assignments(&ctx.manifest.root).await?;
    if assignments.is_empty() {
        info!("No persisted port assignments for this project");
        return Ok(0);
    }

    let width = assignments
        .iter()
        .map(|a| a.service.len())
        .max()
        .unwrap_or(0)
        .max("SERVICE".len());

    println!("{:<width$}  {:<5}  LAST USED", "SERVICE", "PORT", width = width);
    let mut sorted = assignments;
    sorted.sort_by(|a, b| a.service.cmp(&b.service));
    for assignment in sorted {
        println!(
            "{:<width$}  {:<5}  {}",
            assignment.service,
            assignment.port,
            assignment.last_used.format("%Y-%m-%d %H:%M:%S"),
            width = width
        );
    }
    Ok(0)
}
