//! Status command: registry snapshot view

use std::path::Path;

use anyhow::Result;
use clap::Args;

use flotilla::health::output::icon;
use flotilla::registry::RegistrySnapshot;

use super::ProjectContext;

#[derive(Args)]
pub struct StatusArgs {
    /// Emit the snapshot as JSON
    #[arg(long)]
    pub json: bool,
}

pub async fn run(manifest_path: &Path, args: StatusArgs) -> Result<i32> {
    let ctx = ProjectContext::load(manifest_path)?;
    ctx.registry.reconcile();
    let snapshot = ctx.registry.snapshot();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    } else {
        print!("{}", render(&snapshot));
    }
    Ok(0)
}

fn render(snapshot: &RegistrySnapshot) -> String {
    let headers = ["SERVICE", "STATUS", "HEALTH", "PID", "PORT", "URL"];

    let rows: Vec<[String; 6]> = snapshot
        .services
        .iter()
        .map(|record| {
            [
                record.name.clone(),
                record.status.to_string(),
                format!("{} {}", icon(record.health), record.health),
                if record.pid == 0 {
                    "-".to_string()
                } else {
                    record.pid.to_string()
                },
                record
                    .port
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "-".to_string()),
                record.url.clone().unwrap_or_else(|| "-".to_string()),
            ]
        })
        .collect();

    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in &rows {
        for (i, cell) in row.iter().enumerate() {
            widths[i] = widths[i].max(cell.chars().count());
        }
    }

    let mut out = String::new();
    for (i, header) in headers.iter().enumerate() {
        out.push_str(&format!("{:<width$}  ", header, width = widths[i]));
    }
    out.push('\n');
    for row in &rows {
        for (i, cell) in row.iter().enumerate() {
            out.push_str(&format!("{:<width$}  ", cell, width = widths[i]));
        }
        out.push('\n');
    }
    out
}
