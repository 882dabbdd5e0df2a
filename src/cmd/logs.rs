//! Logs command: tail captured output through the running observer
//!
//! Child output lives in the supervisor's in-memory rings; a separate CLI
//! process reaches it through the observer HTTP endpoint recorded in the
//! registry snapshot by `run --listen`.

use std::path::Path;

use anyhow::Result;
use clap::Args;
use tracing::error;

use super::ProjectContext;

#[derive(Args)]
pub struct LogsArgs {
    /// Service whose output to tail
    pub service: String,

    /// Number of lines
    #[arg(short = 'n', long, default_value_t = 100)]
    pub lines: usize,
}

pub async fn run(manifest_path: &Path, args: LogsArgs) -> Result<i32> {
    let ctx = ProjectContext::load(manifest_path)?;
    let snapshot = ctx.registry.snapshot();

    let Some(addr) = snapshot.observer_addr else {
        error!(
            "No observer is running; start the project with `flotilla run --listen 127.0.0.1:0` to enable log tailing"
        );
        return Ok(1);
    };

    let url = format!("http://{}/logs/{}?n={}", addr, args.service, args.lines);
    let response = reqwest::get(&url).await?;

    if !response.status().is_success() {
        error!("{}: {}", args.service, response.text().await.unwrap_or_default());
        return Ok(1);
    }

    let lines: Vec<String> = response.json().await?;
    for line in lines {
        println!("{}", line);
    }
    Ok(0)
}
