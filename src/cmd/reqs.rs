//! Reqs command: check required tools, or record detected versions

use std::path::Path;

use anyhow::{Context, Result};
use clap::Args;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use flotilla::reqs;

use super::ProjectContext;

#[derive(Args)]
pub struct ReqsArgs {
    /// Detect installed tools and write them into the manifest's reqs
    #[arg(long)]
    pub generate: bool,

    /// Emit outcomes as JSON
    #[arg(long)]
    pub json: bool,
}

pub async fn run(manifest_path: &Path, args: ReqsArgs) -> Result<i32> {
    let ctx = ProjectContext::load(manifest_path)?;

    if args.generate {
        return generate(manifest_path, &ctx).await;
    }

    if ctx.manifest.reqs.is_empty() {
        info!("Manifest declares no requirements");
        return Ok(0);
    }

    let token = CancellationToken::new();
    let outcomes = reqs::check_all(&ctx.manifest.reqs, &token).await;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&outcomes)?);
    } else {
        for outcome in &outcomes {
            if outcome.satisfied {
                info!("ok {}", outcome.message);
            } else {
                match &outcome.install_url {
                    Some(url) => error!("{} ({})", outcome.message, url),
                    None => error!("{}", outcome.message),
                }
            }
        }
    }

    let unsatisfied = outcomes.iter().filter(|o| !o.satisfied).count();
    Ok(if unsatisfied > 0 { 1 } else { 0 })
}

/// Detect installed tools and merge them into the manifest, preserving
/// pre-existing entries and inserting new ones alphabetically
async fn generate(manifest_path: &Path, ctx: &ProjectContext) -> Result<i32> {
    let merged = reqs::generate(&ctx.manifest.reqs).await;
    let added: Vec<&str> = merged
        .iter()
        .filter(|req| !ctx.manifest.reqs.iter().any(|existing| existing.id == req.id))
        .map(|req| req.id.as_str())
        .collect();

    if added.is_empty() {
        info!("No new tools detected; manifest unchanged");
        return Ok(0);
    }

    // Rewrite only the reqs key so the rest of the document's data is
    // untouched
    let content = std::fs::read_to_string(manifest_path)
        .with_context(|| format!("Reading {}", manifest_path.display()))?;
    let mut document: serde_yaml::Value = serde_yaml::from_str(&content)?;

    let mapping = document
        .as_mapping_mut()
        .context("Manifest root is not a mapping")?;
    mapping.insert(
        serde_yaml::Value::String("reqs".to_string()),
        serde_yaml::to_value(&merged)?,
    );

    std::fs::write(manifest_path, serde_yaml::to_string(&document)?)
        .with_context(|| format!("Writing {}", manifest_path.display()))?;

    info!("Added {} requirement(s): {}", added.len(), added.join(", "));
    Ok(0)
}
