//! Requirements checking: tool discovery, version comparison, runtime probes
//!
//! The orchestrator gates startup on these checks. Manifest `reqs[]`
//! entries override the built-in registry per tool id; unknown ids must
//! bring their own command.

pub mod tools;
pub mod version;

use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::manifest::Requirement;

pub use tools::{builtin, builtin_registry, extract_version, ToolSpec, VersionRule};

/// Bound on each version / runtime probe command
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Result of checking one requirement
#[derive(Debug, Clone, Serialize)]
pub struct RequirementOutcome {
    pub id: String,
    pub satisfied: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub found_version: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub required_version: Option<String>,

    /// Runtime probe verdict, when one was configured
    #[serde(skip_serializing_if = "Option::is_none")]
    pub running: Option<bool>,

    pub message: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub install_url: Option<String>,
}

/// Resolve a manifest requirement against the built-in registry
fn resolve_spec(requirement: &Requirement) -> Option<ToolSpec> {
    let mut spec = builtin(&requirement.id).or_else(|| {
        // Unknown tools need an explicit command
        requirement.command.as_ref().map(|command| ToolSpec {
            id: requirement.id.clone(),
            command: command.clone(),
            version_args: vec!["--version".to_string()],
            rule: VersionRule::Whole,
            strip_prefix: None,
            runtime: None,
            install_url: None,
        })
    })?;

    if let Some(command) = &requirement.command {
        spec.command = command.clone();
    }
    if let Some(args) = &requirement.args {
        spec.version_args = args.clone();
    }
    if let Some(prefix) = &requirement.version_prefix {
        spec.strip_prefix = Some(prefix.clone());
    }
    if let Some(field) = requirement.version_field {
        spec.rule = VersionRule::Token(field);
    }
    if let Some(url) = &requirement.install_url {
        spec.install_url = Some(url.clone());
    }

    if requirement.check_running == Some(true) {
        if let Some(command) = &requirement.running_check_command {
            spec.runtime = Some(tools::RuntimeProbe {
                command: command.clone(),
                args: requirement.running_check_args.clone().unwrap_or_default(),
                expected_substring: requirement.running_check_expected.clone(),
                expected_exit: requirement.running_check_exit_code.unwrap_or(0),
            });
        }
        // Otherwise keep the built-in runtime probe, if any
    } else if requirement.check_running == Some(false) {
        spec.runtime = None;
    }

    Some(spec)
}

/// Check every requirement concurrently
pub async fn check_all(
    requirements: &[Requirement],
    token: &CancellationToken,
) -> Vec<RequirementOutcome> {
    let futures = requirements.iter().map(|requirement| async move {
        if token.is_cancelled() {
            return RequirementOutcome {
                id: requirement.id.clone(),
                satisfied: false,
                found_version: None,
                required_version: requirement.min_version.clone(),
                running: None,
                message: "check cancelled".to_string(),
                install_url: None,
            };
        }
        check_one(requirement).await
    });

    futures::future::join_all(futures).await
}

/// Check one requirement: tool on PATH, version extracted and compared,
/// runtime probe when configured
pub async fn check_one(requirement: &Requirement) -> RequirementOutcome {
    let mut outcome = RequirementOutcome {
        id: requirement.id.clone(),
        satisfied: false,
        found_version: None,
        required_version: requirement.min_version.clone(),
        running: None,
        message: String::new(),
        install_url: None,
    };

    let Some(spec) = resolve_spec(requirement) else {
        outcome.message = format!(
            "Unknown tool {:?}: add a `command` to the requirement",
            requirement.id
        );
        return outcome;
    };
    outcome.install_url = spec.install_url.clone();

    // Version probe
    let output = match run_probe(&spec.command, &spec.version_args).await {
        Ok(output) => output,
        Err(message) => {
            outcome.message = match &spec.install_url {
                Some(url) => format!("{} ({})", message, url),
                None => message,
            };
            return outcome;
        }
    };

    let found = extract_version(&output, &spec.rule, spec.strip_prefix.as_deref());
    let Some(found) = found else {
        outcome.message = format!("Could not read a version from {:?} output", spec.command);
        return outcome;
    };
    outcome.found_version = Some(found.clone());

    if let Some(minimum) = &requirement.min_version {
        if !version::satisfies(&found, minimum) {
            outcome.message = format!(
                "{} {} is below the required {}",
                requirement.id, found, minimum
            );
            return outcome;
        }
    }

    // Runtime probe
    if let Some(runtime) = &spec.runtime {
        let running = probe_runtime(runtime).await;
        outcome.running = Some(running);
        if !running {
            outcome.message = format!("{} is installed but not running", requirement.id);
            return outcome;
        }
    }

    outcome.satisfied = true;
    outcome.message = format!("{} {}", requirement.id, found);
    outcome
}

async fn run_probe(command: &str, args: &[String]) -> Result<String, String> {
    let result = tokio::time::timeout(
        PROBE_TIMEOUT,
        tokio::process::Command::new(command)
            .args(args)
            .stdin(std::process::Stdio::null())
            .output(),
    )
    .await;

    match result {
        Ok(Ok(output)) => {
            // Some tools print the version to stderr
            let stdout = String::from_utf8_lossy(&output.stdout);
            let text = if stdout.trim().is_empty() {
                String::from_utf8_lossy(&output.stderr).into_owned()
            } else {
                stdout.into_owned()
            };
            Ok(text)
        }
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(format!("{} is not installed", command))
        }
        Ok(Err(e)) => Err(format!("{} could not be probed: {}", command, e)),
        Err(_) => Err(format!("{} version probe timed out", command)),
    }
}

async fn probe_runtime(probe: &tools::RuntimeProbe) -> bool {
    let result = tokio::time::timeout(
        PROBE_TIMEOUT,
        tokio::process::Command::new(&probe.command)
            .args(&probe.args)
            .stdin(std::process::Stdio::null())
            .output(),
    )
    .await;

    let Ok(Ok(output)) = result else {
        return false;
    };

    if output.status.code() != Some(probe.expected_exit) {
        return false;
    }

    match &probe.expected_substring {
        Some(needle) => {
            String::from_utf8_lossy(&output.stdout).contains(needle)
                || String::from_utf8_lossy(&output.stderr).contains(needle)
        }
        None => true,
    }
}

/// Discover installed tools for `reqs --generate`.
///
/// Existing entries are preserved untouched and keep their relative order;
/// newly detected tools are added with their current version as the
/// minimum, each inserted at its alphabetical position.
pub async fn generate(existing: &[Requirement]) -> Vec<Requirement> {
    let mut merged: Vec<Requirement> = existing.to_vec();

    for spec in builtin_registry() {
        if merged.iter().any(|r| r.id == spec.id) {
            continue;
        }

        let requirement = Requirement {
            id: spec.id.clone(),
            ..Default::default()
        };
        let outcome = check_one(&requirement).await;
        let Some(found) = outcome.found_version else {
            debug!("{} not installed, not generating a requirement", spec.id);
            continue;
        };

        let new_entry = Requirement {
            id: spec.id.clone(),
            min_version: Some(found),
            ..Default::default()
        };

        // Alphabetical placement among the existing set
        let position = merged
            .iter()
            .position(|r| r.id.as_str() > new_entry.id.as_str())
            .unwrap_or(merged.len());
        merged.insert(position, new_entry);
    }

    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(id: &str) -> Requirement {
        Requirement {
            id: id.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_unknown_tool_without_command() {
        let outcome = check_one(&req("imaginary-tool")).await;
        assert!(!outcome.satisfied);
        assert!(outcome.message.contains("command"));
    }

    #[tokio::test]
    async fn test_missing_tool_reported() {
        let mut requirement = req("ghost");
        requirement.command = Some("definitely-not-installed-0xf".to_string());

        let outcome = check_one(&requirement).await;
        assert!(!outcome.satisfied);
        assert!(outcome.message.contains("not installed"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_custom_command_and_field() {
        // `sh -c 'echo tool 9.9.9'` stands in for a real tool
        let mut requirement = req("fake");
        requirement.command = Some("sh".to_string());
        requirement.args = Some(vec!["-c".into(), "echo tool 9.9.9".into()]);
        requirement.version_field = Some(1);
        requirement.min_version = Some("9.0.0".to_string());

        let outcome = check_one(&requirement).await;
        assert!(outcome.satisfied, "{}", outcome.message);
        assert_eq!(outcome.found_version.as_deref(), Some("9.9.9"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_version_below_minimum() {
        let mut requirement = req("fake");
        requirement.command = Some("sh".to_string());
        requirement.args = Some(vec!["-c".into(), "echo tool 1.0.0".into()]);
        requirement.version_field = Some(1);
        requirement.min_version = Some("2.0.0".to_string());

        let outcome = check_one(&requirement).await;
        assert!(!outcome.satisfied);
        assert!(outcome.message.contains("below"));
    }

    #[tokio::test]
    async fn test_generate_preserves_existing_entries() {
        let mut pinned = req("node");
        pinned.min_version = Some("18.0.0".to_string());
        let existing = vec![pinned.clone()];

        let merged = generate(&existing).await;

        // The pre-existing entry survives byte-for-byte
        let node = merged.iter().find(|r| r.id == "node").unwrap();
        assert_eq!(*node, pinned);

        // New entries (if any tools are installed) are alphabetically placed
        let ids: Vec<&str> = merged.iter().map(|r| r.id.as_str()).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
    }
}
