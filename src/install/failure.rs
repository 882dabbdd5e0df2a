//! Structured install failure classification
//!
//! Every failed install produces one structured message: the manager, the
//! exit code with known interpretations, the salient stderr lines, a
//! remediation suggestion when one is known, the working directory and the
//! command as executed.

use std::path::{Path, PathBuf};

use regex::Regex;

/// Cap on extracted stderr lines
const MAX_SALIENT_LINES: usize = 3;

/// Cap on total extracted stderr characters
const MAX_SALIENT_CHARS: usize = 500;

/// A classified dependency-install failure
#[derive(Debug, Clone)]
pub struct InstallFailure {
    pub manager: String,
    pub exit_code: Option<i32>,
    pub stderr_excerpt: Vec<String>,
    pub suggestion: Option<String>,
    pub cwd: PathBuf,
    pub command: String,
}

impl std::fmt::Display for InstallFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} failed{} in {}",
            self.manager,
            match self.exit_code {
                Some(code) => format!(" (exit {}{})", code, interpret_exit(code)),
                None => " (killed)".to_string(),
            },
            self.cwd.display(),
        )?;

        if !self.stderr_excerpt.is_empty() {
            write!(f, ": {}", self.stderr_excerpt.join(" | "))?;
        }
        if let Some(suggestion) = &self.suggestion {
            write!(f, ". {}", suggestion)?;
        }
        Ok(())
    }
}

impl std::error::Error for InstallFailure {}

impl InstallFailure {
    /// A failure that never ran a command (cancellation, missing files)
    pub fn synthetic(manager: &str, cwd: &Path, message: &str) -> Self {
        Self {
            manager: manager.to_string(),
            exit_code: None,
            stderr_excerpt: vec![message.to_string()],
            suggestion: None,
            cwd: cwd.to_path_buf(),
            command: String::new(),
        }
    }
}

fn interpret_exit(code: i32) -> &'static str {
    match code {
        127 => ": command not found",
        254 => ": command not found via shell",
        1 => "",
        _ => "",
    }
}

/// Build the structured failure from a finished command
pub fn classify(
    manager: &str,
    command: &str,
    cwd: &Path,
    exit_code: Option<i32>,
    stderr: &str,
) -> InstallFailure {
    InstallFailure {
        manager: manager.to_string(),
        exit_code,
        stderr_excerpt: extract_salient_lines(stderr),
        suggestion: suggest(manager, exit_code, stderr),
        cwd: cwd.to_path_buf(),
        command: command.to_string(),
    }
}

/// Lines worth showing the user, capped in count and total size
fn extract_salient_lines(stderr: &str) -> Vec<String> {
    let pattern =
        Regex::new(r"(?i)error|failed|enoent|permission denied|cannot find|command not found")
            .expect("static regex");

    let mut lines = Vec::new();
    let mut total = 0usize;

    for line in stderr.lines() {
        let line = line.trim();
        if line.is_empty() || !pattern.is_match(line) {
            continue;
        }

        let remaining = MAX_SALIENT_CHARS.saturating_sub(total);
        if remaining == 0 || lines.len() == MAX_SALIENT_LINES {
            break;
        }

        let clipped: String = line.chars().take(remaining).collect();
        total += clipped.chars().count();
        lines.push(clipped);
    }

    lines
}

/// Heuristic remediation hint
fn suggest(manager: &str, exit_code: Option<i32>, stderr: &str) -> Option<String> {
    let stderr_lower = stderr.to_ascii_lowercase();

    if exit_code == Some(127) || exit_code == Some(254) || stderr_lower.contains("command not found")
    {
        return Some(match manager {
            "npm" | "yarn" | "pnpm" => {
                format!("Install Node.js (which provides {}) from https://nodejs.org", manager)
            }
            "pip" | "uv" | "poetry" | "python" => {
                format!("Install {} and make sure it is on PATH", manager)
            }
            "dotnet" => "Install the .NET SDK from https://dotnet.microsoft.com".to_string(),
            other => format!("Install {} and make sure it is on PATH", other),
        });
    }

    if stderr_lower.contains("permission denied") || stderr_lower.contains("eacces") {
        return Some("Check file ownership of the project directory and the package cache".into());
    }

    if stderr_lower.contains("enospc") || stderr_lower.contains("no space left") {
        return Some("Free up disk space and retry".into());
    }

    if stderr_lower.contains("etimedout")
        || stderr_lower.contains("enotfound")
        || stderr_lower.contains("econnrefused")
        || stderr_lower.contains("network")
    {
        return Some("Check network connectivity (proxy settings, registry reachability)".into());
    }

    if stderr_lower.contains("ebusy")
        || stderr_lower.contains("enotempty")
        || stderr_lower.contains("lockfile")
    {
        return Some("Another install may be holding a lock; wait for it or remove stale lock files".into());
    }

    None
}

/// Whether stderr indicates a transient filesystem-lock error worth
/// retrying (Node managers only)
pub fn is_lock_error(stderr: &str) -> bool {
    let stderr = stderr.to_ascii_uppercase();
    if stderr.contains("EBUSY") || stderr.contains("ENOTEMPTY") {
        return true;
    }
    cfg!(windows) && stderr.contains("EPERM")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_salient_extraction_caps_lines() {
        let stderr = "npm ERR! error one\nnoise\nnpm ERR! error two\nnpm ERR! error three\nnpm ERR! error four\n";
        let lines = extract_salient_lines(stderr);
        assert_eq!(lines.len(), 3);
        assert!(lines[0].contains("error one"));
    }

    #[test]
    fn test_salient_extraction_caps_chars() {
        let long = format!("error {}\n", "x".repeat(600));
        let lines = extract_salient_lines(&long);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].chars().count(), 500);
    }

    #[test]
    fn test_not_found_suggestion() {
        let failure = classify("pnpm", "pnpm install", Path::new("/tmp"), Some(127), "");
        assert!(failure.suggestion.unwrap().contains("nodejs.org"));
    }

    #[test]
    fn test_network_suggestion() {
        let failure = classify(
            "npm",
            "npm install",
            Path::new("/tmp"),
            Some(1),
            "npm ERR! network ETIMEDOUT registry.npmjs.org",
        );
        assert!(failure.suggestion.unwrap().contains("network"));
    }

    #[test]
    fn test_lock_error_detection() {
        assert!(is_lock_error("npm ERR! EBUSY: resource busy or locked"));
        assert!(is_lock_error("ENOTEMPTY: directory not empty"));
        assert!(!is_lock_error("E404 not found"));
    }

    #[test]
    fn test_display_includes_exit_interpretation() {
        let failure = classify("yarn", "yarn install", Path::new("/x"), Some(127), "");
        let text = failure.to_string();
        assert!(text.contains("exit 127"));
        assert!(text.contains("command not found"));
    }
}
