//! Shared package-manager command execution
//!
//! All managers run non-interactively with stdin detached: a child that
//! would prompt must hang-fail inside its own timeout rather than block
//! the supervisor. On Windows the Node managers are `.cmd` shims and must
//! be resolved through `cmd.exe /c`.

use std::path::Path;
use std::process::Stdio;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::failure::{classify, InstallFailure};

/// Captured result of one manager invocation
#[derive(Debug)]
pub struct RunOutput {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// Run a package manager to completion (or cancellation).
///
/// Spawn failures (the manager binary itself is missing) are classified
/// immediately; a cancelled run kills the child and reports that outcome.
pub async fn run_manager(
    program: &str,
    args: &[&str],
    cwd: &Path,
    token: &CancellationToken,
) -> Result<RunOutput, InstallFailure> {
    let command_line = format!("{} {}", program, args.join(" "));
    debug!("Running {:?} in {}", command_line, cwd.display());

    let mut cmd = build_command(program, args);
    cmd.current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = cmd.spawn().map_err(|e| {
        let stderr = if e.kind() == std::io::ErrorKind::NotFound {
            format!("{}: command not found", program)
        } else {
            e.to_string()
        };
        classify(program, &command_line, cwd, None, &stderr)
    })?;

    let output = tokio::select! {
        output = child.wait_with_output() => output,
        _ = token.cancelled() => {
            // kill_on_drop reaps the child as the future is dropped
            return Err(InstallFailure::synthetic(
                program,
                cwd,
                "install cancelled",
            ));
        }
    };

    let output = output.map_err(|e| classify(program, &command_line, cwd, None, &e.to_string()))?;

    Ok(RunOutput {
        success: output.status.success(),
        exit_code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

#[cfg(windows)]
fn build_command(program: &str, args: &[&str]) -> tokio::process::Command {
    const SHIMS: &[&str] = &["npm", "pnpm", "yarn", "npx", "corepack"];
    if SHIMS.contains(&program) {
        let mut cmd = tokio::process::Command::new("cmd.exe");
        cmd.arg("/c").arg(program).args(args);
        cmd
    } else {
        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args);
        cmd
    }
}

#[cfg(not(windows))]
fn build_command(program: &str, args: &[&str]) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new(program);
    cmd.args(args);
    cmd
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_manager_classified() {
        let dir = tempfile::tempdir().unwrap();
        let token = CancellationToken::new();

        let err = run_manager("no-such-manager-0xf", &["install"], dir.path(), &token)
            .await
            .unwrap_err();
        assert!(err.stderr_excerpt[0].contains("command not found"));
        assert!(err.suggestion.is_some());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_successful_run() {
        let dir = tempfile::tempdir().unwrap();
        let token = CancellationToken::new();

        let output = run_manager("true", &[], dir.path(), &token).await.unwrap();
        assert!(output.success);
        assert_eq!(output.exit_code, Some(0));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_run_captures_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let token = CancellationToken::new();

        let output = run_manager(
            "sh",
            &["-c", "echo 'error: broken' >&2; exit 3"],
            dir.path(),
            &token,
        )
        .await
        .unwrap();
        assert!(!output.success);
        assert_eq!(output.exit_code, Some(3));
        assert!(output.stderr.contains("error: broken"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancellation_reports_outcome() {
        let dir = tempfile::tempdir().unwrap();
        let token = CancellationToken::new();

        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            cancel.cancel();
        });

        let err = run_manager("sleep", &["30"], dir.path(), &token)
            .await
            .unwrap_err();
        assert!(err.stderr_excerpt[0].contains("cancelled"));
    }
}
