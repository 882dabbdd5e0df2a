//! Node dependency installs: npm, pnpm and yarn
//!
//! The manager is detected from lock files. Installs are skipped when the
//! manager's internal manifest inside `node_modules` is at least as new as
//! the top-level lock file. Filesystem-lock errors retry with exponential
//! backoff; everything else fails immediately.

use std::path::Path;
use std::time::{Duration, SystemTime};

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::failure::{classify, is_lock_error, InstallFailure};
use super::runner::run_manager;
use super::InstallOutcome;

/// Retries allowed on filesystem-lock errors (delays 1s, 2s, 4s)
const MAX_LOCK_RETRIES: u32 = 3;

/// The three supported Node package managers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeManager {
    Npm,
    Pnpm,
    Yarn,
}

impl NodeManager {
    pub fn command(&self) -> &'static str {
        match self {
            NodeManager::Npm => "npm",
            NodeManager::Pnpm => "pnpm",
            NodeManager::Yarn => "yarn",
        }
    }

    /// Top-level lock file
    pub fn lockfile(&self) -> &'static str {
        match self {
            NodeManager::Npm => "package-lock.json",
            NodeManager::Pnpm => "pnpm-lock.yaml",
            NodeManager::Yarn => "yarn.lock",
        }
    }

    /// Manifest the manager writes inside node_modules, if it has one
    fn internal_manifest(&self) -> Option<&'static str> {
        match self {
            NodeManager::Npm => Some("node_modules/.package-lock.json"),
            NodeManager::Pnpm => Some("node_modules/.pnpm"),
            NodeManager::Yarn => None,
        }
    }

    /// Non-interactive install argv
    fn install_args(&self) -> Vec<&'static str> {
        match self {
            NodeManager::Npm => vec![
                "install",
                "--no-audit",
                "--no-fund",
                "--prefer-offline",
                "--no-progress",
            ],
            NodeManager::Pnpm => vec!["install", "--prefer-offline", "--reporter=silent"],
            NodeManager::Yarn => vec!["install", "--non-interactive", "--no-progress"],
        }
    }
}

impl std::fmt::Display for NodeManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.command())
    }
}

/// Detect the manager from lock files; npm is the default for a bare
/// `package.json`
pub fn detect_manager(project_dir: &Path) -> NodeManager {
    if project_dir.join("pnpm-lock.yaml").exists() {
        NodeManager::Pnpm
    } else if project_dir.join("yarn.lock").exists() {
        NodeManager::Yarn
    } else {
        NodeManager::Npm
    }
}

/// Incremental skip decision.
///
/// npm and pnpm write an internal manifest under `node_modules` whose
/// mod-time is compared against the top-level lock file; up-to-date means
/// skip. yarn has no such file, so presence of `node_modules` plus the lock
/// file is the key.
pub fn is_up_to_date(project_dir: &Path, manager: NodeManager) -> bool {
    if !project_dir.join("node_modules").exists() {
        return false;
    }

    let Some(internal) = manager.internal_manifest() else {
        // yarn: node_modules exists and the lockfile is present
        return project_dir.join(manager.lockfile()).exists();
    };

    let internal_mtime = mtime(&project_dir.join(internal));
    let lockfile_mtime = mtime(&project_dir.join(manager.lockfile()));

    match (internal_mtime, lockfile_mtime) {
        (Some(internal), Some(lock)) => internal >= lock,
        // No lock file: nothing to compare against, run the manager
        _ => false,
    }
}

fn mtime(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Delay sequence between lock-error retries: 1s, 2s, 4s
fn lock_retry_delays() -> ExponentialBackoff {
    ExponentialBackoff {
        initial_interval: Duration::from_secs(1),
        multiplier: 2.0,
        randomization_factor: 0.0,
        max_interval: Duration::from_secs(4),
        // The attempt counter decides when to give up, not elapsed time
        max_elapsed_time: None,
        ..Default::default()
    }
}

/// Install dependencies for one Node project
pub async fn install(
    project_dir: &Path,
    manager: NodeManager,
    token: &CancellationToken,
) -> Result<InstallOutcome, InstallFailure> {
    if is_up_to_date(project_dir, manager) {
        debug!("{}: node_modules up to date, skipping", project_dir.display());
        return Ok(InstallOutcome::Skipped("node_modules up to date".into()));
    }

    let args = manager.install_args();
    let command_line = format!("{} {}", manager.command(), args.join(" "));

    // Only filesystem-lock errors retry, and only MAX_LOCK_RETRIES times
    let mut delays = lock_retry_delays();
    let mut retries = 0u32;

    loop {
        let output = run_manager(manager.command(), &args, project_dir, token).await?;

        if output.success {
            info!("{}: {} install complete", project_dir.display(), manager);
            return Ok(InstallOutcome::Installed);
        }

        let failure = classify(
            manager.command(),
            &command_line,
            project_dir,
            output.exit_code,
            &output.stderr,
        );

        if !is_lock_error(&output.stderr) || retries >= MAX_LOCK_RETRIES {
            return Err(failure);
        }

        retries += 1;
        let delay = delays
            .next_backoff()
            .unwrap_or_else(|| Duration::from_secs(4));
        warn!(
            "{} hit a filesystem lock in {}, retry {}/{} in {:?}",
            manager,
            project_dir.display(),
            retries,
            MAX_LOCK_RETRIES,
            delay
        );
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use filetime_shim::set_mtime;

    /// Minimal mtime setter: rewrite the file to bump, or use explicit
    /// times through the filesystem API
    mod filetime_shim {
        use std::fs;
        use std::path::Path;
        use std::time::{Duration, SystemTime};

        pub fn set_mtime(path: &Path, when: SystemTime) {
            let file = fs::File::options().write(true).open(path).unwrap();
            file.set_modified(when).unwrap();
        }

        pub fn seconds_ago(secs: u64) -> SystemTime {
            SystemTime::now() - Duration::from_secs(secs)
        }
    }

    #[test]
    fn test_detect_manager_from_lockfiles() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(detect_manager(dir.path()), NodeManager::Npm);

        std::fs::write(dir.path().join("yarn.lock"), "").unwrap();
        assert_eq!(detect_manager(dir.path()), NodeManager::Yarn);

        // pnpm wins over yarn when both exist
        std::fs::write(dir.path().join("pnpm-lock.yaml"), "").unwrap();
        assert_eq!(detect_manager(dir.path()), NodeManager::Pnpm);
    }

    #[test]
    fn test_missing_node_modules_is_not_up_to_date() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("package-lock.json"), "{}").unwrap();
        assert!(!is_up_to_date(dir.path(), NodeManager::Npm));
    }

    #[test]
    fn test_fresh_internal_manifest_skips() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("node_modules")).unwrap();

        std::fs::write(dir.path().join("package-lock.json"), "{}").unwrap();
        std::fs::write(dir.path().join("node_modules/.package-lock.json"), "{}").unwrap();

        // Internal newer than (or equal to) top-level: skip
        set_mtime(
            &dir.path().join("package-lock.json"),
            filetime_shim::seconds_ago(100),
        );
        assert!(is_up_to_date(dir.path(), NodeManager::Npm));

        // Top-level strictly newer: run the manager
        set_mtime(
            &dir.path().join("node_modules/.package-lock.json"),
            filetime_shim::seconds_ago(200),
        );
        assert!(!is_up_to_date(dir.path(), NodeManager::Npm));
    }

    #[test]
    fn test_lock_retry_delays_are_1_2_4() {
        let mut delays = lock_retry_delays();
        let sequence: Vec<Duration> = (0..MAX_LOCK_RETRIES)
            .map(|_| delays.next_backoff().unwrap())
            .collect();
        assert_eq!(
            sequence,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
            ]
        );
    }

    #[test]
    fn test_yarn_skip_keyed_on_lockfile_presence() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("node_modules")).unwrap();
        assert!(!is_up_to_date(dir.path(), NodeManager::Yarn));

        std::fs::write(dir.path().join("yarn.lock"), "").unwrap();
        assert!(is_up_to_date(dir.path(), NodeManager::Yarn));
    }
}
