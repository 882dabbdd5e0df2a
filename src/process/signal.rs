//! Platform process helpers: liveness checks, names, and tree kills
//!
//! Unix uses signal-0 for liveness and SIGTERM/SIGKILL for termination;
//! child enumeration prefers `pgrep -P` with a sysinfo fallback. Windows
//! goes through `taskkill /T` and the sysinfo process table.

use std::time::Duration;

use tracing::{debug, warn};

/// Check whether a PID refers to a live process
#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    if pid == 0 {
        return false;
    }
    // Signal 0: existence check without delivering anything
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

#[cfg(not(unix))]
pub fn pid_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    refreshed_system(pid).process(sysinfo::Pid::from_u32(pid)).is_some()
}

/// Name of the process behind a PID, when it can be inspected
pub fn process_name(pid: u32) -> Option<String> {
    let sys = refreshed_system(pid);
    sys.process(sysinfo::Pid::from_u32(pid))
        .map(|p| p.name().to_string_lossy().to_string())
}

fn refreshed_system(pid: u32) -> sysinfo::System {
    use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System};

    let mut sys = System::new();
    sys.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[sysinfo::Pid::from_u32(pid)]),
        true,
        ProcessRefreshKind::new(),
    );
    sys
}

/// Direct children of a PID
pub async fn child_pids(pid: u32) -> Vec<u32> {
    #[cfg(unix)]
    {
        if let Some(children) = pgrep_children(pid).await {
            return children;
        }
    }
    sysinfo_children(pid)
}

#[cfg(unix)]
async fn pgrep_children(pid: u32) -> Option<Vec<u32>> {
    let output = tokio::time::timeout(
        Duration::from_secs(2),
        tokio::process::Command::new("pgrep")
            .arg("-P")
            .arg(pid.to_string())
            .stdin(std::process::Stdio::null())
            .output(),
    )
    .await
    .ok()?
    .ok()?;

    // pgrep exits 1 with no output when there are no children
    if !output.status.success() && !output.stdout.is_empty() {
        return None;
    }

    Some(
        String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter_map(|line| line.trim().parse().ok())
            .collect(),
    )
}

fn sysinfo_children(pid: u32) -> Vec<u32> {
    use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System};

    let mut sys = System::new();
    sys.refresh_processes_specifics(
        ProcessesToUpdate::All,
        true,
        ProcessRefreshKind::new(),
    );

    let parent = sysinfo::Pid::from_u32(pid);
    sys.processes()
        .iter()
        .filter(|(_, p)| p.parent() == Some(parent))
        .map(|(child, _)| child.as_u32())
        .collect()
}

/// Every descendant of a PID, leaves last (BFS order)
pub async fn descendants(pid: u32) -> Vec<u32> {
    let mut all = Vec::new();
    let mut frontier = vec![pid];

    while let Some(current) = frontier.pop() {
        for child in child_pids(current).await {
            // A PID loop would mean the process table lied; guard anyway
            if child != pid && !all.contains(&child) {
                all.push(child);
                frontier.push(child);
            }
        }
    }

    all
}

/// Send SIGTERM to a single process
#[cfg(unix)]
pub fn terminate(pid: u32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        debug!("SIGTERM to {} failed: {}", pid, e);
    }
}

/// Send SIGKILL to a single process
#[cfg(unix)]
pub fn force_kill(pid: u32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        debug!("SIGKILL to {} failed: {}", pid, e);
    }
}

/// Send SIGTERM to a whole process group
#[cfg(unix)]
pub fn terminate_group(pid: u32) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::{getpgid, Pid};

    match getpgid(Some(Pid::from_raw(pid as i32))) {
        Ok(pgid) => {
            if let Err(e) = killpg(pgid, Signal::SIGTERM) {
                debug!("SIGTERM to group {} failed: {}", pgid, e);
            }
        }
        Err(e) => {
            debug!("No process group for {}: {}; signaling directly", pid, e);
            terminate(pid);
        }
    }
}

#[cfg(windows)]
pub fn terminate(pid: u32) {
    // taskkill without /F asks politely
    let _ = std::process::Command::new("taskkill")
        .args(["/PID".to_string(), pid.to_string(), "/T".to_string()])
        .output();
}

#[cfg(windows)]
pub fn force_kill(pid: u32) {
    let _ = std::process::Command::new("taskkill")
        .args(["/PID".to_string(), pid.to_string(), "/T".to_string(), "/F".to_string()])
        .output();
}

#[cfg(windows)]
pub fn terminate_group(pid: u32) {
    terminate(pid);
}

/// Tree-kill: SIGTERM then SIGKILL every descendant (leaves first), then
/// the root. Used for foreign port holders and for stop escalation.
pub async fn kill_tree(root: u32) {
    let mut targets = descendants(root).await;
    // Leaves first, then the root
    targets.reverse();
    targets.push(root);

    for pid in &targets {
        terminate(*pid);
    }
    tokio::time::sleep(Duration::from_millis(250)).await;

    for pid in &targets {
        if pid_alive(*pid) {
            debug!("Pid {} survived SIGTERM, sending SIGKILL", pid);
            force_kill(*pid);
        }
    }
}

/// Wait for a PID to disappear, polling `attempts` times with `delay`
/// between polls. Returns true once the process is gone.
pub async fn wait_gone(pid: u32, attempts: u32, delay: Duration) -> bool {
    for _ in 0..attempts {
        if !pid_alive(pid) {
            return true;
        }
        tokio::time::sleep(delay).await;
    }

    let gone = !pid_alive(pid);
    if !gone {
        warn!("Pid {} still alive after {} verification attempts", pid, attempts);
    }
    gone
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pid_zero_is_never_alive() {
        assert!(!pid_alive(0));
    }

    #[test]
    fn test_own_pid_is_alive() {
        assert!(pid_alive(std::process::id()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_kill_tree_terminates_child() {
        let child = tokio::process::Command::new("sleep")
            .arg("60")
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();

        assert!(pid_alive(pid));
        kill_tree(pid).await;
        assert!(wait_gone(pid, 4, Duration::from_millis(100)).await);
    }

    #[tokio::test]
    async fn test_wait_gone_on_dead_pid() {
        // Spawn-and-reap to get a PID that is certainly gone
        let mut child = tokio::process::Command::new("true").spawn().unwrap();
        let pid = child.id().unwrap();
        let _ = child.wait().await;

        assert!(wait_gone(pid, 1, Duration::from_millis(10)).await);
    }
}
