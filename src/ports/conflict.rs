//! Port conflict identification and resolution
//!
//! When a pinned port is already bound by a foreign process, the holder is
//! identified by PID (`ss -tlnp`, falling back to `lsof`; `netstat -ano` on
//! Windows) and may be tree-killed on the user's say-so. Some OS releases
//! lag between process death and the socket being reusable, so reclamation
//! is verified with bounded retries.

use std::io::Write;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::reservation::is_available;
use super::PortError;
use crate::process::signal;

/// Attempts made while waiting for a killed holder's port to come free
const RECLAIM_ATTEMPTS: u32 = 4;

/// Delay between reclamation attempts
const RECLAIM_DELAY: Duration = Duration::from_millis(500);

/// The foreign process found holding a port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortHolder {
    pub pid: u32,
    pub name: String,
}

/// A conflict presented to the user for resolution
#[derive(Debug, Clone)]
pub struct PortConflict {
    pub port: u16,
    pub service: String,
    pub holder: Option<PortHolder>,
}

/// The user's answer to a conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Kill the holder and take the port
    Kill,

    /// Kill the holder and remember the choice for future conflicts
    AlwaysKill,

    /// Pick another port; the caller rewrites the manifest
    Reassign,

    /// Abort the operation
    Cancel,
}

/// Seam for answering conflicts: interactive stdin in production, a stub in
/// tests. Callers must not hold the port manager lock while asking.
pub trait ConflictPrompt: Send + Sync {
    fn ask(&self, conflict: &PortConflict) -> Resolution;
}

/// Interactive prompt on stdin/stderr
pub struct StdinPrompt;

impl ConflictPrompt for StdinPrompt {
    fn ask(&self, conflict: &PortConflict) -> Resolution {
        let holder = conflict
            .holder
            .as_ref()
            .map(|h| format!("{} (pid {})", h.name, h.pid))
            .unwrap_or_else(|| "an unknown process".to_string());

        eprintln!(
            "Port {} needed by service {:?} is in use by {}.",
            conflict.port, conflict.service, holder
        );
        eprintln!("  [k] kill it    [a] always kill    [r] reassign port    [c] cancel");

        loop {
            eprint!("> ");
            let _ = std::io::stderr().flush();

            let mut line = String::new();
            if std::io::stdin().read_line(&mut line).is_err() {
                return Resolution::Cancel;
            }

            match line.trim().to_lowercase().as_str() {
                "k" | "kill" => return Resolution::Kill,
                "a" | "always" => return Resolution::AlwaysKill,
                "r" | "reassign" => return Resolution::Reassign,
                "c" | "cancel" | "" => return Resolution::Cancel,
                other => eprintln!("Unrecognized answer {:?}", other),
            }
        }
    }
}

/// Fixed answer, for non-interactive callers and tests
pub struct FixedPrompt(pub Resolution);

impl ConflictPrompt for FixedPrompt {
    fn ask(&self, _conflict: &PortConflict) -> Resolution {
        self.0
    }
}

/// Identify the process listening on `port`, if any can be named
pub async fn identify_holder(port: u16) -> Option<PortHolder> {
    let pid = find_listener_pid(port).await?;
    let name = signal::process_name(pid).unwrap_or_else(|| "unknown".to_string());
    Some(PortHolder { pid, name })
}

#[cfg(unix)]
async fn find_listener_pid(port: u16) -> Option<u32> {
    // `ss` first: fast and universally present on modern Linux
    if let Some(pid) = ss_listener_pid(port).await {
        return Some(pid);
    }
    // `lsof` fallback covers macOS and older systems
    lsof_listener_pid(port).await
}

#[cfg(unix)]
async fn ss_listener_pid(port: u16) -> Option<u32> {
    let filter = format!("sport = :{}", port);
    let output = run_with_timeout(
        tokio::process::Command::new("ss").args(["-tlnp", filter.as_str()]),
    )
    .await?;

    // Lines look like:
    //   LISTEN 0 128 127.0.0.1:3000 0.0.0.0:* users:(("python3",pid=12345,fd=3))
    let text = String::from_utf8_lossy(&output);
    for line in text.lines() {
        if let Some(idx) = line.find("pid=") {
            let rest = &line[idx + 4..];
            let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
            if let Ok(pid) = digits.parse() {
                return Some(pid);
            }
        }
    }
    None
}

#[cfg(unix)]
async fn lsof_listener_pid(port: u16) -> Option<u32> {
    let spec = format!("tcp:{}", port);
    let output = run_with_timeout(
        tokio::process::Command::new("lsof").args(["-ti", spec.as_str(), "-sTCP:LISTEN"]),
    )
    .await?;

    String::from_utf8_lossy(&output)
        .lines()
        .next()
        .and_then(|line| line.trim().parse().ok())
}

#[cfg(windows)]
async fn find_listener_pid(port: u16) -> Option<u32> {
    let output = run_with_timeout(
        tokio::process::Command::new("powershell")
            .args(["-NoProfile", "-Command", "netstat -ano"]),
    )
    .await?;

    let needle = format!(":{}", port);
    let text = String::from_utf8_lossy(&output);
    for line in text.lines() {
        if line.contains("LISTENING") && line.contains(&needle) {
            if let Some(pid) = line.split_whitespace().last().and_then(|s| s.parse().ok()) {
                return Some(pid);
            }
        }
    }
    None
}

async fn run_with_timeout(cmd: &mut tokio::process::Command) -> Option<Vec<u8>> {
    let result = tokio::time::timeout(
        Duration::from_secs(2),
        cmd.stdin(std::process::Stdio::null()).output(),
    )
    .await;

    match result {
        Ok(Ok(output)) if output.status.success() => Some(output.stdout),
        Ok(Ok(_)) | Ok(Err(_)) => None,
        Err(_) => {
            debug!("Port holder lookup timed out");
            None
        }
    }
}

/// Tree-kill the holder of `port` and wait for the port to come free.
///
/// Children are terminated before the parent; each gets SIGTERM then
/// SIGKILL. Fails with [`PortError::KillFailed`] when the port is still
/// bound after the bounded verification window (protected system process).
pub async fn kill_holder(port: u16, holder: &PortHolder) -> Result<(), PortError> {
    info!(
        "Killing {} (pid {}) holding port {}",
        holder.name, holder.pid, port
    );

    signal::kill_tree(holder.pid).await;

    for attempt in 1..=RECLAIM_ATTEMPTS {
        if is_available(port) {
            info!("Port {} reclaimed after killing pid {}", port, holder.pid);
            return Ok(());
        }
        debug!(
            "Port {} still bound after kill (attempt {}/{})",
            port, attempt, RECLAIM_ATTEMPTS
        );
        tokio::time::sleep(RECLAIM_DELAY).await;
    }

    warn!(
        "Port {} still bound after killing pid {}; holder may be protected",
        port, holder.pid
    );
    Err(PortError::KillFailed {
        port,
        pid: holder.pid,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_prompt() {
        let prompt = FixedPrompt(Resolution::Reassign);
        let conflict = PortConflict {
            port: 3000,
            service: "web".into(),
            holder: None,
        };
        assert_eq!(prompt.ask(&conflict), Resolution::Reassign);
    }

    #[tokio::test]
    async fn test_identify_holder_on_free_port() {
        // Bind-and-drop gives us a port nothing is listening on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        assert!(identify_holder(port).await.is_none());
    }
}
