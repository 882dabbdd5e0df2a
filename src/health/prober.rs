//! Probe strategies and their execution
//!
//! Strategy selection cascades once per service: a manifest healthcheck is
//! used verbatim; otherwise a port means trying the well-known HTTP paths,
//! falling back to a TCP connect; no port at all means a PID-alive check.
//! The chosen strategy is cached so dead paths are not re-probed every
//! cycle.

use std::sync::Arc;
use std::time::{Duration, Instant};

use regex::Regex;
use tracing::{debug, warn};

use crate::events::HealthState;
use crate::manifest::{CheckCommand, Healthcheck, ServiceType};
use crate::process::signal;
use crate::system::OutputSink;

use super::{CheckType, HealthResult};

/// Well-known HTTP paths tried in order during discovery
pub const WELL_KNOWN_PATHS: &[&str] = &["/health", "/healthz", "/ready", "/alive", "/ping"];

/// Bound on TCP connect probes
const TCP_TIMEOUT: Duration = Duration::from_secs(2);

/// Bound on healthcheck command execution
const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything the prober needs to know about one service
#[derive(Debug, Clone)]
pub struct ProbeTarget {
    pub service: String,
    pub pid: Option<u32>,
    pub port: Option<u16>,
    pub service_type: ServiceType,
    /// Manifest healthcheck, used verbatim when present
    pub declared: Option<Healthcheck>,
    /// Captured stdout, needed for output-pattern checks
    pub sink: Option<Arc<OutputSink>>,
}

/// The cached probing strategy for one service
#[derive(Debug, Clone)]
pub enum Strategy {
    Http {
        url: String,
        timeout: Duration,
    },
    Tcp {
        port: u16,
    },
    Process,
    Output {
        pattern: Regex,
        timeout: Duration,
    },
    Command {
        command: CheckCommand,
        timeout: Duration,
        expected_exit: Option<i32>,
        expected_substring: Option<String>,
    },
    Disabled,
}

impl Strategy {
    pub fn check_type(&self) -> CheckType {
        match self {
            Strategy::Http { .. } => CheckType::Http,
            Strategy::Tcp { .. } => CheckType::Tcp,
            Strategy::Process => CheckType::Process,
            Strategy::Output { .. } => CheckType::Output,
            Strategy::Command { .. } => CheckType::Command,
            Strategy::Disabled => CheckType::Disabled,
        }
    }
}

/// A target paired with its selected strategy
#[derive(Debug, Clone)]
pub struct ServiceProbe {
    pub target: ProbeTarget,
    pub strategy: Strategy,
}

/// Executes probes and selects strategies
#[derive(Clone)]
pub struct Prober {
    client: reqwest::Client,
}

impl Prober {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .connect_timeout(Duration::from_secs(2))
                .build()
                .unwrap_or_default(),
        }
    }

    /// Decide the probing strategy for a target, once, and cache it in the
    /// returned [`ServiceProbe`].
    pub async fn prepare(&self, target: ProbeTarget) -> ServiceProbe {
        let strategy = self.select_strategy(&target).await;
        debug!(
            "Service {} probes via {}",
            target.service,
            strategy.check_type()
        );
        ServiceProbe { target, strategy }
    }

    async fn select_strategy(&self, target: &ProbeTarget) -> Strategy {
        // 1. The manifest healthcheck is used verbatim
        if let Some(declared) = &target.declared {
            return self.strategy_from_declared(target, declared);
        }

        // 2./3. A port means HTTP discovery, falling back to TCP
        if let Some(port) = target.port {
            if target.service_type != ServiceType::Tcp {
                if let Some(path) = self.discover_http_path(port).await {
                    return Strategy::Http {
                        url: format!("http://localhost:{}{}", port, path),
                        timeout: COMMAND_TIMEOUT,
                    };
                }
            }
            return Strategy::Tcp { port };
        }

        // 4. Process-alive is all that is left
        Strategy::Process
    }

    fn strategy_from_declared(&self, target: &ProbeTarget, declared: &Healthcheck) -> Strategy {
        match declared {
            Healthcheck::Disabled => Strategy::Disabled,
            Healthcheck::Process => Strategy::Process,
            Healthcheck::Http {
                endpoint,
                port,
                timing,
            } => {
                let Some(port) = (*port).or(target.port) else {
                    warn!(
                        "Service {} declares an HTTP check but has no port; using process check",
                        target.service
                    );
                    return Strategy::Process;
                };
                Strategy::Http {
                    url: format!("http://localhost:{}{}", port, endpoint),
                    timeout: timing.timeout,
                }
            }
            Healthcheck::Tcp { port, timing: _ } => match (*port).or(target.port) {
                Some(port) => Strategy::Tcp { port },
                None => {
                    warn!(
                        "Service {} declares a TCP check but has no port; using process check",
                        target.service
                    );
                    Strategy::Process
                }
            },
            Healthcheck::Output { pattern, timeout } => match Regex::new(pattern) {
                Ok(regex) => Strategy::Output {
                    pattern: regex,
                    timeout: *timeout,
                },
                Err(e) => {
                    warn!(
                        "Service {} output pattern does not compile ({}); using process check",
                        target.service, e
                    );
                    Strategy::Process
                }
            },
            Healthcheck::Command {
                command,
                timing,
                expected_exit,
                expected_substring,
            } => Strategy::Command {
                command: command.clone(),
                timeout: timing.timeout.min(COMMAND_TIMEOUT),
                expected_exit: *expected_exit,
                expected_substring: expected_substring.clone(),
            },
        }
    }

    /// Try the well-known paths; the first one answering 2xx/3xx wins
    async fn discover_http_path(&self, port: u16) -> Option<String> {
        for path in WELL_KNOWN_PATHS {
            let url = format!("http://localhost:{}{}", port, path);

            for head in [true, false] {
                let request = if head {
                    self.client.head(&url)
                } else {
                    self.client.get(&url)
                };

                let response = tokio::time::timeout(
                    TCP_TIMEOUT,
                    request.send(),
                )
                .await;

                if let Ok(Ok(response)) = response {
                    let code = response.status().as_u16();
                    if (200..400).contains(&code) {
                        return Some(path.to_string());
                    }
                    // The server speaks HTTP but dislikes this path/method;
                    // try GET or the next path
                }
            }
        }
        None
    }

    /// Run one probe, producing the full detail floor
    pub async fn probe(&self, probe: &ServiceProbe) -> HealthResult {
        let mut result = HealthResult::new(&probe.target.service, probe.strategy.check_type());
        result.pid = probe.target.pid;
        result.port = probe.target.port;

        let started = Instant::now();
        match &probe.strategy {
            Strategy::Http { url, timeout } => {
                self.probe_http(url, *timeout, &mut result).await;
            }
            Strategy::Tcp { port } => {
                result.port = Some(*port);
                probe_tcp(*port, &mut result).await;
            }
            Strategy::Process => {
                probe_process(probe.target.pid, &mut result);
            }
            Strategy::Output { pattern, timeout } => {
                probe_output(probe.target.sink.as_deref(), pattern, *timeout, &mut result).await;
            }
            Strategy::Command {
                command,
                timeout,
                expected_exit,
                expected_substring,
            } => {
                probe_command(
                    command,
                    *timeout,
                    *expected_exit,
                    expected_substring.as_deref(),
                    &mut result,
                )
                .await;
            }
            Strategy::Disabled => {
                // Never probed; healthy exactly while the process is alive
                let alive = probe.target.pid.map(signal::pid_alive).unwrap_or(false);
                result.status = if alive {
                    HealthState::Healthy
                } else {
                    HealthState::Unhealthy
                };
            }
        }

        result.response_time_ms = started.elapsed().as_millis() as u64;
        result
    }

    async fn probe_http(&self, url: &str, timeout: Duration, result: &mut HealthResult) {
        result.endpoint = Some(url.to_string());

        let response = tokio::time::timeout(timeout, self.client.get(url).send()).await;

        let response = match response {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                result.status = HealthState::Unhealthy;
                result.error = Some(format!("connection failed: {}", e));
                return;
            }
            Err(_) => {
                result.status = HealthState::Unhealthy;
                result.error = Some(format!("timed out after {:?}", timeout));
                return;
            }
        };

        let code = response.status().as_u16();
        result.status_code = Some(code);

        if !(200..400).contains(&code) {
            result.status = HealthState::Unhealthy;
            result.error = Some(format!("HTTP {}", code));
            return;
        }

        result.status = HealthState::Healthy;

        // The body may refine the verdict: a JSON `status` field overrides,
        // and a `checks` object travels along as details.
        if let Ok(body) = response.json::<serde_json::Value>().await {
            if let Some(status) = body.get("status").and_then(|s| s.as_str()) {
                let status = status.to_ascii_lowercase();
                if status == "degraded" {
                    result.status = HealthState::Degraded;
                } else if ["unhealthy", "down", "fail", "failing", "error"]
                    .contains(&status.as_str())
                {
                    result.status = HealthState::Unhealthy;
                    result.error = Some(format!("service reports status {:?}", status));
                }
            }
            if let Some(checks) = body.get("checks") {
                result.details = Some(checks.clone());
            }
        }
    }
}

impl Default for Prober {
    fn default() -> Self {
        Self::new()
    }
}

async fn probe_tcp(port: u16, result: &mut HealthResult) {
    let addr = format!("127.0.0.1:{}", port);
    match tokio::time::timeout(TCP_TIMEOUT, tokio::net::TcpStream::connect(&addr)).await {
        Ok(Ok(_)) => {
            result.status = HealthState::Healthy;
        }
        Ok(Err(e)) => {
            result.status = HealthState::Unhealthy;
            result.error = Some(format!("connect failed: {}", e));
        }
        Err(_) => {
            result.status = HealthState::Unhealthy;
            result.error = Some(format!("connect timed out after {:?}", TCP_TIMEOUT));
        }
    }
}

fn probe_process(pid: Option<u32>, result: &mut HealthResult) {
    match pid {
        // A live PID is all we can verify; a hung process looks the same
        Some(pid) if signal::pid_alive(pid) => {
            result.status = HealthState::Healthy;
        }
        Some(pid) => {
            result.status = HealthState::Unhealthy;
            result.error = Some(format!("process {} is gone", pid));
        }
        None => {
            result.status = HealthState::Unhealthy;
            result.error = Some("no process".to_string());
        }
    }
}

async fn probe_output(
    sink: Option<&OutputSink>,
    pattern: &Regex,
    timeout: Duration,
    result: &mut HealthResult,
) {
    let Some(sink) = sink else {
        result.status = HealthState::Unhealthy;
        result.error = Some("no captured output to scan".to_string());
        return;
    };

    // Retained output first: a match that already scrolled past still counts
    if sink.snapshot().iter().any(|line| pattern.is_match(line)) {
        result.status = HealthState::Healthy;
        return;
    }

    let mut rx = sink.subscribe();
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Ok(line)) => {
                if pattern.is_match(&line) {
                    result.status = HealthState::Healthy;
                    return;
                }
            }
            Ok(Err(_)) => {
                // Channel lagged or closed; re-check the ring before giving up
                if sink.snapshot().iter().any(|line| pattern.is_match(line)) {
                    result.status = HealthState::Healthy;
                    return;
                }
                result.status = HealthState::Unhealthy;
                result.error = Some("output stream closed before pattern matched".to_string());
                return;
            }
            Err(_) => {
                result.status = HealthState::Unhealthy;
                result.error = Some(format!(
                    "pattern {:?} not seen within {:?}",
                    pattern.as_str(),
                    timeout
                ));
                return;
            }
        }
    }
}

async fn probe_command(
    command: &CheckCommand,
    timeout: Duration,
    expected_exit: Option<i32>,
    expected_substring: Option<&str>,
    result: &mut HealthResult,
) {
    let mut cmd = match command {
        CheckCommand::Exec(argv) => {
            let mut cmd = tokio::process::Command::new(&argv[0]);
            cmd.args(&argv[1..]);
            cmd
        }
        CheckCommand::Shell(line) => {
            #[cfg(unix)]
            {
                let mut cmd = tokio::process::Command::new("sh");
                cmd.arg("-c").arg(line);
                cmd
            }
            #[cfg(windows)]
            {
                let mut cmd = tokio::process::Command::new("cmd.exe");
                cmd.arg("/C").arg(line);
                cmd
            }
        }
    };
    cmd.stdin(std::process::Stdio::null());

    let output = match tokio::time::timeout(timeout, cmd.output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            result.status = HealthState::Unhealthy;
            result.error = Some(format!("check command failed to run: {}", e));
            return;
        }
        Err(_) => {
            result.status = HealthState::Unhealthy;
            result.error = Some(format!("check command timed out after {:?}", timeout));
            return;
        }
    };

    let code = output.status.code();
    let exit_ok = match expected_exit {
        Some(expected) => code == Some(expected),
        None => output.status.success(),
    };

    let substring_ok = match expected_substring {
        Some(needle) => String::from_utf8_lossy(&output.stdout).contains(needle),
        None => true,
    };

    if exit_ok && substring_ok {
        result.status = HealthState::Healthy;
    } else {
        result.status = HealthState::Unhealthy;
        result.error = Some(if !exit_ok {
            format!("check exited with {:?}", code)
        } else {
            "check output missing expected text".to_string()
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::ProbeTiming;

    fn target(name: &str) -> ProbeTarget {
        ProbeTarget {
            service: name.to_string(),
            pid: None,
            port: None,
            service_type: ServiceType::Process,
            declared: None,
            sink: None,
        }
    }

    #[tokio::test]
    async fn test_no_port_selects_process_check() {
        let prober = Prober::new();
        let probe = prober.prepare(target("worker")).await;
        assert!(matches!(probe.strategy, Strategy::Process));
    }

    #[tokio::test]
    async fn test_declared_check_used_verbatim() {
        let prober = Prober::new();
        let mut t = target("db");
        t.port = Some(5432);
        t.declared = Some(Healthcheck::Tcp {
            port: None,
            timing: ProbeTiming::default(),
        });
        let probe = prober.prepare(t).await;
        assert!(matches!(probe.strategy, Strategy::Tcp { port: 5432 }));
    }

    #[tokio::test]
    async fn test_disabled_is_healthy_while_alive() {
        let prober = Prober::new();
        let mut t = target("bg");
        t.pid = Some(std::process::id());
        t.declared = Some(Healthcheck::Disabled);

        let probe = prober.prepare(t).await;
        let result = prober.probe(&probe).await;
        assert_eq!(result.status, HealthState::Healthy);
        assert_eq!(result.check_type, CheckType::Disabled);
    }

    #[tokio::test]
    async fn test_process_probe_dead_pid() {
        let prober = Prober::new();
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let dead = child.id();
        let _ = child.wait();

        let mut t = target("gone");
        t.pid = Some(dead);
        let probe = prober.prepare(t).await;
        let result = prober.probe(&probe).await;
        assert_eq!(result.status, HealthState::Unhealthy);
    }

    #[tokio::test]
    async fn test_tcp_probe_refused() {
        let prober = Prober::new();
        // Bind-and-drop: nothing listens here now
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut t = target("svc");
        t.port = Some(port);
        t.service_type = ServiceType::Tcp;
        let probe = prober.prepare(t).await;

        let result = prober.probe(&probe).await;
        assert_eq!(result.status, HealthState::Unhealthy);
        assert!(result.error.is_some());
    }

    #[tokio::test]
    async fn test_tcp_probe_accepts() {
        let prober = Prober::new();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut t = target("svc");
        t.port = Some(port);
        t.declared = Some(Healthcheck::Tcp {
            port: Some(port),
            timing: ProbeTiming::default(),
        });
        let probe = prober.prepare(t).await;

        let result = prober.probe(&probe).await;
        assert_eq!(result.status, HealthState::Healthy);
        drop(listener);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_probe_exit_code() {
        let prober = Prober::new();
        let mut t = target("svc");
        t.declared = Some(Healthcheck::Command {
            command: CheckCommand::Shell("exit 0".into()),
            timing: ProbeTiming::default(),
            expected_exit: Some(0),
            expected_substring: None,
        });
        let probe = prober.prepare(t).await;
        assert_eq!(prober.probe(&probe).await.status, HealthState::Healthy);

        let mut t = target("svc");
        t.declared = Some(Healthcheck::Command {
            command: CheckCommand::Shell("exit 1".into()),
            timing: ProbeTiming::default(),
            expected_exit: Some(0),
            expected_substring: None,
        });
        let probe = prober.prepare(t).await;
        assert_eq!(prober.probe(&probe).await.status, HealthState::Unhealthy);
    }

    #[tokio::test]
    async fn test_output_probe_matches_ring() {
        let prober = Prober::new();
        let sink = Arc::new(OutputSink::new());
        sink.push("Server listening on port 3000".to_string());

        let mut t = target("web");
        t.sink = Some(sink);
        t.declared = Some(Healthcheck::Output {
            pattern: "listening on port \\d+".into(),
            timeout: Duration::from_millis(200),
        });
        let probe = prober.prepare(t).await;

        let result = prober.probe(&probe).await;
        assert_eq!(result.status, HealthState::Healthy);
        assert_eq!(result.check_type, CheckType::Output);
    }

    #[tokio::test]
    async fn test_output_probe_deadline() {
        let prober = Prober::new();
        let sink = Arc::new(OutputSink::new());
        sink.push("starting up".to_string());

        let mut t = target("web");
        t.sink = Some(sink);
        t.declared = Some(Healthcheck::Output {
            pattern: "ready".into(),
            timeout: Duration::from_millis(100),
        });
        let probe = prober.prepare(t).await;

        let result = prober.probe(&probe).await;
        assert_eq!(result.status, HealthState::Unhealthy);
    }
}
