//! Healthcheck declarations and their resolved form
//!
//! The manifest accepts the docker-compose healthcheck surface: `false`
//! disables the check, a bare string is CMD-SHELL, and the object form
//! carries a `test` array plus timing fields. On top of that, an `http://`
//! string (or `type: http` with an `endpoint`) declares an HTTP probe and
//! `pattern` declares an output-pattern probe.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::ManifestError;

/// Default probe interval
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(30);
/// Default probe timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
/// Default retries before a service is declared unhealthy
pub const DEFAULT_RETRIES: u32 = 3;
/// Default grace period before failures count
pub const DEFAULT_START_PERIOD: Duration = Duration::ZERO;
/// Default probe interval during the start period
pub const DEFAULT_START_INTERVAL: Duration = Duration::from_secs(5);

/// Raw manifest form of a healthcheck: `false`, a string, or an object
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum HealthcheckField {
    /// `healthcheck: false` disables probing
    Disabled(bool),

    /// Bare string: CMD-SHELL, or an HTTP endpoint when it looks like a URL
    Shell(String),

    /// Full object form
    Spec(HealthcheckObject),
}

/// Object form of the manifest healthcheck
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct HealthcheckObject {
    /// `["NONE"]`, `["CMD", argv…]`, `["CMD-SHELL", string]`, or a bare string
    #[serde(default)]
    pub test: Option<TestField>,

    #[serde(default)]
    pub interval: Option<String>,

    #[serde(default)]
    pub timeout: Option<String>,

    #[serde(default)]
    pub retries: Option<u32>,

    #[serde(default)]
    pub start_period: Option<String>,

    #[serde(default)]
    pub start_interval: Option<String>,

    #[serde(default)]
    pub disable: Option<bool>,

    /// Explicit check type: http, tcp, process, output, none
    #[serde(default, rename = "type")]
    pub check_type: Option<String>,

    /// HTTP endpoint path for `type: http`
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Regex for `type: output`
    #[serde(default)]
    pub pattern: Option<String>,
}

/// The `test` key: a bare string or an argv-style array
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum TestField {
    Command(String),
    Argv(Vec<String>),
}

/// Probe timing parameters shared by every check kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeTiming {
    pub interval: Duration,
    pub timeout: Duration,
    pub retries: u32,
    pub start_period: Duration,
    pub start_interval: Duration,
}

impl Default for ProbeTiming {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            timeout: DEFAULT_TIMEOUT,
            retries: DEFAULT_RETRIES,
            start_period: DEFAULT_START_PERIOD,
            start_interval: DEFAULT_START_INTERVAL,
        }
    }
}

/// A command to execute for `Command` checks
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckCommand {
    /// Exec the argv directly
    Exec(Vec<String>),

    /// Run through the platform shell (CMD-SHELL)
    Shell(String),
}

/// Resolved healthcheck, one per service, decided once at manifest load
#[derive(Debug, Clone)]
pub enum Healthcheck {
    /// HTTP request against `http://localhost:<port><endpoint>`
    Http {
        endpoint: String,
        /// Port override extracted from a URL-form declaration
        port: Option<u16>,
        timing: ProbeTiming,
    },

    /// TCP connect probe
    Tcp {
        port: Option<u16>,
        timing: ProbeTiming,
    },

    /// PID-alive check only
    Process,

    /// Match a regex against captured stdout
    Output {
        pattern: String,
        timeout: Duration,
    },

    /// Execute a command and inspect exit code / stdout
    Command {
        command: CheckCommand,
        timing: ProbeTiming,
        expected_exit: Option<i32>,
        expected_substring: Option<String>,
    },

    /// Never probed; healthy while the process is alive
    Disabled,
}

impl Healthcheck {
    /// Timing for scheduling purposes; checks without configurable timing
    /// use the defaults.
    pub fn timing(&self) -> ProbeTiming {
        match self {
            Healthcheck::Http { timing, .. }
            | Healthcheck::Tcp { timing, .. }
            | Healthcheck::Command { timing, .. } => *timing,
            Healthcheck::Output { timeout, .. } => ProbeTiming {
                timeout: *timeout,
                ..ProbeTiming::default()
            },
            Healthcheck::Process | Healthcheck::Disabled => ProbeTiming::default(),
        }
    }

    /// Whether this check is the disabled sentinel
    pub fn is_disabled(&self) -> bool {
        matches!(self, Healthcheck::Disabled)
    }
}

impl HealthcheckField {
    /// Resolve the raw manifest form into a concrete [`Healthcheck`]
    pub fn resolve(&self, service: &str) -> Result<Healthcheck, ManifestError> {
        match self {
            HealthcheckField::Disabled(false) => Ok(Healthcheck::Disabled),
            HealthcheckField::Disabled(true) => Err(ManifestError::InvalidHealthcheck {
                service: service.to_string(),
                reason: "healthcheck: true is not a check; use an object or a command".into(),
            }),
            HealthcheckField::Shell(s) => Ok(resolve_string_test(s, &ProbeTiming::default())),
            HealthcheckField::Spec(obj) => obj.resolve(service),
        }
    }
}

impl HealthcheckObject {
    fn timing(&self, service: &str) -> Result<ProbeTiming, ManifestError> {
        let defaults = ProbeTiming::default();
        Ok(ProbeTiming {
            interval: parse_duration_field(service, "interval", &self.interval)?
                .unwrap_or(defaults.interval),
            timeout: parse_duration_field(service, "timeout", &self.timeout)?
                .unwrap_or(defaults.timeout),
            retries: self.retries.unwrap_or(defaults.retries),
            start_period: parse_duration_field(service, "start_period", &self.start_period)?
                .unwrap_or(defaults.start_period),
            start_interval: parse_duration_field(service, "start_interval", &self.start_interval)?
                .unwrap_or(defaults.start_interval),
        })
    }

    /// Resolve the object form
    pub fn resolve(&self, service: &str) -> Result<Healthcheck, ManifestError> {
        if self.disable.unwrap_or(false) {
            return Ok(Healthcheck::Disabled);
        }

        let timing = self.timing(service)?;

        // Explicit type wins over the test field
        if let Some(kind) = self.check_type.as_deref() {
            match kind {
                "none" => return Ok(Healthcheck::Disabled),
                "http" => {
                    let endpoint = self
                        .endpoint
                        .clone()
                        .unwrap_or_else(|| "/health".to_string());
                    return Ok(Healthcheck::Http {
                        endpoint,
                        port: None,
                        timing,
                    });
                }
                "tcp" => return Ok(Healthcheck::Tcp { port: None, timing }),
                "process" => return Ok(Healthcheck::Process),
                "output" => {
                    let pattern = self.pattern.clone().ok_or_else(|| {
                        ManifestError::InvalidHealthcheck {
                            service: service.to_string(),
                            reason: "type: output requires a pattern".into(),
                        }
                    })?;
                    return Ok(Healthcheck::Output {
                        pattern,
                        timeout: timing.timeout,
                    });
                }
                other => {
                    return Err(ManifestError::InvalidHealthcheck {
                        service: service.to_string(),
                        reason: format!("unknown healthcheck type {:?}", other),
                    })
                }
            }
        }

        // A bare pattern is an output check
        if let Some(pattern) = &self.pattern {
            return Ok(Healthcheck::Output {
                pattern: pattern.clone(),
                timeout: timing.timeout,
            });
        }

        match &self.test {
            None => Err(ManifestError::InvalidHealthcheck {
                service: service.to_string(),
                reason: "healthcheck object needs a test, type, or pattern".into(),
            }),
            Some(TestField::Command(s)) => Ok(resolve_string_test(s, &timing)),
            Some(TestField::Argv(parts)) => resolve_argv_test(service, parts, &timing),
        }
    }
}

/// A string test is CMD-SHELL, unless it looks like an HTTP URL, in which
/// case it declares an HTTP probe on that endpoint.
fn resolve_string_test(s: &str, timing: &ProbeTiming) -> Healthcheck {
    if let Some((port, path)) = parse_http_url(s) {
        return Healthcheck::Http {
            endpoint: path,
            port,
            timing: *timing,
        };
    }

    Healthcheck::Command {
        command: CheckCommand::Shell(s.to_string()),
        timing: *timing,
        expected_exit: Some(0),
        expected_substring: None,
    }
}

fn resolve_argv_test(
    service: &str,
    parts: &[String],
    timing: &ProbeTiming,
) -> Result<Healthcheck, ManifestError> {
    match parts.first().map(String::as_str) {
        Some("NONE") => Ok(Healthcheck::Disabled),
        Some("CMD") => {
            let argv: Vec<String> = parts[1..].to_vec();
            if argv.is_empty() {
                return Err(ManifestError::InvalidHealthcheck {
                    service: service.to_string(),
                    reason: "CMD test has no command".into(),
                });
            }
            Ok(Healthcheck::Command {
                command: CheckCommand::Exec(argv),
                timing: *timing,
                expected_exit: Some(0),
                expected_substring: None,
            })
        }
        Some("CMD-SHELL") => {
            let cmd = parts.get(1).cloned().unwrap_or_default();
            if cmd.is_empty() {
                return Err(ManifestError::InvalidHealthcheck {
                    service: service.to_string(),
                    reason: "CMD-SHELL test has no command".into(),
                });
            }
            Ok(resolve_string_test(&cmd, timing))
        }
        Some(other) => Err(ManifestError::InvalidHealthcheck {
            service: service.to_string(),
            reason: format!("unknown test kind {:?} (expected NONE, CMD or CMD-SHELL)", other),
        }),
        None => Err(ManifestError::InvalidHealthcheck {
            service: service.to_string(),
            reason: "empty test array".into(),
        }),
    }
}

/// Extract `(port, path)` from an `http(s)://` test string
fn parse_http_url(s: &str) -> Option<(Option<u16>, String)> {
    let rest = s
        .strip_prefix("http://")
        .or_else(|| s.strip_prefix("https://"))?;

    let (authority, path) = match rest.find('/') {
        Some(idx) => (&rest[..idx], rest[idx..].to_string()),
        None => (rest, "/".to_string()),
    };

    let port = authority
        .rsplit_once(':')
        .and_then(|(_, p)| p.parse::<u16>().ok());

    Some((port, path))
}

/// Parse a duration field: humantime form (`30s`, `500ms`) or bare seconds
pub fn parse_duration_field(
    service: &str,
    field: &str,
    value: &Option<String>,
) -> Result<Option<Duration>, ManifestError> {
    let Some(raw) = value else {
        return Ok(None);
    };

    if let Ok(secs) = raw.parse::<u64>() {
        return Ok(Some(Duration::from_secs(secs)));
    }

    humantime::parse_duration(raw)
        .map(Some)
        .map_err(|_| ManifestError::InvalidHealthcheck {
            service: service.to_string(),
            reason: format!("{} {:?} is not a duration", field, raw),
        })
}
