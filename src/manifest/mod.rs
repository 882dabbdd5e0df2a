//! Service manifest loading and validation
//!
//! The manifest is a single YAML file (`flotilla.yaml`) declaring the
//! project's required tools and its services: language, project directory,
//! command, ports, environment, dependencies and healthcheck.

mod healthcheck;

use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::PortRange;

pub use healthcheck::{
    CheckCommand, Healthcheck, HealthcheckField, HealthcheckObject, ProbeTiming, TestField,
};

/// Default manifest file name
pub const MANIFEST_FILE: &str = "flotilla.yaml";

/// Errors raised while loading or validating a manifest
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("Failed to read manifest {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse manifest: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Manifest has no services")]
    Empty,

    #[error("Service {service}: invalid healthcheck: {reason}")]
    InvalidHealthcheck { service: String, reason: String },

    #[error("Service {service}: port {port} is outside the allocatable range {start}-{end}")]
    PortOutOfRange {
        service: String,
        port: i64,
        start: u16,
        end: u16,
    },

    #[error("Service {service}: invalid port entry {entry:?}")]
    InvalidPort { service: String, entry: String },

    #[error("Port {port} is declared by both {first} and {second}")]
    DuplicatePort {
        port: u16,
        first: String,
        second: String,
    },

    #[error("Service {service} uses unknown service {target}")]
    UnknownDependency { service: String, target: String },

    #[error("Dependency cycle between services: {0}")]
    DependencyCycle(String),
}

/// A declared port: pinned to a number or assigned by the port manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortSpec {
    /// The manifest pins this exact port
    Fixed(u16),

    /// "assign me one"
    Auto,
}

impl PortSpec {
    /// The pinned port, if any
    pub fn fixed(&self) -> Option<u16> {
        match self {
            PortSpec::Fixed(p) => Some(*p),
            PortSpec::Auto => None,
        }
    }
}

/// How the service is reached, which drives health probing fallbacks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceType {
    Http,
    Tcp,
    Process,
}

/// What kind of lifetime the service's process has
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceMode {
    /// Long-lived server process
    Daemon,
    /// File watcher that stays up but serves nothing
    Watch,
    /// One-shot build that exits when done
    Build,
    /// One-shot task
    Task,
}

impl Default for ServiceMode {
    fn default() -> Self {
        ServiceMode::Daemon
    }
}

/// What to do when a service exits after becoming healthy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnExitPolicy {
    /// Record and report, keep the rest of the fleet running
    Ignore,
    /// Respawn, guarded by the crash window
    Restart,
    /// Abort the whole orchestration
    Fail,
}

impl Default for OnExitPolicy {
    fn default() -> Self {
        OnExitPolicy::Ignore
    }
}

/// Raw YAML form of a port entry: integer or string ("3000" / "auto")
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
enum RawPort {
    Number(i64),
    Text(String),
}

/// A required external tool
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Requirement {
    /// Tool identifier (node, python, docker, …)
    pub id: String,

    /// Minimum acceptable version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_version: Option<String>,

    /// Override for the command probed (defaults to the registry entry)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    /// Override for the version argv
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,

    /// Leading characters stripped from the extracted version (e.g. "v")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_prefix: Option<String>,

    /// Whitespace token index holding the version in the output
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_field: Option<usize>,

    /// Whether the tool must also be running (e.g. docker daemon)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check_running: Option<bool>,

    /// Command probing runtime state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub running_check_command: Option<String>,

    /// Args for the runtime probe
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub running_check_args: Option<Vec<String>>,

    /// Substring expected in the runtime probe output
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub running_check_expected: Option<String>,

    /// Exit code expected from the runtime probe
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub running_check_exit_code: Option<i32>,

    /// Where to get the tool when missing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install_url: Option<String>,
}

/// One service declaration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServiceSpec {
    /// Language tag (node, python, dotnet, go, …); unknown tags are
    /// treated as plain processes
    pub language: String,

    /// Project directory, relative to the manifest
    pub project: PathBuf,

    /// Explicit command; inferred from framework conventions when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    /// Arguments for the explicit command
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,

    /// Declared ports ("3000" or "auto")
    #[serde(default)]
    ports: Vec<RawPort>,

    /// Environment overlay, insertion order preserved
    #[serde(default)]
    pub environment: IndexMap<String, String>,

    /// Names of services this one depends on
    #[serde(default)]
    pub uses: Vec<String>,

    /// Reachability type; defaults to http when ports are declared
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub service_type: Option<ServiceType>,

    /// Process lifetime mode
    #[serde(default)]
    pub mode: ServiceMode,

    /// Healthcheck declaration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub healthcheck: Option<HealthcheckField>,

    /// Extra env file loaded before the manifest environment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env_file: Option<PathBuf>,

    /// Policy for exits after the service became healthy
    #[serde(default)]
    pub on_exit: OnExitPolicy,
}

impl ServiceSpec {
    /// Declared ports, validated
    pub fn port_specs(&self, service: &str) -> Result<Vec<PortSpec>, ManifestError> {
        self.ports
            .iter()
            .map(|raw| match raw {
                RawPort::Number(n) => validate_port(service, *n),
                RawPort::Text(s) if s.eq_ignore_ascii_case("auto") => Ok(PortSpec::Auto),
                RawPort::Text(s) => match s.parse::<i64>() {
                    Ok(n) => validate_port(service, n),
                    Err(_) => Err(ManifestError::InvalidPort {
                        service: service.to_string(),
                        entry: s.clone(),
                    }),
                },
            })
            .collect()
    }

    /// Effective reachability type
    pub fn effective_type(&self) -> ServiceType {
        if let Some(t) = self.service_type {
            return t;
        }
        if self.ports.is_empty() {
            ServiceType::Process
        } else {
            ServiceType::Http
        }
    }

    /// Resolved healthcheck; `None` means "nothing declared, let the prober
    /// cascade"
    pub fn resolved_healthcheck(&self, service: &str) -> Result<Option<Healthcheck>, ManifestError> {
        self.healthcheck
            .as_ref()
            .map(|raw| raw.resolve(service))
            .transpose()
    }
}

fn validate_port(service: &str, n: i64) -> Result<PortSpec, ManifestError> {
    let range = PortRange::from_env();
    if (1..=65535).contains(&n) && range.contains(n as u16) {
        Ok(PortSpec::Fixed(n as u16))
    } else {
        Err(ManifestError::PortOutOfRange {
            service: service.to_string(),
            port: n,
            start: range.start,
            end: range.end,
        })
    }
}

/// The project manifest
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Manifest {
    /// Project name
    pub name: String,

    /// Required external tools
    #[serde(default)]
    pub reqs: Vec<Requirement>,

    /// Services keyed by name, declaration order preserved
    #[serde(default)]
    pub services: IndexMap<String, ServiceSpec>,

    /// Directory containing the manifest; set on load
    #[serde(skip)]
    pub root: PathBuf,
}

impl Manifest {
    /// Load and validate a manifest file
    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        let content = std::fs::read_to_string(path).map_err(|source| ManifestError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let mut manifest: Manifest = serde_yaml::from_str(&content)?;
        manifest.root = path
            .parent()
            .map(Path::to_path_buf)
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| PathBuf::from("."));

        manifest.validate()?;
        Ok(manifest)
    }

    /// Parse from a YAML string (for tests); root is the current directory
    pub fn from_str(content: &str) -> Result<Self, ManifestError> {
        let mut manifest: Manifest = serde_yaml::from_str(content)?;
        manifest.root = PathBuf::from(".");
        manifest.validate()?;
        Ok(manifest)
    }

    /// Validate cross-service constraints
    fn validate(&self) -> Result<(), ManifestError> {
        if self.services.is_empty() {
            return Err(ManifestError::Empty);
        }

        let mut seen_ports: std::collections::HashMap<u16, String> = Default::default();

        for (name, spec) in &self.services {
            // Ports parse, are in range, and are unique across services
            for port in spec.port_specs(name)? {
                if let PortSpec::Fixed(p) = port {
                    if let Some(first) = seen_ports.insert(p, name.clone()) {
                        return Err(ManifestError::DuplicatePort {
                            port: p,
                            first,
                            second: name.clone(),
                        });
                    }
                }
            }

            // Healthchecks resolve
            spec.resolved_healthcheck(name)?;

            // `uses` targets exist
            for target in &spec.uses {
                if !self.services.contains_key(target) {
                    return Err(ManifestError::UnknownDependency {
                        service: name.clone(),
                        target: target.clone(),
                    });
                }
            }
        }

        Ok(())
    }

    /// Absolute project directory for a service
    pub fn project_dir(&self, spec: &ServiceSpec) -> PathBuf {
        if spec.project.is_absolute() {
            spec.project.clone()
        } else {
            self.root.join(&spec.project)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"
name: demo
reqs:
  - id: node
    minVersion: "18.0.0"
services:
  web:
    language: node
    project: ./web
    command: node
    args: ["server.js"]
    ports: ["3000"]
    healthcheck:
      test: "http://localhost:3000/health"
      interval: 1s
      retries: 5
  api:
    language: python
    project: ./api
    ports: ["auto"]
    uses: [web]
    environment:
      ZED: "1"
      ALPHA: "2"
"#;

    #[test]
    fn test_load_manifest() {
        let m = Manifest::from_str(MANIFEST).unwrap();
        assert_eq!(m.name, "demo");
        assert_eq!(m.services.len(), 2);
        assert_eq!(m.reqs[0].id, "node");
        assert_eq!(m.reqs[0].min_version.as_deref(), Some("18.0.0"));

        let web = &m.services["web"];
        assert_eq!(web.port_specs("web").unwrap(), vec![PortSpec::Fixed(3000)]);
        assert_eq!(web.effective_type(), ServiceType::Http);

        let api = &m.services["api"];
        assert_eq!(api.port_specs("api").unwrap(), vec![PortSpec::Auto]);
        assert_eq!(api.uses, vec!["web"]);
    }

    #[test]
    fn test_environment_preserves_order() {
        let m = Manifest::from_str(MANIFEST).unwrap();
        let keys: Vec<&String> = m.services["api"].environment.keys().collect();
        assert_eq!(keys, vec!["ZED", "ALPHA"]);
    }

    #[test]
    fn test_no_ports_means_process_type() {
        let m = Manifest::from_str(
            "name: x\nservices:\n  w:\n    language: rust\n    project: .\n",
        )
        .unwrap();
        assert_eq!(m.services["w"].effective_type(), ServiceType::Process);
    }

    #[test]
    fn test_port_boundaries() {
        // The allocatable range defaults to 3000-65535; both edges are in,
        // both neighbors are out
        for (port, ok) in [(3000i64, true), (65535, true), (2999, false), (65536, false), (0, false)] {
            let yaml = format!(
                "name: x\nservices:\n  w:\n    language: node\n    project: .\n    ports: [\"{}\"]\n",
                port
            );
            let result = Manifest::from_str(&yaml);
            assert_eq!(result.is_ok(), ok, "port {}", port);
        }
    }

    #[test]
    fn test_duplicate_ports_rejected() {
        let yaml = r#"
name: x
services:
  a:
    language: node
    project: ./a
    ports: ["3000"]
  b:
    language: node
    project: ./b
    ports: ["3000"]
"#;
        let err = Manifest::from_str(yaml).unwrap_err();
        assert!(matches!(err, ManifestError::DuplicatePort { port: 3000, .. }));
    }

    #[test]
    fn test_unknown_uses_rejected() {
        let yaml = r#"
name: x
services:
  a:
    language: node
    project: ./a
    uses: [ghost]
"#;
        let err = Manifest::from_str(yaml).unwrap_err();
        assert!(matches!(err, ManifestError::UnknownDependency { .. }));
    }

    #[test]
    fn test_healthcheck_false() {
        let yaml = r#"
name: x
services:
  a:
    language: node
    project: ./a
    healthcheck: false
"#;
        let m = Manifest::from_str(yaml).unwrap();
        let hc = m.services["a"].resolved_healthcheck("a").unwrap().unwrap();
        assert!(hc.is_disabled());
    }

    #[test]
    fn test_on_exit_default() {
        let m = Manifest::from_str(MANIFEST).unwrap();
        assert_eq!(m.services["web"].on_exit, OnExitPolicy::Ignore);
    }
}
