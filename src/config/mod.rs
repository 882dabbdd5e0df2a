//! Configuration: global preferences and the allocatable port range

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Environment variable overriding the start of the allocatable port range
pub const PORT_RANGE_START_ENV: &str = "FLOTILLA_PORT_RANGE_START";

/// Environment variable overriding the end of the allocatable port range
pub const PORT_RANGE_END_ENV: &str = "FLOTILLA_PORT_RANGE_END";

const DEFAULT_RANGE_START: u16 = 3000;
const DEFAULT_RANGE_END: u16 = 65535;

/// Inclusive port range the manager allocates from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            start: DEFAULT_RANGE_START,
            end: DEFAULT_RANGE_END,
        }
    }
}

impl PortRange {
    /// Build the range from the environment, falling back to defaults.
    ///
    /// Unparseable or out-of-range values are ignored with a logged warning.
    /// An inverted range (start > end) also falls back.
    pub fn from_env() -> Self {
        let start = parse_port_env(PORT_RANGE_START_ENV).unwrap_or(DEFAULT_RANGE_START);
        let end = parse_port_env(PORT_RANGE_END_ENV).unwrap_or(DEFAULT_RANGE_END);

        if start > end {
            warn!(
                "Port range {}-{} is inverted, using defaults {}-{}",
                start, end, DEFAULT_RANGE_START, DEFAULT_RANGE_END
            );
            return Self::default();
        }

        Self { start, end }
    }

    /// Number of ports in the range
    pub fn size(&self) -> u32 {
        u32::from(self.end) - u32::from(self.start) + 1
    }

    /// Whether the range contains the given port
    pub fn contains(&self, port: u16) -> bool {
        port >= self.start && port <= self.end
    }
}

fn parse_port_env(var: &str) -> Option<u16> {
    let raw = std::env::var(var).ok()?;
    match raw.parse::<u32>() {
        Ok(n) if (1..=65535).contains(&n) => Some(n as u16),
        Ok(n) => {
            warn!("{}={} is outside 1-65535, using default", var, n);
            None
        }
        Err(_) => {
            warn!("{}={:?} is not a port number, using default", var, raw);
            None
        }
    }
}

/// Global user preferences, persisted at `~/.flotilla/config.toml`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Preferences {
    /// Kill foreign processes squatting on explicitly pinned ports without
    /// prompting (the saved "always kill" answer)
    #[serde(default)]
    pub always_kill_port_conflicts: bool,

    /// Override for the persisted port assignment store location
    #[serde(default)]
    pub port_store: Option<PathBuf>,
}

impl Preferences {
    /// Load preferences from the default location; missing file means defaults
    pub fn load() -> Result<Self> {
        Self::load_from(&preferences_path())
    }

    /// Load preferences from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read preferences: {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse preferences: {}", path.display()))
    }

    /// Save preferences to the default location
    pub fn save(&self) -> Result<()> {
        self.save_to(&preferences_path())
    }

    /// Save preferences to a specific path
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write preferences: {}", path.display()))
    }

    /// Resolved path of the persisted port assignment store
    pub fn port_store_path(&self) -> PathBuf {
        self.port_store
            .clone()
            .unwrap_or_else(|| flotilla_home().join("ports.json"))
    }
}

/// Per-user state directory (`~/.flotilla`)
pub fn flotilla_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".flotilla")
}

/// Default preferences file path
pub fn preferences_path() -> PathBuf {
    flotilla_home().join("config.toml")
}

/// Per-project state directory (`<project>/.flotilla`)
pub fn project_state_dir(project_root: &Path) -> PathBuf {
    project_root.join(".flotilla")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_range() {
        let range = PortRange::default();
        assert_eq!(range.start, 3000);
        assert_eq!(range.end, 65535);
        assert_eq!(range.size(), 62536);
        assert!(range.contains(3000));
        assert!(range.contains(65535));
        assert!(!range.contains(2999));
    }

    #[test]
    fn test_preferences_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let prefs = Preferences {
            always_kill_port_conflicts: true,
            port_store: None,
        };
        prefs.save_to(&path).unwrap();

        let loaded = Preferences::load_from(&path).unwrap();
        assert!(loaded.always_kill_port_conflicts);
    }

    #[test]
    fn test_missing_preferences_are_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = Preferences::load_from(&dir.path().join("nope.toml")).unwrap();
        assert!(!loaded.always_kill_port_conflicts);
    }
}
