//! Built-in tool registry
//!
//! For each known tool: how to invoke it for a version, how to extract the
//! version field from the output, and an optional runtime probe for tools
//! that must also be *running* (container daemons, database servers).

use regex::Regex;

/// How the version is located in the tool's output
#[derive(Debug, Clone)]
pub enum VersionRule {
    /// The whole (trimmed) first line is the version
    Whole,

    /// The N-th whitespace-separated token of the first line
    Token(usize),

    /// First capture group of a regex over the whole output
    Capture(&'static str),
}

/// Probe that the tool's runtime is actually up
#[derive(Debug, Clone)]
pub struct RuntimeProbe {
    pub command: String,
    pub args: Vec<String>,
    /// Substring expected in stdout; `None` means exit code alone decides
    pub expected_substring: Option<String>,
    pub expected_exit: i32,
}

/// One known tool
#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub id: String,
    pub command: String,
    pub version_args: Vec<String>,
    pub rule: VersionRule,
    /// Leading characters stripped from the extracted version (e.g. "v")
    pub strip_prefix: Option<String>,
    pub runtime: Option<RuntimeProbe>,
    pub install_url: Option<String>,
}

impl ToolSpec {
    fn new(id: &str, command: &str, version_args: &[&str], rule: VersionRule) -> Self {
        Self {
            id: id.to_string(),
            command: command.to_string(),
            version_args: version_args.iter().map(|s| s.to_string()).collect(),
            rule,
            strip_prefix: None,
            runtime: None,
            install_url: None,
        }
    }

    fn strip(mut self, prefix: &str) -> Self {
        self.strip_prefix = Some(prefix.to_string());
        self
    }

    fn url(mut self, url: &str) -> Self {
        self.install_url = Some(url.to_string());
        self
    }

    fn runtime(mut self, command: &str, args: &[&str], expected_substring: Option<&str>) -> Self {
        self.runtime = Some(RuntimeProbe {
            command: command.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            expected_substring: expected_substring.map(|s| s.to_string()),
            expected_exit: 0,
        });
        self
    }
}

/// The built-in registry; manifest `reqs[]` entries override fields per id
pub fn builtin_registry() -> Vec<ToolSpec> {
    vec![
        ToolSpec::new("node", "node", &["--version"], VersionRule::Whole)
            .strip("v")
            .url("https://nodejs.org"),
        ToolSpec::new("npm", "npm", &["--version"], VersionRule::Whole)
            .url("https://nodejs.org"),
        ToolSpec::new("pnpm", "pnpm", &["--version"], VersionRule::Whole)
            .url("https://pnpm.io/installation"),
        ToolSpec::new("yarn", "yarn", &["--version"], VersionRule::Whole)
            .url("https://yarnpkg.com/getting-started/install"),
        // "Python 3.12.1"
        ToolSpec::new("python", "python3", &["--version"], VersionRule::Token(1))
            .url("https://www.python.org/downloads"),
        // "pip 24.0 from ..."
        ToolSpec::new("pip", "pip3", &["--version"], VersionRule::Token(1))
            .url("https://pip.pypa.io"),
        // "uv 0.4.18"
        ToolSpec::new("uv", "uv", &["--version"], VersionRule::Token(1))
            .url("https://docs.astral.sh/uv"),
        // "Poetry (version 1.8.2)"
        ToolSpec::new(
            "poetry",
            "poetry",
            &["--version"],
            VersionRule::Capture(r"(\d+\.\d+(?:\.\d+)?)"),
        )
        .url("https://python-poetry.org/docs/#installation"),
        ToolSpec::new("dotnet", "dotnet", &["--version"], VersionRule::Whole)
            .url("https://dotnet.microsoft.com/download"),
        // "go version go1.22.1 linux/amd64"
        ToolSpec::new(
            "go",
            "go",
            &["version"],
            VersionRule::Capture(r"go(\d+\.\d+(?:\.\d+)?)"),
        )
        .url("https://go.dev/dl"),
        // "Docker version 27.1.1, build 6312585"
        ToolSpec::new(
            "docker",
            "docker",
            &["--version"],
            VersionRule::Capture(r"(\d+\.\d+\.\d+)"),
        )
        .runtime("docker", &["ps", "--quiet"], None)
        .url("https://docs.docker.com/get-docker"),
        // "psql (PostgreSQL) 16.2"
        ToolSpec::new("postgres", "psql", &["--version"], VersionRule::Token(2))
            .runtime("pg_isready", &[], Some("accepting connections"))
            .url("https://www.postgresql.org/download"),
        ToolSpec::new("git", "git", &["--version"], VersionRule::Token(2))
            .url("https://git-scm.com/downloads"),
    ]
}

/// Look up a built-in by id
pub fn builtin(id: &str) -> Option<ToolSpec> {
    builtin_registry().into_iter().find(|tool| tool.id == id)
}

/// Extract the version field from tool output per the rule
pub fn extract_version(output: &str, rule: &VersionRule, strip_prefix: Option<&str>) -> Option<String> {
    let first_line = output.lines().find(|line| !line.trim().is_empty())?.trim();

    let raw = match rule {
        VersionRule::Whole => Some(first_line.to_string()),
        VersionRule::Token(idx) => first_line
            .split_whitespace()
            .nth(*idx)
            .map(|token| token.to_string()),
        VersionRule::Capture(pattern) => {
            let regex = Regex::new(pattern).ok()?;
            regex
                .captures(output)
                .and_then(|captures| captures.get(1))
                .map(|m| m.as_str().to_string())
        }
    }?;

    let stripped = match strip_prefix {
        Some(prefix) => raw.strip_prefix(prefix).unwrap_or(&raw).to_string(),
        None => raw,
    };

    Some(stripped)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_whole_rule_with_strip() {
        let v = extract_version("v20.11.1\n", &VersionRule::Whole, Some("v"));
        assert_eq!(v.as_deref(), Some("20.11.1"));
    }

    #[test]
    fn test_token_rule() {
        let v = extract_version("Python 3.12.1\n", &VersionRule::Token(1), None);
        assert_eq!(v.as_deref(), Some("3.12.1"));

        let v = extract_version("psql (PostgreSQL) 16.2\n", &VersionRule::Token(2), None);
        assert_eq!(v.as_deref(), Some("16.2"));
    }

    #[test]
    fn test_capture_rule() {
        let v = extract_version(
            "go version go1.22.1 linux/amd64\n",
            &VersionRule::Capture(r"go(\d+\.\d+(?:\.\d+)?)"),
            None,
        );
        assert_eq!(v.as_deref(), Some("1.22.1"));

        let v = extract_version(
            "Docker version 27.1.1, build 6312585\n",
            &VersionRule::Capture(r"(\d+\.\d+\.\d+)"),
            None,
        );
        assert_eq!(v.as_deref(), Some("27.1.1"));
    }

    #[test]
    fn test_registry_ids_are_unique() {
        let registry = builtin_registry();
        let mut ids: Vec<&str> = registry.iter().map(|tool| tool.id.as_str()).collect();
        let before = ids.len();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), before);
    }

    #[test]
    fn test_builtin_lookup() {
        assert!(builtin("node").is_some());
        assert!(builtin("docker").unwrap().runtime.is_some());
        assert!(builtin("cobol-compiler").is_none());
    }
}
