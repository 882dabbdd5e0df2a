//! Service invocation model
//!
//! Commands are resolved once at spawn time into a tagged invocation:
//! a shell line, a direct argv, or a Windows `.cmd` shim that must go
//! through `cmd.exe /c`. `<PORT>` placeholders are substituted after the
//! port manager has granted a port.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::manifest::{ServiceMode, ServiceSpec};

/// Placeholder replaced with the granted port in args and shell lines
pub const PORT_PLACEHOLDER: &str = "<PORT>";

/// Windows package-manager shims that resolve to `.cmd` wrappers
#[cfg(windows)]
const CMD_SHIMS: &[&str] = &["npm", "npx", "pnpm", "yarn", "corepack"];

/// How a service process is launched
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Invocation {
    /// Run through the platform shell
    Shell(String),

    /// Exec a program with arguments directly
    Argv { program: String, args: Vec<String> },

    /// A Windows `.cmd` shim resolved via `cmd.exe /c`
    CmdFile { name: String, args: Vec<String> },
}

impl Invocation {
    /// Build from a manifest command + args pair.
    ///
    /// A bare command line with spaces but no shell syntax is split into
    /// an argv so the child is exec'd directly; anything with shell
    /// operators goes through the shell.
    pub fn from_parts(command: &str, args: &[String]) -> Self {
        if args.is_empty() && command.contains(char::is_whitespace) {
            if command.contains(['|', '&', ';', '<', '>', '$', '`', '*', '(', ')']) {
                return Invocation::Shell(command.to_string());
            }
            return match shell_words::split(command) {
                Ok(mut argv) if !argv.is_empty() => {
                    let program = argv.remove(0);
                    Invocation::Argv { program, args: argv }
                }
                _ => Invocation::Shell(command.to_string()),
            };
        }

        #[cfg(windows)]
        if CMD_SHIMS.contains(&command) {
            return Invocation::CmdFile {
                name: command.to_string(),
                args: args.to_vec(),
            };
        }

        Invocation::Argv {
            program: command.to_string(),
            args: args.to_vec(),
        }
    }

    /// Substitute the `<PORT>` placeholder everywhere it appears
    pub fn substitute_port(&mut self, port: u16) {
        let value = port.to_string();
        match self {
            Invocation::Shell(line) => {
                *line = line.replace(PORT_PLACEHOLDER, &value);
            }
            Invocation::Argv { args, .. } | Invocation::CmdFile { args, .. } => {
                for arg in args.iter_mut() {
                    *arg = arg.replace(PORT_PLACEHOLDER, &value);
                }
            }
        }
    }

    /// Resolve to a tokio command ready for spawning
    pub fn to_command(&self) -> tokio::process::Command {
        match self {
            Invocation::Shell(line) => {
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
            Invocation::Argv { program, args } => {
                let mut cmd = tokio::process::Command::new(program);
                cmd.args(args);
                cmd
            }
            Invocation::CmdFile { name, args } => {
                #[cfg(windows)]
                {
                    let mut cmd = tokio::process::Command::new("cmd.exe");
                    cmd.arg("/C").arg(name).args(args);
                    cmd
                }
                #[cfg(unix)]
                {
                    let mut cmd = tokio::process::Command::new(name);
                    cmd.args(args);
                    cmd
                }
            }
        }
    }

    /// Human-readable command line for logs and error reports
    pub fn describe(&self) -> String {
        match self {
            Invocation::Shell(line) => line.clone(),
            Invocation::Argv { program, args } | Invocation::CmdFile { name: program, args } => {
                if args.is_empty() {
                    program.clone()
                } else {
                    format!("{} {}", program, args.join(" "))
                }
            }
        }
    }
}

/// Resolve a service's invocation: the explicit manifest command, or a
/// framework convention inferred from the language tag and project layout.
pub fn resolve_invocation(
    spec: &ServiceSpec,
    project_dir: &Path,
) -> Result<Invocation, CommandError> {
    if let Some(command) = &spec.command {
        let args = spec.args.clone().unwrap_or_default();
        return Ok(Invocation::from_parts(command, &args));
    }

    infer_invocation(&spec.language, project_dir, spec.mode).ok_or_else(|| {
        CommandError::NoCommand {
            language: spec.language.clone(),
            project: project_dir.display().to_string(),
        }
    })
}

/// Framework-convention inference for services without an explicit command
fn infer_invocation(language: &str, project_dir: &Path, mode: ServiceMode) -> Option<Invocation> {
    match language {
        "node" | "javascript" | "typescript" => {
            // Prefer the dev script for watch mode, else start
            let script = if mode == ServiceMode::Watch && has_npm_script(project_dir, "dev") {
                "dev"
            } else if has_npm_script(project_dir, "start") {
                "start"
            } else if has_npm_script(project_dir, "dev") {
                "dev"
            } else {
                return None;
            };
            if script == "start" {
                Some(Invocation::from_parts("npm", &["start".to_string()]))
            } else {
                Some(Invocation::from_parts(
                    "npm",
                    &["run".to_string(), script.to_string()],
                ))
            }
        }
        "python" => {
            if project_dir.join("manage.py").exists() {
                Some(Invocation::Shell(
                    "python3 manage.py runserver 0.0.0.0:<PORT>".to_string(),
                ))
            } else if project_dir.join("app.py").exists() {
                Some(Invocation::from_parts("python3", &["app.py".to_string()]))
            } else if project_dir.join("main.py").exists() {
                Some(Invocation::from_parts("python3", &["main.py".to_string()]))
            } else {
                None
            }
        }
        "dotnet" | "csharp" => Some(Invocation::from_parts("dotnet", &["run".to_string()])),
        "go" => Some(Invocation::from_parts(
            "go",
            &["run".to_string(), ".".to_string()],
        )),
        _ => None,
    }
}

fn has_npm_script(project_dir: &Path, script: &str) -> bool {
    let Ok(content) = std::fs::read_to_string(project_dir.join("package.json")) else {
        return false;
    };
    let Ok(json) = serde_json::from_str::<serde_json::Value>(&content) else {
        return false;
    };
    json.get("scripts")
        .and_then(|s| s.get(script))
        .is_some()
}

/// Errors resolving a service command
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("Service in {project} has no command and no {language} convention applies")]
    NoCommand { language: String, project: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_parts_argv() {
        let inv = Invocation::from_parts("node", &["server.js".to_string()]);
        assert_eq!(
            inv,
            Invocation::Argv {
                program: "node".into(),
                args: vec!["server.js".into()],
            }
        );
    }

    #[test]
    fn test_bare_command_line_is_split() {
        let inv = Invocation::from_parts("npm run dev", &[]);
        assert_eq!(
            inv,
            Invocation::Argv {
                program: "npm".into(),
                args: vec!["run".into(), "dev".into()],
            }
        );
    }

    #[test]
    fn test_shell_syntax_stays_shell() {
        let inv = Invocation::from_parts("sleep 1 && echo up", &[]);
        assert_eq!(inv, Invocation::Shell("sleep 1 && echo up".into()));
    }

    #[test]
    fn test_port_substitution() {
        let mut inv = Invocation::Argv {
            program: "node".into(),
            args: vec!["server.js".into(), "--port".into(), "<PORT>".into()],
        };
        inv.substitute_port(4123);
        match inv {
            Invocation::Argv { args, .. } => assert_eq!(args[2], "4123"),
            other => panic!("unexpected {:?}", other),
        }

        let mut shell = Invocation::Shell("serve -p <PORT>".into());
        shell.substitute_port(3000);
        assert_eq!(shell, Invocation::Shell("serve -p 3000".into()));
    }

    #[test]
    fn test_describe() {
        let inv = Invocation::from_parts("node", &["server.js".to_string()]);
        assert_eq!(inv.describe(), "node server.js");
    }

    #[test]
    fn test_infer_node_start_script() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("package.json"),
            r#"{"scripts": {"start": "node server.js"}}"#,
        )
        .unwrap();

        let inv = infer_invocation("node", dir.path(), ServiceMode::Daemon).unwrap();
        assert_eq!(inv.describe(), "npm start");
    }

    #[test]
    fn test_infer_python_entrypoint() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("main.py"), "").unwrap();

        let inv = infer_invocation("python", dir.path(), ServiceMode::Daemon).unwrap();
        assert_eq!(inv.describe(), "python3 main.py");
    }

    #[test]
    fn test_unknown_language_has_no_convention() {
        let dir = tempfile::tempdir().unwrap();
        assert!(infer_invocation("cobol", dir.path(), ServiceMode::Daemon).is_none());
    }
}
