//! Parallel dependency installer
//!
//! Tasks for every distinct project directory run concurrently, with one
//! exception: pnpm tasks are serialized against each other because pnpm's
//! shared global content store races with itself. Each task reports a
//! structured outcome.

pub mod dotnet;
pub mod failure;
pub mod node;
pub mod python;
mod runner;

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub use failure::InstallFailure;
pub use node::NodeManager;

use crate::events::{Event, EventBus};
use crate::manifest::Manifest;

/// What kind of toolchain a task belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Node,
    Python,
    Dotnet,
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskKind::Node => write!(f, "node"),
            TaskKind::Python => write!(f, "python"),
            TaskKind::Dotnet => write!(f, "dotnet"),
        }
    }
}

/// One install task; the project directory is its identity
#[derive(Debug, Clone)]
pub struct InstallTask {
    pub project_dir: PathBuf,
    pub kind: TaskKind,
    /// Manager name for reporting (npm/pnpm/yarn/uv/poetry/pip/dotnet)
    pub manager: String,
}

/// Successful task result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallOutcome {
    Installed,
    Skipped(String),
}

/// Per-task report
#[derive(Debug)]
pub struct TaskReport {
    pub task: InstallTask,
    pub result: Result<InstallOutcome, InstallFailure>,
}

impl TaskReport {
    pub fn succeeded(&self) -> bool {
        self.result.is_ok()
    }
}

/// Runs install tasks with maximum safe parallelism
pub struct Installer {
    /// pnpm's global content store tolerates one writer
    pnpm_serial: Arc<Mutex<()>>,
    events: Option<EventBus>,
}

impl Installer {
    pub fn new() -> Self {
        Self {
            pnpm_serial: Arc::new(Mutex::new(())),
            events: None,
        }
    }

    /// Publish install lifecycle events
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Derive tasks from the manifest: one per distinct project directory
    /// that has something installable
    pub fn detect_tasks(manifest: &Manifest) -> Vec<InstallTask> {
        let mut seen: HashSet<PathBuf> = HashSet::new();
        let mut tasks = Vec::new();

        for spec in manifest.services.values() {
            let dir = manifest.project_dir(spec);
            if !seen.insert(dir.clone()) {
                continue;
            }

            if dir.join("package.json").exists() {
                let manager = node::detect_manager(&dir);
                tasks.push(InstallTask {
                    project_dir: dir,
                    kind: TaskKind::Node,
                    manager: manager.command().to_string(),
                });
            } else if dir.join("pyproject.toml").exists()
                || dir.join("requirements.txt").exists()
            {
                tasks.push(InstallTask {
                    project_dir: dir,
                    kind: TaskKind::Python,
                    manager: "python".to_string(),
                });
            } else if dir
                .read_dir()
                .map(|mut entries| {
                    entries.any(|e| {
                        e.map(|e| {
                            e.path()
                                .extension()
                                .map(|x| x == "csproj" || x == "fsproj" || x == "sln")
                                .unwrap_or(false)
                        })
                        .unwrap_or(false)
                    })
                })
                .unwrap_or(false)
            {
                tasks.push(InstallTask {
                    project_dir: dir,
                    kind: TaskKind::Dotnet,
                    manager: "dotnet".to_string(),
                });
            } else {
                debug!("{}: nothing to install", dir.display());
            }
        }

        tasks
    }

    /// Run every task. Tasks proceed concurrently except pnpm-vs-pnpm;
    /// cancellation is honored at task boundaries and in-flight tasks
    /// report their actual outcome.
    pub async fn run_all(
        &self,
        tasks: Vec<InstallTask>,
        token: &CancellationToken,
    ) -> Vec<TaskReport> {
        info!("Installing dependencies for {} project(s)", tasks.len());

        // Package managers are disk- and CPU-heavy; cap the fan-out at the
        // core count
        let limit = Arc::new(Semaphore::new(num_cpus::get().max(1)));

        let futures = tasks.into_iter().map(|task| {
            let pnpm_serial = self.pnpm_serial.clone();
            let token = token.clone();
            let events = self.events.clone();
            let limit = limit.clone();
            async move {
                let _permit = limit.acquire_owned().await;
                if let Some(events) = &events {
                    events.publish(Event::InstallStarted {
                        project: task.project_dir.display().to_string(),
                    });
                }

                let result = if token.is_cancelled() {
                    Err(InstallFailure::synthetic(
                        &task.manager,
                        &task.project_dir,
                        "install cancelled",
                    ))
                } else {
                    Self::run_task(&task, &pnpm_serial, &token).await
                };

                if let Some(events) = &events {
                    events.publish(Event::InstallCompleted {
                        project: task.project_dir.display().to_string(),
                        successful: result.is_ok(),
                    });
                }

                TaskReport { task, result }
            }
        });

        futures::future::join_all(futures).await
    }

    async fn run_task(
        task: &InstallTask,
        pnpm_serial: &Mutex<()>,
        token: &CancellationToken,
    ) -> Result<InstallOutcome, InstallFailure> {
        match task.kind {
            TaskKind::Node => {
                let manager = node::detect_manager(&task.project_dir);
                if manager == NodeManager::Pnpm {
                    // pnpm never overlaps another pnpm task
                    let _serial = pnpm_serial.lock().await;
                    node::install(&task.project_dir, manager, token).await
                } else {
                    node::install(&task.project_dir, manager, token).await
                }
            }
            TaskKind::Python => python::install(&task.project_dir, token).await,
            TaskKind::Dotnet => dotnet::install(&task.project_dir, token).await,
        }
    }
}

impl Default for Installer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[test]
    fn test_detect_tasks_dedupes_directories() {
        let dir = tempfile::tempdir().unwrap();
        let web = dir.path().join("web");
        std::fs::create_dir(&web).unwrap();
        std::fs::write(web.join("package.json"), "{}").unwrap();

        let yaml = format!(
            r#"
name: demo
services:
  web:
    language: node
    project: {web}
  worker:
    language: node
    project: {web}
"#,
            web = web.display()
        );
        let manifest = Manifest::from_str(&yaml).unwrap();

        let tasks = Installer::detect_tasks(&manifest);
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].kind, TaskKind::Node);
        assert_eq!(tasks[0].manager, "npm");
    }

    #[test]
    fn test_detect_python_project() {
        let dir = tempfile::tempdir().unwrap();
        let api = dir.path().join("api");
        std::fs::create_dir(&api).unwrap();
        std::fs::write(api.join("requirements.txt"), "flask\n").unwrap();

        let yaml = format!(
            "name: demo\nservices:\n  api:\n    language: python\n    project: {}\n",
            api.display()
        );
        let manifest = Manifest::from_str(&yaml).unwrap();

        let tasks = Installer::detect_tasks(&manifest);
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].kind, TaskKind::Python);
    }

    /// pnpm tasks must not overlap: measured by start/end intervals
    #[tokio::test]
    async fn test_pnpm_serialization() {
        let serial = Arc::new(Mutex::new(()));
        let intervals = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for _ in 0..5 {
            let serial = serial.clone();
            let intervals = intervals.clone();
            handles.push(tokio::spawn(async move {
                let _guard = serial.lock().await;
                let start = Instant::now();
                tokio::time::sleep(Duration::from_millis(30)).await;
                intervals.lock().push((start, Instant::now()));
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let intervals = intervals.lock();
        assert_eq!(intervals.len(), 5);
        for (i, (start_a, end_a)) in intervals.iter().enumerate() {
            for (start_b, end_b) in intervals.iter().skip(i + 1) {
                let overlaps = start_a < end_b && start_b < end_a;
                assert!(!overlaps, "pnpm tasks overlapped");
            }
        }
    }

    #[tokio::test]
    async fn test_cancelled_tasks_report() {
        let installer = Installer::new();
        let token = CancellationToken::new();
        token.cancel();

        let dir = tempfile::tempdir().unwrap();
        let reports = installer
            .run_all(
                vec![InstallTask {
                    project_dir: dir.path().to_path_buf(),
                    kind: TaskKind::Node,
                    manager: "npm".into(),
                }],
                &token,
            )
            .await;

        assert_eq!(reports.len(), 1);
        assert!(!reports[0].succeeded());
    }
}
