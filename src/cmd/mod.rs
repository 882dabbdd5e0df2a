//! CLI subcommands

pub mod health;
pub mod install;
pub mod logs;
pub mod ports;
pub mod reqs;
pub mod root;
pub mod status;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::Subcommand;
use tracing::warn;

use flotilla::config::{self, PortRange, Preferences};
use flotilla::manifest::Manifest;
use flotilla::ports::{AssignmentStore, JsonFileStore, MemoryStore, PortManager};
use flotilla::registry::Registry;

#[derive(Subcommand)]
pub enum Commands {
    /// Start all services and supervise them until interrupted
    #[command(alias = "start")]
    Run(root::RunArgs),

    /// Stop services recorded in the registry
    Stop(root::StopArgs),

    /// Restart services: stop what is recorded, then start again
    Restart(root::RestartArgs),

    /// Show service status from the registry
    Status(status::StatusArgs),

    /// Probe service health once, or continuously with --stream
    Health(health::HealthArgs),

    /// Tail a running service's captured output
    Logs(logs::LogsArgs),

    /// Install project dependencies without starting anything
    Install(install::InstallArgs),

    /// Check required tools, or write detected versions with --generate
    Reqs(reqs::ReqsArgs),

    /// Show or clean persisted port assignments
    Ports(ports::PortsArgs),
}

/// Run the selected subcommand; the return value is the process exit code
pub async fn dispatch(command: Commands, manifest_path: &Path) -> Result<i32> {
    match command {
        Commands::Run(args) => root::run(manifest_path, args).await,
        Commands::Stop(args) => root::stop(manifest_path, args).await,
        Commands::Restart(args) => root::restart(manifest_path, args).await,
        Commands::Status(args) => status::run(manifest_path, args).await,
        Commands::Health(args) => health::run(manifest_path, args).await,
        Commands::Logs(args) => logs::run(manifest_path, args).await,
        Commands::Install(args) => install::run(manifest_path, args).await,
        Commands::Reqs(args) => reqs::run(manifest_path, args).await,
        Commands::Ports(args) => ports::run(manifest_path, args).await,
    }
}

/// Everything most subcommands need
pub struct ProjectContext {
    pub manifest: Manifest,
    pub registry: Arc<Registry>,
    pub prefs: Preferences,
}

impl ProjectContext {
    /// Load the manifest and open the project registry
    pub fn load(manifest_path: &Path) -> Result<Self> {
        let manifest = Manifest::load(manifest_path)
            .with_context(|| format!("Loading manifest {}", manifest_path.display()))?;

        let prefs = Preferences::load().unwrap_or_else(|e| {
            warn!("Could not load preferences: {:#}; using defaults", e);
            Preferences::default()
        });

        let registry = Arc::new(Registry::open(
            manifest.name.clone(),
            registry_path(&manifest.root),
        )?);

        Ok(Self {
            manifest,
            registry,
            prefs,
        })
    }

    /// Build the cross-run port manager backed by the persistent store
    pub fn port_manager(&self) -> Arc<PortManager> {
        let store: Arc<dyn AssignmentStore> =
            match JsonFileStore::open(self.prefs.port_store_path()) {
                Ok(store) => Arc::new(store),
                Err(e) => {
                    warn!("Port store unavailable ({}); assignments will not persist", e);
                    Arc::new(MemoryStore::new())
                }
            };

        Arc::new(PortManager::new(
            PortRange::from_env(),
            store,
            self.prefs.clone(),
        ))
    }
}

/// Location of the per-project registry snapshot
pub fn registry_path(project_root: &Path) -> PathBuf {
    config::project_state_dir(project_root).join("registry.json")
}
