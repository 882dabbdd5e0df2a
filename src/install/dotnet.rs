//! .NET dependency restore

use std::path::Path;

use tokio_util::sync::CancellationToken;
use tracing::info;

use super::failure::{classify, InstallFailure};
use super::runner::run_manager;
use super::InstallOutcome;

/// Whether the directory holds a restorable .NET project
fn has_project_file(project_dir: &Path) -> bool {
    let Ok(entries) = std::fs::read_dir(project_dir) else {
        return false;
    };
    entries.flatten().any(|entry| {
        entry
            .path()
            .extension()
            .map(|ext| ext == "csproj" || ext == "fsproj" || ext == "sln")
            .unwrap_or(false)
    })
}

/// Restore NuGet packages for one project
pub async fn install(
    project_dir: &Path,
    token: &CancellationToken,
) -> Result<InstallOutcome, InstallFailure> {
    if !has_project_file(project_dir) {
        return Ok(InstallOutcome::Skipped("no .NET project file".into()));
    }

    let args = ["restore", "--nologo"];
    let output = run_manager("dotnet", &args, project_dir, token).await?;
    if !output.success {
        return Err(classify(
            "dotnet",
            "dotnet restore --nologo",
            project_dir,
            output.exit_code,
            &output.stderr,
        ));
    }

    info!("{}: dotnet restore complete", project_dir.display());
    Ok(InstallOutcome::Installed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_no_project_file_skips() {
        let dir = tempfile::tempdir().unwrap();
        let token = CancellationToken::new();

        let outcome = install(dir.path(), &token).await.unwrap();
        assert!(matches!(outcome, InstallOutcome::Skipped(_)));
    }

    #[test]
    fn test_project_file_detection() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!has_project_file(dir.path()));

        std::fs::write(dir.path().join("app.csproj"), "<Project/>").unwrap();
        assert!(has_project_file(dir.path()));
    }
}
