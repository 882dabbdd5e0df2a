//! Python dependency installs: uv, poetry, or plain venv + pip
//!
//! Strategy order: `uv sync` (falling back to `uv venv` + `uv pip install`
//! when sync fails), `poetry install --no-root` (reusing the existing
//! virtualenv when poetry can name one), then `python3 -m venv` + pip.
//! Fallbacks are explicit decisions on results, never catch-all rescue.

use std::path::Path;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::failure::{classify, InstallFailure};
use super::runner::run_manager;
use super::InstallOutcome;

/// Which toolchain manages this project's dependencies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PythonStrategy {
    Uv,
    Poetry,
    Venv,
}

fn detect_strategy(project_dir: &Path) -> Option<PythonStrategy> {
    if project_dir.join("uv.lock").exists() {
        return Some(PythonStrategy::Uv);
    }
    if project_dir.join("poetry.lock").exists() {
        return Some(PythonStrategy::Poetry);
    }

    if let Ok(pyproject) = std::fs::read_to_string(project_dir.join("pyproject.toml")) {
        if pyproject.contains("[tool.uv") {
            return Some(PythonStrategy::Uv);
        }
        if pyproject.contains("[tool.poetry") {
            return Some(PythonStrategy::Poetry);
        }
        // A plain pyproject still needs an environment
        return Some(PythonStrategy::Uv);
    }

    if project_dir.join("requirements.txt").exists() {
        return Some(PythonStrategy::Venv);
    }

    None
}

/// Install dependencies for one Python project
pub async fn install(
    project_dir: &Path,
    token: &CancellationToken,
) -> Result<InstallOutcome, InstallFailure> {
    let Some(strategy) = detect_strategy(project_dir) else {
        return Ok(InstallOutcome::Skipped(
            "no pyproject.toml or requirements.txt".into(),
        ));
    };

    match strategy {
        PythonStrategy::Uv => install_uv(project_dir, token).await,
        PythonStrategy::Poetry => install_poetry(project_dir, token).await,
        PythonStrategy::Venv => install_venv(project_dir, token).await,
    }
}

async fn install_uv(
    project_dir: &Path,
    token: &CancellationToken,
) -> Result<InstallOutcome, InstallFailure> {
    let sync = run_manager("uv", &["sync", "--no-progress"], project_dir, token).await?;
    if sync.success {
        info!("{}: uv sync complete", project_dir.display());
        return Ok(InstallOutcome::Installed);
    }

    let sync_failure = classify(
        "uv",
        "uv sync --no-progress",
        project_dir,
        sync.exit_code,
        &sync.stderr,
    );

    // Fallback: a bare venv plus requirements, when there is one to install
    if !project_dir.join("requirements.txt").exists() {
        return Err(sync_failure);
    }
    warn!(
        "{}: uv sync failed, falling back to uv venv + pip",
        project_dir.display()
    );

    let venv = run_manager("uv", &["venv"], project_dir, token).await?;
    if !venv.success {
        return Err(sync_failure);
    }

    let pip = run_manager(
        "uv",
        &["pip", "install", "-r", "requirements.txt"],
        project_dir,
        token,
    )
    .await?;
    if !pip.success {
        return Err(classify(
            "uv",
            "uv pip install -r requirements.txt",
            project_dir,
            pip.exit_code,
            &pip.stderr,
        ));
    }

    info!("{}: uv venv install complete", project_dir.display());
    Ok(InstallOutcome::Installed)
}

async fn install_poetry(
    project_dir: &Path,
    token: &CancellationToken,
) -> Result<InstallOutcome, InstallFailure> {
    // Reuse the existing virtualenv when poetry can name one
    let env_info = run_manager("poetry", &["env", "info", "--path"], project_dir, token).await?;
    if env_info.success {
        debug!(
            "{}: reusing poetry env at {}",
            project_dir.display(),
            env_info.stdout.trim()
        );
    }

    let args = ["install", "--no-root", "--no-interaction"];
    let output = run_manager("poetry", &args, project_dir, token).await?;
    if !output.success {
        return Err(classify(
            "poetry",
            "poetry install --no-root --no-interaction",
            project_dir,
            output.exit_code,
            &output.stderr,
        ));
    }

    info!("{}: poetry install complete", project_dir.display());
    Ok(InstallOutcome::Installed)
}

async fn install_venv(
    project_dir: &Path,
    token: &CancellationToken,
) -> Result<InstallOutcome, InstallFailure> {
    if !project_dir.join(".venv").exists() {
        let venv = run_manager("python3", &["-m", "venv", ".venv"], project_dir, token).await?;
        if !venv.success {
            return Err(classify(
                "python",
                "python3 -m venv .venv",
                project_dir,
                venv.exit_code,
                &venv.stderr,
            ));
        }
    }

    let pip = venv_pip(project_dir);
    let args = [
        "install",
        "-r",
        "requirements.txt",
        "--disable-pip-version-check",
        "--prefer-binary",
    ];
    let output = run_manager(&pip, &args, project_dir, token).await?;
    if !output.success {
        return Err(classify(
            "pip",
            &format!("{} {}", pip, args.join(" ")),
            project_dir,
            output.exit_code,
            &output.stderr,
        ));
    }

    info!("{}: pip install complete", project_dir.display());
    Ok(InstallOutcome::Installed)
}

fn venv_pip(project_dir: &Path) -> String {
    #[cfg(windows)]
    {
        project_dir
            .join(".venv")
            .join("Scripts")
            .join("pip.exe")
            .display()
            .to_string()
    }
    #[cfg(not(windows))]
    {
        project_dir.join(".venv/bin/pip").display().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_detection() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(detect_strategy(dir.path()), None);

        std::fs::write(dir.path().join("requirements.txt"), "flask\n").unwrap();
        assert_eq!(detect_strategy(dir.path()), Some(PythonStrategy::Venv));

        std::fs::write(
            dir.path().join("pyproject.toml"),
            "[tool.poetry]\nname = \"x\"\n",
        )
        .unwrap();
        assert_eq!(detect_strategy(dir.path()), Some(PythonStrategy::Poetry));

        std::fs::write(dir.path().join("uv.lock"), "").unwrap();
        assert_eq!(detect_strategy(dir.path()), Some(PythonStrategy::Uv));
    }

    #[tokio::test]
    async fn test_no_manifest_skips() {
        let dir = tempfile::tempdir().unwrap();
        let token = CancellationToken::new();

        let outcome = install(dir.path(), &token).await.unwrap();
        assert!(matches!(outcome, InstallOutcome::Skipped(_)));
    }
}
