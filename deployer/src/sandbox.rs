use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use modelbay_common::deployment::Kind;
use modelbay_common::descriptor::{parse_requirements, Descriptor};
use modelbay_common::log::{InstanceLogger, LogSink};
use modelbay_common::storage::StorageManager;
use tokio::process::Command;
use tracing::instrument;
use uuid::Uuid;
use zip::ZipArchive;

use crate::bundler;
use crate::error::{Error, Result};

/// A provisioned sandbox: extracted app files, an isolated dependency
/// environment, and the interpreter/entry the spawn step must use.
pub struct Sandbox {
    pub dir: PathBuf,
    pub python: PathBuf,
    pub entry: PathBuf,
    pub logger: InstanceLogger,
}

/// Extract one half of a bundle into an isolated directory and build its
/// dependency environment.
///
/// Dependency installation is sequential and best-effort so that partial
/// environments remain inspectable; only extraction and environment creation
/// are fatal.
#[allow(clippy::too_many_arguments)]
#[instrument(skip(storage, sink, descriptor, bundle_path), fields(%model, %kind, %instance_id))]
pub async fn provision(
    storage: &StorageManager,
    sink: Option<Arc<dyn LogSink>>,
    python_bin: &str,
    model: &str,
    bundle_path: &Path,
    descriptor: &Descriptor,
    kind: Kind,
    instance_id: Uuid,
    port: u16,
) -> Result<Sandbox> {
    let dir = storage.sandbox_path(model, kind, &instance_id)?;
    let logger = InstanceLogger::new(dir.join("app.log"), format!("{model}:{instance_id}"), sink);

    logger
        .append(format!("Setting up {kind} for {model} on port {port}"))
        .await;
    logger
        .append(format!("Application directory: {}", dir.display()))
        .await;

    extract_half(bundle_path, kind, &dir).await?;

    let mut augmented = descriptor.clone();
    augmented.instance_id = Some(instance_id);
    augmented.app_type = Some(kind);
    augmented.port = Some(port);
    augmented.deployed_at = Some(chrono::Utc::now());
    augmented.app_dir = Some(dir.clone());
    let json = augmented
        .to_pretty_json()
        .map_err(|err| Error::SandboxFailure(format!("could not serialize descriptor: {err}")))?;
    tokio::fs::write(dir.join("descriptor.json"), json).await?;

    let venv = dir.join("venv");
    logger.append("Creating virtual environment").await;
    let created = Command::new(python_bin)
        .arg("-m")
        .arg("venv")
        .arg(&venv)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|err| Error::SandboxFailure(format!("could not run {python_bin}: {err}")))?;
    if !created.status.success() {
        let stderr = String::from_utf8_lossy(&created.stderr);
        logger
            .append(format!("Environment creation failed: {}", stderr.trim()))
            .await;
        return Err(Error::SandboxFailure(format!(
            "venv creation exited with {}",
            created.status
        )));
    }

    let pip = venv_binary(&venv, "pip");
    run_best_effort(&logger, &pip, &["install", "--upgrade", "pip"]).await;

    let from_descriptor = descriptor.requirements.for_kind(kind);
    logger
        .append(format!(
            "Installing dependencies from descriptor ({} packages)",
            from_descriptor.len()
        ))
        .await;
    for requirement in from_descriptor {
        install(&logger, &pip, requirement).await;
    }

    // Entries shipped in the half's own requirements.txt that the descriptor
    // split does not already cover, pins intact.
    let requirements_file = dir.join("requirements.txt");
    if requirements_file.is_file() {
        let contents = tokio::fs::read_to_string(&requirements_file).await?;
        let extra: Vec<&str> = contents
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .filter(|line| {
                let name = parse_requirements(line).pop().unwrap_or_default();
                !from_descriptor.contains(&name)
            })
            .collect();
        if !extra.is_empty() {
            logger
                .append(format!(
                    "Installing {} additional packages from requirements.txt",
                    extra.len()
                ))
                .await;
            for requirement in extra {
                install(&logger, &pip, requirement).await;
            }
        }
    }

    let entry = resolve_entry(&dir, kind)?;
    logger
        .append(format!("Resolved entrypoint: {}", entry.display()))
        .await;

    Ok(Sandbox {
        python: venv_binary(&venv, "python"),
        entry,
        logger,
        dir,
    })
}

async fn extract_half(bundle_path: &Path, kind: Kind, dest: &Path) -> Result<()> {
    let bundle_path = bundle_path.to_path_buf();
    let dest = dest.to_path_buf();

    tokio::task::spawn_blocking(move || {
        let file = std::fs::File::open(&bundle_path)?;
        let archive = ZipArchive::new(file)?;
        bundler::unpack(archive, Some(kind.dir_name()), &dest)
    })
    .await
    .expect("blocking extraction task panicked")
    .map_err(|err| Error::SandboxFailure(format!("bundle extraction failed: {err}")))
}

fn venv_binary(venv: &Path, binary: &str) -> PathBuf {
    if cfg!(windows) {
        venv.join("Scripts").join(format!("{binary}.exe"))
    } else {
        venv.join("bin").join(binary)
    }
}

async fn install(logger: &InstanceLogger, pip: &Path, requirement: &str) {
    logger.append(format!("Installing: {requirement}")).await;
    if run_best_effort(logger, pip, &["install", requirement]).await {
        logger
            .append(format!("Successfully installed: {requirement}"))
            .await;
    }
}

/// Run a sandbox command, logging failure instead of propagating it.
async fn run_best_effort(logger: &InstanceLogger, program: &Path, args: &[&str]) -> bool {
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await;

    match output {
        Ok(output) if output.status.success() => true,
        Ok(output) => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            logger
                .append(format!(
                    "Error running {} {}: {}",
                    program.display(),
                    args.join(" "),
                    stderr.trim()
                ))
                .await;
            false
        }
        Err(error) => {
            logger
                .append(format!("Could not run {}: {error}", program.display()))
                .await;
            false
        }
    }
}

fn resolve_entry(dir: &Path, kind: Kind) -> Result<PathBuf> {
    let app = dir.join("app.py");
    if app.is_file() {
        return Ok(app);
    }
    let fallback = dir.join(kind.fallback_entry());
    if fallback.is_file() {
        return Ok(fallback);
    }

    Err(Error::SandboxFailure(format!(
        "no app entrypoint in {}",
        dir.display()
    )))
}
