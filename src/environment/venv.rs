//! Fresh environments: host build tooling plus a new virtual environment

use super::subprocess::{self, host_command, CommandOutput, CommandSpec};
use super::{provision_exec_error, Provisioner, Sandbox};
use crate::core::{
    context::RunContext,
    environment::EnvironmentSpec,
    error::{ExecError, ProvisionError},
    step::normalize_name,
};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const SETUP_TIMEOUT_SECS: u64 = 1800;

/// Installs the declared OS packages on the host, then creates a virtual
/// environment in a directory no other run uses
#[derive(Debug, Clone)]
pub struct VirtualEnvProvisioner {
    /// Host package install command; package names are appended
    system_install: Vec<String>,
    /// Parent of every per-run directory
    work_root: PathBuf,
}

impl VirtualEnvProvisioner {
    pub fn new(system_install: Vec<String>, work_root: PathBuf) -> Self {
        Self {
            system_install,
            work_root,
        }
    }

    /// Default root for per-run directories
    pub fn default_work_root() -> PathBuf {
        std::env::temp_dir().join("downstream")
    }

    async fn install_system_packages(
        &self,
        packages: &[String],
        cancel: &CancellationToken,
    ) -> Result<(), ProvisionError> {
        let Some((program, base_args)) = self.system_install.split_first() else {
            return Err(ProvisionError::SystemPackages {
                output: "no system install command configured".to_string(),
            });
        };

        info!(packages = %packages.join(" "), "Installing system packages");
        let mut command = Command::new(program);
        command.args(base_args).args(packages);
        let output = subprocess::run(command, program, SETUP_TIMEOUT_SECS, cancel)
            .await
            .map_err(|e| match e {
                ExecError::Cancelled => ProvisionError::Cancelled,
                other => ProvisionError::SystemPackages {
                    output: other.to_string(),
                },
            })?;

        if !output.success() {
            return Err(ProvisionError::SystemPackages {
                output: output.tail(10),
            });
        }
        Ok(())
    }

    async fn create_venv(
        &self,
        spec: &EnvironmentSpec,
        root: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), ProvisionError> {
        tokio::fs::create_dir_all(root)
            .await
            .map_err(|e| ProvisionError::Create(format!("{}: {}", root.display(), e)))?;

        let mut command = Command::new(&spec.base);
        command
            .args(["-m", "venv", "--system-site-packages"])
            .arg(root.join("venv"));
        let output = subprocess::run(command, &spec.base, SETUP_TIMEOUT_SECS, cancel)
            .await
            .map_err(provision_exec_error)?;

        if !output.success() {
            return Err(ProvisionError::Create(output.tail(10)));
        }
        Ok(())
    }
}

#[async_trait]
impl Provisioner for VirtualEnvProvisioner {
    async fn provision(
        &self,
        spec: &EnvironmentSpec,
        ctx: &RunContext,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn Sandbox>, ProvisionError> {
        if !spec.system_packages.is_empty() {
            self.install_system_packages(&spec.system_packages, cancel)
                .await?;
        }

        let root = self.work_root.join(ctx.slug());
        info!(pipeline = %ctx.pipeline, root = %root.display(), "Creating virtual environment");

        let sandbox = VenvSandbox::new(root.clone(), &ctx.core_name);
        let prepared = async {
            copy_checkout(&ctx.core_checkout, &sandbox.checkout_dir).await?;
            self.create_venv(spec, &root, cancel).await
        }
        .await;
        if let Err(e) = prepared {
            sandbox.discard().await;
            return Err(e);
        }

        Ok(Box::new(sandbox))
    }
}

/// A per-run directory holding the virtual environment, a private copy of
/// the core checkout and any clones
pub struct VenvSandbox {
    id: String,
    root: PathBuf,
    root_str: String,
    python: String,
    checkout_dir: PathBuf,
    checkout: String,
    bin_dir: PathBuf,
}

impl VenvSandbox {
    fn new(root: PathBuf, core_name: &str) -> Self {
        let bin_dir = root.join("venv").join("bin");
        let checkout_dir = root.join(format!("{}-checkout", normalize_name(core_name)));
        Self {
            id: root
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            root_str: root.display().to_string(),
            python: bin_dir.join("python").display().to_string(),
            checkout: checkout_dir.display().to_string(),
            checkout_dir,
            bin_dir,
            root,
        }
    }

    fn search_path(&self) -> String {
        match std::env::var_os("PATH") {
            Some(path) => {
                let mut entries = vec![self.bin_dir.clone()];
                entries.extend(std::env::split_paths(&path));
                std::env::join_paths(entries)
                    .map(|p| p.to_string_lossy().into_owned())
                    .unwrap_or_else(|_| self.bin_dir.display().to_string())
            }
            None => self.bin_dir.display().to_string(),
        }
    }
}

#[async_trait]
impl Sandbox for VenvSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    fn workdir(&self) -> &str {
        &self.root_str
    }

    fn python(&self) -> &str {
        &self.python
    }

    fn core_checkout(&self) -> &str {
        &self.checkout
    }

    async fn exec(
        &self,
        spec: &CommandSpec,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput, ExecError> {
        let mut command = host_command(spec, &self.root);
        command
            .env("VIRTUAL_ENV", self.root.join("venv"))
            .env("PATH", self.search_path())
            .env_remove("PYTHONHOME");
        debug!(sandbox = %self.id, command = %spec.display(), "exec");
        subprocess::run(command, &spec.program, spec.timeout_secs, cancel).await
    }

    async fn discard(&self) {
        match tokio::fs::remove_dir_all(&self.root).await {
            Ok(()) => debug!(root = %self.root.display(), "Environment removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(root = %self.root.display(), error = %e, "Failed to remove environment"),
        }
    }
}

/// Copy the core checkout into the run directory. pip builds in the source
/// tree, so installing from the host checkout would leave `build/` and
/// `*.egg-info` behind for every later run.
async fn copy_checkout(src: &Path, dst: &Path) -> Result<(), ProvisionError> {
    let (src, dst) = (src.to_path_buf(), dst.to_path_buf());
    debug!(from = %src.display(), to = %dst.display(), "Copying core checkout");
    tokio::task::spawn_blocking(move || copy_tree(&src, &dst))
        .await
        .map_err(|e| ProvisionError::Create(format!("checkout copy aborted: {}", e)))?
        .map_err(|e| ProvisionError::Create(format!("failed to copy core checkout: {}", e)))
}

fn copy_tree(src: &Path, dst: &Path) -> std::io::Result<()> {
    let src = std::fs::canonicalize(src)?;
    std::fs::create_dir_all(dst)?;
    let dst = std::fs::canonicalize(dst)?;

    // The run directory may itself live inside the checkout
    let walker = walkdir::WalkDir::new(&src)
        .into_iter()
        .filter_entry(|e| !e.path().starts_with(&dst));

    for entry in walker {
        let entry = entry?;
        let rel = entry
            .path()
            .strip_prefix(&src)
            .map_err(std::io::Error::other)?;
        let target = dst.join(rel);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            std::fs::create_dir_all(&target)?;
            continue;
        }
        #[cfg(unix)]
        if file_type.is_symlink() {
            std::os::unix::fs::symlink(std::fs::read_link(entry.path())?, &target)?;
            continue;
        }
        std::fs::copy(entry.path(), &target)?;
    }
    Ok(())
}
