//! Pre-baked environments: one throwaway container per pipeline run

use super::subprocess::{self, CommandOutput, CommandSpec};
use super::{provision_exec_error, Provisioner, Sandbox};
use crate::core::{
    context::RunContext,
    environment::EnvironmentSpec,
    error::{ExecError, ProvisionError},
};
use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const CONTAINER_WORKDIR: &str = "/work";
const PULL_TIMEOUT_SECS: u64 = 1800;
const SETUP_TIMEOUT_SECS: u64 = 600;

/// Starts a container from the environment's image and copies the core
/// library's checkout into it
#[derive(Debug, Clone)]
pub struct ContainerProvisioner {
    /// Container CLI, `docker` unless overridden
    runtime: String,
}

impl Default for ContainerProvisioner {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl ContainerProvisioner {
    pub fn new(runtime: impl Into<String>) -> Self {
        Self {
            runtime: runtime.into(),
        }
    }

    async fn runtime_cmd(
        &self,
        args: &[&str],
        timeout_secs: u64,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput, ExecError> {
        let mut command = Command::new(&self.runtime);
        command.args(args);
        subprocess::run(command, &self.runtime, timeout_secs, cancel).await
    }

    async fn remove(&self, name: &str) {
        let cancel = CancellationToken::new();
        match self
            .runtime_cmd(&["rm", "-f", name], SETUP_TIMEOUT_SECS, &cancel)
            .await
        {
            Ok(output) if output.success() => debug!(container = name, "Container removed"),
            Ok(output) => warn!(container = name, error = %output.tail(5), "Failed to remove container"),
            Err(e) => warn!(container = name, error = %e, "Failed to remove container"),
        }
    }

    async fn start(
        &self,
        spec: &EnvironmentSpec,
        ctx: &RunContext,
        name: &str,
        checkout: &str,
        cancel: &CancellationToken,
    ) -> Result<(), ProvisionError> {
        let run = self
            .runtime_cmd(
                &[
                    "run", "-d", "--name", name, "-w", CONTAINER_WORKDIR, &spec.base, "sleep",
                    "infinity",
                ],
                SETUP_TIMEOUT_SECS,
                cancel,
            )
            .await
            .map_err(provision_exec_error)?;
        if !run.success() {
            return Err(ProvisionError::Create(run.tail(10)));
        }

        // Copy rather than mount so no two runs ever share build artefacts
        let source = format!("{}/.", ctx.core_checkout.display());
        let destination = format!("{}:{}", name, checkout);
        let copy = self
            .runtime_cmd(&["cp", &source, &destination], SETUP_TIMEOUT_SECS, cancel)
            .await
            .map_err(provision_exec_error)?;
        if !copy.success() {
            return Err(ProvisionError::Create(format!(
                "copying {} into container: {}",
                ctx.core_checkout.display(),
                copy.tail(10)
            )));
        }

        if !spec.system_packages.is_empty() {
            let script = format!(
                "apt-get update && apt-get install -y --no-install-recommends {}",
                spec.system_packages.join(" ")
            );
            let install = self
                .runtime_cmd(&["exec", name, "sh", "-c", &script], SETUP_TIMEOUT_SECS, cancel)
                .await
                .map_err(provision_exec_error)?;
            if !install.success() {
                return Err(ProvisionError::SystemPackages {
                    output: install.tail(10),
                });
            }
        }

        Ok(())
    }
}

#[async_trait]
impl Provisioner for ContainerProvisioner {
    async fn provision(
        &self,
        spec: &EnvironmentSpec,
        ctx: &RunContext,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn Sandbox>, ProvisionError> {
        info!(pipeline = %ctx.pipeline, image = %spec.base, "Pulling image");
        let pull = self
            .runtime_cmd(&["pull", &spec.base], PULL_TIMEOUT_SECS, cancel)
            .await
            .map_err(provision_exec_error)?;
        if !pull.success() {
            return Err(ProvisionError::ImagePull {
                image: spec.base.clone(),
                output: pull.tail(10),
            });
        }

        let name = ctx.slug();
        let checkout = format!("{}/{}-checkout", CONTAINER_WORKDIR, ctx.core_name);

        if let Err(e) = self.start(spec, ctx, &name, &checkout, cancel).await {
            self.remove(&name).await;
            return Err(e);
        }

        Ok(Box::new(ContainerSandbox {
            runtime: self.clone(),
            name,
            python: spec.python().to_string(),
            checkout,
        }))
    }
}

/// A running container
pub struct ContainerSandbox {
    runtime: ContainerProvisioner,
    name: String,
    python: String,
    checkout: String,
}

impl ContainerSandbox {
    fn exec_args(&self, spec: &CommandSpec) -> Vec<String> {
        let cwd = match &spec.cwd {
            Some(dir) if dir.starts_with('/') => dir.clone(),
            Some(dir) => format!("{}/{}", CONTAINER_WORKDIR, dir),
            None => CONTAINER_WORKDIR.to_string(),
        };

        let mut args = vec!["exec".to_string(), "-w".to_string(), cwd];
        for (key, value) in &spec.env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }
        args.push(self.name.clone());
        args.push(spec.program.clone());
        args.extend(spec.args.iter().cloned());
        args
    }
}

#[async_trait]
impl Sandbox for ContainerSandbox {
    fn id(&self) -> &str {
        &self.name
    }

    fn workdir(&self) -> &str {
        CONTAINER_WORKDIR
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
        let mut command = Command::new(&self.runtime.runtime);
        command.args(self.exec_args(spec));
        debug!(container = %self.name, command = %spec.display(), "exec");
        subprocess::run(command, &spec.program, spec.timeout_secs, cancel).await
    }

    async fn discard(&self) {
        self.runtime.remove(&self.name).await;
    }
}
