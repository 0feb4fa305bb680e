//! Execution environments
//!
//! A [`Provisioner`] turns an [`EnvironmentSpec`] into a [`Sandbox`]: an
//! isolated place where install and test commands run. Every pipeline run
//! gets its own sandbox, which is discarded when the run ends.

pub mod container;
pub mod subprocess;
pub mod venv;

use crate::core::{
    context::RunContext,
    environment::{EnvironmentKind, EnvironmentSpec},
    error::{ExecError, ProvisionError},
};
use async_trait::async_trait;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub use container::ContainerProvisioner;
pub use subprocess::{CommandOutput, CommandSpec};
pub use venv::VirtualEnvProvisioner;

/// An isolated environment owned by exactly one pipeline run
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Short identifier for logs (container name, directory name)
    fn id(&self) -> &str;

    /// Directory downstream projects are cloned into, as seen from inside
    fn workdir(&self) -> &str;

    /// Python interpreter inside the sandbox
    fn python(&self) -> &str;

    /// Working checkout of the core library, as seen from inside
    fn core_checkout(&self) -> &str;

    /// Run one command to completion
    async fn exec(
        &self,
        command: &CommandSpec,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput, ExecError>;

    /// Tear the sandbox down. Failures are logged, never raised.
    async fn discard(&self);
}

/// Creates sandboxes from environment specifications
#[async_trait]
pub trait Provisioner: Send + Sync {
    async fn provision(
        &self,
        spec: &EnvironmentSpec,
        ctx: &RunContext,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn Sandbox>, ProvisionError>;
}

/// Dispatches on environment kind: containers for pre-baked images,
/// virtual environments for fresh ones
pub struct DefaultProvisioner {
    container: ContainerProvisioner,
    venv: VirtualEnvProvisioner,
}

impl DefaultProvisioner {
    pub fn new(container: ContainerProvisioner, venv: VirtualEnvProvisioner) -> Self {
        Self { container, venv }
    }
}

#[async_trait]
impl Provisioner for DefaultProvisioner {
    async fn provision(
        &self,
        spec: &EnvironmentSpec,
        ctx: &RunContext,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn Sandbox>, ProvisionError> {
        match spec.kind {
            EnvironmentKind::PreBaked => self.container.provision(spec, ctx, cancel).await,
            EnvironmentKind::Fresh => self.venv.provision(spec, ctx, cancel).await,
        }
    }
}

/// Provisioning retry policy. Retries never apply to steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProvisionPolicy {
    /// Extra attempts after the first failure
    pub retries: u32,
    /// Base delay; attempt `n` waits `n * backoff`
    pub backoff: Duration,
}

impl Default for ProvisionPolicy {
    fn default() -> Self {
        Self {
            retries: 0,
            backoff: Duration::from_secs(10),
        }
    }
}

/// Provision with the given retry policy, returning the number of attempts made
pub async fn provision_with_retry(
    provisioner: &dyn Provisioner,
    spec: &EnvironmentSpec,
    ctx: &RunContext,
    policy: ProvisionPolicy,
    cancel: &CancellationToken,
) -> (Result<Box<dyn Sandbox>, ProvisionError>, u32) {
    let mut attempt = 0;
    loop {
        attempt += 1;
        let error = match provisioner.provision(spec, ctx, cancel).await {
            Ok(sandbox) => {
                info!(
                    pipeline = %ctx.pipeline,
                    sandbox = sandbox.id(),
                    attempt,
                    "Environment ready"
                );
                return (Ok(sandbox), attempt);
            }
            Err(e) => e,
        };

        if matches!(error, ProvisionError::Cancelled) || attempt > policy.retries {
            return (Err(error), attempt);
        }

        let delay = policy.backoff * attempt;
        warn!(
            pipeline = %ctx.pipeline,
            attempt,
            error = %error,
            delay_secs = delay.as_secs(),
            "Provisioning failed, retrying"
        );

        tokio::select! {
            _ = cancel.cancelled() => return (Err(ProvisionError::Cancelled), attempt),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// Map a command-level failure during provisioning onto the provision taxonomy
pub(crate) fn provision_exec_error(error: ExecError) -> ProvisionError {
    match error {
        ExecError::Cancelled => ProvisionError::Cancelled,
        other => ProvisionError::Create(other.to_string()),
    }
}
