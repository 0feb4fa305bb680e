//! Pipeline engine - provisions one environment and runs a pipeline's
//! steps in order inside it

use super::executor::{ExecutionResult, StepExecutor};
use crate::core::{
    context::RunContext,
    error::ProvisionError,
    pipeline::Pipeline,
    state::{JobResult, PipelineStatus, ProvisionOutcome, StepOutcome},
    step::{normalize_name, StepKind},
};
use crate::environment::{provision_with_retry, ProvisionPolicy, Provisioner, Sandbox};
use chrono::Utc;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Events that can occur during a pipeline run
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    PipelineStarted {
        run_id: Uuid,
        pipeline: String,
        code_ref: String,
    },
    ProvisionFailed {
        pipeline: String,
        error: String,
        attempts: u32,
    },
    StepStarted {
        pipeline: String,
        index: usize,
        label: String,
    },
    StepCompleted {
        pipeline: String,
        index: usize,
        duration_ms: u64,
    },
    StepFailed {
        pipeline: String,
        index: usize,
        error: String,
    },
    StepSkipped {
        pipeline: String,
        index: usize,
    },
    PipelineCompleted {
        pipeline: String,
        status: PipelineStatus,
    },
    PipelineCancelled {
        pipeline: String,
    },
}

/// Type for event handlers
pub type EventHandler = Arc<dyn Fn(ExecutionEvent) + Send + Sync>;

/// How a run ended
#[derive(Debug, Clone)]
pub enum RunOutcome {
    Completed(JobResult),
    /// Superseded or interrupted; records no result
    Cancelled { pipeline: String },
}

/// Owns a provisioned sandbox for the length of a run. If the run unwinds
/// or its task is aborted before [`SandboxGuard::discard`] is reached, the
/// sandbox is torn down from a spawned task instead.
struct SandboxGuard {
    sandbox: Arc<dyn Sandbox>,
    discarded: AtomicBool,
}

impl SandboxGuard {
    fn new(sandbox: Box<dyn Sandbox>) -> Self {
        Self {
            sandbox: Arc::from(sandbox),
            discarded: AtomicBool::new(false),
        }
    }

    async fn discard(&self) {
        if !self.discarded.swap(true, Ordering::SeqCst) {
            self.sandbox.discard().await;
        }
    }
}

impl Deref for SandboxGuard {
    type Target = dyn Sandbox;

    fn deref(&self) -> &Self::Target {
        self.sandbox.as_ref()
    }
}

impl Drop for SandboxGuard {
    fn drop(&mut self) {
        if self.discarded.load(Ordering::SeqCst) {
            return;
        }
        let sandbox = self.sandbox.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(sandbox = %sandbox.id(), "Run ended without teardown, discarding sandbox");
                handle.spawn(async move { sandbox.discard().await });
            }
            Err(_) => error!(sandbox = %sandbox.id(), "No runtime left to discard sandbox"),
        }
    }
}

/// Runs a single pipeline from provisioning to teardown
pub struct PipelineEngine {
    provisioner: Arc<dyn Provisioner>,
    policy: ProvisionPolicy,
    event_handlers: Vec<EventHandler>,
}

impl PipelineEngine {
    pub fn new(provisioner: Arc<dyn Provisioner>) -> Self {
        Self {
            provisioner,
            policy: ProvisionPolicy::default(),
            event_handlers: Vec::new(),
        }
    }

    pub fn with_policy(mut self, policy: ProvisionPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Add an event handler
    pub fn add_event_handler<F>(&mut self, handler: F)
    where
        F: Fn(ExecutionEvent) + Send + Sync + 'static,
    {
        self.event_handlers.push(Arc::new(handler));
    }

    fn emit_event(&self, event: ExecutionEvent) {
        for handler in &self.event_handlers {
            handler(event.clone());
        }
    }

    /// Execute the entire pipeline
    pub async fn run(
        &self,
        pipeline: &Pipeline,
        ctx: RunContext,
        cancel: &CancellationToken,
    ) -> RunOutcome {
        let started_at = Utc::now();
        info!(
            pipeline = %pipeline.name,
            run_id = %ctx.run_id,
            code_ref = %ctx.code_ref,
            "Starting pipeline run"
        );
        self.emit_event(ExecutionEvent::PipelineStarted {
            run_id: ctx.run_id,
            pipeline: pipeline.name.clone(),
            code_ref: ctx.code_ref.clone(),
        });

        if cancel.is_cancelled() {
            return self.cancelled(pipeline);
        }

        if let Err(reason) = check_uninstall_precedes_install(pipeline, &ctx.core_name) {
            error!(pipeline = %pipeline.name, %reason, "Refusing to run pipeline");
            return self.finish(
                pipeline,
                &ctx,
                ProvisionOutcome::Failed {
                    error: ProvisionError::Aborted(reason),
                    attempts: 0,
                },
                skip_all(pipeline),
                started_at,
            );
        }

        let (provisioned, attempts) = provision_with_retry(
            self.provisioner.as_ref(),
            &pipeline.environment,
            &ctx,
            self.policy,
            cancel,
        )
        .await;

        let sandbox = match provisioned {
            Ok(sandbox) => SandboxGuard::new(sandbox),
            Err(ProvisionError::Cancelled) => return self.cancelled(pipeline),
            Err(error) => {
                warn!(pipeline = %pipeline.name, %error, attempts, "Provisioning failed");
                self.emit_event(ExecutionEvent::ProvisionFailed {
                    pipeline: pipeline.name.clone(),
                    error: error.to_string(),
                    attempts,
                });
                return self.finish(
                    pipeline,
                    &ctx,
                    ProvisionOutcome::Failed { error, attempts },
                    skip_all(pipeline),
                    started_at,
                );
            }
        };

        let provision = ProvisionOutcome::Ready {
            environment: format!("{} ({})", pipeline.environment.describe(), sandbox.id()),
            attempts,
        };

        let executor = StepExecutor::new(&*sandbox, &ctx);
        let mut outcomes: Vec<StepOutcome> = Vec::with_capacity(pipeline.steps.len());
        let mut failed = false;

        for step in &pipeline.steps {
            if failed {
                self.emit_event(ExecutionEvent::StepSkipped {
                    pipeline: pipeline.name.clone(),
                    index: step.index,
                });
                outcomes.push(StepOutcome::skipped(step.index, step.kind, &step.target));
                continue;
            }

            if cancel.is_cancelled() {
                sandbox.discard().await;
                return self.cancelled(pipeline);
            }

            self.emit_event(ExecutionEvent::StepStarted {
                pipeline: pipeline.name.clone(),
                index: step.index,
                label: step.label(),
            });

            let outcome = match executor.execute(step, cancel).await {
                ExecutionResult::Finished(outcome) => outcome,
                ExecutionResult::Cancelled => {
                    sandbox.discard().await;
                    return self.cancelled(pipeline);
                }
            };

            match outcome.failure() {
                Some(failure) => {
                    failed = true;
                    self.emit_event(ExecutionEvent::StepFailed {
                        pipeline: pipeline.name.clone(),
                        index: step.index,
                        error: failure.describe(),
                    });
                }
                None => self.emit_event(ExecutionEvent::StepCompleted {
                    pipeline: pipeline.name.clone(),
                    index: step.index,
                    duration_ms: outcome.duration_ms().unwrap_or(0),
                }),
            }
            outcomes.push(outcome);
        }

        sandbox.discard().await;
        self.finish(pipeline, &ctx, provision, outcomes, started_at)
    }

    fn finish(
        &self,
        pipeline: &Pipeline,
        ctx: &RunContext,
        provision: ProvisionOutcome,
        steps: Vec<StepOutcome>,
        started_at: chrono::DateTime<Utc>,
    ) -> RunOutcome {
        let result = JobResult {
            run_id: ctx.run_id,
            pipeline: pipeline.name.clone(),
            code_ref: ctx.code_ref.clone(),
            provision,
            steps,
            started_at,
            finished_at: Utc::now(),
        };

        let status = result.status();
        info!(
            pipeline = %pipeline.name,
            %status,
            duration_ms = result.duration_ms(),
            "Pipeline finished"
        );
        self.emit_event(ExecutionEvent::PipelineCompleted {
            pipeline: pipeline.name.clone(),
            status,
        });
        RunOutcome::Completed(result)
    }

    fn cancelled(&self, pipeline: &Pipeline) -> RunOutcome {
        info!(pipeline = %pipeline.name, "Pipeline run cancelled");
        self.emit_event(ExecutionEvent::PipelineCancelled {
            pipeline: pipeline.name.clone(),
        });
        RunOutcome::Cancelled {
            pipeline: pipeline.name.clone(),
        }
    }
}

fn skip_all(pipeline: &Pipeline) -> Vec<StepOutcome> {
    pipeline
        .steps
        .iter()
        .map(|s| StepOutcome::skipped(s.index, s.kind, &s.target))
        .collect()
}

/// A pre-baked environment may already carry a published copy of the core
/// library; it has to be removed before the checkout is installed.
pub fn check_uninstall_precedes_install(pipeline: &Pipeline, core: &str) -> Result<(), String> {
    if !pipeline.environment.kind.requires_uninstall() {
        return Ok(());
    }
    let install_at = pipeline
        .steps
        .iter()
        .position(|s| s.kind == StepKind::InstallLocal);
    let core_key = normalize_name(core);
    let uninstall_at = pipeline
        .steps
        .iter()
        .position(|s| s.kind == StepKind::Uninstall && normalize_name(&s.target) == core_key);

    match (uninstall_at, install_at) {
        (Some(u), Some(i)) if u < i => Ok(()),
        _ => Err(format!(
            "pipeline '{}' runs in a pre-baked environment but does not uninstall '{}' before install_local",
            pipeline.name, core
        )),
    }
}
