//! Step executor - runs individual steps inside a sandbox

use super::installer::{self, Layout};
use super::test_runner;
use crate::core::{
    context::{RunContext, Variables},
    error::ExecError,
    state::{Failure, StepOutcome, StepStatus},
    step::{Step, StepKind},
};
use crate::environment::{CommandOutput, CommandSpec, Sandbox};
use chrono::Utc;
use std::collections::BTreeMap;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Result of executing a step
#[derive(Debug, Clone)]
pub enum ExecutionResult {
    /// The step ran to completion, successfully or not
    Finished(StepOutcome),
    /// The run was cancelled while the step was in flight
    Cancelled,
}

/// Executes the steps of one run inside that run's sandbox
pub struct StepExecutor<'a> {
    sandbox: &'a dyn Sandbox,
    layout: Layout,
    vars: Variables,
    env: BTreeMap<String, String>,
}

impl<'a> StepExecutor<'a> {
    pub fn new(sandbox: &'a dyn Sandbox, ctx: &RunContext) -> Self {
        let layout = Layout::of(sandbox, &ctx.core_name);
        let mut vars = layout.variables(&ctx.code_ref);

        // Pipeline env values may themselves reference the built-in placeholders
        let env: BTreeMap<String, String> = ctx
            .env
            .iter()
            .map(|(k, v)| (k.clone(), vars.render(v)))
            .collect();
        vars.extend(&env);

        Self {
            sandbox,
            layout,
            vars,
            env,
        }
    }

    /// Commands the step would run, without running them
    pub fn plan(&self, step: &Step) -> Vec<CommandSpec> {
        let commands = match step.kind {
            StepKind::RunTests => {
                vec![test_runner::test_command(step, &self.layout, &self.vars)]
            }
            _ => installer::install_commands(step, &self.layout, &self.vars),
        };
        commands.into_iter().map(|c| c.with_env(&self.env)).collect()
    }

    /// Execute a step and return its outcome
    pub async fn execute(&self, step: &Step, cancel: &CancellationToken) -> ExecutionResult {
        info!(step = step.index, kind = %step.kind, target = %step.target, "Executing step");

        let started_at = Utc::now();
        let started = Instant::now();
        let mut stdout = String::new();
        let mut stderr = String::new();
        let mut exit_code = None;
        let mut failure = None;

        for command in self.plan(step) {
            let elapsed = started.elapsed().as_secs();
            let remaining = step.timeout_secs.saturating_sub(elapsed).max(1);
            let command = command.with_timeout(remaining);
            debug!(step = step.index, command = %command.display(), "Running command");

            match self.sandbox.exec(&command, cancel).await {
                Ok(output) => {
                    append(&mut stdout, &output.stdout);
                    append(&mut stderr, &output.stderr);
                    exit_code = output.exit_code;
                    if let Some(f) = self.classify(step, &output) {
                        failure = Some(f);
                        break;
                    }
                }
                Err(ExecError::Cancelled) => {
                    info!(step = step.index, "Step cancelled");
                    return ExecutionResult::Cancelled;
                }
                Err(e) => {
                    append(&mut stderr, &e.to_string());
                    let e = match e {
                        ExecError::Timeout(_) => ExecError::Timeout(step.timeout_secs),
                        other => other,
                    };
                    failure = Some(match step.kind {
                        StepKind::RunTests => test_runner::classify_exec_error(&e),
                        _ => Failure::Install(installer::classify_exec_error(step, &e)),
                    });
                    break;
                }
            }
        }

        let status = match failure {
            None => {
                info!(step = step.index, kind = %step.kind, "Step succeeded");
                StepStatus::Succeeded
            }
            Some(failure) => {
                warn!(
                    step = step.index,
                    kind = %step.kind,
                    target = %step.target,
                    failure = %failure.describe(),
                    "Step failed"
                );
                StepStatus::Failed { failure }
            }
        };

        ExecutionResult::Finished(StepOutcome {
            index: step.index,
            kind: step.kind,
            target: step.target.clone(),
            status,
            exit_code,
            stdout,
            stderr,
            started_at: Some(started_at),
            finished_at: Some(Utc::now()),
        })
    }

    fn classify(&self, step: &Step, output: &CommandOutput) -> Option<Failure> {
        match step.kind {
            StepKind::RunTests => test_runner::classify_output(output),
            _ if output.success() => None,
            _ => Some(Failure::Install(installer::classify_output(step, output))),
        }
    }
}

fn append(buffer: &mut String, text: &str) {
    if text.is_empty() {
        return;
    }
    if !buffer.is_empty() && !buffer.ends_with('\n') {
        buffer.push('\n');
    }
    buffer.push_str(text);
}
