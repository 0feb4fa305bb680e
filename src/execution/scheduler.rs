//! Run scheduler - fans a resolved run out over its pipelines

use super::engine::{PipelineEngine, RunOutcome};
use super::supersede::SupersessionRegistry;
use crate::core::{
    context::RunContext,
    error::ProvisionError,
    pipeline::PipelineSet,
    state::{JobResult, ProvisionOutcome, StepOutcome},
    trigger::ResolvedRun,
};
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{error, info};

/// Strategy for scheduling pipeline execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedulingStrategy {
    /// One pipeline at a time, in name order
    Sequential,

    /// Every selected pipeline at once
    #[default]
    Parallel,

    /// At most N pipelines at once
    LimitedParallel(usize),
}

impl SchedulingStrategy {
    /// Concurrent pipelines allowed for a run of `pipelines` pipelines
    pub fn permits(&self, pipelines: usize) -> usize {
        match self {
            SchedulingStrategy::Sequential => 1,
            SchedulingStrategy::Parallel => pipelines.max(1),
            SchedulingStrategy::LimitedParallel(n) => (*n).max(1),
        }
    }
}

/// Runs the pipelines a trigger selected, each in its own task
pub struct RunScheduler {
    engine: Arc<PipelineEngine>,
    strategy: SchedulingStrategy,
    registry: Arc<SupersessionRegistry>,
}

impl RunScheduler {
    pub fn new(
        engine: Arc<PipelineEngine>,
        strategy: SchedulingStrategy,
        registry: Arc<SupersessionRegistry>,
    ) -> Self {
        Self {
            engine,
            strategy,
            registry,
        }
    }

    /// Execute every pipeline of a resolved run. Outcomes come back in the
    /// order the run lists its pipelines.
    pub async fn execute(&self, run: &ResolvedRun, set: &PipelineSet) -> Vec<RunOutcome> {
        let lease = self.registry.begin(&run.concurrency_key);
        let semaphore = Arc::new(Semaphore::new(self.strategy.permits(run.pipelines.len())));

        info!(
            key = %run.concurrency_key,
            code_ref = %run.code_ref,
            pipelines = run.pipelines.len(),
            strategy = ?self.strategy,
            "Scheduling run"
        );

        let mut handles = Vec::with_capacity(run.pipelines.len());
        for name in &run.pipelines {
            let Some(pipeline) = set.get(name).cloned() else {
                error!(pipeline = %name, "Resolved pipeline is not in the manifest");
                continue;
            };

            let ctx = RunContext::new(
                pipeline.name.clone(),
                run.code_ref.clone(),
                set.core.name.clone(),
                set.core.checkout.clone(),
            )
            .with_env(pipeline.env.clone());

            let engine = self.engine.clone();
            let semaphore = semaphore.clone();
            let cancel = lease.token().clone();

            let handle = tokio::spawn(async move {
                let _permit = tokio::select! {
                    _ = cancel.cancelled() => {
                        return RunOutcome::Cancelled { pipeline: pipeline.name.clone() };
                    }
                    permit = semaphore.acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => return RunOutcome::Cancelled { pipeline: pipeline.name.clone() },
                    },
                };
                engine.run(&pipeline, ctx, &cancel).await
            });
            handles.push((name.clone(), handle));
        }

        let mut outcomes = Vec::with_capacity(handles.len());
        for (name, handle) in handles {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(join_error) => {
                    error!(pipeline = %name, error = %join_error, "Pipeline task aborted");
                    aborted(&name, &run.code_ref, set, join_error.to_string())
                }
            };
            outcomes.push(outcome);
        }

        self.registry.finish(&lease);
        outcomes
    }
}

/// Result recorded for a pipeline whose task died before producing one
fn aborted(name: &str, code_ref: &str, set: &PipelineSet, reason: String) -> RunOutcome {
    let now = Utc::now();
    let steps = set
        .get(name)
        .map(|p| {
            p.steps
                .iter()
                .map(|s| StepOutcome::skipped(s.index, s.kind, &s.target))
                .collect()
        })
        .unwrap_or_default();

    RunOutcome::Completed(JobResult {
        run_id: uuid::Uuid::new_v4(),
        pipeline: name.to_string(),
        code_ref: code_ref.to_string(),
        provision: ProvisionOutcome::Failed {
            error: ProvisionError::Aborted(reason),
            attempts: 0,
        },
        steps,
        started_at: now,
        finished_at: now,
    })
}
