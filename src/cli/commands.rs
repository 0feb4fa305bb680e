//! CLI command definitions

use crate::core::trigger::TriggerEvent;
use crate::execution::SchedulingStrategy;
use anyhow::{Context, Result};
use clap::{ArgGroup, Args};
use std::path::PathBuf;

/// The event that starts a run
#[derive(Debug, Args, Clone, Default)]
#[command(group(
    ArgGroup::new("event")
        .args(["pull_request", "schedule", "git_ref", "event_file"])
        .multiple(false)
))]
pub struct EventArgs {
    /// Pull request number
    #[arg(long, value_name = "NUMBER", requires = "target_branch")]
    pub pull_request: Option<u64>,

    /// Source ref of the pull request (defaults to refs/pull/<N>/merge)
    #[arg(long, requires = "pull_request")]
    pub source_ref: Option<String>,

    /// Branch the pull request targets
    #[arg(long)]
    pub target_branch: Option<String>,

    /// Fire the pipelines registered for this schedule expression
    #[arg(long, value_name = "CRON")]
    pub schedule: Option<String>,

    /// Manual run of every pipeline against a ref (default branch if omitted)
    #[arg(long = "ref", value_name = "REF")]
    pub git_ref: Option<String>,

    /// Read the event from a JSON file
    #[arg(long, value_name = "PATH")]
    pub event_file: Option<PathBuf>,
}

impl EventArgs {
    /// Build the trigger event; a manual run when no event flag is given
    pub fn to_event(&self) -> Result<TriggerEvent> {
        if let Some(path) = &self.event_file {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read event file {}", path.display()))?;
            return Ok(TriggerEvent::from_json(&json)?);
        }

        if let Some(number) = self.pull_request {
            let target_branch = self
                .target_branch
                .clone()
                .context("--pull-request requires --target-branch")?;
            return Ok(TriggerEvent::PullRequest {
                number,
                source_ref: self.source_ref.clone(),
                target_branch,
            });
        }

        if let Some(cron) = &self.schedule {
            return Ok(TriggerEvent::Schedule { cron: cron.clone() });
        }

        Ok(TriggerEvent::Manual {
            git_ref: self.git_ref.clone(),
        })
    }
}

/// Resolve an event and run the selected pipelines
#[derive(Debug, Args, Clone)]
pub struct RunCommand {
    #[command(flatten)]
    pub event: EventArgs,

    /// Only run these pipelines (must be among those the event selects)
    #[arg(long = "only", value_name = "PIPELINE")]
    pub only: Vec<String>,

    /// Scheduling strategy
    #[arg(long, value_enum)]
    pub strategy: Option<SchedulingStrategyArg>,

    /// Upper bound on concurrently running pipelines
    #[arg(long)]
    pub max_parallel: Option<usize>,

    /// Don't record results in the run log
    #[arg(long)]
    pub no_history: bool,

    /// Write a JSON report here
    #[arg(long, value_name = "PATH")]
    pub report: Option<PathBuf>,

    /// Container CLI used for pre-baked environments
    #[arg(long, env = "DOWNSTREAM_CONTAINER_RUNTIME", default_value = "docker")]
    pub container_runtime: String,

    /// Extra provisioning attempts (overrides the manifest)
    #[arg(long)]
    pub provision_retries: Option<u32>,
}

impl RunCommand {
    /// Strategy from flags, falling back to the manifest's bound
    pub fn scheduling_strategy(&self, manifest_max: Option<usize>) -> SchedulingStrategy {
        if let Some(n) = self.max_parallel {
            return SchedulingStrategy::LimitedParallel(n);
        }
        match self.strategy {
            Some(SchedulingStrategyArg::Sequential) => SchedulingStrategy::Sequential,
            Some(SchedulingStrategyArg::Parallel) => SchedulingStrategy::Parallel,
            Some(SchedulingStrategyArg::ParallelLimited) => {
                SchedulingStrategy::LimitedParallel(manifest_max.unwrap_or(4))
            }
            None => match manifest_max {
                Some(n) => SchedulingStrategy::LimitedParallel(n),
                None => SchedulingStrategy::Parallel,
            },
        }
    }
}

/// Show which pipelines an event would run, without running them
#[derive(Debug, Args, Clone)]
pub struct ResolveCommand {
    #[command(flatten)]
    pub event: EventArgs,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Validate a manifest
#[derive(Debug, Args, Clone)]
pub struct ValidateCommand {
    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// List the manifest's pipelines
#[derive(Debug, Args, Clone)]
pub struct ListCommand {
    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Show recorded runs
#[derive(Debug, Args, Clone)]
pub struct HistoryCommand {
    /// Pipeline name to filter by
    #[arg(short, long)]
    pub pipeline: Option<String>,

    /// Code ref to filter by (requires --pipeline)
    #[arg(long, requires = "pipeline")]
    pub code_ref: Option<String>,

    /// Number of recent runs to show
    #[arg(short, long, default_value_t = 20)]
    pub limit: usize,

    /// Show pipelines whose status changed between runs of one code ref
    #[arg(long, conflicts_with_all = ["pipeline", "code_ref"])]
    pub flaky: bool,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Scheduling strategy argument
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum SchedulingStrategyArg {
    Sequential,
    Parallel,
    #[clap(name = "parallel-limited")]
    ParallelLimited,
}
