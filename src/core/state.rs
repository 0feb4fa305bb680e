//! Execution state models

use crate::core::{
    error::{InstallError, ProvisionError, TestExecutionError},
    step::StepKind,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Terminal status of one pipeline run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PipelineStatus {
    /// Every step succeeded
    Pass,
    /// The environment could not be created
    ProvisionError,
    /// A declared dependency failed to build or resolve
    InstallError,
    /// The suite ran to completion and reported failing assertions
    TestFailure,
    /// The suite crashed, timed out or collected nothing
    TestExecutionError,
}

impl PipelineStatus {
    pub fn is_pass(&self) -> bool {
        matches!(self, PipelineStatus::Pass)
    }

    /// Only a test failure says something about the core library itself;
    /// every other failure is the environment or dependency chain.
    pub fn implicates_core_library(&self) -> bool {
        matches!(self, PipelineStatus::TestFailure)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStatus::Pass => "pass",
            PipelineStatus::ProvisionError => "provision-error",
            PipelineStatus::InstallError => "install-error",
            PipelineStatus::TestFailure => "test-failure",
            PipelineStatus::TestExecutionError => "test-execution-error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pass" => Some(PipelineStatus::Pass),
            "provision-error" => Some(PipelineStatus::ProvisionError),
            "install-error" => Some(PipelineStatus::InstallError),
            "test-failure" => Some(PipelineStatus::TestFailure),
            "test-execution-error" => Some(PipelineStatus::TestExecutionError),
            _ => None,
        }
    }
}

impl std::fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified step failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "class", content = "detail", rename_all = "kebab-case")]
pub enum Failure {
    Install(InstallError),
    TestFailure {
        /// Identifiers of the failing tests, in report order
        failing_tests: Vec<String>,
    },
    TestExecution(TestExecutionError),
}

impl Failure {
    pub fn status(&self) -> PipelineStatus {
        match self {
            Failure::Install(_) => PipelineStatus::InstallError,
            Failure::TestFailure { .. } => PipelineStatus::TestFailure,
            Failure::TestExecution(_) => PipelineStatus::TestExecutionError,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Failure::Install(e) => e.to_string(),
            Failure::TestFailure { failing_tests } => {
                format!("{} failing test(s)", failing_tests.len())
            }
            Failure::TestExecution(e) => e.to_string(),
        }
    }
}

/// What happened to one step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum StepStatus {
    Succeeded,
    Failed { failure: Failure },
    /// Not executed because an earlier step failed
    Skipped,
}

/// Recorded outcome of one step, with its captured output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub index: usize,
    pub kind: StepKind,
    pub target: String,
    pub status: StepStatus,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl StepOutcome {
    pub fn skipped(index: usize, kind: StepKind, target: &str) -> Self {
        Self {
            index,
            kind,
            target: target.to_string(),
            status: StepStatus::Skipped,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn failure(&self) -> Option<&Failure> {
        match &self.status {
            StepStatus::Failed { failure } => Some(failure),
            _ => None,
        }
    }

    pub fn was_executed(&self) -> bool {
        !matches!(self.status, StepStatus::Skipped)
    }

    pub fn duration_ms(&self) -> Option<u64> {
        let (start, end) = (self.started_at?, self.finished_at?);
        end.signed_duration_since(start)
            .to_std()
            .ok()
            .map(|d| d.as_millis() as u64)
    }
}

/// Outcome of environment provisioning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ProvisionOutcome {
    Ready {
        environment: String,
        attempts: u32,
    },
    Failed {
        error: ProvisionError,
        attempts: u32,
    },
}

/// Terminal result of one pipeline run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResult {
    pub run_id: Uuid,
    pub pipeline: String,
    pub code_ref: String,
    pub provision: ProvisionOutcome,
    pub steps: Vec<StepOutcome>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl JobResult {
    /// Overall status: provision-error if the environment never came up,
    /// otherwise the class of the first failing step, otherwise pass.
    pub fn status(&self) -> PipelineStatus {
        if let ProvisionOutcome::Failed { .. } = self.provision {
            return PipelineStatus::ProvisionError;
        }
        self.first_failure()
            .map(|(_, failure)| failure.status())
            .unwrap_or(PipelineStatus::Pass)
    }

    /// First failing step and its failure
    pub fn first_failure(&self) -> Option<(&StepOutcome, &Failure)> {
        self.steps
            .iter()
            .find_map(|s| s.failure().map(|f| (s, f)))
    }

    /// Steps that actually ran, in order
    pub fn executed_steps(&self) -> impl Iterator<Item = &StepOutcome> {
        self.steps.iter().filter(|s| s.was_executed())
    }

    /// Failing test identifiers, if the run ended in a test failure
    pub fn failing_tests(&self) -> &[String] {
        match self.first_failure() {
            Some((_, Failure::TestFailure { failing_tests })) => failing_tests,
            _ => &[],
        }
    }

    /// Captured output behind a non-passing status: the provisioning error,
    /// or everything the first failing step wrote, stdout then stderr
    pub fn failure_output(&self) -> Option<String> {
        if let ProvisionOutcome::Failed { error, .. } = &self.provision {
            return Some(error.to_string());
        }
        let (step, _) = self.first_failure()?;
        let parts: Vec<&str> = [step.stdout.trim_end(), step.stderr.trim_end()]
            .into_iter()
            .filter(|s| !s.is_empty())
            .collect();
        Some(parts.join("\n"))
    }

    /// One-line explanation of a non-passing status
    pub fn reason(&self) -> Option<String> {
        if let ProvisionOutcome::Failed { error, .. } = &self.provision {
            return Some(error.to_string());
        }
        self.first_failure().map(|(step, failure)| {
            format!("{} {}: {}", step.kind, step.target, failure.describe())
        })
    }

    pub fn duration_ms(&self) -> u64 {
        self.finished_at
            .signed_duration_since(self.started_at)
            .to_std()
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}
