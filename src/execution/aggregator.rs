//! Result aggregator - collects per-pipeline results into one report

use super::engine::RunOutcome;
use crate::core::state::{JobResult, PipelineStatus, StepStatus};
use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

/// Per-pipeline results of one resolved run
#[derive(Debug, Default)]
pub struct ResultAggregator {
    results: BTreeMap<String, JobResult>,
    cancelled: BTreeSet<String>,
}

impl ResultAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, outcome: RunOutcome) {
        match outcome {
            RunOutcome::Completed(result) => {
                self.cancelled.remove(&result.pipeline);
                self.results.insert(result.pipeline.clone(), result);
            }
            RunOutcome::Cancelled { pipeline } => {
                if !self.results.contains_key(&pipeline) {
                    self.cancelled.insert(pipeline);
                }
            }
        }
    }

    pub fn status(&self, pipeline: &str) -> Option<PipelineStatus> {
        self.results.get(pipeline).map(JobResult::status)
    }

    pub fn result(&self, pipeline: &str) -> Option<&JobResult> {
        self.results.get(pipeline)
    }

    /// Completed results in pipeline name order
    pub fn results(&self) -> impl Iterator<Item = &JobResult> {
        self.results.values()
    }

    pub fn cancelled(&self) -> impl Iterator<Item = &String> {
        self.cancelled.iter()
    }

    /// True iff every pipeline finished and passed
    pub fn overall(&self) -> bool {
        self.cancelled.is_empty() && self.results.values().all(|r| r.status().is_pass())
    }

    pub fn exit_code(&self) -> i32 {
        if self.overall() {
            0
        } else {
            1
        }
    }

    /// Number of pipelines per status
    pub fn counts(&self) -> BTreeMap<PipelineStatus, usize> {
        let mut counts = BTreeMap::new();
        for result in self.results.values() {
            *counts.entry(result.status()).or_insert(0) += 1;
        }
        counts
    }

    /// One line per pipeline, telling candidate regressions apart from
    /// broken environments and dependency chains
    pub fn status_lines(&self) -> Vec<String> {
        let mut lines: Vec<String> = self
            .results
            .values()
            .map(|r| {
                let status = r.status();
                match (status, r.reason()) {
                    (PipelineStatus::Pass, _) => format!("{}: pass", r.pipeline),
                    (PipelineStatus::TestFailure, reason) => format!(
                        "{}: test-failure, the candidate broke the downstream suite ({})",
                        r.pipeline,
                        reason.unwrap_or_default()
                    ),
                    (other, reason) => format!(
                        "{}: {}, environment or dependency chain broken ({})",
                        r.pipeline,
                        other,
                        reason.unwrap_or_default()
                    ),
                }
            })
            .collect();
        lines.extend(self.cancelled.iter().map(|p| format!("{}: cancelled", p)));
        lines
    }

    pub fn report(&self, code_ref: &str, trigger: &str) -> RunReport {
        RunReport {
            code_ref: code_ref.to_string(),
            trigger: trigger.to_string(),
            overall: if self.overall() { "pass" } else { "fail" }.to_string(),
            pipelines: self.results.values().map(PipelineReport::from).collect(),
            cancelled: self.cancelled.iter().cloned().collect(),
        }
    }

    /// Write the JSON report to a file
    pub fn write_report(&self, path: &Path, code_ref: &str, trigger: &str) -> Result<()> {
        let json = serde_json::to_string_pretty(&self.report(code_ref, trigger))?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write report to {}", path.display()))
    }
}

/// Machine-readable summary of a run
#[derive(Debug, Serialize)]
pub struct RunReport {
    pub code_ref: String,
    pub trigger: String,
    pub overall: String,
    pub pipelines: Vec<PipelineReport>,
    pub cancelled: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct PipelineReport {
    pub name: String,
    pub run_id: String,
    pub status: PipelineStatus,
    pub reason: Option<String>,
    pub failing_tests: Vec<String>,
    /// Full captured output behind a non-passing status
    pub output: Option<String>,
    pub duration_ms: u64,
    pub steps: Vec<StepReport>,
}

#[derive(Debug, Serialize)]
pub struct StepReport {
    pub index: usize,
    pub label: String,
    pub state: &'static str,
    pub exit_code: Option<i32>,
    pub duration_ms: Option<u64>,
}

impl From<&JobResult> for PipelineReport {
    fn from(result: &JobResult) -> Self {
        PipelineReport {
            name: result.pipeline.clone(),
            run_id: result.run_id.to_string(),
            status: result.status(),
            reason: result.reason(),
            failing_tests: result.failing_tests().to_vec(),
            output: result.failure_output(),
            duration_ms: result.duration_ms(),
            steps: result
                .steps
                .iter()
                .map(|s| StepReport {
                    index: s.index,
                    label: format!("{} {}", s.kind, s.target),
                    state: match s.status {
                        StepStatus::Succeeded => "succeeded",
                        StepStatus::Failed { .. } => "failed",
                        StepStatus::Skipped => "skipped",
                    },
                    exit_code: s.exit_code,
                    duration_ms: s.duration_ms(),
                })
                .collect(),
        }
    }
}
