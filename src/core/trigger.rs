//! Trigger resolution - maps an external event onto the pipelines to run

use crate::core::{error::TriggerError, pipeline::PipelineSet};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// When a pipeline runs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trigger {
    /// Run for pull requests targeting a protected branch
    #[serde(default)]
    pub on_pull_request: bool,

    /// Cron expression for scheduled runs
    #[serde(default)]
    pub on_schedule: Option<String>,
}

impl Trigger {
    /// Parsed schedule, if any
    pub fn schedule(&self) -> Option<Result<cron::Schedule, TriggerError>> {
        self.on_schedule.as_deref().map(parse_schedule)
    }

    /// Next scheduled tick after `after`
    pub fn next_tick(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self.schedule()? {
            Ok(schedule) => schedule.after(&after).next(),
            Err(_) => None,
        }
    }
}

/// Normalize a cron expression into the six-field form the `cron` crate
/// expects. Five-field (minute-resolution) expressions get a zero seconds
/// field prepended.
pub fn normalize_schedule(expression: &str) -> String {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    if fields.len() == 5 {
        format!("0 {}", fields.join(" "))
    } else {
        fields.join(" ")
    }
}

/// Parse a cron expression
pub fn parse_schedule(expression: &str) -> Result<cron::Schedule, TriggerError> {
    cron::Schedule::from_str(&normalize_schedule(expression)).map_err(|e| {
        TriggerError::InvalidSchedule {
            expression: expression.to_string(),
            reason: e.to_string(),
        }
    })
}

/// An external event that may start pipelines
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TriggerEvent {
    /// A pull request was opened or updated
    PullRequest {
        number: u64,
        /// Integration ref of the pull request; defaults to
        /// `refs/pull/<number>/merge`
        #[serde(default)]
        source_ref: Option<String>,
        target_branch: String,
    },
    /// A cron tick fired
    Schedule { cron: String },
    /// Someone started a run by hand
    Manual {
        #[serde(default, rename = "ref")]
        git_ref: Option<String>,
    },
}

impl TriggerEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            TriggerEvent::PullRequest { .. } => "pull_request",
            TriggerEvent::Schedule { .. } => "schedule",
            TriggerEvent::Manual { .. } => "manual",
        }
    }

    /// Load an event from a JSON file
    pub fn from_json(json: &str) -> Result<Self, TriggerError> {
        serde_json::from_str(json).map_err(|e| TriggerError::Malformed(e.to_string()))
    }
}

/// Outcome of trigger resolution
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedRun {
    /// Code ref of the core library under test
    pub code_ref: String,

    /// In-flight runs sharing this key supersede each other
    pub concurrency_key: String,

    /// Event kind that produced this run
    pub trigger: String,

    /// Pipelines to execute, in name order
    pub pipelines: Vec<String>,
}

impl ResolvedRun {
    /// Restrict the run to the named pipelines
    pub fn restrict(&mut self, only: &[String]) -> Result<(), TriggerError> {
        if only.is_empty() {
            return Ok(());
        }
        for name in only {
            if !self.pipelines.contains(name) {
                return Err(TriggerError::UnknownPipeline(name.clone()));
            }
        }
        self.pipelines.retain(|p| only.contains(p));
        Ok(())
    }
}

/// Maps events onto pipelines; has no side effects
#[derive(Debug, Clone)]
pub struct TriggerResolver {
    default_branch: String,
    protected_branches: Vec<String>,
}

impl TriggerResolver {
    pub fn new(default_branch: impl Into<String>, protected_branches: Vec<String>) -> Self {
        let default_branch = default_branch.into();
        let protected_branches = if protected_branches.is_empty() {
            vec![default_branch.clone()]
        } else {
            protected_branches
        };
        Self {
            default_branch,
            protected_branches,
        }
    }

    pub fn for_pipelines(pipelines: &PipelineSet) -> Self {
        Self::new(
            pipelines.default_branch.clone(),
            pipelines.protected_branches.clone(),
        )
    }

    fn is_protected(&self, branch: &str) -> bool {
        let branch = branch.strip_prefix("refs/heads/").unwrap_or(branch);
        self.protected_branches.iter().any(|pattern| {
            match pattern.strip_suffix('*') {
                Some(prefix) => branch.starts_with(prefix),
                None => pattern == branch,
            }
        })
    }

    /// Resolve an event into the code ref under test and the pipelines to run
    pub fn resolve(
        &self,
        event: &TriggerEvent,
        pipelines: &PipelineSet,
    ) -> Result<ResolvedRun, TriggerError> {
        match event {
            TriggerEvent::PullRequest {
                number,
                source_ref,
                target_branch,
            } => {
                if target_branch.trim().is_empty() {
                    return Err(TriggerError::Malformed(
                        "pull request event has no target branch".to_string(),
                    ));
                }
                if !self.is_protected(target_branch) {
                    return Err(TriggerError::UnprotectedBranch(target_branch.clone()));
                }

                let code_ref = match source_ref {
                    Some(r) if r.trim().is_empty() => {
                        return Err(TriggerError::Malformed(
                            "pull request event has an empty source ref".to_string(),
                        ));
                    }
                    Some(r) => r.clone(),
                    None => format!("refs/pull/{}/merge", number),
                };

                let target_tip = target_branch.strip_prefix("refs/heads/").unwrap_or(target_branch);
                let source_tip = code_ref.strip_prefix("refs/heads/").unwrap_or(&code_ref);
                if source_tip == target_tip {
                    return Err(TriggerError::Malformed(format!(
                        "pull request #{} source ref points at the target branch '{}'",
                        number, target_branch
                    )));
                }

                let selected = pipelines
                    .iter()
                    .filter(|p| p.trigger.on_pull_request)
                    .map(|p| p.name.clone())
                    .collect();

                Ok(ResolvedRun {
                    code_ref,
                    concurrency_key: format!("pr-{}", number),
                    trigger: event.kind().to_string(),
                    pipelines: selected,
                })
            }
            TriggerEvent::Schedule { cron } => {
                parse_schedule(cron)?;
                let tick = normalize_schedule(cron);

                let selected = pipelines
                    .iter()
                    .filter(|p| {
                        p.trigger
                            .on_schedule
                            .as_deref()
                            .is_some_and(|s| normalize_schedule(s) == tick)
                    })
                    .map(|p| p.name.clone())
                    .collect();

                Ok(ResolvedRun {
                    code_ref: self.default_branch.clone(),
                    concurrency_key: "schedule".to_string(),
                    trigger: event.kind().to_string(),
                    pipelines: selected,
                })
            }
            TriggerEvent::Manual { git_ref } => {
                let code_ref = match git_ref {
                    Some(r) if r.trim().is_empty() => {
                        return Err(TriggerError::Malformed(
                            "manual event has an empty ref".to_string(),
                        ));
                    }
                    Some(r) => r.clone(),
                    None => self.default_branch.clone(),
                };

                Ok(ResolvedRun {
                    concurrency_key: format!("manual-{}", code_ref),
                    code_ref,
                    trigger: event.kind().to_string(),
                    pipelines: pipelines.names(),
                })
            }
        }
    }
}
