//! Error taxonomy for pipeline runs
//!
//! Every failure a pipeline can hit maps onto exactly one of these types,
//! so a reader of the final report can tell a regression in the core
//! library apart from a broken environment or dependency chain.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure to map an external event onto a set of pipelines
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TriggerError {
    #[error("Malformed event: {0}")]
    Malformed(String),

    #[error("Pull request targets '{0}', which is not a protected branch")]
    UnprotectedBranch(String),

    #[error("Invalid schedule expression '{expression}': {reason}")]
    InvalidSchedule { expression: String, reason: String },

    #[error("Unknown pipeline '{0}'")]
    UnknownPipeline(String),
}

/// Failure to create an execution environment
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum ProvisionError {
    #[error("Failed to pull image '{image}': {output}")]
    ImagePull { image: String, output: String },

    #[error("Failed to install system packages: {output}")]
    SystemPackages { output: String },

    #[error("Failed to create environment: {0}")]
    Create(String),

    #[error("Provisioning was cancelled")]
    Cancelled,

    #[error("Pipeline task aborted: {0}")]
    Aborted(String),
}

/// Why a dependency failed to install
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstallErrorKind {
    /// The resolver could not satisfy the declared requirements
    VersionConflict,
    /// A compiler, header or build tool is missing from the environment
    MissingSystemDependency,
    /// The install command exceeded its time budget
    Timeout,
    /// Any other non-zero exit
    Other,
}

impl std::fmt::Display for InstallErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            InstallErrorKind::VersionConflict => "version conflict",
            InstallErrorKind::MissingSystemDependency => "missing system dependency",
            InstallErrorKind::Timeout => "timeout",
            InstallErrorKind::Other => "install failed",
        };
        f.write_str(s)
    }
}

/// A declared dependency failed to build or resolve
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
#[error("{kind} while installing '{target}' (exit code {exit_code:?})")]
pub struct InstallError {
    pub kind: InstallErrorKind,
    pub target: String,
    pub exit_code: Option<i32>,
}

/// The test suite could not be run to completion
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum TestExecutionError {
    #[error("Test run crashed: {0}")]
    Crashed(String),

    #[error("Test run exceeded its time budget of {0} seconds")]
    TimedOut(u64),

    #[error("Test run collected no tests")]
    NoTestsCollected,

    #[error("Test run was interrupted")]
    Interrupted,
}

/// Errors raised by a sandbox while running a single command
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("Failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed waiting on '{program}': {source}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Timeout after {0} seconds")]
    Timeout(u64),

    #[error("Cancelled")]
    Cancelled,
}
