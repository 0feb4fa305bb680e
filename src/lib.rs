//! downstream - verifies that downstream projects still build and pass
//! their test suites against a candidate change of a core library

pub mod cli;
pub mod core;
pub mod environment;
pub mod execution;
pub mod persistence;

// Re-export commonly used types
pub use crate::core::config::Manifest;
pub use crate::core::{JobResult, Pipeline, PipelineSet, PipelineStatus, Step, StepKind};
pub use crate::core::{ResolvedRun, TriggerEvent, TriggerResolver};
pub use environment::{DefaultProvisioner, Provisioner, Sandbox};
pub use execution::{PipelineEngine, ResultAggregator, RunOutcome, RunScheduler, SchedulingStrategy};
pub use persistence::{InMemoryRunLog, RunLog, RunRecord};
