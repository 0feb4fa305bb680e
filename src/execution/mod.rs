//! Pipeline execution
//!
//! Steps are turned into commands by the installer and test runner, run
//! by the [`StepExecutor`] inside one sandbox per pipeline, and sequenced
//! by the [`PipelineEngine`]. The [`RunScheduler`] fans a resolved run out
//! over its pipelines and the [`ResultAggregator`] folds them back.

pub mod aggregator;
pub mod engine;
pub mod executor;
pub mod installer;
pub mod lease;
pub mod scheduler;
pub mod supersede;
pub mod test_runner;

pub use aggregator::{ResultAggregator, RunReport};
pub use engine::{EventHandler, ExecutionEvent, PipelineEngine, RunOutcome};
pub use executor::{ExecutionResult, StepExecutor};
pub use lease::{HeldLease, LeaseDir};
pub use scheduler::{RunScheduler, SchedulingStrategy};
pub use supersede::{RunLease, SupersessionRegistry};
