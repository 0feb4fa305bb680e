//! Core domain models
//!
//! Pipelines, steps and environments as declared in the manifest, the
//! trigger resolver that selects them, and the results a run produces.

pub mod config;
pub mod context;
pub mod environment;
pub mod error;
pub mod pipeline;
pub mod state;
pub mod step;
pub mod trigger;

pub use context::*;
pub use environment::*;
pub use pipeline::*;
pub use state::*;
pub use step::*;
pub use trigger::*;
