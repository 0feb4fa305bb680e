//! Scenario tests: whole runs against scripted sandboxes

#[path = "../helpers.rs"]
mod helpers;

mod cancellation;
mod failure_classification;
mod isolation;
mod outcomes;
mod step_ordering;
