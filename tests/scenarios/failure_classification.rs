//! Environment breakage is kept apart from regressions in the candidate

use crate::helpers::*;
use downstream::core::error::{InstallErrorKind, TestExecutionError};
use downstream::core::state::{Failure, PipelineStatus};
use downstream::environment::CommandOutput;
use downstream::execution::SchedulingStrategy;

fn failure_of(aggregator: &downstream::execution::ResultAggregator, pipeline: &str) -> Failure {
    let result = aggregator.result(pipeline).unwrap();
    let (_, failure) = result
        .first_failure()
        .unwrap_or_else(|| panic!("'{}' has no failed step", pipeline));
    failure.clone()
}

#[tokio::test]
async fn test_missing_header_is_install_error() {
    let set = demo_pipelines();
    let provisioner = MockProvisioner::new().on_pipeline(
        "ffcx",
        "./ffcx",
        Reply::Exit(CommandOutput {
            exit_code: Some(1),
            stderr: "pygraphviz/graphviz_wrap.c:3020:10: fatal error: graphviz/cgraph.h: No such file or directory".to_string(),
            ..Default::default()
        }),
    );

    let aggregator = run_event(&set, pull_request(2), &provisioner, SchedulingStrategy::Parallel).await;

    assert_status(&aggregator, "ffcx", PipelineStatus::InstallError);
    match failure_of(&aggregator, "ffcx") {
        Failure::Install(error) => {
            assert_eq!(error.kind, InstallErrorKind::MissingSystemDependency);
            assert_eq!(error.exit_code, Some(1));
        }
        other => panic!("unexpected failure: {:?}", other),
    }
}

#[tokio::test]
async fn test_install_timeout_is_install_error() {
    let set = demo_pipelines();
    let provisioner = MockProvisioner::new().on_pipeline("dolfinx", "./dolfinx", Reply::TimeOut);

    let aggregator = run_event(&set, pull_request(2), &provisioner, SchedulingStrategy::Parallel).await;

    assert_status(&aggregator, "dolfinx", PipelineStatus::InstallError);
    match failure_of(&aggregator, "dolfinx") {
        Failure::Install(error) => assert_eq!(error.kind, InstallErrorKind::Timeout),
        other => panic!("unexpected failure: {:?}", other),
    }
}

#[tokio::test]
async fn test_no_tests_collected_is_execution_error() {
    let set = demo_pipelines();
    let provisioner = MockProvisioner::new().on_pipeline(
        "ffcx",
        "pytest",
        Reply::Exit(exited(5, "collected 0 items\n\n====== no tests ran in 0.01s ======")),
    );

    let aggregator = run_event(&set, pull_request(2), &provisioner, SchedulingStrategy::Parallel).await;

    assert_status(&aggregator, "ffcx", PipelineStatus::TestExecutionError);
    assert_eq!(
        failure_of(&aggregator, "ffcx"),
        Failure::TestExecution(TestExecutionError::NoTestsCollected)
    );
}

#[tokio::test]
async fn test_killed_harness_is_execution_error() {
    let set = demo_pipelines();
    let provisioner = MockProvisioner::new().on_pipeline(
        "dolfinx",
        "pytest",
        Reply::Exit(CommandOutput {
            exit_code: None,
            signal: Some(9),
            ..Default::default()
        }),
    );

    let aggregator = run_event(&set, pull_request(2), &provisioner, SchedulingStrategy::Parallel).await;

    assert_status(&aggregator, "dolfinx", PipelineStatus::TestExecutionError);
    assert!(!PipelineStatus::TestExecutionError.implicates_core_library());
    assert!(PipelineStatus::TestFailure.implicates_core_library());
}

#[tokio::test]
async fn test_suite_timeout_is_execution_error() {
    let set = demo_pipelines();
    let provisioner = MockProvisioner::new().on_pipeline("ffcx", "pytest", Reply::TimeOut);

    let aggregator = run_event(&set, pull_request(2), &provisioner, SchedulingStrategy::Parallel).await;

    assert_status(&aggregator, "ffcx", PipelineStatus::TestExecutionError);
    let step_timeout = set.get("ffcx").unwrap().steps.last().unwrap().timeout_secs;
    assert_eq!(
        failure_of(&aggregator, "ffcx"),
        Failure::TestExecution(TestExecutionError::TimedOut(step_timeout))
    );
}
