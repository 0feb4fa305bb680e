//! Every pipeline run gets its own environment, and the parallelism bound holds

use crate::helpers::*;
use downstream::core::state::PipelineStatus;
use downstream::execution::SchedulingStrategy;
use std::collections::HashSet;
use std::time::Duration;

#[tokio::test]
async fn test_each_pipeline_gets_a_fresh_sandbox() {
    let set = demo_pipelines();
    let provisioner = MockProvisioner::new();

    run_event(&set, manual(), &provisioner, SchedulingStrategy::Parallel).await;

    let provisioned = provisioner.provisioned();
    assert_eq!(provisioned.len(), 3);
    let unique: HashSet<_> = provisioned.iter().collect();
    assert_eq!(unique.len(), 3);

    // Every command ran in the sandbox of the pipeline that issued it
    for entry in provisioner.trace() {
        let slug: String = entry
            .pipeline
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
            .collect();
        assert!(
            entry.sandbox.starts_with(&slug),
            "{} ran in {}",
            entry.pipeline,
            entry.sandbox
        );
    }
}

#[tokio::test]
async fn test_sandboxes_are_discarded_whatever_the_outcome() {
    let set = demo_pipelines();
    let provisioner = MockProvisioner::new()
        .on_pipeline("ffcx", "pytest", Reply::Exit(exited(1, "FAILED test/test_a.py::test_a")))
        .on_pipeline("dolfinx", "uninstall", Reply::Fail("pip not found".to_string()));

    let aggregator = run_event(&set, manual(), &provisioner, SchedulingStrategy::Parallel).await;

    assert_status(&aggregator, "ffcx", PipelineStatus::TestFailure);
    assert_status(&aggregator, "dolfinx", PipelineStatus::InstallError);
    assert_status(&aggregator, "ffcx-published-basix", PipelineStatus::Pass);

    let mut provisioned = provisioner.provisioned();
    let mut discarded = provisioner.discarded();
    provisioned.sort();
    discarded.sort();
    assert_eq!(provisioned, discarded);
}

#[tokio::test]
async fn test_repeated_runs_never_reuse_environments() {
    let set = demo_pipelines();
    let provisioner = MockProvisioner::new();

    run_event(&set, pull_request(1), &provisioner, SchedulingStrategy::Parallel).await;
    run_event(&set, pull_request(1), &provisioner, SchedulingStrategy::Parallel).await;

    let provisioned = provisioner.provisioned();
    assert_eq!(provisioned.len(), 4);
    let unique: HashSet<_> = provisioned.iter().collect();
    assert_eq!(unique.len(), 4);
}

#[tokio::test]
async fn test_sequential_runs_one_pipeline_at_a_time() {
    let set = demo_pipelines();
    let provisioner = MockProvisioner::new().with_provision_delay(Duration::from_millis(20));

    run_event(&set, manual(), &provisioner, SchedulingStrategy::Sequential).await;

    assert_eq!(provisioner.peak_concurrency(), 1);
}

#[tokio::test]
async fn test_parallelism_bound_is_respected() {
    let set = demo_pipelines();
    let provisioner = MockProvisioner::new().with_provision_delay(Duration::from_millis(20));

    let aggregator =
        run_event(&set, manual(), &provisioner, SchedulingStrategy::LimitedParallel(2)).await;

    assert!(aggregator.overall());
    assert!(provisioner.peak_concurrency() <= 2);
    assert_eq!(provisioner.provisioned().len(), 3);
}
