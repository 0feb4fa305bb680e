//! Superseded and interrupted runs record no result

use crate::helpers::*;
use downstream::core::state::PipelineStatus;
use downstream::core::trigger::TriggerEvent;
use downstream::execution::{ResultAggregator, RunOutcome, SchedulingStrategy, SupersessionRegistry};
use downstream::persistence::{InMemoryRunLog, RunLog, RunRecord};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const OLD_HEAD: &str = "refs/pull/7/head-1";
const NEW_HEAD: &str = "refs/pull/7/head-2";

fn push_to_pr(source_ref: &str) -> TriggerEvent {
    TriggerEvent::PullRequest {
        number: 7,
        source_ref: Some(source_ref.to_string()),
        target_branch: "main".to_string(),
    }
}

async fn record_completed(log: &InMemoryRunLog, outcomes: &[RunOutcome], trigger: &str) {
    for outcome in outcomes {
        if let RunOutcome::Completed(result) = outcome {
            log.append(&RunRecord::from_result(result, trigger)).await.unwrap();
        }
    }
}

#[tokio::test]
async fn test_new_push_supersedes_in_flight_run() {
    let set = Arc::new(demo_pipelines());
    let provisioner = MockProvisioner::new().on_ref(OLD_HEAD, "pytest", Reply::Hang);
    let registry = Arc::new(SupersessionRegistry::default());
    let scheduler = Arc::new(scheduler(&provisioner, SchedulingStrategy::Parallel, registry.clone()));

    let old_run = resolve(&set, push_to_pr(OLD_HEAD));
    let first = {
        let scheduler = scheduler.clone();
        let set = set.clone();
        tokio::spawn(async move { scheduler.execute(&old_run, &set).await })
    };
    provisioner.wait_for("pytest").await;

    let new_run = resolve(&set, push_to_pr(NEW_HEAD));
    let second = scheduler.execute(&new_run, &set).await;
    let first = first.await.unwrap();

    assert!(first.iter().all(|o| matches!(o, RunOutcome::Cancelled { .. })));
    assert!(second.iter().all(|o| matches!(o, RunOutcome::Completed(_))));
    assert_eq!(registry.in_flight(), 0);

    let log = InMemoryRunLog::new();
    record_completed(&log, &first, "pull_request").await;
    record_completed(&log, &second, "pull_request").await;

    for pipeline in ["ffcx", "dolfinx"] {
        let records = log.list_for_pipeline(pipeline).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].code_ref, NEW_HEAD);
        assert_eq!(records[0].status, PipelineStatus::Pass);
    }

    // Cancelled runs still tear their environments down
    let mut provisioned = provisioner.provisioned();
    let mut discarded = provisioner.discarded();
    provisioned.sort();
    discarded.sort();
    assert_eq!(provisioned, discarded);
}

#[tokio::test]
async fn test_schedule_and_pull_request_runs_do_not_cancel_each_other() {
    let set = Arc::new(demo_pipelines());
    let root = CancellationToken::new();
    let provisioner = MockProvisioner::new().on_ref("main", "pytest", Reply::Hang);
    let registry = Arc::new(SupersessionRegistry::new(root.clone()));
    let scheduler = Arc::new(scheduler(&provisioner, SchedulingStrategy::Parallel, registry.clone()));

    let nightly = resolve(
        &set,
        TriggerEvent::Schedule {
            cron: "0 2 * * *".to_string(),
        },
    );
    let scheduled = {
        let scheduler = scheduler.clone();
        let set = set.clone();
        tokio::spawn(async move { scheduler.execute(&nightly, &set).await })
    };
    provisioner.wait_for("pytest").await;

    let pr = scheduler.execute(&resolve(&set, pull_request(9)), &set).await;
    assert!(pr.iter().all(|o| matches!(o, RunOutcome::Completed(_))));

    // The nightly run is still going
    assert_eq!(registry.in_flight(), 1);
    assert!(!scheduled.is_finished());

    root.cancel();
    let scheduled = scheduled.await.unwrap();
    assert!(scheduled.iter().all(|o| matches!(o, RunOutcome::Cancelled { .. })));
}

#[tokio::test]
async fn test_interrupted_run_fails_the_process() {
    let set = demo_pipelines();
    let root = CancellationToken::new();
    let provisioner = MockProvisioner::new().on_pipeline("dolfinx", "pytest", Reply::Hang);
    let registry = Arc::new(SupersessionRegistry::new(root.clone()));
    let scheduler = scheduler(&provisioner, SchedulingStrategy::Parallel, registry);

    let run = resolve(&set, pull_request(4));
    let interrupt = {
        let provisioner = provisioner.clone();
        async move {
            provisioner.wait_for("dolfinx/python/test/unit").await;
            // ffcx never blocks, so once its suite has started it has finished
            provisioner.wait_for("pytest ffcx/test").await;
            root.cancel();
        }
    };
    let (outcomes, ()) = tokio::join!(scheduler.execute(&run, &set), interrupt);

    let mut aggregator = ResultAggregator::new();
    for outcome in outcomes {
        aggregator.record(outcome);
    }

    assert_status(&aggregator, "ffcx", PipelineStatus::Pass);
    assert!(aggregator.result("dolfinx").is_none());
    assert_eq!(aggregator.cancelled().collect::<Vec<_>>(), vec!["dolfinx"]);
    assert_eq!(aggregator.exit_code(), 1);
}
