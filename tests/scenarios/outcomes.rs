//! The four reference outcomes of a pull request run

use crate::helpers::*;
use downstream::core::state::{PipelineStatus, StepStatus};
use downstream::core::step::StepKind;
use downstream::execution::SchedulingStrategy;

const SUITE_WITH_THREE_FAILURES: &str = "\
============================= test session starts ==============================
collected 412 items

test/test_jit_forms.py ........F.....F..
test/test_signatures.py ...F

=========================== short test summary info ============================
FAILED test/test_jit_forms.py::test_laplace_bilinear_form_2D[float64] - AssertionError
FAILED test/test_jit_forms.py::test_mass_bilinear_form_2D[float32] - AssertionError
FAILED test/test_signatures.py::test_numba_forms - assert 3 == 4
======================== 3 failed, 409 passed in 61.20s ========================
";

/// Scenario A: install succeeds and the suite exits 0
#[tokio::test]
async fn test_passing_pipeline() {
    let set = demo_pipelines();
    let provisioner = MockProvisioner::new().on("pytest", Reply::Exit(exited(0, "412 passed")));

    let aggregator = run_event(&set, pull_request(12), &provisioner, SchedulingStrategy::Parallel).await;

    assert_status(&aggregator, "ffcx", PipelineStatus::Pass);
    assert_status(&aggregator, "dolfinx", PipelineStatus::Pass);
    assert!(aggregator.overall());
    assert_eq!(aggregator.exit_code(), 0);

    let ffcx = aggregator.result("ffcx").unwrap();
    assert!(ffcx.steps.iter().all(|s| s.status == StepStatus::Succeeded));
}

/// Scenario B: the core library fails to install, so tests never run
#[tokio::test]
async fn test_core_install_failure_never_runs_tests() {
    let set = demo_pipelines();
    let install_core = format!("pip install {}", CORE_CHECKOUT);
    let provisioner = MockProvisioner::new().on_pipeline(
        "ffcx",
        &install_core,
        Reply::Exit(exited(1, "error: subprocess-exited-with-error")),
    );

    let aggregator = run_event(&set, pull_request(12), &provisioner, SchedulingStrategy::Parallel).await;

    assert_status(&aggregator, "ffcx", PipelineStatus::InstallError);
    assert_eq!(aggregator.exit_code(), 1);

    let ffcx = aggregator.result("ffcx").unwrap();
    assert_eq!(executed_kinds(ffcx), vec![StepKind::InstallLocal]);
    assert_skipped_after_failure(ffcx);
    assert!(ffcx.failing_tests().is_empty());
    assert!(!provisioner
        .commands_of("ffcx")
        .iter()
        .any(|c| c.contains("pytest")));

    // The other pipeline is unaffected
    assert_status(&aggregator, "dolfinx", PipelineStatus::Pass);
}

/// Scenario C: install succeeds, three assertions fail
#[tokio::test]
async fn test_failing_suite_reports_failing_tests() {
    let set = demo_pipelines();
    let provisioner = MockProvisioner::new().on_pipeline(
        "ffcx",
        "pytest",
        Reply::Exit(exited(1, SUITE_WITH_THREE_FAILURES)),
    );

    let aggregator = run_event(&set, pull_request(12), &provisioner, SchedulingStrategy::Parallel).await;

    assert_status(&aggregator, "ffcx", PipelineStatus::TestFailure);
    let ffcx = aggregator.result("ffcx").unwrap();
    assert_eq!(
        ffcx.failing_tests(),
        &[
            "test/test_jit_forms.py::test_laplace_bilinear_form_2D[float64]".to_string(),
            "test/test_jit_forms.py::test_mass_bilinear_form_2D[float32]".to_string(),
            "test/test_signatures.py::test_numba_forms".to_string(),
        ]
    );

    let (step, _) = ffcx.first_failure().unwrap();
    assert_eq!(step.kind, StepKind::RunTests);
    assert!(step.stdout.contains("3 failed, 409 passed"));

    let lines = aggregator.status_lines();
    assert!(lines
        .iter()
        .any(|l| l.starts_with("ffcx: test-failure, the candidate broke the downstream suite")));
}

/// Scenario D: one pipeline cannot be provisioned while another passes
#[tokio::test]
async fn test_provision_failure_is_isolated() {
    let set = demo_pipelines();
    let provisioner = MockProvisioner::new().failing_provision("dolfinx");

    let aggregator = run_event(&set, pull_request(12), &provisioner, SchedulingStrategy::Parallel).await;

    assert_status(&aggregator, "dolfinx", PipelineStatus::ProvisionError);
    assert_status(&aggregator, "ffcx", PipelineStatus::Pass);
    assert!(!aggregator.overall());
    assert_eq!(aggregator.exit_code(), 1);

    let dolfinx = aggregator.result("dolfinx").unwrap();
    assert!(dolfinx.steps.iter().all(|s| s.status == StepStatus::Skipped));
    assert!(provisioner.commands_of("dolfinx").is_empty());

    let lines = aggregator.status_lines();
    assert!(lines.contains(&"ffcx: pass".to_string()));
    assert!(lines
        .iter()
        .any(|l| l.starts_with("dolfinx: provision-error, environment or dependency chain broken")));
}

/// Status depends only on step outcomes, however often it is read
#[tokio::test]
async fn test_status_is_stable() {
    let set = demo_pipelines();
    let script = |suite_fails: bool| {
        let provisioner = MockProvisioner::new();
        if suite_fails {
            provisioner.on("pytest", Reply::Exit(exited(1, SUITE_WITH_THREE_FAILURES)))
        } else {
            provisioner
        }
    };

    let cases = [(false, PipelineStatus::Pass), (true, PipelineStatus::TestFailure)];
    for (suite_fails, expected) in cases {
        let first = run_event(&set, pull_request(3), &script(suite_fails), SchedulingStrategy::Sequential)
            .await;
        let second = run_event(&set, pull_request(3), &script(suite_fails), SchedulingStrategy::Sequential)
            .await;

        for name in ["ffcx", "dolfinx"] {
            let before = first.result(name).unwrap().status();
            let after = second.result(name).unwrap().status();
            assert_eq!(before, after, "{} changed status between identical runs", name);
            assert_eq!(before, expected);
        }
    }
}
