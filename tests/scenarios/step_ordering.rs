//! Steps run strictly in declared order and a failure aborts the rest

use crate::helpers::*;
use downstream::core::error::InstallErrorKind;
use downstream::core::state::{Failure, PipelineStatus};
use downstream::core::step::StepKind;
use downstream::environment::CommandOutput;
use downstream::execution::SchedulingStrategy;

#[tokio::test]
async fn test_prebaked_pipeline_command_order() {
    let set = demo_pipelines();
    let provisioner = MockProvisioner::new();

    let aggregator = run_event(&set, pull_request(5), &provisioner, SchedulingStrategy::Parallel).await;
    assert_status(&aggregator, "dolfinx", PipelineStatus::Pass);

    let commands = provisioner.commands_of("dolfinx");
    let check = core_check_line();
    let expected = [
        "python3 -m pip uninstall -y fenics-ufl".to_string(),
        format!("python3 -m pip install {}", CORE_CHECKOUT),
        "python3 -m pip install fenics-basix @ git+https://github.com/FEniCS/basix.git@main"
            .to_string(),
        check.clone(),
        "python3 -m pip install fenics-ffcx @ git+https://github.com/FEniCS/ffcx.git@main"
            .to_string(),
        check.clone(),
        "git clone --quiet --depth 1 --branch main https://github.com/FEniCS/dolfinx.git dolfinx"
            .to_string(),
        "python3 -m pip install ./dolfinx/python --no-build-isolation".to_string(),
        check,
        "python3 -m pytest dolfinx/python/test/unit -n 2".to_string(),
    ];
    assert_eq!(commands, expected);
}

#[tokio::test]
async fn test_core_library_installed_from_checkout_only() {
    let set = demo_pipelines();
    let provisioner = MockProvisioner::new();

    run_event(&set, manual(), &provisioner, SchedulingStrategy::Parallel).await;

    for entry in provisioner.trace() {
        let installs_core = entry.command.contains("pip install") && entry.command.contains("fenics-ufl");
        assert!(
            !installs_core,
            "{} installed the core library from somewhere other than the checkout: {}",
            entry.pipeline,
            entry.command
        );
    }
    for pipeline in ["ffcx", "dolfinx", "ffcx-published-basix"] {
        let core_installs = provisioner
            .commands_of(pipeline)
            .into_iter()
            .filter(|c| c.contains("pip install") && c.contains(CORE_CHECKOUT))
            .count();
        assert_eq!(core_installs, 1, "{} should install the checkout exactly once", pipeline);
    }
}

#[tokio::test]
async fn test_sibling_install_failure_aborts_without_retry() {
    let set = demo_pipelines();
    let provisioner = MockProvisioner::new().on(
        "basix.git",
        Reply::Exit(exited(
            1,
            "ERROR: Cannot install fenics-basix because these package versions have conflicting dependencies.",
        )),
    );

    let aggregator = run_event(&set, pull_request(5), &provisioner, SchedulingStrategy::Sequential).await;

    for pipeline in ["ffcx", "dolfinx"] {
        assert_status(&aggregator, pipeline, PipelineStatus::InstallError);
        let result = aggregator.result(pipeline).unwrap();
        assert_skipped_after_failure(result);
        assert_eq!(executed_kinds(result).last(), Some(&StepKind::InstallRemote));

        let attempts = provisioner
            .commands_of(pipeline)
            .iter()
            .filter(|c| c.contains("basix.git"))
            .count();
        assert_eq!(attempts, 1);
    }

    let reason = aggregator.result("ffcx").unwrap().reason().unwrap();
    assert!(reason.contains("version"), "unexpected reason: {}", reason);
}

#[tokio::test]
async fn test_clone_failure_skips_downstream_install() {
    let set = demo_pipelines();
    let provisioner = MockProvisioner::new().on_pipeline(
        "ffcx",
        "git clone",
        Reply::Exit(exited(128, "fatal: Remote branch main not found in upstream origin")),
    );

    let aggregator = run_event(&set, pull_request(5), &provisioner, SchedulingStrategy::Parallel).await;

    assert_status(&aggregator, "ffcx", PipelineStatus::InstallError);
    let commands = provisioner.commands_of("ffcx");
    assert!(commands.last().unwrap().starts_with("git clone"));
    assert!(!commands.iter().any(|c| c.contains("./ffcx")));
}

#[tokio::test]
async fn test_sibling_replacing_core_library_is_version_conflict() {
    let set = demo_pipelines();
    let provisioner = MockProvisioner::new().on_pipeline(
        "dolfinx",
        &core_check_line(),
        Reply::Exit(CommandOutput {
            exit_code: Some(1),
            stderr: "fenics-ufl 2024.2.0 no longer comes from the working checkout: installed from an index"
                .to_string(),
            ..Default::default()
        }),
    );

    let aggregator = run_event(&set, pull_request(5), &provisioner, SchedulingStrategy::Parallel).await;

    assert_status(&aggregator, "dolfinx", PipelineStatus::InstallError);
    let dolfinx = aggregator.result("dolfinx").unwrap();
    assert_skipped_after_failure(dolfinx);
    let (step, failure) = dolfinx.first_failure().unwrap();
    assert_eq!(step.kind, StepKind::InstallRemote);
    assert!(matches!(
        failure,
        Failure::Install(e) if e.kind == InstallErrorKind::VersionConflict
    ));
    assert!(!provisioner
        .commands_of("dolfinx")
        .iter()
        .any(|c| c.contains("pytest")));

    assert_status(&aggregator, "ffcx", PipelineStatus::Pass);
}
