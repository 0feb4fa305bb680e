//! Test utilities: a scripted provisioner and helpers for running pipelines
//! without containers or virtual environments

#![allow(dead_code)]

use async_trait::async_trait;
use downstream::core::config::Manifest;
use downstream::core::context::RunContext;
use downstream::core::environment::EnvironmentSpec;
use downstream::core::error::{ExecError, ProvisionError};
use downstream::core::pipeline::PipelineSet;
use downstream::core::state::{JobResult, PipelineStatus, StepStatus};
use downstream::core::step::StepKind;
use downstream::core::trigger::{ResolvedRun, TriggerEvent, TriggerResolver};
use downstream::environment::{CommandOutput, CommandSpec, Provisioner, Sandbox};
use downstream::execution::installer::Layout;
use downstream::execution::{
    PipelineEngine, ResultAggregator, RunOutcome, RunScheduler, SchedulingStrategy,
    SupersessionRegistry,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Core checkout path as seen from inside a mock sandbox
pub const CORE_CHECKOUT: &str = "/sandbox/core-checkout";

/// The command that confirms the core library still comes from the
/// checkout, as a mock sandbox sees it
pub fn core_check_line() -> String {
    Layout {
        python: "python3".to_string(),
        workdir: "/sandbox".to_string(),
        core_checkout: CORE_CHECKOUT.to_string(),
        core_name: "fenics-ufl".to_string(),
    }
    .core_source_check()
    .display()
}

/// The demo manifest shipped with the repository
pub fn demo_manifest() -> Manifest {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/demos/fenicsx.yml");
    Manifest::from_file(path).unwrap_or_else(|e| panic!("Failed to load demo manifest: {:#}", e))
}

pub fn demo_pipelines() -> PipelineSet {
    demo_manifest().to_pipelines()
}

/// Parse a manifest from YAML
pub fn pipelines_from_yaml(yaml: &str) -> PipelineSet {
    Manifest::from_yaml(yaml)
        .unwrap_or_else(|e| panic!("Failed to parse manifest YAML: {:#}", e))
        .to_pipelines()
}

/// A finished command with the given exit code and stdout
pub fn exited(code: i32, stdout: &str) -> CommandOutput {
    CommandOutput {
        exit_code: Some(code),
        stdout: stdout.to_string(),
        ..Default::default()
    }
}

/// What a scripted command does
#[derive(Debug, Clone)]
pub enum Reply {
    Exit(CommandOutput),
    /// Block until the run is cancelled
    Hang,
    /// Exceed the command's time budget straight away
    TimeOut,
    /// The program could not be started
    Fail(String),
}

#[derive(Debug, Clone)]
struct Rule {
    needle: String,
    pipeline: Option<String>,
    code_ref: Option<String>,
    reply: Reply,
}

impl Rule {
    fn matches(&self, pipeline: &str, code_ref: &str, command: &str) -> bool {
        command.contains(&self.needle)
            && self.pipeline.as_deref().map_or(true, |p| p == pipeline)
            && self.code_ref.as_deref().map_or(true, |r| r == code_ref)
    }
}

/// One command a sandbox was asked to run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceEntry {
    pub sandbox: String,
    pub pipeline: String,
    pub command: String,
}

#[derive(Default)]
struct Shared {
    rules: Mutex<Vec<Rule>>,
    trace: Mutex<Vec<TraceEntry>>,
    provisioned: Mutex<Vec<String>>,
    discarded: Mutex<Vec<String>>,
    active: AtomicUsize,
    peak: AtomicUsize,
    counter: AtomicUsize,
}

/// Provisioner whose sandboxes replay scripted replies. Commands without a
/// matching rule exit 0.
#[derive(Clone, Default)]
pub struct MockProvisioner {
    shared: Arc<Shared>,
    failing: Arc<Mutex<HashSet<String>>>,
    provision_delay: Option<Duration>,
}

impl MockProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every sandbox answers commands containing `needle` with `reply`
    pub fn on(self, needle: &str, reply: Reply) -> Self {
        self.push_rule(needle, None, None, reply);
        self
    }

    /// Only the named pipeline's sandbox answers `needle` with `reply`
    pub fn on_pipeline(self, pipeline: &str, needle: &str, reply: Reply) -> Self {
        self.push_rule(needle, Some(pipeline), None, reply);
        self
    }

    /// Only sandboxes testing `code_ref` answer `needle` with `reply`
    pub fn on_ref(self, code_ref: &str, needle: &str, reply: Reply) -> Self {
        self.push_rule(needle, None, Some(code_ref), reply);
        self
    }

    /// Provisioning for the named pipeline always fails
    pub fn failing_provision(self, pipeline: &str) -> Self {
        self.failing.lock().unwrap().insert(pipeline.to_string());
        self
    }

    /// Hold each provisioning call for `delay`
    pub fn with_provision_delay(mut self, delay: Duration) -> Self {
        self.provision_delay = Some(delay);
        self
    }

    fn push_rule(&self, needle: &str, pipeline: Option<&str>, code_ref: Option<&str>, reply: Reply) {
        self.shared.rules.lock().unwrap().push(Rule {
            needle: needle.to_string(),
            pipeline: pipeline.map(str::to_string),
            code_ref: code_ref.map(str::to_string),
            reply,
        });
    }

    /// Every command run so far, across all sandboxes
    pub fn trace(&self) -> Vec<TraceEntry> {
        self.shared.trace.lock().unwrap().clone()
    }

    /// Commands run by one pipeline
    pub fn commands_of(&self, pipeline: &str) -> Vec<String> {
        self.trace()
            .into_iter()
            .filter(|t| t.pipeline == pipeline)
            .map(|t| t.command)
            .collect()
    }

    pub fn provisioned(&self) -> Vec<String> {
        self.shared.provisioned.lock().unwrap().clone()
    }

    pub fn discarded(&self) -> Vec<String> {
        self.shared.discarded.lock().unwrap().clone()
    }

    /// Most sandboxes alive at the same time
    pub fn peak_concurrency(&self) -> usize {
        self.shared.peak.load(Ordering::SeqCst)
    }

    pub fn provision_attempts(&self) -> usize {
        self.shared.counter.load(Ordering::SeqCst)
    }

    /// Wait until some command containing `needle` has started
    pub async fn wait_for(&self, needle: &str) {
        for _ in 0..500 {
            if self.trace().iter().any(|t| t.command.contains(needle)) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("No command containing '{}' was started", needle);
    }
}

#[async_trait]
impl Provisioner for MockProvisioner {
    async fn provision(
        &self,
        _spec: &EnvironmentSpec,
        ctx: &RunContext,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn Sandbox>, ProvisionError> {
        let n = self.shared.counter.fetch_add(1, Ordering::SeqCst);

        if let Some(delay) = self.provision_delay {
            tokio::select! {
                _ = cancel.cancelled() => return Err(ProvisionError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }

        if self.failing.lock().unwrap().contains(&ctx.pipeline) {
            return Err(ProvisionError::ImagePull {
                image: "registry.invalid/image:latest".to_string(),
                output: "manifest unknown".to_string(),
            });
        }

        let id = format!("{}-{}", ctx.slug(), n);
        self.shared.provisioned.lock().unwrap().push(id.clone());
        let active = self.shared.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.peak.fetch_max(active, Ordering::SeqCst);

        Ok(Box::new(MockSandbox {
            id,
            pipeline: ctx.pipeline.clone(),
            code_ref: ctx.code_ref.clone(),
            shared: self.shared.clone(),
        }))
    }
}

pub struct MockSandbox {
    id: String,
    pipeline: String,
    code_ref: String,
    shared: Arc<Shared>,
}

#[async_trait]
impl Sandbox for MockSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    fn workdir(&self) -> &str {
        "/sandbox"
    }

    fn python(&self) -> &str {
        "python3"
    }

    fn core_checkout(&self) -> &str {
        CORE_CHECKOUT
    }

    async fn exec(
        &self,
        command: &CommandSpec,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput, ExecError> {
        let line = command.display();
        self.shared.trace.lock().unwrap().push(TraceEntry {
            sandbox: self.id.clone(),
            pipeline: self.pipeline.clone(),
            command: line.clone(),
        });

        let reply = self
            .shared
            .rules
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.matches(&self.pipeline, &self.code_ref, &line))
            .map(|r| r.reply.clone());

        match reply {
            None => Ok(exited(0, "")),
            Some(Reply::Exit(output)) => Ok(output),
            Some(Reply::Fail(reason)) => Err(ExecError::Spawn {
                program: command.program.clone(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, reason),
            }),
            Some(Reply::TimeOut) => Err(ExecError::Timeout(command.timeout_secs)),
            Some(Reply::Hang) => tokio::select! {
                _ = cancel.cancelled() => Err(ExecError::Cancelled),
                _ = tokio::time::sleep(Duration::from_secs(30)) => Err(ExecError::Timeout(30)),
            },
        }
    }

    async fn discard(&self) {
        self.shared.active.fetch_sub(1, Ordering::SeqCst);
        self.shared.discarded.lock().unwrap().push(self.id.clone());
    }
}

/// Resolve an event against a pipeline set
pub fn resolve(set: &PipelineSet, event: TriggerEvent) -> ResolvedRun {
    TriggerResolver::for_pipelines(set)
        .resolve(&event, set)
        .unwrap_or_else(|e| panic!("Failed to resolve event: {}", e))
}

pub fn pull_request(number: u64) -> TriggerEvent {
    TriggerEvent::PullRequest {
        number,
        source_ref: None,
        target_branch: "main".to_string(),
    }
}

pub fn manual() -> TriggerEvent {
    TriggerEvent::Manual { git_ref: None }
}

/// Scheduler wired to a mock provisioner
pub fn scheduler(
    provisioner: &MockProvisioner,
    strategy: SchedulingStrategy,
    registry: Arc<SupersessionRegistry>,
) -> RunScheduler {
    let engine = PipelineEngine::new(Arc::new(provisioner.clone()));
    RunScheduler::new(Arc::new(engine), strategy, registry)
}

/// Run every pipeline an event selects and aggregate the outcomes
pub async fn run_event(
    set: &PipelineSet,
    event: TriggerEvent,
    provisioner: &MockProvisioner,
    strategy: SchedulingStrategy,
) -> ResultAggregator {
    let run = resolve(set, event);
    let registry = Arc::new(SupersessionRegistry::default());
    let outcomes = scheduler(provisioner, strategy, registry)
        .execute(&run, set)
        .await;

    let mut aggregator = ResultAggregator::new();
    for outcome in outcomes {
        aggregator.record(outcome);
    }
    aggregator
}

/// Unwrap a completed outcome
pub fn completed(outcome: &RunOutcome) -> &JobResult {
    match outcome {
        RunOutcome::Completed(result) => result,
        RunOutcome::Cancelled { pipeline } => panic!("Pipeline '{}' was cancelled", pipeline),
    }
}

/// Assert a pipeline finished with the given status
pub fn assert_status(aggregator: &ResultAggregator, pipeline: &str, expected: PipelineStatus) {
    let result = aggregator
        .result(pipeline)
        .unwrap_or_else(|| panic!("No result recorded for '{}'", pipeline));
    assert_eq!(
        result.status(),
        expected,
        "Pipeline '{}' status: {:?}\nreason: {:?}",
        pipeline,
        result.status(),
        result.reason()
    );
}

/// Assert every step after the first failure was skipped
pub fn assert_skipped_after_failure(result: &JobResult) {
    let Some(position) = result
        .steps
        .iter()
        .position(|s| matches!(s.status, StepStatus::Failed { .. }))
    else {
        panic!("Pipeline '{}' has no failed step", result.pipeline);
    };

    for step in &result.steps[position + 1..] {
        assert_eq!(
            step.status,
            StepStatus::Skipped,
            "Step {} ({}) of '{}' should have been skipped",
            step.index,
            step.kind,
            result.pipeline
        );
        assert!(step.stdout.is_empty() && step.stderr.is_empty());
    }
}

/// Kinds of the steps that actually ran, in order
pub fn executed_kinds(result: &JobResult) -> Vec<StepKind> {
    result.executed_steps().map(|s| s.kind).collect()
}
