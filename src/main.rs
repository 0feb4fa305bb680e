use anyhow::{Context, Result};
use downstream::cli::commands::{
    EventArgs, HistoryCommand, ListCommand, ResolveCommand, RunCommand, ValidateCommand,
};
use downstream::cli::output::*;
use downstream::cli::{Cli, Command};
use downstream::core::config::Manifest;
use downstream::core::pipeline::PipelineSet;
use downstream::core::trigger::{ResolvedRun, TriggerResolver};
use downstream::environment::{
    ContainerProvisioner, DefaultProvisioner, ProvisionPolicy, VirtualEnvProvisioner,
};
use downstream::execution::{
    ExecutionEvent, LeaseDir, PipelineEngine, ResultAggregator, RunOutcome, RunScheduler,
    SupersessionRegistry,
};
use downstream::persistence::{InMemoryRunLog, RunLog, RunRecord};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

/// Lines of a failing step's output shown without --verbose
const FAILURE_TAIL_LINES: usize = 40;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::from_args();

    // Initialize logging; RUST_LOG wins over --verbose
    let default_level = if cli.verbose { "downstream=debug" } else { "downstream=warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to set logging subscriber: {}", e))?;

    let code = match &cli.command {
        Command::Run(cmd) => run(cmd, &cli).await?,
        Command::Resolve(cmd) => resolve(cmd, &cli)?,
        Command::Validate(cmd) => validate(cmd, &cli)?,
        Command::List(cmd) => list(cmd, &cli)?,
        Command::History(cmd) => history(cmd).await?,
    };

    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

fn load_pipelines(cli: &Cli) -> Result<(Manifest, PipelineSet)> {
    let manifest = Manifest::from_file(&cli.config)
        .with_context(|| format!("Failed to load manifest {}", cli.config.display()))?;
    let mut set = manifest.to_pipelines();
    if let Some(checkout) = &cli.checkout {
        set = set.with_checkout(checkout.clone());
    }
    Ok((manifest, set))
}

fn resolve_event(event: &EventArgs, set: &PipelineSet) -> Result<ResolvedRun> {
    let event = event.to_event()?;
    let resolved = TriggerResolver::for_pipelines(set).resolve(&event, set)?;
    Ok(resolved)
}

async fn open_run_log(no_history: bool) -> Result<Arc<dyn RunLog>> {
    if no_history {
        return Ok(Arc::new(InMemoryRunLog::new()));
    }

    #[cfg(feature = "sqlite")]
    {
        let log = downstream::persistence::SqliteRunLog::with_default_path().await?;
        Ok(Arc::new(log))
    }

    #[cfg(not(feature = "sqlite"))]
    {
        warn!("Built without sqlite support; results will not be kept");
        Ok(Arc::new(InMemoryRunLog::new()))
    }
}

async fn run(cmd: &RunCommand, cli: &Cli) -> Result<i32> {
    let (manifest, set) = load_pipelines(cli)?;

    let mut resolved = resolve_event(&cmd.event, &set)?;
    resolved.restrict(&cmd.only)?;

    println!(
        "{} {} run of {} at {}",
        INFO,
        style(&resolved.trigger).bold(),
        style(&set.core.name).bold(),
        style(&resolved.code_ref).cyan()
    );

    if resolved.pipelines.is_empty() {
        println!("{} No pipelines selected", INFO);
        return Ok(0);
    }

    let run_log = open_run_log(cmd.no_history).await?;

    let defaults = &manifest.defaults;
    let work_root = defaults
        .work_root
        .clone()
        .unwrap_or_else(VirtualEnvProvisioner::default_work_root);
    let provisioner = DefaultProvisioner::new(
        ContainerProvisioner::new(cmd.container_runtime.clone()),
        VirtualEnvProvisioner::new(defaults.system_install.clone(), work_root),
    );
    let policy = ProvisionPolicy {
        retries: cmd.provision_retries.unwrap_or(defaults.provision_retries),
        backoff: Duration::from_secs(defaults.provision_backoff_secs),
    };

    let progress = create_progress_bar(resolved.pipelines.len());
    let mut engine = PipelineEngine::new(Arc::new(provisioner)).with_policy(policy);
    {
        let progress = progress.clone();
        engine.add_event_handler(move |event| {
            progress.println(format_execution_event(&event));
            if matches!(
                event,
                ExecutionEvent::PipelineCompleted { .. } | ExecutionEvent::PipelineCancelled { .. }
            ) {
                progress.inc(1);
            }
        });
    }

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, cancelling in-flight pipelines");
                shutdown.cancel();
            }
        });
    }

    // Runs started by other invocations under the same key supersede this one
    let lease = match LeaseDir::default_dir() {
        Some(dir) => match LeaseDir::new(dir)
            .acquire(&resolved.concurrency_key, &resolved.code_ref, shutdown.clone())
            .await
        {
            Ok(lease) => Some(lease),
            Err(e) => {
                warn!(error = %format!("{:#}", e), "Running without a cross-process lease");
                None
            }
        },
        None => {
            warn!("No local data directory; running without a cross-process lease");
            None
        }
    };

    let registry = Arc::new(SupersessionRegistry::new(shutdown));
    let strategy = cmd.scheduling_strategy(defaults.max_parallel);
    let scheduler = RunScheduler::new(Arc::new(engine), strategy, registry);

    let outcomes = scheduler.execute(&resolved, &set).await;
    progress.finish_and_clear();
    if let Some(lease) = lease {
        lease.release().await;
    }

    let mut aggregator = ResultAggregator::new();
    for outcome in outcomes {
        if let RunOutcome::Completed(result) = &outcome {
            let record = RunRecord::from_result(result, &resolved.trigger);
            if let Err(e) = run_log.append(&record).await {
                error!(pipeline = %result.pipeline, error = %e, "Failed to record run");
            }
        }
        aggregator.record(outcome);
    }

    println!();
    for result in aggregator.results() {
        println!("{}", format_result(result));
        if let Some(output) = result.failure_output() {
            let max_lines = if cli.verbose { usize::MAX } else { FAILURE_TAIL_LINES };
            println!("{}", format_tail(&output, max_lines));
        }
    }
    println!("\n{}", style("Summary:").bold());
    for line in aggregator.status_lines() {
        println!("  {}", line);
    }
    let counts: Vec<String> = aggregator
        .counts()
        .iter()
        .map(|(status, n)| format!("{} {}", n, status))
        .collect();
    if !counts.is_empty() {
        println!("  ({})", style(counts.join(", ")).dim());
    }

    if let Some(path) = &cmd.report {
        aggregator.write_report(path, &resolved.code_ref, &resolved.trigger)?;
        println!("\n{} Report written to {}", INFO, style(path.display()).dim());
    }

    let code = aggregator.exit_code();
    if code == 0 {
        println!("\n{} All {} pipeline(s) {}", CHECK, resolved.pipelines.len(), style("passed").green());
    } else {
        println!("\n{} Downstream verification {}", CROSS, style("failed").red());
    }
    Ok(code)
}

fn resolve(cmd: &ResolveCommand, cli: &Cli) -> Result<i32> {
    let (_, set) = load_pipelines(cli)?;
    let resolved = match resolve_event(&cmd.event, &set) {
        Ok(resolved) => resolved,
        Err(e) => {
            println!("{} {}", CROSS, style(format!("{:#}", e)).red());
            return Ok(1);
        }
    };

    if cmd.json {
        println!("{}", serde_json::to_string_pretty(&resolved)?);
        return Ok(0);
    }

    println!("{} Code ref: {}", INFO, style(&resolved.code_ref).cyan());
    println!("{} Concurrency key: {}", INFO, style(&resolved.concurrency_key).dim());
    if resolved.pipelines.is_empty() {
        println!("{} No pipelines selected", INFO);
    }
    for name in &resolved.pipelines {
        println!("  {}", style(name).bold());
    }
    Ok(0)
}

fn validate(cmd: &ValidateCommand, cli: &Cli) -> Result<i32> {
    println!("{} Validating {}...", INFO, cli.config.display());

    match Manifest::from_file(&cli.config) {
        Ok(manifest) => {
            println!("{} Manifest is valid!", CHECK);
            println!("  Core library: {}", style(&manifest.core_library.name).bold());
            println!("  Pipelines: {}", style(manifest.pipelines.len()).cyan());

            if cmd.json {
                let json = serde_json::to_string_pretty(&manifest)?;
                println!("\n{}", json);
            }
            Ok(0)
        }
        Err(e) => {
            println!("{} Validation failed:", CROSS);
            println!("  {}", style(format!("{:#}", e)).red());
            Ok(1)
        }
    }
}

fn list(cmd: &ListCommand, cli: &Cli) -> Result<i32> {
    let (_, set) = load_pipelines(cli)?;
    let now = chrono::Utc::now();

    if cmd.json {
        let pipelines: Vec<_> = set
            .iter()
            .map(|p| {
                serde_json::json!({
                    "name": p.name,
                    "environment": p.environment.describe(),
                    "on_pull_request": p.trigger.on_pull_request,
                    "on_schedule": p.trigger.on_schedule,
                    "next_tick": p.trigger.next_tick(now).map(|t| t.to_rfc3339()),
                    "steps": p.steps.iter().map(|s| s.label()).collect::<Vec<_>>(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&serde_json::json!({ "pipelines": pipelines }))?);
        return Ok(0);
    }

    println!("{} Pipelines for {}:", INFO, style(&set.core.name).bold());
    for pipeline in set.iter() {
        let mut triggers = Vec::new();
        if pipeline.trigger.on_pull_request {
            triggers.push("pull requests".to_string());
        }
        if let Some(cron) = &pipeline.trigger.on_schedule {
            triggers.push(format!("schedule '{}'", cron));
        }
        println!(
            "  {} ({}) - {}",
            style(&pipeline.name).bold(),
            style(pipeline.environment.describe()).dim(),
            triggers.join(", ")
        );
        if let Some(next) = pipeline.trigger.next_tick(now) {
            println!("    next tick: {}", style(next.format("%Y-%m-%d %H:%M UTC")).cyan());
        }
    }
    Ok(0)
}

async fn history(cmd: &HistoryCommand) -> Result<i32> {
    let log = open_run_log(false).await?;

    if cmd.flaky {
        let flaky = log.flaky_pipelines().await?;
        if cmd.json {
            println!("{}", serde_json::to_string_pretty(&flaky)?);
        } else if flaky.is_empty() {
            println!("{} No flaky pipelines found", INFO);
        } else {
            for entry in &flaky {
                println!("  {}", format_flaky(entry));
            }
        }
        return Ok(0);
    }

    let mut records = match (&cmd.pipeline, &cmd.code_ref) {
        (Some(pipeline), Some(code_ref)) => log.history(pipeline, code_ref).await?,
        (Some(pipeline), None) => log.list_for_pipeline(pipeline).await?,
        _ => {
            let mut all = Vec::new();
            for pipeline in log.list_pipelines().await? {
                all.extend(log.list_for_pipeline(&pipeline).await?);
            }
            all.sort_by(|a, b| b.recorded_at.cmp(&a.recorded_at));
            all
        }
    };
    records.truncate(cmd.limit);

    if cmd.json {
        println!("{}", serde_json::to_string_pretty(&serde_json::json!({ "runs": records }))?);
        return Ok(0);
    }

    if records.is_empty() {
        println!("{} No runs recorded", INFO);
        return Ok(0);
    }

    println!("{} Run history (latest {}):", INFO, records.len());
    for record in &records {
        println!("  {}", format_record(record));
    }
    Ok(0)
}
