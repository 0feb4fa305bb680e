//! CLI output formatting

use crate::{
    core::state::{JobResult, PipelineStatus},
    execution::ExecutionEvent,
    persistence::{FlakyPipeline, RunRecord},
};
use console::Emoji;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

// Re-export style
pub use console::style;

// Emojis for output
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "✓ ");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "✗ ");
pub static SPINNER: Emoji<'_, '_> = Emoji("⏳ ", "~ ");
pub static INFO: Emoji<'_, '_> = Emoji("ℹ️  ", "i ");
pub static WARN: Emoji<'_, '_> = Emoji("⚠️  ", "! ");
pub static ROCKET: Emoji<'_, '_> = Emoji("🚀 ", "> ");
pub static SKIP: Emoji<'_, '_> = Emoji("⏭️  ", "- ");

/// Progress bar over the pipelines of a run
pub fn create_progress_bar(total: usize) -> ProgressBar {
    let progress = ProgressBar::new(total as u64);
    let style = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} pipelines {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-");
    progress.set_style(style);
    progress.enable_steady_tick(Duration::from_millis(100));
    progress
}

/// Format a pipeline status for display
pub fn format_status(status: PipelineStatus) -> String {
    match status {
        PipelineStatus::Pass => style("PASS").green().to_string(),
        PipelineStatus::TestFailure => style("TEST FAILURE").red().bold().to_string(),
        PipelineStatus::ProvisionError => style("PROVISION ERROR").yellow().to_string(),
        PipelineStatus::InstallError => style("INSTALL ERROR").yellow().to_string(),
        PipelineStatus::TestExecutionError => style("TEST EXECUTION ERROR").yellow().to_string(),
    }
}

fn status_icon(status: PipelineStatus) -> &'static Emoji<'static, 'static> {
    match status {
        PipelineStatus::Pass => &CHECK,
        PipelineStatus::TestFailure => &CROSS,
        _ => &WARN,
    }
}

/// Format an execution event for display
pub fn format_execution_event(event: &ExecutionEvent) -> String {
    match event {
        ExecutionEvent::PipelineStarted {
            run_id,
            pipeline,
            code_ref,
        } => format!(
            "{} {} at {} ({})",
            ROCKET,
            style(pipeline).bold(),
            style(code_ref).cyan(),
            style(&run_id.to_string()[..8]).dim()
        ),
        ExecutionEvent::ProvisionFailed {
            pipeline,
            error,
            attempts,
        } => format!(
            "{} {}: provisioning failed after {} attempt(s): {}",
            WARN,
            style(pipeline).bold(),
            attempts,
            style(error).dim()
        ),
        ExecutionEvent::StepStarted {
            pipeline,
            index,
            label,
        } => format!(
            "{} {} [{}] {}",
            SPINNER,
            style(pipeline).dim(),
            index,
            style(label).cyan()
        ),
        ExecutionEvent::StepCompleted {
            pipeline,
            index,
            duration_ms,
        } => format!(
            "{} {} [{}] done in {}",
            CHECK,
            style(pipeline).dim(),
            index,
            format_duration(Duration::from_millis(*duration_ms))
        ),
        ExecutionEvent::StepFailed {
            pipeline,
            index,
            error,
        } => format!(
            "{} {} [{}] {}",
            CROSS,
            style(pipeline).dim(),
            index,
            style(error).red()
        ),
        ExecutionEvent::StepSkipped { pipeline, index } => format!(
            "{} {} [{}] {}",
            SKIP,
            style(pipeline).dim(),
            index,
            style("skipped").dim()
        ),
        ExecutionEvent::PipelineCompleted { pipeline, status } => format!(
            "{}{} {}",
            status_icon(*status),
            style(pipeline).bold(),
            format_status(*status)
        ),
        ExecutionEvent::PipelineCancelled { pipeline } => format!(
            "{} {} {}",
            INFO,
            style(pipeline).bold(),
            style("cancelled").yellow()
        ),
    }
}

/// Final summary line for one pipeline
pub fn format_result(result: &JobResult) -> String {
    let status = result.status();
    let mut line = format!(
        "{}{} {} ({})",
        status_icon(status),
        style(&result.pipeline).bold(),
        format_status(status),
        style(format_duration(Duration::from_millis(result.duration_ms()))).dim()
    );
    if let Some(reason) = result.reason() {
        line.push_str(&format!("\n    {}", style(reason).dim()));
    }
    for test in result.failing_tests() {
        line.push_str(&format!("\n    {} {}", style("FAILED").red(), test));
    }
    line
}

/// Format a run record for display
pub fn format_record(record: &RunRecord) -> String {
    format!(
        "{}{} - {} - {} - {} - {}",
        status_icon(record.status),
        style(&record.run_id.to_string()[..8]).dim(),
        style(&record.pipeline_name).bold(),
        style(&record.code_ref).cyan(),
        format_status(record.status),
        style(record.recorded_at.format("%Y-%m-%d %H:%M:%S")).dim()
    )
}

pub fn format_flaky(flaky: &FlakyPipeline) -> String {
    let statuses: Vec<&str> = flaky.statuses.iter().map(PipelineStatus::as_str).collect();
    format!(
        "{}{} at {}: {} across {} runs",
        WARN,
        style(&flaky.pipeline_name).bold(),
        style(&flaky.code_ref).cyan(),
        statuses.join(", "),
        flaky.runs
    )
}

/// Last `max_lines` lines of captured output
pub fn format_tail(output: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = output.trim_end().lines().collect();

    if lines.len() <= max_lines {
        lines.join("\n")
    } else {
        format!(
            "{}\n{}",
            style(format!("[{} earlier lines]", lines.len() - max_lines)).dim(),
            lines[lines.len() - max_lines..].join("\n")
        )
    }
}

pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
