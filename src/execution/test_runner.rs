//! Test runner - builds the test command and classifies how the run ended

use crate::core::{
    context::Variables,
    error::{ExecError, TestExecutionError},
    state::Failure,
    step::Step,
};
use crate::environment::{CommandOutput, CommandSpec};
use super::installer::Layout;

/// Exit codes of the test harness
mod exit {
    pub const OK: i32 = 0;
    pub const TESTS_FAILED: i32 = 1;
    pub const INTERRUPTED: i32 = 2;
    pub const INTERNAL_ERROR: i32 = 3;
    pub const USAGE_ERROR: i32 = 4;
    pub const NO_TESTS_COLLECTED: i32 = 5;
}

/// The command a run_tests step executes
pub fn test_command(step: &Step, layout: &Layout, vars: &Variables) -> CommandSpec {
    let rendered_args = step.args.iter().map(|a| vars.render(a));

    if let Some(command) = &step.command {
        let mut parts = command.iter().map(|p| vars.render(p));
        let program = parts.next().unwrap_or_else(|| layout.python.clone());
        let args: Vec<String> = parts.chain(rendered_args).collect();
        return CommandSpec::new(program, args);
    }

    let mut args = vec![
        "-m".to_string(),
        "pytest".to_string(),
        vars.render(&step.target),
    ];
    if let Some(workers) = step.workers {
        args.push("-n".to_string());
        args.push(workers.as_arg());
    }
    args.extend(rendered_args);
    CommandSpec::new(layout.python.clone(), args)
}

/// Classify a finished test command. `None` means the suite passed.
pub fn classify_output(output: &CommandOutput) -> Option<Failure> {
    let Some(code) = output.exit_code else {
        let reason = match output.signal {
            Some(signal) => format!("killed by signal {}", signal),
            None => "terminated without an exit status".to_string(),
        };
        return Some(Failure::TestExecution(TestExecutionError::Crashed(reason)));
    };

    match code {
        exit::OK => None,
        exit::TESTS_FAILED => Some(Failure::TestFailure {
            failing_tests: failing_tests(&output.stdout),
        }),
        exit::INTERRUPTED => Some(Failure::TestExecution(TestExecutionError::Interrupted)),
        exit::NO_TESTS_COLLECTED => {
            Some(Failure::TestExecution(TestExecutionError::NoTestsCollected))
        }
        exit::INTERNAL_ERROR | exit::USAGE_ERROR => Some(Failure::TestExecution(
            TestExecutionError::Crashed(format!("harness exited with code {}: {}", code, output.tail(3))),
        )),
        other => Some(Failure::TestExecution(TestExecutionError::Crashed(format!(
            "exited with code {}",
            other
        )))),
    }
}

/// Classify a test command that never produced an exit status
pub fn classify_exec_error(error: &ExecError) -> Failure {
    let error = match error {
        ExecError::Timeout(secs) => TestExecutionError::TimedOut(*secs),
        ExecError::Cancelled => TestExecutionError::Interrupted,
        other => TestExecutionError::Crashed(other.to_string()),
    };
    Failure::TestExecution(error)
}

/// Failing test ids from the short test summary, in report order
pub fn failing_tests(stdout: &str) -> Vec<String> {
    let mut ids = Vec::new();
    for line in stdout.lines() {
        let rest = match line.strip_prefix("FAILED ").or_else(|| line.strip_prefix("ERROR ")) {
            Some(rest) => rest,
            None => continue,
        };
        let id = rest.split(" - ").next().unwrap_or(rest).trim();
        if !id.is_empty() && !ids.iter().any(|seen| seen == id) {
            ids.push(id.to_string());
        }
    }
    ids
}
