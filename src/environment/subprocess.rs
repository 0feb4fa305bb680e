//! Subprocess execution with a time budget and cooperative cancellation

use crate::core::error::ExecError;
use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// A command to run inside a sandbox
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    /// Working directory as seen from inside the sandbox; the sandbox's
    /// own work directory when unset
    pub cwd: Option<String>,
    pub timeout_secs: u64,
}

impl CommandSpec {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            env: BTreeMap::new(),
            cwd: None,
            timeout_secs: 3600,
        }
    }

    pub fn with_env(mut self, env: &BTreeMap<String, String>) -> Self {
        self.env.extend(env.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    pub fn in_dir(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    /// The command line as a single string, for logs
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Captured result of a finished command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// None when the process was killed by a signal
    pub exit_code: Option<i32>,
    /// Terminating signal, if any
    pub signal: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Both streams, stderr last, for error classification
    pub fn combined(&self) -> String {
        format!("{}\n{}", self.stdout, self.stderr)
    }

    /// Trailing part of stderr (or stdout if stderr is empty), for error messages
    pub fn tail(&self, max_lines: usize) -> String {
        let source = if self.stderr.trim().is_empty() {
            &self.stdout
        } else {
            &self.stderr
        };
        let lines: Vec<&str> = source.trim_end().lines().collect();
        let start = lines.len().saturating_sub(max_lines);
        lines[start..].join("\n")
    }
}

/// Run a host command to completion, killing it on timeout or cancellation
pub async fn run(
    mut command: Command,
    program: &str,
    timeout_secs: u64,
    cancel: &CancellationToken,
) -> Result<CommandOutput, ExecError> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let started = Instant::now();
    let child = command.spawn().map_err(|source| ExecError::Spawn {
        program: program.to_string(),
        source,
    })?;

    // Dropping the pending future drops the child, which kills it
    let output = tokio::select! {
        biased;

        _ = cancel.cancelled() => return Err(ExecError::Cancelled),

        result = timeout(Duration::from_secs(timeout_secs), child.wait_with_output()) => {
            match result {
                Err(_) => return Err(ExecError::Timeout(timeout_secs)),
                Ok(output) => output.map_err(|source| ExecError::Wait {
                    program: program.to_string(),
                    source,
                })?,
            }
        }
    };

    let duration_ms = started.elapsed().as_millis() as u64;
    let result = CommandOutput {
        exit_code: output.status.code(),
        signal: exit_signal(&output.status),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        duration_ms,
    };

    debug!(
        program,
        exit_code = ?result.exit_code,
        duration_ms,
        "Subprocess finished"
    );

    Ok(result)
}

/// Build a host command from a spec, resolving relative `cwd` against `base`
pub fn host_command(spec: &CommandSpec, base: &Path) -> Command {
    let mut command = Command::new(&spec.program);
    command.args(&spec.args).envs(&spec.env);
    let cwd = match &spec.cwd {
        Some(dir) => base.join(dir),
        None => base.to_path_buf(),
    };
    command.current_dir(cwd);
    command
}

#[cfg(unix)]
fn exit_signal(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}
