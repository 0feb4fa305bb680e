//! Dependency installer - turns install steps into pip/git commands and
//! classifies their failures

use crate::core::{
    context::Variables,
    error::{ExecError, InstallError, InstallErrorKind},
    step::{DependencySpec, Requirement, Step, StepKind},
};
use crate::environment::{CommandOutput, CommandSpec, Sandbox};
use regex::Regex;
use std::sync::LazyLock;

/// Paths inside a sandbox that generated commands refer to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    pub python: String,
    pub workdir: String,
    pub core_checkout: String,
    /// Distribution name of the core library
    pub core_name: String,
}

impl Layout {
    pub fn of(sandbox: &dyn Sandbox, core_name: &str) -> Self {
        Self {
            python: sandbox.python().to_string(),
            workdir: sandbox.workdir().to_string(),
            core_checkout: sandbox.core_checkout().to_string(),
            core_name: core_name.to_string(),
        }
    }

    /// Placeholder values every step may reference
    pub fn variables(&self, code_ref: &str) -> Variables {
        let mut vars = Variables::new();
        vars.set("python", self.python.clone());
        vars.set("workdir", self.workdir.clone());
        vars.set("core_checkout", self.core_checkout.clone());
        vars.set("code_ref", code_ref);
        vars
    }

    fn pip<I, S>(&self, args: I) -> CommandSpec
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut all = vec!["-m".to_string(), "pip".to_string()];
        all.extend(args.into_iter().map(Into::into));
        CommandSpec::new(self.python.clone(), all)
    }

    /// Fails unless the installed core library is still the one built from
    /// the checkout. pip records a local-directory install in the
    /// distribution's `direct_url.json`; a copy pulled from an index has none.
    pub fn core_source_check(&self) -> CommandSpec {
        CommandSpec::new(
            self.python.clone(),
            [
                "-c".to_string(),
                CORE_SOURCE_CHECK.to_string(),
                self.core_name.clone(),
                format!("file://{}", self.core_checkout),
            ],
        )
    }
}

const CORE_SOURCE_CHECK: &str = "import importlib.metadata as m, json, sys; \
d = m.distribution(sys.argv[1]); \
u = json.loads(d.read_text('direct_url.json') or '{}').get('url', ''); \
sys.exit(0 if u.rstrip('/') == sys.argv[2] else sys.argv[1] + ' ' + d.version + \
' no longer comes from the working checkout: ' + (u or 'installed from an index'))";

/// Commands an install step runs, in order
pub fn install_commands(step: &Step, layout: &Layout, vars: &Variables) -> Vec<CommandSpec> {
    let target = vars.render(&step.target);
    let extra_args: Vec<String> = step.args.iter().map(|a| vars.render(a)).collect();

    match step.kind {
        StepKind::Uninstall => {
            let mut args = vec!["uninstall".to_string(), "-y".to_string(), target];
            args.extend(extra_args);
            vec![layout.pip(args)]
        }

        StepKind::InstallLocal => {
            let mut args = vec!["install".to_string()];
            if step.editable {
                args.push("-e".to_string());
            }
            args.push(with_extras(&layout.core_checkout, &step.extras));
            args.extend(extra_args);
            vec![layout.pip(args)]
        }

        StepKind::InstallRemote => {
            let requirement = Requirement::parse(&target);
            let git_ref = step.git_ref.as_ref().map(|r| vars.render(r));
            let mut args = vec!["install".to_string()];
            // A URL or a ref already names the snapshot
            if step.source == Some(DependencySpec::PublishedLatest)
                && requirement.from_index()
                && git_ref.is_none()
            {
                args.push("--upgrade".to_string());
                args.push("--pre".to_string());
            }
            args.push(requirement.render(&step.extras, git_ref.as_deref()));
            args.extend(extra_args);
            vec![layout.pip(args), layout.core_source_check()]
        }

        StepKind::CloneDownstream => {
            let dir = step.clone_dir();
            let git_ref = match &step.source {
                Some(DependencySpec::GitRef(r)) => vars.render(r),
                _ => "main".to_string(),
            };

            let mut commands = if is_commit(&git_ref) {
                vec![
                    CommandSpec::new("git", ["clone", "--quiet", target.as_str(), dir.as_str()]),
                    CommandSpec::new("git", ["checkout", "--quiet", git_ref.as_str()])
                        .in_dir(dir.clone()),
                ]
            } else {
                vec![CommandSpec::new(
                    "git",
                    [
                        "clone",
                        "--quiet",
                        "--depth",
                        "1",
                        "--branch",
                        git_ref.as_str(),
                        target.as_str(),
                        dir.as_str(),
                    ],
                )]
            };

            let mut source_dir = format!("./{}", dir);
            if let Some(sub) = &step.path {
                source_dir = format!("{}/{}", source_dir, sub.trim_matches('/'));
            }
            let mut args = vec!["install".to_string(), with_extras(&source_dir, &step.extras)];
            args.extend(extra_args);
            commands.push(layout.pip(args));
            commands.push(layout.core_source_check());
            commands
        }

        StepKind::RunTests => Vec::new(),
    }
}

/// Classify a failed install command
pub fn classify_output(step: &Step, output: &CommandOutput) -> InstallError {
    let text = output.combined();
    let kind = if VERSION_CONFLICT.is_match(&text) {
        InstallErrorKind::VersionConflict
    } else if MISSING_SYSTEM_DEPENDENCY.is_match(&text) {
        InstallErrorKind::MissingSystemDependency
    } else {
        InstallErrorKind::Other
    };

    InstallError {
        kind,
        target: step.target.clone(),
        exit_code: output.exit_code,
    }
}

/// Classify an install command that never produced an exit status
pub fn classify_exec_error(step: &Step, error: &ExecError) -> InstallError {
    let kind = match error {
        ExecError::Timeout(_) => InstallErrorKind::Timeout,
        ExecError::Spawn { source, .. } if source.kind() == std::io::ErrorKind::NotFound => {
            InstallErrorKind::MissingSystemDependency
        }
        _ => InstallErrorKind::Other,
    };
    InstallError {
        kind,
        target: step.target.clone(),
        exit_code: None,
    }
}

static VERSION_CONFLICT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(ResolutionImpossible|conflicting dependencies|no longer comes from the working checkout|Could not find a version that satisfies|No matching distribution found|requires a different Python)",
    )
    .expect("Invalid regex pattern")
});

static MISSING_SYSTEM_DEPENDENCY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(command not found|executable file not found|fatal error: [^\n]*\.h: No such file|was not found in the pkg-config search path|Could NOT find|CMake Error|error: command '[^']*' failed|No CMAKE_[A-Z_]+_COMPILER could be found)",
    )
    .expect("Invalid regex pattern")
});

fn with_extras(base: &str, extras: &[String]) -> String {
    if extras.is_empty() {
        base.to_string()
    } else {
        format!("{}[{}]", base, extras.join(","))
    }
}

fn is_commit(git_ref: &str) -> bool {
    git_ref.len() == 40 && git_ref.chars().all(|c| c.is_ascii_hexdigit())
}
