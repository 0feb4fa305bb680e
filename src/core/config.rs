//! Pipeline manifest loaded from YAML

use crate::core::{
    environment::EnvironmentSpec,
    pipeline::PipelineSet,
    step::{clone_dir, normalize_name, Requirement, StepKind, Workers},
    trigger::Trigger,
};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

/// Top-level manifest: the core library plus one record per downstream pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    /// The library whose candidate change is being verified
    pub core_library: CoreLibraryConfig,

    /// Branch scheduled runs test
    #[serde(default = "default_branch")]
    pub default_branch: String,

    /// Branches whose pull requests trigger runs (defaults to the default branch)
    #[serde(default)]
    pub protected_branches: Vec<String>,

    /// Run-wide defaults
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// Pipeline records
    pub pipelines: Vec<PipelineConfig>,
}

/// Core library under test
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreLibraryConfig {
    /// Distribution name, used for uninstall and install_local targets
    pub name: String,

    /// Path of the working checkout
    #[serde(default = "default_checkout")]
    pub checkout: PathBuf,
}

/// Run-wide defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    #[serde(default = "default_step_timeout")]
    pub step_timeout_secs: u64,

    #[serde(default = "default_test_timeout")]
    pub test_timeout_secs: u64,

    /// Upper bound on concurrently running pipelines
    #[serde(default)]
    pub max_parallel: Option<usize>,

    /// Extra provisioning attempts after a failure (never applied to steps)
    #[serde(default)]
    pub provision_retries: u32,

    #[serde(default = "default_backoff")]
    pub provision_backoff_secs: u64,

    /// Host command used to install system packages for fresh environments
    #[serde(default = "default_system_install")]
    pub system_install: Vec<String>,

    /// Directory fresh environments are created under
    #[serde(default)]
    pub work_root: Option<PathBuf>,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            step_timeout_secs: default_step_timeout(),
            test_timeout_secs: default_test_timeout(),
            max_parallel: None,
            provision_retries: 0,
            provision_backoff_secs: default_backoff(),
            system_install: default_system_install(),
            work_root: None,
        }
    }
}

/// One downstream pipeline as written in the manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub name: String,

    #[serde(default)]
    pub trigger: Trigger,

    pub environment: EnvironmentSpec,

    /// Environment variables exported to every step
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    pub steps: Vec<StepConfig>,
}

/// Step configuration as defined in YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepConfig {
    pub kind: StepKind,

    pub target: String,

    #[serde(default, rename = "ref")]
    pub git_ref: Option<String>,

    #[serde(default)]
    pub extras: Vec<String>,

    #[serde(default)]
    pub args: Vec<String>,

    /// Where an install_remote package comes from
    #[serde(default)]
    pub source: Option<RemoteSource>,

    /// Editable install (install_local only)
    #[serde(default)]
    pub editable: bool,

    /// Sub-directory of the clone to install (clone_downstream only)
    #[serde(default)]
    pub path: Option<String>,

    /// Parallel test workers: a number or "auto"
    #[serde(default)]
    pub workers: Option<Value>,

    /// Test entry point (run_tests only)
    #[serde(default)]
    pub command: Option<Vec<String>>,

    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// Source of a sibling library
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteSource {
    /// Latest published development snapshot
    #[default]
    Latest,
    /// The version the downstream project pins
    Pinned,
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_checkout() -> PathBuf {
    PathBuf::from(".")
}

fn default_step_timeout() -> u64 {
    3600
}

fn default_test_timeout() -> u64 {
    7200
}

fn default_backoff() -> u64 {
    10
}

fn default_system_install() -> Vec<String> {
    ["sudo", "apt-get", "install", "-y"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl StepConfig {
    /// Parse the `workers` field
    pub fn parsed_workers(&self) -> Result<Option<Workers>> {
        match &self.workers {
            None => Ok(None),
            Some(Value::String(s)) if s == "auto" => Ok(Some(Workers::Auto)),
            Some(Value::Number(n)) => match n.as_u64() {
                Some(0) | None => anyhow::bail!("workers must be a positive integer or \"auto\""),
                Some(n) => Ok(Some(Workers::Count(n as usize))),
            },
            Some(other) => anyhow::bail!(
                "workers must be a positive integer or \"auto\", got {}",
                serde_yaml::to_string(other).unwrap_or_default().trim()
            ),
        }
    }

    fn is_pinned_requirement(&self) -> bool {
        self.git_ref.is_some() || Requirement::parse(&self.target).is_pinned()
    }
}

impl Manifest {
    /// Load a manifest from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse a manifest from a YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let manifest: Manifest = serde_yaml::from_str(yaml)?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Validate the manifest
    pub fn validate(&self) -> Result<()> {
        if self.core_library.name.trim().is_empty() {
            anyhow::bail!("core_library.name must not be empty");
        }
        if self.pipelines.is_empty() {
            anyhow::bail!("Manifest declares no pipelines");
        }
        if self.defaults.system_install.is_empty() {
            anyhow::bail!("defaults.system_install must name a command");
        }
        if self.defaults.max_parallel == Some(0) {
            anyhow::bail!("defaults.max_parallel must be at least 1");
        }

        let mut seen = HashSet::new();
        for pipeline in &self.pipelines {
            if pipeline.name.trim().is_empty() {
                anyhow::bail!("Pipeline name must not be empty");
            }
            if !seen.insert(&pipeline.name) {
                anyhow::bail!("Duplicate pipeline name: {}", pipeline.name);
            }
            self.validate_pipeline(pipeline)?;
        }

        Ok(())
    }

    fn validate_pipeline(&self, pipeline: &PipelineConfig) -> Result<()> {
        let name = &pipeline.name;
        let core = &self.core_library.name;
        let core_key = normalize_name(core);

        if !pipeline.trigger.on_pull_request && pipeline.trigger.on_schedule.is_none() {
            anyhow::bail!("Pipeline '{}' has no trigger", name);
        }
        if let Some(Err(e)) = pipeline.trigger.schedule() {
            anyhow::bail!("Pipeline '{}': {}", name, e);
        }
        if pipeline.environment.base.trim().is_empty() {
            anyhow::bail!("Pipeline '{}' environment has no base", name);
        }
        if pipeline.steps.is_empty() {
            anyhow::bail!("Pipeline '{}' has no steps", name);
        }

        let positions = |kind: StepKind| -> Vec<usize> {
            pipeline
                .steps
                .iter()
                .enumerate()
                .filter(|(_, s)| s.kind == kind)
                .map(|(i, _)| i)
                .collect()
        };

        let install_local = positions(StepKind::InstallLocal);
        let local_at = match install_local.as_slice() {
            [i] => *i,
            [] => anyhow::bail!("Pipeline '{}' never installs {} from the working checkout", name, core),
            _ => anyhow::bail!("Pipeline '{}' installs {} more than once", name, core),
        };

        let uninstall = positions(StepKind::Uninstall);
        if pipeline.environment.kind.requires_uninstall()
            && !uninstall.iter().any(|&i| i < local_at)
        {
            anyhow::bail!(
                "Pipeline '{}' uses a pre-baked environment and must uninstall {} before install_local",
                name,
                core
            );
        }

        let run_tests = positions(StepKind::RunTests);
        if run_tests.is_empty() {
            anyhow::bail!("Pipeline '{}' never runs tests", name);
        }
        let last_install = pipeline
            .steps
            .iter()
            .rposition(|s| s.kind.is_install())
            .unwrap_or(local_at);
        if run_tests.iter().any(|&i| i < last_install) {
            anyhow::bail!("Pipeline '{}' runs tests before all dependencies are installed", name);
        }

        let first_clone = positions(StepKind::CloneDownstream).first().copied();

        for (i, step) in pipeline.steps.iter().enumerate() {
            if step.target.trim().is_empty() {
                anyhow::bail!("Pipeline '{}' step {} has no target", name, i);
            }
            step.parsed_workers()
                .map_err(|e| anyhow::anyhow!("Pipeline '{}' step {}: {}", name, i, e))?;

            match step.kind {
                StepKind::Uninstall => {
                    if normalize_name(&step.target) != core_key {
                        anyhow::bail!(
                            "Pipeline '{}' step {} uninstalls '{}'; only the core library may be uninstalled",
                            name, i, step.target
                        );
                    }
                    if i > local_at {
                        anyhow::bail!("Pipeline '{}' uninstalls {} after installing it", name, core);
                    }
                }
                StepKind::InstallLocal => {
                    if normalize_name(&step.target) != core_key {
                        anyhow::bail!(
                            "Pipeline '{}' step {} installs '{}' from the working checkout; expected '{}'",
                            name, i, step.target, core
                        );
                    }
                }
                StepKind::InstallRemote | StepKind::CloneDownstream => {
                    let distribution = match step.kind {
                        StepKind::InstallRemote => {
                            let requirement = Requirement::parse(&step.target);
                            let Some(distribution) = requirement.name() else {
                                anyhow::bail!(
                                    "Pipeline '{}' step {} installs '{}' without naming the distribution; write '<name> @ {}'",
                                    name, i, step.target, step.target
                                );
                            };
                            if let (Some(_), Requirement::Named { specifier, .. }) =
                                (&step.git_ref, requirement)
                            {
                                if !specifier.is_empty() {
                                    anyhow::bail!(
                                        "Pipeline '{}' step {} gives '{}' both a version specifier and a ref",
                                        name, i, step.target
                                    );
                                }
                            }
                            distribution.to_string()
                        }
                        _ => clone_dir(&step.target),
                    };
                    if normalize_name(&distribution) == core_key {
                        anyhow::bail!(
                            "Pipeline '{}' step {} installs {} from a remote source; it must come from the working checkout",
                            name, i, core
                        );
                    }
                    if i < local_at {
                        anyhow::bail!(
                            "Pipeline '{}' step {} installs '{}' before {}",
                            name, i, step.target, core
                        );
                    }
                    if step.kind == StepKind::InstallRemote {
                        if first_clone.is_some_and(|c| c < i) {
                            anyhow::bail!(
                                "Pipeline '{}' step {} installs sibling '{}' after the downstream project",
                                name, i, step.target
                            );
                        }
                        if step.source == Some(RemoteSource::Pinned) && !step.is_pinned_requirement() {
                            anyhow::bail!(
                                "Pipeline '{}' step {} is pinned but '{}' carries no version or ref",
                                name, i, step.target
                            );
                        }
                    }
                }
                StepKind::RunTests => {
                    if step.command.as_ref().is_some_and(|c| c.is_empty()) {
                        anyhow::bail!("Pipeline '{}' step {} has an empty test command", name, i);
                    }
                }
            }
        }

        Ok(())
    }

    /// Convert the manifest into the pipeline registry
    pub fn to_pipelines(&self) -> PipelineSet {
        PipelineSet::from_manifest(self)
    }
}
