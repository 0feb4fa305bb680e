//! Pipeline domain model

use crate::core::{
    config::{DefaultsConfig, Manifest, PipelineConfig},
    environment::EnvironmentSpec,
    step::{Step, StepDefaults, StepKind},
    trigger::Trigger,
};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// One independent provision → install → test sequence validating one
/// downstream project. Never mutated once loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pipeline {
    pub name: String,

    pub trigger: Trigger,

    pub environment: EnvironmentSpec,

    /// Environment variables exported to every step
    pub env: BTreeMap<String, String>,

    /// Totally ordered steps
    pub steps: Vec<Step>,
}

impl Pipeline {
    /// Create a pipeline from configuration
    pub fn from_config(config: &PipelineConfig, defaults: &StepDefaults) -> Self {
        let steps = config
            .steps
            .iter()
            .enumerate()
            .map(|(i, step_config)| Step::from_config(i, step_config, defaults))
            .collect();

        Pipeline {
            name: config.name.clone(),
            trigger: config.trigger.clone(),
            environment: config.environment.clone(),
            env: config.env.clone(),
            steps,
        }
    }

    /// Get a step by position
    pub fn step(&self, index: usize) -> Option<&Step> {
        self.steps.get(index)
    }

    /// Steps of a given kind, in order
    pub fn steps_of(&self, kind: StepKind) -> impl Iterator<Item = &Step> {
        self.steps.iter().filter(move |s| s.kind == kind)
    }
}

/// The core library under test
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreLibrary {
    pub name: String,
    pub checkout: PathBuf,
}

/// Registry of pipelines keyed by name, plus the run-wide settings they share
#[derive(Debug, Clone)]
pub struct PipelineSet {
    pub core: CoreLibrary,
    pub default_branch: String,
    pub protected_branches: Vec<String>,
    pub defaults: DefaultsConfig,
    pipelines: BTreeMap<String, Pipeline>,
}

impl PipelineSet {
    pub fn from_manifest(manifest: &Manifest) -> Self {
        let step_defaults = StepDefaults {
            step_timeout_secs: manifest.defaults.step_timeout_secs,
            test_timeout_secs: manifest.defaults.test_timeout_secs,
        };

        let pipelines = manifest
            .pipelines
            .iter()
            .map(|config| {
                let pipeline = Pipeline::from_config(config, &step_defaults);
                (pipeline.name.clone(), pipeline)
            })
            .collect();

        PipelineSet {
            core: CoreLibrary {
                name: manifest.core_library.name.clone(),
                checkout: manifest.core_library.checkout.clone(),
            },
            default_branch: manifest.default_branch.clone(),
            protected_branches: manifest.protected_branches.clone(),
            defaults: manifest.defaults.clone(),
            pipelines,
        }
    }

    pub fn get(&self, name: &str) -> Option<&Pipeline> {
        self.pipelines.get(name)
    }

    /// Pipelines in name order
    pub fn iter(&self) -> impl Iterator<Item = &Pipeline> {
        self.pipelines.values()
    }

    pub fn names(&self) -> Vec<String> {
        self.pipelines.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.pipelines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pipelines.is_empty()
    }

    /// Point the core library at a different working checkout
    pub fn with_checkout(mut self, checkout: PathBuf) -> Self {
        self.core.checkout = checkout;
        self
    }
}
