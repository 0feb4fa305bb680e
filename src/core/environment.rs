//! Environment specification

use serde::{Deserialize, Serialize};

/// How an execution environment is created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EnvironmentKind {
    /// A fixed, versioned container image with a broad dependency graph
    /// already installed. May carry a stale copy of the core library.
    PreBaked,
    /// A virtual environment built on the host after installing the
    /// declared OS-level build tooling
    Fresh,
}

impl EnvironmentKind {
    /// Pre-baked images need the bundled core library removed before the
    /// working checkout is installed
    pub fn requires_uninstall(&self) -> bool {
        matches!(self, EnvironmentKind::PreBaked)
    }
}

impl std::fmt::Display for EnvironmentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnvironmentKind::PreBaked => f.write_str("pre-baked"),
            EnvironmentKind::Fresh => f.write_str("fresh"),
        }
    }
}

/// Declared environment of a pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentSpec {
    pub kind: EnvironmentKind,

    /// Image reference for pre-baked environments, base interpreter for
    /// fresh ones
    pub base: String,

    /// OS packages installed before any step runs
    #[serde(default)]
    pub system_packages: Vec<String>,

    /// Interpreter used inside the environment
    #[serde(default)]
    pub python: Option<String>,
}

impl EnvironmentSpec {
    pub fn python(&self) -> &str {
        self.python.as_deref().unwrap_or("python3")
    }

    pub fn describe(&self) -> String {
        format!("{} {}", self.kind, self.base)
    }
}
