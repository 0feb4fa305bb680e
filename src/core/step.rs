//! Step domain model

use crate::core::config::{RemoteSource, StepConfig};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

/// The kind of work a step performs inside its environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    /// Remove a stale published copy of the core library
    Uninstall,
    /// Install the core library from the working checkout
    InstallLocal,
    /// Install a sibling library from a published source
    InstallRemote,
    /// Fetch the downstream project at a ref and install it
    CloneDownstream,
    /// Run the downstream project's test suite
    RunTests,
}

impl StepKind {
    /// Steps whose failure is classified as an install error
    pub fn is_install(&self) -> bool {
        !matches!(self, StepKind::RunTests)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::Uninstall => "uninstall",
            StepKind::InstallLocal => "install_local",
            StepKind::InstallRemote => "install_remote",
            StepKind::CloneDownstream => "clone_downstream",
            StepKind::RunTests => "run_tests",
        }
    }
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where an installed package comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DependencySpec {
    /// The working checkout of the core library. The only source the
    /// core library is ever installed from.
    LocalCheckout,
    /// Latest published development snapshot
    PublishedLatest,
    /// Whatever version the downstream project pins
    ProjectPinned,
    /// A git ref of a cloned repository
    GitRef(String),
}

/// How many pytest workers a test step fans out to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Workers {
    Auto,
    Count(usize),
}

impl Workers {
    pub fn as_arg(&self) -> String {
        match self {
            Workers::Auto => "auto".to_string(),
            Workers::Count(n) => n.to_string(),
        }
    }
}

/// A single ordered unit of work in a pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    /// Position in the pipeline (0-based)
    pub index: usize,

    pub kind: StepKind,

    /// Package name, repository URL or test path depending on kind
    pub target: String,

    /// Branch, tag or commit for remote installs and clones
    pub git_ref: Option<String>,

    /// Optional feature sets (pip extras)
    pub extras: Vec<String>,

    /// Extra arguments appended to the generated command
    pub args: Vec<String>,

    /// Source of the package, for install steps
    pub source: Option<DependencySpec>,

    /// Editable install of the core library
    pub editable: bool,

    /// Sub-directory of a cloned repository to install
    pub path: Option<String>,

    /// Parallel test workers
    pub workers: Option<Workers>,

    /// Test entry point override
    pub command: Option<Vec<String>>,

    /// Time budget in seconds
    pub timeout_secs: u64,
}

/// Step timeouts applied when a step does not set its own
#[derive(Debug, Clone)]
pub struct StepDefaults {
    pub step_timeout_secs: u64,
    pub test_timeout_secs: u64,
}

impl Default for StepDefaults {
    fn default() -> Self {
        Self {
            step_timeout_secs: 3600,
            test_timeout_secs: 7200,
        }
    }
}

impl Step {
    /// Create a step from its configuration
    ///
    /// `workers` has already been checked by manifest validation, so an
    /// unparseable value here means "no fan-out".
    pub fn from_config(index: usize, config: &StepConfig, defaults: &StepDefaults) -> Self {
        let source = match config.kind {
            StepKind::InstallLocal => Some(DependencySpec::LocalCheckout),
            StepKind::InstallRemote => Some(match config.source.unwrap_or_default() {
                RemoteSource::Latest => DependencySpec::PublishedLatest,
                RemoteSource::Pinned => DependencySpec::ProjectPinned,
            }),
            StepKind::CloneDownstream => Some(DependencySpec::GitRef(
                config.git_ref.clone().unwrap_or_else(|| "main".to_string()),
            )),
            StepKind::Uninstall | StepKind::RunTests => None,
        };

        let default_timeout = if config.kind == StepKind::RunTests {
            defaults.test_timeout_secs
        } else {
            defaults.step_timeout_secs
        };

        Step {
            index,
            kind: config.kind,
            target: config.target.clone(),
            git_ref: config.git_ref.clone(),
            extras: config.extras.clone(),
            args: config.args.clone(),
            source,
            editable: config.editable,
            path: config.path.clone(),
            workers: config.parsed_workers().ok().flatten(),
            command: config.command.clone(),
            timeout_secs: config.timeout_secs.unwrap_or(default_timeout),
        }
    }

    /// Short human-readable label, e.g. `install_remote fenics-basix`
    pub fn label(&self) -> String {
        format!("{} {}", self.kind, self.target)
    }

    /// Directory name a cloned downstream project lands in
    pub fn clone_dir(&self) -> String {
        clone_dir(&self.target)
    }
}

/// Last path segment of a repository URL, without `.git`
pub fn clone_dir(url: &str) -> String {
    let trimmed = url.trim_end_matches('/').trim_end_matches(".git");
    trimmed
        .rsplit(&['/', ':'][..])
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or("downstream")
        .to_string()
}

static NAME_SEPARATORS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[-_.]+").expect("Invalid regex pattern"));

/// Normalised distribution name (PEP 503), so `Fenics_UFL` and `fenics-ufl` compare equal
pub fn normalize_name(name: &str) -> String {
    NAME_SEPARATORS
        .replace_all(name.trim(), "-")
        .to_ascii_lowercase()
}

/// A remote install target as written in the manifest
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requirement<'a> {
    /// `name[extras]<specifier>`, resolved against the package index
    Named {
        name: &'a str,
        extras: Option<&'a str>,
        specifier: &'a str,
    },
    /// `name[extras] @ url`
    Direct {
        name: &'a str,
        extras: Option<&'a str>,
        url: &'a str,
    },
    /// A URL with no distribution name
    Url(&'a str),
}

impl<'a> Requirement<'a> {
    pub fn parse(target: &'a str) -> Self {
        let target = target.trim();
        if target.starts_with("git@") || starts_with_scheme(target) {
            return Requirement::Url(target);
        }

        let end = target
            .find(|c: char| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
            .unwrap_or(target.len());
        let (name, mut rest) = target.split_at(end);
        if name.is_empty() {
            return Requirement::Url(target);
        }

        let mut extras = None;
        if let Some(inner) = rest.trim_start().strip_prefix('[') {
            if let Some((list, after)) = inner.split_once(']') {
                extras = Some(list.trim());
                rest = after;
            }
        }

        let rest = rest.trim();
        match rest.strip_prefix('@') {
            Some(url) => Requirement::Direct {
                name,
                extras,
                url: url.trim(),
            },
            None => Requirement::Named {
                name,
                extras,
                specifier: rest,
            },
        }
    }

    /// Distribution name, unknown for a bare URL
    pub fn name(&self) -> Option<&'a str> {
        match self {
            Requirement::Named { name, .. } | Requirement::Direct { name, .. } => Some(*name),
            Requirement::Url(_) => None,
        }
    }

    /// Resolved against the package index rather than fetched from a URL
    pub fn from_index(&self) -> bool {
        matches!(self, Requirement::Named { .. })
    }

    /// Whether the requirement fixes one version or ref
    pub fn is_pinned(&self) -> bool {
        match self {
            Requirement::Named { specifier, .. } => specifier.starts_with("=="),
            Requirement::Direct { url, .. } | Requirement::Url(url) => url_has_ref(url),
        }
    }

    /// pip argument for this requirement. Step extras replace any written
    /// inline; a ref becomes `==ref` on an index name and `@ref` on a URL.
    pub fn render(&self, step_extras: &[String], git_ref: Option<&str>) -> String {
        let extras = |inline: &Option<&str>| -> String {
            if !step_extras.is_empty() {
                format!("[{}]", step_extras.join(","))
            } else {
                inline.map(|e| format!("[{}]", e)).unwrap_or_default()
            }
        };
        let with_ref = |url: &str| match git_ref {
            Some(r) => format!("{}@{}", url, r),
            None => url.to_string(),
        };

        match self {
            Requirement::Named {
                name,
                extras: inline,
                specifier,
            } => {
                let specifier = match git_ref {
                    Some(r) if specifier.is_empty() => format!("=={}", r),
                    _ => specifier.to_string(),
                };
                format!("{}{}{}", name, extras(inline), specifier)
            }
            Requirement::Direct {
                name,
                extras: inline,
                url,
            } => format!("{}{} @ {}", name, extras(inline), with_ref(*url)),
            Requirement::Url(url) => with_ref(*url),
        }
    }
}

fn starts_with_scheme(target: &str) -> bool {
    target.find("://").is_some_and(|i| {
        i > 0 && target[..i].chars().all(|c| c.is_ascii_alphanumeric() || c == '+')
    })
}

/// `...repo.git@v1.0` carries a ref; `ssh://git@host/repo` does not
fn url_has_ref(url: &str) -> bool {
    url.rsplit_once('@')
        .is_some_and(|(_, r)| !r.is_empty() && !r.contains('/'))
}
