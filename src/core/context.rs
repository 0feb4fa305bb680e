//! Run context - identity of a run and the variables steps may reference

use std::collections::BTreeMap;
use std::path::PathBuf;
use uuid::Uuid;

/// Everything a pipeline run knows about itself before it starts
#[derive(Debug, Clone)]
pub struct RunContext {
    /// Fresh for every run; environments embed it so none are ever reused
    pub run_id: Uuid,

    pub pipeline: String,

    /// Code ref of the core library under test
    pub code_ref: String,

    /// Host path of the core library's working checkout
    pub core_checkout: PathBuf,

    /// Name of the core library distribution
    pub core_name: String,

    /// Pipeline-level environment variables
    pub env: BTreeMap<String, String>,
}

impl RunContext {
    pub fn new(
        pipeline: impl Into<String>,
        code_ref: impl Into<String>,
        core_name: impl Into<String>,
        core_checkout: PathBuf,
    ) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            pipeline: pipeline.into(),
            code_ref: code_ref.into(),
            core_checkout,
            core_name: core_name.into(),
            env: BTreeMap::new(),
        }
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// Short identifier used for container and directory names
    pub fn slug(&self) -> String {
        let name: String = self
            .pipeline
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
            .collect();
        format!("{}-{}", name, &self.run_id.simple().to_string()[..12])
    }
}

/// Variables available to `{{ name }}` placeholders in step arguments
#[derive(Debug, Clone, Default)]
pub struct Variables {
    values: BTreeMap<String, String>,
}

impl Variables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&String> {
        self.values.get(key)
    }

    pub fn extend(&mut self, other: &BTreeMap<String, String>) {
        for (k, v) in other {
            self.values.insert(k.clone(), v.clone());
        }
    }

    /// Replace `{{ name }}` placeholders; unknown names are left as written
    pub fn render(&self, template: &str) -> String {
        let mut rendered = template.to_string();
        for (key, value) in &self.values {
            let placeholder = format!("{{{{ {} }}}}", key);
            rendered = rendered.replace(&placeholder, value);
        }
        rendered
    }
}
