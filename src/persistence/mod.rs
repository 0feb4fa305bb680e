//! Append-only log of pipeline run results
//!
//! Every completed pipeline run is recorded once, keyed by pipeline name,
//! code ref and timestamp. Records are never updated or deleted, so the log
//! can be used to spot pipelines whose outcome changes between runs of the
//! same code ref.

#[cfg(feature = "sqlite")]
pub mod store;

#[cfg(feature = "sqlite")]
pub use store::SqliteRunLog;

use crate::core::state::{JobResult, PipelineStatus};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

/// One recorded pipeline run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: Uuid,

    pub pipeline_name: String,

    pub code_ref: String,

    /// When the run finished
    pub recorded_at: DateTime<Utc>,

    /// Event kind that started the run
    pub trigger: String,

    pub status: PipelineStatus,

    pub duration_ms: u64,

    /// Why the run did not pass
    pub reason: Option<String>,

    pub failing_tests: Vec<String>,

    /// Captured output behind a non-passing status
    #[serde(default)]
    pub failure_output: Option<String>,
}

impl RunRecord {
    pub fn from_result(result: &JobResult, trigger: &str) -> Self {
        Self {
            run_id: result.run_id,
            pipeline_name: result.pipeline.clone(),
            code_ref: result.code_ref.clone(),
            recorded_at: result.finished_at,
            trigger: trigger.to_string(),
            status: result.status(),
            duration_ms: result.duration_ms(),
            reason: result.reason(),
            failing_tests: result.failing_tests().to_vec(),
            failure_output: result.failure_output(),
        }
    }

    fn key(&self) -> (String, String, DateTime<Utc>) {
        (
            self.pipeline_name.clone(),
            self.code_ref.clone(),
            self.recorded_at,
        )
    }
}

/// A (pipeline, code ref) pair that has ended in more than one status
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlakyPipeline {
    pub pipeline_name: String,
    pub code_ref: String,
    pub statuses: Vec<PipelineStatus>,
    pub runs: usize,
}

/// Trait for run log backends
#[async_trait::async_trait]
pub trait RunLog: Send + Sync {
    /// Append a record. Fails if a record with the same key exists.
    async fn append(&self, record: &RunRecord) -> Result<()>;

    /// Load a record by run ID
    async fn load(&self, run_id: Uuid) -> Result<Option<RunRecord>>;

    /// All records for a pipeline, newest first
    async fn list_for_pipeline(&self, pipeline_name: &str) -> Result<Vec<RunRecord>>;

    /// Every pipeline name with at least one record
    async fn list_pipelines(&self) -> Result<Vec<String>>;

    /// Records for a pipeline at one code ref, newest first
    async fn history(&self, pipeline_name: &str, code_ref: &str) -> Result<Vec<RunRecord>> {
        Ok(self
            .list_for_pipeline(pipeline_name)
            .await?
            .into_iter()
            .filter(|r| r.code_ref == code_ref)
            .collect())
    }

    /// Pipelines whose status differed across runs of the same code ref
    async fn flaky_pipelines(&self) -> Result<Vec<FlakyPipeline>> {
        let mut flaky = Vec::new();
        for pipeline_name in self.list_pipelines().await? {
            let mut by_ref: BTreeMap<String, (BTreeSet<PipelineStatus>, usize)> = BTreeMap::new();
            for record in self.list_for_pipeline(&pipeline_name).await? {
                let entry = by_ref.entry(record.code_ref).or_default();
                entry.0.insert(record.status);
                entry.1 += 1;
            }
            for (code_ref, (statuses, runs)) in by_ref {
                if statuses.len() > 1 {
                    flaky.push(FlakyPipeline {
                        pipeline_name: pipeline_name.clone(),
                        code_ref,
                        statuses: statuses.into_iter().collect(),
                        runs,
                    });
                }
            }
        }
        Ok(flaky)
    }
}

/// In-memory run log (for testing or `--no-history` runs)
#[derive(Default)]
pub struct InMemoryRunLog {
    records: tokio::sync::RwLock<Vec<RunRecord>>,
}

impl InMemoryRunLog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl RunLog for InMemoryRunLog {
    async fn append(&self, record: &RunRecord) -> Result<()> {
        let mut records = self.records.write().await;
        if records.iter().any(|r| r.key() == record.key()) {
            anyhow::bail!(
                "Run of '{}' at '{}' recorded at {} already exists",
                record.pipeline_name,
                record.code_ref,
                record.recorded_at
            );
        }
        records.push(record.clone());
        Ok(())
    }

    async fn load(&self, run_id: Uuid) -> Result<Option<RunRecord>> {
        let records = self.records.read().await;
        Ok(records.iter().find(|r| r.run_id == run_id).cloned())
    }

    async fn list_for_pipeline(&self, pipeline_name: &str) -> Result<Vec<RunRecord>> {
        let records = self.records.read().await;
        let mut matching: Vec<RunRecord> = records
            .iter()
            .filter(|r| r.pipeline_name == pipeline_name)
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.recorded_at.cmp(&a.recorded_at));
        Ok(matching)
    }

    async fn list_pipelines(&self) -> Result<Vec<String>> {
        let records = self.records.read().await;
        let names: BTreeSet<String> = records.iter().map(|r| r.pipeline_name.clone()).collect();
        Ok(names.into_iter().collect())
    }
}
