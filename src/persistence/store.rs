//! SQLite-based run log

use crate::core::state::PipelineStatus;
use crate::persistence::{RunLog, RunRecord};
use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use uuid::Uuid;

/// SQLite run log
pub struct SqliteRunLog {
    pool: SqlitePool,
}

impl SqliteRunLog {
    /// Open (creating if needed) a run log at a path
    pub async fn open(db_path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .connect_with(options)
            .await
            .with_context(|| format!("Failed to open run log at {}", db_path.display()))?;

        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    /// A private in-memory database
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::new().in_memory(true);
        // Each connection would get its own in-memory database
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .context("Failed to open in-memory run log")?;

        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    /// Create store with default path
    pub async fn with_default_path() -> Result<Self> {
        let data_dir = dirs::data_local_dir().unwrap_or_else(|| std::path::PathBuf::from("."));
        let db_dir = data_dir.join("downstream");
        std::fs::create_dir_all(&db_dir)
            .with_context(|| format!("Failed to create {}", db_dir.display()))?;

        Self::open(&db_dir.join("runs.db")).await
    }

    /// Initialize database schema
    async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS runs (
                run_id TEXT PRIMARY KEY,
                pipeline_name TEXT NOT NULL,
                code_ref TEXT NOT NULL,
                recorded_at TEXT NOT NULL,
                trigger_kind TEXT NOT NULL,
                status TEXT NOT NULL,
                duration_ms INTEGER NOT NULL DEFAULT 0,
                reason TEXT,
                failing_tests TEXT NOT NULL DEFAULT '[]',
                failure_output TEXT,
                UNIQUE (pipeline_name, code_ref, recorded_at)
            );

            CREATE INDEX IF NOT EXISTS idx_runs_pipeline ON runs(pipeline_name);
            CREATE INDEX IF NOT EXISTS idx_runs_code_ref ON runs(code_ref);
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to initialize run log schema")?;

        // Logs written before captured output was recorded
        let has_output = sqlx::query(
            "SELECT 1 FROM pragma_table_info('runs') WHERE name = 'failure_output'",
        )
        .fetch_optional(&self.pool)
        .await
        .context("Failed to inspect run log schema")?
        .is_some();
        if !has_output {
            sqlx::query("ALTER TABLE runs ADD COLUMN failure_output TEXT")
                .execute(&self.pool)
                .await
                .context("Failed to migrate run log schema")?;
        }

        Ok(())
    }

    fn to_naive(dt: DateTime<Utc>) -> NaiveDateTime {
        dt.naive_utc()
    }

    fn from_naive(dt: NaiveDateTime) -> DateTime<Utc> {
        DateTime::from_naive_utc_and_offset(dt, Utc)
    }

    fn from_row(row: &SqliteRow) -> Result<RunRecord> {
        let status: String = row.get("status");
        let failing_tests: String = row.get("failing_tests");
        Ok(RunRecord {
            run_id: Uuid::parse_str(&row.get::<String, _>("run_id"))?,
            pipeline_name: row.get("pipeline_name"),
            code_ref: row.get("code_ref"),
            recorded_at: Self::from_naive(row.get("recorded_at")),
            trigger: row.get("trigger_kind"),
            status: PipelineStatus::parse(&status)
                .with_context(|| format!("Unknown status '{}' in run log", status))?,
            duration_ms: row.get::<i64, _>("duration_ms") as u64,
            reason: row.get("reason"),
            failing_tests: serde_json::from_str(&failing_tests)?,
            failure_output: row.get("failure_output"),
        })
    }
}

#[async_trait::async_trait]
impl RunLog for SqliteRunLog {
    async fn append(&self, record: &RunRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO runs
            (run_id, pipeline_name, code_ref, recorded_at, trigger_kind, status, duration_ms, reason, failing_tests, failure_output)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
        )
        .bind(record.run_id.to_string())
        .bind(&record.pipeline_name)
        .bind(&record.code_ref)
        .bind(Self::to_naive(record.recorded_at))
        .bind(&record.trigger)
        .bind(record.status.as_str())
        .bind(record.duration_ms as i64)
        .bind(&record.reason)
        .bind(serde_json::to_string(&record.failing_tests)?)
        .bind(&record.failure_output)
        .execute(&self.pool)
        .await
        .context("Failed to append run record")?;

        Ok(())
    }

    async fn load(&self, run_id: Uuid) -> Result<Option<RunRecord>> {
        let row = sqlx::query("SELECT * FROM runs WHERE run_id = ?1")
            .bind(run_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("Failed to load run record")?;

        row.as_ref().map(Self::from_row).transpose()
    }

    async fn list_for_pipeline(&self, pipeline_name: &str) -> Result<Vec<RunRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM runs
            WHERE pipeline_name = ?1
            ORDER BY recorded_at DESC
            "#,
        )
        .bind(pipeline_name)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list run records")?;

        rows.iter().map(Self::from_row).collect()
    }

    async fn history(&self, pipeline_name: &str, code_ref: &str) -> Result<Vec<RunRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM runs
            WHERE pipeline_name = ?1 AND code_ref = ?2
            ORDER BY recorded_at DESC
            "#,
        )
        .bind(pipeline_name)
        .bind(code_ref)
        .fetch_all(&self.pool)
        .await
        .context("Failed to load run history")?;

        rows.iter().map(Self::from_row).collect()
    }

    async fn list_pipelines(&self) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT DISTINCT pipeline_name FROM runs ORDER BY pipeline_name ASC")
            .fetch_all(&self.pool)
            .await
            .context("Failed to list pipelines")?;

        Ok(rows.iter().map(|row| row.get("pipeline_name")).collect())
    }
}
