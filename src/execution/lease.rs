//! In-flight leases shared between processes
//!
//! Each `downstream run` is its own process, so the in-process
//! [`SupersessionRegistry`](super::SupersessionRegistry) cannot see a run
//! started by another invocation. A lease file per concurrency key records
//! which run owns the key; a newer run replaces it, and the older process
//! notices on its next poll and cancels itself.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

const DEFAULT_POLL: Duration = Duration::from_secs(2);

/// Contents of a lease file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub owner: Uuid,
    pub pid: u32,
    pub code_ref: String,
    pub started_at: DateTime<Utc>,
}

/// Directory holding one lease file per concurrency key
#[derive(Debug, Clone)]
pub struct LeaseDir {
    dir: PathBuf,
    poll: Duration,
}

impl LeaseDir {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            poll: DEFAULT_POLL,
        }
    }

    /// `<data dir>/downstream/inflight`
    pub fn default_dir() -> Option<PathBuf> {
        dirs::data_local_dir().map(|d| d.join("downstream").join("inflight"))
    }

    pub fn with_poll_interval(mut self, poll: Duration) -> Self {
        self.poll = poll;
        self
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let name: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '-' | '.') { c } else { '_' })
            .collect();
        self.dir.join(format!("{}.lease", name))
    }

    /// Take over `key`, superseding whichever run held it. `cancel` is
    /// cancelled once a later run takes the key from us.
    pub async fn acquire(
        &self,
        key: &str,
        code_ref: &str,
        cancel: CancellationToken,
    ) -> Result<HeldLease> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create {}", self.dir.display()))?;

        let path = self.path_for(key);
        if let Some(previous) = read_lease(&path).await {
            info!(
                key,
                previous_owner = %previous.owner,
                previous_pid = previous.pid,
                previous_ref = %previous.code_ref,
                "Superseding run in another process"
            );
        }

        let record = LeaseRecord {
            owner: Uuid::new_v4(),
            pid: std::process::id(),
            code_ref: code_ref.to_string(),
            started_at: Utc::now(),
        };
        write_lease(&path, &record).await?;
        debug!(key, owner = %record.owner, path = %path.display(), "Lease acquired");

        let watcher = tokio::spawn(watch(path.clone(), record.owner, self.poll, cancel));
        Ok(HeldLease {
            path,
            owner: record.owner,
            watcher,
        })
    }
}

/// A lease this process holds until released or superseded
#[derive(Debug)]
pub struct HeldLease {
    path: PathBuf,
    owner: Uuid,
    watcher: JoinHandle<()>,
}

impl HeldLease {
    pub fn owner(&self) -> Uuid {
        self.owner
    }

    /// Stop watching and remove the lease file, unless a newer run owns it
    pub async fn release(self) {
        self.watcher.abort();
        match read_lease(&self.path).await {
            Some(current) if current.owner == self.owner => {
                if let Err(e) = tokio::fs::remove_file(&self.path).await {
                    warn!(path = %self.path.display(), error = %e, "Failed to remove lease");
                }
            }
            _ => debug!(path = %self.path.display(), "Lease already taken over"),
        }
    }
}

impl Drop for HeldLease {
    fn drop(&mut self) {
        self.watcher.abort();
    }
}

async fn watch(path: PathBuf, owner: Uuid, poll: Duration, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(poll) => {}
        }
        match read_lease(&path).await {
            Some(current) if current.owner != owner => {
                info!(
                    by = %current.owner,
                    pid = current.pid,
                    code_ref = %current.code_ref,
                    "Run superseded by a newer process"
                );
                cancel.cancel();
                return;
            }
            _ => {}
        }
    }
}

async fn read_lease(path: &Path) -> Option<LeaseRecord> {
    let content = tokio::fs::read_to_string(path).await.ok()?;
    serde_json::from_str(&content).ok()
}

/// Write through a temporary file and rename, so readers never see a
/// partial record
async fn write_lease(path: &Path, record: &LeaseRecord) -> Result<()> {
    let tmp = path.with_extension(format!("{}.tmp", record.owner.simple()));
    tokio::fs::write(&tmp, serde_json::to_vec(record)?)
        .await
        .with_context(|| format!("Failed to write {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("Failed to replace {}", path.display()))?;
    Ok(())
}
