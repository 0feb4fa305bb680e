//! Supersession of in-flight runs that share a concurrency key

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Handle on a registered run
#[derive(Debug, Clone)]
pub struct RunLease {
    key: String,
    generation: u64,
    token: CancellationToken,
}

impl RunLease {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Cancelled when a newer run for the same key begins, or on shutdown
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

/// Tracks the newest run per concurrency key. Beginning a run cancels the
/// previous one for its key; runs under different keys never interact.
#[derive(Debug)]
pub struct SupersessionRegistry {
    root: CancellationToken,
    active: Mutex<HashMap<String, (u64, CancellationToken)>>,
    next_generation: AtomicU64,
}

impl Default for SupersessionRegistry {
    fn default() -> Self {
        Self::new(CancellationToken::new())
    }
}

impl SupersessionRegistry {
    /// Cancelling `root` cancels every run ever registered
    pub fn new(root: CancellationToken) -> Self {
        Self {
            root,
            active: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
        }
    }

    pub fn begin(&self, key: &str) -> RunLease {
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let token = self.root.child_token();

        let previous = {
            let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
            active.insert(key.to_string(), (generation, token.clone()))
        };
        if let Some((old_generation, old_token)) = previous {
            info!(key, superseded = old_generation, by = generation, "Superseding in-flight run");
            old_token.cancel();
        }

        RunLease {
            key: key.to_string(),
            generation,
            token,
        }
    }

    /// Forget a finished run. A lease that has already been superseded
    /// leaves the newer entry alone.
    pub fn finish(&self, lease: &RunLease) {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if matches!(active.get(&lease.key), Some((g, _)) if *g == lease.generation) {
            active.remove(&lease.key);
        }
    }

    pub fn in_flight(&self) -> usize {
        self.active.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}
