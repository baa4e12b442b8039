//! Per-plugin operation locks.
//!
//! Lifecycle operations on the same plugin ID are serialized; operations on
//! different IDs run concurrently.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Single-flight lock map keyed by plugin ID.
#[derive(Debug, Default)]
pub struct OperationLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl OperationLocks {
    /// Creates an empty lock map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for exclusive access to `plugin_id`.
    pub async fn acquire(&self, plugin_id: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(plugin_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }
}
