use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// One async mutex per application id. Holding the guard is what makes a
/// pipeline "active" for that application.
#[derive(Default)]
pub struct PipelineLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl PipelineLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, app_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(app_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Wait for exclusive access to `app_id`.
    pub async fn acquire(&self, app_id: &str) -> OwnedMutexGuard<()> {
        self.entry(app_id).lock_owned().await
    }

    pub fn is_locked(&self, app_id: &str) -> bool {
        self.locks
            .get(app_id)
            .is_some_and(|m| m.try_lock().is_err())
    }

    /// Drop the entry for a deleted application if nobody holds it.
    pub fn forget(&self, app_id: &str) {
        self.locks
            .remove_if(app_id, |_, m| Arc::strong_count(m) == 1 && m.try_lock().is_ok());
    }
}
