pub mod models;
pub mod store;

pub use models::{Job, PreviousResult, RoundSnapshot, Snapshot};
#[cfg(test)]
pub use store::MemoryStateStore;
pub use store::{FileStateStore, StateStore};

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::StateError;

/// Single entry point to the shared snapshot.
///
/// The heartbeat driver, the deviation driver and the ingestion handler all
/// mutate the same snapshot. Every mutation goes through [`Self::update`],
/// which holds one lock across load, mutate and save, so interleaved actors
/// cannot lose each other's writes. Closures passed to `update` must not do
/// network I/O.
pub struct StateRepository {
    store: Arc<dyn StateStore>,
    write_lock: Mutex<()>,
}

impl StateRepository {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            store,
            write_lock: Mutex::new(()),
        }
    }

    /// Read-only copy of the latest persisted snapshot
    pub async fn snapshot(&self) -> Result<Snapshot, StateError> {
        let _guard = self.write_lock.lock().await;
        self.store.load()
    }

    /// Load, apply `f`, persist. Serialized against every other update.
    pub async fn update<F, R>(&self, f: F) -> Result<R, StateError>
    where
        F: FnOnce(&mut Snapshot) -> R,
    {
        let _guard = self.write_lock.lock().await;
        let mut snapshot = self.store.load()?;
        let out = f(&mut snapshot);
        self.store.save(&snapshot)?;
        debug!("💾 State saved ({} jobs)", snapshot.jobs.len());
        Ok(out)
    }

    /// Startup pass re-establishing the previous-result invariant
    pub async fn initialise(&self) -> Result<Snapshot, StateError> {
        let (created, snapshot) = self
            .update(|snap| {
                let created = snap.ensure_previous_results();
                (created, snap.clone())
            })
            .await?;
        if created > 0 {
            info!("✓ Initialised {} missing previous-result entries", created);
        }
        info!("✓ State loaded: {} jobs", snapshot.jobs.len());
        Ok(snapshot)
    }
}
