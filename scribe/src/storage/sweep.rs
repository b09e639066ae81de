use tracing::{debug, error, info};

use super::ArtifactStore;
use crate::error::Result;

/// Periodically removes scratch files left behind by crashed processes.
#[derive(Clone)]
pub struct OrphanSweeper {
    store: ArtifactStore,
    interval_secs: u64,
}

impl OrphanSweeper {
    pub fn new(store: ArtifactStore, interval_secs: u64) -> Self {
        Self {
            store,
            interval_secs,
        }
    }

    /// Run a single sweep pass. Returns the number of files removed.
    pub async fn run_once(&self) -> Result<u64> {
        debug!("Starting orphan sweep");

        match self.store.sweep_orphans().await {
            Ok(0) => {
                debug!("No orphaned scratch files");
                Ok(0)
            }
            Ok(removed) => {
                info!(
                    "Orphan sweep complete: {} files removed from {}",
                    removed,
                    self.store.root().display()
                );
                Ok(removed)
            }
            Err(e) => {
                error!("Orphan sweep failed: {}", e);
                Err(e)
            }
        }
    }

    pub fn interval_secs(&self) -> u64 {
        self.interval_secs
    }
}
