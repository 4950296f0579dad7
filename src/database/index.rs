use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::database::repo::{ProvenanceStore, Registration};
use crate::error::StoreError;
use crate::ingest::hasher::ContentHash;

/// Content-addressed duplicate registry.
///
/// The `content_hashes` primary key is the only arbiter. Two workers, or two
/// processes, racing on the same digest get exactly one `Inserted`.
#[derive(Clone)]
pub struct ContentHashIndex {
    store: Arc<ProvenanceStore>,
}

impl ContentHashIndex {
    pub fn new(store: Arc<ProvenanceStore>) -> Self {
        Self { store }
    }

    pub fn register(&self, hash: &ContentHash) -> Result<Registration, StoreError> {
        let outcome = self.store.register_hash(hash)?;
        debug!("Hash {} registration: {:?}", hash.short(), outcome);
        Ok(outcome)
    }

    /// Undo for a registration whose file or record could not be completed.
    pub fn release(&self, hash: &ContentHash) -> Result<bool, StoreError> {
        self.store.release_hash(hash)
    }

    /// Registrations past `grace` that never got a provenance record.
    pub fn orphans(&self, grace: Duration) -> anyhow::Result<Vec<ContentHash>> {
        self.store.orphaned_hashes(grace)
    }

    #[cfg(test)]
    pub fn contains(&self, hash: &ContentHash) -> anyhow::Result<bool> {
        self.store.hash_registered(hash)
    }
}
