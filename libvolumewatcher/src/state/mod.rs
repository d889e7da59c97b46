//! Capabilities the watcher consumes from the replicated state store.
//!
//! The store itself lives elsewhere; the watcher only needs bounded reads,
//! blocking waits on the store index or on one volume, and the claim write
//! path.  [`memory::MemoryStateStore`] implements both traits in process.

pub mod memory;

use async_trait::async_trait;

use crate::error::StateError;
use crate::structs::{ClaimReleaseRequest, Volume, VolumeKey};

pub use memory::MemoryStateStore;

/// Read side of the state store.
#[async_trait]
pub trait StateReader: Send + Sync {
    /// Current snapshot of one volume with its allocations filled in.
    async fn volume(&self, key: &VolumeKey) -> Result<Option<Volume>, StateError>;

    /// Snapshot of every volume plus the store index it was taken at.
    async fn volumes(&self) -> Result<(Vec<Volume>, u64), StateError>;

    /// Block until the store index is greater than `after`, returning it.
    async fn wait_for_index(&self, after: u64) -> Result<u64, StateError>;

    /// Block until the volume's record moves past `min_index`.
    ///
    /// Returns the new snapshot, or `None` once the volume is gone from state.
    /// The provided version re-reads the volume on every index bump; stores
    /// that can wake per volume should override it.
    async fn wait_for_volume(
        &self,
        key: &VolumeKey,
        min_index: u64,
    ) -> Result<Option<Volume>, StateError> {
        let mut seen = min_index;
        loop {
            seen = self.wait_for_index(seen).await?;
            match self.volume(key).await? {
                Some(vol) if vol.modify_index <= min_index => continue,
                other => return Ok(other),
            }
        }
    }
}

/// Durable write path for claim transitions.
#[async_trait]
pub trait ClaimWriter: Send + Sync {
    /// Apply a batch of claim releases under a single index.
    async fn upsert_volume_claims(&self, claims: Vec<ClaimReleaseRequest>)
    -> Result<u64, StateError>;
}
