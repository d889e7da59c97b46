//! CSI Node service trait.
//!
//! The Node service runs on each worker node.  The control plane only needs
//! one operation from it once a workload is gone: releasing the volume from
//! the node (unpublish from the container, then unstage the global mount).

use async_trait::async_trait;

use crate::error::CsiError;
use crate::types::NodeDetachVolumeRequest;

/// Node service: local detach operations, addressed by node ID.
#[async_trait]
pub trait CsiNode: Send + Sync {
    /// Detach a volume from the node named in the request.
    ///
    /// This is idempotent; calling it on a volume that is already detached
    /// from the node should succeed without error.
    async fn node_detach_volume(&self, req: NodeDetachVolumeRequest) -> Result<(), CsiError>;
}
