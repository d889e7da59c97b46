//! CSI Controller service trait.
//!
//! The Controller service talks to the storage backend on behalf of the
//! cluster.  After every node has let go of a volume, the control plane asks
//! the controller to unpublish it from those nodes.

use async_trait::async_trait;

use crate::error::CsiError;
use crate::types::ControllerDetachVolumeRequest;

/// Controller service: backend-side detach.
#[async_trait]
pub trait CsiController: Send + Sync {
    /// Unpublish a volume from a node at the storage backend.
    ///
    /// This is idempotent; a volume that is already unpublished from the
    /// node is reported as success.
    async fn controller_detach_volume(
        &self,
        req: ControllerDetachVolumeRequest,
    ) -> Result<(), CsiError>;
}
