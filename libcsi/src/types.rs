//! Core CSI types: volume identity, access modes, and detach requests.
//!
//! These types form the data model shared by the CSI traits, the transport
//! layer, and the volume watcher on the control plane.  They are all
//! [`Serialize`]/[`Deserialize`] so they can be transmitted over QUIC as JSON.

use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Volume identity
// ---------------------------------------------------------------------------

/// Opaque, unique identifier for a volume.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VolumeId(pub String);

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for VolumeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for VolumeId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Access mode
// ---------------------------------------------------------------------------

/// Describes how a volume may be accessed across nodes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum AccessMode {
    /// One node, read-only.
    SingleNodeReader,
    /// One node, read-write.
    #[default]
    SingleNodeWriter,
    /// Many nodes, read-only.
    MultiNodeReader,
    /// Many nodes, at most one of them writing.
    MultiNodeSingleWriter,
    /// Many nodes, all of them writing.
    MultiNodeMultiWriter,
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// Request to release a volume from the node that an allocation ran on.
///
/// Covers both the unpublish (container bind-mount) and unstage (global
/// mount) halves of a node detach.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeDetachVolumeRequest {
    /// Plugin responsible for the volume.
    pub plugin_id: String,
    /// Cluster node the allocation was placed on.
    pub node_id: String,
    /// Cluster-side volume identifier.
    pub volume_id: VolumeId,
    /// Identifier of the volume in the storage backend.
    pub external_id: String,
    /// Allocation whose claim is being released.
    pub alloc_id: String,
    /// Access mode the volume was attached with.
    #[serde(default)]
    pub access_mode: AccessMode,
    /// Whether the claim being released was read-only.
    #[serde(default)]
    pub read_only: bool,
}

/// Request to unpublish a volume from a node at the storage controller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ControllerDetachVolumeRequest {
    /// Plugin responsible for the volume.
    pub plugin_id: String,
    /// Identifier of the volume in the storage backend.
    pub volume_id: VolumeId,
    /// Node the volume is being detached from.
    pub node_id: String,
    /// Allocation whose claim triggered the detach.
    pub alloc_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volume_id_display() {
        let id = VolumeId("vol-abc".into());
        assert_eq!(id.to_string(), "vol-abc");
    }

    #[test]
    fn node_detach_request_defaults() {
        let json = r#"{
            "plugin_id": "rk8s.slayerfs.csi",
            "node_id": "node-01",
            "volume_id": "vol-1",
            "external_id": "slayerfs-1",
            "alloc_id": "alloc-1"
        }"#;
        let req: NodeDetachVolumeRequest = serde_json::from_str(json).expect("deserialize");
        assert_eq!(req.access_mode, AccessMode::SingleNodeWriter);
        assert!(!req.read_only);
        assert_eq!(req.volume_id, VolumeId::from("vol-1"));
    }
}
