//! CSI protocol messages transmitted over QUIC.
//!
//! [`CsiMessage`] is the top-level envelope for all request and response
//! variants exchanged between the CSI client (control plane side) and the CSI
//! server (plugin side) via QUIC bi-directional streams.

use serde::{Deserialize, Serialize};

use crate::error::CsiError;
use crate::types::*;

/// Top-level message envelope for CSI over QUIC.
///
/// Each QUIC bi-stream carries exactly one request followed by one response.
/// The client sends a *request* variant and the server replies with
/// [`CsiMessage::Ok`] or [`CsiMessage::Error`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CsiMessage {
    // ----- Requests --------------------------------------------------------
    /// Detach a volume from a node (Node).
    NodeDetachVolume(NodeDetachVolumeRequest),
    /// Unpublish a volume at the storage backend (Controller).
    ControllerDetachVolume(ControllerDetachVolumeRequest),

    // ----- Responses -------------------------------------------------------
    /// Generic success acknowledgement (no payload).
    Ok,
    /// An error occurred.
    Error(CsiError),
}

impl CsiMessage {
    /// Convert a response into the outcome of the call that produced it.
    pub fn into_result(self) -> Result<(), CsiError> {
        match self {
            Self::Ok => Ok(()),
            Self::Error(e) => Err(e),
            other => Err(CsiError::Internal(format!("unexpected response: {other}"))),
        }
    }
}

impl std::fmt::Display for CsiMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NodeDetachVolume(req) => write!(
                f,
                "NodeDetachVolume({}, node={}, alloc={})",
                req.volume_id, req.node_id, req.alloc_id
            ),
            Self::ControllerDetachVolume(req) => write!(
                f,
                "ControllerDetachVolume({}, node={})",
                req.volume_id, req.node_id
            ),
            Self::Ok => f.write_str("Ok"),
            Self::Error(e) => write!(f, "Error({})", e),
        }
    }
}
