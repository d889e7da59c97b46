//! Error types for the volume watcher.
//!
//! Errors are [`Clone`] because one batched write outcome fans out to every
//! watcher that contributed to the batch.

use libcsi::CsiError;
use thiserror::Error;

use crate::structs::VolumeKey;

/// Failure reading from or writing to cluster state.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StateError {
    /// The store has shut down and will not produce further indexes.
    #[error("state store closed")]
    Closed,

    /// The store cannot serve the request right now.
    #[error("state store unavailable: {0}")]
    Unavailable(String),

    #[error("state store internal error: {0}")]
    Internal(String),
}

/// Unified error type for the volume watcher.
#[derive(Debug, Error, Clone)]
pub enum WatcherError {
    /// The supervisor is not running on this server.
    #[error("volume watcher is not enabled")]
    NotEnabled,

    #[error("volume {id} not found in namespace {namespace}")]
    VolumeNotFound { namespace: String, id: String },

    #[error("could not read state: {0}")]
    State(#[from] StateError),

    #[error("could not detach alloc {alloc_id} from node {node_id}: {source}")]
    NodeDetach {
        node_id: String,
        alloc_id: String,
        source: CsiError,
    },

    #[error("could not detach from controller for node {node_id}: {source}")]
    ControllerDetach { node_id: String, source: CsiError },

    /// The batched claim write failed.
    #[error("could not checkpoint claim release: {0}")]
    Write(String),

    /// The watcher or batcher was shut down while the caller waited.
    #[error("cancelled")]
    Cancelled,
}

impl WatcherError {
    /// Create a [`WatcherError::Write`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn write<E: std::fmt::Display>(e: E) -> Self {
        Self::Write(e.to_string())
    }

    pub fn volume_not_found(key: &VolumeKey) -> Self {
        Self::VolumeNotFound {
            namespace: key.namespace.clone(),
            id: key.id.clone(),
        }
    }
}
