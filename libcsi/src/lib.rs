//! # libcsi: CSI detach RPCs over QUIC for RK8s
//!
//! `libcsi` is the plugin-facing half of volume claim reaping.  Once a
//! workload no longer needs a volume, the control plane asks the node plugin
//! to detach it from the node and the controller plugin to unpublish it at
//! the storage backend.  Both calls travel over QUIC (via [`quinn`]) instead
//! of gRPC.
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`types`] | `VolumeId`, access modes, detach requests. |
//! | [`error`] | [`CsiError`] enum covering all failure modes. |
//! | [`message`] | [`CsiMessage`] protocol envelope for QUIC transport. |
//! | [`node`] | [`CsiNode`] trait, node-side detach. |
//! | [`controller`] | [`CsiController`] trait, backend-side detach. |
//! | [`transport`] | QUIC client/server built on `quinn`. |

pub mod controller;
pub mod error;
pub mod message;
pub mod node;
pub mod transport;
pub mod types;

pub use controller::CsiController;
pub use error::CsiError;
pub use message::CsiMessage;
pub use node::CsiNode;
pub use transport::{client::CsiClient, server::CsiServer};
pub use types::*;
