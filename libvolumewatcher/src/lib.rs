//! # libvolumewatcher: claim reaping for RK8s volumes
//!
//! Runs on the cluster leader.  Watches every volume that still has claims,
//! detaches the volume from nodes and from the storage backend once the
//! claiming allocation is done, and writes the released claims back to state
//! through a shared batcher.
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`structs`] | Volumes, claims, allocations and claim requests. |
//! | [`state`] | [`StateReader`] / [`ClaimWriter`] capabilities and an in-memory store. |
//! | [`batcher`] | [`VolumeUpdateBatcher`], coalesces claim writes across volumes. |
//! | [`volumes_watcher`] | [`VolumesWatcher`] supervisor: lifecycle, discovery, reap, notify. |
//! | [`config`] | [`WatcherConfig`], YAML plus environment overrides. |
//! | [`retry`] | [`RetryPolicy`] for detach RPCs. |
//! | [`error`] | [`WatcherError`] and [`StateError`]. |

pub mod batcher;
pub mod config;
pub mod error;
pub mod retry;
pub mod state;
pub mod structs;
mod volume_watcher;
pub mod volumes_watcher;

pub use batcher::VolumeUpdateBatcher;
pub use config::WatcherConfig;
pub use error::{StateError, WatcherError};
pub use retry::RetryPolicy;
pub use state::{ClaimWriter, MemoryStateStore, StateReader};
pub use structs::*;
pub use volumes_watcher::VolumesWatcher;
