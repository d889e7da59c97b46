//! Cluster-state records the volume watcher reads and writes.
//!
//! A [`Volume`] carries three claim maps keyed by allocation ID: the active
//! read and write claims, and the past claims that are somewhere in the
//! release pipeline.  A claim lives in exactly one of them at a time.

use std::collections::BTreeMap;
use std::fmt;

use libcsi::AccessMode;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Volume identity
// ---------------------------------------------------------------------------

/// Identity of a volume: `(namespace, id)`.
///
/// Doubles as the watch key; its display form is the volume ID directly
/// followed by the namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VolumeKey {
    pub namespace: String,
    pub id: String,
}

impl VolumeKey {
    pub fn new(namespace: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for VolumeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.id, self.namespace)
    }
}

// ---------------------------------------------------------------------------
// Claims
// ---------------------------------------------------------------------------

/// How an allocation uses the volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClaimMode {
    Read,
    SingleWriter,
    MultiWriter,
}

/// Where a claim is in its lifecycle.
///
/// `Taken` claims are active.  The other states only appear on past claims
/// and are checkpointed to state as the release advances, so a new leader
/// resumes where the old one stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClaimState {
    Taken,
    NodeDetachPending,
    ControllerDetachPending,
    Released,
}

impl fmt::Display for ClaimState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Taken => "taken",
            Self::NodeDetachPending => "node-detach-pending",
            Self::ControllerDetachPending => "controller-detach-pending",
            Self::Released => "released",
        };
        f.write_str(s)
    }
}

/// A record that an allocation holds the volume on a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeClaim {
    pub allocation_id: String,
    pub node_id: String,
    pub mode: ClaimMode,
    pub state: ClaimState,
}

// ---------------------------------------------------------------------------
// Allocations
// ---------------------------------------------------------------------------

/// Client-reported status of an allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AllocClientStatus {
    Pending,
    Running,
    Complete,
    Failed,
    Lost,
}

/// The parts of a workload allocation the watcher cares about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub id: String,
    pub node_id: String,
    pub job_id: String,
    pub client_status: AllocClientStatus,
}

impl Allocation {
    /// Whether the allocation will never run again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.client_status,
            AllocClientStatus::Complete | AllocClientStatus::Failed | AllocClientStatus::Lost
        )
    }
}

// ---------------------------------------------------------------------------
// Volume
// ---------------------------------------------------------------------------

/// A registered external volume and its claims.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Volume {
    pub id: String,
    pub namespace: String,
    /// Identifier in the storage backend, when it differs from `id`.
    #[serde(default)]
    pub external_id: Option<String>,
    pub plugin_id: String,
    #[serde(default)]
    pub access_mode: AccessMode,
    /// Whether the plugin needs a controller unpublish after the node detach.
    #[serde(default)]
    pub controller_required: bool,

    #[serde(default)]
    pub read_claims: BTreeMap<String, VolumeClaim>,
    #[serde(default)]
    pub write_claims: BTreeMap<String, VolumeClaim>,
    #[serde(default)]
    pub past_claims: BTreeMap<String, VolumeClaim>,

    /// Allocation behind each read claim, filled in on read. `None` means the
    /// allocation no longer exists in state.
    #[serde(default)]
    pub read_allocs: BTreeMap<String, Option<Allocation>>,
    /// Allocation behind each write claim, filled in on read.
    #[serde(default)]
    pub write_allocs: BTreeMap<String, Option<Allocation>>,

    #[serde(default)]
    pub create_index: u64,
    #[serde(default)]
    pub modify_index: u64,
}

impl Volume {
    pub fn new(
        namespace: impl Into<String>,
        id: impl Into<String>,
        plugin_id: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            namespace: namespace.into(),
            external_id: None,
            plugin_id: plugin_id.into(),
            access_mode: AccessMode::default(),
            controller_required: false,
            read_claims: BTreeMap::new(),
            write_claims: BTreeMap::new(),
            past_claims: BTreeMap::new(),
            read_allocs: BTreeMap::new(),
            write_allocs: BTreeMap::new(),
            create_index: 0,
            modify_index: 0,
        }
    }

    pub fn key(&self) -> VolumeKey {
        VolumeKey::new(self.namespace.clone(), self.id.clone())
    }

    /// Identifier to hand to the storage backend.
    pub fn remote_id(&self) -> &str {
        self.external_id.as_deref().unwrap_or(&self.id)
    }

    /// Whether any claim, active or past, is outstanding.
    pub fn has_claims(&self) -> bool {
        !(self.read_claims.is_empty()
            && self.write_claims.is_empty()
            && self.past_claims.is_empty())
    }

    /// Iterate over the active claims of both kinds.
    pub fn active_claims(&self) -> impl Iterator<Item = &VolumeClaim> {
        self.read_claims.values().chain(self.write_claims.values())
    }

    /// Look up the allocation behind an active claim.
    ///
    /// The outer `None` means the claim was never denormalized; the inner
    /// `None` means the allocation is gone from state.
    pub fn claim_alloc(&self, alloc_id: &str) -> Option<Option<&Allocation>> {
        self.read_allocs
            .get(alloc_id)
            .or_else(|| self.write_allocs.get(alloc_id))
            .map(Option::as_ref)
    }

    /// Apply a claim release.
    ///
    /// A `Released` request removes every trace of the allocation.  Any other
    /// state moves the claim out of both active maps into `past_claims`; an
    /// allocation holding a read and a write claim keeps the write mode.
    pub fn claim_release(&mut self, req: &ClaimReleaseRequest) {
        let alloc_id = req.allocation_id.as_str();
        if req.state == ClaimState::Released {
            self.read_claims.remove(alloc_id);
            self.write_claims.remove(alloc_id);
            self.past_claims.remove(alloc_id);
            self.read_allocs.remove(alloc_id);
            self.write_allocs.remove(alloc_id);
            return;
        }

        let read = self.read_claims.remove(alloc_id);
        let write = self.write_claims.remove(alloc_id);
        let past = self.past_claims.remove(alloc_id);
        let claim = write.or(read).or(past);
        self.read_allocs.remove(alloc_id);
        self.write_allocs.remove(alloc_id);

        let claim = match claim {
            Some(mut claim) => {
                claim.state = req.state;
                claim
            }
            None => VolumeClaim {
                allocation_id: req.allocation_id.clone(),
                node_id: req.node_id.clone(),
                mode: ClaimMode::Read,
                state: req.state,
            },
        };
        self.past_claims.insert(req.allocation_id.clone(), claim);
    }
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// One claim transition, the unit the update batcher coalesces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimReleaseRequest {
    pub volume_id: String,
    pub namespace: String,
    pub allocation_id: String,
    pub node_id: String,
    pub state: ClaimState,
}

impl ClaimReleaseRequest {
    pub fn new(volume: &Volume, claim: &VolumeClaim) -> Self {
        Self {
            volume_id: volume.id.clone(),
            namespace: volume.namespace.clone(),
            allocation_id: claim.allocation_id.clone(),
            node_id: claim.node_id.clone(),
            state: claim.state,
        }
    }

    pub fn volume_key(&self) -> VolumeKey {
        VolumeKey::new(self.namespace.clone(), self.volume_id.clone())
    }

    /// Requests with equal claim keys target the same claim.
    pub fn claim_key(&self) -> (VolumeKey, String) {
        (self.volume_key(), self.allocation_id.clone())
    }
}

/// Administrative request to reap the claims of one volume.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeClaimRequest {
    pub volume_id: String,
    pub namespace: String,
    /// Release this allocation's claim even if the allocation is still running.
    #[serde(default)]
    pub allocation_id: Option<String>,
}

impl VolumeClaimRequest {
    pub fn volume_key(&self) -> VolumeKey {
        VolumeKey::new(self.namespace.clone(), self.volume_id.clone())
    }
}

/// Outcome of a reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReapResponse {
    /// Index of the last claim write this pass applied, `0` if none.
    pub index: u64,
    /// Number of claims freed by this pass.
    pub released: usize,
}
