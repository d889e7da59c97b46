//! Per-volume reconciliation task.
//!
//! One task runs for every volume with outstanding claims.  It waits for the
//! volume's record to change (or for an explicit notify or reap), then runs
//! one reaping pass:
//!
//! 1. collect claims whose allocation has terminated into `past_claims`
//! 2. node detach every `NodeDetachPending` claim, checkpointing progress
//! 3. controller detach the nodes no other claim still uses
//! 4. free the claims in state
//!
//! Passes on one volume never overlap.  A pass that leaves the volume without
//! claims is reported to the supervisor, which decides whether to stop the
//! task.

use std::collections::HashMap;
use std::sync::Arc;

use libcsi::{
    ControllerDetachVolumeRequest, CsiController, CsiNode, NodeDetachVolumeRequest, VolumeId,
};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::batcher::VolumeUpdateBatcher;
use crate::error::WatcherError;
use crate::retry::RetryPolicy;
use crate::state::StateReader;
use crate::structs::{
    ClaimMode, ClaimReleaseRequest, ClaimState, ReapResponse, Volume, VolumeClaim, VolumeKey,
};

/// A forced pass requested through the supervisor.
pub(crate) struct ReapCommand {
    /// Allocation to release even if it is still running.
    pub force_alloc: Option<String>,
    pub reply: oneshot::Sender<Result<ReapResponse, WatcherError>>,
}

/// Sent upward when a pass leaves the volume without claims.
#[derive(Debug)]
pub(crate) struct WatcherDone {
    pub key: VolumeKey,
    pub epoch: u64,
    pub id: u64,
}

/// Everything a watcher task needs, handed over by the supervisor.
pub(crate) struct VolumeWatcher {
    pub key: VolumeKey,
    pub epoch: u64,
    pub id: u64,
    pub state: Arc<dyn StateReader>,
    pub node_rpc: Arc<dyn CsiNode>,
    pub controller_rpc: Arc<dyn CsiController>,
    pub batcher: VolumeUpdateBatcher,
    pub retry: RetryPolicy,
    pub cancel: CancellationToken,
    pub notify_rx: watch::Receiver<Option<Volume>>,
    pub reap_rx: mpsc::Receiver<ReapCommand>,
    pub done_tx: mpsc::UnboundedSender<WatcherDone>,
    /// Modify index of the last snapshot a pass worked from.
    pub last_index: u64,
}

/// Result of a pass that ran to completion.
struct PassOutcome {
    response: ReapResponse,
    drained: bool,
    /// The volume is no longer in state.
    gone: bool,
}

impl VolumeWatcher {
    pub(crate) async fn run(mut self) {
        debug!(volume = %self.key, "volume watcher started");
        let mut drained_reported = false;

        let first = self.reap_claims(None).await;
        // Only commands and notifications can revive a volume that is gone.
        let mut gone = self.after_pass(first.as_ref(), &mut drained_reported);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                cmd = self.reap_rx.recv() => {
                    let Some(cmd) = cmd else { break };
                    let outcome = self.reap_claims(cmd.force_alloc.as_deref()).await;
                    gone = self.after_pass(outcome.as_ref(), &mut drained_reported);
                    let _ = cmd.reply.send(outcome.map(|o| o.response));
                }
                changed = self.notify_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let notified = self.notify_rx.borrow().as_ref().map(|v| v.modify_index);
                    debug!(volume = %self.key, ?notified, "volume watcher notified");
                    let outcome = self.reap_claims(None).await;
                    gone = self.after_pass(outcome.as_ref(), &mut drained_reported);
                }
                changed = self.state.wait_for_volume(&self.key, self.last_index), if !gone => {
                    if let Err(e) = changed {
                        warn!(volume = %self.key, error = %e, "failed to watch volume");
                        tokio::select! {
                            _ = self.cancel.cancelled() => break,
                            _ = tokio::time::sleep(self.retry.backoff_max) => {}
                        }
                        continue;
                    }
                    let outcome = self.reap_claims(None).await;
                    gone = self.after_pass(outcome.as_ref(), &mut drained_reported);
                }
            }
        }
        debug!(volume = %self.key, "volume watcher stopped");
    }

    /// Report the pass outcome; returns whether the volume is gone.
    fn after_pass(
        &self,
        outcome: Result<&PassOutcome, &WatcherError>,
        reported: &mut bool,
    ) -> bool {
        let gone = matches!(outcome, Ok(o) if o.gone);
        match outcome.map(|o| o.drained) {
            Ok(true) if !*reported => {
                *reported = true;
                let _ = self.done_tx.send(WatcherDone {
                    key: self.key.clone(),
                    epoch: self.epoch,
                    id: self.id,
                });
            }
            Ok(true) => {}
            Ok(false) => *reported = false,
            Err(WatcherError::Cancelled) => {}
            Err(e) => {
                *reported = false;
                warn!(volume = %self.key, error = %e, "failed to reap volume claims");
            }
        }
        gone
    }

    /// One reconciliation pass over a fresh snapshot of the volume.
    ///
    /// Every phase runs as far as it can; the first error is returned once
    /// the pass stops.
    #[instrument(skip(self), fields(volume = %self.key))]
    async fn reap_claims(
        &mut self,
        force_alloc: Option<&str>,
    ) -> Result<PassOutcome, WatcherError> {
        // Wake-ups up to this point are covered by this pass.
        let _ = self.notify_rx.borrow_and_update();

        let Some(mut vol) = self.state.volume(&self.key).await? else {
            debug!("volume is gone from state");
            return Ok(PassOutcome {
                response: ReapResponse::default(),
                drained: true,
                gone: true,
            });
        };
        self.last_index = vol.modify_index;

        collect_past_claims(&mut vol, force_alloc);
        let mut response = ReapResponse::default();
        let mut first_err: Option<WatcherError> = None;

        self.node_phase(&mut vol, &mut response, &mut first_err).await;
        if first_err.is_none() {
            self.controller_phase(&mut vol, &mut first_err).await;
        }
        self.release_phase(&mut vol, &mut response, &mut first_err).await;

        if let Some(e) = first_err {
            return Err(e);
        }
        if response.released > 0 {
            info!(released = response.released, index = response.index, "released volume claims");
        }
        Ok(PassOutcome {
            response,
            drained: !vol.has_claims(),
            gone: false,
        })
    }

    async fn node_phase(
        &self,
        vol: &mut Volume,
        response: &mut ReapResponse,
        first_err: &mut Option<WatcherError>,
    ) {
        let pending = claims_in_state(vol, ClaimState::NodeDetachPending);
        let mut checkpoints = Vec::with_capacity(pending.len());
        for claim in pending {
            match self.node_detach(vol, &claim).await {
                Ok(()) => {
                    let mut req = ClaimReleaseRequest::new(vol, &claim);
                    req.state = ClaimState::ControllerDetachPending;
                    checkpoints.push(req);
                }
                Err(e) => {
                    first_err.get_or_insert(e);
                }
            }
        }
        self.checkpoint(vol, checkpoints, response, first_err).await;
    }

    async fn controller_phase(&self, vol: &mut Volume, first_err: &mut Option<WatcherError>) {
        // node ID -> whether its controller detach succeeded this pass
        let mut detached: HashMap<String, bool> = HashMap::new();
        for claim in claims_in_state(vol, ClaimState::ControllerDetachPending) {
            if vol.controller_required && !node_still_needed(vol, &claim) {
                let ok = match detached.get(&claim.node_id) {
                    Some(ok) => *ok,
                    None => {
                        let ok = match self.controller_detach(vol, &claim).await {
                            Ok(()) => true,
                            Err(e) => {
                                first_err.get_or_insert(e);
                                false
                            }
                        };
                        detached.insert(claim.node_id.clone(), ok);
                        ok
                    }
                };
                if !ok {
                    continue;
                }
            }
            // Held locally until the release phase writes it.
            if let Some(past) = vol.past_claims.get_mut(&claim.allocation_id) {
                past.state = ClaimState::Released;
            }
        }
    }

    async fn release_phase(
        &self,
        vol: &mut Volume,
        response: &mut ReapResponse,
        first_err: &mut Option<WatcherError>,
    ) {
        let snapshot: &Volume = vol;
        let releases: Vec<ClaimReleaseRequest> = claims_in_state(snapshot, ClaimState::Released)
            .iter()
            .map(|claim| ClaimReleaseRequest::new(snapshot, claim))
            .collect();
        let count = releases.len();
        if self.checkpoint(vol, releases, response, first_err).await {
            response.released += count;
        }
    }

    /// Write claim transitions through the batcher and mirror them on the
    /// local snapshot.  Returns whether the write was applied.
    async fn checkpoint(
        &self,
        vol: &mut Volume,
        claims: Vec<ClaimReleaseRequest>,
        response: &mut ReapResponse,
        first_err: &mut Option<WatcherError>,
    ) -> bool {
        if claims.is_empty() {
            return false;
        }
        let result = tokio::select! {
            _ = self.cancel.cancelled() => Err(WatcherError::Cancelled),
            res = self.batcher.create_update(claims.clone()) => res,
        };
        match result {
            Ok(index) => {
                response.index = index;
                for req in &claims {
                    vol.claim_release(req);
                }
                true
            }
            Err(e) => {
                first_err.get_or_insert(e);
                false
            }
        }
    }

    async fn node_detach(&self, vol: &Volume, claim: &VolumeClaim) -> Result<(), WatcherError> {
        let req = NodeDetachVolumeRequest {
            plugin_id: vol.plugin_id.clone(),
            node_id: claim.node_id.clone(),
            volume_id: VolumeId::from(vol.id.as_str()),
            external_id: vol.remote_id().to_string(),
            alloc_id: claim.allocation_id.clone(),
            access_mode: vol.access_mode,
            read_only: claim.mode == ClaimMode::Read,
        };
        self.retry
            .run(&self.cancel, "node detach", || self.node_rpc.node_detach_volume(req.clone()))
            .await
            .map_err(|source| WatcherError::NodeDetach {
                node_id: claim.node_id.clone(),
                alloc_id: claim.allocation_id.clone(),
                source,
            })
    }

    async fn controller_detach(
        &self,
        vol: &Volume,
        claim: &VolumeClaim,
    ) -> Result<(), WatcherError> {
        let req = ControllerDetachVolumeRequest {
            plugin_id: vol.plugin_id.clone(),
            volume_id: VolumeId::from(vol.remote_id()),
            node_id: claim.node_id.clone(),
            alloc_id: claim.allocation_id.clone(),
        };
        self.retry
            .run(&self.cancel, "controller detach", || {
                self.controller_rpc.controller_detach_volume(req.clone())
            })
            .await
            .map_err(|source| WatcherError::ControllerDetach {
                node_id: claim.node_id.clone(),
                source,
            })
    }
}

/// Move every active claim that no longer needs the volume into
/// `past_claims`.
///
/// Claims whose allocation is gone from state skip straight to `Released`;
/// there is nothing left on the node to detach.  Claims already in
/// `past_claims` keep the state a previous pass checkpointed, and an active
/// copy of such a claim is folded into it.
fn collect_past_claims(vol: &mut Volume, force_alloc: Option<&str>) {
    let mut collected: HashMap<&str, ClaimReleaseRequest> = HashMap::new();
    for claim in vol.active_claims() {
        if collected.contains_key(claim.allocation_id.as_str()) {
            continue;
        }
        if let Some(past) = vol.past_claims.get(&claim.allocation_id) {
            collected.insert(&claim.allocation_id, ClaimReleaseRequest::new(vol, past));
            continue;
        }
        let forced = force_alloc == Some(claim.allocation_id.as_str());
        let next = match vol.claim_alloc(&claim.allocation_id) {
            Some(None) => Some(ClaimState::Released),
            Some(Some(alloc)) if alloc.is_terminal() => Some(ClaimState::NodeDetachPending),
            _ if forced => Some(ClaimState::NodeDetachPending),
            _ => None,
        };
        if let Some(state) = next {
            let mut req = ClaimReleaseRequest::new(vol, claim);
            req.state = state;
            collected.insert(&claim.allocation_id, req);
        }
    }
    let collected: Vec<ClaimReleaseRequest> = collected.into_values().collect();
    for req in &collected {
        vol.claim_release(req);
    }
}

fn claims_in_state(vol: &Volume, state: ClaimState) -> Vec<VolumeClaim> {
    vol.past_claims
        .values()
        .filter(|claim| claim.state == state)
        .cloned()
        .collect()
}

/// Whether some other claim on the same node still holds the volume there.
fn node_still_needed(vol: &Volume, claim: &VolumeClaim) -> bool {
    vol.active_claims().any(|c| c.node_id == claim.node_id)
        || vol.past_claims.values().any(|c| {
            c.allocation_id != claim.allocation_id
                && c.node_id == claim.node_id
                && c.state == ClaimState::NodeDetachPending
        })
}
