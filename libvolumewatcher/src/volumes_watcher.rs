//! Supervisor for the per-volume watchers.
//!
//! [`VolumesWatcher`] runs only while this server holds leadership.  Enabling
//! it starts the claim batcher and a discovery task that scans state at a
//! capped rate, starting a watcher for every volume with claims.  Disabling
//! it stops everything before returning; nothing is kept in memory that
//! cannot be rebuilt from state on the next step-up.

use std::collections::HashMap;
use std::mem;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use libcsi::{CsiController, CsiNode};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::batcher::VolumeUpdateBatcher;
use crate::config::WatcherConfig;
use crate::error::{StateError, WatcherError};
use crate::state::{ClaimWriter, StateReader};
use crate::structs::{ReapResponse, Volume, VolumeClaimRequest, VolumeKey};
use crate::volume_watcher::{ReapCommand, VolumeWatcher, WatcherDone};

const REAP_QUEUE_DEPTH: usize = 8;

/// Times a reap is re-queued when the watcher it was queued on stops first.
const REAP_ATTEMPTS: usize = 3;

/// Handle to the volume watcher supervisor.  Clones share one supervisor.
#[derive(Clone)]
pub struct VolumesWatcher {
    inner: Arc<Shared>,
}

struct Shared {
    config: WatcherConfig,
    node_rpc: Arc<dyn CsiNode>,
    controller_rpc: Arc<dyn CsiController>,
    writer: Arc<dyn ClaimWriter>,
    /// Serializes enable/disable so a step-up never overlaps a step-down.
    transition: tokio::sync::Mutex<()>,
    lifecycle: Mutex<Lifecycle>,
}

#[derive(Default)]
struct Lifecycle {
    /// Bumped on every enable and disable.
    epoch: u64,
    next_watcher_id: u64,
    running: Option<Running>,
    watchers: HashMap<VolumeKey, WatcherHandle>,
}

/// Resources that only exist while enabled.
struct Running {
    state: Arc<dyn StateReader>,
    cancel: CancellationToken,
    batcher: VolumeUpdateBatcher,
    batcher_task: JoinHandle<()>,
    discovery_task: JoinHandle<()>,
    done_tx: mpsc::UnboundedSender<WatcherDone>,
}

struct WatcherHandle {
    id: u64,
    cancel: CancellationToken,
    task: JoinHandle<()>,
    notify_tx: watch::Sender<Option<Volume>>,
    reap_tx: mpsc::Sender<ReapCommand>,
}

impl VolumesWatcher {
    pub fn new(
        config: WatcherConfig,
        node_rpc: Arc<dyn CsiNode>,
        controller_rpc: Arc<dyn CsiController>,
        writer: Arc<dyn ClaimWriter>,
    ) -> Self {
        Self {
            inner: Arc::new(Shared {
                config,
                node_rpc,
                controller_rpc,
                writer,
                transition: tokio::sync::Mutex::new(()),
                lifecycle: Mutex::new(Lifecycle::default()),
            }),
        }
    }

    /// Start or stop the subsystem on a leadership change.
    ///
    /// Enabling twice is a no-op.  Disabling returns only after every
    /// watcher, the discovery task and the batcher have stopped.
    pub async fn set_enabled(&self, enabled: bool, state: Arc<dyn StateReader>) {
        let _transition = self.inner.transition.lock().await;
        if enabled {
            self.inner.enable(state);
        } else {
            self.inner.disable().await;
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.lock().running.is_some()
    }

    /// Number of live per-volume watchers.
    pub fn watcher_count(&self) -> usize {
        self.inner.lock().watchers.len()
    }

    /// Run a reaping pass on one volume now and wait for its outcome.
    ///
    /// The pass is queued behind any pass already running on the volume.
    #[instrument(skip(self), fields(volume = %req.volume_key()))]
    pub async fn reap(&self, req: VolumeClaimRequest) -> Result<ReapResponse, WatcherError> {
        let key = req.volume_key();
        for _ in 0..REAP_ATTEMPTS {
            let state = self
                .inner
                .lock()
                .running
                .as_ref()
                .map(|running| Arc::clone(&running.state))
                .ok_or(WatcherError::NotEnabled)?;
            let volume = state
                .volume(&key)
                .await?
                .ok_or_else(|| WatcherError::volume_not_found(&key))?;

            let reap_tx = {
                let mut lc = self.inner.lock();
                if !lc.watchers.contains_key(&key) {
                    self.inner.spawn_watcher(&mut lc, volume);
                }
                match lc.watchers.get(&key) {
                    Some(handle) => handle.reap_tx.clone(),
                    None => return Err(WatcherError::NotEnabled),
                }
            };

            let (reply, rx) = oneshot::channel();
            let cmd = ReapCommand {
                force_alloc: req.allocation_id.clone(),
                reply,
            };
            if reap_tx.send(cmd).await.is_err() {
                continue;
            }
            match rx.await {
                Ok(result) => return result,
                Err(_) => debug!("watcher stopped before running the reap, requeueing"),
            }
        }
        Err(WatcherError::Cancelled)
    }

    /// Wake the watcher of a volume with a fresh copy of its record.
    pub fn notify(&self, volume: Volume) {
        let key = volume.key();
        let lc = self.inner.lock();
        match lc.watchers.get(&key) {
            Some(handle) => {
                handle.notify_tx.send_replace(Some(volume));
            }
            None => warn!(volume = %key, "notified for a volume without a watcher, ignoring"),
        }
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn enable(self: &Arc<Self>, state: Arc<dyn StateReader>) {
        let mut lc = self.lock();
        if lc.running.is_some() {
            return;
        }
        lc.epoch += 1;
        let epoch = lc.epoch;

        let cancel = CancellationToken::new();
        let (batcher, batcher_task) = VolumeUpdateBatcher::new(
            self.config.update_batch_duration(),
            Arc::clone(&self.writer),
            cancel.child_token(),
        );
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        let discovery_task = tokio::spawn(Arc::clone(self).discover(
            Arc::clone(&state),
            epoch,
            cancel.child_token(),
            done_rx,
        ));

        lc.running = Some(Running {
            state,
            cancel,
            batcher,
            batcher_task,
            discovery_task,
            done_tx,
        });
        info!(epoch, "volume watcher enabled");
    }

    async fn disable(&self) {
        let (running, watchers, epoch) = {
            let mut lc = self.lock();
            let Some(running) = lc.running.take() else {
                return;
            };
            lc.epoch += 1;
            running.cancel.cancel();
            (running, mem::take(&mut lc.watchers), lc.epoch)
        };

        for (key, handle) in watchers {
            handle.cancel.cancel();
            if let Err(e) = handle.task.await {
                warn!(volume = %key, error = %e, "volume watcher exited abnormally");
            }
        }
        if let Err(e) = running.discovery_task.await {
            warn!(error = %e, "volume discovery exited abnormally");
        }
        if let Err(e) = running.batcher_task.await {
            warn!(error = %e, "claim update batcher exited abnormally");
        }
        info!(epoch, "volume watcher disabled");
    }

    /// Start a watcher for `volume`.  No-op while disabled.
    fn spawn_watcher(&self, lc: &mut Lifecycle, volume: Volume) {
        let Some(running) = &lc.running else {
            return;
        };
        let key = volume.key();
        let id = lc.next_watcher_id;
        let cancel = running.cancel.child_token();
        let (notify_tx, notify_rx) = watch::channel(None);
        let (reap_tx, reap_rx) = mpsc::channel(REAP_QUEUE_DEPTH);

        let watcher = VolumeWatcher {
            key: key.clone(),
            epoch: lc.epoch,
            id,
            state: Arc::clone(&running.state),
            node_rpc: Arc::clone(&self.node_rpc),
            controller_rpc: Arc::clone(&self.controller_rpc),
            batcher: running.batcher.clone(),
            retry: self.config.retry_policy(),
            cancel: cancel.clone(),
            notify_rx,
            reap_rx,
            done_tx: running.done_tx.clone(),
            last_index: volume.modify_index,
        };
        let task = tokio::spawn(watcher.run());

        debug!(volume = %key, id, "started volume watcher");
        lc.next_watcher_id += 1;
        lc.watchers.insert(
            key,
            WatcherHandle {
                id,
                cancel,
                task,
                notify_tx,
                reap_tx,
            },
        );
    }

    async fn discover(
        self: Arc<Self>,
        state: Arc<dyn StateReader>,
        epoch: u64,
        cancel: CancellationToken,
        mut done_rx: mpsc::UnboundedReceiver<WatcherDone>,
    ) {
        let mut ticker = tokio::time::interval(self.config.state_query_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_index: Option<u64> = None;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                done = done_rx.recv() => match done {
                    Some(done) => self.collect_drained(&*state, done).await,
                    None => break,
                },
                scan = next_volumes(&*state, &mut ticker, last_index) => match scan {
                    Ok((volumes, index)) => {
                        last_index = Some(index);
                        self.register(epoch, volumes);
                    }
                    Err(e) => warn!(error = %e, "failed to list volumes, retrying"),
                },
            }
        }
        debug!(epoch, "volume discovery stopped");
    }

    /// Start watchers for volumes with claims that have none.
    fn register(&self, epoch: u64, volumes: Vec<Volume>) {
        let mut lc = self.lock();
        if lc.epoch != epoch {
            return;
        }
        for vol in volumes {
            if vol.has_claims() && !lc.watchers.contains_key(&vol.key()) {
                self.spawn_watcher(&mut lc, vol);
            }
        }
    }

    /// Stop a watcher that reported its volume drained, if state agrees.
    async fn collect_drained(&self, state: &dyn StateReader, done: WatcherDone) {
        let drained = match state.volume(&done.key).await {
            Ok(vol) => vol.is_none_or(|vol| !vol.has_claims()),
            Err(e) => {
                warn!(volume = %done.key, error = %e, "failed to read drained volume");
                return;
            }
        };
        if !drained {
            debug!(volume = %done.key, "volume has new claims, keeping watcher");
            return;
        }

        let mut lc = self.lock();
        if lc.epoch != done.epoch {
            return;
        }
        if lc.watchers.get(&done.key).is_some_and(|h| h.id == done.id) {
            if let Some(handle) = lc.watchers.remove(&done.key) {
                handle.cancel.cancel();
                debug!(volume = %done.key, "stopped watcher for drained volume");
            }
        }
    }
}

/// Wait for the next rate-limited scan slot, then for state to move past the
/// last scan, and list every volume.
async fn next_volumes(
    state: &dyn StateReader,
    ticker: &mut Interval,
    after: Option<u64>,
) -> Result<(Vec<Volume>, u64), StateError> {
    ticker.tick().await;
    if let Some(after) = after {
        state.wait_for_index(after).await?;
    }
    state.volumes().await
}
