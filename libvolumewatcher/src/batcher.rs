//! Cross-volume claim update batcher.
//!
//! Every per-volume watcher submits its claim transitions here.  Requests
//! arriving within one window are merged into a single
//! [`ClaimWriter::upsert_volume_claims`] call, and every submitter in the
//! window receives that call's outcome.

use std::collections::HashMap;
use std::mem;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::WatcherError;
use crate::state::ClaimWriter;
use crate::structs::{ClaimReleaseRequest, VolumeKey};

const SUBMISSION_QUEUE_DEPTH: usize = 256;

type UpdateResult = Result<u64, WatcherError>;

struct UpdateWrapper {
    claims: Vec<ClaimReleaseRequest>,
    reply: oneshot::Sender<UpdateResult>,
}

/// Handle for submitting claim updates to the batch loop.
#[derive(Clone)]
pub struct VolumeUpdateBatcher {
    tx: mpsc::Sender<UpdateWrapper>,
}

impl VolumeUpdateBatcher {
    /// Spawn the batch loop.  It runs until `cancel` fires, then flushes
    /// the open window and exits; the returned handle resolves after that
    /// final write.
    pub fn new(
        duration: Duration,
        writer: Arc<dyn ClaimWriter>,
        cancel: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(SUBMISSION_QUEUE_DEPTH);
        let task = tokio::spawn(batch_loop(duration, writer, cancel, rx));
        (Self { tx }, task)
    }

    /// Submit claim transitions and wait until the write containing them
    /// has been applied.  Returns the index of that write.
    pub async fn create_update(&self, claims: Vec<ClaimReleaseRequest>) -> UpdateResult {
        if claims.is_empty() {
            return Ok(0);
        }
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(UpdateWrapper { claims, reply })
            .await
            .map_err(|_| WatcherError::Cancelled)?;
        rx.await.map_err(|_| WatcherError::Cancelled)?
    }
}

/// The open window.
#[derive(Default)]
struct PendingBatch {
    claims: Vec<ClaimReleaseRequest>,
    positions: HashMap<(VolumeKey, String), usize>,
    waiters: Vec<oneshot::Sender<UpdateResult>>,
}

impl PendingBatch {
    fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }

    /// Merge a submission; a request for a claim already in the window
    /// replaces the earlier one in place.
    fn add(&mut self, update: UpdateWrapper) {
        for req in update.claims {
            match self.positions.get(&req.claim_key()) {
                Some(&pos) => self.claims[pos] = req,
                None => {
                    self.positions.insert(req.claim_key(), self.claims.len());
                    self.claims.push(req);
                }
            }
        }
        self.waiters.push(update.reply);
    }

    async fn flush(&mut self, writer: &dyn ClaimWriter) {
        if self.is_empty() {
            return;
        }
        let claims = mem::take(&mut self.claims);
        let waiters = mem::take(&mut self.waiters);
        self.positions.clear();

        let count = claims.len();
        let result = writer
            .upsert_volume_claims(claims)
            .await
            .map_err(WatcherError::write);
        match &result {
            Ok(index) => debug!(claims = count, index, "applied claim batch"),
            Err(e) => warn!(claims = count, error = %e, "failed to apply claim batch"),
        }
        for waiter in waiters {
            // The submitter may have been cancelled while waiting.
            let _ = waiter.send(result.clone());
        }
    }
}

async fn batch_loop(
    duration: Duration,
    writer: Arc<dyn ClaimWriter>,
    cancel: CancellationToken,
    mut rx: mpsc::Receiver<UpdateWrapper>,
) {
    let mut pending = PendingBatch::default();
    let mut deadline: Option<Instant> = None;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                deadline = None;
                pending.flush(&*writer).await;
            }
            update = rx.recv() => match update {
                Some(update) => {
                    deadline.get_or_insert_with(|| Instant::now() + duration);
                    pending.add(update);
                }
                None => break,
            },
        }
    }

    pending.flush(&*writer).await;
    rx.close();
    while let Ok(update) = rx.try_recv() {
        let _ = update.reply.send(Err(WatcherError::Cancelled));
    }
    debug!("claim update batcher stopped");
}
