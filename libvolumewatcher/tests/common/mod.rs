#![allow(dead_code)]

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use libcsi::{
    ControllerDetachVolumeRequest, CsiController, CsiError, CsiNode, NodeDetachVolumeRequest,
};
use libvolumewatcher::{
    AllocClientStatus, Allocation, ClaimMode, ClaimReleaseRequest, ClaimState, ClaimWriter,
    MemoryStateStore, StateError, StateReader, Volume, VolumeClaim, VolumeKey, VolumesWatcher,
    WatcherConfig,
};
use tokio::sync::Semaphore;

pub const NODE: &str = "node-01";

/// Node and controller plugin that counts calls.
#[derive(Default)]
pub struct MockRpc {
    node_calls: AtomicUsize,
    controller_calls: AtomicUsize,
    node_error: Option<CsiError>,
    /// When set, node detaches block until a permit is available.
    gate: Option<Arc<Semaphore>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockRpc {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing(err: CsiError) -> Arc<Self> {
        Arc::new(Self {
            node_error: Some(err),
            ..Default::default()
        })
    }

    /// A plugin whose node detaches hang until permits are added to the
    /// returned semaphore.
    pub fn gated() -> (Arc<Self>, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let rpc = Arc::new(Self {
            gate: Some(Arc::clone(&gate)),
            ..Default::default()
        });
        (rpc, gate)
    }

    pub fn node_calls(&self) -> usize {
        self.node_calls.load(Ordering::SeqCst)
    }

    pub fn controller_calls(&self) -> usize {
        self.controller_calls.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CsiNode for MockRpc {
    async fn node_detach_volume(&self, _req: NodeDetachVolumeRequest) -> Result<(), CsiError> {
        self.node_calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let result = match &self.gate {
            Some(gate) => gate.acquire().await.map(|_| ()).map_err(|_| CsiError::Cancelled),
            None => Ok(()),
        };
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result?;

        match &self.node_error {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl CsiController for MockRpc {
    async fn controller_detach_volume(
        &self,
        _req: ControllerDetachVolumeRequest,
    ) -> Result<(), CsiError> {
        self.controller_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Claim writer that counts upserts and optionally applies them to the store.
pub struct CountingWriter {
    store: Arc<MemoryStateStore>,
    apply: bool,
    writes: AtomicUsize,
    claims: Mutex<Vec<ClaimReleaseRequest>>,
}

impl CountingWriter {
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn claims(&self) -> Vec<ClaimReleaseRequest> {
        self.claims.lock().unwrap().clone()
    }
}

#[async_trait]
impl ClaimWriter for CountingWriter {
    async fn upsert_volume_claims(
        &self,
        claims: Vec<ClaimReleaseRequest>,
    ) -> Result<u64, StateError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.claims.lock().unwrap().extend(claims.iter().cloned());
        if self.apply {
            self.store.upsert_volume_claims(claims).await
        } else {
            Ok(self.store.latest_index())
        }
    }
}

pub struct Harness {
    pub store: Arc<MemoryStateStore>,
    pub rpc: Arc<MockRpc>,
    pub writer: Arc<CountingWriter>,
    pub watcher: VolumesWatcher,
}

impl Harness {
    /// Supervisor over a fresh store.  With `apply` unset, claim writes are
    /// counted but never reach state.
    pub fn new(rpc: Arc<MockRpc>, apply: bool) -> Self {
        let store = Arc::new(MemoryStateStore::new());
        let writer = Arc::new(CountingWriter {
            store: Arc::clone(&store),
            apply,
            writes: AtomicUsize::new(0),
            claims: Mutex::new(Vec::new()),
        });
        let watcher = VolumesWatcher::new(
            test_config(),
            rpc.clone(),
            rpc.clone(),
            writer.clone(),
        );
        Self {
            store,
            rpc,
            writer,
            watcher,
        }
    }

    pub fn state(&self) -> Arc<dyn StateReader> {
        self.store.clone()
    }

    pub async fn enable(&self) {
        self.watcher.set_enabled(true, self.state()).await;
    }

    pub async fn disable(&self) {
        self.watcher.set_enabled(false, self.state()).await;
    }

    pub async fn volume(&self, key: &VolumeKey) -> Volume {
        self.store.volume(key).await.unwrap().unwrap()
    }
}

pub fn test_config() -> WatcherConfig {
    WatcherConfig {
        update_batch_duration_ms: 20,
        detach_attempts: 3,
        detach_timeout_ms: 5_000,
        retry_backoff_base_ms: 1,
        retry_backoff_max_ms: 10,
        ..WatcherConfig::default()
    }
}

pub fn alloc(id: &str, status: AllocClientStatus) -> Allocation {
    Allocation {
        id: id.into(),
        node_id: NODE.into(),
        job_id: "web".into(),
        client_status: status,
    }
}

pub fn claim(alloc_id: &str, mode: ClaimMode) -> VolumeClaim {
    VolumeClaim {
        allocation_id: alloc_id.into(),
        node_id: NODE.into(),
        mode,
        state: ClaimState::Taken,
    }
}

/// A controller-backed volume with one read claim per allocation.
pub fn claimed_volume(id: &str, alloc_ids: &[&str]) -> Volume {
    let mut vol = Volume::new("default", id, "minnie");
    vol.controller_required = true;
    for alloc_id in alloc_ids {
        vol.read_claims
            .insert(alloc_id.to_string(), claim(alloc_id, ClaimMode::Read));
    }
    vol
}

/// Poll `check` every 10ms until it holds or `timeout` passes.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
