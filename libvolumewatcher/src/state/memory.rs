//! In-process state store.
//!
//! Every mutation runs under one write lock and advances a single store
//! index, published through a [`watch`] channel so blocked readers wake up.
//! Each volume also has its own channel carrying its `modify_index`, so a
//! volume watcher only wakes for writes that touch its volume.

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use tokio::sync::{RwLock, watch};
use tracing::debug;

use super::{ClaimWriter, StateReader};
use crate::error::StateError;
use crate::structs::{Allocation, ClaimReleaseRequest, Volume, VolumeKey};

#[derive(Default)]
struct Tables {
    index: u64,
    volumes: BTreeMap<VolumeKey, Volume>,
    allocs: HashMap<String, Allocation>,
    /// Per-volume `modify_index`; dropped when the volume is deregistered.
    volume_tx: HashMap<VolumeKey, watch::Sender<u64>>,
}

impl Tables {
    fn bump(&mut self) -> u64 {
        self.index += 1;
        self.index
    }

    /// Wake the waiters of every volume modified at `index`.
    fn publish(&self, index: u64) {
        for (key, vol) in &self.volumes {
            if vol.modify_index != index {
                continue;
            }
            if let Some(tx) = self.volume_tx.get(key) {
                tx.send_replace(index);
            }
        }
    }

    /// Fill in the allocation behind every active claim.
    fn denormalize(&self, vol: &Volume) -> Volume {
        let mut vol = vol.clone();
        vol.read_allocs = vol
            .read_claims
            .keys()
            .map(|id| (id.clone(), self.allocs.get(id).cloned()))
            .collect();
        vol.write_allocs = vol
            .write_claims
            .keys()
            .map(|id| (id.clone(), self.allocs.get(id).cloned()))
            .collect();
        vol
    }
}

/// State store held entirely in memory.
pub struct MemoryStateStore {
    tables: RwLock<Tables>,
    index_tx: watch::Sender<u64>,
}

impl Default for MemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStateStore {
    pub fn new() -> Self {
        let (index_tx, _) = watch::channel(0);
        Self {
            tables: RwLock::new(Tables::default()),
            index_tx,
        }
    }

    /// Latest applied index.
    pub fn latest_index(&self) -> u64 {
        *self.index_tx.borrow()
    }

    /// Register or replace volumes. Denormalized allocation maps on the
    /// input are ignored.
    pub async fn upsert_volumes(&self, volumes: Vec<Volume>) -> u64 {
        let mut tables = self.tables.write().await;
        let index = tables.bump();
        for mut vol in volumes {
            let key = vol.key();
            vol.read_allocs.clear();
            vol.write_allocs.clear();
            vol.create_index = tables
                .volumes
                .get(&key)
                .map(|existing| existing.create_index)
                .unwrap_or(index);
            vol.modify_index = index;
            tables
                .volume_tx
                .entry(key.clone())
                .or_insert_with(|| watch::channel(index).0);
            tables.volumes.insert(key, vol);
        }
        tables.publish(index);
        self.index_tx.send_replace(index);
        index
    }

    /// Insert or update allocations. Every volume with an active claim on
    /// one of them is touched so its watcher sees the change.
    pub async fn upsert_allocs(&self, allocs: Vec<Allocation>) -> u64 {
        let mut tables = self.tables.write().await;
        let index = tables.bump();
        let changed: HashSet<String> = allocs.iter().map(|a| a.id.clone()).collect();
        for alloc in allocs {
            tables.allocs.insert(alloc.id.clone(), alloc);
        }
        for vol in tables.volumes.values_mut() {
            let touched = vol
                .read_claims
                .keys()
                .chain(vol.write_claims.keys())
                .any(|id| changed.contains(id));
            if touched {
                vol.modify_index = index;
            }
        }
        tables.publish(index);
        self.index_tx.send_replace(index);
        index
    }

    /// Remove allocations from state, as the allocation garbage collector does.
    pub async fn delete_allocs(&self, alloc_ids: &[&str]) -> u64 {
        let mut tables = self.tables.write().await;
        let index = tables.bump();
        for id in alloc_ids {
            tables.allocs.remove(*id);
        }
        for vol in tables.volumes.values_mut() {
            let touched = vol
                .read_claims
                .keys()
                .chain(vol.write_claims.keys())
                .any(|id| alloc_ids.contains(&id.as_str()));
            if touched {
                vol.modify_index = index;
            }
        }
        tables.publish(index);
        self.index_tx.send_replace(index);
        index
    }

    /// Remove a volume. Returns the index of the removal, or `None` if the
    /// volume was not registered.
    pub async fn deregister_volume(&self, key: &VolumeKey) -> Option<u64> {
        let mut tables = self.tables.write().await;
        tables.volumes.remove(key)?;
        tables.volume_tx.remove(key);
        let index = tables.bump();
        self.index_tx.send_replace(index);
        Some(index)
    }
}

#[async_trait]
impl StateReader for MemoryStateStore {
    async fn volume(&self, key: &VolumeKey) -> Result<Option<Volume>, StateError> {
        let tables = self.tables.read().await;
        Ok(tables.volumes.get(key).map(|vol| tables.denormalize(vol)))
    }

    async fn volumes(&self) -> Result<(Vec<Volume>, u64), StateError> {
        let tables = self.tables.read().await;
        let vols = tables
            .volumes
            .values()
            .map(|vol| tables.denormalize(vol))
            .collect();
        Ok((vols, tables.index))
    }

    async fn wait_for_index(&self, after: u64) -> Result<u64, StateError> {
        let mut rx = self.index_tx.subscribe();
        let index = *rx
            .wait_for(|index| *index > after)
            .await
            .map_err(|_| StateError::Closed)?;
        Ok(index)
    }

    async fn wait_for_volume(
        &self,
        key: &VolumeKey,
        min_index: u64,
    ) -> Result<Option<Volume>, StateError> {
        let rx = {
            let tables = self.tables.read().await;
            tables.volume_tx.get(key).map(watch::Sender::subscribe)
        };
        match rx {
            Some(mut rx) => {
                // An error means the volume was deregistered; the read below
                // says so.
                let _ = rx.wait_for(|index| *index > min_index).await;
            }
            None => {
                self.wait_for_index(min_index).await?;
            }
        }
        self.volume(key).await
    }
}

#[async_trait]
impl ClaimWriter for MemoryStateStore {
    async fn upsert_volume_claims(
        &self,
        claims: Vec<ClaimReleaseRequest>,
    ) -> Result<u64, StateError> {
        let mut tables = self.tables.write().await;
        if claims.is_empty() {
            return Ok(tables.index);
        }
        let index = tables.bump();
        for req in &claims {
            match tables.volumes.get_mut(&req.volume_key()) {
                Some(vol) => {
                    vol.claim_release(req);
                    vol.modify_index = index;
                }
                None => {
                    debug!(volume = %req.volume_key(), alloc_id = %req.allocation_id,
                        "claim release for unknown volume, skipping");
                }
            }
        }
        tables.publish(index);
        self.index_tx.send_replace(index);
        Ok(index)
    }
}
