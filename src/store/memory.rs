//! In-memory [`ResourceStore`] for tests.
//!
//! Mimics the API server's optimistic concurrency: every stored object has a
//! `resourceVersion`, and a replace carrying a stale one is rejected with
//! [`NdmError::Conflict`].

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use kube::ResourceExt;

use super::ResourceStore;
use crate::crd::{BlockDevice, BlockDeviceClaim};
use crate::error::NdmError;

#[derive(Default)]
pub struct MemoryStore {
    devices: Mutex<BTreeMap<String, BlockDevice>>,
    claims: Mutex<BTreeMap<String, BlockDeviceClaim>>,
    conflicts: Mutex<BTreeSet<String>>,
    /// Writes allowed before every further write fails.
    write_budget: Mutex<Option<usize>>,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_device(&self, mut device: BlockDevice) {
        device.metadata.resource_version = Some("1".to_string());
        self.devices
            .lock()
            .unwrap()
            .insert(device.name_any(), device);
    }

    pub fn insert_claim(&self, mut claim: BlockDeviceClaim) {
        claim.metadata.resource_version = Some("1".to_string());
        self.claims.lock().unwrap().insert(claim.name_any(), claim);
    }

    pub fn device(&self, name: &str) -> BlockDevice {
        self.devices.lock().unwrap()[name].clone()
    }

    pub fn claim(&self, name: &str) -> BlockDeviceClaim {
        self.claims.lock().unwrap()[name].clone()
    }

    /// Make the next write to `name` lose an optimistic-concurrency race.
    pub fn conflict_on(&self, name: &str) {
        self.conflicts.lock().unwrap().insert(name.to_string());
    }

    /// Allow `n` more successful writes, then fail every write.
    pub fn fail_writes_after(&self, n: usize) {
        *self.write_budget.lock().unwrap() = Some(n);
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> usize {
        self.reads() + self.writes()
    }

    fn check_write(
        &self,
        kind: &str,
        name: &str,
        stored_rv: Option<&String>,
        incoming_rv: Option<&String>,
    ) -> Result<()> {
        if let Some(budget) = self.write_budget.lock().unwrap().as_mut() {
            if *budget == 0 {
                return Err(
                    NdmError::KubernetesApi(format!("{kind} {name}: connection reset")).into(),
                );
            }
            *budget -= 1;
        }
        if self.conflicts.lock().unwrap().remove(name) || stored_rv != incoming_rv {
            return Err(NdmError::Conflict {
                kind: kind.to_string(),
                name: name.to_string(),
            }
            .into());
        }
        Ok(())
    }
}

fn bump(rv: Option<&String>) -> Option<String> {
    let current: u64 = rv.and_then(|v| v.parse().ok()).unwrap_or(0);
    Some((current + 1).to_string())
}

#[async_trait]
impl ResourceStore for MemoryStore {
    async fn list_block_devices(&self) -> Result<Vec<BlockDevice>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.devices.lock().unwrap().values().cloned().collect())
    }

    async fn replace_block_device(&self, device: &BlockDevice) -> Result<BlockDevice> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let name = device.name_any();
        let mut devices = self.devices.lock().unwrap();
        let stored = devices
            .get(&name)
            .ok_or_else(|| NdmError::KubernetesApi(format!("BlockDevice {name} not found")))?;
        self.check_write(
            "BlockDevice",
            &name,
            stored.metadata.resource_version.as_ref(),
            device.metadata.resource_version.as_ref(),
        )?;
        let mut updated = device.clone();
        updated.metadata.resource_version = bump(stored.metadata.resource_version.as_ref());
        devices.insert(name, updated.clone());
        Ok(updated)
    }

    async fn list_claims(&self) -> Result<Vec<BlockDeviceClaim>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.claims.lock().unwrap().values().cloned().collect())
    }

    async fn replace_claim(&self, claim: &BlockDeviceClaim) -> Result<BlockDeviceClaim> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let name = claim.name_any();
        let mut claims = self.claims.lock().unwrap();
        let stored = claims
            .get(&name)
            .ok_or_else(|| NdmError::KubernetesApi(format!("BlockDeviceClaim {name} not found")))?;
        self.check_write(
            "BlockDeviceClaim",
            &name,
            stored.metadata.resource_version.as_ref(),
            claim.metadata.resource_version.as_ref(),
        )?;
        let mut updated = claim.clone();
        updated.metadata.resource_version = bump(stored.metadata.resource_version.as_ref());
        claims.insert(name, updated.clone());
        Ok(updated)
    }
}
