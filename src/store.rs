//! Resource access for upgrade tasks.
//!
//! Upgrade tasks never talk to `kube::Api` directly; they borrow a
//! [`ResourceStore`] for the duration of a run. Writes use the object's
//! `resourceVersion` for optimistic concurrency, and a lost race surfaces as
//! [`NdmError::Conflict`] instead of being retried.

#[cfg(test)]
pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use kube::api::{ListParams, PostParams};
use kube::{Api, ResourceExt};
use tracing::debug;

use crate::crd::{BlockDevice, BlockDeviceClaim};
use crate::error::NdmError;

/// Read and replace NDM custom resources.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    async fn list_block_devices(&self) -> Result<Vec<BlockDevice>>;

    /// Replace a device, including its labels, in a single write.
    async fn replace_block_device(&self, device: &BlockDevice) -> Result<BlockDevice>;

    async fn list_claims(&self) -> Result<Vec<BlockDeviceClaim>>;

    /// Replace a claim, including its labels and finalizers, in a single write.
    async fn replace_claim(&self, claim: &BlockDeviceClaim) -> Result<BlockDeviceClaim>;
}

/// [`ResourceStore`] backed by the Kubernetes API in the watch namespace.
pub struct KubeStore {
    devices: Api<BlockDevice>,
    claims: Api<BlockDeviceClaim>,
}

impl KubeStore {
    pub fn new(client: kube::Client, namespace: &str) -> Self {
        Self {
            devices: Api::namespaced(client.clone(), namespace),
            claims: Api::namespaced(client, namespace),
        }
    }
}

#[async_trait]
impl ResourceStore for KubeStore {
    async fn list_block_devices(&self) -> Result<Vec<BlockDevice>> {
        let list = self
            .devices
            .list(&ListParams::default())
            .await
            .map_err(|e| NdmError::KubernetesApi(format!("Failed to list BlockDevices: {e}")))?;
        debug!(count = list.items.len(), "Listed BlockDevices");
        Ok(list.items)
    }

    async fn replace_block_device(&self, device: &BlockDevice) -> Result<BlockDevice> {
        let name = device.name_any();
        self.devices
            .replace(&name, &PostParams::default(), device)
            .await
            .map_err(|e| NdmError::from_kube("BlockDevice", &name, &e).into())
    }

    async fn list_claims(&self) -> Result<Vec<BlockDeviceClaim>> {
        let list = self.claims.list(&ListParams::default()).await.map_err(|e| {
            NdmError::KubernetesApi(format!("Failed to list BlockDeviceClaims: {e}"))
        })?;
        debug!(count = list.items.len(), "Listed BlockDeviceClaims");
        Ok(list.items)
    }

    async fn replace_claim(&self, claim: &BlockDeviceClaim) -> Result<BlockDeviceClaim> {
        let name = claim.name_any();
        self.claims
            .replace(&name, &PostParams::default(), claim)
            .await
            .map_err(|e| NdmError::from_kube("BlockDeviceClaim", &name, &e).into())
    }
}
