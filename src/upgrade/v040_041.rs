//! 0.4.0 -> 0.4.1: claims move their host constraint under
//! `blockDeviceNodeAttributes` and bound claims gain the claim finalizer.
//! Device data has the same shape in both versions, so devices only have
//! their version label moved forward.

use anyhow::{Context, Result};
use async_trait::async_trait;
use kube::ResourceExt;
use tracing::debug;

use super::{TaskReport, UpgradeTask};
use crate::crd::{BlockDeviceClaim, ClaimPhase};
use crate::store::ResourceStore;
use crate::version::{Version, set_version, version_of};

pub struct ClaimHostUpgrade {
    from: Version,
    to: Version,
}

impl ClaimHostUpgrade {
    pub const fn new() -> Self {
        Self {
            from: Version::new(0, 4, 0),
            to: Version::new(0, 4, 1),
        }
    }
}

/// Rewrite a claim into the 0.4.1 shape.
///
/// A host already present under `blockDeviceNodeAttributes` wins over the
/// legacy field.
pub fn migrate_claim(claim: &mut BlockDeviceClaim) {
    if let Some(host) = claim.spec.host_name.take() {
        let attrs = claim
            .spec
            .block_device_node_attributes
            .get_or_insert_with(Default::default);
        if attrs.host_name.is_none() {
            attrs.host_name = Some(host);
        }
    }

    // The API server refuses new finalizers on objects being deleted.
    if claim.phase() == ClaimPhase::Bound && claim.metadata.deletion_timestamp.is_none() {
        claim.add_finalizer();
    }
}

#[async_trait]
impl UpgradeTask for ClaimHostUpgrade {
    fn from_version(&self) -> &Version {
        &self.from
    }

    fn to_version(&self) -> &Version {
        &self.to
    }

    async fn apply(&self, store: &dyn ResourceStore) -> Result<TaskReport> {
        let mut report = TaskReport::default();

        for mut device in store.list_block_devices().await? {
            let name = device.name_any();
            let version = version_of(&device.metadata)
                .with_context(|| format!("BlockDevice {name} has an unreadable version"))?;
            if version != self.from {
                continue;
            }

            set_version(&mut device.metadata, &self.to);
            store.replace_block_device(&device).await?;

            debug!(name = %name, to = %self.to, "Migrated BlockDevice");
            report.devices_migrated += 1;
        }

        for mut claim in store.list_claims().await? {
            let name = claim.name_any();
            let version = version_of(&claim.metadata)
                .with_context(|| format!("BlockDeviceClaim {name} has an unreadable version"))?;
            if version != self.from {
                continue;
            }

            migrate_claim(&mut claim);
            set_version(&mut claim.metadata, &self.to);
            store.replace_claim(&claim).await?;

            debug!(name = %name, to = %self.to, "Migrated BlockDeviceClaim");
            report.claims_migrated += 1;
        }

        Ok(report)
    }
}
