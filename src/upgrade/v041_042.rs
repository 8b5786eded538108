//! 0.4.1 -> 0.4.2: devices and claims record the Kubernetes node name next
//! to the host name.

use anyhow::{Context, Result};
use async_trait::async_trait;
use kube::ResourceExt;
use tracing::debug;

use super::{TaskReport, UpgradeTask};
use crate::crd::{BlockDevice, BlockDeviceClaim, HOSTNAME_LABEL};
use crate::store::ResourceStore;
use crate::version::{Version, set_version, version_of};

pub struct NodeNameUpgrade {
    from: Version,
    to: Version,
}

impl NodeNameUpgrade {
    pub const fn new() -> Self {
        Self {
            from: Version::new(0, 4, 1),
            to: Version::new(0, 4, 2),
        }
    }
}

/// Fill `nodeAttributes.nodeName` from the hostname label, falling back to
/// the recorded host name.
pub fn migrate_device(device: &mut BlockDevice) {
    if device.spec.node_attributes.node_name.is_some() {
        return;
    }
    let from_label = device.labels().get(HOSTNAME_LABEL).cloned();
    let host = &device.spec.node_attributes.host_name;
    device.spec.node_attributes.node_name =
        from_label.or_else(|| (!host.is_empty()).then(|| host.clone()));
}

/// Fill `blockDeviceNodeAttributes.nodeName` from the claim's host.
pub fn migrate_claim(claim: &mut BlockDeviceClaim) {
    let Some(host) = claim.requested_host().map(str::to_string) else {
        return;
    };
    let attrs = claim
        .spec
        .block_device_node_attributes
        .get_or_insert_with(Default::default);
    if attrs.node_name.is_none() {
        attrs.node_name = Some(host);
    }
}

#[async_trait]
impl UpgradeTask for NodeNameUpgrade {
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

            migrate_device(&mut device);
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
