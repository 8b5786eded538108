//! `BlockDevice` controller: returns released devices to the unclaimed pool.

use std::sync::Arc;
use std::time::Duration;

use kube::ResourceExt;
use kube::api::PostParams;
use kube::runtime::controller::Action;
use tracing::{error, info, warn};

use super::Context;
use crate::crd::{BlockDevice, BlockDeviceStatus, ClaimState};
use crate::error::NdmError;
use crate::status::{self, EventRecorder};
use crate::version::{Version, set_version};

const CONTROLLER: &str = "blockdevice";

pub async fn reconcile(device: Arc<BlockDevice>, ctx: Arc<Context>) -> Result<Action, NdmError> {
    if let Some((spec_update, status_update)) = reclaim(&device, &ctx.version) {
        let name = device.name_any();
        let devices = ctx.devices();

        devices
            .replace(&name, &PostParams::default(), &spec_update)
            .await
            .map_err(|e| NdmError::from_kube("BlockDevice", &name, &e))?;
        status::patch_status(&devices, &name, &status_update)
            .await
            .map_err(|e| NdmError::from_kube("BlockDevice", &name, &e))?;

        info!(device = %name, "Released device returned to unclaimed pool");
        EventRecorder::new(ctx.client.clone(), &*device)
            .publish("Unclaimed", "Released block device is available again")
            .await;
    }

    ctx.metrics.record_reconcile(CONTROLLER, "success");
    Ok(Action::requeue(ctx.sync_period))
}

pub fn error_policy(device: Arc<BlockDevice>, err: &NdmError, ctx: Arc<Context>) -> Action {
    ctx.metrics.record_reconcile(CONTROLLER, "error");
    if err.is_transient() {
        warn!(device = %device.name_any(), error = %err, "Transient error, will retry");
        Action::requeue(ctx.sync_period)
    } else {
        error!(device = %device.name_any(), error = %err, "Reconcile failed");
        Action::requeue(Duration::from_secs(30))
    }
}

/// Updated object and status for a `Released` device, or `None` if the device
/// needs nothing.
fn reclaim(device: &BlockDevice, version: &Version) -> Option<(BlockDevice, BlockDeviceStatus)> {
    if device.claim_state() != ClaimState::Released || device.metadata.deletion_timestamp.is_some()
    {
        return None;
    }
    let mut updated = device.clone();
    updated.spec.claim_ref = None;
    set_version(&mut updated.metadata, version);
    let mut status = device.status.clone().unwrap_or_default();
    status.claim_state = ClaimState::Unclaimed;
    Some((updated, status))
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::ObjectReference;

    use super::*;
    use crate::crd::block_device::BlockDeviceSpec;
    use crate::crd::types::DeviceState;
    use crate::version::version_of;

    const CURRENT: Version = Version::new(0, 4, 2);

    fn device(claim_state: ClaimState) -> BlockDevice {
        let mut bd = BlockDevice::new("bd-1", BlockDeviceSpec::default());
        bd.spec.claim_ref = Some(ObjectReference {
            name: Some("bdc-1".to_string()),
            ..Default::default()
        });
        bd.status = Some(BlockDeviceStatus {
            claim_state,
            state: DeviceState::Inactive,
        });
        bd
    }

    #[test]
    fn test_reclaim_released_device() {
        let (updated, status) = reclaim(&device(ClaimState::Released), &CURRENT).unwrap();
        assert!(updated.spec.claim_ref.is_none());
        assert_eq!(version_of(&updated.metadata).unwrap(), CURRENT);
        assert_eq!(status.claim_state, ClaimState::Unclaimed);
        assert_eq!(status.state, DeviceState::Inactive);
    }

    #[test]
    fn test_reclaim_ignores_other_states() {
        assert!(reclaim(&device(ClaimState::Claimed), &CURRENT).is_none());
        assert!(reclaim(&device(ClaimState::Unclaimed), &CURRENT).is_none());
    }
}
