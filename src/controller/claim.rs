//! `BlockDeviceClaim` controller: binds pending claims to devices and releases
//! devices when a bound claim is deleted.

use std::sync::Arc;
use std::time::Duration;

use kube::api::{ListParams, PostParams};
use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use tracing::{debug, error, info, warn};

use super::Context;
use crate::crd::{
    BlockDevice, BlockDeviceClaim, BlockDeviceClaimStatus, BlockDeviceStatus, ClaimPhase,
    ClaimState,
};
use crate::error::NdmError;
use crate::status::{self, EventRecorder};
use crate::version::{Version, set_version};

const CONTROLLER: &str = "blockdeviceclaim";

/// Reconcile a single claim.
pub async fn reconcile(claim: Arc<BlockDeviceClaim>, ctx: Arc<Context>) -> Result<Action, NdmError> {
    let recorder = EventRecorder::new(ctx.client.clone(), &*claim);

    let action = if claim.metadata.deletion_timestamp.is_some() {
        release(&claim, &ctx, &recorder).await?
    } else if claim.phase() == ClaimPhase::Bound {
        Action::requeue(ctx.sync_period)
    } else {
        bind(&claim, &ctx, &recorder).await?
    };

    ctx.metrics.record_reconcile(CONTROLLER, "success");
    Ok(action)
}

pub fn error_policy(claim: Arc<BlockDeviceClaim>, err: &NdmError, ctx: Arc<Context>) -> Action {
    ctx.metrics.record_reconcile(CONTROLLER, "error");
    if err.is_transient() {
        warn!(claim = %claim.name_any(), error = %err, "Transient error, will retry");
        Action::requeue(ctx.sync_period)
    } else {
        error!(claim = %claim.name_any(), error = %err, "Reconcile failed");
        Action::requeue(Duration::from_secs(30))
    }
}

async fn bind(
    claim: &BlockDeviceClaim,
    ctx: &Context,
    recorder: &EventRecorder,
) -> Result<Action, NdmError> {
    let name = claim.name_any();
    let devices = ctx.devices();
    let list = devices
        .list(&ListParams::default())
        .await
        .map_err(|e| NdmError::from_kube("BlockDevice", "*", &e))?;

    let Some(device) = select_device(claim, &list.items) else {
        debug!(claim = %name, "No matching unclaimed block device");
        return Ok(Action::requeue(ctx.sync_period));
    };
    let device_name = device.name_any();

    if !is_claimed_by(device, &name) {
        let (spec_update, status_update) = claim_device(device, claim, &ctx.version);
        devices
            .replace(&device_name, &PostParams::default(), &spec_update)
            .await
            .map_err(|e| NdmError::from_kube("BlockDevice", &device_name, &e))?;
        status::patch_status(&devices, &device_name, &status_update)
            .await
            .map_err(|e| NdmError::from_kube("BlockDevice", &device_name, &e))?;
    }

    let claims = ctx.claims();
    claims
        .replace(
            &name,
            &PostParams::default(),
            &bound_claim(claim, &device_name, &ctx.version),
        )
        .await
        .map_err(|e| NdmError::from_kube("BlockDeviceClaim", &name, &e))?;
    status::patch_status(
        &claims,
        &name,
        &BlockDeviceClaimStatus {
            phase: ClaimPhase::Bound,
        },
    )
    .await
    .map_err(|e| NdmError::from_kube("BlockDeviceClaim", &name, &e))?;

    info!(claim = %name, device = %device_name, "Claim bound");
    recorder
        .publish("Bound", &format!("Bound to block device {device_name}"))
        .await;
    Ok(Action::requeue(ctx.sync_period))
}

async fn release(
    claim: &BlockDeviceClaim,
    ctx: &Context,
    recorder: &EventRecorder,
) -> Result<Action, NdmError> {
    if !claim.has_finalizer() {
        return Ok(Action::await_change());
    }
    let name = claim.name_any();

    if let Some(device_name) = claim.spec.block_device_name.as_deref() {
        let devices = ctx.devices();
        let device = devices
            .get_opt(device_name)
            .await
            .map_err(|e| NdmError::from_kube("BlockDevice", device_name, &e))?;
        match device {
            Some(device) if is_claimed_by(&device, &name) => {
                let (spec_update, status_update) = release_device(&device, &ctx.version);
                devices
                    .replace(device_name, &PostParams::default(), &spec_update)
                    .await
                    .map_err(|e| NdmError::from_kube("BlockDevice", device_name, &e))?;
                status::patch_status(&devices, device_name, &status_update)
                    .await
                    .map_err(|e| NdmError::from_kube("BlockDevice", device_name, &e))?;
                info!(claim = %name, device = %device_name, "Released block device");
                recorder
                    .publish("Released", &format!("Released block device {device_name}"))
                    .await;
            }
            _ => debug!(claim = %name, device = %device_name, "Device not bound to claim"),
        }
    }

    let mut updated = claim.clone();
    updated.remove_finalizer();
    set_version(&mut updated.metadata, &ctx.version);
    ctx.claims()
        .replace(&name, &PostParams::default(), &updated)
        .await
        .map_err(|e| NdmError::from_kube("BlockDeviceClaim", &name, &e))?;
    Ok(Action::await_change())
}

fn is_claimed_by(device: &BlockDevice, claim_name: &str) -> bool {
    device
        .spec
        .claim_ref
        .as_ref()
        .and_then(|r| r.name.as_deref())
        == Some(claim_name)
}

fn is_available(device: &BlockDevice) -> bool {
    device.claim_state() == ClaimState::Unclaimed
        && device.is_active()
        && device.spec.claim_ref.is_none()
        && device.metadata.deletion_timestamp.is_none()
}

fn fits(claim: &BlockDeviceClaim, device: &BlockDevice) -> bool {
    let attrs = &device.spec.node_attributes;
    let host_ok = claim
        .requested_host()
        .is_none_or(|host| attrs.host_name == host);
    let node_ok = claim
        .spec
        .block_device_node_attributes
        .as_ref()
        .and_then(|a| a.node_name.as_deref())
        .is_none_or(|node| attrs.node_name.as_deref() == Some(node));
    host_ok && node_ok && device.spec.capacity.storage >= claim.spec.resources.requests.storage
}

/// Pick the device for a pending claim.
///
/// A device already pointing at the claim wins, so a bind interrupted between
/// the device and claim writes resumes on the same device. An explicitly
/// named device is used only if it is available. Otherwise the smallest
/// available device that satisfies placement and capacity is chosen.
pub fn select_device<'a>(
    claim: &BlockDeviceClaim,
    devices: &'a [BlockDevice],
) -> Option<&'a BlockDevice> {
    let claim_name = claim.metadata.name.as_deref()?;
    if let Some(device) = devices.iter().find(|d| is_claimed_by(d, claim_name)) {
        return Some(device);
    }

    if let Some(wanted) = claim.spec.block_device_name.as_deref() {
        return devices
            .iter()
            .find(|d| d.metadata.name.as_deref() == Some(wanted) && is_available(d));
    }

    devices
        .iter()
        .filter(|d| is_available(d) && fits(claim, d))
        .min_by(|a, b| {
            a.spec
                .capacity
                .storage
                .cmp(&b.spec.capacity.storage)
                .then_with(|| a.metadata.name.cmp(&b.metadata.name))
        })
}

fn claim_device(
    device: &BlockDevice,
    claim: &BlockDeviceClaim,
    version: &Version,
) -> (BlockDevice, BlockDeviceStatus) {
    let mut updated = device.clone();
    updated.spec.claim_ref = Some(claim.object_ref(&()));
    set_version(&mut updated.metadata, version);
    let mut status = device.status.clone().unwrap_or_default();
    status.claim_state = ClaimState::Claimed;
    (updated, status)
}

fn release_device(device: &BlockDevice, version: &Version) -> (BlockDevice, BlockDeviceStatus) {
    let mut updated = device.clone();
    updated.spec.claim_ref = None;
    set_version(&mut updated.metadata, version);
    let mut status = device.status.clone().unwrap_or_default();
    status.claim_state = ClaimState::Released;
    (updated, status)
}

fn bound_claim(
    claim: &BlockDeviceClaim,
    device_name: &str,
    version: &Version,
) -> BlockDeviceClaim {
    let mut updated = claim.clone();
    updated.add_finalizer();
    set_version(&mut updated.metadata, version);
    updated.spec.block_device_name = Some(device_name.to_string());
    updated
}
