//! `BlockDeviceClaim` custom resource.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::ClaimPhase;

/// Finalizer that keeps a bound claim around until its device is released.
pub const CLAIM_FINALIZER: &str = "blockdeviceclaim.finalizer";

/// A request for a block device with given placement and size.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "openebs.io",
    version = "v1alpha1",
    kind = "BlockDeviceClaim",
    namespaced,
    shortname = "bdc",
    status = "BlockDeviceClaimStatus",
    printcolumn = r#"{"name":"BLOCKDEVICENAME","type":"string","jsonPath":".spec.blockDeviceName"}"#,
    printcolumn = r#"{"name":"PHASE","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"AGE","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BlockDeviceClaimSpec {
    /// Deprecated since 0.4.1: moved to `blockDeviceNodeAttributes.hostName`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_name: Option<String>,

    /// Node the claimed device must live on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_device_node_attributes: Option<ClaimNodeAttributes>,

    #[serde(default)]
    pub resources: ClaimResources,

    /// Device bound to this claim, or requested explicitly by the user.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_device_name: Option<String>,
}

/// Placement constraints of a claim.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClaimNodeAttributes {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_name: Option<String>,

    /// Introduced in 0.4.2.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClaimResources {
    #[serde(default)]
    pub requests: ClaimRequests,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClaimRequests {
    /// Minimum capacity in bytes.
    #[serde(default)]
    pub storage: u64,
}

/// Observed state of a claim.
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BlockDeviceClaimStatus {
    #[serde(default)]
    pub phase: ClaimPhase,
}

impl BlockDeviceClaim {
    pub fn phase(&self) -> ClaimPhase {
        self.status
            .as_ref()
            .map(|s| s.phase.clone())
            .unwrap_or_default()
    }

    /// Host the claim is pinned to, looking at the legacy field last.
    pub fn requested_host(&self) -> Option<&str> {
        self.spec
            .block_device_node_attributes
            .as_ref()
            .and_then(|a| a.host_name.as_deref())
            .or(self.spec.host_name.as_deref())
    }

    pub fn has_finalizer(&self) -> bool {
        self.metadata
            .finalizers
            .as_ref()
            .is_some_and(|f| f.iter().any(|s| s == CLAIM_FINALIZER))
    }

    pub fn add_finalizer(&mut self) {
        if !self.has_finalizer() {
            self.metadata
                .finalizers
                .get_or_insert_with(Vec::new)
                .push(CLAIM_FINALIZER.to_string());
        }
    }

    pub fn remove_finalizer(&mut self) {
        if let Some(finalizers) = self.metadata.finalizers.as_mut() {
            finalizers.retain(|f| f != CLAIM_FINALIZER);
        }
    }
}
