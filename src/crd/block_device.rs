//! `BlockDevice` custom resource.

use k8s_openapi::api::core::v1::ObjectReference;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{ClaimState, DeviceState};

/// Node label carrying the kubelet host name.
pub const HOSTNAME_LABEL: &str = "kubernetes.io/hostname";

/// A block device discovered on a node.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "openebs.io",
    version = "v1alpha1",
    kind = "BlockDevice",
    namespaced,
    shortname = "bd",
    status = "BlockDeviceStatus",
    printcolumn = r#"{"name":"NODE","type":"string","jsonPath":".spec.nodeAttributes.nodeName"}"#,
    printcolumn = r#"{"name":"SIZE","type":"integer","jsonPath":".spec.capacity.storage"}"#,
    printcolumn = r#"{"name":"CLAIMSTATE","type":"string","jsonPath":".status.claimState"}"#,
    printcolumn = r#"{"name":"STATUS","type":"string","jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"AGE","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BlockDeviceSpec {
    /// Node the device is attached to.
    #[serde(default)]
    pub node_attributes: NodeAttributes,

    /// Device path on the node (e.g., `/dev/sdb`).
    #[serde(default)]
    pub path: String,

    #[serde(default)]
    pub capacity: DeviceCapacity,

    /// Claim this device is bound to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claim_ref: Option<ObjectReference>,
}

/// Node placement of a block device.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeAttributes {
    #[serde(default)]
    pub host_name: String,

    /// Kubernetes node name. Introduced in 0.4.2.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
}

/// Size of a block device.
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeviceCapacity {
    /// Capacity in bytes.
    #[serde(default)]
    pub storage: u64,
}

/// Observed state of a block device.
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BlockDeviceStatus {
    #[serde(default)]
    pub claim_state: ClaimState,

    #[serde(default)]
    pub state: DeviceState,
}

impl BlockDevice {
    pub fn claim_state(&self) -> ClaimState {
        self.status
            .as_ref()
            .map(|s| s.claim_state.clone())
            .unwrap_or_default()
    }

    pub fn is_active(&self) -> bool {
        self.status
            .as_ref()
            .is_none_or(|s| s.state == DeviceState::Active)
    }
}
