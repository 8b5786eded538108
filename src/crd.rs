//! NDM custom resource definitions (`openebs.io/v1alpha1`).

pub mod block_device;
pub mod claim;
pub mod types;

pub use block_device::{BlockDevice, BlockDeviceStatus, HOSTNAME_LABEL};
pub use claim::{BlockDeviceClaim, BlockDeviceClaimStatus};
pub use types::{ClaimPhase, ClaimState};
