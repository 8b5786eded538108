//! Enum types shared by the NDM custom resources.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Whether a block device is bound to a claim.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum ClaimState {
    #[default]
    Unclaimed,
    Claimed,
    Released,
}

/// Whether the device was seen on its node by the last discovery.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum DeviceState {
    #[default]
    Active,
    Inactive,
    Unknown,
}

/// Lifecycle phase of a block device claim.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum ClaimPhase {
    #[default]
    Pending,
    Bound,
}

impl std::fmt::Display for ClaimState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unclaimed => write!(f, "Unclaimed"),
            Self::Claimed => write!(f, "Claimed"),
            Self::Released => write!(f, "Released"),
        }
    }
}

impl std::fmt::Display for ClaimPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Bound => write!(f, "Bound"),
        }
    }
}
