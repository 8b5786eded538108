//! Custom error types for ndm-operator.

use thiserror::Error;

/// Errors raised by the operator and its upgrade tasks.
#[derive(Error, Debug)]
pub enum NdmError {
    #[error("Invalid version format: {0}")]
    InvalidVersion(String),

    #[error("Invalid upgrade chain: {0}")]
    InvalidChain(String),

    #[error("Write conflict on {kind} {name}: resource was modified concurrently")]
    Conflict { kind: String, name: String },

    #[error("Kubernetes API error: {0}")]
    KubernetesApi(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Installation failed: {0}")]
    Install(String),

    #[error("Leadership lost: {0}")]
    LeadershipLost(String),
}

impl NdmError {
    /// Map a `kube::Error` from a write on the given object.
    ///
    /// HTTP 409 becomes [`NdmError::Conflict`] so callers can tell an
    /// optimistic-concurrency loss apart from other API failures.
    pub fn from_kube(kind: &str, name: &str, err: &kube::Error) -> Self {
        match err {
            kube::Error::Api(status) if status.code == 409 => Self::Conflict {
                kind: kind.to_string(),
                name: name.to_string(),
            },
            other => Self::KubernetesApi(format!("{kind} {name}: {other}")),
        }
    }

    /// Returns true if this error is transient and a controller should retry.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Conflict { .. } | Self::KubernetesApi(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_invalid_version() {
        let err = NdmError::InvalidVersion("abc".to_string());
        assert_eq!(err.to_string(), "Invalid version format: abc");
    }

    #[test]
    fn test_error_display_conflict() {
        let err = NdmError::Conflict {
            kind: "BlockDeviceClaim".to_string(),
            name: "claim-1".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Write conflict on BlockDeviceClaim claim-1: resource was modified concurrently"
        );
    }

    #[test]
    fn test_error_display_invalid_chain() {
        let err = NdmError::InvalidChain("gap between 0.4.1 and 0.4.3".to_string());
        assert_eq!(
            err.to_string(),
            "Invalid upgrade chain: gap between 0.4.1 and 0.4.3"
        );
    }

    #[test]
    fn test_error_display_configuration() {
        let err = NdmError::Configuration("WATCH_NAMESPACE must be set".to_string());
        assert_eq!(
            err.to_string(),
            "Configuration error: WATCH_NAMESPACE must be set"
        );
    }

    fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(
            kube::core::Status::failure("request failed", reason)
                .with_code(code)
                .boxed(),
        )
    }

    #[test]
    fn test_from_kube_maps_409_to_conflict() {
        let err = NdmError::from_kube("BlockDeviceClaim", "claim-a", &api_error(409, "Conflict"));
        assert!(matches!(
            &err,
            NdmError::Conflict { kind, name } if kind == "BlockDeviceClaim" && name == "claim-a"
        ));
        assert!(err.is_transient());
    }

    #[test]
    fn test_from_kube_keeps_other_codes_as_api_errors() {
        let err = NdmError::from_kube("BlockDevice", "bd-1", &api_error(500, "InternalError"));
        match err {
            NdmError::KubernetesApi(msg) => assert!(msg.starts_with("BlockDevice bd-1: ")),
            other => panic!("expected KubernetesApi, got {other:?}"),
        }
    }

    #[test]
    fn test_is_transient() {
        assert!(
            NdmError::Conflict {
                kind: "x".into(),
                name: "y".into()
            }
            .is_transient()
        );
        assert!(NdmError::KubernetesApi("z".into()).is_transient());
        assert!(!NdmError::InvalidVersion("x".into()).is_transient());
        assert!(!NdmError::Install("x".into()).is_transient());
        assert!(!NdmError::LeadershipLost("x".into()).is_transient());
    }
}
