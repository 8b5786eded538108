use std::time::Duration;

use clap::Parser;

use crate::error::NdmError;
use crate::leader::LeaderElectionConfig;
use crate::logging::LogFormat;
use crate::ready::DEFAULT_READY_FILE;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "ndm-operator",
    version,
    about = "Node disk manager operator with startup upgrade of stored resources"
)]
pub struct Config {
    /// Namespace the operator watches and keeps its resources in
    #[arg(long, env = "WATCH_NAMESPACE")]
    pub watch_namespace: Option<String>,

    /// Pod name used as leader election identity (defaults to the host name)
    #[arg(long, env = "POD_NAME")]
    pub pod_name: Option<String>,

    /// Name of the leader election lease
    #[arg(long, env = "LEADER_LOCK_NAME", default_value = "node-disk-manager-lock")]
    pub lock_name: String,

    /// Lease duration in seconds
    #[arg(long, env = "LEASE_DURATION_SECONDS", default_value = "15")]
    pub lease_duration_seconds: u32,

    /// Lease renew interval in seconds
    #[arg(long, env = "LEASE_RENEW_SECONDS", default_value = "5")]
    pub lease_renew_seconds: u64,

    /// Ready file created once the operator holds leadership
    #[arg(long, env = "READY_FILE", default_value = DEFAULT_READY_FILE)]
    pub ready_file: String,

    /// Controller resync period in seconds
    #[arg(long, env = "SYNC_PERIOD_SECONDS", default_value = "5")]
    pub sync_period_seconds: u64,

    /// Timeout for CRDs to become established, in seconds
    #[arg(long, env = "INSTALL_TIMEOUT_SECONDS", default_value = "60")]
    pub install_timeout_seconds: u64,

    /// Health server port
    #[arg(long, env = "HEALTH_PORT", default_value = "8080")]
    pub health_port: u16,

    /// Metrics server port
    #[arg(long, env = "METRICS_PORT", default_value = "8081")]
    pub metrics_port: u16,

    /// Log format: json or pretty
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Json)]
    pub log_format: LogFormat,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Config {
    pub fn from_args() -> Self {
        Self::parse()
    }

    /// The watch namespace, which must be set and non-empty.
    pub fn watch_namespace(&self) -> Result<&str, NdmError> {
        self.watch_namespace
            .as_deref()
            .map(str::trim)
            .filter(|ns| !ns.is_empty())
            .ok_or_else(|| {
                NdmError::Configuration("WATCH_NAMESPACE must be set to a namespace".to_string())
            })
    }

    /// Leader election identity: the pod name, else the host name.
    pub fn holder_id(&self) -> Result<String, NdmError> {
        if let Some(name) = self.pod_name.as_deref().filter(|n| !n.is_empty()) {
            return Ok(name.to_string());
        }
        hostname::get()
            .map_err(|e| NdmError::Configuration(format!("cannot determine host name: {e}")))?
            .into_string()
            .map_err(|_| NdmError::Configuration("host name is not valid UTF-8".to_string()))
    }

    pub fn sync_period(&self) -> Duration {
        Duration::from_secs(self.sync_period_seconds)
    }

    pub fn install_timeout(&self) -> Duration {
        Duration::from_secs(self.install_timeout_seconds)
    }

    pub fn leader_election(&self, namespace: &str) -> Result<LeaderElectionConfig, NdmError> {
        if self.lease_renew_seconds == 0
            || self.lease_renew_seconds >= u64::from(self.lease_duration_seconds)
        {
            return Err(NdmError::Configuration(format!(
                "lease renew interval ({}s) must be positive and shorter than the lease duration ({}s)",
                self.lease_renew_seconds, self.lease_duration_seconds
            )));
        }
        let lease_duration_secs = i32::try_from(self.lease_duration_seconds).map_err(|_| {
            NdmError::Configuration(format!(
                "lease duration {}s is too large",
                self.lease_duration_seconds
            ))
        })?;

        Ok(LeaderElectionConfig {
            lease_name: self.lock_name.clone(),
            namespace: namespace.to_string(),
            holder_id: self.holder_id()?,
            lease_duration_secs,
            renew_interval: Duration::from_secs(self.lease_renew_seconds),
        })
    }

    pub fn display(&self) {
        tracing::info!(
            watch_namespace = self.watch_namespace.as_deref().unwrap_or("<unset>"),
            lock_name = %self.lock_name,
            lease_duration_seconds = self.lease_duration_seconds,
            lease_renew_seconds = self.lease_renew_seconds,
            ready_file = %self.ready_file,
            sync_period_seconds = self.sync_period_seconds,
            install_timeout_seconds = self.install_timeout_seconds,
            health_port = self.health_port,
            metrics_port = self.metrics_port,
            log_format = %self.log_format,
            log_level = %self.log_level,
            "Configuration initialized"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Config {
        let mut argv = vec!["ndm-operator"];
        argv.extend_from_slice(args);
        Config::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = parse(&["--watch-namespace", "openebs"]);
        assert_eq!(config.lock_name, "node-disk-manager-lock");
        assert_eq!(config.lease_duration_seconds, 15);
        assert_eq!(config.lease_renew_seconds, 5);
        assert_eq!(config.ready_file, DEFAULT_READY_FILE);
        assert_eq!(config.sync_period(), Duration::from_secs(5));
        assert_eq!(config.install_timeout(), Duration::from_secs(60));
        assert_eq!(config.health_port, 8080);
        assert_eq!(config.metrics_port, 8081);
    }

    #[test]
    fn test_watch_namespace_required() {
        let config = parse(&["--watch-namespace", "  "]);
        let err = config.watch_namespace().unwrap_err();
        assert!(matches!(err, NdmError::Configuration(_)));

        let config = parse(&["--watch-namespace", "openebs"]);
        assert_eq!(config.watch_namespace().unwrap(), "openebs");
    }

    #[test]
    fn test_holder_id_prefers_pod_name() {
        let config = parse(&["--pod-name", "ndm-operator-7d9f"]);
        assert_eq!(config.holder_id().unwrap(), "ndm-operator-7d9f");
    }

    #[test]
    fn test_leader_election_config() {
        let config = parse(&["--pod-name", "pod-a", "--lock-name", "my-lock"]);
        let le = config.leader_election("openebs").unwrap();
        assert_eq!(le.lease_name, "my-lock");
        assert_eq!(le.namespace, "openebs");
        assert_eq!(le.holder_id, "pod-a");
        assert_eq!(le.lease_duration_secs, 15);
        assert_eq!(le.renew_interval, Duration::from_secs(5));
    }

    #[test]
    fn test_log_format_flag() {
        assert_eq!(parse(&[]).log_format, LogFormat::Json);
        assert_eq!(parse(&["--log-format", "text"]).log_format, LogFormat::Pretty);
        assert!(Config::try_parse_from(["ndm-operator", "--log-format", "yaml"]).is_err());
    }

    #[test]
    fn test_renew_interval_must_be_shorter_than_lease() {
        let config = parse(&[
            "--pod-name",
            "pod-a",
            "--lease-duration-seconds",
            "5",
            "--lease-renew-seconds",
            "5",
        ]);
        assert!(config.leader_election("openebs").is_err());
    }
}
