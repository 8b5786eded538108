//! ndm-operator - Node Disk Manager operator.
//!
//! Acquires leadership, installs the `BlockDevice` and `BlockDeviceClaim`
//! CRDs, migrates stored resources to the current schema version, and only
//! then starts the claim and device controllers.

mod bootstrap;
mod config;
mod controller;
mod crd;
mod error;
mod health;
mod install;
mod leader;
mod logging;
mod metrics;
mod ready;
mod status;
mod store;
mod upgrade;
mod version;

use std::sync::Arc;

use tokio::signal;
use tracing::{error, info};

use bootstrap::{Bootstrap, BootstrapError, Outcome, Stage};
use config::Config;
use controller::{Context, Controllers};
use error::NdmError;
use install::CrdInstaller;
use leader::LeaseElector;
use ready::ReadyFile;
use store::KubeStore;
use upgrade::UpgradeChain;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const COMMIT: &str = env!("BUILD_COMMIT");
pub const BUILD_DATE: &str = env!("BUILD_DATE");

#[tokio::main]
async fn main() {
    let config = Config::from_args();
    logging::init(config.log_format, &config.log_level);

    info!(
        version = VERSION,
        commit = COMMIT,
        build_date = BUILD_DATE,
        "Starting ndm-operator"
    );
    config.display();

    match run(&config).await {
        Ok(Outcome::Interrupted) => info!("Interrupted before controllers started"),
        Ok(Outcome::Stopped) => info!("Shutdown complete"),
        Err(e) => {
            error!(stage = %e.stage, error = %format!("{:#}", e.cause), "Operator failed");
            std::process::exit(1);
        }
    }
}

async fn run(config: &Config) -> Result<Outcome, BootstrapError> {
    let namespace = config
        .watch_namespace()
        .map_err(|e| BootstrapError::new(Stage::Configuration, e))?
        .to_string();
    let election = config
        .leader_election(&namespace)
        .map_err(|e| BootstrapError::new(Stage::Configuration, e))?;
    let chain = UpgradeChain::release().map_err(|e| BootstrapError::new(Stage::Configuration, e))?;
    let version = chain
        .target_version()
        .cloned()
        .ok_or_else(|| {
            BootstrapError::new(
                Stage::Configuration,
                NdmError::InvalidChain("release chain has no tasks".to_string()),
            )
        })?;
    info!(tasks = chain.len(), target = %version, "Upgrade chain configured");

    let client = kube::Client::try_default()
        .await
        .map_err(|e| BootstrapError::new(Stage::ClusterConfig, e))?;
    info!(namespace = %namespace, "Connected to Kubernetes API server");

    let mut registry = prometheus_client::registry::Registry::default();
    let metrics = Arc::new(metrics::Metrics::new(&mut registry));
    let registry = Arc::new(registry);

    let health_state = health::HealthState::new();
    let health_port = config.health_port;
    let health_state_clone = health_state.clone();
    tokio::spawn(async move {
        if let Err(e) = health::serve(health_port, health_state_clone).await {
            error!(error = %e, "Health server failed");
        }
    });

    let metrics_port = config.metrics_port;
    tokio::spawn(async move {
        if let Err(e) = metrics::serve(metrics_port, registry).await {
            error!(error = %e, "Metrics server failed");
        }
    });

    let elector = LeaseElector::new(client.clone(), election);
    let ready = ReadyFile::new(&config.ready_file, health_state.clone());
    let installer = CrdInstaller::new(client.clone(), config.install_timeout());
    let store = KubeStore::new(client.clone(), &namespace);
    let controllers = Controllers::new(Arc::new(Context {
        client,
        namespace,
        sync_period: config.sync_period(),
        metrics: Arc::clone(&metrics),
        version,
    }));

    Bootstrap {
        elector: &elector,
        ready: &ready,
        installer: &installer,
        store: &store,
        metrics: Some(metrics.as_ref()),
        health: Some(&health_state),
    }
    .run(&chain, &controllers, shutdown_signal())
    .await
}

/// Wait for SIGTERM or SIGINT.
///
/// If a handler cannot be installed that signal is never delivered and the
/// other one still works.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    info!("Received shutdown signal");
}
