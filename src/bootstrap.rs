//! Startup sequencing.
//!
//! Nothing touches the cluster before this process holds leadership, the CRDs
//! are installed before any resource is migrated, and controllers only start
//! once the whole upgrade chain has succeeded. Every failure carries the
//! [`Stage`] it happened in so `main` can log it and exit non-zero.

use std::fmt;
use std::future::Future;
use std::time::Instant;

use anyhow::anyhow;
use async_trait::async_trait;
use thiserror::Error;
use tracing::{Instrument, debug, error, info};

use crate::error::NdmError;
use crate::health::HealthState;
use crate::install::Installer;
use crate::leader::{Elector, Leadership};
use crate::logging::stage_span;
use crate::metrics::Metrics;
use crate::ready::{ReadyGuard, ReadyMarker};
use crate::store::ResourceStore;
use crate::upgrade::{TaskFailed, UpgradeChain};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Configuration,
    ClusterConfig,
    Leadership,
    Readiness,
    Install,
    Upgrade,
    Controllers,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Configuration => "configuration",
            Self::ClusterConfig => "cluster-config",
            Self::Leadership => "leadership",
            Self::Readiness => "readiness",
            Self::Install => "install",
            Self::Upgrade => "upgrade",
            Self::Controllers => "controllers",
        };
        write!(f, "{s}")
    }
}

/// A fatal startup failure.
#[derive(Error, Debug)]
#[error("{stage} stage failed: {cause:#}")]
pub struct BootstrapError {
    pub stage: Stage,
    pub cause: anyhow::Error,
}

impl BootstrapError {
    pub fn new(stage: Stage, cause: impl Into<anyhow::Error>) -> Self {
        Self {
            stage,
            cause: cause.into(),
        }
    }

    fn at(stage: Stage) -> impl FnOnce(anyhow::Error) -> Self {
        move |cause| Self { stage, cause }
    }
}

/// Runs the reconciliation controllers until they exit.
#[async_trait]
pub trait Manager: Send + Sync {
    async fn start(&self) -> anyhow::Result<()>;
}

/// How a bootstrap run ended without error.
#[derive(Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Shutdown was requested before controllers started.
    Interrupted,
    /// Controllers ran and then stopped, either on their own or on shutdown.
    Stopped,
}

struct Prepared {
    leadership: Leadership,
    ready: ReadyGuard,
}

/// Collaborators for one startup sequence.
pub struct Bootstrap<'a> {
    pub elector: &'a dyn Elector,
    pub ready: &'a dyn ReadyMarker,
    pub installer: &'a dyn Installer,
    pub store: &'a dyn ResourceStore,
    pub metrics: Option<&'a Metrics>,
    pub health: Option<&'a HealthState>,
}

impl Bootstrap<'_> {
    fn enter(&self, stage: Stage) {
        debug!(stage = %stage, "Entering startup stage");
        if let Some(health) = self.health {
            health.set_stage(stage);
        }
    }

    async fn prepare(&self, chain: &UpgradeChain) -> Result<Prepared, BootstrapError> {
        self.enter(Stage::Leadership);
        let leadership = self
            .elector
            .become_leader()
            .instrument(stage_span(Stage::Leadership))
            .await
            .map_err(BootstrapError::at(Stage::Leadership))?;

        self.enter(Stage::Readiness);
        let ready = self
            .ready
            .set()
            .map_err(BootstrapError::at(Stage::Readiness))?;

        tokio::select! {
            res = self.install_and_upgrade(chain, &leadership) => res?,
            () = leadership.lost() => {
                error!(lock = %leadership.lock_name(), "Leadership lost during startup");
                return Err(BootstrapError::new(
                    Stage::Leadership,
                    anyhow!("leadership lost before controllers started"),
                ));
            }
        }

        Ok(Prepared { leadership, ready })
    }

    /// Cluster writes that must only happen while `leadership` holds.
    async fn install_and_upgrade(
        &self,
        chain: &UpgradeChain,
        leadership: &Leadership,
    ) -> Result<(), BootstrapError> {
        self.enter(Stage::Install);
        self.installer
            .install()
            .instrument(stage_span(Stage::Install))
            .await
            .map_err(BootstrapError::at(Stage::Install))?;

        self.enter(Stage::Upgrade);
        let started = Instant::now();
        let still_leader = || leadership.is_leader();
        match chain
            .run(self.store, &still_leader)
            .instrument(stage_span(Stage::Upgrade))
            .await
        {
            Ok(summary) => {
                if let Some(metrics) = self.metrics {
                    metrics.record_upgrade(&summary, started.elapsed().as_secs_f64());
                }
                Ok(())
            }
            Err(e) => {
                if let Some(failed) = e.downcast_ref::<TaskFailed>().cloned() {
                    if let Some(metrics) = self.metrics {
                        metrics.record_upgrade_failure(&failed, started.elapsed().as_secs_f64());
                    }
                    return Err(BootstrapError::new(Stage::Upgrade, e));
                }
                if matches!(e.downcast_ref::<NdmError>(), Some(NdmError::LeadershipLost(_))) {
                    error!(lock = %leadership.lock_name(), "Leadership lost during upgrade");
                    return Err(BootstrapError::new(Stage::Leadership, e));
                }
                Err(BootstrapError::new(Stage::Upgrade, e))
            }
        }
    }

    /// Prepare the cluster, then run `manager` until it exits, leadership is
    /// lost, or `shutdown` resolves.
    ///
    /// A shutdown while preparing abandons whatever step is in flight. The
    /// ready marker and leadership are released on every path.
    pub async fn run(
        self,
        chain: &UpgradeChain,
        manager: &dyn Manager,
        shutdown: impl Future<Output = ()>,
    ) -> Result<Outcome, BootstrapError> {
        tokio::pin!(shutdown);

        let Prepared { leadership, ready } = tokio::select! {
            prepared = self.prepare(chain) => prepared?,
            () = &mut shutdown => {
                info!("Shutdown requested before controllers started");
                return Ok(Outcome::Interrupted);
            }
        };

        if !leadership.is_leader() {
            drop(ready);
            return Err(BootstrapError::new(
                Stage::Leadership,
                anyhow!("leadership lost before controllers started"),
            ));
        }

        self.enter(Stage::Controllers);
        info!(
            holder = %leadership.holder_id(),
            lock = %leadership.lock_name(),
            "Starting controllers"
        );
        let result = tokio::select! {
            res = manager.start().instrument(stage_span(Stage::Controllers)) => res
                .map(|()| Outcome::Stopped)
                .map_err(BootstrapError::at(Stage::Controllers)),
            () = leadership.lost() => {
                error!(lock = %leadership.lock_name(), "Leadership lost while controllers were running");
                Err(BootstrapError::new(Stage::Leadership, anyhow!("leadership lost")))
            }
            () = &mut shutdown => {
                info!("Shutdown signal received, stopping controllers");
                Ok(Outcome::Stopped)
            }
        };

        drop(ready);
        leadership.release().await;
        result
    }
}
