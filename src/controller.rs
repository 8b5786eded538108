//! Reconciliation controllers for `BlockDeviceClaim` and `BlockDevice`.
//!
//! Both controllers are started only after the startup upgrade succeeded, so
//! they can assume every resource they see is at the current schema version.
//! Every object they write is stamped with that version, so a later restart
//! does not mistake it for an unlabelled legacy resource.

pub mod claim;
pub mod device;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use futures::{FutureExt, StreamExt};
use kube::runtime::Controller;
use kube::runtime::watcher::Config;
use kube::{Api, Client};
use tracing::{debug, info, warn};

use crate::bootstrap::Manager;
use crate::crd::{BlockDevice, BlockDeviceClaim};
use crate::metrics::Metrics;
use crate::version::Version;

/// Shared context for both controllers.
pub struct Context {
    pub client: Client,
    pub namespace: String,
    /// Requeue interval for healthy objects.
    pub sync_period: Duration,
    pub metrics: Arc<Metrics>,
    /// Schema version stamped on every object the controllers write.
    pub version: Version,
}

impl Context {
    pub fn claims(&self) -> Api<BlockDeviceClaim> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    pub fn devices(&self) -> Api<BlockDevice> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }
}

/// Runs the claim and device controllers side by side.
pub struct Controllers {
    ctx: Arc<Context>,
}

impl Controllers {
    pub const fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Manager for Controllers {
    async fn start(&self) -> Result<()> {
        info!(
            namespace = %self.ctx.namespace,
            sync_period_secs = self.ctx.sync_period.as_secs(),
            "Starting BlockDeviceClaim and BlockDevice controllers"
        );

        let claims = Controller::new(self.ctx.claims(), Config::default())
            .run(claim::reconcile, claim::error_policy, Arc::clone(&self.ctx))
            .for_each(|res| async move {
                match res {
                    Ok((obj, _)) => debug!(claim = %obj.name, "Reconciled"),
                    Err(e) => warn!(error = %e, "BlockDeviceClaim reconcile failed"),
                }
            }).boxed();

        let devices = Controller::new(self.ctx.devices(), Config::default())
            .run(device::reconcile, device::error_policy, Arc::clone(&self.ctx))
            .for_each(|res| async move {
                match res {
                    Ok((obj, _)) => debug!(device = %obj.name, "Reconciled"),
                    Err(e) => warn!(error = %e, "BlockDevice reconcile failed"),
                }
            }).boxed();

        futures::join!(claims, devices);
        info!("Controllers stopped");
        Ok(())
    }
}
