//! Lease-based leader election.
//!
//! Leadership is a capability: [`Elector::become_leader`] blocks until this
//! process holds the lock and hands back a [`Leadership`] that must be kept
//! alive for as long as the process writes to the cluster. Dropping it stops
//! renewal; [`Leadership::release`] also steps down so another replica can
//! take over without waiting for the lease to expire.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::Client;
use kube::api::{Api, PostParams};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Annotation storing the last renewal as unix seconds.
const ANNOTATION_RENEW_EPOCH: &str = "openebs.io/renew-epoch";

/// Configuration for Lease-based leader election.
#[derive(Clone, Debug)]
pub struct LeaderElectionConfig {
    /// Name of the Lease object (the lock name).
    pub lease_name: String,
    pub namespace: String,
    /// Unique identity of this process, typically the pod name.
    pub holder_id: String,
    /// Seconds a lease stays valid without renewal.
    pub lease_duration_secs: i32,
    pub renew_interval: Duration,
}

/// Acquires exclusive leadership for this process.
#[async_trait]
pub trait Elector: Send + Sync {
    /// Block until this process is the sole active writer.
    async fn become_leader(&self) -> Result<Leadership>;
}

/// Proof that this process currently holds the leader lock.
pub struct Leadership {
    holder_id: String,
    lock_name: String,
    lost: watch::Receiver<bool>,
    renewal: Option<JoinHandle<()>>,
    lease: Option<(Api<Lease>, LeaderElectionConfig)>,
}

impl Leadership {
    /// A grant with no lease behind it. `lost` flips to `true` to revoke it.
    pub fn granted(holder_id: &str, lock_name: &str, lost: watch::Receiver<bool>) -> Self {
        Self {
            holder_id: holder_id.to_string(),
            lock_name: lock_name.to_string(),
            lost,
            renewal: None,
            lease: None,
        }
    }

    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    pub fn lock_name(&self) -> &str {
        &self.lock_name
    }

    pub fn is_leader(&self) -> bool {
        !*self.lost.borrow()
    }

    /// Resolves once leadership has been lost. Never resolves otherwise.
    pub async fn lost(&self) {
        let mut rx = self.lost.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    /// Stop renewing and hand the lock back.
    pub async fn release(mut self) {
        if let Some(handle) = self.renewal.take() {
            handle.abort();
        }
        if let Some((api, config)) = self.lease.take() {
            step_down(&api, &config).await;
        }
        info!(holder = %self.holder_id, lock = %self.lock_name, "Released leadership");
    }
}

impl Drop for Leadership {
    fn drop(&mut self) {
        if let Some(handle) = self.renewal.take() {
            handle.abort();
        }
    }
}

/// [`Elector`] backed by a `coordination.k8s.io/v1` Lease.
pub struct LeaseElector {
    api: Api<Lease>,
    config: LeaderElectionConfig,
}

impl LeaseElector {
    pub fn new(client: Client, config: LeaderElectionConfig) -> Self {
        Self {
            api: Api::namespaced(client, &config.namespace),
            config,
        }
    }
}

#[async_trait]
impl Elector for LeaseElector {
    async fn become_leader(&self) -> Result<Leadership> {
        info!(
            holder = %self.config.holder_id,
            lease = %self.config.lease_name,
            namespace = %self.config.namespace,
            "Waiting to acquire leadership"
        );

        loop {
            match try_acquire_or_renew(&self.api, &self.config).await {
                Ok(true) => break,
                Ok(false) => debug!("Another instance is leader, waiting"),
                Err(e) => warn!(error = %e, "Failed to acquire lease, retrying"),
            }
            tokio::time::sleep(self.config.renew_interval).await;
        }
        info!(holder = %self.config.holder_id, "Acquired leadership");

        let (tx, rx) = watch::channel(false);
        let renewal = tokio::spawn(renew_loop(self.api.clone(), self.config.clone(), tx));

        Ok(Leadership {
            holder_id: self.config.holder_id.clone(),
            lock_name: self.config.lease_name.clone(),
            lost: rx,
            renewal: Some(renewal),
            lease: Some((self.api.clone(), self.config.clone())),
        })
    }
}

/// Keep the lease renewed; flip `lost` once another holder takes it or
/// renewals have failed for longer than the lease duration.
async fn renew_loop(api: Api<Lease>, config: LeaderElectionConfig, lost: watch::Sender<bool>) {
    let mut last_renewed = Utc::now().timestamp();
    loop {
        tokio::time::sleep(config.renew_interval).await;
        match try_acquire_or_renew(&api, &config).await {
            Ok(true) => last_renewed = Utc::now().timestamp(),
            Ok(false) => {
                error!(holder = %config.holder_id, "Lease taken by another instance");
                let _ = lost.send(true);
                return;
            }
            Err(e) => {
                let stale = Utc::now().timestamp() - last_renewed;
                if stale >= i64::from(config.lease_duration_secs) {
                    error!(error = %e, stale_secs = stale, "Lease renewal failed past expiry");
                    let _ = lost.send(true);
                    return;
                }
                warn!(error = %e, "Lease renewal failed, retrying");
            }
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum LeaseDecision {
    /// We hold it: refresh the renewal stamp.
    Renew,
    /// Nobody holds it or the holder stopped renewing.
    TakeOver,
    /// Another live holder.
    Held,
}

fn decide(lease: &Lease, holder_id: &str, now: i64, default_duration: i32) -> LeaseDecision {
    let spec = lease.spec.as_ref();
    let holder = spec.and_then(|s| s.holder_identity.as_deref());
    if holder == Some(holder_id) {
        return LeaseDecision::Renew;
    }
    if holder.is_none_or(str::is_empty) {
        return LeaseDecision::TakeOver;
    }

    let duration = spec
        .and_then(|s| s.lease_duration_seconds)
        .unwrap_or(default_duration);
    let renewed = lease
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(ANNOTATION_RENEW_EPOCH))
        .and_then(|s| s.parse::<i64>().ok());

    match renewed {
        Some(ts) if now <= ts + i64::from(duration) => LeaseDecision::Held,
        _ => LeaseDecision::TakeOver,
    }
}

fn stamp(lease: &mut Lease, now: i64) {
    lease
        .metadata
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(ANNOTATION_RENEW_EPOCH.to_string(), now.to_string());
}

async fn try_acquire_or_renew(api: &Api<Lease>, config: &LeaderElectionConfig) -> Result<bool> {
    let now = Utc::now().timestamp();

    match api.get(&config.lease_name).await {
        Ok(existing) => {
            let mut updated = existing.clone();
            match decide(&existing, &config.holder_id, now, config.lease_duration_secs) {
                LeaseDecision::Held => return Ok(false),
                LeaseDecision::Renew => {}
                LeaseDecision::TakeOver => {
                    let spec = updated.spec.get_or_insert_with(LeaseSpec::default);
                    spec.holder_identity = Some(config.holder_id.clone());
                    spec.lease_duration_seconds = Some(config.lease_duration_secs);
                    spec.lease_transitions = Some(spec.lease_transitions.unwrap_or(0) + 1);
                }
            }
            stamp(&mut updated, now);

            match api
                .replace(&config.lease_name, &PostParams::default(), &updated)
                .await
            {
                Ok(_) => Ok(true),
                // Someone else wrote the lease since we read it; the next
                // attempt sees who.
                Err(kube::Error::Api(e)) if e.code == 409 => {
                    Err(anyhow::anyhow!("conflict updating lease {}", config.lease_name))
                }
                Err(e) => Err(e.into()),
            }
        }
        Err(kube::Error::Api(e)) if e.code == 404 => {
            let mut lease = Lease {
                metadata: ObjectMeta {
                    name: Some(config.lease_name.clone()),
                    namespace: Some(config.namespace.clone()),
                    ..Default::default()
                },
                spec: Some(LeaseSpec {
                    holder_identity: Some(config.holder_id.clone()),
                    lease_duration_seconds: Some(config.lease_duration_secs),
                    lease_transitions: Some(0),
                    ..Default::default()
                }),
            };
            stamp(&mut lease, now);

            match api.create(&PostParams::default(), &lease).await {
                Ok(_) => Ok(true),
                Err(kube::Error::Api(e)) if e.code == 409 => {
                    debug!("Lease already created by another instance");
                    Ok(false)
                }
                Err(e) => Err(e.into()),
            }
        }
        Err(e) => Err(e.into()),
    }
}

async fn step_down(api: &Api<Lease>, config: &LeaderElectionConfig) {
    match api.get(&config.lease_name).await {
        Ok(existing) => {
            let holder = existing
                .spec
                .as_ref()
                .and_then(|s| s.holder_identity.as_deref());
            if holder != Some(config.holder_id.as_str()) {
                return;
            }
            let mut updated = existing.clone();
            if let Some(spec) = updated.spec.as_mut() {
                spec.holder_identity = None;
                spec.lease_duration_seconds = Some(1);
            }
            match api
                .replace(&config.lease_name, &PostParams::default(), &updated)
                .await
            {
                Ok(_) => debug!("Stepped down from leadership"),
                Err(e) => warn!(error = %e, "Failed to step down"),
            }
        }
        Err(e) => debug!(error = %e, "Could not read lease for step-down"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lease(holder: Option<&str>, renewed: Option<i64>) -> Lease {
        let mut lease = Lease {
            metadata: ObjectMeta::default(),
            spec: Some(LeaseSpec {
                holder_identity: holder.map(str::to_string),
                lease_duration_seconds: Some(15),
                ..Default::default()
            }),
        };
        if let Some(ts) = renewed {
            stamp(&mut lease, ts);
        }
        lease
    }

    #[test]
    fn test_decide_renews_own_lease() {
        assert_eq!(
            decide(&lease(Some("me"), Some(0)), "me", 1_000, 15),
            LeaseDecision::Renew
        );
    }

    #[test]
    fn test_decide_respects_live_holder() {
        assert_eq!(
            decide(&lease(Some("other"), Some(100)), "me", 110, 15),
            LeaseDecision::Held
        );
    }

    #[test]
    fn test_decide_takes_over_expired_lease() {
        assert_eq!(
            decide(&lease(Some("other"), Some(100)), "me", 116, 15),
            LeaseDecision::TakeOver
        );
    }

    #[test]
    fn test_decide_takes_over_unstamped_or_released_lease() {
        assert_eq!(
            decide(&lease(Some("other"), None), "me", 0, 15),
            LeaseDecision::TakeOver
        );
        assert_eq!(
            decide(&lease(None, Some(100)), "me", 100, 15),
            LeaseDecision::TakeOver
        );
    }

    #[tokio::test]
    async fn test_granted_leadership_until_revoked() {
        let (tx, rx) = watch::channel(false);
        let leadership = Leadership::granted("pod-a", "node-disk-manager-lock", rx);
        assert!(leadership.is_leader());
        assert_eq!(leadership.holder_id(), "pod-a");

        let pending = tokio::time::timeout(Duration::from_millis(20), leadership.lost()).await;
        assert!(pending.is_err());

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), leadership.lost())
            .await
            .unwrap();
        assert!(!leadership.is_leader());
        leadership.release().await;
    }

    #[tokio::test]
    async fn test_lost_never_resolves_when_sender_dropped() {
        let (tx, rx) = watch::channel(false);
        let leadership = Leadership::granted("pod-a", "lock", rx);
        drop(tx);
        let pending = tokio::time::timeout(Duration::from_millis(20), leadership.lost()).await;
        assert!(pending.is_err());
    }
}
