//! Startup upgrade of persisted custom resources.
//!
//! An [`UpgradeTask`] migrates every resource recorded at its `from` version to
//! its `to` version. Tasks are run strictly in the order they were given and
//! the run stops at the first failure. Nothing records which tasks already
//! ran: applicability is re-derived from the version labels on every start,
//! so a restarted run skips completed tasks as no-ops.

pub mod v040_041;
pub mod v041_042;

use std::fmt;
use std::time::Instant;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::info;

use crate::error::NdmError;
use crate::store::ResourceStore;
use crate::version::Version;

/// A single migration step between two adjacent schema versions.
#[async_trait]
pub trait UpgradeTask: Send + Sync {
    fn from_version(&self) -> &Version;

    fn to_version(&self) -> &Version;

    /// Migrate every resource currently at `from_version`.
    ///
    /// Must be a no-op when nothing is at `from_version`, and must leave
    /// resources at any other version untouched. Each migrated object is
    /// written once, with its data and version label together.
    async fn apply(&self, store: &dyn ResourceStore) -> Result<TaskReport>;
}

/// Outcome of one task.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TaskReport {
    pub devices_migrated: usize,
    pub claims_migrated: usize,
}

impl TaskReport {
    pub const fn migrated(&self) -> usize {
        self.devices_migrated + self.claims_migrated
    }

    pub const fn is_noop(&self) -> bool {
        self.migrated() == 0
    }
}

/// Per-task reports of a successful run, in execution order.
#[derive(Clone, Debug, Default)]
pub struct UpgradeSummary {
    pub tasks: Vec<(Version, Version, TaskReport)>,
}

impl UpgradeSummary {
    pub fn migrated(&self) -> usize {
        self.tasks.iter().map(|(_, _, r)| r.migrated()).sum()
    }
}

/// Context attached to the error of the task that failed.
///
/// Recoverable with `downcast_ref` on the returned error.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskFailed {
    pub from: Version,
    pub to: Version,
}

impl fmt::Display for TaskFailed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Upgrade {} -> {} failed", self.from, self.to)
    }
}

/// Checked before each task starts. Returning `false` aborts the run with
/// [`NdmError::LeadershipLost`].
pub type Gate<'a> = &'a (dyn Fn() -> bool + Sync);

/// Run `tasks` in the given order, stopping at the first failure.
///
/// No sorting happens here: callers supply tasks in ascending version order.
/// Already committed tasks are not rolled back when a later one fails.
pub async fn run_tasks(
    tasks: &[Box<dyn UpgradeTask>],
    store: &dyn ResourceStore,
    proceed: Gate<'_>,
) -> Result<UpgradeSummary> {
    let mut summary = UpgradeSummary::default();

    for task in tasks {
        let from = task.from_version().clone();
        let to = task.to_version().clone();
        if !proceed() {
            return Err(
                NdmError::LeadershipLost(format!("upgrade {from} -> {to} not started")).into(),
            );
        }
        info!(from = %from, to = %to, "Running upgrade task");

        let report = task.apply(store).await.with_context(|| TaskFailed {
            from: from.clone(),
            to: to.clone(),
        })?;

        if report.is_noop() {
            info!(from = %from, to = %to, "No resources at source version, skipping");
        } else {
            info!(
                from = %from,
                to = %to,
                devices = report.devices_migrated,
                claims = report.claims_migrated,
                "Upgrade task applied"
            );
        }
        summary.tasks.push((from, to, report));
    }

    Ok(summary)
}

/// Check that `tasks` form one contiguous, strictly increasing chain.
pub fn validate_chain(tasks: &[Box<dyn UpgradeTask>]) -> Result<()> {
    for task in tasks {
        if task.from_version() >= task.to_version() {
            return Err(NdmError::InvalidChain(format!(
                "task {} -> {} does not move forward",
                task.from_version(),
                task.to_version()
            ))
            .into());
        }
    }

    for pair in tasks.windows(2) {
        let (prev, next) = (&pair[0], &pair[1]);
        if prev.to_version() != next.from_version() {
            return Err(NdmError::InvalidChain(format!(
                "task {} -> {} is followed by {} -> {}",
                prev.from_version(),
                prev.to_version(),
                next.from_version(),
                next.to_version()
            ))
            .into());
        }
    }

    Ok(())
}

/// A validated, ordered list of upgrade tasks.
pub struct UpgradeChain {
    tasks: Vec<Box<dyn UpgradeTask>>,
}

impl UpgradeChain {
    /// Build a chain, rejecting gaps and non-increasing steps before any
    /// cluster call is made.
    pub fn new(tasks: Vec<Box<dyn UpgradeTask>>) -> Result<Self> {
        validate_chain(&tasks)?;
        Ok(Self { tasks })
    }

    /// The chain shipped with this release: 0.4.0 -> 0.4.1 -> 0.4.2.
    pub fn release() -> Result<Self> {
        Self::new(vec![
            Box::new(v040_041::ClaimHostUpgrade::new()),
            Box::new(v041_042::NodeNameUpgrade::new()),
        ])
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Version every resource is at after a successful run.
    pub fn target_version(&self) -> Option<&Version> {
        self.tasks.last().map(|t| t.to_version())
    }

    /// Run every task while `proceed` holds.
    pub async fn run(
        &self,
        store: &dyn ResourceStore,
        proceed: Gate<'_>,
    ) -> Result<UpgradeSummary> {
        let started = Instant::now();
        let summary = run_tasks(&self.tasks, store, proceed).await?;
        info!(
            tasks = self.tasks.len(),
            migrated = summary.migrated(),
            elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            "Upgrade chain completed"
        );
        Ok(summary)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Fixtures shared by the upgrade and bootstrap tests.

    use std::collections::BTreeMap;
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::crd::block_device::{BlockDeviceSpec, NodeAttributes};
    use crate::crd::claim::BlockDeviceClaimSpec;
    use crate::crd::{
        BlockDevice, BlockDeviceClaim, BlockDeviceClaimStatus, ClaimPhase, HOSTNAME_LABEL,
    };
    use crate::version::VERSION_LABEL;

    /// Gate that never stops a run.
    pub fn always() -> bool {
        true
    }

    pub fn v(s: &str) -> Version {
        Version::parse(s).unwrap()
    }

    pub fn device_at(name: &str, version: Option<&str>, host: &str) -> BlockDevice {
        let mut bd = BlockDevice::new(
            name,
            BlockDeviceSpec {
                node_attributes: NodeAttributes {
                    host_name: host.to_string(),
                    node_name: None,
                },
                path: "/dev/sdb".to_string(),
                ..Default::default()
            },
        );
        let mut labels = BTreeMap::from([(HOSTNAME_LABEL.to_string(), host.to_string())]);
        if let Some(version) = version {
            labels.insert(VERSION_LABEL.to_string(), version.to_string());
        }
        bd.metadata.labels = Some(labels);
        bd
    }

    pub fn legacy_claim(
        name: &str,
        version: Option<&str>,
        host: &str,
        phase: ClaimPhase,
    ) -> BlockDeviceClaim {
        let mut claim = BlockDeviceClaim::new(
            name,
            BlockDeviceClaimSpec {
                host_name: Some(host.to_string()),
                ..Default::default()
            },
        );
        if let Some(version) = version {
            claim.metadata.labels = Some(BTreeMap::from([(
                VERSION_LABEL.to_string(),
                version.to_string(),
            )]));
        }
        claim.status = Some(BlockDeviceClaimStatus { phase });
        claim
    }

    /// Task that records its invocations and can be told to fail.
    pub struct ScriptedTask {
        pub from: Version,
        pub to: Version,
        pub fail: bool,
        pub log: Arc<Mutex<Vec<String>>>,
    }

    impl ScriptedTask {
        pub fn boxed(
            from: &str,
            to: &str,
            fail: bool,
            log: &Arc<Mutex<Vec<String>>>,
        ) -> Box<dyn UpgradeTask> {
            Box::new(Self {
                from: v(from),
                to: v(to),
                fail,
                log: Arc::clone(log),
            })
        }
    }

    #[async_trait]
    impl UpgradeTask for ScriptedTask {
        fn from_version(&self) -> &Version {
            &self.from
        }

        fn to_version(&self) -> &Version {
            &self.to
        }

        async fn apply(&self, _store: &dyn ResourceStore) -> Result<TaskReport> {
            self.log
                .lock()
                .unwrap()
                .push(format!("{}->{}", self.from, self.to));
            if self.fail {
                anyhow::bail!("scripted failure");
            }
            Ok(TaskReport::default())
        }
    }
}
