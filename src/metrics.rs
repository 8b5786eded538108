//! Prometheus metrics for ndm-operator.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;

use crate::upgrade::{TaskFailed, UpgradeSummary};

/// Labels for per-task upgrade outcomes.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct TaskLabels {
    pub from: String,
    pub to: String,
    pub result: String,
}

/// Labels identifying one upgrade step.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct StepLabels {
    pub from: String,
    pub to: String,
}

/// Labels for reconcile metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ReconcileLabels {
    pub controller: String,
    pub result: String,
}

/// All Prometheus metrics for the operator.
pub struct Metrics {
    pub upgrade_task_total: Family<TaskLabels, Counter>,
    pub upgrade_resources_migrated_total: Family<StepLabels, Counter>,
    pub upgrade_duration_seconds: Histogram,
    pub reconcile_total: Family<ReconcileLabels, Counter>,
}

const UPGRADE_DURATION_BUCKETS: &[f64] = &[0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 300.0];

impl Metrics {
    /// Create and register all metrics with the given registry.
    pub fn new(registry: &mut Registry) -> Self {
        let upgrade_task_total = Family::<TaskLabels, Counter>::default();
        registry.register(
            "ndm_upgrade_task",
            "Upgrade task runs by version step and result",
            upgrade_task_total.clone(),
        );

        let upgrade_resources_migrated_total = Family::<StepLabels, Counter>::default();
        registry.register(
            "ndm_upgrade_resources_migrated",
            "Custom resources rewritten by upgrade tasks",
            upgrade_resources_migrated_total.clone(),
        );

        let upgrade_duration_seconds = Histogram::new(UPGRADE_DURATION_BUCKETS.iter().copied());
        registry.register(
            "ndm_upgrade_duration_seconds",
            "Duration of the startup upgrade chain in seconds",
            upgrade_duration_seconds.clone(),
        );

        let reconcile_total = Family::<ReconcileLabels, Counter>::default();
        registry.register(
            "ndm_reconcile",
            "Total number of reconcile calls",
            reconcile_total.clone(),
        );

        Self {
            upgrade_task_total,
            upgrade_resources_migrated_total,
            upgrade_duration_seconds,
            reconcile_total,
        }
    }

    /// Record every task of a successful upgrade run.
    pub fn record_upgrade(&self, summary: &UpgradeSummary, elapsed_secs: f64) {
        for (from, to, report) in &summary.tasks {
            let result = if report.is_noop() { "noop" } else { "applied" };
            self.upgrade_task_total
                .get_or_create(&TaskLabels {
                    from: from.to_string(),
                    to: to.to_string(),
                    result: result.to_string(),
                })
                .inc();
            self.upgrade_resources_migrated_total
                .get_or_create(&StepLabels {
                    from: from.to_string(),
                    to: to.to_string(),
                })
                .inc_by(report.migrated() as u64);
        }
        self.upgrade_duration_seconds.observe(elapsed_secs);
    }

    /// Record the task a failed upgrade run stopped at.
    pub fn record_upgrade_failure(&self, failed: &TaskFailed, elapsed_secs: f64) {
        self.upgrade_task_total
            .get_or_create(&TaskLabels {
                from: failed.from.to_string(),
                to: failed.to.to_string(),
                result: "failed".to_string(),
            })
            .inc();
        self.upgrade_duration_seconds.observe(elapsed_secs);
    }

    pub fn record_reconcile(&self, controller: &str, result: &str) {
        self.reconcile_total
            .get_or_create(&ReconcileLabels {
                controller: controller.to_string(),
                result: result.to_string(),
            })
            .inc();
    }
}

/// Axum handler that encodes the registry as OpenMetrics text.
async fn metrics_handler(State(registry): State<Arc<Registry>>) -> impl IntoResponse {
    let mut buf = String::new();
    if encode(&mut buf, &registry).is_err() {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to encode metrics".to_string(),
        );
    }
    (StatusCode::OK, buf)
}

/// Start the metrics server on the given port.
pub async fn serve(port: u16, registry: Arc<Registry>) -> anyhow::Result<()> {
    use axum::Router;
    use axum::routing::get;
    use tokio::net::TcpListener;
    use tracing::info;

    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(registry);

    let listener = TcpListener::bind(format!("0.0.0.0:{port}")).await?;
    info!(port, "Metrics server listening");
    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upgrade::TaskReport;
    use crate::version::Version;

    fn summary() -> UpgradeSummary {
        UpgradeSummary {
            tasks: vec![
                (
                    Version::new(0, 4, 0),
                    Version::new(0, 4, 1),
                    TaskReport {
                        devices_migrated: 0,
                        claims_migrated: 3,
                    },
                ),
                (
                    Version::new(0, 4, 1),
                    Version::new(0, 4, 2),
                    TaskReport::default(),
                ),
            ],
        }
    }

    #[test]
    fn test_record_upgrade_encoding() {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        metrics.record_upgrade(&summary(), 0.3);

        let mut buf = String::new();
        encode(&mut buf, &registry).unwrap();
        assert!(buf.contains(r#"ndm_upgrade_task_total{from="0.4.0",to="0.4.1",result="applied"} 1"#));
        assert!(buf.contains(r#"ndm_upgrade_task_total{from="0.4.1",to="0.4.2",result="noop"} 1"#));
        assert!(buf.contains(r#"ndm_upgrade_resources_migrated_total{from="0.4.0",to="0.4.1"} 3"#));
        assert!(buf.contains("ndm_upgrade_duration_seconds_count 1"));
        assert!(buf.ends_with("# EOF\n"));
    }

    #[test]
    fn test_record_failure_and_reconcile() {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        metrics.record_upgrade_failure(
            &TaskFailed {
                from: Version::new(0, 4, 1),
                to: Version::new(0, 4, 2),
            },
            1.0,
        );
        metrics.record_reconcile("blockdeviceclaim", "success");
        metrics.record_reconcile("blockdeviceclaim", "success");

        let mut buf = String::new();
        encode(&mut buf, &registry).unwrap();
        assert!(buf.contains(r#"ndm_upgrade_task_total{from="0.4.1",to="0.4.2",result="failed"} 1"#));
        assert!(buf.contains(
            r#"ndm_reconcile_total{controller="blockdeviceclaim",result="success"} 2"#
        ));
        assert!(buf.contains("# TYPE ndm_upgrade_task counter"));
        assert!(buf.contains("# TYPE ndm_upgrade_duration_seconds histogram"));
    }
}
