//! Health endpoints.
//!
//! `/healthz` answers as soon as the process is up. `/readyz` answers 200 only
//! while the ready marker is held, and reports which startup stage the
//! operator is in so a stuck upgrade or leadership wait is visible from the
//! probe output.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::info;

use crate::bootstrap::Stage;

/// Readiness flag and current startup stage, shared with the probe server.
#[derive(Clone, Default)]
pub struct HealthState {
    ready: Arc<AtomicBool>,
    stage: Arc<RwLock<Option<Stage>>>,
}

impl HealthState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn set_stage(&self, stage: Stage) {
        if let Ok(mut current) = self.stage.write() {
            *current = Some(stage);
        }
    }

    pub fn stage(&self) -> Option<Stage> {
        self.stage.read().ok().and_then(|s| *s)
    }
}

#[derive(Debug, Serialize, PartialEq, Eq)]
struct Readiness {
    ready: bool,
    stage: String,
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn readyz(State(state): State<HealthState>) -> (StatusCode, Json<Readiness>) {
    let ready = state.is_ready();
    let body = Readiness {
        ready,
        stage: state
            .stage()
            .map_or_else(|| "starting".to_string(), |s| s.to_string()),
    };
    let code = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(body))
}

/// Start the health server on the given port.
pub async fn serve(port: u16, state: HealthState) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .with_state(state);

    let listener = TcpListener::bind(format!("0.0.0.0:{port}")).await?;
    info!(port, "Health server listening");
    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_healthz_always_ok() {
        assert_eq!(healthz().await, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_readyz_before_any_stage() {
        let (code, Json(body)) = readyz(State(HealthState::new())).await;
        assert_eq!(code, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body.stage, "starting");
        assert!(!body.ready);
    }

    #[tokio::test]
    async fn test_readyz_reports_stage_and_readiness() {
        let state = HealthState::new();
        state.set_stage(Stage::Upgrade);
        state.set_ready(true);

        let (code, Json(body)) = readyz(State(state.clone())).await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(
            body,
            Readiness {
                ready: true,
                stage: "upgrade".to_string()
            }
        );

        state.set_ready(false);
        let (code, _) = readyz(State(state)).await;
        assert_eq!(code, StatusCode::SERVICE_UNAVAILABLE);
    }
}
