//! Log output for the operator.
//!
//! Events logged while a startup stage runs are emitted inside that stage's
//! span, so JSON lines carry a `span.stage` field and compact lines are
//! prefixed with `stage{stage=...}`.

use std::fmt;

use clap::ValueEnum;
use tracing::Span;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt as tfmt};

use crate::bootstrap::Stage;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Json,
    #[value(alias = "text", alias = "compact")]
    Pretty,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Json => write!(f, "json"),
            Self::Pretty => write!(f, "pretty"),
        }
    }
}

/// Install the global subscriber. `RUST_LOG` overrides `log_level`.
pub fn init(log_format: LogFormat, log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    let registry = tracing_subscriber::registry().with(env_filter);

    match log_format {
        LogFormat::Json => registry
            .with(
                tfmt::layer()
                    .json()
                    .flatten_event(true)
                    .with_target(true)
                    .with_current_span(true)
                    .with_span_list(false)
                    .with_timer(UtcTime::rfc_3339()),
            )
            .init(),
        LogFormat::Pretty => registry
            .with(tfmt::layer().compact().with_timer(UtcTime::rfc_3339()))
            .init(),
    }

    tracing::debug!(log_format = %log_format, log_level, "Logging system initialized");
}

/// Span for one startup stage.
pub fn stage_span(stage: Stage) -> Span {
    tracing::info_span!("stage", stage = %stage)
}
