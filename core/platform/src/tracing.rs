//! Tracing setup and correlation propagation.
//!
//! Every logical operation (one API call, one background loop tick) runs
//! inside an `operation` span carrying a [`CorrelationId`], so a reconcile
//! and the repository and applier work it triggers can be joined across
//! log lines.

use crate::errors::PlatformError;
use ::tracing::{info, info_span, Instrument, Span};
use std::env;
use std::fmt;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

/// Output format for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per line, for log shippers.
    Json,
    /// Human-readable text for interactive runs.
    Text,
}

impl LogFormat {
    /// `LOG_FORMAT` wins when set to `json` or `text`; otherwise prod and
    /// staging deployments ship JSON and everything else prints text.
    pub fn from_env() -> LogFormat {
        match env::var("LOG_FORMAT").as_deref() {
            Ok("json") => LogFormat::Json,
            Ok("text") => LogFormat::Text,
            _ => {
                let environment = env::var("APP_ENV").unwrap_or_else(|_| "dev".to_string());
                if environment == "prod" || environment == "staging" {
                    LogFormat::Json
                } else {
                    LogFormat::Text
                }
            }
        }
    }
}

/// Install the global subscriber with an `RUST_LOG`-style env filter
/// (default `info`). A second installation surfaces as a `Subscriber`
/// error; tests that share a process can ignore it.
pub fn init_tracing(service_name: &str) -> Result<(), PlatformError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let format = LogFormat::from_env();

    let installed = match format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .with_current_span(true)
            .with_span_list(false)
            .try_init(),
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .try_init(),
    };
    installed.map_err(|e| PlatformError::Subscriber(e.to_string()))?;

    info!(
        service = %service_name,
        format = ?format,
        event = "startup",
        "tracing initialized"
    );
    Ok(())
}

/// Identifier joining all log lines of one logical operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    /// Mint a fresh ID for an operation originating in this process.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Adopt the caller's ID when one was propagated, mint otherwise.
    pub fn inherit(existing: Option<Uuid>) -> Self {
        Self(existing.unwrap_or_else(Uuid::new_v4))
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The span wrapping one logical operation.
pub fn operation_span(correlation_id: CorrelationId, operation: &str) -> Span {
    info_span!(
        "operation",
        %operation,
        correlation_id = %correlation_id,
    )
}

/// Run a future inside an operation span.
pub async fn instrument_operation<F, R>(
    correlation_id: CorrelationId,
    operation: &str,
    f: F,
) -> R
where
    F: std::future::Future<Output = R>,
{
    f.instrument(operation_span(correlation_id, operation)).await
}
