//! Capability interfaces the engine is constructed with. Expressing the
//! external collaborators as traits keeps the state machine testable with
//! in-memory fakes and keeps cluster plumbing out of the core.

use async_trait::async_trait;
use chrono::Duration;
use shared_types::{Prediction, RollbackEvent, TargetRef, WorkloadSample};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
#[error("{0}")]
pub struct ApplyError(pub String);

#[derive(Debug, Error)]
#[error("{0}")]
pub struct ProbeError(pub String);

#[derive(Debug, Error)]
#[error("{0}")]
pub struct AlertError(pub String);

/// Applies a resource patch to a workload. Re-applying the same patch must
/// be safe; the engine relies on that for idempotent reconciles.
#[async_trait]
pub trait Applier: Send + Sync {
    async fn apply(
        &self,
        namespace: &str,
        target: &TargetRef,
        patch_yaml: &str,
    ) -> Result<(), ApplyError>;
}

/// Samples post-apply telemetry for one workload.
#[async_trait]
pub trait MetricsProbe: Send + Sync {
    async fn sample(&self, namespace: &str, deployment: &str)
        -> Result<WorkloadSample, ProbeError>;
}

/// Produces prediction rows for the aggregation sweep.
#[async_trait]
pub trait PredictionSource: Send + Sync {
    async fn fetch(&self, lookback: Duration) -> Result<Vec<Prediction>, ProbeError>;
}

/// Delivers rollback notifications. Failures are tolerated; the controller
/// retries on later passes until `alert_sent` is persisted.
#[async_trait]
pub trait AlertCallback: Send + Sync {
    async fn alert(&self, event: &RollbackEvent) -> Result<(), AlertError>;
}

/// Stand-in applier for deployments without a cluster client wired in. Logs
/// the patch it would have applied and reports success, which keeps the
/// lifecycle observable end to end.
pub struct LogOnlyApplier;

#[async_trait]
impl Applier for LogOnlyApplier {
    async fn apply(
        &self,
        namespace: &str,
        target: &TargetRef,
        patch_yaml: &str,
    ) -> Result<(), ApplyError> {
        info!(
            namespace = %namespace,
            workload = %target.name,
            kind = %target.kind,
            patch = %patch_yaml,
            "log-only applier: accepting patch without cluster side effects"
        );
        Ok(())
    }
}

/// Probe stand-in that reports a quiet workload. Used when no telemetry
/// source is configured; outcomes then trend to success after the window.
pub struct NullMetricsProbe;

#[async_trait]
impl MetricsProbe for NullMetricsProbe {
    async fn sample(
        &self,
        _namespace: &str,
        _deployment: &str,
    ) -> Result<WorkloadSample, ProbeError> {
        Ok(WorkloadSample {
            oom_kills: 0,
            cpu_throttle_ratio: 0.0,
            mem_usage_p95_bytes: 0,
            cpu_usage_p95_fraction: 0.0,
        })
    }
}

/// Prediction source stand-in that never produces rows.
pub struct NoPredictions;

#[async_trait]
impl PredictionSource for NoPredictions {
    async fn fetch(&self, _lookback: Duration) -> Result<Vec<Prediction>, ProbeError> {
        Ok(Vec::new())
    }
}
