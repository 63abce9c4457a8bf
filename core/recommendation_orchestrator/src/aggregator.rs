//! Reduces a time window of prediction rows for one `(namespace, deployment,
//! time_window)` into a single recommendation: p95 for CPU, p95 plus a
//! safety margin for memory, mean confidence, max model version.

use crate::capabilities::PredictionSource;
use crate::cost::CostCalculator;
use crate::errors::{EngineError, EngineResult};
use crate::lifecycle::LifecycleEngine;
use crate::patch;
use crate::repository::Repository;
use chrono::{DateTime, Utc};
use platform::metrics::{incr, names};
use shared_types::{
    EngineSettings, Phase, Prediction, Recommendation, ResourceSpec, RiskLevel, TargetRef,
    TimeWindow,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Nearest-rank percentile over an unsorted sample: index `ceil(p/100 * n)`,
/// 1-based. Empty input yields `None`.
pub fn percentile(values: &[i64], pct: f64) -> Option<i64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_unstable();
    let rank = ((pct / 100.0) * sorted.len() as f64).ceil() as usize;
    let idx = rank.clamp(1, sorted.len()) - 1;
    Some(sorted[idx])
}

/// Apply the memory safety margin, rounding up to whole bytes.
fn with_margin(bytes: i64, margin: f64) -> i64 {
    (bytes as f64 * (1.0 + margin)).ceil() as i64
}

/// Derive the policy risk level from the proposed change against the current
/// values: any field shrinking by more than half is high risk, more than 30%
/// medium, everything else low. Unknown current values stay low risk.
fn derive_risk(current: &ResourceSpec, proposed: &ResourceSpec) -> RiskLevel {
    let pairs = [
        (current.cpu_request_millicores, proposed.cpu_request_millicores),
        (current.cpu_limit_millicores, proposed.cpu_limit_millicores),
        (current.memory_request_bytes, proposed.memory_request_bytes),
        (current.memory_limit_bytes, proposed.memory_limit_bytes),
    ];

    let mut worst = RiskLevel::Low;
    for (cur, new) in pairs {
        let (Some(cur), Some(new)) = (cur, new) else {
            continue;
        };
        if cur <= 0 || new >= cur {
            continue;
        }
        let reduction = (cur - new) as f64 / cur as f64;
        if reduction > 0.50 {
            return RiskLevel::High;
        }
        if reduction > 0.30 {
            worst = RiskLevel::Medium;
        }
    }
    worst
}

/// Reduce the prediction rows for one workload and window. Rows outside the
/// lookback or for other workloads are ignored. Returns `None` when no row
/// matches, and never applies the safety margin more than once: every call
/// starts from the raw predicted bytes.
pub fn aggregate(
    namespace: &str,
    deployment: &str,
    window: TimeWindow,
    lookback: chrono::Duration,
    memory_safety_margin: f64,
    now: DateTime<Utc>,
    predictions: &[Prediction],
) -> Option<Recommendation> {
    let cutoff = now - lookback;
    let mut rows: Vec<&Prediction> = predictions
        .iter()
        .filter(|p| {
            p.namespace == namespace
                && p.deployment == deployment
                && p.time_window == window
                && p.predicted_at >= cutoff
        })
        .collect();
    if rows.is_empty() {
        return None;
    }
    rows.sort_by_key(|p| p.predicted_at);

    let collect = |f: fn(&Prediction) -> Option<i64>| -> Vec<i64> {
        rows.iter().filter_map(|p| f(p)).collect()
    };

    let cpu_request = percentile(&collect(|p| p.cpu_request_millicores), 95.0);
    let cpu_limit = percentile(&collect(|p| p.cpu_limit_millicores), 95.0);
    let memory_request = percentile(&collect(|p| p.memory_request_bytes), 95.0)
        .map(|b| with_margin(b, memory_safety_margin));
    let memory_limit = percentile(&collect(|p| p.memory_limit_bytes), 95.0)
        .map(|b| with_margin(b, memory_safety_margin));

    let proposed = ResourceSpec {
        cpu_request_millicores: cpu_request,
        cpu_limit_millicores: cpu_limit,
        memory_request_bytes: memory_request,
        memory_limit_bytes: memory_limit,
    };

    let confidence =
        rows.iter().map(|p| p.confidence).sum::<f64>() / rows.len() as f64;
    let model_version = rows
        .iter()
        .map(|p| p.model_version.as_str())
        .max()
        .unwrap_or_default()
        .to_string();

    // Latest row wins for the observed current values and container name.
    let current = rows
        .iter()
        .rev()
        .find_map(|p| p.current)
        .unwrap_or_default();
    let container = rows.iter().rev().find_map(|p| p.container.clone());

    let risk_level = derive_risk(&current, &proposed);
    let target = TargetRef {
        kind: "Deployment".to_string(),
        api_version: "apps/v1".to_string(),
        name: deployment.to_string(),
        container_name: container,
    };
    let generated_patch = patch::strategic_merge_yaml(&target, &proposed);

    Some(Recommendation {
        id: Uuid::new_v4(),
        namespace: namespace.to_string(),
        name: Recommendation::aggregated_name(deployment, window),
        deployment: deployment.to_string(),
        target,
        proposed,
        current,
        previous_resources: None,
        confidence,
        model_version,
        time_window: window,
        generated_at: now,
        auto_apply: false,
        requires_approval: risk_level != RiskLevel::Low,
        risk_level,
        phase: Phase::Pending,
        message: String::new(),
        generated_patch,
        applied_at: None,
        applied_by: None,
        approved_at: None,
        approved_by: None,
        last_updated: now,
        conditions: Vec::new(),
        outcome: None,
        dry_run_result: None,
    })
}

/// Background sweep: pull predictions, aggregate per workload and window,
/// upsert (never overwriting a non-Pending row), snapshot costs, and push
/// the refreshed recommendations through a reconcile.
pub struct AggregationSweep {
    source: Arc<dyn PredictionSource>,
    repository: Repository,
    engine: Arc<LifecycleEngine>,
    cost: CostCalculator,
    settings: EngineSettings,
}

impl AggregationSweep {
    pub fn new(
        source: Arc<dyn PredictionSource>,
        repository: Repository,
        engine: Arc<LifecycleEngine>,
        cost: CostCalculator,
        settings: EngineSettings,
    ) -> Self {
        Self {
            source,
            repository,
            engine,
            cost,
            settings,
        }
    }

    /// One pass. Returns how many recommendations were written.
    pub async fn run_once(&self) -> EngineResult<usize> {
        let windows = [TimeWindow::Peak, TimeWindow::OffPeak, TimeWindow::Weekly];
        let max_lookback = windows
            .iter()
            .map(|w| self.settings.aggregation_windows.lookback(*w))
            .max()
            .unwrap_or_else(|| chrono::Duration::hours(24));

        let predictions = self
            .source
            .fetch(max_lookback)
            .await
            .map_err(|e| EngineError::Repository(format!("prediction source: {e}")))?;
        if predictions.is_empty() {
            return Ok(0);
        }

        let now = Utc::now();
        let mut workloads: BTreeMap<(String, String), ()> = BTreeMap::new();
        for p in &predictions {
            workloads.insert((p.namespace.clone(), p.deployment.clone()), ());
        }

        let mut written = 0usize;
        for (namespace, deployment) in workloads.keys() {
            for window in windows {
                let lookback = self.settings.aggregation_windows.lookback(window);
                let Some(rec) = aggregate(
                    namespace,
                    deployment,
                    window,
                    lookback,
                    self.settings.memory_safety_margin,
                    now,
                    &predictions,
                ) else {
                    continue;
                };

                let stored = match self.repository.upsert_aggregated(&rec).await {
                    Ok(Some(stored)) => stored,
                    Ok(None) => {
                        // Existing row has left Pending; leave it alone.
                        continue;
                    }
                    Err(e) => {
                        warn!(
                            namespace = %namespace,
                            deployment = %deployment,
                            window = %window,
                            error = %e,
                            "aggregation upsert failed"
                        );
                        continue;
                    }
                };
                written += 1;
                incr(names::AGGREGATED_RECOMMENDATIONS);

                let snapshot = self.cost.snapshot(&stored);
                if let Err(e) = self.repository.insert_cost_snapshot(&snapshot).await {
                    warn!(error = %e, "cost snapshot insert failed");
                }

                // Drive auto-apply / approval gating for the fresh row.
                if let Err(e) = self.engine.reconcile(&stored.namespace, &stored.name).await {
                    warn!(
                        namespace = %stored.namespace,
                        name = %stored.name,
                        error = %e,
                        "post-aggregation reconcile failed"
                    );
                }
            }
        }

        info!(written, "aggregation sweep complete");
        Ok(written)
    }
}
