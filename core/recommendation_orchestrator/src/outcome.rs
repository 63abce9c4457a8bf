//! Post-apply observation: record a baseline at apply time, refresh the
//! after-sample on every poll inside the monitoring window, and classify
//! the outcome. Degraded is sticky until a rollback is recorded.

use crate::capabilities::MetricsProbe;
use crate::errors::EngineResult;
use crate::repository::Repository;
use chrono::{DateTime, Duration, Utc};
use platform::metrics::{names, set_gauge};
use shared_types::{EngineSettings, Outcome, OutcomeStatus, Recommendation, WorkloadSample};
use std::sync::Arc;
use tracing::{debug, warn};

/// Relative throttle increase (over a non-zero baseline) that marks an
/// outcome degraded.
const THROTTLE_RELATIVE_DEGRADED: f64 = 0.10;
/// Absolute throttle ratio that marks an outcome degraded when the baseline
/// was zero.
const THROTTLE_ABSOLUTE_DEGRADED: f64 = 0.05;

/// Classify an outcome from its before/after samples. `success_after` is how
/// long a workload must stay clean after the apply before the outcome is
/// final.
pub fn classify(outcome: &Outcome, now: DateTime<Utc>, success_after: Duration) -> OutcomeStatus {
    if outcome.oom_kill_delta() > 0 {
        return OutcomeStatus::Degraded;
    }

    let before = outcome.cpu_throttle_before;
    let after = outcome.cpu_throttle_after;
    if before > 0.0 && (after - before) / before > THROTTLE_RELATIVE_DEGRADED {
        return OutcomeStatus::Degraded;
    }
    if before == 0.0 && after > THROTTLE_ABSOLUTE_DEGRADED {
        return OutcomeStatus::Degraded;
    }

    if now - outcome.applied_at > success_after {
        return OutcomeStatus::Success;
    }

    OutcomeStatus::Monitoring
}

fn baseline(applied_at: DateTime<Utc>, now: DateTime<Utc>, sample: WorkloadSample) -> Outcome {
    Outcome {
        applied_at,
        check_time: now,
        oom_kills_before: sample.oom_kills,
        oom_kills_after: sample.oom_kills,
        cpu_throttle_before: sample.cpu_throttle_ratio,
        cpu_throttle_after: sample.cpu_throttle_ratio,
        mem_usage_p95_before: sample.mem_usage_p95_bytes,
        mem_usage_p95_after: sample.mem_usage_p95_bytes,
        cpu_usage_p95_before: sample.cpu_usage_p95_fraction,
        cpu_usage_p95_after: sample.cpu_usage_p95_fraction,
        status: OutcomeStatus::Monitoring,
        rollback_triggered: false,
        rollback_recommendation_id: None,
    }
}

pub struct OutcomeTracker {
    repository: Repository,
    probe: Arc<dyn MetricsProbe>,
    settings: EngineSettings,
}

impl OutcomeTracker {
    pub fn new(
        repository: Repository,
        probe: Arc<dyn MetricsProbe>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            repository,
            probe,
            settings,
        }
    }

    /// One polling tick over every applied recommendation that still needs
    /// observation. Returns the number of outcomes written.
    pub async fn poll_once(&self) -> EngineResult<usize> {
        let now = Utc::now();
        let window = self.settings.monitoring_window();
        let candidates = self.repository.list_monitoring_candidates().await?;
        set_gauge(names::MONITORED_WORKLOADS, candidates.len() as f64);

        let mut written = 0usize;
        for rec in candidates {
            match self.observe(&rec, now, window).await {
                Ok(true) => written += 1,
                Ok(false) => {}
                Err(err) => {
                    warn!(
                        namespace = %rec.namespace,
                        name = %rec.name,
                        error = %err,
                        "outcome observation failed"
                    );
                }
            }
        }
        Ok(written)
    }

    async fn observe(
        &self,
        rec: &Recommendation,
        now: DateTime<Utc>,
        window: Duration,
    ) -> EngineResult<bool> {
        let Some(applied_at) = rec.applied_at else {
            // Applied phase without a timestamp would break invariant 1;
            // leave the row for a human instead of guessing.
            warn!(
                namespace = %rec.namespace,
                name = %rec.name,
                "applied recommendation without applied_at, skipping"
            );
            return Ok(false);
        };

        let within_window = now - applied_at <= window;
        match &rec.outcome {
            None => {
                if !within_window {
                    // Too old to establish a meaningful baseline.
                    return Ok(false);
                }
                let sample = self
                    .probe
                    .sample(&rec.namespace, &rec.deployment)
                    .await
                    .map_err(|e| crate::errors::EngineError::Repository(format!("probe: {e}")))?;
                let outcome = baseline(applied_at, now, sample);
                self.repository.upsert_outcome(rec.id, &outcome).await?;
                debug!(
                    namespace = %rec.namespace,
                    name = %rec.name,
                    "baseline outcome recorded"
                );
                Ok(true)
            }
            Some(existing)
                if matches!(
                    existing.status,
                    OutcomeStatus::Monitoring | OutcomeStatus::Degraded
                ) =>
            {
                if within_window {
                    let sample = self
                        .probe
                        .sample(&rec.namespace, &rec.deployment)
                        .await
                        .map_err(|e| {
                            crate::errors::EngineError::Repository(format!("probe: {e}"))
                        })?;

                    let mut outcome = existing.clone();
                    outcome.check_time = now;
                    outcome.oom_kills_after = sample.oom_kills;
                    outcome.cpu_throttle_after = sample.cpu_throttle_ratio;
                    outcome.mem_usage_p95_after = sample.mem_usage_p95_bytes;
                    outcome.cpu_usage_p95_after = sample.cpu_usage_p95_fraction;
                    // Degraded never improves on its own; it only resolves
                    // through a recorded rollback.
                    if existing.status != OutcomeStatus::Degraded {
                        outcome.status = classify(&outcome, now, window);
                    }
                    self.repository.upsert_outcome(rec.id, &outcome).await?;
                    Ok(true)
                } else if existing.status == OutcomeStatus::Monitoring {
                    // Window expired clean: finalize without resampling.
                    let mut outcome = existing.clone();
                    outcome.status = OutcomeStatus::Success;
                    self.repository.upsert_outcome(rec.id, &outcome).await?;
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Some(_) => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::{MetricsProbe, ProbeError};
    use crate::repository::Repository;
    use async_trait::async_trait;
    use shared_types::{
        Phase, Recommendation, ResourceSpec, RiskLevel, TargetRef, TimeWindow,
    };
    use std::sync::Mutex as StdMutex;
    use std::sync::Arc;
    use tempfile::TempDir;
    use uuid::Uuid;

    struct ScriptedProbe {
        sample: StdMutex<WorkloadSample>,
    }

    impl ScriptedProbe {
        fn new(sample: WorkloadSample) -> Arc<Self> {
            Arc::new(Self {
                sample: StdMutex::new(sample),
            })
        }

        fn set(&self, sample: WorkloadSample) {
            *self.sample.lock().unwrap() = sample;
        }
    }

    #[async_trait]
    impl MetricsProbe for ScriptedProbe {
        async fn sample(
            &self,
            _namespace: &str,
            _deployment: &str,
        ) -> Result<WorkloadSample, ProbeError> {
            Ok(*self.sample.lock().unwrap())
        }
    }

    fn quiet_sample() -> WorkloadSample {
        WorkloadSample {
            oom_kills: 0,
            cpu_throttle_ratio: 0.10,
            mem_usage_p95_bytes: 400 * 1024 * 1024,
            cpu_usage_p95_fraction: 0.4,
        }
    }

    fn applied_rec(applied_minutes_ago: i64) -> Recommendation {
        let now = Utc::now();
        Recommendation {
            id: Uuid::new_v4(),
            namespace: "payments".to_string(),
            name: "checkout-peak".to_string(),
            deployment: "checkout".to_string(),
            target: TargetRef {
                kind: "Deployment".to_string(),
                api_version: "apps/v1".to_string(),
                name: "checkout".to_string(),
                container_name: None,
            },
            proposed: ResourceSpec {
                cpu_request_millicores: Some(250),
                ..Default::default()
            },
            current: ResourceSpec {
                cpu_request_millicores: Some(500),
                ..Default::default()
            },
            previous_resources: Some(ResourceSpec {
                cpu_request_millicores: Some(500),
                ..Default::default()
            }),
            confidence: 0.9,
            model_version: "v2".to_string(),
            time_window: TimeWindow::Peak,
            generated_at: now,
            auto_apply: true,
            requires_approval: false,
            risk_level: RiskLevel::Low,
            phase: Phase::Applied,
            message: String::new(),
            generated_patch: "patch: seed".to_string(),
            applied_at: Some(now - Duration::minutes(applied_minutes_ago)),
            applied_by: Some("system".to_string()),
            approved_at: None,
            approved_by: None,
            last_updated: now,
            conditions: Vec::new(),
            outcome: None,
            dry_run_result: None,
        }
    }

    #[tokio::test]
    async fn poll_records_baseline_then_tracks_degradation() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("outcomes.db");
        let repository = Repository::new(path.to_str().expect("utf8")).expect("pool");
        repository.init_schema().await.expect("schema");

        let rec = applied_rec(5);
        repository.create_recommendation(&rec).await.expect("seed");

        let probe = ScriptedProbe::new(quiet_sample());
        let tracker = OutcomeTracker::new(
            repository.clone(),
            probe.clone(),
            shared_types::EngineSettings::default(),
        );

        // First tick establishes the baseline.
        assert_eq!(tracker.poll_once().await.expect("poll"), 1);
        let outcome = repository
            .get_outcome(rec.id)
            .await
            .expect("get")
            .expect("baseline");
        assert_eq!(outcome.status, OutcomeStatus::Monitoring);
        assert_eq!(outcome.oom_kills_before, 0);
        assert!((outcome.cpu_throttle_before - 0.10).abs() < 1e-9);
        assert_eq!(outcome.cpu_throttle_before, outcome.cpu_throttle_after);

        // Second tick sees OOM kills and degrades.
        probe.set(WorkloadSample {
            oom_kills: 2,
            ..quiet_sample()
        });
        assert_eq!(tracker.poll_once().await.expect("poll"), 1);
        let outcome = repository
            .get_outcome(rec.id)
            .await
            .expect("get")
            .expect("updated");
        assert_eq!(outcome.status, OutcomeStatus::Degraded);
        assert_eq!(outcome.oom_kill_delta(), 2);
        // Baseline fields never move after the first tick.
        assert_eq!(outcome.oom_kills_before, 0);

        // Degradation is sticky even if the workload recovers.
        probe.set(quiet_sample());
        tracker.poll_once().await.expect("poll");
        let outcome = repository
            .get_outcome(rec.id)
            .await
            .expect("get")
            .expect("sticky");
        assert_eq!(outcome.status, OutcomeStatus::Degraded);
    }

    #[tokio::test]
    async fn clean_monitoring_outcome_finalizes_after_window() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("outcomes.db");
        let repository = Repository::new(path.to_str().expect("utf8")).expect("pool");
        repository.init_schema().await.expect("schema");

        // Applied 61 minutes ago with a clean monitoring outcome on record.
        let rec = applied_rec(61);
        repository.create_recommendation(&rec).await.expect("seed");
        let baseline_outcome = baseline(
            rec.applied_at.expect("applied"),
            rec.applied_at.expect("applied"),
            quiet_sample(),
        );
        repository
            .upsert_outcome(rec.id, &baseline_outcome)
            .await
            .expect("baseline");

        let probe = ScriptedProbe::new(quiet_sample());
        let tracker = OutcomeTracker::new(
            repository.clone(),
            probe,
            shared_types::EngineSettings::default(),
        );

        assert_eq!(tracker.poll_once().await.expect("poll"), 1);
        let outcome = repository
            .get_outcome(rec.id)
            .await
            .expect("get")
            .expect("final");
        assert_eq!(outcome.status, OutcomeStatus::Success);

        // Nothing left to observe on the next tick.
        assert_eq!(tracker.poll_once().await.expect("poll"), 0);
    }

    fn outcome(
        applied_minutes_ago: i64,
        oom_before: i64,
        oom_after: i64,
        throttle_before: f64,
        throttle_after: f64,
    ) -> Outcome {
        let applied_at = Utc::now() - Duration::minutes(applied_minutes_ago);
        Outcome {
            applied_at,
            check_time: Utc::now(),
            oom_kills_before: oom_before,
            oom_kills_after: oom_after,
            cpu_throttle_before: throttle_before,
            cpu_throttle_after: throttle_after,
            mem_usage_p95_before: 0,
            mem_usage_p95_after: 0,
            cpu_usage_p95_before: 0.0,
            cpu_usage_p95_after: 0.0,
            status: OutcomeStatus::Monitoring,
            rollback_triggered: false,
            rollback_recommendation_id: None,
        }
    }

    #[test]
    fn oom_delta_degrades() {
        let o = outcome(10, 2, 3, 0.0, 0.0);
        assert_eq!(classify(&o, Utc::now(), Duration::hours(1)), OutcomeStatus::Degraded);

        // No delta: absolute counts alone do not degrade.
        let o = outcome(10, 5, 5, 0.0, 0.0);
        assert_eq!(
            classify(&o, Utc::now(), Duration::hours(1)),
            OutcomeStatus::Monitoring
        );
    }

    #[test]
    fn relative_throttle_increase_over_ten_percent_degrades() {
        let o = outcome(10, 0, 0, 0.10, 0.112);
        assert_eq!(classify(&o, Utc::now(), Duration::hours(1)), OutcomeStatus::Degraded);

        // Exactly 10% is not over the threshold.
        let o = outcome(10, 0, 0, 0.10, 0.11);
        assert_eq!(
            classify(&o, Utc::now(), Duration::hours(1)),
            OutcomeStatus::Monitoring
        );
    }

    #[test]
    fn absolute_throttle_with_zero_baseline_degrades_past_five_percent() {
        let o = outcome(10, 0, 0, 0.0, 0.051);
        assert_eq!(classify(&o, Utc::now(), Duration::hours(1)), OutcomeStatus::Degraded);

        let o = outcome(10, 0, 0, 0.0, 0.05);
        assert_eq!(
            classify(&o, Utc::now(), Duration::hours(1)),
            OutcomeStatus::Monitoring
        );
    }

    #[test]
    fn clean_outcome_past_window_is_success() {
        let o = outcome(61, 0, 0, 0.10, 0.10);
        assert_eq!(classify(&o, Utc::now(), Duration::hours(1)), OutcomeStatus::Success);

        let o = outcome(59, 0, 0, 0.10, 0.10);
        assert_eq!(
            classify(&o, Utc::now(), Duration::hours(1)),
            OutcomeStatus::Monitoring
        );
    }
}
