//! Periodic rollback controller: scans degraded outcomes inside the
//! monitoring window, synthesizes a rollback recommendation targeting the
//! original's captured previous resources, commits the four-write rollback
//! unit atomically, then drives the new recommendation and delivers alerts.

use crate::capabilities::AlertCallback;
use crate::errors::EngineResult;
use crate::lifecycle::LifecycleEngine;
use crate::patch;
use crate::repository::{Repository, RollbackUnit};
use chrono::Utc;
use platform::metrics::{incr, names};
use platform::{AuditEventType, AuditLog};
use shared_types::{
    set_condition, Condition, ConditionStatus, ConditionType, EngineSettings, Outcome, Phase,
    Recommendation, RiskLevel, RollbackEvent, RollbackReason, TimeWindow,
};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Model version and confidence stamped onto synthesized rollback
/// recommendations.
const ROLLBACK_MODEL_VERSION: &str = "rollback";

#[derive(Debug, Default, PartialEq, Eq)]
pub struct ScanSummary {
    pub scanned: usize,
    pub rolled_back: usize,
    pub alerts_sent: usize,
}

/// Decide which trigger fired for a degraded outcome, honoring the
/// controller's action thresholds (distinct from the tracker's degrade
/// rules and the engine's warn threshold).
pub fn classify_trigger(
    outcome: &Outcome,
    oom_kill_threshold: i64,
    throttle_increase_threshold: f64,
) -> Option<RollbackReason> {
    if outcome.oom_kill_delta() >= oom_kill_threshold {
        return Some(RollbackReason::OomIncrease);
    }
    if outcome.throttle_increase_fraction() >= throttle_increase_threshold {
        return Some(RollbackReason::ThrottleIncrease);
    }
    None
}

/// Build the recommendation that reverts `original`. Its proposal is the
/// original's captured previous resources, and it auto-applies without
/// approval.
fn build_rollback_recommendation(original: &Recommendation) -> Option<Recommendation> {
    let previous = original.previous_resources?;
    let id = Uuid::new_v4();
    let short_id = id.simple().to_string();
    let now = Utc::now();

    Some(Recommendation {
        id,
        namespace: original.namespace.clone(),
        name: format!("{}-rollback-{}", original.name, &short_id[..8]),
        deployment: original.deployment.clone(),
        target: original.target.clone(),
        proposed: previous,
        current: original.proposed,
        previous_resources: None,
        confidence: 1.0,
        model_version: ROLLBACK_MODEL_VERSION.to_string(),
        time_window: TimeWindow::Rollback,
        generated_at: now,
        auto_apply: true,
        requires_approval: false,
        risk_level: RiskLevel::Low,
        phase: Phase::Pending,
        message: format!("rollback of {}/{}", original.namespace, original.name),
        generated_patch: patch::strategic_merge_yaml(&original.target, &previous),
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

pub struct RollbackController {
    repository: Repository,
    engine: Arc<LifecycleEngine>,
    alerter: Option<Arc<dyn AlertCallback>>,
    audit: AuditLog,
    settings: EngineSettings,
}

impl RollbackController {
    pub fn new(
        repository: Repository,
        engine: Arc<LifecycleEngine>,
        alerter: Option<Arc<dyn AlertCallback>>,
        audit: AuditLog,
        settings: EngineSettings,
    ) -> Self {
        Self {
            repository,
            engine,
            alerter,
            audit,
            settings,
        }
    }

    /// One controller pass: retry unsent alerts, then act on degraded
    /// outcomes still inside the monitoring window.
    pub async fn scan_once(&self) -> EngineResult<ScanSummary> {
        let mut summary = ScanSummary::default();

        summary.alerts_sent += self.retry_unsent_alerts().await;

        if !self.settings.auto_rollback_enabled {
            return Ok(summary);
        }

        let now = Utc::now();
        let window = self.settings.monitoring_window();
        let degraded = self.repository.list_degraded().await?;
        summary.scanned = degraded.len();

        for original in degraded {
            let Some(outcome) = original.outcome.clone() else {
                continue;
            };

            // Past the window, degradation no longer warrants automation.
            if now - outcome.applied_at > window {
                continue;
            }

            let Some(reason) = classify_trigger(
                &outcome,
                self.settings.oom_kill_threshold,
                self.settings.throttle_increase_threshold,
            ) else {
                continue;
            };

            match self.roll_back(original, &outcome, reason).await {
                Ok(alert_sent) => {
                    summary.rolled_back += 1;
                    if alert_sent {
                        summary.alerts_sent += 1;
                    }
                }
                Err(err) => {
                    warn!(error = %err, "rollback unit failed, will retry next scan");
                }
            }
        }

        Ok(summary)
    }

    /// Commit the transactional rollback unit for one degraded original,
    /// then drive the new recommendation and send the alert. Returns whether
    /// the alert went out on this pass.
    async fn roll_back(
        &self,
        original: Recommendation,
        outcome: &Outcome,
        reason: RollbackReason,
    ) -> EngineResult<bool> {
        // Serialize against engine operations on the same recommendation,
        // and re-read the authoritative row under the lock.
        let _guard = self.engine.lock_key(&original.namespace, &original.name).await;
        let Some(mut original) = self
            .repository
            .get_recommendation(&original.namespace, &original.name)
            .await?
        else {
            return Ok(false);
        };
        if original.phase != Phase::Applied
            || original.outcome.as_ref().map(|o| o.rollback_triggered) != Some(false)
        {
            // Someone else acted while we were scanning.
            return Ok(false);
        }

        let Some(rollback_rec) = build_rollback_recommendation(&original) else {
            warn!(
                namespace = %original.namespace,
                name = %original.name,
                "degraded recommendation lacks previous resources, cannot roll back"
            );
            return Ok(false);
        };

        let reason_text = match reason {
            RollbackReason::OomIncrease => "automatic rollback: OOM kill increase",
            RollbackReason::ThrottleIncrease => "automatic rollback: CPU throttle increase",
            RollbackReason::Manual => "manual rollback",
        };

        original.phase = Phase::RolledBack;
        set_condition(
            &mut original.conditions,
            Condition {
                condition_type: ConditionType::Applied,
                status: ConditionStatus::False,
                reason: "RolledBack".to_string(),
                message: reason_text.to_string(),
                last_transition_time: Utc::now(),
            },
        );
        original.message = reason_text.to_string();
        original.last_updated = Utc::now();
        if let Some(o) = original.outcome.as_mut() {
            o.status = shared_types::OutcomeStatus::RolledBack;
            o.rollback_triggered = true;
            o.rollback_recommendation_id = Some(rollback_rec.id);
        }

        let event = RollbackEvent {
            id: Uuid::new_v4(),
            original_recommendation_id: original.id,
            rollback_recommendation_id: Some(rollback_rec.id),
            reason,
            oom_kills_detected: outcome.oom_kill_delta(),
            throttle_increase_percent: outcome.throttle_increase_percent(),
            auto_triggered: true,
            created_at: Utc::now(),
            alert_sent: false,
            alert_sent_at: None,
        };

        self.repository
            .commit_rollback(RollbackUnit {
                original: original.clone(),
                rollback_recommendation: Some(rollback_rec.clone()),
                event: event.clone(),
            })
            .await?;
        self.engine.cache_store(&original).await;
        incr(names::ROLLBACKS);
        self.audit
            .record_action(
                AuditEventType::Rollback,
                "system",
                &format!("{}/{}", original.namespace, original.name),
                "auto_rollback",
                reason.as_str(),
            )
            .await;
        info!(
            namespace = %original.namespace,
            name = %original.name,
            rollback = %rollback_rec.name,
            reason = %reason.as_str(),
            "rollback recommendation created"
        );

        // The guard only covers the original; the new recommendation is
        // driven through the engine's own serialization.
        drop(_guard);
        if let Err(err) = self
            .engine
            .reconcile(&rollback_rec.namespace, &rollback_rec.name)
            .await
        {
            warn!(
                namespace = %rollback_rec.namespace,
                name = %rollback_rec.name,
                error = %err,
                "rollback recommendation apply failed"
            );
        }

        Ok(self.send_alert(&event).await)
    }

    async fn send_alert(&self, event: &RollbackEvent) -> bool {
        let Some(alerter) = &self.alerter else {
            return false;
        };
        match alerter.alert(event).await {
            Ok(()) => {
                let now = Utc::now();
                if let Err(err) = self.repository.mark_alert_sent(event.id, now).await {
                    warn!(error = %err, "alert sent but could not be marked, will resend");
                    return false;
                }
                self.audit
                    .record_action(
                        AuditEventType::AlertSent,
                        "system",
                        &event.original_recommendation_id.to_string(),
                        "alert",
                        "ok",
                    )
                    .await;
                true
            }
            Err(err) => {
                warn!(error = %err, "rollback alert failed, will retry next scan");
                false
            }
        }
    }

    /// Alerts that previous passes could not deliver.
    async fn retry_unsent_alerts(&self) -> usize {
        if self.alerter.is_none() {
            return 0;
        }
        let events = match self.repository.list_unsent_alert_events().await {
            Ok(events) => events,
            Err(err) => {
                warn!(error = %err, "could not list unsent alerts");
                return 0;
            }
        };

        let mut sent = 0usize;
        for event in events {
            if self.send_alert(&event).await {
                sent += 1;
            }
        }
        sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use shared_types::{OutcomeStatus, ResourceSpec, TargetRef};

    fn outcome(oom_delta: i64, throttle_before: f64, throttle_after: f64) -> Outcome {
        Outcome {
            applied_at: Utc::now() - Duration::minutes(10),
            check_time: Utc::now(),
            oom_kills_before: 1,
            oom_kills_after: 1 + oom_delta,
            cpu_throttle_before: throttle_before,
            cpu_throttle_after: throttle_after,
            mem_usage_p95_before: 0,
            mem_usage_p95_after: 0,
            cpu_usage_p95_before: 0.0,
            cpu_usage_p95_after: 0.0,
            status: OutcomeStatus::Degraded,
            rollback_triggered: false,
            rollback_recommendation_id: None,
        }
    }

    #[test]
    fn oom_delta_at_threshold_triggers() {
        assert_eq!(
            classify_trigger(&outcome(1, 0.0, 0.0), 1, 0.25),
            Some(RollbackReason::OomIncrease)
        );
        assert_eq!(classify_trigger(&outcome(0, 0.0, 0.0), 1, 0.25), None);
    }

    #[test]
    fn throttle_increase_at_exactly_threshold_triggers() {
        // 0.25 -> 0.3125 is exactly a 25% increase (both exact in binary,
        // so the boundary comparison is not at the mercy of rounding).
        assert_eq!(
            classify_trigger(&outcome(0, 0.25, 0.3125), 1, 0.25),
            Some(RollbackReason::ThrottleIncrease)
        );
        // 24.96%: just below, no trigger.
        assert_eq!(classify_trigger(&outcome(0, 0.25, 0.3124), 1, 0.25), None);
    }

    #[test]
    fn oom_takes_precedence_over_throttle() {
        assert_eq!(
            classify_trigger(&outcome(2, 0.10, 0.20), 1, 0.25),
            Some(RollbackReason::OomIncrease)
        );
    }

    #[test]
    fn zero_baseline_throttle_counts_as_unbounded_increase() {
        assert_eq!(
            classify_trigger(&outcome(0, 0.0, 0.06), 1, 0.25),
            Some(RollbackReason::ThrottleIncrease)
        );
    }

    #[test]
    fn rollback_recommendation_mirrors_previous_resources() {
        let previous = ResourceSpec {
            cpu_request_millicores: Some(500),
            cpu_limit_millicores: Some(1000),
            memory_request_bytes: Some(512 * 1024 * 1024),
            memory_limit_bytes: Some(1024 * 1024 * 1024),
        };
        let now = Utc::now();
        let original = Recommendation {
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
            current: ResourceSpec::default(),
            previous_resources: Some(previous),
            confidence: 0.9,
            model_version: "v2".to_string(),
            time_window: TimeWindow::Peak,
            generated_at: now,
            auto_apply: true,
            requires_approval: false,
            risk_level: RiskLevel::Low,
            phase: Phase::Applied,
            message: String::new(),
            generated_patch: String::new(),
            applied_at: Some(now),
            applied_by: Some("system".to_string()),
            approved_at: None,
            approved_by: None,
            last_updated: now,
            conditions: Vec::new(),
            outcome: None,
            dry_run_result: None,
        };

        let rb = build_rollback_recommendation(&original).expect("rollback recommendation");
        assert_eq!(rb.proposed, previous);
        assert_eq!(rb.current, original.proposed);
        assert_eq!(rb.time_window, TimeWindow::Rollback);
        assert_eq!(rb.model_version, "rollback");
        assert!((rb.confidence - 1.0).abs() < f64::EPSILON);
        assert!(rb.auto_apply);
        assert!(!rb.requires_approval);
        assert!(rb.name.starts_with("checkout-peak-rollback-"));

        let mut no_previous = original.clone();
        no_previous.previous_resources = None;
        assert!(build_rollback_recommendation(&no_previous).is_none());
    }
}
