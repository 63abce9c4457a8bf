//! The recommendation state machine: phase transitions, invariants, and
//! idempotent reconcile. The repository is the authoritative store; the
//! engine keeps an in-memory read cache behind an RwLock and serializes all
//! mutating operations per `(namespace, name)` with a keyed mutex, so the
//! final persisted state always equals some sequential ordering of the
//! concurrent operations.

use crate::capabilities::Applier;
use crate::errors::{EngineError, EngineResult};
use crate::patch;
use crate::repository::{Repository, RollbackUnit};
use chrono::Utc;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use platform::metrics::{incr, names, observe_seconds};
use platform::{AuditEventType, AuditLog};
use shared_types::{
    set_condition, Condition, ConditionStatus, ConditionType, EngineSettings, Outcome,
    OutcomeStatus, Phase, Recommendation, RiskLevel, RollbackEvent, RollbackReason,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock, Semaphore};
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Actor recorded for transitions driven by background loops and auto-apply.
pub const SYSTEM_ACTOR: &str = "system";

/// Global cap on in-flight applies across all recommendations.
static APPLY_CONCURRENCY: Lazy<Semaphore> = Lazy::new(|| Semaphore::new(8));

pub struct LifecycleEngine {
    repository: Repository,
    applier: Arc<dyn Applier>,
    settings: EngineSettings,
    audit: AuditLog,
    locks: DashMap<String, Arc<Mutex<()>>>,
    cache: RwLock<HashMap<String, Recommendation>>,
}

fn cache_key(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

fn condition(ctype: ConditionType, status: ConditionStatus, reason: &str, message: &str) -> Condition {
    Condition {
        condition_type: ctype,
        status,
        reason: reason.to_string(),
        message: message.to_string(),
        last_transition_time: Utc::now(),
    }
}

impl LifecycleEngine {
    pub fn new(
        repository: Repository,
        applier: Arc<dyn Applier>,
        settings: EngineSettings,
        audit: AuditLog,
    ) -> Self {
        Self {
            repository,
            applier,
            settings,
            audit,
            locks: DashMap::new(),
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn repository(&self) -> &Repository {
        &self.repository
    }

    /// Serialize operations for one recommendation. The guard is held across
    /// the operation's repository and applier calls.
    pub(crate) async fn lock_key(&self, namespace: &str, name: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(cache_key(namespace, name))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    pub(crate) async fn cache_store(&self, rec: &Recommendation) {
        self.cache
            .write()
            .await
            .insert(cache_key(&rec.namespace, &rec.name), rec.clone());
    }

    async fn cache_remove(&self, namespace: &str, name: &str) {
        self.cache.write().await.remove(&cache_key(namespace, name));
    }

    /// Authoritative load, used by mutating operations under the key lock.
    async fn load(&self, namespace: &str, name: &str) -> EngineResult<Recommendation> {
        self.repository
            .get_recommendation(namespace, name)
            .await?
            .ok_or_else(|| EngineError::NotFound {
                namespace: namespace.to_string(),
                name: name.to_string(),
            })
    }

    async fn persist(&self, rec: &Recommendation) -> EngineResult<()> {
        self.repository.store_recommendation(rec).await?;
        self.cache_store(rec).await;
        Ok(())
    }

    /// Register a new recommendation. Fails when `(namespace, name)` exists.
    pub async fn create(&self, mut rec: Recommendation) -> EngineResult<Recommendation> {
        let _guard = self.lock_key(&rec.namespace, &rec.name).await;

        if self
            .repository
            .get_recommendation(&rec.namespace, &rec.name)
            .await?
            .is_some()
        {
            return Err(EngineError::AlreadyExists {
                namespace: rec.namespace,
                name: rec.name,
            });
        }

        if rec.generated_patch.is_empty() {
            rec.generated_patch = patch::strategic_merge_yaml(&rec.target, &rec.proposed);
        }
        rec.last_updated = Utc::now();

        self.repository.create_recommendation(&rec).await?;
        self.cache_store(&rec).await;
        incr(names::RECOMMENDATIONS_CREATED);
        self.audit
            .record_action(
                AuditEventType::Created,
                SYSTEM_ACTOR,
                &cache_key(&rec.namespace, &rec.name),
                "create",
                "ok",
            )
            .await;

        Ok(rec)
    }

    /// Cached read; falls back to the repository on a miss.
    pub async fn get(&self, namespace: &str, name: &str) -> EngineResult<Recommendation> {
        if let Some(rec) = self.cache.read().await.get(&cache_key(namespace, name)) {
            return Ok(rec.clone());
        }

        let rec = self.load(namespace, name).await?;
        self.cache_store(&rec).await;
        Ok(rec)
    }

    pub async fn list(&self, namespace: Option<&str>) -> EngineResult<Vec<Recommendation>> {
        let recs = self.repository.list_recommendations(namespace).await?;
        let mut cache = self.cache.write().await;
        for rec in &recs {
            cache.insert(cache_key(&rec.namespace, &rec.name), rec.clone());
        }
        Ok(recs)
    }

    pub async fn delete(&self, namespace: &str, name: &str) -> EngineResult<bool> {
        let _guard = self.lock_key(namespace, name).await;
        let deleted = self.repository.delete_recommendation(namespace, name).await?;
        self.cache_remove(namespace, name).await;
        self.locks.remove(&cache_key(namespace, name));
        Ok(deleted)
    }

    /// Drive one recommendation forward. Safe to call repeatedly: every arm
    /// converges to the same state for the same inputs.
    pub async fn reconcile(&self, namespace: &str, name: &str) -> EngineResult<Recommendation> {
        let _guard = self.lock_key(namespace, name).await;
        let rec = self.load(namespace, name).await?;

        match rec.phase {
            Phase::Pending => self.reconcile_pending(rec).await,
            Phase::Approved => self.apply_locked(rec).await,
            Phase::Applied => self.reconcile_applied(rec).await,
            phase => {
                debug!(
                    namespace = %namespace,
                    name = %name,
                    phase = %phase,
                    "reconcile on terminal phase is a no-op"
                );
                Ok(rec)
            }
        }
    }

    async fn reconcile_pending(&self, mut rec: Recommendation) -> EngineResult<Recommendation> {
        if rec.generated_patch.is_empty() {
            // Computed once here if creation missed it, stable afterwards.
            rec.generated_patch = patch::strategic_merge_yaml(&rec.target, &rec.proposed);
        }

        // High risk always requires a human, whatever the caller set, and
        // it is checked before auto-apply so a high-risk recommendation can
        // never slip through the automatic path.
        if rec.risk_level == RiskLevel::High {
            rec.requires_approval = true;
            set_condition(
                &mut rec.conditions,
                condition(
                    ConditionType::Approved,
                    ConditionStatus::False,
                    "HighRisk",
                    "high-risk recommendation requires manual approval",
                ),
            );
            rec.message = "awaiting manual approval (high risk)".to_string();
            rec.last_updated = Utc::now();
            self.persist(&rec).await?;
            return Ok(rec);
        }

        if rec.auto_apply && !rec.requires_approval {
            rec.phase = Phase::Approved;
            if rec.approved_at.is_none() {
                rec.approved_at = Some(Utc::now());
            }
            rec.approved_by = Some(SYSTEM_ACTOR.to_string());
            set_condition(
                &mut rec.conditions,
                condition(
                    ConditionType::Approved,
                    ConditionStatus::True,
                    "Approved",
                    "auto-approved",
                ),
            );
            rec.message = "auto-approved".to_string();
            rec.last_updated = Utc::now();
            self.persist(&rec).await?;
            return self.apply_locked(rec).await;
        }

        rec.message = "awaiting approval".to_string();
        rec.last_updated = Utc::now();
        self.persist(&rec).await?;
        Ok(rec)
    }

    /// Approve and synchronously drive the apply.
    pub async fn approve(
        &self,
        namespace: &str,
        name: &str,
        approver: &str,
    ) -> EngineResult<Recommendation> {
        let _guard = self.lock_key(namespace, name).await;
        let mut rec = self.load(namespace, name).await?;

        if rec.phase != Phase::Pending {
            return Err(EngineError::InvalidTransition {
                from: rec.phase,
                operation: "approve",
            });
        }

        rec.phase = Phase::Approved;
        rec.approved_at = Some(Utc::now());
        rec.approved_by = Some(approver.to_string());
        set_condition(
            &mut rec.conditions,
            condition(
                ConditionType::Approved,
                ConditionStatus::True,
                "Approved",
                &format!("approved by {approver}"),
            ),
        );
        rec.message = format!("approved by {approver}");
        rec.last_updated = Utc::now();
        self.persist(&rec).await?;
        self.audit
            .record_action(
                AuditEventType::Approval,
                approver,
                &cache_key(namespace, name),
                "approve",
                "ok",
            )
            .await;

        self.apply_locked(rec).await
    }

    /// Terminal rejection, only from Pending.
    pub async fn reject(
        &self,
        namespace: &str,
        name: &str,
        reason: &str,
    ) -> EngineResult<Recommendation> {
        let _guard = self.lock_key(namespace, name).await;
        let mut rec = self.load(namespace, name).await?;

        if rec.phase != Phase::Pending {
            return Err(EngineError::InvalidTransition {
                from: rec.phase,
                operation: "reject",
            });
        }

        rec.phase = Phase::Rejected;
        set_condition(
            &mut rec.conditions,
            condition(ConditionType::Approved, ConditionStatus::False, "Rejected", reason),
        );
        rec.message = reason.to_string();
        rec.last_updated = Utc::now();
        self.persist(&rec).await?;
        incr(names::REJECTIONS);
        self.audit
            .record_action(
                AuditEventType::Rejection,
                SYSTEM_ACTOR,
                &cache_key(namespace, name),
                "reject",
                "ok",
            )
            .await;

        Ok(rec)
    }

    /// Replace the outcome of an applied recommendation.
    pub async fn update_outcome(
        &self,
        namespace: &str,
        name: &str,
        mut outcome: Outcome,
    ) -> EngineResult<Recommendation> {
        let _guard = self.lock_key(namespace, name).await;
        let mut rec = self.load(namespace, name).await?;

        if rec.phase != Phase::Applied {
            return Err(EngineError::InvalidTransition {
                from: rec.phase,
                operation: "update_outcome",
            });
        }

        // The outcome mirrors the recommendation's own apply timestamp.
        if let Some(applied_at) = rec.applied_at {
            outcome.applied_at = applied_at;
        }

        self.repository.upsert_outcome(rec.id, &outcome).await?;
        rec.outcome = Some(outcome);
        rec.last_updated = Utc::now();
        self.persist(&rec).await?;
        self.audit
            .record_action(
                AuditEventType::OutcomeRecorded,
                SYSTEM_ACTOR,
                &cache_key(namespace, name),
                "update_outcome",
                "ok",
            )
            .await;

        Ok(rec)
    }

    /// Manual rollback entry point, only from Applied.
    pub async fn rollback(
        &self,
        namespace: &str,
        name: &str,
        reason: &str,
        actor: &str,
    ) -> EngineResult<Recommendation> {
        let _guard = self.lock_key(namespace, name).await;
        let rec = self.load(namespace, name).await?;

        if rec.phase != Phase::Applied {
            return Err(EngineError::InvalidTransition {
                from: rec.phase,
                operation: "rollback",
            });
        }

        self.rollback_locked(rec, reason, RollbackReason::Manual, false, actor)
            .await
    }

    /// Apply the generated patch of an approved recommendation. A failure
    /// reported by the applier is the one error that moves the machine: the
    /// recommendation lands in Failed. An engine-side deadline leaves the
    /// phase untouched so a later reconcile can retry.
    async fn apply_locked(&self, mut rec: Recommendation) -> EngineResult<Recommendation> {
        if rec.generated_patch.is_empty() {
            rec.generated_patch = patch::strategic_merge_yaml(&rec.target, &rec.proposed);
        }

        // Capture the rollback target exactly once, before any apply attempt.
        if rec.previous_resources.is_none() {
            rec.previous_resources = Some(rec.current);
        }
        rec.message = "applying".to_string();
        rec.last_updated = Utc::now();
        self.persist(&rec).await?;

        let result = {
            let _permit = APPLY_CONCURRENCY
                .acquire()
                .await
                .expect("apply concurrency semaphore closed");

            let started = Instant::now();
            let apply = self
                .applier
                .apply(&rec.namespace, &rec.target, &rec.generated_patch);
            let result = match timeout(
                Duration::from_secs(self.settings.apply_timeout_secs),
                apply,
            )
            .await
            {
                Ok(result) => result,
                Err(_) => {
                    incr(names::APPLY_TIMEOUTS);
                    return Err(EngineError::DeadlineExceeded(self.settings.apply_timeout_secs));
                }
            };
            observe_seconds(names::APPLY_DURATION_SECONDS, started.elapsed().as_secs_f64());
            result
        };

        match result {
            Ok(()) => {
                rec.phase = Phase::Applied;
                if rec.applied_at.is_none() {
                    rec.applied_at = Some(Utc::now());
                }
                rec.applied_by = Some(
                    rec.approved_by
                        .clone()
                        .unwrap_or_else(|| SYSTEM_ACTOR.to_string()),
                );
                set_condition(
                    &mut rec.conditions,
                    condition(
                        ConditionType::Applied,
                        ConditionStatus::True,
                        "Applied",
                        "resource patch applied",
                    ),
                );
                rec.message = "applied".to_string();
                rec.last_updated = Utc::now();
                self.persist(&rec).await?;
                incr(names::APPLIES);
                self.audit
                    .record_action(
                        AuditEventType::Apply,
                        rec.applied_by.as_deref().unwrap_or(SYSTEM_ACTOR),
                        &cache_key(&rec.namespace, &rec.name),
                        "apply",
                        "ok",
                    )
                    .await;
                Ok(rec)
            }
            Err(err) => {
                rec.phase = Phase::Failed;
                set_condition(
                    &mut rec.conditions,
                    condition(
                        ConditionType::Ready,
                        ConditionStatus::False,
                        "Failed",
                        &err.to_string(),
                    ),
                );
                rec.message = format!("apply failed: {err}");
                rec.last_updated = Utc::now();
                self.persist(&rec).await?;
                incr(names::APPLY_FAILURES);
                self.audit
                    .record_action(
                        AuditEventType::Apply,
                        SYSTEM_ACTOR,
                        &cache_key(&rec.namespace, &rec.name),
                        "apply",
                        "failed",
                    )
                    .await;
                Err(EngineError::ApplyFailed(err.to_string()))
            }
        }
    }

    /// Reconcile an applied recommendation against its observed outcome.
    async fn reconcile_applied(&self, mut rec: Recommendation) -> EngineResult<Recommendation> {
        let Some(outcome) = rec.outcome.clone() else {
            return Ok(rec);
        };

        if outcome.oom_kill_delta() > 0 {
            if self.settings.auto_rollback_enabled {
                return self
                    .rollback_locked(
                        rec,
                        "Auto-rollback due to OOM kills",
                        RollbackReason::OomIncrease,
                        true,
                        SYSTEM_ACTOR,
                    )
                    .await;
            }
            warn!(
                namespace = %rec.namespace,
                name = %rec.name,
                oom_kills = outcome.oom_kill_delta(),
                "OOM kills observed but auto-rollback is disabled"
            );
            return Ok(rec);
        }

        let throttle_pct = outcome.throttle_increase_percent();
        if throttle_pct > self.settings.throttle_warn_percent {
            // Warning only; rollback on throttle is the controller's call,
            // at its own (separate) threshold.
            warn!(
                namespace = %rec.namespace,
                name = %rec.name,
                throttle_increase_percent = throttle_pct,
                "cpu throttle increase past warning threshold"
            );
        }

        set_condition(
            &mut rec.conditions,
            condition(
                ConditionType::Healthy,
                ConditionStatus::True,
                "NoOomKills",
                "no OOM kills observed since apply",
            ),
        );
        rec.last_updated = Utc::now();
        self.persist(&rec).await?;
        Ok(rec)
    }

    /// Shared rollback body: applies the previous resources and commits the
    /// transactional unit (phase flip, outcome marking, audit event).
    async fn rollback_locked(
        &self,
        mut rec: Recommendation,
        reason_text: &str,
        reason: RollbackReason,
        auto_triggered: bool,
        actor: &str,
    ) -> EngineResult<Recommendation> {
        let Some(previous) = rec.previous_resources else {
            return Err(EngineError::PreconditionMissing {
                namespace: rec.namespace,
                name: rec.name,
            });
        };

        let patch_yaml = patch::strategic_merge_yaml(&rec.target, &previous);
        let result = {
            let _permit = APPLY_CONCURRENCY
                .acquire()
                .await
                .expect("apply concurrency semaphore closed");

            let apply = self.applier.apply(&rec.namespace, &rec.target, &patch_yaml);
            match timeout(
                Duration::from_secs(self.settings.apply_timeout_secs),
                apply,
            )
            .await
            {
                Ok(result) => result,
                Err(_) => {
                    return Err(EngineError::DeadlineExceeded(self.settings.apply_timeout_secs))
                }
            }
        };

        if let Err(err) = result {
            rec.phase = Phase::Failed;
            set_condition(
                &mut rec.conditions,
                condition(
                    ConditionType::Ready,
                    ConditionStatus::False,
                    "Failed",
                    &err.to_string(),
                ),
            );
            rec.message = format!("rollback apply failed: {err}");
            rec.last_updated = Utc::now();
            self.persist(&rec).await?;
            incr(names::APPLY_FAILURES);
            return Err(EngineError::ApplyFailed(err.to_string()));
        }

        rec.phase = Phase::RolledBack;
        set_condition(
            &mut rec.conditions,
            condition(
                ConditionType::Applied,
                ConditionStatus::False,
                "RolledBack",
                reason_text,
            ),
        );
        rec.message = reason_text.to_string();
        rec.last_updated = Utc::now();

        let (oom_detected, throttle_pct) = rec
            .outcome
            .as_ref()
            .map(|o| (o.oom_kill_delta(), o.throttle_increase_percent()))
            .unwrap_or((0, 0.0));
        if let Some(outcome) = rec.outcome.as_mut() {
            outcome.status = OutcomeStatus::RolledBack;
            outcome.rollback_triggered = true;
        }

        let event = RollbackEvent {
            id: Uuid::new_v4(),
            original_recommendation_id: rec.id,
            rollback_recommendation_id: None,
            reason,
            oom_kills_detected: oom_detected,
            throttle_increase_percent: throttle_pct,
            auto_triggered,
            created_at: Utc::now(),
            alert_sent: false,
            alert_sent_at: None,
        };

        self.repository
            .commit_rollback(RollbackUnit {
                original: rec.clone(),
                rollback_recommendation: None,
                event,
            })
            .await?;
        self.cache_store(&rec).await;
        incr(names::ROLLBACKS);
        self.audit
            .record_action(
                AuditEventType::Rollback,
                actor,
                &cache_key(&rec.namespace, &rec.name),
                "rollback",
                "ok",
            )
            .await;
        info!(
            namespace = %rec.namespace,
            name = %rec.name,
            reason = %reason_text,
            "recommendation rolled back"
        );

        Ok(rec)
    }
}
