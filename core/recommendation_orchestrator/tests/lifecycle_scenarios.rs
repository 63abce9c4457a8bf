//! End-to-end lifecycle scenarios driven through the public engine API with
//! in-memory capability fakes and a temp-file SQLite store.

use async_trait::async_trait;
use chrono::Utc;
use platform::AuditLog;
use recommendation_orchestrator::capabilities::{Applier, ApplyError};
use recommendation_orchestrator::dry_run::DryRunEvaluator;
use recommendation_orchestrator::{EngineError, LifecycleEngine, Repository};
use shared_types::{
    Condition, ConditionStatus, ConditionType, EngineSettings, Outcome, OutcomeStatus, Phase,
    Recommendation, ResourceSpec, RiskLevel, TargetRef, TimeWindow,
};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use uuid::Uuid;

struct RecordingApplier {
    patches: Mutex<Vec<String>>,
}

impl RecordingApplier {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            patches: Mutex::new(Vec::new()),
        })
    }

    fn invocations(&self) -> usize {
        self.patches.lock().unwrap().len()
    }

    fn last_patch(&self) -> Option<String> {
        self.patches.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl Applier for RecordingApplier {
    async fn apply(
        &self,
        _namespace: &str,
        _target: &TargetRef,
        patch_yaml: &str,
    ) -> Result<(), ApplyError> {
        self.patches.lock().unwrap().push(patch_yaml.to_string());
        Ok(())
    }
}

async fn engine(applier: Arc<RecordingApplier>) -> (TempDir, Arc<LifecycleEngine>) {
    let dir = TempDir::new().expect("temp dir");
    let path = dir.path().join("recommendations.db");
    let repository = Repository::new(path.to_str().expect("utf8 path")).expect("pool");
    repository.init_schema().await.expect("schema");
    let engine = Arc::new(LifecycleEngine::new(
        repository,
        applier,
        EngineSettings::default(),
        AuditLog::new(),
    ));
    (dir, engine)
}

fn recommendation(
    name: &str,
    auto_apply: bool,
    requires_approval: bool,
    risk_level: RiskLevel,
) -> Recommendation {
    let now = Utc::now();
    Recommendation {
        id: Uuid::new_v4(),
        namespace: "payments".to_string(),
        name: name.to_string(),
        deployment: "checkout".to_string(),
        target: TargetRef {
            kind: "Deployment".to_string(),
            api_version: "apps/v1".to_string(),
            name: "checkout".to_string(),
            container_name: None,
        },
        proposed: ResourceSpec {
            cpu_request_millicores: Some(250),
            cpu_limit_millicores: Some(500),
            memory_request_bytes: Some(256 * 1024 * 1024),
            memory_limit_bytes: Some(512 * 1024 * 1024),
        },
        current: ResourceSpec {
            cpu_request_millicores: Some(500),
            cpu_limit_millicores: Some(1000),
            memory_request_bytes: Some(512 * 1024 * 1024),
            memory_limit_bytes: Some(1024 * 1024 * 1024),
        },
        previous_resources: None,
        confidence: 0.9,
        model_version: "v2".to_string(),
        time_window: TimeWindow::Peak,
        generated_at: now,
        auto_apply,
        requires_approval,
        risk_level,
        phase: Phase::Pending,
        message: String::new(),
        generated_patch: String::new(),
        applied_at: None,
        applied_by: None,
        approved_at: None,
        approved_by: None,
        last_updated: now,
        conditions: Vec::new(),
        outcome: None,
        dry_run_result: None,
    }
}

fn find_condition(rec: &Recommendation, ctype: ConditionType) -> Option<&Condition> {
    rec.conditions.iter().find(|c| c.condition_type == ctype)
}

fn outcome_with_oom_kills(oom_kills: i64) -> Outcome {
    Outcome {
        applied_at: Utc::now(),
        check_time: Utc::now(),
        oom_kills_before: 0,
        oom_kills_after: oom_kills,
        cpu_throttle_before: 0.0,
        cpu_throttle_after: 0.0,
        mem_usage_p95_before: 400 * 1024 * 1024,
        mem_usage_p95_after: 420 * 1024 * 1024,
        cpu_usage_p95_before: 0.4,
        cpu_usage_p95_after: 0.4,
        status: OutcomeStatus::Monitoring,
        rollback_triggered: false,
        rollback_recommendation_id: None,
    }
}

#[tokio::test]
async fn auto_apply_happy_path() {
    let applier = RecordingApplier::new();
    let (_dir, engine) = engine(applier.clone()).await;

    engine
        .create(recommendation("checkout-peak", true, false, RiskLevel::Low))
        .await
        .expect("create");
    let rec = engine
        .reconcile("payments", "checkout-peak")
        .await
        .expect("reconcile");

    assert_eq!(rec.phase, Phase::Applied);
    assert!(rec.applied_at.is_some());
    let applied = find_condition(&rec, ConditionType::Applied).expect("Applied condition");
    assert_eq!(applied.status, ConditionStatus::True);
    assert_eq!(applier.invocations(), 1);

    // Previous resources were captured from current at apply time.
    assert_eq!(rec.previous_resources, Some(rec.current));
}

#[tokio::test]
async fn reconcile_is_idempotent_after_apply() {
    let applier = RecordingApplier::new();
    let (_dir, engine) = engine(applier.clone()).await;

    engine
        .create(recommendation("checkout-peak", true, false, RiskLevel::Low))
        .await
        .expect("create");
    let first = engine
        .reconcile("payments", "checkout-peak")
        .await
        .expect("first reconcile");
    let second = engine
        .reconcile("payments", "checkout-peak")
        .await
        .expect("second reconcile");

    assert_eq!(first.phase, Phase::Applied);
    assert_eq!(second.phase, Phase::Applied);
    assert_eq!(first.applied_at, second.applied_at);
    assert_eq!(first.generated_patch, second.generated_patch);
    // The applier ran exactly once across both drives.
    assert_eq!(applier.invocations(), 1);
}

#[tokio::test]
async fn high_risk_gate_forces_approval() {
    let applier = RecordingApplier::new();
    let (_dir, engine) = engine(applier.clone()).await;

    engine
        .create(recommendation("checkout-peak", true, false, RiskLevel::High))
        .await
        .expect("create");
    let rec = engine
        .reconcile("payments", "checkout-peak")
        .await
        .expect("reconcile");

    assert_eq!(rec.phase, Phase::Pending);
    assert!(rec.requires_approval);
    let approved = find_condition(&rec, ConditionType::Approved).expect("Approved condition");
    assert_eq!(approved.status, ConditionStatus::False);
    assert_eq!(approved.reason, "HighRisk");
    assert_eq!(applier.invocations(), 0);
}

#[tokio::test]
async fn approval_chains_into_apply() {
    let applier = RecordingApplier::new();
    let (_dir, engine) = engine(applier.clone()).await;

    engine
        .create(recommendation("checkout-peak", false, true, RiskLevel::Medium))
        .await
        .expect("create");
    let rec = engine
        .approve("payments", "checkout-peak", "alice")
        .await
        .expect("approve");

    assert_eq!(rec.phase, Phase::Applied);
    assert_eq!(rec.approved_by.as_deref(), Some("alice"));
    assert!(rec.approved_at.is_some());
    assert_eq!(rec.applied_by.as_deref(), Some("alice"));

    let approved = find_condition(&rec, ConditionType::Approved).expect("Approved condition");
    assert_eq!(approved.status, ConditionStatus::True);
    let applied = find_condition(&rec, ConditionType::Applied).expect("Applied condition");
    assert_eq!(applied.status, ConditionStatus::True);
    assert_eq!(applier.invocations(), 1);
}

#[tokio::test]
async fn oom_outcome_drives_auto_rollback() {
    let applier = RecordingApplier::new();
    let (_dir, engine) = engine(applier.clone()).await;

    engine
        .create(recommendation("checkout-peak", true, false, RiskLevel::Low))
        .await
        .expect("create");
    engine
        .reconcile("payments", "checkout-peak")
        .await
        .expect("apply");
    engine
        .update_outcome("payments", "checkout-peak", outcome_with_oom_kills(2))
        .await
        .expect("outcome");

    let rec = engine
        .reconcile("payments", "checkout-peak")
        .await
        .expect("rollback reconcile");

    assert_eq!(rec.phase, Phase::RolledBack);
    let applied = find_condition(&rec, ConditionType::Applied).expect("Applied condition");
    assert_eq!(applied.status, ConditionStatus::False);
    assert_eq!(applied.reason, "RolledBack");

    // Invariant: applied_at survives the rollback.
    assert!(rec.applied_at.is_some());

    // Second apply call carried the previous (pre-apply) resource values.
    assert_eq!(applier.invocations(), 2);
    let rollback_patch = applier.last_patch().expect("rollback patch");
    assert!(rollback_patch.contains("500m"), "rollback patch should restore the previous cpu request: {rollback_patch}");
    assert!(rollback_patch.contains("1Gi"), "rollback patch should restore the previous memory limit: {rollback_patch}");

    // The outcome is marked rolled back and the trail has the event.
    let outcome = rec.outcome.expect("outcome");
    assert_eq!(outcome.status, OutcomeStatus::RolledBack);
    assert!(outcome.rollback_triggered);

    // Terminal from here: further reconciles and approvals refuse.
    let again = engine
        .reconcile("payments", "checkout-peak")
        .await
        .expect("terminal reconcile");
    assert_eq!(again.phase, Phase::RolledBack);
    assert_eq!(applier.invocations(), 2);

    let err = engine
        .approve("payments", "checkout-peak", "alice")
        .await
        .expect_err("terminal");
    assert!(matches!(err, EngineError::InvalidTransition { .. }));
}

#[tokio::test]
async fn throttle_increase_warns_but_does_not_rollback_in_reconcile() {
    let applier = RecordingApplier::new();
    let (_dir, engine) = engine(applier.clone()).await;

    engine
        .create(recommendation("checkout-peak", true, false, RiskLevel::Low))
        .await
        .expect("create");
    engine
        .reconcile("payments", "checkout-peak")
        .await
        .expect("apply");

    // 40% throttle increase, no OOM kills: past the warn threshold but
    // rollback is the controller's call, not reconcile's.
    let mut outcome = outcome_with_oom_kills(0);
    outcome.cpu_throttle_before = 0.10;
    outcome.cpu_throttle_after = 0.14;
    engine
        .update_outcome("payments", "checkout-peak", outcome)
        .await
        .expect("outcome");

    let rec = engine
        .reconcile("payments", "checkout-peak")
        .await
        .expect("reconcile");
    assert_eq!(rec.phase, Phase::Applied);
    assert_eq!(applier.invocations(), 1);
    let healthy = find_condition(&rec, ConditionType::Healthy).expect("Healthy condition");
    assert_eq!(healthy.status, ConditionStatus::True);
}

#[tokio::test]
async fn manual_rollback_only_from_applied() {
    let applier = RecordingApplier::new();
    let (_dir, engine) = engine(applier.clone()).await;

    engine
        .create(recommendation("checkout-peak", false, true, RiskLevel::Low))
        .await
        .expect("create");

    let err = engine
        .rollback("payments", "checkout-peak", "operator request", "alice")
        .await
        .expect_err("pending cannot roll back");
    assert!(matches!(
        err,
        EngineError::InvalidTransition {
            from: Phase::Pending,
            operation: "rollback"
        }
    ));

    engine
        .approve("payments", "checkout-peak", "alice")
        .await
        .expect("approve");
    let rec = engine
        .rollback("payments", "checkout-peak", "operator request", "alice")
        .await
        .expect("manual rollback");
    assert_eq!(rec.phase, Phase::RolledBack);
    assert_eq!(rec.message, "operator request");
}

#[tokio::test]
async fn dry_run_is_inert() {
    let applier = RecordingApplier::new();
    let (_dir, engine) = engine(applier.clone()).await;

    let created = engine
        .create(recommendation("checkout-peak", false, true, RiskLevel::Low))
        .await
        .expect("create");

    let evaluator = DryRunEvaluator::new(engine.repository().clone(), AuditLog::new());
    let result = evaluator
        .evaluate_and_store("payments", "checkout-peak")
        .await
        .expect("dry run");

    // Every differing field shows up: all four halve.
    assert_eq!(result.changes.len(), 4);
    assert!(result.changes.iter().all(|c| c.is_reduction));
    assert!(result.would_apply);
    assert_eq!(result.yaml_patch, created.generated_patch);

    // Zero state transitions on the recommendation itself.
    let after = engine
        .repository()
        .get_recommendation("payments", "checkout-peak")
        .await
        .expect("get")
        .expect("present");
    assert_eq!(after.phase, Phase::Pending);
    assert_eq!(after.last_updated, created.last_updated);
    assert!(after.conditions.is_empty());
    assert!(after.applied_at.is_none());
    assert_eq!(applier.invocations(), 0);

    // The computed result is persisted alongside for later inspection.
    let stored = after.dry_run_result.expect("stored dry-run result");
    assert_eq!(stored.changes, result.changes);
    assert_eq!(stored.yaml_patch, result.yaml_patch);
}

#[tokio::test]
async fn generated_patch_is_pure_and_stable() {
    let applier = RecordingApplier::new();
    let (_dir, engine) = engine(applier.clone()).await;

    let a = engine
        .create(recommendation("checkout-peak", false, true, RiskLevel::Low))
        .await
        .expect("create a");
    let b = engine
        .create(recommendation("checkout-offpeak", false, true, RiskLevel::Low))
        .await
        .expect("create b");

    // Identical inputs (same target and proposal) render byte-equal patches.
    assert_eq!(a.generated_patch, b.generated_patch);

    // The patch never changes across later transitions.
    let rec = engine
        .approve("payments", "checkout-peak", "alice")
        .await
        .expect("approve");
    assert_eq!(rec.generated_patch, a.generated_patch);
}
