//! Durable store for recommendations, outcomes, rollback events, and cost
//! snapshots, backed by SQLite through an r2d2 connection pool. Every public
//! method hops onto the blocking pool; callers treat each as a suspension
//! point.

use crate::errors::{EngineError, EngineResult};
use chrono::{DateTime, Utc};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use serde::de::DeserializeOwned;
use serde::Serialize;
use shared_types::{
    CostSnapshot, Outcome, OutcomeStatus, Phase, Recommendation, RecommendationId, ResourceSpec,
    RiskLevel, RollbackEvent, RollbackEventId, TargetRef, TimeWindow,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::task;
use tracing::warn;
use uuid::Uuid;

type DbPool = r2d2::Pool<SqliteConnectionManager>;

const REC_COLUMNS: &str = "id, namespace, name, deployment, target_kind, target_api_version, \
     target_container, proposed_cpu_request, proposed_cpu_limit, proposed_memory_request, \
     proposed_memory_limit, current_cpu_request, current_cpu_limit, current_memory_request, \
     current_memory_limit, previous_resources, confidence, model_version, time_window, \
     generated_at, auto_apply, requires_approval, risk_level, phase, message, generated_patch, \
     applied_at, applied_by, approved_at, approved_by, last_updated, conditions, dry_run_result";

/// The four writes of one rollback decision, committed atomically.
pub struct RollbackUnit {
    /// The original recommendation, already carrying its rolled-back state.
    pub original: Recommendation,
    /// Controller-created rollback recommendation, when one exists.
    pub rollback_recommendation: Option<Recommendation>,
    pub event: RollbackEvent,
}

#[derive(Clone)]
pub struct Repository {
    pool: Arc<DbPool>,
}

fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn opt_ts(dt: &Option<DateTime<Utc>>) -> Option<String> {
    dt.as_ref().map(ts)
}

fn parse_ts(s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn parse_opt_ts(s: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    s.map(|v| parse_ts(&v)).transpose()
}

fn json_col<T: Serialize>(value: &T) -> rusqlite::Result<String> {
    serde_json::to_string(value)
        .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))
}

fn parse_json<T: DeserializeOwned>(s: &str) -> rusqlite::Result<T> {
    serde_json::from_str(s).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn parse_uuid(s: &str) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

/// Phase column decoding. Empty means Pending; an unknown non-empty value is
/// treated as Failed (terminal), so a corrupted row can never re-enter the
/// apply path.
fn parse_phase(s: &str) -> Phase {
    if s.is_empty() {
        return Phase::Pending;
    }
    match s {
        "pending" | "approved" | "applied" | "rolled_back" | "failed" | "rejected" => {
            Phase::parse_or_pending(s)
        }
        other => {
            warn!(phase = %other, "unknown stored phase, treating row as failed");
            Phase::Failed
        }
    }
}

fn row_to_recommendation(row: &Row<'_>) -> rusqlite::Result<Recommendation> {
    let id: String = row.get(0)?;
    let time_window: String = row.get(18)?;
    let risk_level: String = row.get(22)?;
    let phase: String = row.get(23)?;
    let generated_at: String = row.get(19)?;
    let last_updated: String = row.get(30)?;
    let conditions: String = row.get(31)?;
    let previous: Option<String> = row.get(15)?;
    let dry_run: Option<String> = row.get(32)?;

    Ok(Recommendation {
        id: parse_uuid(&id)?,
        namespace: row.get(1)?,
        name: row.get(2)?,
        deployment: row.get(3)?,
        target: TargetRef {
            kind: row.get(4)?,
            api_version: row.get(5)?,
            name: row.get(3)?,
            container_name: row.get(6)?,
        },
        proposed: ResourceSpec {
            cpu_request_millicores: row.get(7)?,
            cpu_limit_millicores: row.get(8)?,
            memory_request_bytes: row.get(9)?,
            memory_limit_bytes: row.get(10)?,
        },
        current: ResourceSpec {
            cpu_request_millicores: row.get(11)?,
            cpu_limit_millicores: row.get(12)?,
            memory_request_bytes: row.get(13)?,
            memory_limit_bytes: row.get(14)?,
        },
        previous_resources: previous.map(|s| parse_json(&s)).transpose()?,
        confidence: row.get(16)?,
        model_version: row.get(17)?,
        time_window: TimeWindow::parse(&time_window).unwrap_or(TimeWindow::Peak),
        generated_at: parse_ts(&generated_at)?,
        auto_apply: row.get(20)?,
        requires_approval: row.get(21)?,
        risk_level: RiskLevel::parse(&risk_level).unwrap_or(RiskLevel::High),
        phase: parse_phase(&phase),
        message: row.get(24)?,
        generated_patch: row.get(25)?,
        applied_at: parse_opt_ts(row.get(26)?)?,
        applied_by: row.get(27)?,
        approved_at: parse_opt_ts(row.get(28)?)?,
        approved_by: row.get(29)?,
        last_updated: parse_ts(&last_updated)?,
        conditions: parse_json(&conditions)?,
        outcome: None,
        dry_run_result: dry_run.map(|s| parse_json(&s)).transpose()?,
    })
}

fn row_to_outcome(row: &Row<'_>) -> rusqlite::Result<Outcome> {
    let applied_at: String = row.get(0)?;
    let check_time: String = row.get(1)?;
    let status: String = row.get(10)?;
    let rollback_id: Option<String> = row.get(12)?;

    Ok(Outcome {
        applied_at: parse_ts(&applied_at)?,
        check_time: parse_ts(&check_time)?,
        oom_kills_before: row.get(2)?,
        oom_kills_after: row.get(3)?,
        cpu_throttle_before: row.get(4)?,
        cpu_throttle_after: row.get(5)?,
        mem_usage_p95_before: row.get(6)?,
        mem_usage_p95_after: row.get(7)?,
        cpu_usage_p95_before: row.get(8)?,
        cpu_usage_p95_after: row.get(9)?,
        status: OutcomeStatus::parse(&status).unwrap_or(OutcomeStatus::Monitoring),
        rollback_triggered: row.get(11)?,
        rollback_recommendation_id: rollback_id.map(|s| parse_uuid(&s)).transpose()?,
    })
}

fn row_to_rollback_event(row: &Row<'_>) -> rusqlite::Result<RollbackEvent> {
    let id: String = row.get(0)?;
    let original: String = row.get(1)?;
    let rollback: Option<String> = row.get(2)?;
    let reason: String = row.get(3)?;
    let created_at: String = row.get(7)?;

    Ok(RollbackEvent {
        id: parse_uuid(&id)?,
        original_recommendation_id: parse_uuid(&original)?,
        rollback_recommendation_id: rollback.map(|s| parse_uuid(&s)).transpose()?,
        reason: shared_types::RollbackReason::parse(&reason)
            .unwrap_or(shared_types::RollbackReason::Manual),
        oom_kills_detected: row.get(4)?,
        throttle_increase_percent: row.get(5)?,
        auto_triggered: row.get(6)?,
        created_at: parse_ts(&created_at)?,
        alert_sent: row.get(8)?,
        alert_sent_at: parse_opt_ts(row.get(9)?)?,
    })
}

fn load_outcome(conn: &Connection, rec_id: RecommendationId) -> rusqlite::Result<Option<Outcome>> {
    conn.query_row(
        "SELECT applied_at, check_time, oom_kills_before, oom_kills_after, cpu_throttle_before, \
         cpu_throttle_after, mem_usage_p95_before, mem_usage_p95_after, cpu_usage_p95_before, \
         cpu_usage_p95_after, status, rollback_triggered, rollback_recommendation_id \
         FROM recommendation_outcomes WHERE recommendation_id = ?1",
        params![rec_id.to_string()],
        row_to_outcome,
    )
    .optional()
}

fn insert_recommendation_tx(conn: &Connection, rec: &Recommendation) -> rusqlite::Result<usize> {
    conn.execute(
        "INSERT INTO recommendations (
            id, namespace, name, deployment, target_kind, target_api_version, target_container,
            proposed_cpu_request, proposed_cpu_limit, proposed_memory_request, proposed_memory_limit,
            current_cpu_request, current_cpu_limit, current_memory_request, current_memory_limit,
            previous_resources, confidence, model_version, time_window, generated_at,
            auto_apply, requires_approval, risk_level, phase, message, generated_patch,
            applied_at, applied_by, approved_at, approved_by, last_updated, conditions, dry_run_result
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, \
                  ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28, ?29, ?30, ?31, ?32, ?33)",
        params![
            rec.id.to_string(),
            rec.namespace,
            rec.name,
            rec.deployment,
            rec.target.kind,
            rec.target.api_version,
            rec.target.container_name,
            rec.proposed.cpu_request_millicores,
            rec.proposed.cpu_limit_millicores,
            rec.proposed.memory_request_bytes,
            rec.proposed.memory_limit_bytes,
            rec.current.cpu_request_millicores,
            rec.current.cpu_limit_millicores,
            rec.current.memory_request_bytes,
            rec.current.memory_limit_bytes,
            rec.previous_resources.as_ref().map(json_col).transpose()?,
            rec.confidence,
            rec.model_version,
            rec.time_window.as_str(),
            ts(&rec.generated_at),
            rec.auto_apply,
            rec.requires_approval,
            rec.risk_level.as_str(),
            rec.phase.as_str(),
            rec.message,
            rec.generated_patch,
            opt_ts(&rec.applied_at),
            rec.applied_by,
            opt_ts(&rec.approved_at),
            rec.approved_by,
            ts(&rec.last_updated),
            json_col(&rec.conditions)?,
            rec.dry_run_result.as_ref().map(json_col).transpose()?,
        ],
    )
}

fn update_recommendation_tx(conn: &Connection, rec: &Recommendation) -> rusqlite::Result<usize> {
    conn.execute(
        "UPDATE recommendations SET
            proposed_cpu_request = ?2, proposed_cpu_limit = ?3,
            proposed_memory_request = ?4, proposed_memory_limit = ?5,
            current_cpu_request = ?6, current_cpu_limit = ?7,
            current_memory_request = ?8, current_memory_limit = ?9,
            previous_resources = ?10, confidence = ?11, model_version = ?12,
            generated_at = ?13, auto_apply = ?14, requires_approval = ?15,
            risk_level = ?16, phase = ?17, message = ?18, generated_patch = ?19,
            applied_at = ?20, applied_by = ?21, approved_at = ?22, approved_by = ?23,
            last_updated = ?24, conditions = ?25, dry_run_result = ?26,
            target_container = ?27
         WHERE id = ?1",
        params![
            rec.id.to_string(),
            rec.proposed.cpu_request_millicores,
            rec.proposed.cpu_limit_millicores,
            rec.proposed.memory_request_bytes,
            rec.proposed.memory_limit_bytes,
            rec.current.cpu_request_millicores,
            rec.current.cpu_limit_millicores,
            rec.current.memory_request_bytes,
            rec.current.memory_limit_bytes,
            rec.previous_resources.as_ref().map(json_col).transpose()?,
            rec.confidence,
            rec.model_version,
            ts(&rec.generated_at),
            rec.auto_apply,
            rec.requires_approval,
            rec.risk_level.as_str(),
            rec.phase.as_str(),
            rec.message,
            rec.generated_patch,
            opt_ts(&rec.applied_at),
            rec.applied_by,
            opt_ts(&rec.approved_at),
            rec.approved_by,
            ts(&rec.last_updated),
            json_col(&rec.conditions)?,
            rec.dry_run_result.as_ref().map(json_col).transpose()?,
            rec.target.container_name,
        ],
    )
}

fn upsert_outcome_tx(
    conn: &Connection,
    rec_id: RecommendationId,
    outcome: &Outcome,
) -> rusqlite::Result<usize> {
    conn.execute(
        "INSERT INTO recommendation_outcomes (
            recommendation_id, applied_at, check_time, oom_kills_before, oom_kills_after,
            cpu_throttle_before, cpu_throttle_after, mem_usage_p95_before, mem_usage_p95_after,
            cpu_usage_p95_before, cpu_usage_p95_after, status, rollback_triggered,
            rollback_recommendation_id
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
        ON CONFLICT(recommendation_id) DO UPDATE SET
            applied_at = excluded.applied_at,
            check_time = excluded.check_time,
            oom_kills_before = excluded.oom_kills_before,
            oom_kills_after = excluded.oom_kills_after,
            cpu_throttle_before = excluded.cpu_throttle_before,
            cpu_throttle_after = excluded.cpu_throttle_after,
            mem_usage_p95_before = excluded.mem_usage_p95_before,
            mem_usage_p95_after = excluded.mem_usage_p95_after,
            cpu_usage_p95_before = excluded.cpu_usage_p95_before,
            cpu_usage_p95_after = excluded.cpu_usage_p95_after,
            status = excluded.status,
            rollback_triggered = excluded.rollback_triggered,
            rollback_recommendation_id = excluded.rollback_recommendation_id",
        params![
            rec_id.to_string(),
            ts(&outcome.applied_at),
            ts(&outcome.check_time),
            outcome.oom_kills_before,
            outcome.oom_kills_after,
            outcome.cpu_throttle_before,
            outcome.cpu_throttle_after,
            outcome.mem_usage_p95_before,
            outcome.mem_usage_p95_after,
            outcome.cpu_usage_p95_before,
            outcome.cpu_usage_p95_after,
            outcome.status.as_str(),
            outcome.rollback_triggered,
            outcome.rollback_recommendation_id.map(|id| id.to_string()),
        ],
    )
}

fn insert_rollback_event_tx(conn: &Connection, event: &RollbackEvent) -> rusqlite::Result<usize> {
    conn.execute(
        "INSERT INTO rollback_events (
            id, original_recommendation_id, rollback_recommendation_id, reason,
            oom_kills_detected, throttle_increase_percent, auto_triggered, created_at,
            alert_sent, alert_sent_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            event.id.to_string(),
            event.original_recommendation_id.to_string(),
            event.rollback_recommendation_id.map(|id| id.to_string()),
            event.reason.as_str(),
            event.oom_kills_detected,
            event.throttle_increase_percent,
            event.auto_triggered,
            ts(&event.created_at),
            event.alert_sent,
            opt_ts(&event.alert_sent_at),
        ],
    )
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

impl Repository {
    pub fn new(db_path: &str) -> EngineResult<Self> {
        let manager = SqliteConnectionManager::file(db_path);

        let pool = r2d2::Pool::builder()
            .max_size(10)
            .min_idle(Some(2))
            .idle_timeout(Some(Duration::from_secs(300)))
            .max_lifetime(Some(Duration::from_secs(1800)))
            .build(manager)
            .map_err(EngineError::repository)?;

        // Fail fast if the database is unreachable.
        let _ = pool.get().map_err(EngineError::repository)?;

        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    pub async fn init_schema(&self) -> EngineResult<()> {
        self.blocking(move |conn| {
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS recommendations (
                    id TEXT PRIMARY KEY,
                    namespace TEXT NOT NULL,
                    name TEXT NOT NULL,
                    deployment TEXT NOT NULL,
                    target_kind TEXT NOT NULL,
                    target_api_version TEXT NOT NULL,
                    target_container TEXT,
                    proposed_cpu_request INTEGER,
                    proposed_cpu_limit INTEGER,
                    proposed_memory_request INTEGER,
                    proposed_memory_limit INTEGER,
                    current_cpu_request INTEGER,
                    current_cpu_limit INTEGER,
                    current_memory_request INTEGER,
                    current_memory_limit INTEGER,
                    previous_resources TEXT,
                    confidence REAL NOT NULL,
                    model_version TEXT NOT NULL,
                    time_window TEXT NOT NULL,
                    generated_at TEXT NOT NULL,
                    auto_apply INTEGER NOT NULL,
                    requires_approval INTEGER NOT NULL,
                    risk_level TEXT NOT NULL,
                    phase TEXT NOT NULL,
                    message TEXT NOT NULL,
                    generated_patch TEXT NOT NULL,
                    applied_at TEXT,
                    applied_by TEXT,
                    approved_at TEXT,
                    approved_by TEXT,
                    last_updated TEXT NOT NULL,
                    conditions TEXT NOT NULL,
                    dry_run_result TEXT,
                    UNIQUE(namespace, name)
                );
                CREATE INDEX IF NOT EXISTS idx_recommendations_phase
                    ON recommendations(phase);

                CREATE TABLE IF NOT EXISTS recommendation_outcomes (
                    recommendation_id TEXT PRIMARY KEY
                        REFERENCES recommendations(id),
                    applied_at TEXT NOT NULL,
                    check_time TEXT NOT NULL,
                    oom_kills_before INTEGER NOT NULL,
                    oom_kills_after INTEGER NOT NULL,
                    cpu_throttle_before REAL NOT NULL,
                    cpu_throttle_after REAL NOT NULL,
                    mem_usage_p95_before INTEGER NOT NULL,
                    mem_usage_p95_after INTEGER NOT NULL,
                    cpu_usage_p95_before REAL NOT NULL,
                    cpu_usage_p95_after REAL NOT NULL,
                    status TEXT NOT NULL,
                    rollback_triggered INTEGER NOT NULL,
                    rollback_recommendation_id TEXT
                );
                CREATE INDEX IF NOT EXISTS idx_outcomes_status
                    ON recommendation_outcomes(status, rollback_triggered);

                CREATE TABLE IF NOT EXISTS rollback_events (
                    id TEXT PRIMARY KEY,
                    original_recommendation_id TEXT NOT NULL,
                    rollback_recommendation_id TEXT,
                    reason TEXT NOT NULL,
                    oom_kills_detected INTEGER NOT NULL,
                    throttle_increase_percent REAL NOT NULL,
                    auto_triggered INTEGER NOT NULL,
                    created_at TEXT NOT NULL,
                    alert_sent INTEGER NOT NULL,
                    alert_sent_at TEXT
                );

                CREATE TABLE IF NOT EXISTS cost_snapshots (
                    recommendation_id TEXT NOT NULL,
                    namespace TEXT NOT NULL,
                    current_monthly REAL NOT NULL,
                    proposed_monthly REAL NOT NULL,
                    monthly_savings REAL NOT NULL,
                    computed_at TEXT NOT NULL
                );",
            )
        })
        .await
    }

    /// Run `f` with a pooled connection on the blocking pool.
    async fn blocking<T, F>(&self, f: F) -> EngineResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let pool = self.pool.clone();
        task::spawn_blocking(move || {
            let mut conn = pool.get().map_err(EngineError::repository)?;
            f(&mut conn).map_err(EngineError::repository)
        })
        .await
        .map_err(EngineError::repository)?
    }

    pub async fn create_recommendation(&self, rec: &Recommendation) -> EngineResult<()> {
        let rec = rec.clone();
        let pool = self.pool.clone();
        task::spawn_blocking(move || {
            let conn = pool.get().map_err(EngineError::repository)?;
            match insert_recommendation_tx(&conn, &rec) {
                Ok(_) => Ok(()),
                Err(err) if is_unique_violation(&err) => Err(EngineError::AlreadyExists {
                    namespace: rec.namespace.clone(),
                    name: rec.name.clone(),
                }),
                Err(err) => Err(EngineError::repository(err)),
            }
        })
        .await
        .map_err(EngineError::repository)?
    }

    /// Full-row status update keyed by id. `NotFound` when the row vanished.
    pub async fn store_recommendation(&self, rec: &Recommendation) -> EngineResult<()> {
        let rec = rec.clone();
        let pool = self.pool.clone();
        task::spawn_blocking(move || {
            let conn = pool.get().map_err(EngineError::repository)?;
            let updated =
                update_recommendation_tx(&conn, &rec).map_err(EngineError::repository)?;
            if updated == 0 {
                return Err(EngineError::NotFound {
                    namespace: rec.namespace.clone(),
                    name: rec.name.clone(),
                });
            }
            if let Some(outcome) = &rec.outcome {
                upsert_outcome_tx(&conn, rec.id, outcome).map_err(EngineError::repository)?;
            }
            Ok(())
        })
        .await
        .map_err(EngineError::repository)?
    }

    pub async fn get_recommendation(
        &self,
        namespace: &str,
        name: &str,
    ) -> EngineResult<Option<Recommendation>> {
        let namespace = namespace.to_string();
        let name = name.to_string();
        self.blocking(move |conn| {
            let rec = conn
                .query_row(
                    &format!(
                        "SELECT {REC_COLUMNS} FROM recommendations \
                         WHERE namespace = ?1 AND name = ?2"
                    ),
                    params![namespace, name],
                    row_to_recommendation,
                )
                .optional()?;

            match rec {
                Some(mut rec) => {
                    rec.outcome = load_outcome(conn, rec.id)?;
                    Ok(Some(rec))
                }
                None => Ok(None),
            }
        })
        .await
    }

    pub async fn get_recommendation_by_id(
        &self,
        id: RecommendationId,
    ) -> EngineResult<Option<Recommendation>> {
        self.blocking(move |conn| {
            let rec = conn
                .query_row(
                    &format!("SELECT {REC_COLUMNS} FROM recommendations WHERE id = ?1"),
                    params![id.to_string()],
                    row_to_recommendation,
                )
                .optional()?;

            match rec {
                Some(mut rec) => {
                    rec.outcome = load_outcome(conn, rec.id)?;
                    Ok(Some(rec))
                }
                None => Ok(None),
            }
        })
        .await
    }

    pub async fn list_recommendations(
        &self,
        namespace: Option<&str>,
    ) -> EngineResult<Vec<Recommendation>> {
        let namespace = namespace.map(|s| s.to_string());
        self.blocking(move |conn| {
            let (sql, filter) = match &namespace {
                Some(ns) => (
                    format!(
                        "SELECT {REC_COLUMNS} FROM recommendations \
                         WHERE namespace = ?1 ORDER BY namespace, name"
                    ),
                    Some(ns.clone()),
                ),
                None => (
                    format!("SELECT {REC_COLUMNS} FROM recommendations ORDER BY namespace, name"),
                    None,
                ),
            };

            let mut stmt = conn.prepare(&sql)?;
            let rows: Vec<Recommendation> = match filter {
                Some(ns) => stmt
                    .query_map(params![ns], row_to_recommendation)?
                    .collect::<rusqlite::Result<_>>()?,
                None => stmt
                    .query_map([], row_to_recommendation)?
                    .collect::<rusqlite::Result<_>>()?,
            };

            let mut out = Vec::with_capacity(rows.len());
            for mut rec in rows {
                rec.outcome = load_outcome(conn, rec.id)?;
                out.push(rec);
            }
            Ok(out)
        })
        .await
    }

    pub async fn delete_recommendation(&self, namespace: &str, name: &str) -> EngineResult<bool> {
        let namespace = namespace.to_string();
        let name = name.to_string();
        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            let id: Option<String> = tx
                .query_row(
                    "SELECT id FROM recommendations WHERE namespace = ?1 AND name = ?2",
                    params![namespace, name],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(id) = id else {
                return Ok(false);
            };
            tx.execute(
                "DELETE FROM recommendation_outcomes WHERE recommendation_id = ?1",
                params![id],
            )?;
            tx.execute("DELETE FROM recommendations WHERE id = ?1", params![id])?;
            tx.commit()?;
            Ok(true)
        })
        .await
    }

    /// Insert an aggregated recommendation, or refresh the existing row only
    /// while it is still Pending. Returns the stored row, or `None` when the
    /// existing row has left Pending and was preserved.
    pub async fn upsert_aggregated(
        &self,
        rec: &Recommendation,
    ) -> EngineResult<Option<Recommendation>> {
        let rec = rec.clone();
        self.blocking(move |conn| {
            let tx = conn.transaction()?;

            let existing = tx
                .query_row(
                    &format!(
                        "SELECT {REC_COLUMNS} FROM recommendations \
                         WHERE namespace = ?1 AND name = ?2"
                    ),
                    params![rec.namespace, rec.name],
                    row_to_recommendation,
                )
                .optional()?;

            let stored = match existing {
                None => {
                    insert_recommendation_tx(&tx, &rec)?;
                    rec.clone()
                }
                Some(existing) if existing.phase == Phase::Pending => {
                    // Keep identity and lifecycle bookkeeping, refresh the
                    // aggregated payload.
                    let mut refreshed = rec.clone();
                    refreshed.id = existing.id;
                    refreshed.conditions = existing.conditions.clone();
                    refreshed.phase = Phase::Pending;
                    update_recommendation_tx(&tx, &refreshed)?;
                    refreshed
                }
                Some(_) => {
                    tx.commit()?;
                    return Ok(None);
                }
            };

            tx.commit()?;
            Ok(Some(stored))
        })
        .await
    }

    pub async fn upsert_outcome(
        &self,
        rec_id: RecommendationId,
        outcome: &Outcome,
    ) -> EngineResult<()> {
        let outcome = outcome.clone();
        self.blocking(move |conn| {
            upsert_outcome_tx(conn, rec_id, &outcome)?;
            Ok(())
        })
        .await
    }

    pub async fn get_outcome(&self, rec_id: RecommendationId) -> EngineResult<Option<Outcome>> {
        self.blocking(move |conn| load_outcome(conn, rec_id)).await
    }

    /// Applied recommendations that still need outcome observation: no
    /// outcome row yet, or still monitoring/degraded.
    pub async fn list_monitoring_candidates(&self) -> EngineResult<Vec<Recommendation>> {
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {REC_COLUMNS} FROM recommendations r
                 WHERE r.phase = 'applied'
                   AND NOT EXISTS (
                       SELECT 1 FROM recommendation_outcomes o
                       WHERE o.recommendation_id = r.id
                         AND o.status IN ('success', 'rolled_back')
                   )
                 ORDER BY r.applied_at"
            ))?;
            let rows: Vec<Recommendation> = stmt
                .query_map([], row_to_recommendation)?
                .collect::<rusqlite::Result<_>>()?;

            let mut out = Vec::with_capacity(rows.len());
            for mut rec in rows {
                rec.outcome = load_outcome(conn, rec.id)?;
                out.push(rec);
            }
            Ok(out)
        })
        .await
    }

    /// Applied recommendations whose outcome is degraded and not yet acted
    /// on, outcome attached.
    pub async fn list_degraded(&self) -> EngineResult<Vec<Recommendation>> {
        self.blocking(move |conn| {
            let rec_columns_qualified = REC_COLUMNS.replace("applied_at", "r.applied_at");
            let mut stmt = conn.prepare(&format!(
                "SELECT {rec_columns_qualified} FROM recommendations r
                 JOIN recommendation_outcomes o ON o.recommendation_id = r.id
                 WHERE r.phase = 'applied'
                   AND o.status = 'degraded'
                   AND o.rollback_triggered = 0
                 ORDER BY o.check_time"
            ))?;
            let rows: Vec<Recommendation> = stmt
                .query_map([], row_to_recommendation)?
                .collect::<rusqlite::Result<_>>()?;

            let mut out = Vec::with_capacity(rows.len());
            for mut rec in rows {
                rec.outcome = load_outcome(conn, rec.id)?;
                out.push(rec);
            }
            Ok(out)
        })
        .await
    }

    /// The rollback transaction: update the original, optionally insert the
    /// rollback recommendation, mark the outcome, append the audit event.
    /// All four commit together or none do.
    pub async fn commit_rollback(&self, unit: RollbackUnit) -> EngineResult<()> {
        self.blocking(move |conn| {
            let tx: Transaction<'_> = conn.transaction()?;

            update_recommendation_tx(&tx, &unit.original)?;

            if let Some(rollback_rec) = &unit.rollback_recommendation {
                insert_recommendation_tx(&tx, rollback_rec)?;
            }

            tx.execute(
                "UPDATE recommendation_outcomes SET
                    status = 'rolled_back',
                    rollback_triggered = 1,
                    rollback_recommendation_id = ?2
                 WHERE recommendation_id = ?1",
                params![
                    unit.original.id.to_string(),
                    unit.event.rollback_recommendation_id.map(|id| id.to_string()),
                ],
            )?;

            insert_rollback_event_tx(&tx, &unit.event)?;

            tx.commit()?;
            Ok(())
        })
        .await
    }

    pub async fn list_unsent_alert_events(&self) -> EngineResult<Vec<RollbackEvent>> {
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, original_recommendation_id, rollback_recommendation_id, reason, \
                 oom_kills_detected, throttle_increase_percent, auto_triggered, created_at, \
                 alert_sent, alert_sent_at \
                 FROM rollback_events WHERE alert_sent = 0 ORDER BY created_at",
            )?;
            let result = stmt
                .query_map([], row_to_rollback_event)?
                .collect::<rusqlite::Result<_>>();
            result
        })
        .await
    }

    pub async fn mark_alert_sent(
        &self,
        event_id: RollbackEventId,
        at: DateTime<Utc>,
    ) -> EngineResult<()> {
        self.blocking(move |conn| {
            conn.execute(
                "UPDATE rollback_events SET alert_sent = 1, alert_sent_at = ?2 WHERE id = ?1",
                params![event_id.to_string(), ts(&at)],
            )?;
            Ok(())
        })
        .await
    }

    /// Persist the dry-run result without touching any lifecycle field.
    pub async fn store_dry_run_result(
        &self,
        id: RecommendationId,
        result: &shared_types::DryRunResult,
    ) -> EngineResult<()> {
        let result = result.clone();
        self.blocking(move |conn| {
            conn.execute(
                "UPDATE recommendations SET dry_run_result = ?2 WHERE id = ?1",
                params![id.to_string(), json_col(&result)?],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn insert_cost_snapshot(&self, snapshot: &CostSnapshot) -> EngineResult<()> {
        let snapshot = snapshot.clone();
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO cost_snapshots (
                    recommendation_id, namespace, current_monthly, proposed_monthly,
                    monthly_savings, computed_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    snapshot.recommendation_id.to_string(),
                    snapshot.namespace,
                    snapshot.current_monthly,
                    snapshot.proposed_monthly,
                    snapshot.monthly_savings,
                    ts(&snapshot.computed_at),
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn list_cost_snapshots(&self, namespace: &str) -> EngineResult<Vec<CostSnapshot>> {
        let namespace = namespace.to_string();
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT recommendation_id, namespace, current_monthly, proposed_monthly, \
                 monthly_savings, computed_at \
                 FROM cost_snapshots WHERE namespace = ?1 ORDER BY computed_at",
            )?;
            let result = stmt
                .query_map(params![namespace], |row| {
                    let id: String = row.get(0)?;
                    let computed_at: String = row.get(5)?;
                    Ok(CostSnapshot {
                        recommendation_id: parse_uuid(&id)?,
                        namespace: row.get(1)?,
                        current_monthly: row.get(2)?,
                        proposed_monthly: row.get(3)?,
                        monthly_savings: row.get(4)?,
                        computed_at: parse_ts(&computed_at)?,
                    })
                })?
                .collect::<rusqlite::Result<_>>();
            result
        })
        .await
    }
}
