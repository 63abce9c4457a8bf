//! Computes the exact effect an apply would have (change list, warnings,
//! and the patch) without side effects on the recommendation's lifecycle.

use crate::errors::{EngineError, EngineResult};
use crate::patch;
use crate::repository::Repository;
use chrono::Utc;
use platform::{AuditEventType, AuditLog};
use shared_types::{DryRunResult, Recommendation, ResourceChange, ResourceField};

/// Reductions past these points get an explicit warning in the result.
const MEMORY_LIMIT_REDUCTION_WARN_PERCENT: f64 = 30.0;
const CPU_LIMIT_REDUCTION_WARN_PERCENT: f64 = 50.0;

fn change_for(field: ResourceField, current: Option<i64>, new: Option<i64>) -> Option<ResourceChange> {
    let (Some(current), Some(new)) = (current, new) else {
        return None;
    };
    if current == new || current == 0 {
        return None;
    }
    let change_percent = (new - current) as f64 / current as f64 * 100.0;
    Some(ResourceChange {
        field,
        current,
        new,
        change_percent,
        is_reduction: new < current,
    })
}

/// Pure evaluation of a recommendation against its recorded current values.
pub fn evaluate(rec: &Recommendation) -> DryRunResult {
    let changes: Vec<ResourceChange> = [
        change_for(
            ResourceField::CpuRequest,
            rec.current.cpu_request_millicores,
            rec.proposed.cpu_request_millicores,
        ),
        change_for(
            ResourceField::CpuLimit,
            rec.current.cpu_limit_millicores,
            rec.proposed.cpu_limit_millicores,
        ),
        change_for(
            ResourceField::MemoryRequest,
            rec.current.memory_request_bytes,
            rec.proposed.memory_request_bytes,
        ),
        change_for(
            ResourceField::MemoryLimit,
            rec.current.memory_limit_bytes,
            rec.proposed.memory_limit_bytes,
        ),
    ]
    .into_iter()
    .flatten()
    .collect();

    let mut warnings = Vec::new();
    for change in &changes {
        if !change.is_reduction {
            continue;
        }
        let reduction = -change.change_percent;
        match change.field {
            ResourceField::MemoryLimit if reduction > MEMORY_LIMIT_REDUCTION_WARN_PERCENT => {
                warnings.push(format!(
                    "memory limit reduction of {reduction:.1}% may cause OOM kills"
                ));
            }
            ResourceField::CpuLimit if reduction > CPU_LIMIT_REDUCTION_WARN_PERCENT => {
                warnings.push(format!(
                    "cpu limit reduction of {reduction:.1}% may cause throttling"
                ));
            }
            _ => {}
        }
    }

    // The patch must match what a real apply would send: the stored
    // generated patch when present, the same deterministic rendering
    // otherwise.
    let yaml_patch = if rec.generated_patch.is_empty() {
        patch::strategic_merge_yaml(&rec.target, &rec.proposed)
    } else {
        rec.generated_patch.clone()
    };

    let would_apply = !rec.phase.is_terminal() && !rec.proposed.is_empty();

    DryRunResult {
        changes,
        warnings,
        yaml_patch,
        would_apply,
        evaluated_at: Utc::now(),
    }
}

pub struct DryRunEvaluator {
    repository: Repository,
    audit: AuditLog,
}

impl DryRunEvaluator {
    pub fn new(repository: Repository, audit: AuditLog) -> Self {
        Self { repository, audit }
    }

    /// Evaluate and persist the result alongside the recommendation. The
    /// recommendation's phase, conditions, and timestamps are untouched.
    pub async fn evaluate_and_store(
        &self,
        namespace: &str,
        name: &str,
    ) -> EngineResult<DryRunResult> {
        let rec = self
            .repository
            .get_recommendation(namespace, name)
            .await?
            .ok_or_else(|| EngineError::NotFound {
                namespace: namespace.to_string(),
                name: name.to_string(),
            })?;

        let result = evaluate(&rec);
        self.repository.store_dry_run_result(rec.id, &result).await?;
        self.audit
            .record_action(
                AuditEventType::DryRun,
                "system",
                &format!("{namespace}/{name}"),
                "dry_run",
                "ok",
            )
            .await;

        Ok(result)
    }
}
