use ::tracing::info;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Default capacity of the in-memory audit ring buffer.
pub const DEFAULT_AUDIT_CAPACITY: usize = 1_024;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub enum AuditEventType {
    Created,
    Approval,
    Rejection,
    Apply,
    Rollback,
    DryRun,
    OutcomeRecorded,
    AlertSent,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AuditEvent {
    pub event_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub event_type: AuditEventType,
    /// Who performed the action ("system" for background loops).
    pub actor: String,
    /// `namespace/name` of the recommendation acted on.
    pub resource: String,
    pub action: String,
    pub status: String,
    pub details: Option<serde_json::Value>,
}

impl AuditEvent {
    pub fn new(
        event_type: AuditEventType,
        actor: impl Into<String>,
        resource: impl Into<String>,
        action: impl Into<String>,
        status: impl Into<String>,
        details: Option<serde_json::Value>,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            event_type,
            actor: actor.into(),
            resource: resource.into(),
            action: action.into(),
            status: status.into(),
            details,
        }
    }
}

/// In-memory audit trail for lifecycle actions. Bounded: once `capacity`
/// events are held, the oldest event is evicted on insert. Every event is
/// also emitted to the tracing pipeline, so eviction only limits the
/// queryable in-process window.
#[derive(Clone)]
pub struct AuditLog {
    events: Arc<Mutex<VecDeque<AuditEvent>>>,
    capacity: usize,
}

impl AuditLog {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_AUDIT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(VecDeque::with_capacity(capacity.min(1_024)))),
            capacity: capacity.max(1),
        }
    }

    pub async fn record(&self, event: AuditEvent) {
        info!(
            event_id = %event.event_id,
            event_type = ?event.event_type,
            actor = %event.actor,
            resource = %event.resource,
            action = %event.action,
            status = %event.status,
            "audit event"
        );

        let mut events = self.events.lock().await;
        if events.len() == self.capacity {
            events.pop_front();
        }
        events.push_back(event);
    }

    pub async fn record_action(
        &self,
        event_type: AuditEventType,
        actor: &str,
        resource: &str,
        action: &str,
        status: &str,
    ) {
        self.record(AuditEvent::new(event_type, actor, resource, action, status, None))
            .await;
    }

    /// Most recent events, newest first.
    pub async fn recent(&self, limit: usize) -> Vec<AuditEvent> {
        let events = self.events.lock().await;
        events.iter().rev().take(limit).cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.events.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.events.lock().await.is_empty()
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new()
    }
}
