use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// Surrogate identifier for a recommendation row.
pub type RecommendationId = Uuid;

/// Identifier for a rollback audit event.
pub type RollbackEventId = Uuid;

/// Time window a recommendation was aggregated over. `Rollback` is reserved
/// for recommendations synthesized to revert a previous apply.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TimeWindow {
    Peak,
    OffPeak,
    Weekly,
    Rollback,
}

impl TimeWindow {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeWindow::Peak => "peak",
            TimeWindow::OffPeak => "off_peak",
            TimeWindow::Weekly => "weekly",
            TimeWindow::Rollback => "rollback",
        }
    }

    pub fn parse(s: &str) -> Option<TimeWindow> {
        match s {
            "peak" => Some(TimeWindow::Peak),
            "off_peak" => Some(TimeWindow::OffPeak),
            "weekly" => Some(TimeWindow::Weekly),
            "rollback" => Some(TimeWindow::Rollback),
            _ => None,
        }
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
        }
    }

    pub fn parse(s: &str) -> Option<RiskLevel> {
        match s {
            "low" => Some(RiskLevel::Low),
            "medium" => Some(RiskLevel::Medium),
            "high" => Some(RiskLevel::High),
            _ => None,
        }
    }
}

/// Lifecycle phase of a recommendation. An absent phase is read as `Pending`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Pending,
    Approved,
    Applied,
    RolledBack,
    Failed,
    Rejected,
}

impl Phase {
    /// Terminal phases admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Rejected | Phase::Failed | Phase::RolledBack)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Pending => "pending",
            Phase::Approved => "approved",
            Phase::Applied => "applied",
            Phase::RolledBack => "rolled_back",
            Phase::Failed => "failed",
            Phase::Rejected => "rejected",
        }
    }

    /// Parse a stored phase string. Empty or unknown values map to `Pending`,
    /// matching the "absent means pending" rule.
    pub fn parse_or_pending(s: &str) -> Phase {
        match s {
            "approved" => Phase::Approved,
            "applied" => Phase::Applied,
            "rolled_back" => Phase::RolledBack,
            "failed" => Phase::Failed,
            "rejected" => Phase::Rejected,
            _ => Phase::Pending,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConditionType {
    Ready,
    Approved,
    Applied,
    Healthy,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

/// A named status flag on a recommendation. At most one condition exists per
/// type; `last_transition_time` only moves when `status` or `reason` changes.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Condition {
    #[serde(rename = "type")]
    pub condition_type: ConditionType,
    pub status: ConditionStatus,
    pub reason: String,
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
}

/// Upsert a condition into a condition list, preserving the transition time
/// when neither status nor reason changed.
pub fn set_condition(conditions: &mut Vec<Condition>, incoming: Condition) {
    for existing in conditions.iter_mut() {
        if existing.condition_type == incoming.condition_type {
            let transitioned =
                existing.status != incoming.status || existing.reason != incoming.reason;
            existing.status = incoming.status;
            existing.reason = incoming.reason;
            existing.message = incoming.message;
            if transitioned {
                existing.last_transition_time = incoming.last_transition_time;
            }
            return;
        }
    }
    conditions.push(incoming);
}

/// Container resource values, in millicores and bytes. All fields optional;
/// absent fields are omitted from generated patches.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResourceSpec {
    #[serde(default)]
    pub cpu_request_millicores: Option<i64>,
    #[serde(default)]
    pub cpu_limit_millicores: Option<i64>,
    #[serde(default)]
    pub memory_request_bytes: Option<i64>,
    #[serde(default)]
    pub memory_limit_bytes: Option<i64>,
}

impl ResourceSpec {
    pub fn is_empty(&self) -> bool {
        self.cpu_request_millicores.is_none()
            && self.cpu_limit_millicores.is_none()
            && self.memory_request_bytes.is_none()
            && self.memory_limit_bytes.is_none()
    }
}

/// The workload a recommendation targets. When `container_name` is absent the
/// workload name doubles as the container name.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TargetRef {
    pub kind: String,
    pub api_version: String,
    pub name: String,
    #[serde(default)]
    pub container_name: Option<String>,
}

impl TargetRef {
    pub fn container(&self) -> &str {
        self.container_name.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Monitoring,
    Success,
    Degraded,
    RolledBack,
}

impl OutcomeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeStatus::Monitoring => "monitoring",
            OutcomeStatus::Success => "success",
            OutcomeStatus::Degraded => "degraded",
            OutcomeStatus::RolledBack => "rolled_back",
        }
    }

    pub fn parse(s: &str) -> Option<OutcomeStatus> {
        match s {
            "monitoring" => Some(OutcomeStatus::Monitoring),
            "success" => Some(OutcomeStatus::Success),
            "degraded" => Some(OutcomeStatus::Degraded),
            "rolled_back" => Some(OutcomeStatus::RolledBack),
            _ => None,
        }
    }
}

/// Observed metrics delta between just-before and some-time-after an apply.
/// One-to-one with an applied recommendation.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Outcome {
    pub applied_at: DateTime<Utc>,
    pub check_time: DateTime<Utc>,
    pub oom_kills_before: i64,
    pub oom_kills_after: i64,
    /// Fractions of time throttled, 0..1.
    pub cpu_throttle_before: f64,
    pub cpu_throttle_after: f64,
    pub mem_usage_p95_before: i64,
    pub mem_usage_p95_after: i64,
    pub cpu_usage_p95_before: f64,
    pub cpu_usage_p95_after: f64,
    pub status: OutcomeStatus,
    pub rollback_triggered: bool,
    #[serde(default)]
    pub rollback_recommendation_id: Option<RecommendationId>,
}

impl Outcome {
    pub fn oom_kill_delta(&self) -> i64 {
        self.oom_kills_after - self.oom_kills_before
    }

    /// Relative throttle increase. With a zero baseline any observed
    /// throttling is an unbounded relative increase.
    pub fn throttle_increase_fraction(&self) -> f64 {
        if self.cpu_throttle_before > 0.0 {
            (self.cpu_throttle_after - self.cpu_throttle_before) / self.cpu_throttle_before
        } else if self.cpu_throttle_after > 0.0 {
            f64::INFINITY
        } else {
            0.0
        }
    }

    /// Throttle increase as a percentage suitable for reports and audit rows.
    /// With a zero baseline this is the observed after-ratio itself, in percent.
    pub fn throttle_increase_percent(&self) -> f64 {
        if self.cpu_throttle_before > 0.0 {
            self.throttle_increase_fraction() * 100.0
        } else {
            self.cpu_throttle_after * 100.0
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RollbackReason {
    OomIncrease,
    ThrottleIncrease,
    Manual,
}

impl RollbackReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RollbackReason::OomIncrease => "oom_increase",
            RollbackReason::ThrottleIncrease => "throttle_increase",
            RollbackReason::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Option<RollbackReason> {
        match s {
            "oom_increase" => Some(RollbackReason::OomIncrease),
            "throttle_increase" => Some(RollbackReason::ThrottleIncrease),
            "manual" => Some(RollbackReason::Manual),
            _ => None,
        }
    }
}

/// Append-only audit record of a rollback decision.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RollbackEvent {
    pub id: RollbackEventId,
    pub original_recommendation_id: RecommendationId,
    #[serde(default)]
    pub rollback_recommendation_id: Option<RecommendationId>,
    pub reason: RollbackReason,
    pub oom_kills_detected: i64,
    pub throttle_increase_percent: f64,
    pub auto_triggered: bool,
    pub created_at: DateTime<Utc>,
    pub alert_sent: bool,
    #[serde(default)]
    pub alert_sent_at: Option<DateTime<Utc>>,
}

/// Which of the four resource fields a dry-run change refers to.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResourceField {
    CpuRequest,
    CpuLimit,
    MemoryRequest,
    MemoryLimit,
}

impl fmt::Display for ResourceField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResourceField::CpuRequest => "cpu_request",
            ResourceField::CpuLimit => "cpu_limit",
            ResourceField::MemoryRequest => "memory_request",
            ResourceField::MemoryLimit => "memory_limit",
        };
        f.write_str(s)
    }
}

/// One field-level difference a dry-run apply would introduce.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ResourceChange {
    pub field: ResourceField,
    pub current: i64,
    pub new: i64,
    pub change_percent: f64,
    pub is_reduction: bool,
}

/// The full effect an apply would have, computed without side effects.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DryRunResult {
    pub changes: Vec<ResourceChange>,
    pub warnings: Vec<String>,
    pub yaml_patch: String,
    pub would_apply: bool,
    pub evaluated_at: DateTime<Utc>,
}

/// The central entity: a proposed set of container resource values for one
/// workload, with the policy fields governing how it is applied.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Recommendation {
    pub id: RecommendationId,
    pub namespace: String,
    pub name: String,
    /// Workload (deployment) the proposal targets; `name` may carry a window
    /// suffix while `deployment` stays the bare workload name.
    pub deployment: String,
    pub target: TargetRef,

    pub proposed: ResourceSpec,
    /// Resource values observed on the workload when the recommendation was
    /// produced. Snapshotted into `previous_resources` at apply time.
    pub current: ResourceSpec,
    /// Captured once at apply time; the rollback target. Never mutated after
    /// capture.
    #[serde(default)]
    pub previous_resources: Option<ResourceSpec>,

    pub confidence: f64,
    pub model_version: String,
    pub time_window: TimeWindow,
    pub generated_at: DateTime<Utc>,

    pub auto_apply: bool,
    pub requires_approval: bool,
    pub risk_level: RiskLevel,

    #[serde(default)]
    pub phase: Phase,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub generated_patch: String,
    #[serde(default)]
    pub applied_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub applied_by: Option<String>,
    #[serde(default)]
    pub approved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub approved_by: Option<String>,
    pub last_updated: DateTime<Utc>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub outcome: Option<Outcome>,
    #[serde(default)]
    pub dry_run_result: Option<DryRunResult>,
}

impl Recommendation {
    /// Name an aggregated recommendation so that the aggregation upsert key
    /// `(namespace, deployment, time_window)` coincides with the identity
    /// key `(namespace, name)`.
    pub fn aggregated_name(deployment: &str, window: TimeWindow) -> String {
        format!("{}-{}", deployment, window.as_str())
    }
}

/// One ML prediction row for a workload, as produced by the prediction source.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Prediction {
    pub namespace: String,
    pub deployment: String,
    #[serde(default)]
    pub container: Option<String>,
    #[serde(default)]
    pub cpu_request_millicores: Option<i64>,
    #[serde(default)]
    pub cpu_limit_millicores: Option<i64>,
    #[serde(default)]
    pub memory_request_bytes: Option<i64>,
    #[serde(default)]
    pub memory_limit_bytes: Option<i64>,
    /// Resource values observed on the workload when the prediction was
    /// made. Carried onto the aggregated recommendation as its `current`.
    #[serde(default)]
    pub current: Option<ResourceSpec>,
    pub confidence: f64,
    pub model_version: String,
    pub time_window: TimeWindow,
    pub predicted_at: DateTime<Utc>,
}

/// A single telemetry sample for one workload.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct WorkloadSample {
    pub oom_kills: i64,
    pub cpu_throttle_ratio: f64,
    pub mem_usage_p95_bytes: i64,
    pub cpu_usage_p95_fraction: f64,
}

/// Monthly and annual cost of a resource request at configured rates.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct ResourceCost {
    pub monthly: f64,
    pub annual: f64,
}

/// Persisted per-aggregation cost snapshot for reporting.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CostSnapshot {
    pub recommendation_id: RecommendationId,
    pub namespace: String,
    pub current_monthly: f64,
    pub proposed_monthly: f64,
    pub monthly_savings: f64,
    pub computed_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

fn default_monitoring_window_secs() -> u64 {
    3_600
}
fn default_oom_kill_threshold() -> i64 {
    1
}
fn default_throttle_increase_threshold() -> f64 {
    0.25
}
fn default_throttle_warn_percent() -> f64 {
    20.0
}
fn default_true() -> bool {
    true
}
fn default_memory_safety_margin() -> f64 {
    0.20
}
fn default_apply_timeout_secs() -> u64 {
    30
}
fn default_day_secs() -> u64 {
    86_400
}
fn default_week_secs() -> u64 {
    604_800
}
fn default_aggregation_interval_secs() -> u64 {
    300
}
fn default_minute_secs() -> u64 {
    60
}
fn default_db_path() -> String {
    "data/recommendations.db".to_string()
}
fn default_cpu_core_month() -> f64 {
    21.17
}
fn default_memory_gb_month() -> f64 {
    2.90
}

/// Lookback intervals, in seconds, per aggregation window.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AggregationWindows {
    #[serde(default = "default_day_secs")]
    pub peak: u64,
    #[serde(default = "default_day_secs")]
    pub off_peak: u64,
    #[serde(default = "default_week_secs")]
    pub weekly: u64,
}

impl Default for AggregationWindows {
    fn default() -> Self {
        Self {
            peak: default_day_secs(),
            off_peak: default_day_secs(),
            weekly: default_week_secs(),
        }
    }
}

impl AggregationWindows {
    pub fn lookback(&self, window: TimeWindow) -> Duration {
        let secs = match window {
            TimeWindow::Peak => self.peak,
            TimeWindow::OffPeak => self.off_peak,
            TimeWindow::Weekly => self.weekly,
            // Rollback recommendations are synthesized, not aggregated.
            TimeWindow::Rollback => 0,
        };
        Duration::seconds(secs as i64)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct EngineSettings {
    #[serde(default = "default_monitoring_window_secs")]
    pub monitoring_window_secs: u64,
    #[serde(default = "default_oom_kill_threshold")]
    pub oom_kill_threshold: i64,
    /// Action threshold for the rollback controller, as a fraction.
    #[serde(default = "default_throttle_increase_threshold")]
    pub throttle_increase_threshold: f64,
    /// Warning-only threshold used during reconcile of applied
    /// recommendations, as a percentage. Distinct from the action threshold.
    #[serde(default = "default_throttle_warn_percent")]
    pub throttle_warn_percent: f64,
    #[serde(default = "default_true")]
    pub auto_rollback_enabled: bool,
    #[serde(default = "default_memory_safety_margin")]
    pub memory_safety_margin: f64,
    #[serde(default = "default_apply_timeout_secs")]
    pub apply_timeout_secs: u64,
    #[serde(default)]
    pub aggregation_windows: AggregationWindows,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            monitoring_window_secs: default_monitoring_window_secs(),
            oom_kill_threshold: default_oom_kill_threshold(),
            throttle_increase_threshold: default_throttle_increase_threshold(),
            throttle_warn_percent: default_throttle_warn_percent(),
            auto_rollback_enabled: true,
            memory_safety_margin: default_memory_safety_margin(),
            apply_timeout_secs: default_apply_timeout_secs(),
            aggregation_windows: AggregationWindows::default(),
        }
    }
}

impl EngineSettings {
    pub fn monitoring_window(&self) -> Duration {
        Duration::seconds(self.monitoring_window_secs as i64)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LoopSettings {
    #[serde(default = "default_aggregation_interval_secs")]
    pub aggregation_interval_secs: u64,
    #[serde(default = "default_minute_secs")]
    pub outcome_poll_interval_secs: u64,
    #[serde(default = "default_minute_secs")]
    pub rollback_scan_interval_secs: u64,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            aggregation_interval_secs: default_aggregation_interval_secs(),
            outcome_poll_interval_secs: default_minute_secs(),
            rollback_scan_interval_secs: default_minute_secs(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct StorageSettings {
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

/// Per-namespace rate overrides. Missing fields fall back to the defaults.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct NamespaceRates {
    #[serde(default)]
    pub cpu_core_month: Option<f64>,
    #[serde(default)]
    pub memory_gb_month: Option<f64>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CostSettings {
    /// USD per vCPU-month.
    #[serde(default = "default_cpu_core_month")]
    pub cpu_core_month: f64,
    /// USD per GB-month.
    #[serde(default = "default_memory_gb_month")]
    pub memory_gb_month: f64,
    #[serde(default)]
    pub namespace_overrides: HashMap<String, NamespaceRates>,
}

impl Default for CostSettings {
    fn default() -> Self {
        Self {
            cpu_core_month: default_cpu_core_month(),
            memory_gb_month: default_memory_gb_month(),
            namespace_overrides: HashMap::new(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct AlertSettings {
    /// Webhook endpoint for rollback alerts. Empty disables the webhook
    /// alerter.
    #[serde(default)]
    pub webhook_url: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineSettings,
    #[serde(default)]
    pub loops: LoopSettings,
    #[serde(default)]
    pub storage: StorageSettings,
    #[serde(default)]
    pub cost: CostSettings,
    #[serde(default)]
    pub alerts: AlertSettings,
}
