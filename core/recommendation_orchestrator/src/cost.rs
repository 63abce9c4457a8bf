//! Pure cost accounting: resource requests priced at per-namespace rates.
//! Costs are computed from the request fields, since requests are what the
//! cluster reserves and bills for.

use chrono::Utc;
use shared_types::{CostSettings, CostSnapshot, Recommendation, ResourceCost, ResourceSpec};

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;
const MONTHS_PER_YEAR: f64 = 12.0;

#[derive(Clone)]
pub struct CostCalculator {
    settings: CostSettings,
}

impl CostCalculator {
    pub fn new(settings: CostSettings) -> Self {
        Self { settings }
    }

    /// Effective (cpu, memory) rates for a namespace, falling back to the
    /// defaults for any field the override leaves unset.
    fn rates_for(&self, namespace: &str) -> (f64, f64) {
        match self.settings.namespace_overrides.get(namespace) {
            Some(rates) => (
                rates.cpu_core_month.unwrap_or(self.settings.cpu_core_month),
                rates.memory_gb_month.unwrap_or(self.settings.memory_gb_month),
            ),
            None => (self.settings.cpu_core_month, self.settings.memory_gb_month),
        }
    }

    /// Monthly cost of a resource request. Absent fields cost nothing.
    pub fn monthly_cost(&self, namespace: &str, resources: &ResourceSpec) -> f64 {
        let (cpu_rate, mem_rate) = self.rates_for(namespace);
        let cores = resources.cpu_request_millicores.unwrap_or(0) as f64 / 1_000.0;
        let gib = resources.memory_request_bytes.unwrap_or(0) as f64 / GIB;
        cores * cpu_rate + gib * mem_rate
    }

    pub fn cost(&self, namespace: &str, resources: &ResourceSpec) -> ResourceCost {
        let monthly = self.monthly_cost(namespace, resources);
        ResourceCost {
            monthly,
            annual: monthly * MONTHS_PER_YEAR,
        }
    }

    /// Monthly savings of moving from `current` to `proposed`. Negative when
    /// the proposal costs more; increases stay visible in reports.
    pub fn monthly_savings(
        &self,
        namespace: &str,
        current: &ResourceSpec,
        proposed: &ResourceSpec,
    ) -> f64 {
        self.monthly_cost(namespace, current) - self.monthly_cost(namespace, proposed)
    }

    /// Cost snapshot for one recommendation, persisted per aggregation.
    pub fn snapshot(&self, rec: &Recommendation) -> CostSnapshot {
        let current_monthly = self.monthly_cost(&rec.namespace, &rec.current);
        let proposed_monthly = self.monthly_cost(&rec.namespace, &rec.proposed);
        CostSnapshot {
            recommendation_id: rec.id,
            namespace: rec.namespace.clone(),
            current_monthly,
            proposed_monthly,
            monthly_savings: current_monthly - proposed_monthly,
            computed_at: Utc::now(),
        }
    }
}
