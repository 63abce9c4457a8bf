pub mod audit;
pub mod errors;
pub mod metrics;
pub mod tracing;

pub use crate::audit::{AuditEvent, AuditEventType, AuditLog};
pub use crate::errors::{PlatformError, PlatformResult};
pub use crate::metrics::init_metrics;
pub use crate::tracing::{init_tracing, instrument_operation, CorrelationId, LogFormat};
