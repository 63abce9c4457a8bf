use shared_types::Phase;
use thiserror::Error;

/// Typed error kinds surfaced by the lifecycle core. The state machine
/// branches on the kind: `ApplyFailed` is the only failure that moves a
/// recommendation (to `Failed`); everything else leaves phase untouched.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("recommendation {namespace}/{name} not found")]
    NotFound { namespace: String, name: String },

    #[error("recommendation {namespace}/{name} already exists")]
    AlreadyExists { namespace: String, name: String },

    #[error("{operation} is not permitted from phase {from}")]
    InvalidTransition { from: Phase, operation: &'static str },

    #[error("rollback of {namespace}/{name} requires captured previous resources")]
    PreconditionMissing { namespace: String, name: String },

    #[error("apply failed: {0}")]
    ApplyFailed(String),

    #[error("repository error: {0}")]
    Repository(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("deadline exceeded after {0} seconds")]
    DeadlineExceeded(u64),
}

pub type EngineResult<T> = Result<T, EngineError>;

impl EngineError {
    pub fn repository(err: impl std::fmt::Display) -> Self {
        EngineError::Repository(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_messages_carry_context() {
        let err = EngineError::InvalidTransition {
            from: Phase::Rejected,
            operation: "approve",
        };
        assert_eq!(err.to_string(), "approve is not permitted from phase rejected");

        let err = EngineError::NotFound {
            namespace: "payments".into(),
            name: "checkout-peak".into(),
        };
        assert!(err.to_string().contains("payments/checkout-peak"));
    }
}
