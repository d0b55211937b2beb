//! Error types for the process engine.
//!
//! Every fallible engine call returns [`EngineResult`]. The variants follow
//! the failure taxonomy of the execution core: concurrency conflicts and
//! fatal failures roll back the unit of work, business faults may be
//! converted into follow-up operations, job failures are retried by the
//! scheduler and lock loss is logged and discarded.

use thiserror::Error;

/// Result alias used throughout the engine.
pub type EngineResult<T> = Result<T, EngineError>;

/// Engine-level errors.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Optimistic revision mismatch (or duplicate insert) against the store.
    #[error("Concurrency conflict on {entity_type} '{id}': {message}")]
    ConcurrencyConflict {
        entity_type: String,
        id: String,
        message: String,
    },

    /// A modeled error condition raised by user logic.
    #[error("Business fault '{code}': {message}")]
    BusinessFault { code: String, message: String },

    /// A job handler failed.
    #[error("Job '{job_id}' failed: {message}")]
    JobFailed { job_id: String, message: String },

    /// The executing node no longer owns the job lock.
    #[error("Lock on job '{job_id}' is no longer held by '{owner}'")]
    LockLost { job_id: String, owner: String },

    /// Not found error
    #[error("Not found: {0}")]
    NotFound(String),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Storage backend error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Condition expression error
    #[error("Expression error: {0}")]
    Expression(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// The unit of work was parked at a breakpoint.
    #[error("Unit of work '{context_id}' suspended before '{node}'")]
    Suspended { context_id: String, node: String },

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Build a concurrency conflict for the given record.
    pub fn conflict(
        entity_type: impl Into<String>,
        id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::ConcurrencyConflict {
            entity_type: entity_type.into(),
            id: id.into(),
            message: message.into(),
        }
    }

    /// Build a business fault with an error code.
    pub fn business_fault(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::BusinessFault {
            code: code.into(),
            message: message.into(),
        }
    }

    /// True for optimistic locking failures.
    pub fn is_concurrency_conflict(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict { .. })
    }

    /// True for modeled business faults.
    pub fn is_business_fault(&self) -> bool {
        matches!(self, Self::BusinessFault { .. })
    }

    /// Short, stable label used in job exception details and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConcurrencyConflict { .. } => "concurrency_conflict",
            Self::BusinessFault { .. } => "business_fault",
            Self::JobFailed { .. } => "job_failed",
            Self::LockLost { .. } => "lock_lost",
            Self::NotFound(_) => "not_found",
            Self::Validation(_) => "validation",
            Self::Storage(_) => "storage",
            Self::Database(_) => "database",
            Self::Serialization(_) => "serialization",
            Self::Expression(_) => "expression",
            Self::Config(_) => "config",
            Self::Suspended { .. } => "suspended",
            Self::Internal(_) => "internal",
        }
    }
}

impl From<anyhow::Error> for EngineError {
    fn from(err: anyhow::Error) -> Self {
        EngineError::Internal(err.to_string())
    }
}

impl From<envy::Error> for EngineError {
    fn from(err: envy::Error) -> Self {
        EngineError::Config(err.to_string())
    }
}

impl From<serde_yaml::Error> for EngineError {
    fn from(err: serde_yaml::Error) -> Self {
        EngineError::Validation(format!("invalid definition: {}", err))
    }
}

impl From<minijinja::Error> for EngineError {
    fn from(err: minijinja::Error) -> Self {
        EngineError::Expression(err.to_string())
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::Storage(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_predicate() {
        let err = EngineError::conflict("execution", "e1", "revision 3 expected");
        assert!(err.is_concurrency_conflict());
        assert!(!err.is_business_fault());
        assert_eq!(err.kind(), "concurrency_conflict");
        assert!(err.to_string().contains("execution 'e1'"));
    }

    #[test]
    fn test_business_fault() {
        let err = EngineError::business_fault("PAYMENT_DECLINED", "card rejected");
        assert!(err.is_business_fault());
        assert_eq!(
            err.to_string(),
            "Business fault 'PAYMENT_DECLINED': card rejected"
        );
    }

    #[test]
    fn test_from_anyhow() {
        let err: EngineError = anyhow::anyhow!("boom").into();
        assert!(matches!(err, EngineError::Internal(msg) if msg == "boom"));
    }
}
