//! Domain error model.

use thiserror::Error;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Keep this focused on deterministic business failures (validation,
/// lifecycle conflicts, stock shortfalls). Infrastructure concerns belong
/// elsewhere. The conflict family (`AlreadyAccepted`, `InvalidTransition`,
/// `InsufficientStock`, `Conflict`) maps to a 409-equivalent at the edge and
/// is never retried automatically by the core.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. zero units, missing blood group).
    #[error("validation failed: {0}")]
    Validation(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A requested resource was not found (domain-level).
    #[error("not found")]
    NotFound,

    /// The request's deadline has passed; it is no longer acceptable.
    #[error("request has expired")]
    Expired,

    /// Another actor already holds the acceptance for this request.
    #[error("request already accepted by another actor")]
    AlreadyAccepted,

    /// The requested lifecycle transition is not allowed from the current state.
    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    /// A stock reservation or batch deduction exceeds what is available.
    #[error("insufficient stock ({available} available, {requested} requested)")]
    InsufficientStock { available: i64, requested: u32 },

    /// An optimistic concurrency check failed (stale version).
    #[error("conflict: {0}")]
    Conflict(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn invalid_transition(msg: impl Into<String>) -> Self {
        Self::InvalidTransition(msg.into())
    }

    pub fn insufficient_stock(available: i64, requested: u32) -> Self {
        Self::InsufficientStock {
            available,
            requested,
        }
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn not_found() -> Self {
        Self::NotFound
    }

    /// Whether this error belongs to the conflict family (409-equivalent).
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Self::AlreadyAccepted
                | Self::InvalidTransition(_)
                | Self::InsufficientStock { .. }
                | Self::Conflict(_)
        )
    }
}
