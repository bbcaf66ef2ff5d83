use crate::model::{Hours, Money};

#[derive(Debug, Clone, PartialEq)]
pub enum EngineError {
    /// Requested interval overlaps a confirmed booking. Carries the conflict description.
    SlotConflict(String),
    InsufficientFunds {
        available: Money,
        required: Money,
    },
    InsufficientHours {
        remaining: Option<Hours>,
        required: Hours,
    },
    NotFound(String),
    Forbidden(&'static str),
    AlreadyExists(String),
    Invalid(String),
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    /// Short machine-readable kind, used as a metrics label.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::SlotConflict(_) => "slot_conflict",
            EngineError::InsufficientFunds { .. } => "insufficient_funds",
            EngineError::InsufficientHours { .. } => "insufficient_hours",
            EngineError::NotFound(_) => "not_found",
            EngineError::Forbidden(_) => "forbidden",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::Invalid(_) => "invalid",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::WalError(_) => "wal_error",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::SlotConflict(desc) => write!(f, "time slot is already booked: {desc}"),
            EngineError::InsufficientFunds { available, required } => write!(
                f,
                "insufficient funds (exceeds credit limit): available {available}, required {required}"
            ),
            EngineError::InsufficientHours {
                remaining: Some(remaining),
                required,
            } => write!(
                f,
                "insufficient subscription hours: remaining {remaining}, required {required}"
            ),
            EngineError::InsufficientHours {
                remaining: None,
                required,
            } => write!(f, "insufficient subscription hours: no subscription, required {required}"),
            EngineError::NotFound(what) => write!(f, "not found: {what}"),
            EngineError::Forbidden(msg) => write!(f, "not authorized: {msg}"),
            EngineError::AlreadyExists(what) => write!(f, "already exists: {what}"),
            EngineError::Invalid(msg) => write!(f, "invalid request: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
