//! Error types for the document library
//!
//! All errors use thiserror for structured error handling.
//! Every error maps to a stable [`ErrorKind`] so callers can branch on it
//! without parsing messages.

use serde::ser::SerializeStruct;
use serde::Serialize;
use thiserror::Error;

/// One offending field in a validation failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Stable, machine-checkable error classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    Forbidden,
    Unauthorized,
    InvalidState,
    ValidationFailed,
    InsufficientFunds,
    Conflict,
    ExternalStoreFailure,
    Internal,
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Validation failed ({} field errors)", .0.len())]
    ValidationFailed(Vec<FieldError>),

    #[error("Insufficient funds: required {required}, current {current}, deficit {deficit}")]
    InsufficientFunds {
        required: i64,
        current: i64,
        deficit: i64,
    },

    #[error("Conflict: {0}")]
    Conflict(String),

    /// Optimistic balance check lost a race; the unit of work is retried
    #[error("Concurrent update: {0}")]
    ConcurrentUpdate(String),

    #[error("Object store error: {0}")]
    ExternalStore(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Scheduler error: {0}")]
    Scheduler(String),
}

impl AppError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        AppError::NotFound {
            entity,
            id: id.into(),
        }
    }

    /// Single-field validation failure
    pub fn invalid_field(field: impl Into<String>, message: impl Into<String>) -> Self {
        AppError::ValidationFailed(vec![FieldError::new(field, message)])
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::NotFound { .. } => ErrorKind::NotFound,
            AppError::Forbidden(_) => ErrorKind::Forbidden,
            AppError::Unauthorized(_) => ErrorKind::Unauthorized,
            AppError::InvalidState(_) => ErrorKind::InvalidState,
            AppError::ValidationFailed(_) => ErrorKind::ValidationFailed,
            AppError::InsufficientFunds { .. } => ErrorKind::InsufficientFunds,
            AppError::Conflict(_) | AppError::ConcurrentUpdate(_) => ErrorKind::Conflict,
            AppError::ExternalStore(_) => ErrorKind::ExternalStoreFailure,
            AppError::Database(e) if is_unique_violation(e) => ErrorKind::Conflict,
            AppError::Database(_) => ErrorKind::ExternalStoreFailure,
            AppError::Io(_)
            | AppError::Serialization(_)
            | AppError::Config(_)
            | AppError::Scheduler(_) => ErrorKind::Internal,
        }
    }

    /// Whether retrying the whole unit of work may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::ConcurrentUpdate(_) => true,
            AppError::Database(e) => is_busy(e),
            _ => false,
        }
    }

    /// Turn a unique-constraint violation into a `Conflict` with the given message
    pub fn on_unique_violation(self, message: impl Into<String>) -> Self {
        match &self {
            AppError::Database(e) if is_unique_violation(e) => AppError::Conflict(message.into()),
            _ => self,
        }
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

/// SQLITE_BUSY (5) and SQLITE_LOCKED (6), including their extended codes
fn is_busy(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db
            .code()
            .and_then(|code| code.parse::<i32>().ok())
            .map(|code| matches!(code & 0xff, 5 | 6))
            .unwrap_or(false),
        _ => false,
    }
}

impl Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut state = serializer.serialize_struct("AppError", 3)?;
        state.serialize_field("kind", &self.kind())?;
        state.serialize_field("message", &self.to_string())?;
        match self {
            AppError::ValidationFailed(errors) => state.serialize_field("details", errors)?,
            AppError::InsufficientFunds {
                required,
                current,
                deficit,
            } => state.serialize_field(
                "details",
                &serde_json::json!({
                    "required": required,
                    "current": current,
                    "deficit": deficit,
                }),
            )?,
            _ => state.skip_field("details")?,
        }
        state.end()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
