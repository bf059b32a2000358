//! Error taxonomy surfaced by the planning core.

use thiserror::Error;

/// Errors returned by every public operation of the core.
///
/// The variants form a closed taxonomy: callers map them to transport
/// status codes and decide whether to retry from the variant alone.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    /// A referenced entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Input violates an invariant (bad ranking, overlapping events, ...).
    #[error("invalid: {0}")]
    Invalid(String),

    /// A state guard failed or an optimistic update lost a race.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A dependency (database, bus, catalog) failed transiently.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// A bug. Never retried automatically.
    #[error("internal error: {0}")]
    Internal(String),
}

pub type CoreResult<T> = Result<T, CoreError>;

impl CoreError {
    pub fn not_found(what: impl std::fmt::Display) -> Self {
        Self::NotFound(what.to_string())
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::Invalid(_) => "invalid",
            Self::Conflict(_) => "conflict",
            Self::Unavailable(_) => "unavailable",
            Self::Internal(_) => "internal",
        }
    }

    /// The human-readable explanation without the kind prefix.
    pub fn message(&self) -> &str {
        match self {
            Self::NotFound(m)
            | Self::Invalid(m)
            | Self::Conflict(m)
            | Self::Unavailable(m)
            | Self::Internal(m) => m,
        }
    }

    /// Only transient failures are worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Classify a sqlx error, using `message` as the explanation.
fn classify_sqlx(err: &sqlx::Error, message: String) -> CoreError {
    match err {
        sqlx::Error::RowNotFound => CoreError::NotFound(message),
        sqlx::Error::Database(db) => match db.code().as_deref() {
            Some("23505") => CoreError::Conflict(message),
            Some("23514" | "23P01" | "23503" | "23502") => CoreError::Invalid(message),
            // serialization_failure, deadlock_detected
            Some("40001" | "40P01") => CoreError::Unavailable(message),
            _ => CoreError::Internal(message),
        },
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => CoreError::Unavailable(message),
        _ => CoreError::Internal(message),
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        let message = err.to_string();
        classify_sqlx(&err, message)
    }
}

impl From<anyhow::Error> for CoreError {
    fn from(err: anyhow::Error) -> Self {
        if let Some(core) = err.downcast_ref::<CoreError>() {
            return core.clone();
        }
        let message = format!("{err:#}");
        match err.chain().find_map(|e| e.downcast_ref::<sqlx::Error>()) {
            Some(sqlx_err) => classify_sqlx(sqlx_err, message),
            None => CoreError::Internal(message),
        }
    }
}

impl From<mealplan_db::models::ParseEnumError> for CoreError {
    fn from(err: mealplan_db::models::ParseEnumError) -> Self {
        CoreError::Invalid(err.to_string())
    }
}
