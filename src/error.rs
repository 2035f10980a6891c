use thiserror::Error;

/// Errors raised while scheduling or processing accounts.
///
/// Every failure of a worker is reported through this type. Only
/// `Connection`, `Protocol` and `Timeout` are worth retrying; the rest are
/// surfaced as soon as they happen.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProcessingError {
    /// Invalid account, rule, feed or service definition.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The mail server could not be reached or refused the session.
    #[error("connection failed: {0}")]
    Connection(String),

    /// A fetch or post-process action failed on an established connection.
    #[error("mail protocol error: {0}")]
    Protocol(String),

    /// The run exceeded its processing time budget.
    #[error("timed out after {0} seconds")]
    Timeout(u64),

    /// A worker is already running for this account.
    #[error("account {0} is already being processed")]
    ConcurrencyConflict(String),

    /// A lifecycle command was issued while another transition was underway.
    #[error("{0}")]
    LifecycleConflict(String),

    /// The repository failed to load or store data.
    #[error("storage error: {0}")]
    Storage(String),

    /// The run was stopped by the supervisor.
    #[error("processing cancelled")]
    Cancelled,
}

impl ProcessingError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProcessingError::Connection(_) | ProcessingError::Protocol(_) | ProcessingError::Timeout(_)
        )
    }

    /// Short label used on the status surface.
    pub fn kind(&self) -> &'static str {
        match self {
            ProcessingError::Config(_) => "config",
            ProcessingError::Connection(_) => "connection",
            ProcessingError::Protocol(_) => "protocol",
            ProcessingError::Timeout(_) => "timeout",
            ProcessingError::ConcurrencyConflict(_) => "concurrency_conflict",
            ProcessingError::LifecycleConflict(_) => "lifecycle_conflict",
            ProcessingError::Storage(_) => "storage",
            ProcessingError::Cancelled => "cancelled",
        }
    }
}

impl From<sqlx::Error> for ProcessingError {
    fn from(err: sqlx::Error) -> Self {
        ProcessingError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for ProcessingError {
    fn from(err: serde_json::Error) -> Self {
        ProcessingError::Storage(format!("watermark encoding: {}", err))
    }
}

pub type Result<T> = std::result::Result<T, ProcessingError>;
