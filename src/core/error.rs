use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DbError {
    #[error("{0} is closed")]
    Closed(String),

    #[error("{0} is not open")]
    NotOpen(String),

    #[error("Suspension conflict: '{0}' was opened by another instance while suspended")]
    SuspensionConflict(String),

    #[error("Substrate error during {operation}: {message}")]
    SubstrateError { operation: String, message: String },

    #[error("Mutation is not allowed on a read batch")]
    ReadOnlyBatch,

    #[error("Batch capacity of {0} operations exceeded")]
    BatchFull(usize),

    #[error("Invalid range: {0}")]
    InvalidRange(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Encoding error: {0}")]
    EncodingError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Partition '{0}' not found")]
    PartitionNotFound(String),

    #[error("Lock error: {0}")]
    LockError(String),
}

pub type Result<T> = std::result::Result<T, DbError>;

impl DbError {
    /// Build a substrate failure for `operation`.
    pub fn substrate(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::SubstrateError {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Prefix the operation context of a substrate failure.
    ///
    /// Other variants pass through untouched so that closed/destroyed errors
    /// keep their classification.
    pub fn during(self, context: &str) -> Self {
        match self {
            Self::SubstrateError { operation, message } => Self::SubstrateError {
                operation: format!("{}/{}", context, operation),
                message,
            },
            other => other,
        }
    }

    /// True for the closed/destroyed family of errors.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed(_) | Self::NotOpen(_))
    }
}

impl<T> From<std::sync::PoisonError<T>> for DbError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}
