//! Error types for classification, batching and the session surface.

use sea_orm::{DbErr, RuntimeErr};
use sqlparser::parser::ParserError;
use thiserror::Error;

use crate::client::ClientError;
use crate::mutation_usage::MutationUsage;

/// Why a textual write statement could not be turned into a structured form.
///
/// This never escapes the classifier: the command simply stays DML-only.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed statement: {message}")]
pub struct ClassifyError {
    pub message: String,
}

impl ClassifyError {
    pub(crate) fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<ParserError> for ClassifyError {
    fn from(err: ParserError) -> Self {
        Self::new(err.to_string())
    }
}

/// Errors raised while accumulating, flushing or managing transactions.
#[derive(Debug, Error)]
pub enum BatchError {
    #[error(transparent)]
    MalformedStatement(#[from] ClassifyError),

    /// The flush would mix DML and mutations, or DML under an `always` policy.
    #[error("batch cannot be executed: {dml} DML command(s) and {mutations} mutation(s) under policy '{usage}'")]
    MixedBatch {
        dml: usize,
        mutations: usize,
        usage: MutationUsage,
    },

    /// A row was concurrently changed or deleted.
    #[error("stale state for table '{table}': {reason}")]
    StaleState { table: String, reason: StaleReason },

    #[error("unbound parameter {index} in write to '{table}'")]
    UnboundParameter { table: String, index: usize },

    #[error("parameter index {index} out of range for '{table}' ({count} parameter(s))")]
    ParameterOutOfRange {
        table: String,
        index: usize,
        count: usize,
    },

    #[error("invalid mapping for '{table}': {message}")]
    InvalidMapping { table: String, message: String },

    #[error("mutation usage '{0}' cannot be set on a transaction; use 'never' or 'always'")]
    InvalidMutationUsage(MutationUsage),

    #[error("invalid timestamp bound: {0}")]
    InvalidTimestampBound(String),

    #[error("cannot write {pending} pending command(s) inside a read-only transaction")]
    ReadOnlyTransaction { pending: usize },

    #[error("no active transaction")]
    NoActiveTransaction,

    #[error("a transaction is already active on this session")]
    TransactionAlreadyActive,

    #[error("operation cancelled")]
    Cancelled,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Client(#[from] ClientError),
}

/// Detail for [`BatchError::StaleState`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StaleReason {
    /// The version check found no row with the expected key and version.
    VersionMismatch,
    /// Actual affected rows differ from what the ORM expected.
    RowCount { expected: u64, actual: u64 },
}

impl std::fmt::Display for StaleReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StaleReason::VersionMismatch => {
                write!(f, "row was updated or deleted by another transaction")
            }
            StaleReason::RowCount { expected, actual } => {
                write!(f, "expected {expected} affected row(s), got {actual}")
            }
        }
    }
}

impl BatchError {
    #[must_use]
    pub fn is_stale_state(&self) -> bool {
        matches!(self, BatchError::StaleState { .. })
    }

    /// Whether the failure came from a transient client abort the caller may retry.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, BatchError::Client(e) if e.is_retryable())
    }
}

/// Translate into the ORM's error type so optimistic-concurrency handling keeps working.
impl From<BatchError> for DbErr {
    fn from(err: BatchError) -> Self {
        match err {
            BatchError::StaleState { .. } => DbErr::RecordNotUpdated,
            BatchError::Client(e) => DbErr::Exec(RuntimeErr::Internal(e.to_string())),
            other => DbErr::Custom(other.to_string()),
        }
    }
}
