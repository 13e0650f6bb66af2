//! Database client seam.
//!
//! [`SpannerClient`] is the only way this crate talks to the database. The
//! native client owns sessions, retries of aborted transactions and the wire
//! protocol; none of that is reimplemented here.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::command::{DmlStatement, Mutation};
use crate::mutation_usage::MutationUsage;

/// Errors surfaced by the database client.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    /// Transaction was aborted by the database; retrying the whole transaction may succeed.
    #[error("transaction aborted: {0}")]
    Aborted(String),

    #[error("row not found: {0}")]
    NotFound(String),

    #[error("row already exists: {0}")]
    AlreadyExists(String),

    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    #[error("{0}")]
    Permanent(String),
}

impl ClientError {
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, ClientError::Aborted(_))
    }
}

/// Identifier the client assigns to a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionId(pub Uuid);

impl TransactionId {
    #[must_use]
    pub fn new_v4() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Read timestamp selection for read-only work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimestampBound {
    #[default]
    Strong,
    ReadTimestamp(DateTime<Utc>),
    MinReadTimestamp(DateTime<Utc>),
    ExactStaleness(Duration),
    MaxStaleness(Duration),
}

impl TimestampBound {
    /// Bounded staleness lets the server pick the timestamp, which only a
    /// single-use read can do.
    #[must_use]
    pub fn is_single_use_only(&self) -> bool {
        matches!(
            self,
            TimestampBound::MinReadTimestamp(_) | TimestampBound::MaxStaleness(_)
        )
    }
}

impl std::fmt::Display for TimestampBound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimestampBound::Strong => write!(f, "strong"),
            TimestampBound::ReadTimestamp(t) => write!(f, "read_timestamp({})", t.to_rfc3339()),
            TimestampBound::MinReadTimestamp(t) => {
                write!(f, "min_read_timestamp({})", t.to_rfc3339())
            }
            TimestampBound::ExactStaleness(d) => write!(f, "exact_staleness({}ms)", d.as_millis()),
            TimestampBound::MaxStaleness(d) => write!(f, "max_staleness({}ms)", d.as_millis()),
        }
    }
}

/// Kind of transaction to begin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionMode {
    #[default]
    ReadWrite,
    ReadOnly(TimestampBound),
}

/// Options passed to [`SpannerClient::begin_transaction`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TransactionOptions {
    pub mode: TransactionMode,
    /// Let the client transparently retry aborted transactions.
    pub retry_aborts: bool,
    pub tag: Option<String>,
}

/// Live transaction as seen by the session and the batcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionHandle {
    id: TransactionId,
    mode: TransactionMode,
    mutation_usage: MutationUsage,
    retry_aborts: bool,
    tag: Option<String>,
    explicit: bool,
}

impl TransactionHandle {
    #[must_use]
    pub fn new(id: TransactionId, options: &TransactionOptions, explicit: bool) -> Self {
        Self {
            id,
            mode: options.mode,
            mutation_usage: MutationUsage::Unspecified,
            retry_aborts: options.retry_aborts,
            tag: options.tag.clone(),
            explicit,
        }
    }

    #[must_use]
    pub fn id(&self) -> TransactionId {
        self.id
    }

    #[must_use]
    pub fn mode(&self) -> TransactionMode {
        self.mode
    }

    #[must_use]
    pub fn is_read_only(&self) -> bool {
        matches!(self.mode, TransactionMode::ReadOnly(_))
    }

    /// `false` for transactions the session began on its own for a flush.
    #[must_use]
    pub fn is_explicit(&self) -> bool {
        self.explicit
    }

    #[must_use]
    pub fn mutation_usage(&self) -> MutationUsage {
        self.mutation_usage
    }

    /// Override the mutation usage for this transaction only.
    ///
    /// # Errors
    /// Returns `BatchError::InvalidMutationUsage` unless `usage` is `Never` or `Always`.
    pub fn set_mutation_usage(&mut self, usage: MutationUsage) -> Result<(), crate::BatchError> {
        self.mutation_usage = usage.for_transaction()?;
        Ok(())
    }

    #[must_use]
    pub fn retries_enabled(&self) -> bool {
        self.retry_aborts
    }

    /// Stop the client from transparently retrying this transaction when it aborts.
    pub fn disable_internal_retries(&mut self) {
        self.retry_aborts = false;
    }

    #[must_use]
    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }
}

/// Where a query reads from.
#[derive(Debug, Clone, Copy)]
pub enum ReadContext<'a> {
    Transaction(&'a TransactionHandle),
    SingleUse(TimestampBound),
}

/// One result row, values in projection order.
pub type Row = Vec<Value>;

/// Operations the batcher and session need from the native client.
///
/// Every method is a network round trip.
#[async_trait]
pub trait SpannerClient: Send + Sync {
    async fn begin_transaction(
        &self,
        options: &TransactionOptions,
    ) -> Result<TransactionId, ClientError>;

    async fn commit(&self, tx: &TransactionHandle) -> Result<(), ClientError>;

    async fn rollback(&self, tx: &TransactionHandle) -> Result<(), ClientError>;

    /// Execute one DML statement, returning the affected row count.
    async fn execute_dml(
        &self,
        tx: &TransactionHandle,
        stmt: &DmlStatement,
    ) -> Result<i64, ClientError>;

    /// Execute several DML statements in one call, returning per-statement counts.
    async fn execute_batch_dml(
        &self,
        tx: &TransactionHandle,
        stmts: &[DmlStatement],
    ) -> Result<Vec<i64>, ClientError>;

    /// Buffer a mutation; it is applied when the transaction commits.
    async fn buffer_mutation(
        &self,
        tx: &TransactionHandle,
        mutation: &Mutation,
    ) -> Result<(), ClientError>;

    async fn query(
        &self,
        ctx: ReadContext<'_>,
        stmt: &DmlStatement,
    ) -> Result<Vec<Row>, ClientError>;
}
