//! Unit-of-work surface used by the ORM.
//!
//! A [`SpannerSession`] owns one [`BatchAccumulator`] and at most one open
//! transaction. Writes are buffered with [`SpannerSession::enqueue`] and
//! executed on flush or commit. Outside an explicit transaction a flush runs
//! in an implicit read/write transaction that is committed straight away.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::batcher::{BatchAccumulator, FlushContext, FlushOutcome};
use crate::client::{
    ReadContext, Row, SpannerClient, TimestampBound, TransactionHandle, TransactionMode,
    TransactionOptions,
};
use crate::command::{DmlStatement, DualFormCommand};
use crate::config::BatchingConfig;
use crate::error::BatchError;
use crate::mutation_usage::MutationUsage;
use crate::sql_shape;

/// One ORM session bound to a database client.
///
/// Not shared between tasks; wrap it yourself if you must.
pub struct SpannerSession<C: SpannerClient + ?Sized> {
    client: Arc<C>,
    config: BatchingConfig,
    batch: BatchAccumulator,
    transaction: Option<TransactionHandle>,
    read_bound: Option<TimestampBound>,
    cancel: CancellationToken,
}

impl<C: SpannerClient + ?Sized> std::fmt::Debug for SpannerSession<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpannerSession")
            .field("config", &self.config)
            .field("batch", &self.batch)
            .field("transaction", &self.transaction)
            .field("read_bound", &self.read_bound)
            .field("cancel", &self.cancel)
            .finish_non_exhaustive()
    }
}

impl<C: SpannerClient + ?Sized> SpannerSession<C> {
    /// # Errors
    /// Returns `BatchError::Config` if `config` does not validate.
    pub fn new(client: Arc<C>, config: BatchingConfig) -> Result<Self, BatchError> {
        config.validate()?;
        Ok(Self {
            client,
            batch: BatchAccumulator::new(&config),
            config,
            transaction: None,
            read_bound: None,
            cancel: CancellationToken::new(),
        })
    }

    /// Replace the token checked before every database call.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    #[must_use]
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    #[must_use]
    pub fn client(&self) -> &Arc<C> {
        &self.client
    }

    #[must_use]
    pub fn config(&self) -> &BatchingConfig {
        &self.config
    }

    /// Commands waiting for the next flush.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.batch.len()
    }

    /// Session default applied when the transaction has no override.
    #[must_use]
    pub fn mutation_usage(&self) -> MutationUsage {
        self.batch.default_mutation_usage()
    }

    pub fn set_mutation_usage(&mut self, usage: MutationUsage) {
        debug!(%usage, "session mutation usage changed");
        self.batch.set_default_mutation_usage(usage);
    }

    #[must_use]
    pub fn in_transaction(&self) -> bool {
        self.transaction.is_some()
    }

    /// The live client transaction, if one is open.
    #[must_use]
    pub fn transaction(&self) -> Option<&TransactionHandle> {
        self.transaction.as_ref()
    }

    /// Mutable access to the live transaction, e.g. to set its mutation usage
    /// or disable internal retries.
    pub fn transaction_mut(&mut self) -> Option<&mut TransactionHandle> {
        self.transaction.as_mut()
    }

    /// Begin an explicit read/write transaction.
    ///
    /// # Errors
    /// - `BatchError::TransactionAlreadyActive` if one is already open
    /// - `BatchError::Cancelled`, `BatchError::Client`
    pub async fn begin_transaction(&mut self) -> Result<&mut TransactionHandle, BatchError> {
        let options = self.read_write_options(None);
        self.begin_with(options).await
    }

    /// Begin an explicit read/write transaction carrying a transaction tag.
    ///
    /// # Errors
    /// Same as [`begin_transaction`](Self::begin_transaction).
    pub async fn begin_transaction_with_tag(
        &mut self,
        tag: impl Into<String>,
    ) -> Result<&mut TransactionHandle, BatchError> {
        let options = self.read_write_options(Some(tag.into()));
        self.begin_with(options).await
    }

    /// Begin a read-only transaction reading at `bound`.
    ///
    /// # Errors
    /// - `BatchError::InvalidTimestampBound` for bounded-staleness bounds,
    ///   which only single-use reads accept
    /// - the errors of [`begin_transaction`](Self::begin_transaction)
    pub async fn begin_read_only_transaction(
        &mut self,
        bound: TimestampBound,
    ) -> Result<&mut TransactionHandle, BatchError> {
        if bound.is_single_use_only() {
            return Err(BatchError::InvalidTimestampBound(format!(
                "{bound} is only valid for single-use reads"
            )));
        }
        let options = TransactionOptions {
            mode: TransactionMode::ReadOnly(bound),
            retry_aborts: false,
            tag: None,
        };
        self.begin_with(options).await
    }

    fn read_write_options(&self, tag: Option<String>) -> TransactionOptions {
        TransactionOptions {
            mode: TransactionMode::ReadWrite,
            retry_aborts: self.config.retry_aborted_transactions,
            tag,
        }
    }

    async fn begin_with(
        &mut self,
        options: TransactionOptions,
    ) -> Result<&mut TransactionHandle, BatchError> {
        if self.transaction.is_some() {
            return Err(BatchError::TransactionAlreadyActive);
        }
        if self.cancel.is_cancelled() {
            return Err(BatchError::Cancelled);
        }
        let id = self.client.begin_transaction(&options).await?;
        info!(tx = %id, mode = ?options.mode, tag = ?options.tag, "transaction started");
        Ok(self
            .transaction
            .insert(TransactionHandle::new(id, &options, true)))
    }

    /// Buffer a write expecting `expected_rows` affected rows.
    ///
    /// Flushes when the batch reaches the configured size and returns that
    /// flush's outcome.
    ///
    /// # Errors
    /// - `BatchError::ReadOnlyTransaction` inside a read-only transaction
    /// - any error of the triggered flush
    pub async fn enqueue(
        &mut self,
        command: DualFormCommand,
        expected_rows: u64,
    ) -> Result<Option<FlushOutcome>, BatchError> {
        if self
            .transaction
            .as_ref()
            .is_some_and(TransactionHandle::is_read_only)
        {
            return Err(BatchError::ReadOnlyTransaction {
                pending: self.batch.len() + 1,
            });
        }
        if self.batch.push(command, expected_rows) {
            return self.flush().await.map(Some);
        }
        Ok(None)
    }

    /// Execute all buffered writes.
    ///
    /// Inside an explicit transaction the writes join it. Otherwise an
    /// implicit transaction is begun, flushed and committed; it is rolled
    /// back if the flush fails.
    ///
    /// # Errors
    /// Any error of [`BatchAccumulator::flush`], plus client errors from
    /// beginning or committing the implicit transaction.
    pub async fn flush(&mut self) -> Result<FlushOutcome, BatchError> {
        if self.batch.is_empty() {
            return Ok(FlushOutcome::default());
        }
        if let Some(tx) = &self.transaction {
            let ctx = FlushContext {
                client: self.client.as_ref(),
                transaction: tx,
                cancel: &self.cancel,
            };
            return self.batch.flush(ctx).await;
        }

        let options = self.read_write_options(None);
        if self.cancel.is_cancelled() {
            self.batch.clear();
            return Err(BatchError::Cancelled);
        }
        let id = match self.client.begin_transaction(&options).await {
            Ok(id) => id,
            Err(e) => {
                self.batch.clear();
                return Err(e.into());
            }
        };
        let tx = TransactionHandle::new(id, &options, false);
        debug!(tx = %id, "implicit transaction started");

        let ctx = FlushContext {
            client: self.client.as_ref(),
            transaction: &tx,
            cancel: &self.cancel,
        };
        match self.batch.flush(ctx).await {
            Ok(outcome) => {
                self.client.commit(&tx).await?;
                debug!(tx = %id, "implicit transaction committed");
                Ok(outcome)
            }
            Err(e) => {
                self.rollback_quietly(&tx).await;
                Err(e)
            }
        }
    }

    /// Flush pending writes and commit the open transaction.
    ///
    /// On a failed flush the transaction is rolled back and the error returned.
    ///
    /// # Errors
    /// - `BatchError::NoActiveTransaction`
    /// - any error of [`flush`](Self::flush), `BatchError::Cancelled`,
    ///   `BatchError::Client`
    pub async fn commit(&mut self) -> Result<FlushOutcome, BatchError> {
        let Some(tx) = self.transaction.take() else {
            return Err(BatchError::NoActiveTransaction);
        };
        let ctx = FlushContext {
            client: self.client.as_ref(),
            transaction: &tx,
            cancel: &self.cancel,
        };
        let outcome = match self.batch.flush(ctx).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.rollback_quietly(&tx).await;
                return Err(e);
            }
        };
        if self.cancel.is_cancelled() {
            self.rollback_quietly(&tx).await;
            return Err(BatchError::Cancelled);
        }
        self.client.commit(&tx).await?;
        info!(tx = %tx.id(), rows = outcome.rows_affected, "transaction committed");
        Ok(outcome)
    }

    /// Discard pending writes and roll back the open transaction.
    ///
    /// # Errors
    /// `BatchError::NoActiveTransaction`, `BatchError::Client`
    pub async fn rollback(&mut self) -> Result<(), BatchError> {
        let Some(tx) = self.transaction.take() else {
            return Err(BatchError::NoActiveTransaction);
        };
        let dropped = self.batch.len();
        self.batch.clear();
        self.client.rollback(&tx).await?;
        info!(tx = %tx.id(), dropped, "transaction rolled back");
        Ok(())
    }

    async fn rollback_quietly(&mut self, tx: &TransactionHandle) {
        self.batch.clear();
        if let Err(e) = self.client.rollback(tx).await {
            warn!(tx = %tx.id(), error = %e, "rollback failed");
        }
    }

    /// Run `f` inside an explicit transaction.
    ///
    /// Commits when `f` succeeds, rolls back otherwise. `f` must leave the
    /// transaction open.
    ///
    /// # Errors
    /// The error of `f`, or any error of [`begin_transaction`](Self::begin_transaction)
    /// and [`commit`](Self::commit).
    pub async fn transaction_scope<F, T>(&mut self, f: F) -> Result<T, BatchError>
    where
        F: for<'s> FnOnce(
                &'s mut Self,
            )
                -> Pin<Box<dyn Future<Output = Result<T, BatchError>> + Send + 's>>
            + Send,
        T: Send,
    {
        self.begin_transaction().await?;
        match f(self).await {
            Ok(v) => {
                self.commit().await?;
                Ok(v)
            }
            Err(e) => {
                if let Some(tx) = self.transaction.take() {
                    self.rollback_quietly(&tx).await;
                }
                Err(e)
            }
        }
    }

    /// Execute one DML statement directly in the open transaction.
    ///
    /// Pending writes are flushed first so the statement sees them.
    ///
    /// # Errors
    /// - `BatchError::NoActiveTransaction`
    /// - `BatchError::UnboundParameter` if the statement has unbound parameters
    /// - any error of [`flush`](Self::flush)
    pub async fn execute_dml(&mut self, stmt: &DmlStatement) -> Result<i64, BatchError> {
        if self.transaction.is_none() {
            return Err(BatchError::NoActiveTransaction);
        }
        self.flush().await?;
        let Some(tx) = &self.transaction else {
            return Err(BatchError::NoActiveTransaction);
        };
        if tx.is_read_only() {
            return Err(BatchError::ReadOnlyTransaction { pending: 1 });
        }
        stmt.bound_params()
            .map_err(|index| BatchError::UnboundParameter {
                table: sql_shape::parse(&stmt.sql)
                    .map(|shape| shape.table().to_owned())
                    .unwrap_or_default(),
                index,
            })?;
        if self.cancel.is_cancelled() {
            return Err(BatchError::Cancelled);
        }
        Ok(self.client.execute_dml(tx, stmt).await?)
    }

    /// Read at `bound` on the next single-use query only.
    ///
    /// # Errors
    /// `BatchError::InvalidTimestampBound` while a transaction is open; its
    /// reads use the transaction's own timestamp.
    pub fn set_read_timestamp_bound(&mut self, bound: TimestampBound) -> Result<(), BatchError> {
        if self.transaction.is_some() {
            return Err(BatchError::InvalidTimestampBound(format!(
                "{bound} cannot be applied inside a transaction"
            )));
        }
        self.read_bound = Some(bound);
        Ok(())
    }

    /// Bound that the next single-use query will use.
    #[must_use]
    pub fn pending_read_bound(&self) -> Option<TimestampBound> {
        self.read_bound
    }

    /// Run a query in the open transaction, or as a single-use read.
    ///
    /// A single-use read consumes the bound set by
    /// [`set_read_timestamp_bound`](Self::set_read_timestamp_bound) and
    /// defaults to a strong read.
    ///
    /// # Errors
    /// `BatchError::Cancelled`, `BatchError::Client`
    pub async fn query(&mut self, stmt: &DmlStatement) -> Result<Vec<Row>, BatchError> {
        if self.cancel.is_cancelled() {
            return Err(BatchError::Cancelled);
        }
        let rows = match &self.transaction {
            Some(tx) => {
                self.client
                    .query(ReadContext::Transaction(tx), stmt)
                    .await?
            }
            None => {
                let bound = self.read_bound.take().unwrap_or_default();
                debug!(%bound, "single-use read");
                self.client.query(ReadContext::SingleUse(bound), stmt).await?
            }
        };
        Ok(rows)
    }
}
