//! Optimistic version checks for the mutation path.
//!
//! A mutation addresses its row by primary key only, so it cannot carry the
//! `AND version = ?` predicate that makes a DML update fail on a stale row.
//! Before a versioned update/delete is sent as a mutation, an existence query
//! confirms the row still has the expected version. This costs one extra
//! round trip per versioned write on the mutation path.

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::client::{ReadContext, SpannerClient, TransactionHandle};
use crate::command::DualFormCommand;
use crate::error::{BatchError, StaleReason};

/// Runs the version check query for versioned commands.
#[derive(Debug, Clone, Copy, Default)]
pub struct VersionCheckExecutor;

impl VersionCheckExecutor {
    /// Verify that the row targeted by `command` still carries the expected version.
    ///
    /// Commands without a version check (inserts, unversioned entities,
    /// DML-only commands) pass without a round trip.
    ///
    /// # Errors
    /// - `BatchError::StaleState` if no row matches key and version
    /// - `BatchError::Cancelled` if `cancel` fired before the query
    /// - `BatchError::Client` if the query fails
    #[allow(clippy::unused_self)]
    #[tracing::instrument(level = "debug", skip_all, fields(table = %command.table()))]
    pub async fn verify<C>(
        &self,
        client: &C,
        tx: &TransactionHandle,
        command: &DualFormCommand,
        cancel: &CancellationToken,
    ) -> Result<(), BatchError>
    where
        C: SpannerClient + ?Sized,
    {
        let Some(check) = command.version_check() else {
            return Ok(());
        };
        let stmt = check.statement(command.textual())?;
        if cancel.is_cancelled() {
            return Err(BatchError::Cancelled);
        }
        let rows = client.query(ReadContext::Transaction(tx), &stmt).await?;
        match rows.len() {
            0 => {
                warn!(
                    table = %check.table,
                    version_column = %check.version_column,
                    "version check found no matching row"
                );
                Err(BatchError::StaleState {
                    table: check.table.clone(),
                    reason: StaleReason::VersionMismatch,
                })
            }
            n => {
                debug!(rows = n, "version check passed");
                Ok(())
            }
        }
    }

    /// Check every command in order, stopping at the first conflict.
    ///
    /// # Errors
    /// See [`verify`](Self::verify).
    pub async fn verify_all<C>(
        &self,
        client: &C,
        tx: &TransactionHandle,
        commands: &[DualFormCommand],
        cancel: &CancellationToken,
    ) -> Result<usize, BatchError>
    where
        C: SpannerClient + ?Sized,
    {
        let mut checked = 0;
        for command in commands {
            if command.version_check().is_some() {
                self.verify(client, tx, command, cancel).await?;
                checked += 1;
            }
        }
        Ok(checked)
    }
}
