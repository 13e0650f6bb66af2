//! Batch accumulation and flushing.
//!
//! Buffered [`DualFormCommand`]s are executed at flush time either as DML
//! (batched when there is more than one statement) or as structured mutations.
//! A single flush never mixes the two.

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::{SpannerClient, TransactionHandle};
use crate::command::{DmlStatement, DualFormCommand, Mutation};
use crate::config::BatchingConfig;
use crate::error::{BatchError, StaleReason};
use crate::mutation_usage::{MutationUsage, UsageScope};
use crate::version_check::VersionCheckExecutor;

/// Everything a flush needs from the surrounding session.
pub struct FlushContext<'a, C: ?Sized> {
    pub client: &'a C,
    pub transaction: &'a TransactionHandle,
    pub cancel: &'a CancellationToken,
}

impl<C: ?Sized> Clone for FlushContext<'_, C> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<C: ?Sized> Copy for FlushContext<'_, C> {}

/// Result of a successful flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushOutcome {
    pub dml_statements: usize,
    pub mutations: usize,
    pub version_checks: usize,
    pub rows_affected: u64,
}

/// Commands split by execution path.
#[derive(Debug, Default)]
pub struct Partition {
    pub dml: Vec<DualFormCommand>,
    pub mutations: Vec<DualFormCommand>,
}

/// Route each command: mutations when the scope prefers them and the command
/// has a structured form, DML otherwise.
#[must_use]
pub fn partition(commands: Vec<DualFormCommand>, scope: UsageScope) -> Partition {
    let prefer = scope.prefers_mutations();
    let (mutations, dml) = commands
        .into_iter()
        .partition(|c| prefer && c.has_structured_form());
    Partition { dml, mutations }
}

/// Buffers writes for one session and flushes them in batches.
///
/// Owned by a single session; not meant to be shared across tasks.
#[derive(Debug)]
pub struct BatchAccumulator {
    batch_size: usize,
    default_usage: MutationUsage,
    commands: Vec<DualFormCommand>,
    expected_rows: u64,
    version_checker: VersionCheckExecutor,
}

impl BatchAccumulator {
    #[must_use]
    pub fn new(config: &BatchingConfig) -> Self {
        Self {
            batch_size: config.batch_size.max(1),
            default_usage: config.default_mutation_usage,
            commands: Vec::new(),
            expected_rows: 0,
            version_checker: VersionCheckExecutor,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    #[must_use]
    pub fn expected_rows(&self) -> u64 {
        self.expected_rows
    }

    #[must_use]
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    #[must_use]
    pub fn default_mutation_usage(&self) -> MutationUsage {
        self.default_usage
    }

    pub fn set_default_mutation_usage(&mut self, usage: MutationUsage) {
        self.default_usage = usage;
    }

    /// Drop all buffered commands without executing them.
    pub fn clear(&mut self) {
        self.commands.clear();
        self.expected_rows = 0;
    }

    /// Buffer a command, flushing when the batch reaches its configured size.
    ///
    /// Returns the flush outcome if a flush was triggered.
    ///
    /// # Errors
    /// Any error from the triggered flush.
    pub async fn accumulate<C>(
        &mut self,
        command: DualFormCommand,
        expected_rows: u64,
        ctx: FlushContext<'_, C>,
    ) -> Result<Option<FlushOutcome>, BatchError>
    where
        C: SpannerClient + ?Sized,
    {
        if self.push(command, expected_rows) {
            return self.flush(ctx).await.map(Some);
        }
        Ok(None)
    }

    /// Buffer a command without flushing; returns `true` once the batch is full.
    pub fn push(&mut self, command: DualFormCommand, expected_rows: u64) -> bool {
        debug!(
            table = %command.table(),
            kind = %command.kind(),
            structured = command.has_structured_form(),
            "accumulating command"
        );
        self.commands.push(command);
        self.expected_rows += expected_rows;
        self.is_full()
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.commands.len() >= self.batch_size
    }

    /// Execute everything buffered so far.
    ///
    /// The buffer is cleared before anything runs, so a failed flush never
    /// replays its commands.
    ///
    /// # Errors
    /// - `BatchError::MixedBatch` if DML and mutations would be mixed, or DML
    ///   is required under an `always` policy; nothing is executed
    /// - `BatchError::StaleState` on a failed version check (no mutation is
    ///   sent) or an affected-row mismatch
    /// - `BatchError::ReadOnlyTransaction`, `BatchError::UnboundParameter`
    /// - `BatchError::Cancelled`, `BatchError::Client`
    #[tracing::instrument(level = "debug", skip_all, fields(tx = %ctx.transaction.id()))]
    pub async fn flush<C>(&mut self, ctx: FlushContext<'_, C>) -> Result<FlushOutcome, BatchError>
    where
        C: SpannerClient + ?Sized,
    {
        let commands = std::mem::take(&mut self.commands);
        let expected = std::mem::take(&mut self.expected_rows);
        if commands.is_empty() {
            return Ok(FlushOutcome::default());
        }
        if ctx.transaction.is_read_only() {
            return Err(BatchError::ReadOnlyTransaction {
                pending: commands.len(),
            });
        }

        let scope = UsageScope {
            transaction: ctx.transaction.mutation_usage(),
            default: self.default_usage,
            explicit_transaction: ctx.transaction.is_explicit(),
        };
        let Partition { dml, mut mutations } = partition(commands, scope);
        let usage = scope.effective();

        if !dml.is_empty() && (!mutations.is_empty() || usage == MutationUsage::Always) {
            warn!(
                dml = dml.len(),
                mutations = mutations.len(),
                %usage,
                "refusing to execute mixed batch"
            );
            return Err(BatchError::MixedBatch {
                dml: dml.len(),
                mutations: mutations.len(),
                usage,
            });
        }

        let statements = bind_statements(&dml)?;
        let prepared = prepare_mutations(&mut mutations)?;

        // Conflicts must surface before any mutation is buffered.
        let version_checks = self
            .version_checker
            .verify_all(ctx.client, ctx.transaction, &mutations, ctx.cancel)
            .await?;

        // DML first: its effects are visible to later reads in this transaction,
        // mutations only after commit.
        let mut actual = execute_statements(ctx, &statements).await?;

        for m in &prepared {
            if ctx.cancel.is_cancelled() {
                return Err(BatchError::Cancelled);
            }
            ctx.client.buffer_mutation(ctx.transaction, m).await?;
            actual += 1;
        }

        if actual != expected {
            let table = first_table(&dml, &mutations);
            warn!(%table, expected, actual, "affected row count mismatch");
            return Err(BatchError::StaleState {
                table,
                reason: StaleReason::RowCount { expected, actual },
            });
        }

        let outcome = FlushOutcome {
            dml_statements: statements.len(),
            mutations: prepared.len(),
            version_checks,
            rows_affected: actual,
        };
        info!(
            dml = outcome.dml_statements,
            mutations = outcome.mutations,
            version_checks = outcome.version_checks,
            rows = outcome.rows_affected,
            "batch flushed"
        );
        Ok(outcome)
    }
}

fn bind_statements(dml: &[DualFormCommand]) -> Result<Vec<DmlStatement>, BatchError> {
    dml.iter()
        .map(|c| {
            let params = c
                .textual()
                .bound_params()
                .map_err(|index| BatchError::UnboundParameter {
                    table: c.table().to_owned(),
                    index,
                })?;
            Ok(DmlStatement::with_params(c.textual().sql.clone(), params))
        })
        .collect()
}

fn prepare_mutations(commands: &mut [DualFormCommand]) -> Result<Vec<Mutation>, BatchError> {
    let mut prepared = Vec::with_capacity(commands.len());
    for c in commands {
        c.finalize_structured()?;
        if let Some(m) = c.to_mutation()? {
            prepared.push(m);
        }
    }
    Ok(prepared)
}

/// One direct call for a single statement, one batch call for several.
async fn execute_statements<C>(
    ctx: FlushContext<'_, C>,
    statements: &[DmlStatement],
) -> Result<u64, BatchError>
where
    C: SpannerClient + ?Sized,
{
    if statements.is_empty() {
        return Ok(0);
    }
    if ctx.cancel.is_cancelled() {
        return Err(BatchError::Cancelled);
    }
    if let [single] = statements {
        let n = ctx.client.execute_dml(ctx.transaction, single).await?;
        return Ok(n.max(0).unsigned_abs());
    }
    let counts = ctx
        .client
        .execute_batch_dml(ctx.transaction, statements)
        .await?;
    Ok(counts.iter().map(|n| (*n).max(0).unsigned_abs()).sum())
}

fn first_table(dml: &[DualFormCommand], mutations: &[DualFormCommand]) -> String {
    dml.iter()
        .chain(mutations)
        .next()
        .map(|c| c.table().to_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::{EntityMapping, StatementClassifier};
    use crate::command::WriteKind;

    fn commands() -> Vec<DualFormCommand> {
        let mapping = EntityMapping::new("T").key("Id").column("A");
        let dual = StatementClassifier
            .classify(&mapping, WriteKind::Insert)
            .unwrap();
        let dml_only = StatementClassifier.classify_statement(
            &mapping,
            WriteKind::Update,
            DmlStatement::new("UPDATE T SET A = A + 1 WHERE Id = ?", 1),
        );
        vec![dual, dml_only]
    }

    fn scope(usage: MutationUsage, explicit: bool) -> UsageScope {
        UsageScope {
            transaction: MutationUsage::Unspecified,
            default: usage,
            explicit_transaction: explicit,
        }
    }

    #[test]
    fn test_partition_never_routes_everything_to_dml() {
        let p = partition(commands(), scope(MutationUsage::Never, true));
        assert_eq!(p.dml.len(), 2);
        assert!(p.mutations.is_empty());
    }

    #[test]
    fn test_partition_always_keeps_dml_only_commands_on_dml() {
        let p = partition(commands(), scope(MutationUsage::Always, true));
        assert_eq!(p.mutations.len(), 1);
        assert_eq!(p.dml.len(), 1);
        assert!(!p.dml[0].has_structured_form());
    }

    #[test]
    fn test_partition_implicit_transactions() {
        let p = partition(
            commands(),
            scope(MutationUsage::ImplicitTransactions, false),
        );
        assert_eq!(p.mutations.len(), 1);

        let p = partition(
            commands(),
            scope(MutationUsage::ImplicitTransactions, true),
        );
        assert!(p.mutations.is_empty());
    }

    #[test]
    fn test_new_clamps_batch_size() {
        let cfg = BatchingConfig {
            batch_size: 0,
            ..BatchingConfig::default()
        };
        assert_eq!(BatchAccumulator::new(&cfg).batch_size(), 1);
    }
}
