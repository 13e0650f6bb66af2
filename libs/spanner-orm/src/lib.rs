#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
//! Mutation batching and optimistic version checks for `SeaORM` on Spanner.
//!
//! Every ORM write is captured as a [`DualFormCommand`]: a textual DML
//! statement plus, when its shape allows it, an equivalent structured
//! mutation. At flush time the [`BatchAccumulator`] picks one execution path
//! for the whole batch based on the effective [`MutationUsage`]:
//! - `never` (default): everything runs as DML, batched when there is more
//!   than one statement
//! - `always`: everything runs as mutations; a DML-only command fails the flush
//! - `implicit_transactions`: mutations only outside an explicit transaction
//!
//! Mutations address rows by primary key only, so versioned updates and
//! deletes routed to the mutation path are guarded by an eager version check
//! query ([`VersionCheckExecutor`]). Affected-row totals are reconciled
//! against what the ORM expected and a mismatch surfaces as
//! [`BatchError::StaleState`], which converts into `DbErr::RecordNotUpdated`.
//!
//! # Example
//! ```rust,no_run
//! use std::sync::Arc;
//! use spanner_orm::{
//!     BatchingConfig, EntityMapping, FixedColumn, MutationUsage, SpannerClient, SpannerSession,
//!     StatementClassifier, WriteKind,
//! };
//!
//! # async fn run<C: SpannerClient>(client: Arc<C>) -> spanner_orm::Result<()> {
//! let singers = EntityMapping::new("Singers")
//!     .key("SingerId")
//!     .column("FirstName")
//!     .column("LastName")
//!     .version("Version")
//!     .fixed(FixedColumn::commit_timestamp("LastUpdated"));
//!
//! let mut session = SpannerSession::new(client, BatchingConfig::default())?;
//! session.set_mutation_usage(MutationUsage::ImplicitTransactions);
//!
//! let mut insert = StatementClassifier.classify(&singers, WriteKind::Insert)?;
//! insert.set_parameter(0, "Marc")?;
//! insert.set_parameter(1, "Richards")?;
//! insert.set_parameter(2, 1_i64)?;
//! insert.set_parameter(3, 7_i64)?;
//! session.enqueue(insert, 1).await?;
//! session.flush().await?;
//! # Ok(())
//! # }
//! ```

pub mod batcher;
pub mod classifier;
pub mod client;
pub mod command;
pub mod config;
pub mod error;
pub mod mutation_usage;
pub mod session;
pub mod sql_shape;
pub mod version_check;

pub use batcher::{BatchAccumulator, FlushContext, FlushOutcome};
pub use classifier::{ColumnMapping, Discriminator, EntityMapping, FixedColumn, StatementClassifier};
pub use client::{
    ClientError, ReadContext, Row, SpannerClient, TimestampBound, TransactionHandle,
    TransactionId, TransactionMode, TransactionOptions,
};
pub use command::{
    ColumnValue, DmlStatement, DualFormCommand, Mutation, StructuredForm, VersionCheck, WriteKind,
};
pub use config::BatchingConfig;
pub use error::{BatchError, ClassifyError, StaleReason};
pub use mutation_usage::{MutationUsage, UsageScope};
pub use session::SpannerSession;
pub use version_check::VersionCheckExecutor;

pub type Result<T> = std::result::Result<T, BatchError>;
