//! Mutation usage policy.
//!
//! Decides whether buffered writes are sent as structured mutations or as
//! textual DML. A transaction-scoped override wins over the session default.

use serde::{Deserialize, Serialize};

use crate::error::BatchError;

/// Whether writes should prefer structured mutations over textual DML.
///
/// # Variants
///
/// - `Unspecified`: defer to the next level (transaction -> session default).
/// - `Never`: always use DML. This is the default.
/// - `Always`: always use mutations; a DML-only command becomes a fatal error.
/// - `ImplicitTransactions`: use mutations only for writes outside an explicit
///   transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationUsage {
    Unspecified,
    #[default]
    Never,
    Always,
    ImplicitTransactions,
}

impl MutationUsage {
    /// Validate a value used as an explicit transaction override.
    ///
    /// Only `Never` and `Always` make sense for a single transaction.
    ///
    /// # Errors
    /// Returns `BatchError::InvalidMutationUsage` for any other value.
    pub fn for_transaction(self) -> Result<Self, BatchError> {
        match self {
            MutationUsage::Never | MutationUsage::Always => Ok(self),
            other => Err(BatchError::InvalidMutationUsage(other)),
        }
    }

    #[must_use]
    pub fn is_specified(self) -> bool {
        self != MutationUsage::Unspecified
    }
}

impl std::fmt::Display for MutationUsage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MutationUsage::Unspecified => "unspecified",
            MutationUsage::Never => "never",
            MutationUsage::Always => "always",
            MutationUsage::ImplicitTransactions => "implicit_transactions",
        };
        f.write_str(s)
    }
}

/// Inputs needed to pick the execution path for one flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageScope {
    /// Explicit override on the active transaction, if any.
    pub transaction: MutationUsage,
    /// Session / batch level default.
    pub default: MutationUsage,
    /// `true` when the flush runs inside a caller-started transaction.
    pub explicit_transaction: bool,
}

impl UsageScope {
    /// The usage that actually applies after precedence is resolved.
    #[must_use]
    pub fn effective(self) -> MutationUsage {
        if self.transaction.is_specified() {
            self.transaction
        } else if self.default.is_specified() {
            self.default
        } else {
            MutationUsage::Never
        }
    }

    /// Whether an eligible command should be routed to the mutation path.
    #[must_use]
    pub fn prefers_mutations(self) -> bool {
        match self.effective() {
            MutationUsage::Always => true,
            MutationUsage::ImplicitTransactions => !self.explicit_transaction,
            MutationUsage::Never | MutationUsage::Unspecified => false,
        }
    }
}
