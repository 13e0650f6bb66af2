//! Batching configuration.

use figment::Figment;
use figment::providers::{Env, Serialized};
use serde::{Deserialize, Serialize};

use crate::error::BatchError;
use crate::mutation_usage::MutationUsage;

/// Figment key the config is read from.
pub const CONFIG_KEY: &str = "spanner_orm";

/// Prefix for environment overrides, e.g. `SPANNER_ORM_BATCH_SIZE=50`.
pub const ENV_PREFIX: &str = "SPANNER_ORM_";

/// Session-level batching settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchingConfig {
    /// Commands buffered before a flush is forced (default: 100)
    pub batch_size: usize,
    /// Mutation usage applied when a transaction has no override (default: never)
    pub default_mutation_usage: MutationUsage,
    /// Let the client retry aborted read/write transactions (default: true)
    pub retry_aborted_transactions: bool,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            default_mutation_usage: MutationUsage::Never,
            retry_aborted_transactions: true,
        }
    }
}

impl BatchingConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    #[must_use]
    pub fn with_default_mutation_usage(mut self, usage: MutationUsage) -> Self {
        self.default_mutation_usage = usage;
        self
    }

    #[must_use]
    pub fn with_retry_aborted_transactions(mut self, retry: bool) -> Self {
        self.retry_aborted_transactions = retry;
        self
    }

    /// # Errors
    /// Returns `BatchError::Config` if `batch_size` is zero.
    pub fn validate(&self) -> Result<(), BatchError> {
        if self.batch_size == 0 {
            return Err(BatchError::Config(
                "batch_size must be at least 1".to_owned(),
            ));
        }
        Ok(())
    }

    /// Read the `spanner_orm` section of an application figment.
    ///
    /// A missing section yields the defaults.
    ///
    /// # Errors
    /// Returns `BatchError::Config` if the section cannot be deserialized or
    /// fails validation.
    pub fn from_figment(figment: &Figment) -> Result<Self, BatchError> {
        let config = if figment.contains(CONFIG_KEY) {
            figment
                .extract_inner::<Self>(CONFIG_KEY)
                .map_err(|e| BatchError::Config(e.to_string()))?
        } else {
            Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by `SPANNER_ORM_*` environment variables.
    ///
    /// # Errors
    /// Same as [`from_figment`](Self::from_figment).
    pub fn from_env() -> Result<Self, BatchError> {
        let figment = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Env::prefixed(ENV_PREFIX));
        let config: Self = figment
            .extract()
            .map_err(|e| BatchError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = BatchingConfig::default();
        assert_eq!(cfg.batch_size, 100);
        assert_eq!(cfg.default_mutation_usage, MutationUsage::Never);
        assert!(cfg.retry_aborted_transactions);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_zero_batch_size_is_rejected() {
        let cfg = BatchingConfig::new().with_batch_size(0);
        assert!(matches!(cfg.validate(), Err(BatchError::Config(_))));
    }

    #[test]
    fn test_from_figment_section() {
        let figment = Figment::new().merge(Serialized::defaults(serde_json::json!({
            "spanner_orm": {
                "batch_size": 25,
                "default_mutation_usage": "implicit_transactions"
            }
        })));
        let cfg = BatchingConfig::from_figment(&figment).unwrap();
        assert_eq!(cfg.batch_size, 25);
        assert_eq!(
            cfg.default_mutation_usage,
            MutationUsage::ImplicitTransactions
        );
        assert!(cfg.retry_aborted_transactions);
    }

    #[test]
    fn test_from_figment_missing_section_uses_defaults() {
        let figment = Figment::new().merge(Serialized::defaults(serde_json::json!({
            "database": { "dsn": "spanner://projects/p/instances/i/databases/d" }
        })));
        let cfg = BatchingConfig::from_figment(&figment).unwrap();
        assert_eq!(cfg, BatchingConfig::default());
    }

    #[test]
    fn test_from_figment_rejects_bad_values() {
        let figment = Figment::new().merge(Serialized::defaults(serde_json::json!({
            "spanner_orm": { "default_mutation_usage": "sometimes" }
        })));
        assert!(matches!(
            BatchingConfig::from_figment(&figment),
            Err(BatchError::Config(_))
        ));

        let figment = Figment::new().merge(Serialized::defaults(serde_json::json!({
            "spanner_orm": { "batch_size": 0 }
        })));
        assert!(matches!(
            BatchingConfig::from_figment(&figment),
            Err(BatchError::Config(_))
        ));
    }
}
