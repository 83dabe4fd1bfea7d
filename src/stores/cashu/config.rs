//! Wallet configuration
//!
//! Every field has a default, so an empty JSON object is a valid config.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::errors::{CashuResult, CashuWalletError};
use super::retry::RetryPolicy;
use super::types::DEFAULT_UNIT;

/// Max proofs per check-state request
pub const MAX_SYNC_INPUT_SIZE: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WalletConfig {
    pub unit: String,
    /// How long a fetched ledger view is served without re-querying the store
    pub proof_cache_ttl_secs: u64,
    /// Upper bound on waiting for end-of-stored-records
    pub query_timeout_secs: u64,
    /// Per-request timeout for mint HTTP calls
    pub mint_timeout_secs: u64,
    pub publish_retry: RetryPolicy,
    pub max_sync_input_size: usize,
    /// Resolved escrows are kept this long before pruning
    pub htlc_audit_window_secs: u64,
    pub restore_batch_size: u32,
    /// Seed restore stops after this many consecutive empty batches
    pub restore_empty_batches: u32,
    pub keyset_cache_ttl_secs: u64,
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            unit: DEFAULT_UNIT.to_string(),
            proof_cache_ttl_secs: 30,
            query_timeout_secs: 10,
            mint_timeout_secs: 10,
            publish_retry: RetryPolicy::default(),
            max_sync_input_size: MAX_SYNC_INPUT_SIZE,
            htlc_audit_window_secs: 7 * 24 * 60 * 60,
            restore_batch_size: 100,
            restore_empty_batches: 3,
            keyset_cache_ttl_secs: 300,
        }
    }
}

impl WalletConfig {
    /// Parse overrides from JSON and validate them
    pub fn from_json(raw: &str) -> CashuResult<Self> {
        let config: WalletConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> CashuResult<()> {
        let invalid = |what: &str| Err(CashuWalletError::Internal(format!("invalid config: {}", what)));

        if self.unit.is_empty() {
            return invalid("unit must not be empty");
        }
        if self.query_timeout_secs == 0 || self.mint_timeout_secs == 0 {
            return invalid("timeouts must be non-zero");
        }
        if self.publish_retry.max_attempts == 0 {
            return invalid("publish_retry.max_attempts must be at least 1");
        }
        if self.max_sync_input_size == 0 || self.restore_batch_size == 0 {
            return invalid("batch sizes must be non-zero");
        }
        if self.restore_empty_batches == 0 {
            return invalid("restore_empty_batches must be at least 1");
        }
        Ok(())
    }

    pub fn proof_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.proof_cache_ttl_secs)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }

    pub fn mint_timeout(&self) -> Duration {
        Duration::from_secs(self.mint_timeout_secs)
    }

    pub fn keyset_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.keyset_cache_ttl_secs)
    }
}
