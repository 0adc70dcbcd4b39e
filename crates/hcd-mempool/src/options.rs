use crate::types::FeeRate;
use hcd_primitives::{COINBASE_MATURITY, MAX_SIG_OPS_PER_BLOCK, TX_VERSION};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default setting for the data carrier size.
/// 80 bytes of data, +1 for OP_RETURN, +2 for the pushdata opcodes.
pub const MAX_OP_RETURN_RELAY: usize = 83;

/// Invalid mempool configuration.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum OptionsError {
    #[error("max_tx_version must be at least 1, got {0}")]
    MaxTxVersion(i32),

    #[error("lock_confirmation_distance must be positive")]
    LockConfirmationDistance,

    #[error("free_tx_relay_limit must be a non-negative number, got {0}")]
    FreeTxRelayLimit(f64),
}

/// Configuration options for the transaction memory pool.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemPoolOptions {
    /// Highest transaction version accepted into the pool.
    pub max_tx_version: i32,

    /// Accept transactions paying less than the minimum relay fee regardless
    /// of their priority.
    pub disable_relay_priority: bool,

    /// Rate limit for free transactions in kilobytes per minute.
    pub free_tx_relay_limit: f64,

    /// Maximum number of orphan transactions kept around.
    pub max_orphan_txs: usize,

    /// Maximum serialized size of an orphan transaction.
    pub max_orphan_tx_size: usize,

    /// Seconds an orphan may wait for its parents before it expires.
    pub orphan_ttl_secs: u64,

    /// Maximum number of signature operations per transaction.
    pub max_sig_ops_per_tx: usize,

    /// Minimum fee rate in atoms/kB for a transaction to be relayed.
    pub min_relay_tx_fee: u64,

    /// Transactions paying more than this multiple of the minimum fee are
    /// rejected unless high fees are explicitly allowed.
    pub max_relay_fee_multiplier: u64,

    /// Transactions at least this large (minus 1000 bytes) must always pay the
    /// minimum fee.
    pub block_priority_size: usize,

    /// Maximum size of a data carrier output script.
    pub max_data_carrier_size: usize,

    /// Number of blocks before a coinbase output may be spent.
    pub coinbase_maturity: u32,

    /// Maximum number of blocks a vote may lag behind the tip.
    pub max_vote_age: u32,

    /// Number of blocks after the scheduled confirmation height at which a
    /// locked transaction is considered final.
    pub lock_confirmation_distance: u32,
}

impl Default for MemPoolOptions {
    fn default() -> Self {
        Self {
            max_tx_version: TX_VERSION,
            disable_relay_priority: false,
            free_tx_relay_limit: 15.0,
            max_orphan_txs: 1000,
            max_orphan_tx_size: 5000,
            orphan_ttl_secs: 15 * 60,
            max_sig_ops_per_tx: MAX_SIG_OPS_PER_BLOCK / 5,
            min_relay_tx_fee: 10_000,
            max_relay_fee_multiplier: 10_000,
            block_priority_size: 20_000,
            max_data_carrier_size: MAX_OP_RETURN_RELAY,
            coinbase_maturity: COINBASE_MATURITY,
            max_vote_age: 1440,
            lock_confirmation_distance: 100,
        }
    }
}

impl MemPoolOptions {
    /// Create new mempool options with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a builder for configuring mempool options
    pub fn builder() -> MemPoolOptionsBuilder {
        MemPoolOptionsBuilder::default()
    }

    /// Minimum relay fee rate.
    pub fn min_relay_fee_rate(&self) -> FeeRate {
        FeeRate::from_atoms_per_kb(self.min_relay_tx_fee)
    }

    /// Get the orphan expiry duration.
    pub fn orphan_ttl(&self) -> Duration {
        Duration::from_secs(self.orphan_ttl_secs)
    }

    /// Byte budget of the free transaction rate limiter.
    pub fn free_relay_budget(&self) -> f64 {
        self.free_tx_relay_limit * 10.0 * 1000.0
    }

    /// Check the options for values the pool cannot operate with.
    pub fn validate(&self) -> Result<(), OptionsError> {
        if self.max_tx_version < 1 {
            return Err(OptionsError::MaxTxVersion(self.max_tx_version));
        }

        if self.lock_confirmation_distance == 0 {
            return Err(OptionsError::LockConfirmationDistance);
        }

        if self.free_tx_relay_limit.is_nan() || self.free_tx_relay_limit < 0.0 {
            return Err(OptionsError::FreeTxRelayLimit(self.free_tx_relay_limit));
        }

        Ok(())
    }
}

/// Builder pattern for MemPoolOptions
#[derive(Default)]
pub struct MemPoolOptionsBuilder {
    options: MemPoolOptions,
}

impl MemPoolOptionsBuilder {
    pub fn max_tx_version(mut self, version: i32) -> Self {
        self.options.max_tx_version = version;
        self
    }

    pub fn disable_relay_priority(mut self, disable: bool) -> Self {
        self.options.disable_relay_priority = disable;
        self
    }

    /// Set the free transaction rate limit in kB/min
    pub fn free_tx_relay_limit(mut self, limit: f64) -> Self {
        self.options.free_tx_relay_limit = limit;
        self
    }

    pub fn max_orphan_txs(mut self, count: usize) -> Self {
        self.options.max_orphan_txs = count;
        self
    }

    pub fn max_orphan_tx_size(mut self, size: usize) -> Self {
        self.options.max_orphan_tx_size = size;
        self
    }

    pub fn orphan_ttl_secs(mut self, secs: u64) -> Self {
        self.options.orphan_ttl_secs = secs;
        self
    }

    pub fn max_sig_ops_per_tx(mut self, count: usize) -> Self {
        self.options.max_sig_ops_per_tx = count;
        self
    }

    /// Set minimum relay fee rate in atoms/kB
    pub fn min_relay_tx_fee(mut self, rate: u64) -> Self {
        self.options.min_relay_tx_fee = rate;
        self
    }

    pub fn max_relay_fee_multiplier(mut self, multiplier: u64) -> Self {
        self.options.max_relay_fee_multiplier = multiplier;
        self
    }

    pub fn max_data_carrier_size(mut self, size: usize) -> Self {
        self.options.max_data_carrier_size = size;
        self
    }

    pub fn coinbase_maturity(mut self, maturity: u32) -> Self {
        self.options.coinbase_maturity = maturity;
        self
    }

    pub fn max_vote_age(mut self, age: u32) -> Self {
        self.options.max_vote_age = age;
        self
    }

    pub fn lock_confirmation_distance(mut self, distance: u32) -> Self {
        self.options.lock_confirmation_distance = distance;
        self
    }

    /// Build the final MemPoolOptions
    pub fn build(self) -> MemPoolOptions {
        self.options
    }
}
