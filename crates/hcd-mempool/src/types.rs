//! Core type definitions for the mempool.

use bitcoin::{Amount, Transaction, Txid};
use hcd_primitives::stake::TxType;
use std::sync::Arc;

/// Fee rate in atoms per kilobyte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FeeRate(pub u64);

impl FeeRate {
    /// Create fee rate from atoms per kilobyte.
    pub fn from_atoms_per_kb(atoms_kb: u64) -> Self {
        Self(atoms_kb)
    }

    /// Get the fee rate in atoms per kilobyte.
    pub fn as_atoms_per_kb(&self) -> u64 {
        self.0
    }

    /// Minimum fee a transaction of `size` bytes must pay at this rate.
    ///
    /// Any non-zero rate charges at least the rate itself, so tiny transactions
    /// are never free. The result never exceeds the total money supply.
    pub fn min_fee(&self, size: usize) -> Amount {
        let mut fee = self.0.saturating_mul(size as u64) / 1000;

        if fee == 0 && self.0 > 0 {
            fee = self.0;
        }

        Amount::from_sat(fee).min(Amount::MAX_MONEY)
    }
}

/// Descriptor of a transaction accepted into the main pool.
#[derive(Debug, Clone)]
pub struct TxDesc {
    pub tx: Arc<Transaction>,
    pub txid: Txid,
    pub tx_type: TxType,
    /// Unix time the transaction was added.
    pub added: i64,
    /// Best chain height when the transaction was added.
    pub height: u32,
    pub fee: Amount,
    /// Serialized size in bytes.
    pub size: usize,
    /// Priority at the time the transaction was added.
    pub starting_priority: f64,
    /// Whether the starting priority qualified as high priority.
    pub high_priority: bool,
    /// Whether the transaction was admitted below the minimum relay fee.
    pub free_relay: bool,
}

impl TxDesc {
    /// Fee rate paid by the transaction in atoms/kB.
    pub fn fee_rate(&self) -> u64 {
        hcd_primitives::tx_pool::fee_rate_from_amount_size(self.fee, self.size).unwrap_or(0)
    }
}

/// Reason for removing transactions from the mempool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalReason {
    /// Included in a block or removed explicitly by the caller.
    Explicit,
    /// Spends an output of a removed transaction.
    Redeemer,
    /// Conflicted with another transaction.
    Conflict,
    /// Evicted due to the orphan pool size limit.
    SizeLimit,
    /// Expired (too old).
    Expiry,
    /// Rejected while trying to leave the orphan pool.
    Rejected,
    /// Moved from the orphan pool into the main pool.
    Promoted,
}

impl RemovalReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Explicit => "explicit",
            Self::Redeemer => "redeemer",
            Self::Conflict => "conflict",
            Self::SizeLimit => "sizelimit",
            Self::Expiry => "expiry",
            Self::Rejected => "rejected",
            Self::Promoted => "promoted",
        }
    }
}
