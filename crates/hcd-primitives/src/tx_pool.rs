//! Transaction pool abstraction for network integration.

use bitcoin::{Amount, Transaction, Txid};
use std::sync::Arc;

/// Reject code sent to peers in response to a rejected transaction.
///
/// The discriminants are the wire values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RejectCode {
    Malformed = 0x01,
    Invalid = 0x10,
    Obsolete = 0x11,
    Duplicate = 0x12,
    Nonstandard = 0x40,
    Dust = 0x41,
    InsufficientFee = 0x42,
    Checkpoint = 0x43,
}

impl RejectCode {
    /// Returns the wire value of the reject code.
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }

    /// Parses a wire value.
    pub fn from_u8(code: u8) -> Option<Self> {
        let code = match code {
            0x01 => Self::Malformed,
            0x10 => Self::Invalid,
            0x11 => Self::Obsolete,
            0x12 => Self::Duplicate,
            0x40 => Self::Nonstandard,
            0x41 => Self::Dust,
            0x42 => Self::InsufficientFee,
            0x43 => Self::Checkpoint,
            _ => return None,
        };
        Some(code)
    }

    /// Returns true if the peer should be penalized for this rejection.
    pub fn should_penalize_peer(&self) -> bool {
        matches!(self, Self::Malformed | Self::Invalid)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Malformed => "REJECT_MALFORMED",
            Self::Invalid => "REJECT_INVALID",
            Self::Obsolete => "REJECT_OBSOLETE",
            Self::Duplicate => "REJECT_DUPLICATE",
            Self::Nonstandard => "REJECT_NONSTANDARD",
            Self::Dust => "REJECT_DUST",
            Self::InsufficientFee => "REJECT_INSUFFICIENTFEE",
            Self::Checkpoint => "REJECT_CHECKPOINT",
        }
    }
}

impl std::fmt::Display for RejectCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({:#04x})", self.as_str(), self.as_u8())
    }
}

/// Result of transaction validation.
#[derive(Debug, Clone)]
pub enum TxValidationResult {
    /// Transaction accepted into the pool.
    Accepted {
        txid: Txid,
        /// Fee rate in atoms/kB for relay decisions.
        fee_rate: u64,
        /// Orphans that were accepted as a consequence of this transaction.
        promoted: Vec<Txid>,
    },
    /// Transaction is waiting for its parents in the orphan pool.
    Orphan { txid: Txid },
    /// Transaction rejected.
    Rejected {
        txid: Txid,
        /// `None` when the rejection was caused by a local failure rather than
        /// by the transaction itself.
        code: Option<RejectCode>,
        reason: String,
    },
}

impl TxValidationResult {
    /// Returns true if the peer that relayed the transaction should be penalized.
    pub fn should_penalize_peer(&self) -> bool {
        match self {
            Self::Rejected {
                code: Some(code), ..
            } => code.should_penalize_peer(),
            _ => false,
        }
    }
}

/// Transaction pool statistics.
#[derive(Debug, Clone, Default)]
pub struct TxPoolInfo {
    /// Number of transactions in the main pool.
    pub size: usize,
    /// Number of orphan transactions.
    pub orphans: usize,
    /// Number of transactions in the lock pool.
    pub locked: usize,
    /// Total serialized size of all pool transactions.
    pub bytes: u64,
    /// Minimum relay fee rate in atoms/kB.
    pub min_fee_rate: u64,
}

/// Transaction pool trait for network integration.
///
/// All methods are synchronous, the caller decides whether to run them on a
/// blocking executor or inline.
pub trait TxPool: Send + Sync + 'static {
    /// Validate and potentially accept a transaction relayed by a peer.
    ///
    /// Orphans are allowed, fees are rate limited and absurdly high fees are
    /// rejected.
    fn validate_transaction(&self, tx: Transaction) -> TxValidationResult;

    /// Check if transaction is known to the pool, either as an accepted
    /// transaction or as an orphan.
    fn contains(&self, txid: &Txid) -> bool;

    /// Get transaction from the main pool if present.
    fn get(&self, txid: &Txid) -> Option<Arc<Transaction>>;

    /// Iterate over all transaction IDs in the main pool with their fee rates.
    fn iter_txids(&self) -> Box<dyn Iterator<Item = (Txid, u64)> + Send>;

    /// Get pool statistics.
    fn info(&self) -> TxPoolInfo;
}

/// Calculate fee rate in atoms/kB from a fee and a serialized size.
pub fn fee_rate_from_amount_size(fee: Amount, size: usize) -> Result<u64, &'static str> {
    if size == 0 {
        return Err("size must be positive");
    }

    let numerator = fee
        .to_sat()
        .checked_mul(1000)
        .ok_or("Fee rate calculation overflow")?;

    Ok(numerator / size as u64)
}
