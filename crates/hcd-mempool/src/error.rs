use crate::chain::ChainError;
use bitcoin::{Amount, OutPoint, Txid};
use hcd_primitives::consensus::TxError;
use hcd_primitives::tx_pool::RejectCode;

/// Errors that can occur when validating or managing mempool transactions.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MempoolError {
    #[error("Already have transaction {0}")]
    AlreadyHaveTransaction(Txid),

    #[error("Transaction {0} already exists in the chain")]
    AlreadyInChain(Txid),

    #[error("Output {outpoint} already spent by transaction {spender} in the memory pool")]
    DoubleSpend { outpoint: OutPoint, spender: Txid },

    #[error("Orphan transaction references outputs of unknown or fully-spent transactions: {missing:?}")]
    OrphanNotAllowed { missing: Vec<OutPoint> },

    #[error("Orphan transaction size of {size} bytes is larger than max allowed size of {max} bytes")]
    OrphanTooLarge { size: usize, max: usize },

    #[error("Transaction version {0} not standard")]
    TxVersionNotStandard(i32),

    #[error("Not standard: {0}")]
    NotStandard(String),

    #[error("Output {index} of value {value} is dust")]
    Dust { index: usize, value: Amount },

    #[error("Too many sigops: {0}")]
    TooManySigops(usize),

    #[error("Insufficient fee {fee}, minimum required {min_fee}")]
    InsufficientFee { fee: Amount, min_fee: Amount },

    #[error("Insufficient priority {priority} (min: {min_priority})")]
    InsufficientPriority { priority: f64, min_priority: f64 },

    #[error("Free transaction rejected by rate limiter")]
    RateLimited,

    #[error("Absurdly high fee {fee} (max: {max_fee})")]
    HighFee { fee: Amount, max_fee: Amount },

    #[error("Non-final transaction")]
    NonFinal,

    #[error("Sequence lock not satisfied")]
    SequenceLock,

    #[error(
        "Spends immature coinbase output {outpoint} from height {origin_height} at height {next_height}"
    )]
    ImmatureSpend {
        outpoint: OutPoint,
        origin_height: u32,
        next_height: u32,
    },

    #[error("Output {0} is spent or does not exist")]
    MissingOutput(OutPoint),

    #[error("Negative fee")]
    NegativeFee,

    #[error("Overflow in fee calculation")]
    FeeOverflow,

    #[error("Coinbase transaction not allowed")]
    Coinbase,

    #[error("Script validation failed: {0}")]
    ScriptValidationFailed(String),

    #[error("Ticket price {price} is below the stake difficulty {difficulty}")]
    TicketBelowDifficulty { price: Amount, difficulty: Amount },

    #[error("Vote for height {height} is too old (min: {min_height})")]
    VoteTooOld { height: u32, min_height: u32 },

    #[error("Vote does not commit to a block")]
    MalformedVote,

    #[error("Output {outpoint} already locked by transaction {holder}")]
    LockConflict { outpoint: OutPoint, holder: Txid },

    #[error("Missing inputs: {0:?}")]
    MissingInputs(Vec<OutPoint>),

    #[error(transparent)]
    TxError(#[from] TxError),

    #[error(transparent)]
    Chain(#[from] ChainError),
}

impl MempoolError {
    /// Returns the code to report to the peer that relayed the transaction.
    ///
    /// `None` for failures that are not caused by the transaction itself.
    pub fn reject_code(&self) -> Option<RejectCode> {
        let code = match self {
            Self::AlreadyHaveTransaction(_)
            | Self::AlreadyInChain(_)
            | Self::DoubleSpend { .. }
            | Self::OrphanNotAllowed { .. }
            | Self::LockConflict { .. } => RejectCode::Duplicate,
            Self::OrphanTooLarge { .. }
            | Self::TxVersionNotStandard(_)
            | Self::NotStandard(_)
            | Self::TooManySigops(_)
            | Self::NonFinal
            | Self::SequenceLock
            | Self::VoteTooOld { .. } => RejectCode::Nonstandard,
            Self::Dust { .. } => RejectCode::Dust,
            Self::InsufficientFee { .. }
            | Self::InsufficientPriority { .. }
            | Self::RateLimited
            | Self::HighFee { .. }
            | Self::TicketBelowDifficulty { .. } => RejectCode::InsufficientFee,
            Self::ImmatureSpend { .. }
            | Self::MissingOutput(_)
            | Self::NegativeFee
            | Self::FeeOverflow
            | Self::Coinbase
            | Self::ScriptValidationFailed(_)
            | Self::MalformedVote
            | Self::TxError(_) => RejectCode::Invalid,
            Self::MissingInputs(_) | Self::Chain(_) => return None,
        };

        Some(code)
    }
}
