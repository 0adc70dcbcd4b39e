//! Read-only view of the chain consumed by the memory pool.

use bitcoin::{Amount, Block, BlockHash, OutPoint, Transaction, TxOut, Txid};
use hcd_primitives::stake::{self, TxType};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Unspent outputs of a single transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UtxoEntry {
    /// Height of the block containing the transaction, or
    /// [`hcd_primitives::MEMPOOL_HEIGHT`] for pool transactions.
    height: u32,
    is_coinbase: bool,
    tx_type: TxType,
    /// Unspent outputs keyed by output index.
    outputs: BTreeMap<u32, TxOut>,
}

impl UtxoEntry {
    /// Creates an entry holding every output of `tx`.
    pub fn from_tx(tx: &Transaction, height: u32) -> Self {
        Self {
            height,
            is_coinbase: tx.is_coinbase(),
            tx_type: stake::classify(tx),
            outputs: tx
                .output
                .iter()
                .enumerate()
                .map(|(index, txout)| (index as u32, txout.clone()))
                .collect(),
        }
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn is_coinbase(&self) -> bool {
        self.is_coinbase
    }

    pub fn tx_type(&self) -> TxType {
        self.tx_type
    }

    /// Returns the unspent output at `index`.
    pub fn output(&self, index: u32) -> Option<&TxOut> {
        self.outputs.get(&index)
    }

    /// Returns the value of the unspent output at `index`.
    pub fn amount(&self, index: u32) -> Option<Amount> {
        self.output(index).map(|txout| txout.value)
    }

    /// Marks the output at `index` as spent.
    pub fn spend_output(&mut self, index: u32) -> Option<TxOut> {
        self.outputs.remove(&index)
    }

    pub fn is_fully_spent(&self) -> bool {
        self.outputs.is_empty()
    }
}

/// Set of UTXO entries relevant to a transaction.
///
/// A view is always an independent copy, mutating it never affects the chain
/// it was fetched from. A `None` entry records that the transaction was looked
/// up and is unknown.
#[derive(Debug, Clone, Default)]
pub struct UtxoView {
    entries: HashMap<Txid, Option<UtxoEntry>>,
}

impl UtxoView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the entry for `txid` if it is known.
    pub fn lookup_entry(&self, txid: &Txid) -> Option<&UtxoEntry> {
        self.entries.get(txid).and_then(Option::as_ref)
    }

    pub fn lookup_entry_mut(&mut self, txid: &Txid) -> Option<&mut UtxoEntry> {
        self.entries.get_mut(txid).and_then(Option::as_mut)
    }

    /// Returns the unspent output referenced by `outpoint`.
    pub fn output(&self, outpoint: &OutPoint) -> Option<&TxOut> {
        self.lookup_entry(&outpoint.txid)
            .and_then(|entry| entry.output(outpoint.vout))
    }

    /// Records an entry, `None` meaning the transaction is unknown.
    pub fn add_entry(&mut self, txid: Txid, entry: Option<UtxoEntry>) {
        self.entries.insert(txid, entry);
    }

    /// Adds all outputs of `tx` at the given height, replacing any existing entry.
    pub fn add_tx_outs(&mut self, tx: &Transaction, height: u32) {
        self.entries
            .insert(tx.compute_txid(), Some(UtxoEntry::from_tx(tx, height)));
    }

    /// Removes the entry for `txid`.
    pub fn remove_entry(&mut self, txid: &Txid) -> Option<UtxoEntry> {
        self.entries.remove(txid).flatten()
    }

    /// Returns `true` if the entry for `txid` is absent or has no unspent outputs.
    pub fn is_missing_or_spent(&self, txid: &Txid) -> bool {
        self.lookup_entry(txid)
            .is_none_or(|entry| entry.is_fully_spent())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Relative lock-time constraints of a transaction.
///
/// A value of `-1` means no constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceLock {
    /// The transaction can be included in blocks above this height.
    pub min_height: i64,
    /// The transaction can be included once the median time passes this value.
    pub min_time: i64,
}

impl SequenceLock {
    /// Sequence lock without any constraint.
    pub const NONE: Self = Self {
        min_height: -1,
        min_time: -1,
    };

    /// Returns `true` if the lock allows inclusion in a block at `height` whose
    /// past median time is `median_time`.
    pub fn is_active(&self, height: i64, median_time: i64) -> bool {
        self.min_height < height && self.min_time < median_time
    }
}

bitflags::bitflags! {
    /// Script verification flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ScriptFlags: u32 {
        const P2SH = 1 << 0;
        const STRICT_ENCODING = 1 << 1;
        const DER_SIGNATURES = 1 << 2;
        const LOW_S = 1 << 3;
        const MINIMAL_DATA = 1 << 4;
        const CLEAN_STACK = 1 << 5;
        const DISCOURAGE_UPGRADABLE_NOPS = 1 << 6;
        const CHECK_LOCK_TIME_VERIFY = 1 << 7;
        const CHECK_SEQUENCE_VERIFY = 1 << 8;
    }
}

impl ScriptFlags {
    /// Flags every block must satisfy.
    pub const MANDATORY: Self = Self::P2SH;

    /// Flags applied to transactions relayed through the pool.
    pub const STANDARD: Self = Self::MANDATORY
        .union(Self::STRICT_ENCODING)
        .union(Self::DER_SIGNATURES)
        .union(Self::LOW_S)
        .union(Self::MINIMAL_DATA)
        .union(Self::CLEAN_STACK)
        .union(Self::DISCOURAGE_UPGRADABLE_NOPS)
        .union(Self::CHECK_LOCK_TIME_VERIFY)
        .union(Self::CHECK_SEQUENCE_VERIFY);
}

/// Errors returned by a [`ChainOracle`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChainError {
    #[error("Block {0} not found")]
    BlockNotFound(BlockHash),

    #[error("Script verification failed: {0}")]
    ScriptFailure(String),

    #[error("Chain query failed: {0}")]
    Other(String),
}

/// Read-only queries the memory pool needs from the chain.
///
/// Implementations must be safe for concurrent use. Every returned view is an
/// independent copy.
pub trait ChainOracle: Send + Sync {
    /// Returns a view with an entry for `tx` itself and for every transaction
    /// referenced by its inputs. Unknown transactions map to `None`.
    fn fetch_utxo_view(&self, tx: &Transaction) -> Result<UtxoView, ChainError>;

    /// Height of the current best block.
    fn best_height(&self) -> u32;

    /// Hash of the current best block.
    fn best_hash(&self) -> BlockHash;

    /// Past median time of the best block, in unix seconds.
    fn past_median_time(&self) -> i64;

    /// Ticket price expected for the next block.
    fn next_stake_difficulty(&self) -> Result<Amount, ChainError>;

    /// Computes the relative lock of `tx` given the outputs it spends.
    fn calc_sequence_lock(
        &self,
        tx: &Transaction,
        view: &UtxoView,
    ) -> Result<SequenceLock, ChainError>;

    /// Script flags applied when verifying pool transactions.
    fn standard_verify_flags(&self) -> Result<ScriptFlags, ChainError>;

    /// Verifies the input scripts of `tx`.
    ///
    /// Script rejections are reported as [`ChainError::ScriptFailure`].
    fn check_scripts(
        &self,
        tx: &Transaction,
        view: &UtxoView,
        flags: ScriptFlags,
    ) -> Result<(), ChainError>;

    /// Returns the block with the given hash.
    fn block_by_hash(&self, hash: &BlockHash) -> Result<Arc<Block>, ChainError>;
}
