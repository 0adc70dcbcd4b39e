//! # Transaction Memory Pool Overview
//!
//! 1. Admission.
//!     - Every transaction goes through [`MemPool::submit`], which validates it against
//!       the chain and the pool, then either rejects it, parks it as an orphan or commits
//!       it to the main pool.
//!     - Committing a transaction promotes the orphans waiting on its outputs, transitively.
//! 2. Main pool.
//!     - Accepted transactions are indexed by the outpoints they spend, so no two of them
//!       can spend the same output.
//! 3. Orphan pool.
//!     - Transactions spending unknown outputs wait here, bounded in count and size, until
//!       their parents show up or they expire.
//! 4. Lock pool.
//!     - Transactions under the pre-confirmation locking protocol are tracked separately,
//!       see [`LockPoolHandle`].
//!
//! The chain is only ever read, through the [`ChainOracle`] trait.

mod chain;
mod error;
mod inner;
mod lock_pool;
mod options;
mod orphan;
mod policy;
#[cfg(test)]
mod tests;
mod types;
mod validation;

pub use self::chain::{
    ChainError, ChainOracle, ScriptFlags, SequenceLock, UtxoEntry, UtxoView,
};
pub use self::error::MempoolError;
pub use self::lock_pool::LockDesc;
pub use self::options::{MAX_OP_RETURN_RELAY, MemPoolOptions, MemPoolOptionsBuilder, OptionsError};
pub use self::orphan::OrphanDesc;
pub use self::policy::{MAX_STANDARD_TX_SIZE, MIN_HIGH_PRIORITY};
pub use self::types::{FeeRate, RemovalReason, TxDesc};

use self::inner::MemPoolInner;
use self::validation::{AcceptFlags, Validated};
use bitcoin::{OutPoint, Transaction, Txid};
use hcd_primitives::consensus::check_transaction_sanity;
use hcd_primitives::tx_pool::{TxPool, TxPoolInfo, TxValidationResult};
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

const LOG_TARGET: &str = "mempool";

/// Thread-safe transaction memory pool.
///
/// Every mutation, including the whole orphan promotion triggered by an
/// accepted transaction, happens under a single write lock acquisition, so
/// readers never observe a partially committed admission. The pool lock is
/// always taken before any lock internal to the chain oracle.
pub struct MemPool<C> {
    /// Configuration (immutable after creation).
    options: MemPoolOptions,

    /// Thread-safe inner state.
    inner: RwLock<MemPoolInner>,

    /// Unix time of the last change to the main pool.
    last_updated: AtomicI64,

    chain: Arc<C>,
}

impl<C: ChainOracle> MemPool<C> {
    /// Create a new mempool with default options.
    pub fn new(chain: Arc<C>) -> Self {
        Self::from_parts(chain, MemPoolOptions::default())
    }

    /// Create a new mempool with custom options.
    pub fn with_options(chain: Arc<C>, options: MemPoolOptions) -> Result<Self, OptionsError> {
        options.validate()?;
        Ok(Self::from_parts(chain, options))
    }

    fn from_parts(chain: Arc<C>, options: MemPoolOptions) -> Self {
        Self {
            inner: RwLock::new(MemPoolInner::new(options.lock_confirmation_distance)),
            options,
            last_updated: AtomicI64::new(unix_now()),
            chain,
        }
    }

    pub fn options(&self) -> &MemPoolOptions {
        &self.options
    }

    /// Submit a transaction to the pool.
    ///
    /// Returns the accepted transactions: `tx` itself followed by the orphans
    /// it allowed into the pool, in breadth-first order. The list is empty when
    /// `tx` was stored as an orphan.
    pub fn submit(
        &self,
        tx: Transaction,
        allow_orphan: bool,
        allow_high_fees: bool,
        rate_limited: bool,
    ) -> Result<Vec<TxDesc>, MempoolError> {
        let tx = Arc::new(tx);
        let txid = tx.compute_txid();
        let now = unix_now();
        let flags = AcceptFlags {
            reject_dup_orphans: true,
            rate_limited,
            allow_high_fees,
        };

        let mut inner = self.inner.write();

        let validated = validation::check_transaction(
            tx.clone(),
            &inner,
            self.chain.as_ref(),
            &self.options,
            flags,
            now,
        )
        .inspect_err(|err| {
            tracing::debug!(target: LOG_TARGET, "Rejected transaction {txid}: {err}");
        })?;

        let ws = match validated {
            Validated::Accepted(ws) => ws,
            Validated::MissingParents(missing) => {
                if !allow_orphan {
                    tracing::debug!(
                        target: LOG_TARGET,
                        "Rejected orphan transaction {txid}, orphans are not allowed"
                    );
                    return Err(MempoolError::OrphanNotAllowed { missing });
                }

                self.add_orphan(&mut inner, tx, missing, flags, now)?;
                return Ok(Vec::new());
            }
        };

        let desc = inner.add_transaction(ws, now);
        self.last_updated.store(now, Ordering::Relaxed);

        tracing::debug!(
            target: LOG_TARGET,
            "Accepted transaction {txid} (pool size: {})",
            inner.pool.len()
        );

        let mut accepted = vec![desc];
        accepted.extend(self.process_orphans_locked(&mut inner, &tx, now));

        Ok(accepted)
    }

    fn add_orphan(
        &self,
        inner: &mut MemPoolInner,
        tx: Arc<Transaction>,
        missing: Vec<OutPoint>,
        flags: AcceptFlags,
        now: i64,
    ) -> Result<(), MempoolError> {
        let size = tx.total_size();
        if size > self.options.max_orphan_tx_size {
            return Err(MempoolError::OrphanTooLarge {
                size,
                max: self.options.max_orphan_tx_size,
            });
        }

        let evicted = inner.orphans.insert(
            tx,
            missing.into_iter().collect(),
            flags,
            now,
            self.options.orphan_ttl_secs,
            self.options.max_orphan_txs,
        );

        if !evicted.is_empty() {
            tracing::debug!(
                target: LOG_TARGET,
                "Evicted {} orphan transactions to make room",
                evicted.len()
            );
        }

        Ok(())
    }

    /// Promote the orphans unlocked by `tx`, which was accepted elsewhere, for
    /// instance by being connected in a block.
    pub fn process_orphans(&self, tx: &Transaction) -> Vec<TxDesc> {
        let now = unix_now();
        let mut inner = self.inner.write();
        self.process_orphans_locked(&mut inner, &Arc::new(tx.clone()), now)
    }

    fn process_orphans_locked(
        &self,
        inner: &mut MemPoolInner,
        accepted_tx: &Arc<Transaction>,
        now: i64,
    ) -> Vec<TxDesc> {
        let mut promoted = Vec::new();
        let mut queue = VecDeque::from([accepted_tx.clone()]);

        while let Some(tx) = queue.pop_front() {
            let txid = tx.compute_txid();

            for vout in 0..tx.output.len() as u32 {
                let outpoint = OutPoint::new(txid, vout);

                for orphan_txid in inner.orphans.resolve_waiters(&outpoint) {
                    let Some(desc) = inner.orphans.get(&orphan_txid) else {
                        continue;
                    };
                    let orphan = desc.tx.clone();
                    // Orphans are rechecked under the policy they were submitted with.
                    let flags = AcceptFlags {
                        reject_dup_orphans: false,
                        rate_limited: desc.rate_limited,
                        allow_high_fees: desc.allow_high_fees,
                    };

                    match validation::check_transaction(
                        orphan,
                        inner,
                        self.chain.as_ref(),
                        &self.options,
                        flags,
                        now,
                    ) {
                        Ok(Validated::MissingParents(_)) => {
                            tracing::trace!(
                                target: LOG_TARGET,
                                "Orphan {orphan_txid} still misses parents"
                            );
                        }
                        Ok(Validated::Accepted(ws)) => {
                            inner
                                .orphans
                                .remove(&orphan_txid, false, RemovalReason::Promoted);
                            let desc = inner.add_transaction(ws, now);
                            self.last_updated.store(now, Ordering::Relaxed);

                            tracing::trace!(
                                target: LOG_TARGET,
                                "Promoted orphan {orphan_txid} unlocked by {outpoint}"
                            );

                            queue.push_back(desc.tx.clone());
                            promoted.push(desc);
                            break;
                        }
                        Err(MempoolError::Chain(err)) => {
                            tracing::warn!(
                                target: LOG_TARGET,
                                "Failed to check orphan {orphan_txid}: {err}"
                            );
                        }
                        Err(err) => {
                            tracing::trace!(
                                target: LOG_TARGET,
                                "Removing invalid orphan {orphan_txid}: {err}"
                            );
                            inner
                                .orphans
                                .remove(&orphan_txid, true, RemovalReason::Rejected);
                            break;
                        }
                    }
                }
            }
        }

        inner.orphans.remove_double_spends(accepted_tx);
        for desc in &promoted {
            inner.orphans.remove_double_spends(&desc.tx);
        }

        if !promoted.is_empty() {
            tracing::debug!(
                target: LOG_TARGET,
                "Promoted {} orphans after accepting {}",
                promoted.len(),
                accepted_tx.compute_txid()
            );
        }

        promoted
    }

    /// Returns `true` if the transaction is in the orphan pool.
    pub fn is_orphan(&self, txid: &Txid) -> bool {
        self.inner.read().orphans.contains(txid)
    }

    /// Returns `true` if the transaction is in the main pool.
    pub fn is_in_pool(&self, txid: &Txid) -> bool {
        self.inner.read().contains(txid)
    }

    /// Returns `true` if the transaction is in either the main or the orphan pool.
    pub fn have(&self, txid: &Txid) -> bool {
        let inner = self.inner.read();
        inner.contains(txid) || inner.orphans.contains(txid)
    }

    /// Remove a transaction from the main pool.
    ///
    /// With `remove_redeemers`, every pool transaction spending its outputs is
    /// removed too, transitively.
    pub fn remove_transaction(&self, tx: &Transaction, remove_redeemers: bool) -> Vec<Txid> {
        let removed = self.inner.write().remove_transaction(
            &tx.compute_txid(),
            remove_redeemers,
            RemovalReason::Explicit,
        );

        if !removed.is_empty() {
            self.last_updated.store(unix_now(), Ordering::Relaxed);
        }

        removed
    }

    /// Remove every pool transaction spending an output also spent by `tx`.
    pub fn remove_double_spends(&self, tx: &Transaction) -> Vec<Txid> {
        let removed = self.inner.write().remove_double_spends(tx);

        if !removed.is_empty() {
            self.last_updated.store(unix_now(), Ordering::Relaxed);
        }

        removed
    }

    /// Remove an orphan, leaving the orphans spending its outputs in place.
    pub fn remove_orphan(&self, txid: &Txid) -> Vec<Txid> {
        self.inner
            .write()
            .orphans
            .remove(txid, false, RemovalReason::Explicit)
    }

    /// Remove expired orphans. Returns the number of removed transactions.
    pub fn expire_orphans(&self) -> usize {
        self.inner.write().orphans.expire(unix_now()).len()
    }

    /// Get a transaction from the main pool.
    pub fn fetch_transaction(&self, txid: &Txid) -> Option<Arc<Transaction>> {
        self.inner.read().pool.get(txid).map(|desc| desc.tx.clone())
    }

    /// Get the descriptor of a transaction in the main pool.
    pub fn tx_desc(&self, txid: &Txid) -> Option<TxDesc> {
        self.inner.read().pool.get(txid).cloned()
    }

    pub fn tx_hashes(&self) -> Vec<Txid> {
        self.inner.read().pool.keys().copied().collect()
    }

    pub fn tx_descs(&self) -> Vec<TxDesc> {
        self.inner.read().pool.values().cloned().collect()
    }

    /// Get number of transactions in the main pool.
    pub fn count(&self) -> usize {
        self.inner.read().pool.len()
    }

    pub fn orphan_count(&self) -> usize {
        self.inner.read().orphans.len()
    }

    /// Unix time of the last change to the main pool.
    pub fn last_updated(&self) -> i64 {
        self.last_updated.load(Ordering::Relaxed)
    }

    /// Get pool statistics.
    pub fn info(&self) -> TxPoolInfo {
        let inner = self.inner.read();
        TxPoolInfo {
            size: inner.pool.len(),
            orphans: inner.orphans.len(),
            locked: inner.lock_pool.len(),
            bytes: inner.total_size,
            min_fee_rate: self.options.min_relay_tx_fee,
        }
    }

    /// Access the transaction lock pool.
    pub fn lock_pool(&self) -> LockPoolHandle<'_, C> {
        LockPoolHandle { mempool: self }
    }
}

/// Operations on the transaction lock pool.
///
/// Locks are independent of main pool membership. They go away once their
/// scheduled confirmation height is buried deep enough, or when a conflicting
/// transaction is seen, never because the transaction left the main pool.
pub struct LockPoolHandle<'a, C> {
    mempool: &'a MemPool<C>,
}

impl<C: ChainOracle> LockPoolHandle<'_, C> {
    /// Lock the inputs of `tx`.
    ///
    /// Returns `Ok(false)` if the transaction is already locked. With
    /// `validate`, every input must exist on chain or in the main pool.
    pub fn try_lock(&self, tx: Transaction, validate: bool) -> Result<bool, MempoolError> {
        let txid = tx.compute_txid();
        let mut inner = self.mempool.inner.write();

        if inner.lock_pool.contains(&txid) {
            return Ok(false);
        }

        if validate {
            check_transaction_sanity(&tx)?;

            let mut view = self.mempool.chain.fetch_utxo_view(&tx)?;
            inner.fill_view_from_pool(&tx, &mut view);

            let missing: Vec<OutPoint> = orphan::spent_outpoints(&tx)
                .filter(|outpoint| view.output(outpoint).is_none())
                .collect();
            if !missing.is_empty() {
                return Err(MempoolError::MissingInputs(missing));
            }
        }

        if let Some((outpoint, holder)) = inner.lock_pool.find_conflict(&tx, &txid) {
            return Err(MempoolError::LockConflict { outpoint, holder });
        }

        let height = self.mempool.chain.best_height();
        inner
            .lock_pool
            .insert(Arc::new(tx), txid, height, unix_now());

        tracing::debug!(
            target: LOG_TARGET,
            "Locked transaction {txid} at height {height} (locks: {})",
            inner.lock_pool.len()
        );

        Ok(true)
    }

    /// Set the height `txid` is expected to confirm at, `0` to unschedule.
    ///
    /// Returns `false` if the transaction is not locked.
    pub fn set_scheduled_height(&self, txid: &Txid, height: u32) -> bool {
        self.mempool
            .inner
            .write()
            .lock_pool
            .set_scheduled_height(txid, height)
    }

    /// Drop the locks buried deep enough below `current_height`.
    pub fn prune_confirmed(&self, current_height: u32) -> Vec<Txid> {
        let pruned = self
            .mempool
            .inner
            .write()
            .lock_pool
            .prune_confirmed(current_height);

        if !pruned.is_empty() {
            tracing::debug!(
                target: LOG_TARGET,
                "Pruned {} confirmed locks at height {current_height}",
                pruned.len()
            );
        }

        pruned
    }

    /// Drop the locks of other transactions spending an input of `tx`.
    pub fn remove_conflicting(&self, tx: &Transaction) -> Vec<Txid> {
        self.mempool.inner.write().lock_pool.remove_conflicting(tx)
    }

    /// Up to `limit` locks not scheduled for confirmation yet, oldest first.
    pub fn pending(&self, limit: usize) -> Vec<LockDesc> {
        self.mempool.inner.read().lock_pool.pending(limit)
    }

    pub fn snapshot(&self) -> Vec<LockDesc> {
        self.mempool.inner.read().lock_pool.snapshot()
    }

    pub fn contains(&self, txid: &Txid) -> bool {
        self.mempool.inner.read().lock_pool.contains(txid)
    }

    pub fn is_outpoint_locked(&self, outpoint: &OutPoint) -> bool {
        self.mempool
            .inner
            .read()
            .lock_pool
            .is_outpoint_locked(outpoint)
    }

    pub fn len(&self) -> usize {
        self.mempool.inner.read().lock_pool.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of outpoints currently locked.
    pub fn outpoint_count(&self) -> usize {
        self.mempool.inner.read().lock_pool.outpoint_count()
    }
}

// --- TxPool trait implementation ---

impl<C: ChainOracle + 'static> TxPool for MemPool<C> {
    fn validate_transaction(&self, tx: Transaction) -> TxValidationResult {
        let txid = tx.compute_txid();

        match self.submit(tx, true, false, true) {
            Ok(accepted) => match accepted.split_first() {
                Some((desc, promoted)) => TxValidationResult::Accepted {
                    txid,
                    fee_rate: desc.fee_rate(),
                    promoted: promoted.iter().map(|desc| desc.txid).collect(),
                },
                None => TxValidationResult::Orphan { txid },
            },
            Err(err) => TxValidationResult::Rejected {
                txid,
                code: err.reject_code(),
                reason: err.to_string(),
            },
        }
    }

    fn contains(&self, txid: &Txid) -> bool {
        self.have(txid)
    }

    fn get(&self, txid: &Txid) -> Option<Arc<Transaction>> {
        self.fetch_transaction(txid)
    }

    fn iter_txids(&self) -> Box<dyn Iterator<Item = (Txid, u64)> + Send> {
        let mut txids: Vec<(Txid, u64)> = self
            .inner
            .read()
            .pool
            .values()
            .map(|desc| (desc.txid, desc.fee_rate()))
            .collect();
        txids.sort_by(|a, b| b.1.cmp(&a.1));
        Box::new(txids.into_iter())
    }

    fn info(&self) -> TxPoolInfo {
        MemPool::info(self)
    }
}

fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or_default()
}
