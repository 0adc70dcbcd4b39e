//! Inner mempool state protected by RwLock.

use crate::chain::UtxoView;
use crate::lock_pool::TxLockPool;
use crate::orphan::{OrphanPool, spent_outpoints};
use crate::types::{RemovalReason, TxDesc};
use crate::validation::ValidationWorkspace;
use bitcoin::{OutPoint, Transaction, Txid};
use hcd_primitives::MEMPOOL_HEIGHT;
use std::collections::HashMap;

/// Decay window of the free relay limiter, in seconds.
const FREE_RELAY_DECAY_SECS: f64 = 600.0;

/// Exponentially decaying count of bytes relayed below the minimum fee.
#[derive(Debug, Default)]
pub(crate) struct FreeRelayLimiter {
    total: f64,
    last_unix: i64,
}

impl FreeRelayLimiter {
    /// Byte count decayed to `now`.
    pub(crate) fn decayed_total(&self, now: i64) -> f64 {
        let elapsed = now.saturating_sub(self.last_unix).max(0);
        self.total * (1.0 - 1.0 / FREE_RELAY_DECAY_SECS).powf(elapsed as f64)
    }

    pub(crate) fn record(&mut self, size: usize, now: i64) {
        self.total = self.decayed_total(now) + size as f64;
        self.last_unix = now;
    }
}

/// Inner mempool state (protected by RwLock in main MemPool).
#[derive(Debug)]
pub(crate) struct MemPoolInner {
    /// Transactions accepted into the main pool.
    pub(crate) pool: HashMap<Txid, TxDesc>,

    /// Track which outputs are spent by mempool transactions.
    /// Maps outpoint -> txid that spends it (for conflict detection).
    pub(crate) outpoints: HashMap<OutPoint, Txid>,

    pub(crate) orphans: OrphanPool,

    pub(crate) lock_pool: TxLockPool,

    pub(crate) free_relay: FreeRelayLimiter,

    /// Total serialized size of all transactions in the main pool.
    pub(crate) total_size: u64,
}

impl MemPoolInner {
    pub(crate) fn new(lock_confirmation_distance: u32) -> Self {
        Self {
            pool: HashMap::new(),
            outpoints: HashMap::new(),
            orphans: OrphanPool::new(),
            lock_pool: TxLockPool::new(lock_confirmation_distance),
            free_relay: FreeRelayLimiter::default(),
            total_size: 0,
        }
    }

    pub(crate) fn contains(&self, txid: &Txid) -> bool {
        self.pool.contains_key(txid)
    }

    /// Get the pool transaction spending the given outpoint.
    pub(crate) fn get_conflict_tx(&self, outpoint: &OutPoint) -> Option<Txid> {
        self.outpoints.get(outpoint).copied()
    }

    /// Adds the outputs of pool transactions referenced by `tx` that the chain
    /// does not know or reports as fully spent.
    pub(crate) fn fill_view_from_pool(&self, tx: &Transaction, view: &mut UtxoView) {
        for outpoint in spent_outpoints(tx) {
            if !view.is_missing_or_spent(&outpoint.txid) {
                continue;
            }

            if let Some(parent) = self.pool.get(&outpoint.txid) {
                view.add_tx_outs(&parent.tx, MEMPOOL_HEIGHT);
            }
        }
    }

    /// Inserts a validated transaction and indexes the outpoints it spends.
    pub(crate) fn add_transaction(&mut self, ws: ValidationWorkspace, now: i64) -> TxDesc {
        let desc = TxDesc {
            tx: ws.tx,
            txid: ws.txid,
            tx_type: ws.tx_type,
            added: now,
            height: ws.height,
            fee: ws.fee,
            size: ws.size,
            starting_priority: ws.priority,
            high_priority: ws.high_priority,
            free_relay: ws.free_relay,
        };

        for outpoint in spent_outpoints(&desc.tx) {
            self.outpoints.insert(outpoint, desc.txid);
        }

        if desc.free_relay {
            self.free_relay.record(desc.size, now);
        }

        self.total_size += desc.size as u64;
        self.pool.insert(desc.txid, desc.clone());

        desc
    }

    /// Removes a transaction from the main pool, optionally together with every
    /// pool transaction spending its outputs.
    ///
    /// Returns the removed transactions.
    pub(crate) fn remove_transaction(
        &mut self,
        txid: &Txid,
        remove_redeemers: bool,
        reason: RemovalReason,
    ) -> Vec<Txid> {
        let mut removed = Vec::new();
        let mut stack = vec![*txid];

        while let Some(txid) = stack.pop() {
            let Some(desc) = self.pool.remove(&txid) else {
                continue;
            };

            if remove_redeemers {
                for vout in 0..desc.tx.output.len() as u32 {
                    if let Some(redeemer) = self.outpoints.get(&OutPoint::new(txid, vout)) {
                        stack.push(*redeemer);
                    }
                }
            }

            for outpoint in spent_outpoints(&desc.tx) {
                self.outpoints.remove(&outpoint);
            }

            self.total_size = self.total_size.saturating_sub(desc.size as u64);

            tracing::trace!(
                target: crate::LOG_TARGET,
                "Removed transaction {txid} from the memory pool ({})",
                if removed.is_empty() {
                    reason.as_str()
                } else {
                    RemovalReason::Redeemer.as_str()
                }
            );

            removed.push(txid);
        }

        removed
    }

    /// Removes every pool transaction spending an outpoint also spent by `tx`,
    /// together with its redeemers.
    pub(crate) fn remove_double_spends(&mut self, tx: &Transaction) -> Vec<Txid> {
        let txid = tx.compute_txid();
        let mut removed = Vec::new();

        for outpoint in spent_outpoints(tx) {
            if let Some(spender) = self.get_conflict_tx(&outpoint) {
                if spender != txid {
                    removed.extend(self.remove_transaction(
                        &spender,
                        true,
                        RemovalReason::Conflict,
                    ));
                }
            }
        }

        removed
    }
}
