//! Transactions waiting for their parents.

use crate::types::RemovalReason;
use crate::validation::AcceptFlags;
use bitcoin::{OutPoint, Transaction, Txid};
use hcd_primitives::stake;
use indexmap::{IndexMap, IndexSet};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Orphan transaction with its bookkeeping.
#[derive(Debug, Clone)]
pub struct OrphanDesc {
    pub tx: Arc<Transaction>,
    pub txid: Txid,
    /// Unix time the orphan was added.
    pub added: i64,
    /// Unix time after which the orphan may be swept.
    pub expires_at: i64,
    /// Outpoints that could not be resolved when the orphan was added.
    pub missing: HashSet<OutPoint>,
    /// Fee policy the orphan was submitted under, reapplied on promotion.
    pub allow_high_fees: bool,
    pub rate_limited: bool,
}

/// Bounded pool of orphan transactions.
///
/// Orphans are indexed by every outpoint they spend so both the transactions
/// waiting on a new output and the orphans conflicting with an accepted
/// transaction can be found.
#[derive(Debug, Default)]
pub(crate) struct OrphanPool {
    orphans: IndexMap<Txid, OrphanDesc>,
    by_prev: HashMap<OutPoint, IndexSet<Txid>>,
}

impl OrphanPool {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn contains(&self, txid: &Txid) -> bool {
        self.orphans.contains_key(txid)
    }

    pub(crate) fn get(&self, txid: &Txid) -> Option<&OrphanDesc> {
        self.orphans.get(txid)
    }

    pub(crate) fn len(&self) -> usize {
        self.orphans.len()
    }

    /// Number of outpoints with at least one waiting orphan.
    #[cfg(test)]
    pub(crate) fn indexed_outpoints(&self) -> usize {
        self.by_prev.len()
    }

    /// Adds an orphan, evicting existing ones when the pool is full.
    ///
    /// Expired orphans are evicted first, then random ones until the new entry
    /// fits. Nothing is stored when `max_orphans` is zero. Returns the evicted
    /// transactions.
    pub(crate) fn insert(
        &mut self,
        tx: Arc<Transaction>,
        missing: HashSet<OutPoint>,
        flags: AcceptFlags,
        now: i64,
        ttl_secs: u64,
        max_orphans: usize,
    ) -> Vec<Txid> {
        if max_orphans == 0 {
            return Vec::new();
        }

        let txid = tx.compute_txid();
        if self.orphans.contains_key(&txid) {
            return Vec::new();
        }

        let evicted = self.limit_num_orphans(now, max_orphans);

        for outpoint in spent_outpoints(&tx) {
            self.by_prev.entry(outpoint).or_default().insert(txid);
        }

        let expires_at = now.saturating_add(i64::try_from(ttl_secs).unwrap_or(i64::MAX));
        self.orphans.insert(
            txid,
            OrphanDesc {
                tx,
                txid,
                added: now,
                expires_at,
                missing,
                allow_high_fees: flags.allow_high_fees,
                rate_limited: flags.rate_limited,
            },
        );

        tracing::debug!(
            target: crate::LOG_TARGET,
            "Stored orphan transaction {txid} (total: {})",
            self.orphans.len()
        );

        evicted
    }

    /// Makes room for one more orphan.
    fn limit_num_orphans(&mut self, now: i64, max_orphans: usize) -> Vec<Txid> {
        if self.orphans.len() < max_orphans {
            return Vec::new();
        }

        let mut evicted = self.expire(now);

        while self.orphans.len() >= max_orphans {
            let index = fastrand::usize(..self.orphans.len());
            let Some((&txid, _)) = self.orphans.get_index(index) else {
                break;
            };
            evicted.extend(self.remove(&txid, false, RemovalReason::SizeLimit));
        }

        evicted
    }

    /// Removes an orphan and, if requested, every orphan spending its outputs.
    ///
    /// Returns the removed transactions.
    pub(crate) fn remove(
        &mut self,
        txid: &Txid,
        remove_redeemers: bool,
        reason: RemovalReason,
    ) -> Vec<Txid> {
        let mut removed = Vec::new();
        let mut stack = vec![*txid];

        while let Some(txid) = stack.pop() {
            let Some(desc) = self.orphans.swap_remove(&txid) else {
                continue;
            };

            for outpoint in spent_outpoints(&desc.tx) {
                if let Some(waiters) = self.by_prev.get_mut(&outpoint) {
                    waiters.shift_remove(&txid);
                    if waiters.is_empty() {
                        self.by_prev.remove(&outpoint);
                    }
                }
            }

            if remove_redeemers {
                for vout in 0..desc.tx.output.len() as u32 {
                    if let Some(redeemers) = self.by_prev.get(&OutPoint::new(txid, vout)) {
                        stack.extend(redeemers.iter().copied());
                    }
                }
            }

            tracing::trace!(
                target: crate::LOG_TARGET,
                "Removed orphan transaction {txid} ({})",
                reason.as_str()
            );

            removed.push(txid);
        }

        removed
    }

    /// Orphans spending `outpoint`, in insertion order.
    pub(crate) fn resolve_waiters(&self, outpoint: &OutPoint) -> Vec<Txid> {
        self.by_prev
            .get(outpoint)
            .map(|waiters| waiters.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Removes every orphan spending an outpoint also spent by `tx`, together
    /// with the orphans depending on them.
    pub(crate) fn remove_double_spends(&mut self, tx: &Transaction) -> Vec<Txid> {
        let txid = tx.compute_txid();
        let mut removed = Vec::new();

        for outpoint in spent_outpoints(tx) {
            for conflict in self.resolve_waiters(&outpoint) {
                if conflict != txid {
                    removed.extend(self.remove(&conflict, true, RemovalReason::Conflict));
                }
            }
        }

        removed
    }

    /// Removes orphans whose expiration time is not after `now`, together with
    /// the orphans depending on them.
    pub(crate) fn expire(&mut self, now: i64) -> Vec<Txid> {
        let expired: Vec<Txid> = self
            .orphans
            .values()
            .filter(|desc| desc.expires_at <= now)
            .map(|desc| desc.txid)
            .collect();

        let mut removed = Vec::new();
        for txid in expired {
            removed.extend(self.remove(&txid, true, RemovalReason::Expiry));
        }

        if !removed.is_empty() {
            tracing::debug!(
                target: crate::LOG_TARGET,
                "Expired {} orphan transactions ({} remaining)",
                removed.len(),
                self.orphans.len()
            );
        }

        removed
    }
}

/// Outpoints spent by `tx`, excluding stakebase inputs.
pub(crate) fn spent_outpoints(tx: &Transaction) -> impl Iterator<Item = OutPoint> + '_ {
    let tx_type = stake::classify(tx);
    tx.input
        .iter()
        .enumerate()
        .filter(move |(index, _)| !stake::is_stakebase_input(tx_type, *index))
        .map(|(_, txin)| txin.previous_output)
}
