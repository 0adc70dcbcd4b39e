//! Transactions held under the pre-confirmation locking protocol.

use crate::orphan::spent_outpoints;
use bitcoin::{OutPoint, Transaction, Txid};
use indexmap::IndexMap;
use std::collections::HashMap;
use std::sync::Arc;

/// Transaction tracked by the lock pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockDesc {
    pub tx: Arc<Transaction>,
    pub txid: Txid,
    /// Best chain height when the lock was taken.
    pub added_height: u32,
    /// Unix time the lock was taken.
    pub added: i64,
    /// Height the transaction is expected to confirm at, `0` if unscheduled.
    pub mine_height: u32,
}

impl LockDesc {
    pub fn is_scheduled(&self) -> bool {
        self.mine_height != 0
    }
}

/// Lock pool state, guarded by the mempool lock.
#[derive(Debug)]
pub(crate) struct TxLockPool {
    locks: IndexMap<Txid, LockDesc>,
    /// Outpoint -> transaction holding the lock on it.
    lock_outpoints: HashMap<OutPoint, Txid>,
    confirmation_distance: u32,
}

impl TxLockPool {
    pub(crate) fn new(confirmation_distance: u32) -> Self {
        Self {
            locks: IndexMap::new(),
            lock_outpoints: HashMap::new(),
            confirmation_distance,
        }
    }

    pub(crate) fn contains(&self, txid: &Txid) -> bool {
        self.locks.contains_key(txid)
    }

    pub(crate) fn len(&self) -> usize {
        self.locks.len()
    }

    pub(crate) fn outpoint_count(&self) -> usize {
        self.lock_outpoints.len()
    }

    pub(crate) fn is_outpoint_locked(&self, outpoint: &OutPoint) -> bool {
        self.lock_outpoints.contains_key(outpoint)
    }

    /// Returns the first input of `tx` locked by another transaction.
    pub(crate) fn find_conflict(&self, tx: &Transaction, txid: &Txid) -> Option<(OutPoint, Txid)> {
        spent_outpoints(tx).find_map(|outpoint| {
            self.lock_outpoints
                .get(&outpoint)
                .filter(|holder| *holder != txid)
                .map(|holder| (outpoint, *holder))
        })
    }

    /// Inserts an unscheduled lock for `tx`.
    ///
    /// Callers must have checked for conflicts first.
    pub(crate) fn insert(&mut self, tx: Arc<Transaction>, txid: Txid, height: u32, now: i64) {
        for outpoint in spent_outpoints(&tx) {
            self.lock_outpoints.insert(outpoint, txid);
        }

        self.locks.insert(
            txid,
            LockDesc {
                tx,
                txid,
                added_height: height,
                added: now,
                mine_height: 0,
            },
        );
    }

    /// Sets the scheduled confirmation height, `0` clears it.
    ///
    /// Returns `false` if the transaction is not locked.
    pub(crate) fn set_scheduled_height(&mut self, txid: &Txid, height: u32) -> bool {
        match self.locks.get_mut(txid) {
            Some(desc) => {
                desc.mine_height = height;
                true
            }
            None => false,
        }
    }

    /// Removes every scheduled lock confirmed deep enough at `current_height`.
    pub(crate) fn prune_confirmed(&mut self, current_height: u32) -> Vec<Txid> {
        let distance = self.confirmation_distance;
        let confirmed: Vec<Txid> = self
            .locks
            .values()
            .filter(|desc| {
                desc.is_scheduled() && current_height.saturating_sub(desc.mine_height) >= distance
            })
            .map(|desc| desc.txid)
            .collect();

        for txid in &confirmed {
            self.remove(txid);
        }

        confirmed
    }

    /// Removes every lock held by another transaction on an input of `tx`.
    pub(crate) fn remove_conflicting(&mut self, tx: &Transaction) -> Vec<Txid> {
        let txid = tx.compute_txid();
        let mut removed = Vec::new();

        for outpoint in spent_outpoints(tx) {
            let Some(holder) = self.lock_outpoints.get(&outpoint).copied() else {
                continue;
            };

            if holder != txid && self.remove(&holder).is_some() {
                removed.push(holder);
            }
        }

        removed
    }

    /// Removes a lock together with all its lock-outpoint entries.
    pub(crate) fn remove(&mut self, txid: &Txid) -> Option<LockDesc> {
        let desc = self.locks.shift_remove(txid)?;

        for outpoint in spent_outpoints(&desc.tx) {
            if self.lock_outpoints.get(&outpoint) == Some(txid) {
                self.lock_outpoints.remove(&outpoint);
            }
        }

        Some(desc)
    }

    /// Up to `limit` unscheduled locks, oldest first.
    pub(crate) fn pending(&self, limit: usize) -> Vec<LockDesc> {
        self.locks
            .values()
            .filter(|desc| !desc.is_scheduled())
            .take(limit)
            .cloned()
            .collect()
    }

    pub(crate) fn snapshot(&self) -> Vec<LockDesc> {
        self.locks.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::absolute::LockTime;
    use bitcoin::hashes::Hash;
    use bitcoin::transaction::Version;
    use bitcoin::{Amount, ScriptBuf, Sequence, TxIn, TxOut, Witness};

    fn spend(prevs: &[OutPoint], value: u64) -> Arc<Transaction> {
        Arc::new(Transaction {
            version: Version::ONE,
            lock_time: LockTime::ZERO,
            input: prevs
                .iter()
                .map(|prev| TxIn {
                    previous_output: *prev,
                    script_sig: ScriptBuf::new(),
                    sequence: Sequence::MAX,
                    witness: Witness::default(),
                })
                .collect(),
            output: vec![TxOut {
                value: Amount::from_sat(value),
                script_pubkey: ScriptBuf::new(),
            }],
        })
    }

    fn outpoint(n: u8) -> OutPoint {
        OutPoint::new(Txid::from_byte_array([n; 32]), 0)
    }

    fn lock(pool: &mut TxLockPool, tx: &Arc<Transaction>) -> Txid {
        let txid = tx.compute_txid();
        pool.insert(tx.clone(), txid, 10, 0);
        txid
    }

    #[test]
    fn test_schedule_and_prune() {
        let mut pool = TxLockPool::new(100);
        let a = lock(&mut pool, &spend(&[outpoint(1), outpoint(2)], 1));
        let b = lock(&mut pool, &spend(&[outpoint(3)], 1));

        assert_eq!(pool.len(), 2);
        assert_eq!(pool.outpoint_count(), 3);

        assert!(pool.set_scheduled_height(&a, 500));
        assert!(!pool.set_scheduled_height(&Txid::all_zeros(), 500));
        assert_eq!(pool.pending(10).len(), 1);

        assert!(pool.prune_confirmed(599).is_empty());
        assert_eq!(pool.prune_confirmed(600), vec![a]);
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.outpoint_count(), 1);

        // Unscheduled locks are never pruned.
        assert!(pool.prune_confirmed(u32::MAX).is_empty());
        assert!(pool.contains(&b));
    }

    #[test]
    fn test_remove_conflicting() {
        let mut pool = TxLockPool::new(100);
        let tx = spend(&[outpoint(1), outpoint(2)], 1);
        let txid = lock(&mut pool, &tx);

        // The lock holder never conflicts with itself.
        assert!(pool.remove_conflicting(&tx).is_empty());
        assert_eq!(pool.find_conflict(&tx, &txid), None);

        let rival = spend(&[outpoint(2)], 2);
        assert_eq!(
            pool.find_conflict(&rival, &rival.compute_txid()),
            Some((outpoint(2), txid))
        );
        assert_eq!(pool.remove_conflicting(&rival), vec![txid]);
        assert_eq!(pool.len(), 0);
        assert_eq!(pool.outpoint_count(), 0);
        assert!(!pool.is_outpoint_locked(&outpoint(1)));
    }

    #[test]
    fn test_pending_limit_and_order() {
        let mut pool = TxLockPool::new(100);
        let txids: Vec<Txid> = (1..=4)
            .map(|n| lock(&mut pool, &spend(&[outpoint(n)], 1)))
            .collect();

        pool.set_scheduled_height(&txids[1], 5);

        let pending: Vec<Txid> = pool.pending(2).into_iter().map(|desc| desc.txid).collect();
        assert_eq!(pending, vec![txids[0], txids[2]]);
        assert_eq!(pool.snapshot().len(), 4);
    }
}
