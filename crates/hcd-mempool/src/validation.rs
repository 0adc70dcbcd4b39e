//! Transaction validation for mempool acceptance.
//!
//! Validation never mutates the pool. All chain queries happen here, so a
//! failing chain leaves the pool untouched and committing a validated
//! transaction cannot fail.

use crate::chain::{ChainError, ChainOracle, UtxoView};
use crate::error::MempoolError;
use crate::inner::MemPoolInner;
use crate::options::MemPoolOptions;
use crate::orphan::spent_outpoints;
use crate::policy::{
    MIN_HIGH_PRIORITY, StandardTxError, calc_priority, count_sigops, is_final_tx, is_standard_tx,
};
use bitcoin::{Amount, OutPoint, Transaction, Txid};
use hcd_primitives::MEMPOOL_HEIGHT;
use hcd_primitives::consensus::check_transaction_sanity;
use hcd_primitives::stake::{self, TxType};
use std::sync::Arc;

/// Workspace for validating a single transaction.
///
/// Holds everything computed during validation that the pool needs to commit
/// the transaction.
#[derive(Debug)]
pub(crate) struct ValidationWorkspace {
    pub tx: Arc<Transaction>,
    pub txid: Txid,
    pub tx_type: TxType,
    /// Serialized size in bytes.
    pub size: usize,
    /// Best chain height at validation time.
    pub height: u32,
    pub fee: Amount,
    pub priority: f64,
    pub high_priority: bool,
    /// Admitted below the minimum fee through the free relay limiter.
    pub free_relay: bool,
}

/// Switches controlling a single acceptance attempt.
#[derive(Debug, Clone, Copy)]
pub(crate) struct AcceptFlags {
    /// Reject transactions already present in the orphan pool.
    pub reject_dup_orphans: bool,
    pub rate_limited: bool,
    pub allow_high_fees: bool,
}

/// Outcome of a successful validation.
#[derive(Debug)]
pub(crate) enum Validated {
    /// Some inputs reference transactions unknown to both the chain and the pool.
    MissingParents(Vec<OutPoint>),
    /// The transaction may be committed to the pool.
    Accepted(ValidationWorkspace),
}

/// Runs the full acceptance checks for `tx` against the current pool state.
pub(crate) fn check_transaction<C: ChainOracle + ?Sized>(
    tx: Arc<Transaction>,
    inner: &MemPoolInner,
    chain: &C,
    options: &MemPoolOptions,
    flags: AcceptFlags,
    now: i64,
) -> Result<Validated, MempoolError> {
    let txid = tx.compute_txid();

    if inner.contains(&txid) || (flags.reject_dup_orphans && inner.orphans.contains(&txid)) {
        return Err(MempoolError::AlreadyHaveTransaction(txid));
    }

    check_transaction_sanity(&tx)?;

    if tx.is_coinbase() {
        return Err(MempoolError::Coinbase);
    }

    let tx_type = stake::classify(&tx);
    let best_height = chain.best_height();
    let next_height = best_height.saturating_add(1);
    let median_time = chain.past_median_time();

    let mut view = chain.fetch_utxo_view(&tx)?;
    inner.fill_view_from_pool(&tx, &mut view);

    // Outputs of a confirmed transaction with the same id are still unspent.
    if !view.is_missing_or_spent(&txid) {
        return Err(MempoolError::AlreadyInChain(txid));
    }

    let missing: Vec<OutPoint> = spent_outpoints(&tx)
        .filter(|outpoint| view.is_missing_or_spent(&outpoint.txid))
        .collect();
    if !missing.is_empty() {
        return Ok(Validated::MissingParents(missing));
    }

    for outpoint in spent_outpoints(&tx) {
        if let Some(spender) = inner.get_conflict_tx(&outpoint) {
            return Err(MempoolError::DoubleSpend { outpoint, spender });
        }
    }

    let version = tx.version.0;
    if version < 1 || version > options.max_tx_version {
        return Err(MempoolError::TxVersionNotStandard(version));
    }

    let min_relay_fee_rate = options.min_relay_fee_rate();
    is_standard_tx(
        &tx,
        tx_type,
        options.max_data_carrier_size,
        min_relay_fee_rate,
    )
    .map_err(|err| match err {
        StandardTxError::Dust { index, value } => MempoolError::Dust { index, value },
        other => MempoolError::NotStandard(other.to_string()),
    })?;

    let sigops = count_sigops(&tx, tx_type, &view);
    if sigops > options.max_sig_ops_per_tx {
        return Err(MempoolError::TooManySigops(sigops));
    }

    let fee = check_inputs(&tx, tx_type, &view, next_height, options)?;

    let size = tx.total_size();
    let priority = calc_priority(&tx, tx_type, &view, next_height);
    let min_fee = min_relay_fee_rate.min_fee(size);
    let mut free_relay = false;

    if tx_type == TxType::Regular && fee < min_fee {
        if size >= options.block_priority_size.saturating_sub(1000) {
            return Err(MempoolError::InsufficientFee { fee, min_fee });
        }

        if !options.disable_relay_priority && priority <= MIN_HIGH_PRIORITY {
            return Err(MempoolError::InsufficientPriority {
                priority,
                min_priority: MIN_HIGH_PRIORITY,
            });
        }

        if flags.rate_limited {
            let relayed = inner.free_relay.decayed_total(now);
            if relayed >= options.free_relay_budget() {
                tracing::debug!(
                    target: crate::LOG_TARGET,
                    "Rejecting free transaction {txid}: relayed {relayed:.0} of {:.0} bytes",
                    options.free_relay_budget()
                );
                return Err(MempoolError::RateLimited);
            }
            free_relay = true;
        }
    }

    if !flags.allow_high_fees {
        let max_fee =
            min_relay_fee_rate.min_fee(size.saturating_mul(options.max_relay_fee_multiplier as usize));
        if fee > max_fee {
            return Err(MempoolError::HighFee { fee, max_fee });
        }
    }

    if !is_final_tx(&tx, next_height, median_time) {
        return Err(MempoolError::NonFinal);
    }

    let sequence_lock = chain.calc_sequence_lock(&tx, &view)?;
    if !sequence_lock.is_active(i64::from(next_height), median_time) {
        return Err(MempoolError::SequenceLock);
    }

    check_stake_rules(&tx, tx_type, chain, next_height, options)?;

    let script_flags = chain.standard_verify_flags()?;
    chain
        .check_scripts(&tx, &view, script_flags)
        .map_err(|err| match err {
            ChainError::ScriptFailure(reason) => MempoolError::ScriptValidationFailed(reason),
            other => MempoolError::Chain(other),
        })?;

    Ok(Validated::Accepted(ValidationWorkspace {
        tx,
        txid,
        tx_type,
        size,
        height: best_height,
        fee,
        priority,
        high_priority: priority > MIN_HIGH_PRIORITY,
        free_relay,
    }))
}

/// Checks the referenced outputs and returns the fee paid by `tx`.
///
/// Votes create coins through their stakebase input, so their fee is whatever
/// the ticket input covers beyond the outputs, floored at zero.
fn check_inputs(
    tx: &Transaction,
    tx_type: TxType,
    view: &UtxoView,
    next_height: u32,
    options: &MemPoolOptions,
) -> Result<Amount, MempoolError> {
    let mut value_in = Amount::ZERO;

    for outpoint in spent_outpoints(tx) {
        let entry = view
            .lookup_entry(&outpoint.txid)
            .ok_or(MempoolError::MissingOutput(outpoint))?;
        let amount = entry
            .amount(outpoint.vout)
            .ok_or(MempoolError::MissingOutput(outpoint))?;

        if entry.is_coinbase() && entry.height() != MEMPOOL_HEIGHT {
            let origin_height = entry.height();
            if next_height.saturating_sub(origin_height) < options.coinbase_maturity {
                return Err(MempoolError::ImmatureSpend {
                    outpoint,
                    origin_height,
                    next_height,
                });
            }
        }

        value_in = value_in
            .checked_add(amount)
            .ok_or(MempoolError::FeeOverflow)?;
    }

    let value_out = tx
        .output
        .iter()
        .try_fold(Amount::ZERO, |total, txout| total.checked_add(txout.value))
        .ok_or(MempoolError::FeeOverflow)?;

    if tx_type == TxType::Vote {
        return Ok(value_in.checked_sub(value_out).unwrap_or(Amount::ZERO));
    }

    value_in
        .checked_sub(value_out)
        .ok_or(MempoolError::NegativeFee)
}

fn check_stake_rules<C: ChainOracle + ?Sized>(
    tx: &Transaction,
    tx_type: TxType,
    chain: &C,
    next_height: u32,
    options: &MemPoolOptions,
) -> Result<(), MempoolError> {
    match tx_type {
        TxType::Ticket => {
            let difficulty = chain.next_stake_difficulty()?;
            let price = tx.output[0].value;
            if price < difficulty {
                return Err(MempoolError::TicketBelowDifficulty { price, difficulty });
            }
        }
        TxType::Vote => {
            let (voted_hash, voted_height) =
                stake::voted_block(tx).ok_or(MempoolError::MalformedVote)?;

            let min_height = next_height.saturating_sub(options.max_vote_age);
            if voted_height < min_height {
                return Err(MempoolError::VoteTooOld {
                    height: voted_height,
                    min_height,
                });
            }

            chain.block_by_hash(&voted_hash)?;
        }
        TxType::Regular | TxType::Revocation => {}
    }

    Ok(())
}
