use crate::MAX_BLOCK_SIZE;
use crate::stake;
use bitcoin::{Amount, Transaction};
use std::collections::HashSet;

/// Minimum length of a coinbase signature script.
const MIN_COINBASE_SCRIPT_LEN: usize = 2;

/// Maximum length of a coinbase signature script.
const MAX_COINBASE_SCRIPT_LEN: usize = 100;

/// Transaction validation error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TxError {
    #[error("Transaction has no inputs")]
    EmptyInput,
    #[error("Transaction has no outputs")]
    EmptyOutput,
    #[error("Transaction size of {0} bytes is larger than max allowed size of {MAX_BLOCK_SIZE}")]
    TransactionOversize(usize),
    #[error("Transaction contains duplicate inputs at index {0}")]
    DuplicateTxInput(usize),
    #[error("Output value {0} is too large")]
    OutputValueTooLarge(Amount),
    #[error("Total output value {0} is too large")]
    TotalOutputValueTooLarge(Amount),
    #[error(
        "Coinbase transaction script length of {0} is out of range \
        (min: {MIN_COINBASE_SCRIPT_LEN}, max: {MAX_COINBASE_SCRIPT_LEN})"
    )]
    BadCoinbaseLength(usize),
    #[error("Transaction input {0} refers to a previous output that is null")]
    PreviousOutputNull(usize),
}

/// Basic checks that don't depend on any context.
///
/// The stakebase input of a vote is the only non-coinbase input allowed to
/// reference a null outpoint.
pub fn check_transaction_sanity(tx: &Transaction) -> Result<(), TxError> {
    if tx.input.is_empty() {
        return Err(TxError::EmptyInput);
    }

    if tx.output.is_empty() {
        return Err(TxError::EmptyOutput);
    }

    let size = tx.total_size();
    if size > MAX_BLOCK_SIZE {
        return Err(TxError::TransactionOversize(size));
    }

    let mut value_out = Amount::ZERO;
    tx.output.iter().try_for_each(|txout| {
        if txout.value > Amount::MAX_MONEY {
            return Err(TxError::OutputValueTooLarge(txout.value));
        }

        value_out += txout.value;

        if value_out > Amount::MAX_MONEY {
            return Err(TxError::TotalOutputValueTooLarge(value_out));
        }

        Ok(())
    })?;

    // Check for duplicate inputs.
    let mut seen_inputs = HashSet::with_capacity(tx.input.len());
    for (index, txin) in tx.input.iter().enumerate() {
        if !seen_inputs.insert(txin.previous_output) {
            return Err(TxError::DuplicateTxInput(index));
        }
    }

    // Coinbase script length must be between min and max length.
    if tx.is_coinbase() {
        let script_sig_len = tx.input[0].script_sig.len();

        if !(MIN_COINBASE_SCRIPT_LEN..=MAX_COINBASE_SCRIPT_LEN).contains(&script_sig_len) {
            return Err(TxError::BadCoinbaseLength(script_sig_len));
        }
    } else {
        let tx_type = stake::classify(tx);

        // Previous transaction outputs referenced by the inputs to this
        // transaction must not be null.
        for (index, txin) in tx.input.iter().enumerate() {
            if txin.previous_output.is_null() && !stake::is_stakebase_input(tx_type, index) {
                return Err(TxError::PreviousOutputNull(index));
            }
        }
    }

    Ok(())
}
