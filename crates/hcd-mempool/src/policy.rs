//! Relay policy: standardness, dust, signature operations and priority.

use crate::chain::UtxoView;
use crate::types::FeeRate;
use bitcoin::absolute::{LOCK_TIME_THRESHOLD, LockTime};
use bitcoin::opcodes::all::{
    OP_CHECKMULTISIG, OP_CHECKMULTISIGVERIFY, OP_CHECKSIG, OP_CHECKSIGVERIFY, OP_PUSHNUM_1,
    OP_PUSHNUM_16,
};
use bitcoin::script::Instruction;
use bitcoin::{Amount, Script, Transaction, TxOut};
use hcd_primitives::MEMPOOL_HEIGHT;
use hcd_primitives::stake::{self, TxType};

/// The maximum size for transactions we're willing to relay/mine.
pub const MAX_STANDARD_TX_SIZE: usize = 100_000;

/// The maximum size of a standard ScriptSig.
const MAX_STANDARD_SCRIPTSIG_SIZE: usize = 1650;

/// Estimated size of an input spending a standard output, used for dust.
const SPEND_INPUT_SIZE: usize = 148;

/// Number of signature operations a bare multisig counts as when the key
/// count can't be determined.
const MAX_PUBKEYS_PER_MULTISIG: usize = 20;

/// Priority above which a transaction is relayed for free.
///
/// One coin one day old in a 250 byte transaction.
pub const MIN_HIGH_PRIORITY: f64 = 100_000_000.0 * 144.0 / 250.0;

/// Output script classes the pool relays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptClass {
    PubKey,
    PubKeyHash,
    ScriptHash,
    WitnessV0KeyHash,
    WitnessV0ScriptHash,
    WitnessV1Taproot,
    NullData,
    NonStandard,
}

/// Classify a (tag stripped) output script.
pub fn classify_script(script: &Script) -> ScriptClass {
    if script.is_p2pkh() {
        ScriptClass::PubKeyHash
    } else if script.is_p2sh() {
        ScriptClass::ScriptHash
    } else if script.is_p2pk() {
        ScriptClass::PubKey
    } else if script.is_p2wpkh() {
        ScriptClass::WitnessV0KeyHash
    } else if script.is_p2wsh() {
        ScriptClass::WitnessV0ScriptHash
    } else if script.is_p2tr() {
        ScriptClass::WitnessV1Taproot
    } else if is_null_data(script) {
        ScriptClass::NullData
    } else {
        ScriptClass::NonStandard
    }
}

/// A nulldata script is OP_RETURN followed by data pushes only.
fn is_null_data(script: &Script) -> bool {
    script.is_op_return() && Script::from_bytes(&script.as_bytes()[1..]).is_push_only()
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StandardTxError {
    #[error("transaction size of {0} bytes is larger than max allowed size")]
    TxSizeTooLarge(usize),
    #[error("input {0} signature script is too large")]
    ScriptsigSize(usize),
    #[error("input {0} signature script is not push only")]
    ScriptsigNotPushonly(usize),
    #[error("output {0} has a non-standard script")]
    ScriptPubkey(usize),
    #[error("output {0} stake tag is not allowed in a {1} transaction")]
    StakeTag(usize, TxType),
    #[error("output {0} data carrier script is too large")]
    DataCarrierSize(usize),
    #[error("more than one nulldata output")]
    MultiOpReturn,
    #[error("output {index} of value {value} is dust")]
    Dust { index: usize, value: Amount },
}

/// Check whether a transaction is standard.
pub fn is_standard_tx(
    tx: &Transaction,
    tx_type: TxType,
    max_data_carrier_size: usize,
    min_relay_fee_rate: FeeRate,
) -> Result<(), StandardTxError> {
    let size = tx.total_size();
    if size > MAX_STANDARD_TX_SIZE {
        return Err(StandardTxError::TxSizeTooLarge(size));
    }

    for (index, input) in tx.input.iter().enumerate() {
        if input.script_sig.len() > MAX_STANDARD_SCRIPTSIG_SIZE {
            return Err(StandardTxError::ScriptsigSize(index));
        }

        if !input.script_sig.is_push_only() {
            return Err(StandardTxError::ScriptsigNotPushonly(index));
        }
    }

    let mut data_out = 0;

    for (index, output) in tx.output.iter().enumerate() {
        let script = &output.script_pubkey;

        if let Some(tag) = stake::stake_tag(script) {
            if !tag_allowed(tx_type, tag) {
                return Err(StandardTxError::StakeTag(index, tx_type));
            }

            // Tagged outputs must wrap a plain payment script.
            match classify_script(stake::strip_tag(script)) {
                ScriptClass::PubKeyHash | ScriptClass::ScriptHash => {}
                _ => return Err(StandardTxError::ScriptPubkey(index)),
            }
        } else {
            match classify_script(script) {
                ScriptClass::NonStandard => return Err(StandardTxError::ScriptPubkey(index)),
                ScriptClass::NullData => {
                    if script.len() > max_data_carrier_size {
                        return Err(StandardTxError::DataCarrierSize(index));
                    }

                    data_out += 1;

                    // Votes carry their commitments in nulldata outputs.
                    if data_out > 1 && tx_type == TxType::Regular {
                        return Err(StandardTxError::MultiOpReturn);
                    }

                    continue;
                }
                _ => {}
            }
        }

        if is_dust(output, min_relay_fee_rate) {
            return Err(StandardTxError::Dust {
                index,
                value: output.value,
            });
        }
    }

    Ok(())
}

fn tag_allowed(tx_type: TxType, tag: u8) -> bool {
    match tx_type {
        TxType::Ticket => tag == stake::OP_SSTX || tag == stake::OP_SSTXCHANGE,
        TxType::Vote => tag == stake::OP_SSGEN,
        TxType::Revocation => tag == stake::OP_SSRTX,
        TxType::Regular => false,
    }
}

/// Check if an output is dust.
///
/// An output is dust when spending it would cost more than a third of its value
/// at the minimum relay fee.
pub fn is_dust(output: &TxOut, min_relay_fee_rate: FeeRate) -> bool {
    if output.script_pubkey.is_op_return() {
        return true;
    }

    let total_size = bitcoin::consensus::encode::serialize(output).len() + SPEND_INPUT_SIZE;
    let value = u128::from(output.value.to_sat());

    value * 1000 / (3 * total_size as u128) < u128::from(min_relay_fee_rate.as_atoms_per_kb())
}

/// Counts the signature operations in a script.
///
/// In accurate mode a multisig preceded by a small integer push counts as that
/// many operations, otherwise it counts as the maximum.
pub fn count_script_sigops(script: &Script, accurate: bool) -> usize {
    let mut count = 0;
    let mut last_op = None;

    for instruction in script.instructions() {
        let Ok(instruction) = instruction else {
            break;
        };

        match instruction {
            Instruction::Op(op) => {
                if op == OP_CHECKSIG || op == OP_CHECKSIGVERIFY {
                    count += 1;
                } else if op == OP_CHECKMULTISIG || op == OP_CHECKMULTISIGVERIFY {
                    count += match last_op {
                        Some(prev) if accurate && is_small_int(prev) => {
                            usize::from(prev - OP_PUSHNUM_1.to_u8() + 1)
                        }
                        _ => MAX_PUBKEYS_PER_MULTISIG,
                    };
                }
                last_op = Some(op.to_u8());
            }
            Instruction::PushBytes(_) => last_op = None,
        }
    }

    count
}

fn is_small_int(op: u8) -> bool {
    (OP_PUSHNUM_1.to_u8()..=OP_PUSHNUM_16.to_u8()).contains(&op)
}

/// Counts the signature operations of a transaction, including the ones in
/// the redeem scripts of its pay-to-script-hash inputs.
pub fn count_sigops(tx: &Transaction, tx_type: TxType, view: &UtxoView) -> usize {
    let legacy: usize = tx
        .input
        .iter()
        .map(|txin| count_script_sigops(&txin.script_sig, false))
        .chain(
            tx.output
                .iter()
                .map(|txout| count_script_sigops(stake::strip_tag(&txout.script_pubkey), false)),
        )
        .sum();

    let p2sh: usize = tx
        .input
        .iter()
        .enumerate()
        .filter(|(index, _)| !stake::is_stakebase_input(tx_type, *index))
        .filter_map(|(_, txin)| {
            let prev_out = view.output(&txin.previous_output)?;
            if !stake::strip_tag(&prev_out.script_pubkey).is_p2sh() {
                return None;
            }
            let redeem_script = last_push(&txin.script_sig)?;
            Some(count_script_sigops(Script::from_bytes(redeem_script), true))
        })
        .sum();

    legacy + p2sh
}

fn last_push(script: &Script) -> Option<&[u8]> {
    script
        .instructions()
        .filter_map(|instruction| match instruction {
            Ok(Instruction::PushBytes(bytes)) => Some(bytes.as_bytes()),
            _ => None,
        })
        .last()
}

/// Priority of a transaction: the value-weighted age of its inputs divided by
/// its size, discounting the part of the size taken by signature scripts.
pub fn calc_priority(tx: &Transaction, tx_type: TxType, view: &UtxoView, next_height: u32) -> f64 {
    let overhead: usize = tx
        .input
        .iter()
        .map(|txin| 41 + txin.script_sig.len().min(110))
        .sum();

    // The input overhead is only discounted when the transaction is larger.
    let mut size = tx.total_size();
    if overhead < size {
        size -= overhead;
    }
    if size == 0 {
        return 0.0;
    }

    let input_value_age: f64 = tx
        .input
        .iter()
        .enumerate()
        .filter(|(index, _)| !stake::is_stakebase_input(tx_type, *index))
        .filter_map(|(_, txin)| {
            let entry = view.lookup_entry(&txin.previous_output.txid)?;
            let value = entry.amount(txin.previous_output.vout)?;
            let age = if entry.height() == MEMPOOL_HEIGHT {
                0
            } else {
                next_height.saturating_sub(entry.height())
            };
            Some(value.to_sat() as f64 * f64::from(age))
        })
        .sum();

    input_value_age / size as f64
}

/// Check whether the lock time of a transaction allows it in a block at
/// `height` with the given block time.
pub fn is_final_tx(tx: &Transaction, height: u32, block_time: i64) -> bool {
    if tx.lock_time == LockTime::ZERO {
        return true;
    }

    let lock_time = tx.lock_time.to_consensus_u32();
    let lock_time_limit = if lock_time < LOCK_TIME_THRESHOLD {
        i64::from(height)
    } else {
        block_time
    };

    if i64::from(lock_time) < lock_time_limit {
        return true;
    }

    tx.input.iter().all(|txin| txin.sequence.is_final())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash;
    use bitcoin::script::Builder;
    use bitcoin::transaction::Version;
    use bitcoin::{OutPoint, PubkeyHash, ScriptBuf, ScriptHash, Sequence, TxIn, Txid, Witness};
    use hcd_primitives::stake::{OP_SSGEN, OP_SSTX, tag_script};

    fn p2pkh() -> ScriptBuf {
        ScriptBuf::new_p2pkh(&PubkeyHash::from_byte_array([2; 20]))
    }

    fn txout(sats: u64, script_pubkey: ScriptBuf) -> TxOut {
        TxOut {
            value: Amount::from_sat(sats),
            script_pubkey,
        }
    }

    fn tx_with(script_sig: ScriptBuf, output: Vec<TxOut>) -> Transaction {
        Transaction {
            version: Version::ONE,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::new(Txid::from_byte_array([1; 32]), 0),
                script_sig,
                sequence: Sequence::MAX,
                witness: Witness::default(),
            }],
            output,
        }
    }

    #[test]
    fn test_classify_script() {
        assert_eq!(classify_script(&p2pkh()), ScriptClass::PubKeyHash);
        assert_eq!(
            classify_script(&ScriptBuf::new_p2sh(&ScriptHash::from_byte_array([3; 20]))),
            ScriptClass::ScriptHash
        );
        assert_eq!(
            classify_script(&ScriptBuf::from_bytes(vec![0x6a, 0x01, 0x01])),
            ScriptClass::NullData
        );
        assert_eq!(
            classify_script(&ScriptBuf::from_bytes(vec![0x51])),
            ScriptClass::NonStandard
        );
    }

    #[test]
    fn test_dust() {
        let rate = FeeRate(1000);
        // 34 byte p2pkh output + 148 = 182, threshold 546.
        assert!(is_dust(&txout(545, p2pkh()), rate));
        assert!(!is_dust(&txout(546, p2pkh()), rate));
        assert!(!is_dust(&txout(0, p2pkh()), FeeRate(0)));
        assert!(is_dust(&txout(1_000_000, ScriptBuf::from_bytes(vec![0x6a])), rate));
    }

    #[test]
    fn test_standard_tx() {
        let rate = FeeRate(1000);

        let tx = tx_with(ScriptBuf::new(), vec![txout(10_000, p2pkh())]);
        assert_eq!(is_standard_tx(&tx, TxType::Regular, 83, rate), Ok(()));

        let tx = tx_with(ScriptBuf::new(), vec![txout(100, p2pkh())]);
        assert_eq!(
            is_standard_tx(&tx, TxType::Regular, 83, rate),
            Err(StandardTxError::Dust {
                index: 0,
                value: Amount::from_sat(100)
            })
        );

        let non_push = Builder::new().push_opcode(OP_CHECKSIG).into_script();
        let tx = tx_with(non_push, vec![txout(10_000, p2pkh())]);
        assert_eq!(
            is_standard_tx(&tx, TxType::Regular, 83, rate),
            Err(StandardTxError::ScriptsigNotPushonly(0))
        );

        let data = ScriptBuf::from_bytes(vec![0x6a, 0x01, 0x01]);
        let tx = tx_with(
            ScriptBuf::new(),
            vec![txout(0, data.clone()), txout(0, data.clone())],
        );
        assert_eq!(
            is_standard_tx(&tx, TxType::Regular, 83, rate),
            Err(StandardTxError::MultiOpReturn)
        );
        assert_eq!(
            is_standard_tx(&tx, TxType::Regular, 2, rate),
            Err(StandardTxError::DataCarrierSize(0))
        );

        let tagged = tx_with(
            ScriptBuf::new(),
            vec![txout(10_000, tag_script(OP_SSGEN, &p2pkh()))],
        );
        assert_eq!(
            is_standard_tx(&tagged, TxType::Regular, 83, rate),
            Err(StandardTxError::StakeTag(0, TxType::Regular))
        );
        let ticket = tx_with(
            ScriptBuf::new(),
            vec![txout(10_000, tag_script(OP_SSTX, &p2pkh()))],
        );
        assert_eq!(is_standard_tx(&ticket, TxType::Ticket, 83, rate), Ok(()));
    }

    #[test]
    fn test_count_sigops() {
        let multisig = Builder::new()
            .push_opcode(OP_PUSHNUM_1)
            .push_slice([2u8; 33])
            .push_slice([3u8; 33])
            .push_opcode(bitcoin::opcodes::all::OP_PUSHNUM_2)
            .push_opcode(OP_CHECKMULTISIG)
            .into_script();
        assert_eq!(count_script_sigops(&multisig, true), 2);
        assert_eq!(count_script_sigops(&multisig, false), MAX_PUBKEYS_PER_MULTISIG);
        assert_eq!(count_script_sigops(&p2pkh(), false), 1);

        // Spend a p2sh output with the multisig as redeem script.
        let redeem_hash = ScriptHash::hash(multisig.as_bytes());
        let parent = tx_with(
            ScriptBuf::new(),
            vec![txout(10_000, ScriptBuf::new_p2sh(&redeem_hash))],
        );
        let mut view = UtxoView::new();
        view.add_tx_outs(&parent, 1);

        let script_sig = Builder::new()
            .push_slice(<&bitcoin::script::PushBytes>::try_from(multisig.as_bytes()).unwrap())
            .into_script();
        let mut child = tx_with(script_sig, vec![txout(9_000, p2pkh())]);
        child.input[0].previous_output = OutPoint::new(parent.compute_txid(), 0);

        // One sigop in the p2pkh output, two in the redeem script.
        assert_eq!(count_sigops(&child, TxType::Regular, &view), 3);
    }

    #[test]
    fn test_calc_priority() {
        let parent = tx_with(ScriptBuf::new(), vec![txout(100_000_000, p2pkh())]);
        let mut view = UtxoView::new();
        view.add_tx_outs(&parent, 10);

        let mut child = tx_with(ScriptBuf::new(), vec![txout(90_000_000, p2pkh())]);
        child.input[0].previous_output = OutPoint::new(parent.compute_txid(), 0);

        let size = child.total_size() - 41;
        let expected = 100_000_000.0 * 5.0 / size as f64;
        assert_eq!(calc_priority(&child, TxType::Regular, &view, 15), expected);

        // Pool parents do not age.
        let mut view = UtxoView::new();
        view.add_tx_outs(&parent, MEMPOOL_HEIGHT);
        assert_eq!(calc_priority(&child, TxType::Regular, &view, 15), 0.0);
    }

    #[test]
    fn test_calc_priority_caps_script_overhead() {
        let parent = tx_with(ScriptBuf::new(), vec![txout(100_000_000, p2pkh())]);
        let mut view = UtxoView::new();
        view.add_tx_outs(&parent, 10);

        let mut child = tx_with(
            ScriptBuf::from_bytes(vec![0x00; 200]),
            vec![txout(90_000_000, p2pkh())],
        );
        child.input[0].previous_output = OutPoint::new(parent.compute_txid(), 0);

        // Only the first 110 bytes of a signature script count as overhead.
        let size = child.total_size() - (41 + 110);
        let expected = 100_000_000.0 * 5.0 / size as f64;
        assert_eq!(calc_priority(&child, TxType::Regular, &view, 15), expected);
    }

    #[test]
    fn test_is_final_tx() {
        let mut tx = tx_with(ScriptBuf::new(), vec![txout(10_000, p2pkh())]);
        assert!(is_final_tx(&tx, 1, 0));

        tx.lock_time = LockTime::from_consensus(100);
        tx.input[0].sequence = Sequence::ZERO;
        assert!(!is_final_tx(&tx, 100, 0));
        assert!(is_final_tx(&tx, 101, 0));

        // Final sequence numbers disable the lock time.
        tx.input[0].sequence = Sequence::MAX;
        assert!(is_final_tx(&tx, 100, 0));

        tx.lock_time = LockTime::from_consensus(LOCK_TIME_THRESHOLD + 10);
        tx.input[0].sequence = Sequence::ZERO;
        assert!(!is_final_tx(&tx, 1, i64::from(LOCK_TIME_THRESHOLD + 10)));
        assert!(is_final_tx(&tx, 1, i64::from(LOCK_TIME_THRESHOLD + 11)));
    }
}
