//! Stake transaction tagging.
//!
//! Stake transactions are ordinary transactions whose output scripts carry a
//! one byte tag in front of a standard script. The tag tells which part of the
//! ticket lifecycle an output belongs to:
//!
//! - `OP_SSTX` marks the ticket purchase output.
//! - `OP_SSGEN` marks the reward outputs of a vote.
//! - `OP_SSRTX` marks the refund outputs of a revocation.
//! - `OP_SSTXCHANGE` marks the change outputs of a ticket purchase.
//!
//! A vote additionally spends a null "stakebase" outpoint in its first input and
//! commits to the block it votes on in its first output.

use bitcoin::hashes::Hash;
use bitcoin::opcodes::all::{OP_PUSHBYTES_36, OP_RETURN};
use bitcoin::{BlockHash, Script, ScriptBuf, Transaction};

/// Ticket purchase tag.
pub const OP_SSTX: u8 = 0xba;
/// Vote tag.
pub const OP_SSGEN: u8 = 0xbb;
/// Revocation tag.
pub const OP_SSRTX: u8 = 0xbc;
/// Ticket change tag.
pub const OP_SSTXCHANGE: u8 = 0xbd;

/// Length of the vote commitment script: OP_RETURN, push opcode, hash, height.
const VOTE_COMMITMENT_SCRIPT_LEN: usize = 2 + 32 + 4;

/// Kind of a transaction with regard to the stake system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxType {
    /// Plain value transfer.
    Regular,
    /// Ticket purchase.
    Ticket,
    /// Vote on a block.
    Vote,
    /// Revocation of a missed or expired ticket.
    Revocation,
}

impl TxType {
    /// Returns `true` for all stake transaction kinds.
    pub fn is_stake(&self) -> bool {
        !matches!(self, Self::Regular)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Regular => "regular",
            Self::Ticket => "ticket",
            Self::Vote => "vote",
            Self::Revocation => "revocation",
        }
    }
}

impl std::fmt::Display for TxType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returns `true` if the script starts with `tag` followed by a non-empty script.
pub fn is_tagged(script: &Script, tag: u8) -> bool {
    let bytes = script.as_bytes();
    bytes.len() > 1 && bytes[0] == tag
}

/// Returns the stake tag of the script, if any.
pub fn stake_tag(script: &Script) -> Option<u8> {
    let bytes = script.as_bytes();
    match bytes.first() {
        Some(&tag) if bytes.len() > 1 && (OP_SSTX..=OP_SSTXCHANGE).contains(&tag) => Some(tag),
        _ => None,
    }
}

/// Strips the stake tag from the script, returning the underlying standard script.
pub fn strip_tag(script: &Script) -> &Script {
    match stake_tag(script) {
        Some(_) => Script::from_bytes(&script.as_bytes()[1..]),
        None => script,
    }
}

/// Prefixes `script` with the given stake tag.
pub fn tag_script(tag: u8, script: &Script) -> ScriptBuf {
    let mut bytes = Vec::with_capacity(script.len() + 1);
    bytes.push(tag);
    bytes.extend_from_slice(script.as_bytes());
    ScriptBuf::from_bytes(bytes)
}

/// Builds the vote commitment script for the given block.
pub fn vote_commitment_script(block_hash: BlockHash, height: u32) -> ScriptBuf {
    let mut bytes = Vec::with_capacity(VOTE_COMMITMENT_SCRIPT_LEN);
    bytes.push(OP_RETURN.to_u8());
    bytes.push(OP_PUSHBYTES_36.to_u8());
    bytes.extend_from_slice(&block_hash.to_byte_array());
    bytes.extend_from_slice(&height.to_le_bytes());
    ScriptBuf::from_bytes(bytes)
}

/// Builds the vote bits script carried by the second output of a vote.
pub fn vote_bits_script(bits: u16) -> ScriptBuf {
    let [lo, hi] = bits.to_le_bytes();
    ScriptBuf::from_bytes(vec![OP_RETURN.to_u8(), 0x02, lo, hi])
}

/// Parses the vote commitment script, returning the voted block hash and height.
pub fn parse_vote_commitment(script: &Script) -> Option<(BlockHash, u32)> {
    let bytes = script.as_bytes();

    if bytes.len() != VOTE_COMMITMENT_SCRIPT_LEN
        || bytes[0] != OP_RETURN.to_u8()
        || bytes[1] != OP_PUSHBYTES_36.to_u8()
    {
        return None;
    }

    let mut hash = [0u8; 32];
    hash.copy_from_slice(&bytes[2..34]);
    let mut height = [0u8; 4];
    height.copy_from_slice(&bytes[34..38]);

    Some((BlockHash::from_byte_array(hash), u32::from_le_bytes(height)))
}

/// Returns `true` if the transaction purchases a ticket.
pub fn is_ticket(tx: &Transaction) -> bool {
    !tx.input.is_empty()
        && tx
            .output
            .first()
            .is_some_and(|txout| is_tagged(&txout.script_pubkey, OP_SSTX))
}

/// Returns `true` if the transaction is a vote.
///
/// A vote spends the stakebase in input 0 and the ticket in input 1, commits to
/// the voted block in output 0, carries the vote bits in output 1 and pays the
/// rewards in the remaining `OP_SSGEN` outputs.
pub fn is_vote(tx: &Transaction) -> bool {
    tx.input.len() == 2
        && tx.input[0].previous_output.is_null()
        && !tx.input[1].previous_output.is_null()
        && tx.output.len() > 2
        && parse_vote_commitment(&tx.output[0].script_pubkey).is_some()
        && tx.output[1].script_pubkey.is_op_return()
        && tx.output[2..]
            .iter()
            .all(|txout| is_tagged(&txout.script_pubkey, OP_SSGEN))
}

/// Returns `true` if the transaction revokes a ticket.
pub fn is_revocation(tx: &Transaction) -> bool {
    tx.input.len() == 1
        && !tx.input[0].previous_output.is_null()
        && !tx.output.is_empty()
        && tx
            .output
            .iter()
            .all(|txout| is_tagged(&txout.script_pubkey, OP_SSRTX))
}

/// Classifies the transaction.
pub fn classify(tx: &Transaction) -> TxType {
    if is_vote(tx) {
        TxType::Vote
    } else if is_ticket(tx) {
        TxType::Ticket
    } else if is_revocation(tx) {
        TxType::Revocation
    } else {
        TxType::Regular
    }
}

/// Returns the block a vote is voting on.
pub fn voted_block(tx: &Transaction) -> Option<(BlockHash, u32)> {
    if !is_vote(tx) {
        return None;
    }
    parse_vote_commitment(&tx.output[0].script_pubkey)
}

/// Returns `true` if input `index` of a transaction of kind `tx_type` is a stakebase.
///
/// Stakebase inputs create new coins and never reference a real output.
pub fn is_stakebase_input(tx_type: TxType, index: usize) -> bool {
    tx_type == TxType::Vote && index == 0
}
