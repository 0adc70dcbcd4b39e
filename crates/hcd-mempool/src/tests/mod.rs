//! Integration tests for admission, orphan handling and the lock pool.


use crate::{
    ChainError, ChainOracle, MemPool, MemPoolOptions, MempoolError, ScriptFlags, SequenceLock,
    UtxoEntry, UtxoView,
};
use bitcoin::absolute::LockTime;
use bitcoin::block::{Header, Version as BlockVersion};
use bitcoin::hashes::Hash;
use bitcoin::transaction::Version;
use bitcoin::{
    Amount, Block, BlockHash, CompactTarget, OutPoint, PubkeyHash, ScriptBuf, Sequence,
    Transaction, TxIn, TxMerkleNode, TxOut, Txid, Witness,
};
use hcd_primitives::stake;
use hcd_primitives::tx_pool::RejectCode;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

/// Value of every output paid by the test coinbases.
pub const COINBASE_OUTPUT_VALUE: Amount = Amount::from_sat(1_000_000_000);

/// Best height of the fake chain, coinbases mined at height 1 are exactly
/// mature for the next block.
pub const BEST_HEIGHT: u32 = 256;

pub fn init_logger() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

struct FakeChainState {
    utxos: HashMap<Txid, UtxoEntry>,
    blocks: HashMap<BlockHash, Arc<Block>>,
    best_height: u32,
    best_hash: BlockHash,
    median_time: i64,
    stake_difficulty: Amount,
    sequence_lock: SequenceLock,
    script_failure: Option<String>,
    offline: bool,
}

impl FakeChainState {
    fn ensure_online(&self) -> Result<(), ChainError> {
        if self.offline {
            return Err(ChainError::Other("chain unavailable".to_string()));
        }
        Ok(())
    }
}

/// In-memory chain oracle with a mutable UTXO set.
pub struct FakeChain {
    state: RwLock<FakeChainState>,
}

impl FakeChain {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(FakeChainState {
                utxos: HashMap::new(),
                blocks: HashMap::new(),
                best_height: BEST_HEIGHT,
                best_hash: BlockHash::all_zeros(),
                median_time: 1_600_000_000,
                stake_difficulty: Amount::from_sat(100_000_000),
                sequence_lock: SequenceLock::NONE,
                script_failure: None,
                offline: false,
            }),
        }
    }

    /// Adds all outputs of `tx` to the UTXO set as if mined at `height`.
    pub fn add_tx(&self, tx: &Transaction, height: u32) {
        self.state
            .write()
            .utxos
            .insert(tx.compute_txid(), UtxoEntry::from_tx(tx, height));
    }

    /// Stores an empty block and returns its hash.
    pub fn add_block(&self, height: u32) -> BlockHash {
        let block = Block {
            header: Header {
                version: BlockVersion::ONE,
                prev_blockhash: BlockHash::all_zeros(),
                merkle_root: TxMerkleNode::all_zeros(),
                time: height,
                bits: CompactTarget::from_consensus(0x207f_ffff),
                nonce: 0,
            },
            txdata: Vec::new(),
        };
        let hash = block.block_hash();
        self.state.write().blocks.insert(hash, Arc::new(block));
        hash
    }

    pub fn set_best_height(&self, height: u32) {
        self.state.write().best_height = height;
    }

    pub fn set_stake_difficulty(&self, difficulty: Amount) {
        self.state.write().stake_difficulty = difficulty;
    }

    pub fn set_sequence_lock(&self, lock: SequenceLock) {
        self.state.write().sequence_lock = lock;
    }

    pub fn set_script_failure(&self, reason: Option<&str>) {
        self.state.write().script_failure = reason.map(ToString::to_string);
    }

    /// Makes every fallible query fail.
    pub fn set_offline(&self, offline: bool) {
        self.state.write().offline = offline;
    }
}

impl ChainOracle for FakeChain {
    fn fetch_utxo_view(&self, tx: &Transaction) -> Result<UtxoView, ChainError> {
        let state = self.state.read();
        state.ensure_online()?;

        let mut view = UtxoView::new();
        let txid = tx.compute_txid();
        view.add_entry(txid, state.utxos.get(&txid).cloned());
        for txin in &tx.input {
            let prev_txid = txin.previous_output.txid;
            view.add_entry(prev_txid, state.utxos.get(&prev_txid).cloned());
        }

        Ok(view)
    }

    fn best_height(&self) -> u32 {
        self.state.read().best_height
    }

    fn best_hash(&self) -> BlockHash {
        self.state.read().best_hash
    }

    fn past_median_time(&self) -> i64 {
        self.state.read().median_time
    }

    fn next_stake_difficulty(&self) -> Result<Amount, ChainError> {
        let state = self.state.read();
        state.ensure_online()?;
        Ok(state.stake_difficulty)
    }

    fn calc_sequence_lock(
        &self,
        _tx: &Transaction,
        _view: &UtxoView,
    ) -> Result<SequenceLock, ChainError> {
        let state = self.state.read();
        state.ensure_online()?;
        Ok(state.sequence_lock)
    }

    fn standard_verify_flags(&self) -> Result<ScriptFlags, ChainError> {
        self.state.read().ensure_online()?;
        Ok(ScriptFlags::STANDARD)
    }

    fn check_scripts(
        &self,
        _tx: &Transaction,
        _view: &UtxoView,
        flags: ScriptFlags,
    ) -> Result<(), ChainError> {
        let state = self.state.read();
        state.ensure_online()?;
        assert!(flags.contains(ScriptFlags::MANDATORY));

        match &state.script_failure {
            Some(reason) => Err(ChainError::ScriptFailure(reason.clone())),
            None => Ok(()),
        }
    }

    fn block_by_hash(&self, hash: &BlockHash) -> Result<Arc<Block>, ChainError> {
        let state = self.state.read();
        state.ensure_online()?;
        state
            .blocks
            .get(hash)
            .cloned()
            .ok_or(ChainError::BlockNotFound(*hash))
    }
}

/// Pool policy used by most tests.
pub fn test_options() -> MemPoolOptions {
    MemPoolOptions::builder()
        .max_tx_version(1)
        .disable_relay_priority(true)
        .free_tx_relay_limit(15.0)
        .max_orphan_txs(5)
        .max_orphan_tx_size(1000)
        .min_relay_tx_fee(1000)
        .build()
}

/// Mempool wired to a fake chain.
pub struct Harness {
    pub chain: Arc<FakeChain>,
    pub pool: MemPool<FakeChain>,
    coinbase_nonce: AtomicU32,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_options(test_options())
    }

    pub fn with_options(options: MemPoolOptions) -> Self {
        init_logger();
        let chain = Arc::new(FakeChain::new());
        let pool = MemPool::with_options(chain.clone(), options).unwrap();
        Self {
            chain,
            pool,
            coinbase_nonce: AtomicU32::new(0),
        }
    }

    /// Mines a coinbase paying `count` outputs at `height`.
    pub fn mine_coinbase(&self, count: usize, height: u32) -> Vec<OutPoint> {
        let nonce = self.coinbase_nonce.fetch_add(1, Ordering::Relaxed);
        let mut script_sig = vec![0x04];
        script_sig.extend_from_slice(&nonce.to_le_bytes());

        let coinbase = Transaction {
            version: Version::ONE,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::null(),
                script_sig: ScriptBuf::from_bytes(script_sig),
                sequence: Sequence::MAX,
                witness: Witness::default(),
            }],
            output: (0..count)
                .map(|_| TxOut {
                    value: COINBASE_OUTPUT_VALUE,
                    script_pubkey: p2pkh_script(),
                })
                .collect(),
        };

        self.chain.add_tx(&coinbase, height);

        let txid = coinbase.compute_txid();
        (0..count as u32).map(|vout| OutPoint::new(txid, vout)).collect()
    }

    /// Mature coinbase outputs.
    pub fn spendable(&self, count: usize) -> Vec<OutPoint> {
        self.mine_coinbase(count, 1)
    }

    /// Submits the way the reference policy tests do: no rate limiting, high
    /// fees allowed.
    pub fn submit(
        &self,
        tx: &Transaction,
        allow_orphan: bool,
    ) -> Result<Vec<crate::TxDesc>, MempoolError> {
        self.pool.submit(tx.clone(), allow_orphan, true, false)
    }
}

pub fn p2pkh_script() -> ScriptBuf {
    ScriptBuf::new_p2pkh(&PubkeyHash::from_byte_array([0x11; 20]))
}

/// Fluent transaction builder for tests.
pub struct TxBuilder {
    version: Version,
    lock_time: LockTime,
    inputs: Vec<TxIn>,
    outputs: Vec<TxOut>,
}

impl TxBuilder {
    pub fn new() -> Self {
        Self {
            version: Version::ONE,
            lock_time: LockTime::ZERO,
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn input(self, outpoint: OutPoint) -> Self {
        self.input_with_sequence(outpoint, Sequence::MAX)
    }

    pub fn input_with_sequence(mut self, outpoint: OutPoint, sequence: Sequence) -> Self {
        self.inputs.push(TxIn {
            previous_output: outpoint,
            script_sig: ScriptBuf::new(),
            sequence,
            witness: Witness::default(),
        });
        self
    }

    /// Pay-to-pubkey-hash output.
    pub fn output(self, value: Amount) -> Self {
        self.script_output(value, p2pkh_script())
    }

    pub fn script_output(mut self, value: Amount, script_pubkey: ScriptBuf) -> Self {
        self.outputs.push(TxOut {
            value,
            script_pubkey,
        });
        self
    }

    pub fn version(mut self, version: i32) -> Self {
        self.version = Version(version);
        self
    }

    pub fn lock_time(mut self, lock_time: LockTime) -> Self {
        self.lock_time = lock_time;
        self
    }

    pub fn build(self) -> Transaction {
        Transaction {
            version: self.version,
            lock_time: self.lock_time,
            input: self.inputs,
            output: self.outputs,
        }
    }
}

/// Chain of `len` zero fee transactions, each spending the single output of
/// the previous one.
pub fn create_tx_chain(first: OutPoint, value: Amount, len: usize) -> Vec<Transaction> {
    let mut prev = first;
    (0..len)
        .map(|_| {
            let tx = TxBuilder::new().input(prev).output(value).build();
            prev = OutPoint::new(tx.compute_txid(), 0);
            tx
        })
        .collect()
}

/// Ticket purchase paying `price` from `funding`.
pub fn ticket_tx(funding: OutPoint, price: Amount) -> Transaction {
    TxBuilder::new()
        .input(funding)
        .script_output(price, stake::tag_script(stake::OP_SSTX, &p2pkh_script()))
        .build()
}

/// Vote spending `ticket` for the given block.
pub fn vote_tx(ticket: OutPoint, block: BlockHash, height: u32, reward: Amount) -> Transaction {
    Transaction {
        version: Version::ONE,
        lock_time: LockTime::ZERO,
        input: vec![
            TxIn {
                previous_output: OutPoint::null(),
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::default(),
            },
            TxIn {
                previous_output: ticket,
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::default(),
            },
        ],
        output: vec![
            TxOut {
                value: Amount::ZERO,
                script_pubkey: stake::vote_commitment_script(block, height),
            },
            TxOut {
                value: Amount::ZERO,
                script_pubkey: stake::vote_bits_script(1),
            },
            TxOut {
                value: reward,
                script_pubkey: stake::tag_script(stake::OP_SSGEN, &p2pkh_script()),
            },
        ],
    }
}

/// Helper: Assert the error maps to the given reject code.
pub fn assert_reject_code<T: std::fmt::Debug>(
    result: Result<T, MempoolError>,
    code: RejectCode,
) -> MempoolError {
    let err = result.unwrap_err();
    assert_eq!(err.reject_code(), Some(code), "unexpected code for {err:?}");
    err
}

/// Helper: Assert a transaction is in the main pool and not an orphan.
pub fn assert_in_pool(harness: &Harness, txid: &Txid) {
    assert!(
        harness.pool.is_in_pool(txid),
        "Expected transaction {txid} to be in the pool"
    );
    assert!(!harness.pool.is_orphan(txid));
    assert!(harness.pool.have(txid));
}

/// Helper: Assert a transaction is an orphan.
pub fn assert_orphan(harness: &Harness, txid: &Txid) {
    assert!(
        harness.pool.is_orphan(txid),
        "Expected transaction {txid} to be an orphan"
    );
    assert!(!harness.pool.is_in_pool(txid));
    assert!(harness.pool.have(txid));
}

/// Helper: Assert the pool knows nothing about a transaction.
pub fn assert_unknown(harness: &Harness, txid: &Txid) {
    assert!(!harness.pool.is_in_pool(txid));
    assert!(!harness.pool.is_orphan(txid));
    assert!(!harness.pool.have(txid));
}
