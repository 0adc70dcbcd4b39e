//! Primitives shared by the hcd node components.

pub mod consensus;
pub mod stake;
pub mod tx_pool;

/// Number of blocks a coinbase output must wait before it can be spent.
pub const COINBASE_MATURITY: u32 = 256;

/// Maximum serialized size of a block.
pub const MAX_BLOCK_SIZE: usize = 393_216;

/// Maximum number of signature operations allowed in a block.
pub const MAX_SIG_OPS_PER_BLOCK: usize = MAX_BLOCK_SIZE / 200;

/// Current transaction version.
pub const TX_VERSION: i32 = 1;

/// Height used for outputs of transactions that only exist in the memory pool.
pub const MEMPOOL_HEIGHT: u32 = 0x7fff_ffff;
