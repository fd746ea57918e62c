//! Protocol constants

/// Base units per coin
pub const COIN: i64 = 1_000_000;

/// Hundredth of a coin
pub const CENT: i64 = 10_000;

/// Maximum money supply: 2,000,000,000 coins in base units
pub const MAX_MONEY: i64 = 2_000_000_000 * COIN;

/// Check a value against the money range [0, MAX_MONEY]
pub fn money_range(value: i64) -> bool {
    (0..=MAX_MONEY).contains(&value)
}

/// Maximum serialized block size
pub const MAX_BLOCK_SIZE: usize = 1_000_000;

/// Block size below which the generator admits free transactions
pub const MAX_BLOCK_SIZE_GEN: usize = MAX_BLOCK_SIZE / 2;

/// Maximum signature operations per block
pub const MAX_BLOCK_SIGOPS: usize = MAX_BLOCK_SIZE / 50;

/// Maximum serialized size of a transaction kept in the orphan buffer
pub const MAX_ORPHAN_TX_SIZE: usize = 5_000;

/// Maximum scriptSig size for a standard transaction
pub const MAX_STANDARD_SCRIPT_SIG_SIZE: usize = 500;

/// Maximum public keys in a standard bare multisig output
pub const MAX_STANDARD_MULTISIG_KEYS: usize = 3;

/// Serialized size below which a transaction may relay for free
pub const FREE_TX_SIZE_LIMIT: usize = 27_000;

/// Minimum fee per started kilobyte when mining
pub const MIN_TX_FEE: i64 = CENT;

/// Minimum fee per started kilobyte when relaying
pub const MIN_RELAY_TX_FEE: i64 = CENT;

/// Smallest non-empty output value
pub const MIN_TXOUT_AMOUNT: i64 = CENT;

/// Blocks a coinbase or coinstake output must wait before it can be spent
pub const COINBASE_MATURITY: u32 = 50;

/// Lock time threshold: below this lock time is a block height, above it a timestamp
pub const LOCKTIME_THRESHOLD: u32 = 500_000_000;

/// Sequence number for final inputs
pub const SEQUENCE_FINAL: u32 = 0xffff_ffff;

/// Number of previous blocks used for median time past
pub const MEDIAN_TIME_SPAN: usize = 11;

/// Maximum distance a block timestamp may run ahead of adjusted time
pub const MAX_CLOCK_DRIFT: u32 = 2 * 60 * 60;

/// Seconds per day, the unit of coin-day weight
pub const SECONDS_PER_DAY: i64 = 24 * 60 * 60;

/// Yearly proof-of-stake reward rate, per CENT of coin-years
pub const MAX_MINT_PROOF_OF_STAKE: i64 = CENT;

// Script engine limits

/// Maximum script length
pub const MAX_SCRIPT_SIZE: usize = 10_000;

/// Maximum size of a single stack element
pub const MAX_SCRIPT_ELEMENT_SIZE: usize = 520;

/// Maximum number of non-push operations per script
pub const MAX_SCRIPT_OPS: usize = 201;

/// Maximum combined size of stack and altstack
pub const MAX_STACK_SIZE: usize = 1000;

/// Maximum byte length of a numeric operand
pub const MAX_NUM_SIZE: usize = 4;

/// Maximum public keys in a CHECKMULTISIG
pub const MAX_PUBKEYS_PER_MULTISIG: usize = 20;
