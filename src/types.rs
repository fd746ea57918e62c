//! Core ledger types: transactions, blocks and the references between them

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::serialize::{self, Encodable};

/// Hash type: 256-bit double-SHA256 digest, internal (little-endian) byte order
pub type Hash = [u8; 32];

/// Byte string type
pub type ByteString = Vec<u8>;

/// The all-zero hash, used by null prevouts and the genesis parent
pub const NULL_HASH: Hash = [0u8; 32];

/// Render a hash in the conventional display order (byte-reversed hex)
pub fn hash_to_hex(hash: &Hash) -> String {
    let mut reversed = *hash;
    reversed.reverse();
    hex::encode(reversed)
}

/// Parse a display-order hex string back into an internal-order hash
pub fn hash_from_hex(s: &str) -> Option<Hash> {
    let bytes = hex::decode(s).ok()?;
    let mut hash: Hash = bytes.try_into().ok()?;
    hash.reverse();
    Some(hash)
}

/// First ten hex characters of a hash, as printed in log lines
pub fn short_hash(hash: &Hash) -> String {
    let mut s = hash_to_hex(hash);
    s.truncate(10);
    s
}

/// Reference to a prior transaction output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutPoint {
    pub hash: Hash,
    pub index: u32,
}

impl OutPoint {
    pub fn new(hash: Hash, index: u32) -> Self {
        Self { hash, index }
    }

    /// The prevout carried by a coinbase input
    pub fn null() -> Self {
        Self { hash: NULL_HASH, index: u32::MAX }
    }

    pub fn is_null(&self) -> bool {
        self.hash == NULL_HASH && self.index == u32::MAX
    }
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", short_hash(&self.hash), self.index)
    }
}

/// Transaction input: prior output reference, unlocking script, sequence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionInput {
    pub prevout: OutPoint,
    pub script_sig: ByteString,
    pub sequence: u32,
}

impl TransactionInput {
    pub fn new(prevout: OutPoint, script_sig: ByteString) -> Self {
        Self { prevout, script_sig, sequence: u32::MAX }
    }

    pub fn is_final(&self) -> bool {
        self.sequence == u32::MAX
    }
}

/// Transaction output: value and locking script
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionOutput {
    pub value: i64,
    pub script_pubkey: ByteString,
}

impl TransactionOutput {
    pub fn new(value: i64, script_pubkey: ByteString) -> Self {
        Self { value, script_pubkey }
    }

    /// Zero value, zero-length script: the marker output of coinstakes and
    /// proof-of-stake coinbases
    pub fn empty() -> Self {
        Self { value: 0, script_pubkey: Vec::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.value == 0 && self.script_pubkey.is_empty()
    }

    /// Output blanked by SIGHASH_SINGLE
    pub(crate) fn null() -> Self {
        Self { value: -1, script_pubkey: Vec::new() }
    }
}

/// Transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub version: i32,
    pub inputs: Vec<TransactionInput>,
    pub outputs: Vec<TransactionOutput>,
    pub lock_time: u32,
}

impl Transaction {
    pub const CURRENT_VERSION: i32 = 1;

    /// Transaction id: sha256d of the canonical serialization
    pub fn hash(&self) -> Hash {
        serialize::sha256d(&serialize::serialize(self))
    }

    pub fn serialized_size(&self) -> usize {
        self.encoded_len()
    }

    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].prevout.is_null()
    }

    /// Coinstake: spends a real output and marks itself with an empty first output
    pub fn is_coinstake(&self) -> bool {
        !self.inputs.is_empty()
            && !self.inputs[0].prevout.is_null()
            && self.outputs.len() >= 2
            && self.outputs[0].is_empty()
    }

    /// Sum of output values, `None` when it leaves the money range
    pub fn value_out(&self) -> Option<i64> {
        let mut total: i64 = 0;
        for output in &self.outputs {
            total = total.checked_add(output.value)?;
            if !crate::constants::money_range(output.value) || !crate::constants::money_range(total) {
                return None;
            }
        }
        Some(total)
    }

    /// Final with respect to the given height and block time
    pub fn is_final(&self, height: u32, block_time: u32) -> bool {
        if self.lock_time == 0 {
            return true;
        }
        let threshold = if self.lock_time < crate::constants::LOCKTIME_THRESHOLD {
            height
        } else {
            block_time
        };
        if self.lock_time < threshold {
            return true;
        }
        self.inputs.iter().all(TransactionInput::is_final)
    }
}

/// Block header; its hash is the block's identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub version: i32,
    pub prev_block_hash: Hash,
    pub merkle_root: Hash,
    pub timestamp: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    pub const CURRENT_VERSION: i32 = 1;

    pub fn hash(&self) -> Hash {
        serialize::sha256d(&serialize::serialize(self))
    }
}

/// Block: header, transactions and (for proof-of-stake) the staker's signature
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
    pub signature: ByteString,
}

impl Block {
    pub fn hash(&self) -> Hash {
        self.header.hash()
    }

    pub fn serialized_size(&self) -> usize {
        self.encoded_len()
    }

    pub fn is_proof_of_stake(&self) -> bool {
        self.transactions.len() > 1 && self.transactions[1].is_coinstake()
    }

    pub fn is_proof_of_work(&self) -> bool {
        !self.is_proof_of_stake()
    }

    /// Prevout staked by this block together with the block time, used to
    /// detect the same stake being presented twice
    pub fn proof_of_stake(&self) -> Option<(OutPoint, u32)> {
        if self.is_proof_of_stake() {
            Some((self.transactions[1].inputs[0].prevout, self.header.timestamp))
        } else {
            None
        }
    }
}

/// Position of a block in the append-only block store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockPos(pub u64);

/// Position of a confirmed transaction: its block and its index inside it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxPos {
    pub block: BlockPos,
    pub index: u32,
}

impl TxPos {
    /// Placeholder position for unconfirmed transactions during mempool checks
    pub const MEMPOOL: TxPos = TxPos { block: BlockPos(u64::MAX), index: u32::MAX };

    pub fn new(block: BlockPos, index: u32) -> Self {
        Self { block, index }
    }

    pub fn is_mempool(&self) -> bool {
        *self == Self::MEMPOOL
    }
}
