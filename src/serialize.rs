//! Canonical serialization
//!
//! The byte layout here is the hashing domain for transaction ids, block
//! hashes, merkle roots and signature hashes, so it must stay byte-stable:
//! little-endian fixed-width integers and CompactSize length prefixes.
//!
//! Transaction: version (4) | input count | inputs | output count | outputs | lock time (4)
//! Input:       prevout hash (32) | prevout index (4) | script | sequence (4)
//! Output:      value (8) | script
//! Header:      version (4) | prev hash (32) | merkle root (32) | time (4) | bits (4) | nonce (4)
//! Block:       header | tx count | transactions | signature

use bitcoin_hashes::{sha256d as sha256d_hash, Hash as BitcoinHash, HashEngine};

use crate::error::{ConsensusError, Result};
use crate::types::*;

/// Largest length prefix accepted when decoding
pub const MAX_SIZE: u64 = 0x0200_0000;

/// sha256d over a byte string
pub fn sha256d(data: &[u8]) -> Hash {
    sha256d_hash::Hash::hash(data).into_inner()
}

/// sha256d over the concatenation of several byte strings
pub fn sha256d_concat(parts: &[&[u8]]) -> Hash {
    let mut engine = sha256d_hash::Hash::engine();
    for part in parts {
        engine.input(part);
    }
    sha256d_hash::Hash::from_engine(engine).into_inner()
}

/// Types with a canonical byte encoding
pub trait Encodable {
    fn consensus_encode(&self, out: &mut Vec<u8>);

    fn encoded_len(&self) -> usize {
        let mut buf = Vec::new();
        self.consensus_encode(&mut buf);
        buf.len()
    }
}

/// Types that can be parsed back from their canonical encoding
pub trait Decodable: Sized {
    fn consensus_decode(reader: &mut Reader<'_>) -> Result<Self>;
}

pub fn serialize<T: Encodable + ?Sized>(value: &T) -> Vec<u8> {
    let mut out = Vec::new();
    value.consensus_encode(&mut out);
    out
}

/// Decode a value that must occupy the whole buffer
pub fn deserialize<T: Decodable>(bytes: &[u8]) -> Result<T> {
    let mut reader = Reader::new(bytes);
    let value = T::consensus_decode(&mut reader)?;
    if !reader.is_empty() {
        return Err(ConsensusError::Serialization(format!(
            "{} trailing bytes",
            reader.remaining()
        )));
    }
    Ok(value)
}

/// Append a CompactSize integer
pub fn write_compact_size(out: &mut Vec<u8>, value: u64) {
    if value < 0xfd {
        out.push(value as u8);
    } else if value <= 0xffff {
        out.push(0xfd);
        out.extend_from_slice(&(value as u16).to_le_bytes());
    } else if value <= 0xffff_ffff {
        out.push(0xfe);
        out.extend_from_slice(&(value as u32).to_le_bytes());
    } else {
        out.push(0xff);
        out.extend_from_slice(&value.to_le_bytes());
    }
}

/// Append a length-prefixed byte string
pub fn write_var_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    write_compact_size(out, bytes.len() as u64);
    out.extend_from_slice(bytes);
}

/// Cursor over an input buffer
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(ConsensusError::Serialization(format!(
                "unexpected end of data: wanted {} bytes, {} left",
                n,
                self.remaining()
            )));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut buf = [0u8; N];
        buf.copy_from_slice(self.read_bytes(N)?);
        Ok(buf)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_array::<1>()?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.read_array()?))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.read_array()?))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.read_array()?))
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.read_array()?))
    }

    pub fn read_hash(&mut self) -> Result<Hash> {
        self.read_array()
    }

    /// Read a CompactSize, rejecting non-minimal encodings
    pub fn read_compact_size(&mut self) -> Result<u64> {
        let value = match self.read_u8()? {
            0xff => {
                let v = self.read_u64()?;
                if v <= 0xffff_ffff {
                    return Err(non_canonical());
                }
                v
            }
            0xfe => {
                let v = self.read_u32()? as u64;
                if v <= 0xffff {
                    return Err(non_canonical());
                }
                v
            }
            0xfd => {
                let v = self.read_u16()? as u64;
                if v < 0xfd {
                    return Err(non_canonical());
                }
                v
            }
            b => b as u64,
        };
        if value > MAX_SIZE {
            return Err(ConsensusError::Serialization(format!("size {} too large", value)));
        }
        Ok(value)
    }

    pub fn read_var_bytes(&mut self) -> Result<ByteString> {
        let len = self.read_compact_size()? as usize;
        Ok(self.read_bytes(len)?.to_vec())
    }

    /// Read a length-prefixed vector; capacity is bounded by the bytes left
    pub fn read_vec<T: Decodable>(&mut self) -> Result<Vec<T>> {
        let count = self.read_compact_size()? as usize;
        let mut items = Vec::with_capacity(count.min(self.remaining()));
        for _ in 0..count {
            items.push(T::consensus_decode(self)?);
        }
        Ok(items)
    }
}

fn non_canonical() -> ConsensusError {
    ConsensusError::Serialization("non-canonical compact size".to_string())
}

impl Encodable for OutPoint {
    fn consensus_encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.hash);
        out.extend_from_slice(&self.index.to_le_bytes());
    }
}

impl Decodable for OutPoint {
    fn consensus_decode(reader: &mut Reader<'_>) -> Result<Self> {
        Ok(OutPoint {
            hash: reader.read_hash()?,
            index: reader.read_u32()?,
        })
    }
}

impl Encodable for TransactionInput {
    fn consensus_encode(&self, out: &mut Vec<u8>) {
        self.prevout.consensus_encode(out);
        write_var_bytes(out, &self.script_sig);
        out.extend_from_slice(&self.sequence.to_le_bytes());
    }
}

impl Decodable for TransactionInput {
    fn consensus_decode(reader: &mut Reader<'_>) -> Result<Self> {
        Ok(TransactionInput {
            prevout: OutPoint::consensus_decode(reader)?,
            script_sig: reader.read_var_bytes()?,
            sequence: reader.read_u32()?,
        })
    }
}

impl Encodable for TransactionOutput {
    fn consensus_encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.value.to_le_bytes());
        write_var_bytes(out, &self.script_pubkey);
    }
}

impl Decodable for TransactionOutput {
    fn consensus_decode(reader: &mut Reader<'_>) -> Result<Self> {
        Ok(TransactionOutput {
            value: reader.read_i64()?,
            script_pubkey: reader.read_var_bytes()?,
        })
    }
}

impl Encodable for Transaction {
    fn consensus_encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.version.to_le_bytes());
        write_compact_size(out, self.inputs.len() as u64);
        for input in &self.inputs {
            input.consensus_encode(out);
        }
        write_compact_size(out, self.outputs.len() as u64);
        for output in &self.outputs {
            output.consensus_encode(out);
        }
        out.extend_from_slice(&self.lock_time.to_le_bytes());
    }
}

impl Decodable for Transaction {
    fn consensus_decode(reader: &mut Reader<'_>) -> Result<Self> {
        Ok(Transaction {
            version: reader.read_i32()?,
            inputs: reader.read_vec()?,
            outputs: reader.read_vec()?,
            lock_time: reader.read_u32()?,
        })
    }
}

impl Encodable for BlockHeader {
    fn consensus_encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.version.to_le_bytes());
        out.extend_from_slice(&self.prev_block_hash);
        out.extend_from_slice(&self.merkle_root);
        out.extend_from_slice(&self.timestamp.to_le_bytes());
        out.extend_from_slice(&self.bits.to_le_bytes());
        out.extend_from_slice(&self.nonce.to_le_bytes());
    }

    fn encoded_len(&self) -> usize {
        80
    }
}

impl Decodable for BlockHeader {
    fn consensus_decode(reader: &mut Reader<'_>) -> Result<Self> {
        Ok(BlockHeader {
            version: reader.read_i32()?,
            prev_block_hash: reader.read_hash()?,
            merkle_root: reader.read_hash()?,
            timestamp: reader.read_u32()?,
            bits: reader.read_u32()?,
            nonce: reader.read_u32()?,
        })
    }
}

impl Encodable for Block {
    fn consensus_encode(&self, out: &mut Vec<u8>) {
        self.header.consensus_encode(out);
        write_compact_size(out, self.transactions.len() as u64);
        for tx in &self.transactions {
            tx.consensus_encode(out);
        }
        write_var_bytes(out, &self.signature);
    }
}

impl Decodable for Block {
    fn consensus_decode(reader: &mut Reader<'_>) -> Result<Self> {
        Ok(Block {
            header: BlockHeader::consensus_decode(reader)?,
            transactions: reader.read_vec()?,
            signature: reader.read_var_bytes()?,
        })
    }
}
