//! Storage collaborator contract
//!
//! The ledger core needs an append-only block store, a transaction index with
//! per-output spentness, and the best-chain pointer, all updated through one
//! atomic batch. [`ChainStore`] is that contract; [`MemoryStore`] implements it
//! in memory for tests and embedding. [`UtxoView`] layers pending index
//! changes over a store so that a block, or a whole reorganization, can be
//! validated before anything is committed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::{ConsensusError, Result};
use crate::serialize;
use crate::types::*;

/// Transaction index record: where a confirmed transaction lives and which
/// transaction spent each of its outputs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxIndex {
    pub pos: TxPos,
    pub spent: Vec<Option<TxPos>>,
}

impl TxIndex {
    pub fn new(pos: TxPos, outputs: usize) -> Self {
        Self { pos, spent: vec![None; outputs] }
    }

    pub fn is_spent(&self, output: u32) -> bool {
        matches!(self.spent.get(output as usize), Some(Some(_)))
    }
}

/// Changes committed together
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBatch {
    /// `None` erases the record
    pub tx_index: Vec<(Hash, Option<TxIndex>)>,
    pub best_chain: Option<Hash>,
}

impl WriteBatch {
    pub fn is_empty(&self) -> bool {
        self.tx_index.is_empty() && self.best_chain.is_none()
    }
}

pub trait ChainStore: Send {
    fn read_block(&self, pos: BlockPos) -> Result<Block>;

    /// Store a block and return its position
    fn append_block(&mut self, block: &Block) -> Result<BlockPos>;

    fn read_tx_index(&self, txid: &Hash) -> Result<Option<TxIndex>>;

    /// Spentness of one output: `None` if the transaction is unknown or the
    /// output out of range, `Some(None)` if unspent, `Some(Some(pos))` if spent
    fn output_state(&self, outpoint: &OutPoint) -> Result<Option<Option<TxPos>>> {
        Ok(self
            .read_tx_index(&outpoint.hash)?
            .and_then(|index| index.spent.get(outpoint.index as usize).copied()))
    }

    /// Apply every change in the batch or none of them
    fn write_batch(&mut self, batch: WriteBatch) -> Result<()>;

    fn best_chain(&self) -> Result<Option<Hash>>;

    fn read_transaction(&self, pos: TxPos) -> Result<Transaction> {
        let block = self.read_block(pos.block)?;
        block
            .transactions
            .into_iter()
            .nth(pos.index as usize)
            .ok_or_else(|| ConsensusError::Storage(format!("no transaction {} in block {}", pos.index, pos.block.0)))
    }
}

/// In-memory store; blocks are kept serialized
#[derive(Debug, Default)]
pub struct MemoryStore {
    blocks: Vec<Vec<u8>>,
    tx_index: HashMap<Hash, TxIndex>,
    best: Option<Hash>,
    fail_writes: Arc<AtomicBool>,
    batches_written: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following `write_batch` fail without applying anything
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Handle on the write failure flag that stays usable after the store
    /// has been moved into a chain state
    pub fn write_failure_switch(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.fail_writes)
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn tx_index_len(&self) -> usize {
        self.tx_index.len()
    }

    pub fn batches_written(&self) -> usize {
        self.batches_written
    }
}

impl ChainStore for MemoryStore {
    fn read_block(&self, pos: BlockPos) -> Result<Block> {
        let bytes = self
            .blocks
            .get(pos.0 as usize)
            .ok_or_else(|| ConsensusError::Storage(format!("no block at position {}", pos.0)))?;
        serialize::deserialize(bytes)
    }

    fn append_block(&mut self, block: &Block) -> Result<BlockPos> {
        let pos = BlockPos(self.blocks.len() as u64);
        self.blocks.push(serialize::serialize(block));
        Ok(pos)
    }

    fn read_tx_index(&self, txid: &Hash) -> Result<Option<TxIndex>> {
        Ok(self.tx_index.get(txid).cloned())
    }

    fn write_batch(&mut self, batch: WriteBatch) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(ConsensusError::Storage("write_batch failed".to_string()));
        }
        debug!("write batch: {} tx index changes", batch.tx_index.len());
        for (txid, record) in batch.tx_index {
            match record {
                Some(record) => {
                    self.tx_index.insert(txid, record);
                }
                None => {
                    self.tx_index.remove(&txid);
                }
            }
        }
        if let Some(best) = batch.best_chain {
            self.best = Some(best);
        }
        self.batches_written += 1;
        Ok(())
    }

    fn best_chain(&self) -> Result<Option<Hash>> {
        Ok(self.best)
    }
}

/// Pending transaction index changes over a store
pub struct UtxoView<'a> {
    store: &'a dyn ChainStore,
    changes: HashMap<Hash, Option<TxIndex>>,
    order: Vec<Hash>,
}

impl<'a> UtxoView<'a> {
    pub fn new(store: &'a dyn ChainStore) -> Self {
        Self { store, changes: HashMap::new(), order: Vec::new() }
    }

    pub fn store(&self) -> &'a dyn ChainStore {
        self.store
    }

    pub fn get(&self, txid: &Hash) -> Result<Option<TxIndex>> {
        match self.changes.get(txid) {
            Some(change) => Ok(change.clone()),
            None => self.store.read_tx_index(txid),
        }
    }

    pub fn contains(&self, txid: &Hash) -> Result<bool> {
        Ok(self.get(txid)?.is_some())
    }

    fn record(&mut self, txid: Hash, change: Option<TxIndex>) {
        if self.changes.insert(txid, change).is_none() {
            self.order.push(txid);
        }
    }

    pub fn put(&mut self, txid: Hash, index: TxIndex) {
        self.record(txid, Some(index));
    }

    pub fn erase(&mut self, txid: Hash) {
        self.record(txid, None);
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Turn the pending changes into a batch, in first-touched order
    pub fn into_batch(mut self, best_chain: Option<Hash>) -> WriteBatch {
        let tx_index = self
            .order
            .iter()
            .filter_map(|txid| self.changes.remove(txid).map(|change| (*txid, change)))
            .collect();
        WriteBatch { tx_index, best_chain }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(nonce: u32) -> Block {
        Block {
            header: BlockHeader {
                version: 1,
                prev_block_hash: NULL_HASH,
                merkle_root: NULL_HASH,
                timestamp: 1,
                bits: 0x207fffff,
                nonce,
            },
            transactions: vec![Transaction {
                version: 1,
                inputs: vec![TransactionInput::new(OutPoint::null(), vec![1, 2])],
                outputs: vec![TransactionOutput::new(5, vec![0x51])],
                lock_time: 0,
            }],
            signature: Vec::new(),
        }
    }

    #[test]
    fn test_append_and_read() {
        let mut store = MemoryStore::new();
        let a = store.append_block(&block(1)).unwrap();
        let b = store.append_block(&block(2)).unwrap();
        assert_ne!(a, b);
        assert_eq!(store.read_block(b).unwrap(), block(2));
        assert!(store.read_block(BlockPos(9)).is_err());
        let tx = store.read_transaction(TxPos::new(a, 0)).unwrap();
        assert_eq!(tx, block(1).transactions[0]);
        assert!(store.read_transaction(TxPos::new(a, 1)).is_err());
    }

    #[test]
    fn test_output_state() {
        let mut store = MemoryStore::new();
        let txid = [4; 32];
        let mut index = TxIndex::new(TxPos::new(BlockPos(0), 0), 2);
        index.spent[1] = Some(TxPos::new(BlockPos(1), 3));
        store
            .write_batch(WriteBatch { tx_index: vec![(txid, Some(index))], best_chain: None })
            .unwrap();
        assert_eq!(store.output_state(&OutPoint::new(txid, 0)).unwrap(), Some(None));
        assert!(matches!(store.output_state(&OutPoint::new(txid, 1)).unwrap(), Some(Some(_))));
        assert_eq!(store.output_state(&OutPoint::new(txid, 2)).unwrap(), None);
        assert_eq!(store.output_state(&OutPoint::new([5; 32], 0)).unwrap(), None);
    }

    #[test]
    fn test_failed_batch_applies_nothing() {
        let mut store = MemoryStore::new();
        let switch = store.write_failure_switch();
        switch.store(true, Ordering::SeqCst);
        let batch = WriteBatch {
            tx_index: vec![([1; 32], Some(TxIndex::new(TxPos::MEMPOOL, 1)))],
            best_chain: Some([2; 32]),
        };
        assert!(store.write_batch(batch).is_err());
        assert_eq!(store.tx_index_len(), 0);
        assert_eq!(store.best_chain().unwrap(), None);

        store.set_fail_writes(false);
        assert!(store.write_batch(WriteBatch::default()).is_ok());
    }

    #[test]
    fn test_view_overlays_store() {
        let mut store = MemoryStore::new();
        let kept = TxIndex::new(TxPos::new(BlockPos(0), 0), 1);
        store
            .write_batch(WriteBatch {
                tx_index: vec![([1; 32], Some(kept.clone())), ([2; 32], Some(kept.clone()))],
                best_chain: None,
            })
            .unwrap();

        let mut view = UtxoView::new(&store);
        view.erase([1; 32]);
        view.put([3; 32], kept.clone());
        assert!(!view.contains(&[1; 32]).unwrap());
        assert!(view.contains(&[2; 32]).unwrap());
        assert!(view.contains(&[3; 32]).unwrap());

        let batch = view.into_batch(Some([9; 32]));
        assert_eq!(batch.tx_index.len(), 2);
        assert_eq!(batch.tx_index[0], ([1; 32], None));
        store.write_batch(batch).unwrap();
        assert_eq!(store.read_tx_index(&[1; 32]).unwrap(), None);
        assert_eq!(store.best_chain().unwrap(), Some([9; 32]));
    }
}
