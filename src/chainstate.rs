//! Chain state: the block index, the store behind it and block acceptance
//!
//! `accept_block` runs every contextual check a block needs before it is
//! stored and indexed, including the proof-of-stake kernel and the stake
//! modifier chain. Switching the best chain lives in `reorganization`.

use std::collections::HashSet;

use log::{debug, info};

use crate::block::{check_block, connect_block, merkle_root};
use crate::chain_index::{BlockIndexNode, ChainIndex, NodeId};
use crate::checkpoints::{CheckpointResult, Checkpoints};
use crate::config::ChainParams;
use crate::error::{ConsensusError, Result};
use crate::kernel;
use crate::pow::{block_trust, check_proof_of_work, next_target_required};
use crate::reorganization::ChainUpdate;
use crate::script::{push_data, verify_script_detailed, SCRIPT_VERIFY_P2SH};
use crate::storage::{ChainStore, UtxoView};
use crate::types::*;

const GENESIS_MESSAGE: &[u8] = b"Stake ledger genesis";

/// Genesis block for the given parameters
///
/// Built rather than hardcoded so that every network preset derives its own;
/// `ChainParams::genesis_hash` pins the expected result.
pub fn genesis_block(params: &ChainParams) -> Block {
    let coinbase = Transaction {
        version: Transaction::CURRENT_VERSION,
        inputs: vec![TransactionInput::new(OutPoint::null(), push_data(GENESIS_MESSAGE))],
        outputs: vec![TransactionOutput::empty()],
        lock_time: 0,
    };
    let transactions = vec![coinbase];
    Block {
        header: BlockHeader {
            version: BlockHeader::CURRENT_VERSION,
            prev_block_hash: NULL_HASH,
            merkle_root: merkle_root(&transactions),
            timestamp: params.genesis_time,
            bits: params.pow_limit_bits,
            nonce: params.genesis_nonce,
        },
        transactions,
        signature: Vec::new(),
    }
}

pub struct ChainState {
    pub(crate) params: ChainParams,
    pub(crate) checkpoints: Checkpoints,
    pub(crate) index: ChainIndex,
    pub(crate) store: Box<dyn ChainStore>,
    /// Every (prevout, time) already used as a stake by an indexed block
    pub(crate) stake_seen: HashSet<(OutPoint, u32)>,
}

impl ChainState {
    /// Open a chain state on an empty store and connect genesis
    pub fn new(params: ChainParams, store: Box<dyn ChainStore>) -> Result<Self> {
        if store.best_chain()?.is_some() {
            return Err(ConsensusError::Storage("store already holds a chain".to_string()));
        }
        let checkpoints = Checkpoints::from_params(&params);
        let mut state = Self {
            params,
            checkpoints,
            index: ChainIndex::new(),
            store,
            stake_seen: HashSet::new(),
        };
        state.init_genesis()?;
        Ok(state)
    }

    fn init_genesis(&mut self) -> Result<()> {
        let genesis = genesis_block(&self.params);
        let hash = genesis.hash();
        if let Some(expected) = self.params.genesis_hash.as_deref() {
            if hash_from_hex(expected) != Some(hash) {
                return Err(ConsensusError::violation(
                    format!("genesis hash mismatch: built {}", hash_to_hex(&hash)),
                    0,
                ));
            }
        }

        let (modifier, generated) = kernel::compute_next_stake_modifier(&self.index, None, &self.params)?;
        let entropy_bit = kernel::stake_entropy_bit(&hash);
        let mut node = BlockIndexNode {
            hash,
            header: genesis.header.clone(),
            height: 0,
            chain_trust: block_trust(genesis.header.bits, false, &self.params),
            prev: None,
            next: None,
            in_main_chain: false,
            pos: BlockPos(0),
            is_pos: false,
            entropy_bit,
            stake_modifier: modifier,
            generated_modifier: generated,
            hash_proof: NULL_HASH,
            modifier_checksum: 0,
            stake: None,
            mint: 0,
            money_supply: 0,
        };
        node.modifier_checksum = kernel::stake_modifier_checksum(None, node.flags(), &node.hash_proof, modifier);
        if self.checkpoints.check_modifier_checksum(0, node.modifier_checksum) == CheckpointResult::Mismatch {
            return Err(ConsensusError::violation("genesis rejected by stake modifier checkpoint", 0));
        }

        node.pos = self.store.append_block(&genesis)?;
        let id = self.index.insert(node);

        let mut view = UtxoView::new(self.store.as_ref());
        let totals = connect_block(&genesis, id, &self.index, &mut view, &self.params, &self.checkpoints)?;
        let batch = view.into_batch(Some(hash));
        self.store.write_batch(batch)?;

        let node = self.index.node_mut(id);
        node.mint = totals.mint;
        node.money_supply = totals.value_out - totals.value_in;
        info!("genesis {} connected", hash_to_hex(&hash));
        Ok(())
    }

    pub fn params(&self) -> &ChainParams {
        &self.params
    }

    pub fn checkpoints(&self) -> &Checkpoints {
        &self.checkpoints
    }

    pub fn index(&self) -> &ChainIndex {
        &self.index
    }

    pub fn store(&self) -> &dyn ChainStore {
        self.store.as_ref()
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.index.contains(hash)
    }

    pub fn best(&self) -> NodeId {
        // genesis is inserted by the constructor
        self.index.best().unwrap_or(NodeId(0))
    }

    pub fn best_hash(&self) -> Hash {
        self.index.node(self.best()).hash
    }

    pub fn best_height(&self) -> u32 {
        self.index.node(self.best()).height
    }

    pub fn best_node(&self) -> &BlockIndexNode {
        self.index.node(self.best())
    }

    pub fn locator(&self) -> Vec<Hash> {
        self.index.locator(self.best())
    }

    pub fn is_stake_seen(&self, stake: &(OutPoint, u32)) -> bool {
        self.stake_seen.contains(stake)
    }

    pub fn read_block(&self, hash: &Hash) -> Result<Option<Block>> {
        match self.index.lookup(hash) {
            Some(id) => Ok(Some(self.store.read_block(self.index.node(id).pos)?)),
            None => Ok(None),
        }
    }

    /// Whether a transaction is confirmed on the best chain
    pub fn has_transaction(&self, txid: &Hash) -> Result<bool> {
        Ok(self.store.read_tx_index(txid)?.is_some())
    }

    /// Context-free block checks against this chain's parameters
    pub fn check_block(&self, block: &Block, adjusted_time: i64) -> Result<()> {
        check_block(block, &self.params, adjusted_time)
    }

    /// AcceptHeader
    ///
    /// 1. Parent is indexed (otherwise the parent must be requested)
    /// 2. Timestamp within the allowed drift of adjusted time
    /// 3. Proof-of-work headers meet their own target
    /// 4. Target equals the required next target for the block's kind
    /// 5. Timestamp after the median time past
    /// 6. Checkpoint pin matches and no fork below the last checkpoint
    ///
    /// Returns the parent the header attaches to.
    pub fn accept_header(&self, header: &BlockHeader, proof_of_stake: bool, adjusted_time: i64) -> Result<NodeId> {
        let hash = header.hash();
        let prev = self
            .index
            .lookup(&header.prev_block_hash)
            .ok_or(ConsensusError::MissingParent(header.prev_block_hash))?;

        if header.timestamp as i64 > adjusted_time + self.params.max_clock_drift as i64 {
            return Err(ConsensusError::violation("block timestamp too far in the future", 0));
        }
        if !proof_of_stake {
            check_proof_of_work(&hash, header.bits, &self.params)?;
        }

        let height = self.index.node(prev).height + 1;
        let required = next_target_required(&self.index, Some(prev), proof_of_stake, &self.params);
        if header.bits != required {
            let kind = if proof_of_stake { "proof-of-stake" } else { "proof-of-work" };
            return Err(ConsensusError::violation(
                format!("incorrect {} target {:08x}, expected {:08x}", kind, header.bits, required),
                100,
            ));
        }
        if header.timestamp <= self.index.median_time_past(prev) {
            return Err(ConsensusError::violation("block's timestamp is too early", 0));
        }

        if self.checkpoints.check_hash(height, &hash) == CheckpointResult::Mismatch {
            return Err(ConsensusError::violation(format!("rejected by checkpoint at height {}", height), 100));
        }
        if !self.checkpoints.allows_fork_at(&self.index, height) {
            return Err(ConsensusError::violation(
                format!("forked chain older than last checkpoint (height {})", height),
                100,
            ));
        }
        Ok(prev)
    }

    /// AcceptBlock
    ///
    /// 1. Unknown block with a known parent
    /// 2. `check_block`, and a stake not already used by another block
    /// 3. `accept_header` for the target, timestamp and checkpoint rules
    /// 4. All transactions final at the block's height and time
    /// 5. Proof of stake: the kernel meets the target with the modifier
    ///    selected for its source block
    /// 6. Stake modifier and its checksum, checked against the pins
    /// 7. Store, index and, when it carries more trust than the tip, make it
    ///    the best chain
    ///
    /// Returns the best chain change, if any.
    pub fn accept_block(&mut self, block: &Block, adjusted_time: i64) -> Result<Option<ChainUpdate>> {
        let hash = block.hash();
        if self.index.contains(&hash) {
            return Err(ConsensusError::AlreadyKnown(hash));
        }
        if !self.index.contains(&block.header.prev_block_hash) {
            return Err(ConsensusError::MissingParent(block.header.prev_block_hash));
        }

        check_block(block, &self.params, adjusted_time)?;

        let stake = block.proof_of_stake();
        if let Some(stake) = &stake {
            if self.stake_seen.contains(stake) {
                return Err(ConsensusError::violation(
                    format!("duplicate proof-of-stake ({}, {})", stake.0, stake.1),
                    100,
                ));
            }
        }
        let proof_of_stake = stake.is_some();

        let prev = self.accept_header(&block.header, proof_of_stake, adjusted_time)?;
        let height = self.index.node(prev).height + 1;
        if !block.transactions.iter().all(|tx| tx.is_final(height, block.header.timestamp)) {
            return Err(ConsensusError::violation("contains a non-final transaction", 10));
        }

        let hash_proof = match &stake {
            Some((prevout, tx_time)) => self.check_proof_of_stake(block, prev, prevout, *tx_time)?,
            None => NULL_HASH,
        };

        let (modifier, generated) = kernel::compute_next_stake_modifier(&self.index, Some(prev), &self.params)?;
        let prev_node = self.index.node(prev);
        let mut node = BlockIndexNode {
            hash,
            header: block.header.clone(),
            height,
            chain_trust: prev_node.chain_trust + block_trust(block.header.bits, proof_of_stake, &self.params),
            prev: Some(prev),
            next: None,
            in_main_chain: false,
            pos: BlockPos(0),
            is_pos: proof_of_stake,
            entropy_bit: kernel::stake_entropy_bit(&hash),
            stake_modifier: modifier,
            generated_modifier: generated,
            hash_proof,
            modifier_checksum: 0,
            stake,
            mint: 0,
            money_supply: 0,
        };
        node.modifier_checksum = kernel::stake_modifier_checksum(
            Some(prev_node.modifier_checksum),
            node.flags(),
            &node.hash_proof,
            modifier,
        );
        if self.checkpoints.check_modifier_checksum(height, node.modifier_checksum) == CheckpointResult::Mismatch {
            return Err(ConsensusError::violation(
                format!("rejected by stake modifier checkpoint at height {}, modifier {:016x}", height, modifier),
                100,
            ));
        }

        node.pos = self.store.append_block(block)?;
        let trust = node.chain_trust;
        let id = self.index.insert(node);
        if let Some(stake) = stake {
            self.stake_seen.insert(stake);
        }
        debug!("accepted block {} at height {}", short_hash(&hash), height);

        if trust > self.index.best_trust() {
            return self.set_best_chain(id).map(Some);
        }
        Ok(None)
    }

    /// CheckProofOfStake
    ///
    /// Locate the staked output through the transaction index, check the
    /// coinstake's first input against it and the kernel against the target.
    /// Returns the kernel hash.
    fn check_proof_of_stake(&self, block: &Block, prev: NodeId, prevout: &OutPoint, tx_time: u32) -> Result<Hash> {
        let tx_index = self.store.read_tx_index(&prevout.hash)?.ok_or_else(|| {
            ConsensusError::MissingStakeData(format!("stake source {} not found", short_hash(&prevout.hash)))
        })?;
        let source_tx = self.store.read_transaction(tx_index.pos)?;
        let from = self.index.lookup_pos(tx_index.pos.block).ok_or_else(|| {
            ConsensusError::Storage(format!("block of stake source {} not indexed", short_hash(&prevout.hash)))
        })?;
        let output = source_tx
            .outputs
            .get(prevout.index as usize)
            .ok_or_else(|| ConsensusError::violation(format!("{} stake index out of range", prevout), 100))?;

        let coinstake = &block.transactions[1];
        if let Err(err) =
            verify_script_detailed(&coinstake.inputs[0].script_sig, &output.script_pubkey, coinstake, 0, SCRIPT_VERIFY_P2SH)
        {
            return Err(ConsensusError::violation(format!("coinstake signature failed: {}", err), 100));
        }

        let modifier = kernel::kernel_stake_modifier(&self.index, from, prev, &self.params)?;
        let from_time = self.index.node(from).time();
        kernel::check_stake_kernel_hash(
            block.header.bits,
            modifier,
            from_time,
            output.value,
            prevout,
            tx_time,
            &self.params,
        )
    }
}
