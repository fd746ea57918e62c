//! Checkpoints
//!
//! Two kinds of pins:
//! - block hash at a height: the chain is locked in up to the last one
//! - stake modifier checksum at a height: guards the modifier chain against
//!   divergence between nodes

use std::collections::BTreeMap;

use crate::chain_index::{ChainIndex, NodeId};
use crate::config::ChainParams;
use crate::types::{hash_from_hex, Hash};

/// Result of checking a block against the pins
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointResult {
    Match,
    Mismatch,
    NoCheckpoint,
}

impl CheckpointResult {
    pub fn is_valid(&self) -> bool {
        matches!(self, CheckpointResult::Match | CheckpointResult::NoCheckpoint)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Checkpoints {
    hashes: BTreeMap<u32, Hash>,
    modifier_checksums: BTreeMap<u32, u32>,
}

impl Checkpoints {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pins from the chain parameters; malformed hashes are skipped (they are
    /// rejected by `ChainParams::validate`)
    pub fn from_params(params: &ChainParams) -> Self {
        let mut checkpoints = Self::new();
        for checkpoint in &params.checkpoints {
            if let Some(hash) = hash_from_hex(&checkpoint.hash) {
                checkpoints.add(checkpoint.height, hash);
            }
        }
        for pin in &params.stake_modifier_checkpoints {
            checkpoints.add_modifier_checksum(pin.height, pin.checksum);
        }
        checkpoints
    }

    pub fn add(&mut self, height: u32, hash: Hash) {
        self.hashes.insert(height, hash);
    }

    pub fn add_modifier_checksum(&mut self, height: u32, checksum: u32) {
        self.modifier_checksums.insert(height, checksum);
    }

    pub fn check_hash(&self, height: u32, hash: &Hash) -> CheckpointResult {
        match self.hashes.get(&height) {
            Some(pinned) if pinned == hash => CheckpointResult::Match,
            Some(_) => CheckpointResult::Mismatch,
            None => CheckpointResult::NoCheckpoint,
        }
    }

    pub fn check_modifier_checksum(&self, height: u32, checksum: u32) -> CheckpointResult {
        match self.modifier_checksums.get(&height) {
            Some(pinned) if *pinned == checksum => CheckpointResult::Match,
            Some(_) => CheckpointResult::Mismatch,
            None => CheckpointResult::NoCheckpoint,
        }
    }

    /// Height of the highest hash pin
    pub fn total_blocks_estimate(&self) -> u32 {
        self.hashes.keys().next_back().copied().unwrap_or(0)
    }

    /// Highest pinned block present in the index
    pub fn last_checkpoint(&self, index: &ChainIndex) -> Option<NodeId> {
        self.hashes.values().rev().find_map(|hash| index.lookup(hash))
    }

    /// A block at `height` may not fork the main chain below the last
    /// checkpoint already reached
    pub fn allows_fork_at(&self, index: &ChainIndex, height: u32) -> bool {
        match self.last_checkpoint(index) {
            Some(id) => height > index.node(id).height,
            None => true,
        }
    }
}
