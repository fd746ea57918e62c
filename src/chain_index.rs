//! Block index: every known block header with its chain context
//!
//! Nodes live in an arena and refer to each other by `NodeId`. The best chain
//! is kept both as `next` links and as a height-indexed vector so that main
//! chain lookups by height are constant time.

use std::collections::HashMap;

use primitive_types::U256;

use crate::constants::MEDIAN_TIME_SPAN;
use crate::types::{BlockHeader, BlockPos, Hash, OutPoint};

/// Arena index of a block index node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

/// Chain context of one accepted block
#[derive(Debug, Clone)]
pub struct BlockIndexNode {
    pub hash: Hash,
    pub header: BlockHeader,
    pub height: u32,
    /// Cumulative trust up to and including this block
    pub chain_trust: U256,
    pub prev: Option<NodeId>,
    /// Successor on the best chain
    pub next: Option<NodeId>,
    pub in_main_chain: bool,
    pub pos: BlockPos,

    pub is_pos: bool,
    pub entropy_bit: bool,
    pub stake_modifier: u64,
    pub generated_modifier: bool,
    /// Kernel hash for proof-of-stake blocks, zero for proof-of-work
    pub hash_proof: Hash,
    pub modifier_checksum: u32,
    pub stake: Option<(OutPoint, u32)>,

    /// Value created by this block
    pub mint: i64,
    pub money_supply: i64,
}

impl BlockIndexNode {
    pub fn time(&self) -> u32 {
        self.header.timestamp
    }

    /// Flag word hashed into the stake modifier checksum
    pub fn flags(&self) -> u32 {
        let mut flags = 0;
        if self.is_pos {
            flags |= 1;
        }
        if self.entropy_bit {
            flags |= 2;
        }
        if self.generated_modifier {
            flags |= 4;
        }
        flags
    }
}

#[derive(Debug, Default)]
pub struct ChainIndex {
    nodes: Vec<BlockIndexNode>,
    by_hash: HashMap<Hash, NodeId>,
    by_pos: HashMap<BlockPos, NodeId>,
    main_chain: Vec<NodeId>,
}

impl ChainIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Add a node; the first node added becomes genesis and the tip
    pub fn insert(&mut self, node: BlockIndexNode) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.by_hash.insert(node.hash, id);
        self.by_pos.insert(node.pos, id);
        self.nodes.push(node);
        if self.main_chain.is_empty() {
            self.nodes[id.0].in_main_chain = true;
            self.main_chain.push(id);
        }
        id
    }

    pub fn lookup(&self, hash: &Hash) -> Option<NodeId> {
        self.by_hash.get(hash).copied()
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.by_hash.contains_key(hash)
    }

    pub fn lookup_pos(&self, pos: BlockPos) -> Option<NodeId> {
        self.by_pos.get(&pos).copied()
    }

    pub fn node(&self, id: NodeId) -> &BlockIndexNode {
        &self.nodes[id.0]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut BlockIndexNode {
        &mut self.nodes[id.0]
    }

    pub fn genesis(&self) -> Option<NodeId> {
        self.main_chain.first().copied()
    }

    pub fn best(&self) -> Option<NodeId> {
        self.main_chain.last().copied()
    }

    pub fn best_height(&self) -> Option<u32> {
        self.best().map(|id| self.node(id).height)
    }

    pub fn best_trust(&self) -> U256 {
        self.best().map(|id| self.node(id).chain_trust).unwrap_or_default()
    }

    /// Main chain block at `height`
    pub fn at_height(&self, height: u32) -> Option<NodeId> {
        self.main_chain.get(height as usize).copied()
    }

    /// Ancestor of `id` at `height` on its own branch
    pub fn ancestor(&self, id: NodeId, height: u32) -> Option<NodeId> {
        let node = self.node(id);
        if height > node.height {
            return None;
        }
        if node.in_main_chain {
            return self.at_height(height);
        }
        let mut cursor = id;
        while self.node(cursor).height > height {
            let current = self.node(cursor);
            if current.in_main_chain {
                return self.at_height(height);
            }
            cursor = current.prev?;
        }
        Some(cursor)
    }

    /// Last common block of two branches
    pub fn fork_point(&self, a: NodeId, b: NodeId) -> NodeId {
        let (mut a, mut b) = (a, b);
        while a != b {
            let (ha, hb) = (self.node(a).height, self.node(b).height);
            if ha >= hb {
                match self.node(a).prev {
                    Some(prev) => a = prev,
                    None => return a,
                }
            }
            if hb >= ha {
                match self.node(b).prev {
                    Some(prev) => b = prev,
                    None => return b,
                }
            }
        }
        a
    }

    /// Branch from the block after `fork` up to `tip`, oldest first
    pub fn branch(&self, fork: NodeId, tip: NodeId) -> Vec<NodeId> {
        let mut path = Vec::new();
        let mut cursor = Some(tip);
        while let Some(id) = cursor {
            if id == fork {
                break;
            }
            path.push(id);
            cursor = self.node(id).prev;
        }
        path.reverse();
        path
    }

    /// Make `tip` the end of the best chain, relinking main chain flags
    pub fn set_tip(&mut self, tip: NodeId) {
        let mut path = Vec::new();
        let mut cursor = Some(tip);
        while let Some(id) = cursor {
            let node = self.node(id);
            let on_main = node.in_main_chain
                && self.main_chain.get(node.height as usize) == Some(&id);
            if on_main {
                break;
            }
            path.push(id);
            cursor = node.prev;
        }
        path.reverse();

        let keep = match cursor {
            Some(fork) => self.node(fork).height as usize + 1,
            None => 0,
        };
        for id in self.main_chain.split_off(keep) {
            let node = &mut self.nodes[id.0];
            node.in_main_chain = false;
            node.next = None;
        }
        if let Some(fork) = cursor {
            self.nodes[fork.0].next = None;
        }

        for id in path {
            if let Some(&last) = self.main_chain.last() {
                self.nodes[last.0].next = Some(id);
            }
            self.nodes[id.0].in_main_chain = true;
            self.nodes[id.0].next = None;
            self.main_chain.push(id);
        }
    }

    /// Median of the timestamps of the last eleven blocks ending at `id`
    pub fn median_time_past(&self, id: NodeId) -> u32 {
        let mut times = Vec::with_capacity(MEDIAN_TIME_SPAN);
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            if times.len() == MEDIAN_TIME_SPAN {
                break;
            }
            let node = self.node(current);
            times.push(node.time());
            cursor = node.prev;
        }
        times.sort_unstable();
        times[times.len() / 2]
    }

    /// Block locator: dense for the last ten blocks, then exponentially sparse,
    /// always ending at genesis
    pub fn locator(&self, id: NodeId) -> Vec<Hash> {
        let mut hashes = Vec::new();
        let mut step = 1u32;
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            let node = self.node(current);
            hashes.push(node.hash);
            if node.height == 0 {
                return hashes;
            }
            if hashes.len() >= 10 {
                step *= 2;
            }
            let target = node.height.saturating_sub(step);
            cursor = self.ancestor(current, target);
        }
        hashes
    }

    /// First locator entry found in the main chain, or genesis
    pub fn find_fork_in_main(&self, locator: &[Hash]) -> Option<NodeId> {
        locator
            .iter()
            .filter_map(|hash| self.lookup(hash))
            .find(|id| self.node(*id).in_main_chain)
            .or_else(|| self.genesis())
    }
}
