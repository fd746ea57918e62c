//! Best chain switching
//!
//! A reorganization disconnects the old branch tip-first and connects the new
//! branch oldest-first on a single `UtxoView`. The resulting batch is written
//! atomically together with the new best-chain pointer; only after the write
//! succeeds does the in-memory index move its tip. Any failure on the way
//! leaves store and index exactly as they were.

use log::{info, warn};

use crate::block::{connect_block, disconnect_block, ConnectedBlock};
use crate::chain_index::NodeId;
use crate::chainstate::ChainState;
use crate::error::Result;
use crate::storage::UtxoView;
use crate::types::*;

/// Effect of a best chain switch, for the pool and the wallets
#[derive(Debug, Clone, Default)]
pub struct ChainUpdate {
    pub new_tip: Hash,
    pub height: u32,
    /// Blocks removed from the old best chain
    pub disconnected: usize,
    /// Blocks now on the best chain, oldest first
    pub connected: Vec<Block>,
    /// Ordinary transactions of disconnected blocks in chain order, to be
    /// offered back to the pool
    pub resurrected: Vec<Transaction>,
    /// Coinstakes of disconnected blocks; they can never confirm elsewhere
    pub conflicted: Vec<Hash>,
    /// Locator of the new tip
    pub locator: Vec<Hash>,
}

impl ChainUpdate {
    pub fn is_reorganization(&self) -> bool {
        self.disconnected > 0
    }
}

impl ChainState {
    /// SetBestChain
    ///
    /// Make `new_tip` the best chain:
    /// 1. Find the fork between the current tip and `new_tip`
    /// 2. Disconnect the old branch, newest first
    /// 3. Connect the new branch, oldest first
    /// 4. Commit one batch including the best-chain pointer
    /// 5. Move the index tip and record mint and money supply
    pub fn set_best_chain(&mut self, new_tip: NodeId) -> Result<ChainUpdate> {
        let old_tip = self.best();
        let fork = self.index.fork_point(old_tip, new_tip);
        let mut disconnect = self.index.branch(fork, old_tip);
        disconnect.reverse();
        let connect = self.index.branch(fork, new_tip);

        if !disconnect.is_empty() {
            info!(
                "reorganize: disconnect {} blocks back to {}, connect {} blocks",
                disconnect.len(),
                short_hash(&self.index.node(fork).hash),
                connect.len()
            );
        }

        let mut update = ChainUpdate { disconnected: disconnect.len(), ..ChainUpdate::default() };
        let mut totals: Vec<(NodeId, ConnectedBlock)> = Vec::with_capacity(connect.len());
        let mut view = UtxoView::new(self.store.as_ref());

        // replayed oldest block first: parents precede their children
        let mut resurrected: Vec<Vec<Transaction>> = Vec::with_capacity(disconnect.len());
        for &id in &disconnect {
            let block = self.store.read_block(self.index.node(id).pos)?;
            disconnect_block(&block, id, &self.index, &mut view)?;
            let mut pending = Vec::new();
            for tx in block.transactions {
                if tx.is_coinstake() {
                    update.conflicted.push(tx.hash());
                } else if !tx.is_coinbase() {
                    pending.push(tx);
                }
            }
            resurrected.push(pending);
        }
        update.resurrected = resurrected.into_iter().rev().flatten().collect();

        for &id in &connect {
            let block = self.store.read_block(self.index.node(id).pos)?;
            match connect_block(&block, id, &self.index, &mut view, &self.params, &self.checkpoints) {
                Ok(connected) => totals.push((id, connected)),
                Err(err) => {
                    warn!("connect of {} failed: {}", short_hash(&self.index.node(id).hash), err);
                    return Err(err);
                }
            }
            update.connected.push(block);
        }

        let tip_hash = self.index.node(new_tip).hash;
        let batch = view.into_batch(Some(tip_hash));
        if let Err(err) = self.store.write_batch(batch) {
            warn!("failed to commit best chain {}: {}", short_hash(&tip_hash), err);
            return Err(err);
        }

        self.index.set_tip(new_tip);
        for (id, connected) in totals {
            let prev_supply = self
                .index
                .node(id)
                .prev
                .map(|prev| self.index.node(prev).money_supply)
                .unwrap_or(0);
            let node = self.index.node_mut(id);
            node.mint = connected.mint;
            node.money_supply = prev_supply + connected.value_out - connected.value_in;
        }

        let tip = self.index.node(new_tip);
        info!(
            "new best chain {} height {} trust {}",
            short_hash(&tip.hash),
            tip.height,
            tip.chain_trust
        );
        update.new_tip = tip.hash;
        update.height = tip.height;
        update.locator = self.index.locator(new_tip);
        Ok(update)
    }
}
