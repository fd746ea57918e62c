//! Ledger node: the context object tying chain state, pool, orphans, wallets
//! and misbehavior accounting together
//!
//! Each part sits behind its own lock. Locks are always taken in the order
//! chain → mempool → orphans → wallets → misbehavior, and every operation
//! runs to completion before returning.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::chainstate::ChainState;
use crate::config::ChainParams;
use crate::constants::{MAX_BLOCK_SIZE, MAX_ORPHAN_TX_SIZE};
use crate::dos::{MisbehaviorTracker, PeerId};
use crate::error::{ConsensusError, Result};
use crate::mempool::Mempool;
use crate::orphan::OrphanBuffer;
use crate::reorganization::ChainUpdate;
use crate::storage::ChainStore;
use crate::types::*;
use crate::wallet::{WalletListener, WalletRegistry};

/// Source of network-adjusted time, in seconds since the epoch
pub trait Clock: Send + Sync {
    fn now(&self) -> i64;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs() as i64)
            .unwrap_or(0)
    }
}

/// Clock that only moves when told to
#[derive(Debug, Default)]
pub struct ManualClock {
    time: AtomicI64,
}

impl ManualClock {
    pub fn new(time: i64) -> Self {
        Self { time: AtomicI64::new(time) }
    }

    pub fn set(&self, time: i64) {
        self.time.store(time, Ordering::SeqCst);
    }

    pub fn advance(&self, seconds: i64) {
        self.time.fetch_add(seconds, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> i64 {
        self.time.load(Ordering::SeqCst)
    }
}

/// What became of an item received from a peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    Accepted,
    /// Stored until `request`, a missing parent, arrives
    Orphan { request: Hash },
    AlreadyKnown,
    Rejected { dos: u32, reason: String },
}

impl ProcessOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, ProcessOutcome::Accepted)
    }
}

struct Orphans {
    transactions: OrphanBuffer<Transaction>,
    blocks: OrphanBuffer<Block>,
    /// Stakes claimed by orphan blocks
    block_stakes: HashMap<(OutPoint, u32), Hash>,
}

impl Orphans {
    fn remove_block(&mut self, hash: &Hash) -> Option<Block> {
        let block = self.blocks.remove(hash)?;
        if let Some(stake) = block.proof_of_stake() {
            self.block_stakes.remove(&stake);
        }
        Some(block)
    }

    /// Missing block at the bottom of the orphan chain above `parent`
    fn root_request(&self, parent: &Hash) -> Hash {
        let mut cursor = *parent;
        while let Some([next, ..]) = self.blocks.parents(&cursor) {
            cursor = *next;
        }
        cursor
    }
}

pub struct LedgerNode {
    chain: Mutex<ChainState>,
    mempool: Mutex<Mempool>,
    orphans: Mutex<Orphans>,
    wallets: Mutex<WalletRegistry>,
    misbehavior: Mutex<MisbehaviorTracker>,
    clock: Arc<dyn Clock>,
}

impl LedgerNode {
    pub fn new(params: ChainParams, store: Box<dyn ChainStore>, clock: Arc<dyn Clock>) -> Result<Self> {
        let orphans = Orphans {
            transactions: OrphanBuffer::new(params.max_orphan_transactions, MAX_ORPHAN_TX_SIZE, params.orphan_seed),
            blocks: OrphanBuffer::new(params.max_orphan_blocks, MAX_BLOCK_SIZE, params.orphan_seed.rotate_left(32)),
            block_stakes: HashMap::new(),
        };
        let misbehavior = MisbehaviorTracker::new(params.ban_threshold);
        let chain = ChainState::new(params, store)?;
        Ok(Self {
            chain: Mutex::new(chain),
            mempool: Mutex::new(Mempool::new()),
            orphans: Mutex::new(orphans),
            wallets: Mutex::new(WalletRegistry::new()),
            misbehavior: Mutex::new(misbehavior),
            clock,
        })
    }

    pub fn register_wallet(&self, wallet: Arc<dyn WalletListener>) {
        self.wallets.lock().register(wallet);
    }

    pub fn unregister_wallet(&self, wallet: &Arc<dyn WalletListener>) -> bool {
        self.wallets.lock().unregister(wallet)
    }

    /// ProcessBlock
    ///
    /// 1. Drop blocks already indexed or already waiting as orphans, and
    ///    stakes already claimed
    /// 2. Context-free checks
    /// 3. Unknown parent: keep as orphan and ask for the chain's root
    /// 4. Otherwise accept, then connect any orphans that were waiting on it
    pub fn process_block(&self, peer: PeerId, block: &Block) -> ProcessOutcome {
        let hash = block.hash();
        let mut chain = self.chain.lock();
        let mut mempool = self.mempool.lock();
        let mut orphans = self.orphans.lock();

        if chain.contains(&hash) || orphans.blocks.contains(&hash) {
            return ProcessOutcome::AlreadyKnown;
        }
        if let Some(stake) = block.proof_of_stake() {
            if chain.is_stake_seen(&stake) || orphans.block_stakes.contains_key(&stake) {
                return ProcessOutcome::Rejected {
                    dos: 0,
                    reason: format!("duplicate proof-of-stake ({}, {}) for block {}", stake.0, stake.1, short_hash(&hash)),
                };
            }
        }

        let now = self.clock.now();
        if let Err(err) = chain.check_block(block, now) {
            return self.reject(peer, err);
        }

        if !chain.contains(&block.header.prev_block_hash) {
            let parents = vec![block.header.prev_block_hash];
            match orphans.blocks.insert(hash, block.clone(), parents, block.serialized_size()) {
                Ok(evicted) => {
                    for (_, evicted_block) in evicted {
                        if let Some(stake) = evicted_block.proof_of_stake() {
                            orphans.block_stakes.remove(&stake);
                        }
                    }
                }
                Err(err) => return self.reject(peer, err),
            }
            // the new block itself may have been the one evicted
            if let Some(stake) = block.proof_of_stake() {
                if orphans.blocks.contains(&hash) {
                    orphans.block_stakes.insert(stake, hash);
                }
            }
            let request = orphans.root_request(&block.header.prev_block_hash);
            info!("orphan block {} stored, requesting {}", short_hash(&hash), short_hash(&request));
            return ProcessOutcome::Orphan { request };
        }

        match chain.accept_block(block, now) {
            Ok(update) => {
                if let Some(update) = update {
                    self.apply_chain_update(&chain, &mut mempool, &update, now);
                }
            }
            Err(ConsensusError::AlreadyKnown(_)) => return ProcessOutcome::AlreadyKnown,
            Err(err) => return self.reject(peer, err),
        }

        let mut queue = VecDeque::from([hash]);
        while let Some(parent) = queue.pop_front() {
            for child in orphans.blocks.children(&parent) {
                let Some(orphan) = orphans.remove_block(&child) else {
                    continue;
                };
                match chain.accept_block(&orphan, now) {
                    Ok(update) => {
                        debug!("connected orphan block {}", short_hash(&child));
                        if let Some(update) = update {
                            self.apply_chain_update(&chain, &mut mempool, &update, now);
                        }
                        queue.push_back(child);
                    }
                    Err(err) => warn!("orphan block {} rejected: {}", short_hash(&child), err),
                }
            }
        }
        ProcessOutcome::Accepted
    }

    /// Move the pool and the wallets along with a best chain change
    fn apply_chain_update(&self, chain: &ChainState, mempool: &mut Mempool, update: &ChainUpdate, now: i64) {
        for tx in &update.resurrected {
            if let Err(err) = mempool.accept(chain, tx, now) {
                debug!("not resurrecting {}: {}", short_hash(&tx.hash()), err);
            }
        }

        let mut conflicted = Vec::new();
        for block in &update.connected {
            conflicted.extend(mempool.remove_for_block(block).iter().map(Transaction::hash));
        }

        let wallets = self.wallets.lock();
        for block in &update.connected {
            for tx in &block.transactions {
                wallets.sync_transaction(tx, Some(block));
            }
        }
        for txid in conflicted.iter().chain(&update.conflicted) {
            wallets.transaction_conflicted(txid);
        }
        wallets.set_best_chain(&update.locator);
    }

    /// ProcessTransaction
    ///
    /// Accept into the pool; a transaction with unknown inputs waits as an
    /// orphan. Every accepted transaction releases the orphans spending it.
    pub fn process_transaction(&self, peer: PeerId, tx: &Transaction) -> ProcessOutcome {
        let hash = tx.hash();
        let chain = self.chain.lock();
        let mut mempool = self.mempool.lock();
        let mut orphans = self.orphans.lock();

        if mempool.exists(&hash) || orphans.transactions.contains(&hash) {
            return ProcessOutcome::AlreadyKnown;
        }

        let now = self.clock.now();
        match mempool.accept(&chain, tx, now) {
            Ok(_) => {}
            Err(ConsensusError::MissingInputs) => {
                let mut missing: Vec<Hash> = Vec::new();
                for input in &tx.inputs {
                    let parent = input.prevout.hash;
                    if missing.contains(&parent) || mempool.exists(&parent) {
                        continue;
                    }
                    if !matches!(chain.has_transaction(&parent), Ok(true)) {
                        missing.push(parent);
                    }
                }
                let request = missing.first().copied().unwrap_or(NULL_HASH);
                return match orphans.transactions.insert(hash, tx.clone(), missing, tx.serialized_size()) {
                    Ok(evicted) => {
                        if !evicted.is_empty() {
                            info!("orphan transaction overflow, {} evicted", evicted.len());
                        }
                        debug!("stored orphan tx {}", short_hash(&hash));
                        ProcessOutcome::Orphan { request }
                    }
                    Err(err) => self.reject(peer, err),
                };
            }
            Err(ConsensusError::AlreadyKnown(_)) => return ProcessOutcome::AlreadyKnown,
            Err(err) => return self.reject(peer, err),
        }

        let wallets = self.wallets.lock();
        wallets.sync_transaction(tx, None);

        let mut queue = VecDeque::from([hash]);
        while let Some(parent) = queue.pop_front() {
            for child in orphans.transactions.children(&parent) {
                let Some(orphan) = orphans.transactions.get(&child).cloned() else {
                    continue;
                };
                match mempool.accept(&chain, &orphan, now) {
                    Ok(_) => {
                        debug!("accepted orphan tx {}", short_hash(&child));
                        orphans.transactions.remove(&child);
                        wallets.sync_transaction(&orphan, None);
                        queue.push_back(child);
                    }
                    // still waiting on another parent
                    Err(ConsensusError::MissingInputs) => {}
                    Err(err) => {
                        debug!("dropping orphan tx {}: {}", short_hash(&child), err);
                        orphans.transactions.remove(&child);
                    }
                }
            }
        }
        ProcessOutcome::Accepted
    }

    fn reject(&self, peer: PeerId, err: ConsensusError) -> ProcessOutcome {
        let dos = err.dos_score();
        if dos > 0 {
            self.misbehavior.lock().misbehaving(peer, dos);
        }
        debug!("rejected from peer {}: {}", peer, err);
        ProcessOutcome::Rejected { dos, reason: err.to_string() }
    }

    pub fn best_hash(&self) -> Hash {
        self.chain.lock().best_hash()
    }

    pub fn best_height(&self) -> u32 {
        self.chain.lock().best_height()
    }

    pub fn locator(&self) -> Vec<Hash> {
        self.chain.lock().locator()
    }

    pub fn has_block(&self, hash: &Hash) -> bool {
        self.chain.lock().contains(hash)
    }

    pub fn read_block(&self, hash: &Hash) -> Result<Option<Block>> {
        self.chain.lock().read_block(hash)
    }

    /// Run `f` against the chain state under its lock
    pub fn with_chain<R>(&self, f: impl FnOnce(&ChainState) -> R) -> R {
        f(&self.chain.lock())
    }

    pub fn with_mempool<R>(&self, f: impl FnOnce(&Mempool) -> R) -> R {
        f(&self.mempool.lock())
    }

    pub fn mempool_contains(&self, txid: &Hash) -> bool {
        self.mempool.lock().exists(txid)
    }

    pub fn mempool_len(&self) -> usize {
        self.mempool.lock().len()
    }

    pub fn orphan_transaction_count(&self) -> usize {
        self.orphans.lock().transactions.len()
    }

    pub fn orphan_block_count(&self) -> usize {
        self.orphans.lock().blocks.len()
    }

    /// Stakes claimed by blocks waiting in the orphan buffer
    pub fn orphan_stake_count(&self) -> usize {
        self.orphans.lock().block_stakes.len()
    }

    pub fn misbehavior_score(&self, peer: PeerId) -> u32 {
        self.misbehavior.lock().score(peer)
    }

    pub fn banned_peers(&self) -> Vec<PeerId> {
        self.misbehavior.lock().banned_peers()
    }

    pub fn adjusted_time(&self) -> i64 {
        self.clock.now()
    }
}
