//! Memory pool of unconfirmed transactions
//!
//! The pool never holds two transactions spending the same output: a
//! conflicting newcomer is rejected, not substituted. Pooled transactions may
//! spend each other; `fetch_inputs` resolves such parents from the pool.

use std::collections::HashMap;

use log::{debug, info};

use crate::chainstate::ChainState;
use crate::constants::*;
use crate::error::{ConsensusError, Result};
use crate::script::{SCRIPT_VERIFY_P2SH, SCRIPT_VERIFY_STRICT};
use crate::standard::{are_inputs_standard, is_standard_tx};
use crate::storage::UtxoView;
use crate::transaction::{check_transaction, connect_inputs, fetch_inputs, get_min_fee, priority, FeeMode, SpendContext};
use crate::types::*;

/// Window over which the free relay budget decays, in seconds
const FREE_RELAY_WINDOW: f64 = 600.0;

#[derive(Debug, Clone)]
pub struct MempoolEntry {
    pub tx: Transaction,
    pub fee: i64,
    pub size: usize,
    pub priority: f64,
    /// Time the transaction entered the pool
    pub time: i64,
}

#[derive(Debug, Default)]
pub struct Mempool {
    entries: HashMap<Hash, MempoolEntry>,
    /// Spender of each pooled prevout
    next_tx: HashMap<OutPoint, Hash>,
    transactions_updated: u64,
    free_count: f64,
    last_free_time: i64,
}

impl Mempool {
    pub fn new() -> Self {
        Self::default()
    }

    /// AcceptToMemoryPool
    ///
    /// 1. `check_transaction`; no coinbase or coinstake; lock time fits in i32
    /// 2. Standard unless the chain accepts nonstandard transactions
    /// 3. Not already pooled or confirmed, no conflict with a pooled spender
    /// 4. Every input resolves through the chain or the pool
    /// 5. Inputs standard; fee at least the relay minimum, free transactions
    ///    within the decaying free relay budget
    /// 6. Inputs connect on a throwaway view with strict script checks
    pub fn accept(&mut self, chain: &ChainState, tx: &Transaction, now: i64) -> Result<Hash> {
        let params = chain.params();
        check_transaction(tx)?;

        if tx.is_coinbase() {
            return Err(ConsensusError::violation("coinbase as individual tx", 100));
        }
        if tx.is_coinstake() {
            return Err(ConsensusError::violation("coinstake as individual tx", 100));
        }
        if tx.lock_time > i32::MAX as u32 {
            return Err(ConsensusError::violation("not accepting lock time beyond 2038 yet", 0));
        }
        if !params.accept_nonstandard {
            if let Err(reason) = is_standard_tx(tx) {
                return Err(ConsensusError::violation(format!("nonstandard transaction: {}", reason), 0));
            }
        }

        let hash = tx.hash();
        if self.entries.contains_key(&hash) || chain.has_transaction(&hash)? {
            return Err(ConsensusError::AlreadyKnown(hash));
        }

        for input in &tx.inputs {
            if let Some(spender) = self.next_tx.get(&input.prevout) {
                return Err(ConsensusError::violation(
                    format!("{} already spent by pooled {}", input.prevout, short_hash(spender)),
                    0,
                ));
            }
        }

        let view = UtxoView::new(chain.store());
        let mut prevs = fetch_inputs(tx, &view, chain.index(), Some(&*self))?;

        if !params.accept_nonstandard {
            let prev_scripts: Vec<&[u8]> = tx
                .inputs
                .iter()
                .map(|input| prevs[&input.prevout.hash].tx.outputs[input.prevout.index as usize].script_pubkey.as_slice())
                .collect();
            if !are_inputs_standard(tx, &prev_scripts) {
                return Err(ConsensusError::violation("nonstandard transaction input", 0));
            }
        }

        let value_in = tx
            .inputs
            .iter()
            .map(|input| prevs[&input.prevout.hash].tx.outputs[input.prevout.index as usize].value)
            .fold(0i64, i64::saturating_add);
        let value_out = tx
            .value_out()
            .ok_or_else(|| ConsensusError::structural("txout total out of range", 100))?;
        let fee = value_in.saturating_sub(value_out);
        let size = tx.serialized_size();

        let min_fee = get_min_fee(tx, 1000, true, FeeMode::Relay);
        if fee < min_fee {
            return Err(ConsensusError::violation(format!("not enough fees {} < {}", fee, min_fee), 0));
        }

        let mut free_count = None;
        if fee < MIN_RELAY_TX_FEE {
            let elapsed = (now - self.last_free_time).max(0);
            let decayed = self.free_count * (1.0 - 1.0 / FREE_RELAY_WINDOW).powi(elapsed.min(i32::MAX as i64) as i32);
            let limit = params.limit_free_relay as f64 * 10.0 * 1000.0;
            if decayed > limit {
                return Err(ConsensusError::ResourceLimit("free transaction rejected by rate limiter".to_string()));
            }
            free_count = Some((decayed, decayed + size as f64));
        }

        let next_height = chain.best_height() + 1;
        let ctx = SpendContext {
            height: next_height,
            time: now.clamp(0, u32::MAX as i64) as u32,
            script_flags: SCRIPT_VERIFY_P2SH | SCRIPT_VERIFY_STRICT,
            verify_scripts: true,
        };
        connect_inputs(tx, &mut prevs, TxPos::MEMPOOL, &ctx, params)?;

        // the free budget is only charged once nothing else can reject
        if let Some((before, after)) = free_count {
            debug!("rate limit free count: {:.0} => {:.0}", before, after);
            self.free_count = after;
            self.last_free_time = now;
        }

        let entry = MempoolEntry { tx: tx.clone(), fee, size, priority: priority(tx, &prevs, next_height), time: now };
        self.add_unchecked(hash, entry);
        info!("mempool accepted {} (pool size {})", short_hash(&hash), self.entries.len());
        Ok(hash)
    }

    pub(crate) fn add_unchecked(&mut self, hash: Hash, entry: MempoolEntry) {
        for input in &entry.tx.inputs {
            self.next_tx.insert(input.prevout, hash);
        }
        self.entries.insert(hash, entry);
        self.transactions_updated += 1;
    }

    /// Remove a transaction; with `recursive`, also every pooled descendant.
    /// Returns what was removed.
    pub fn remove(&mut self, txid: &Hash, recursive: bool) -> Vec<Transaction> {
        let mut removed = Vec::new();
        let mut queue = vec![*txid];
        while let Some(hash) = queue.pop() {
            let Some(entry) = self.entries.remove(&hash) else {
                continue;
            };
            if recursive {
                for n in 0..entry.tx.outputs.len() {
                    if let Some(child) = self.next_tx.get(&OutPoint::new(hash, n as u32)) {
                        queue.push(*child);
                    }
                }
            }
            for input in &entry.tx.inputs {
                self.next_tx.remove(&input.prevout);
            }
            self.transactions_updated += 1;
            removed.push(entry.tx);
        }
        removed
    }

    /// Remove pooled transactions that spend any output `tx` spends, with
    /// their descendants
    pub fn remove_conflicts(&mut self, tx: &Transaction) -> Vec<Transaction> {
        let txid = tx.hash();
        let mut removed = Vec::new();
        for input in &tx.inputs {
            if let Some(&spender) = self.next_tx.get(&input.prevout) {
                if spender != txid {
                    removed.extend(self.remove(&spender, true));
                }
            }
        }
        removed
    }

    /// Drop a newly connected block's transactions and whatever they
    /// conflict with; returns the conflicting transactions removed
    pub fn remove_for_block(&mut self, block: &Block) -> Vec<Transaction> {
        let mut conflicted = Vec::new();
        for tx in &block.transactions {
            self.remove(&tx.hash(), false);
            conflicted.extend(self.remove_conflicts(tx));
        }
        conflicted
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.next_tx.clear();
        self.transactions_updated += 1;
    }

    /// Bytes of free transactions counted against the relay limit, as of
    /// the last free acceptance
    pub fn free_relay_usage(&self) -> f64 {
        self.free_count
    }

    pub fn exists(&self, txid: &Hash) -> bool {
        self.entries.contains_key(txid)
    }

    pub fn get(&self, txid: &Hash) -> Option<&Transaction> {
        self.entries.get(txid).map(|entry| &entry.tx)
    }

    pub fn entry(&self, txid: &Hash) -> Option<&MempoolEntry> {
        self.entries.get(txid)
    }

    /// Pooled spender of an outpoint
    pub fn spender(&self, outpoint: &OutPoint) -> Option<Hash> {
        self.next_tx.get(outpoint).copied()
    }

    /// Ids of all pooled transactions, sorted
    pub fn query_hashes(&self) -> Vec<Hash> {
        let mut hashes: Vec<Hash> = self.entries.keys().copied().collect();
        hashes.sort_unstable();
        hashes
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Bumped on every change; lets block assemblers notice a stale template
    pub fn transactions_updated(&self) -> u64 {
        self.transactions_updated
    }
}
