//! Transaction validation
//!
//! `check_transaction` covers everything decidable from the transaction
//! alone. `fetch_inputs` and `connect_inputs` resolve and spend its inputs
//! against a `UtxoView`, which is how both block connection and mempool
//! acceptance see chain state.

use std::collections::{HashMap, HashSet};

use crate::chain_index::ChainIndex;
use crate::config::ChainParams;
use crate::constants::*;
use crate::error::{ConsensusError, Result};
use crate::kernel;
use crate::mempool::Mempool;
use crate::reward;
use crate::script;
use crate::storage::{TxIndex, UtxoView};
use crate::types::*;

/// CheckTransaction: 𝒯𝒳 → {valid, invalid}
///
/// A transaction tx = (v, ins, outs, lt) is valid if and only if:
/// 1. |ins| > 0 ∧ |outs| > 0
/// 2. |tx| ≤ MAX_BLOCK_SIZE
/// 3. ∀o ∈ outs: o is empty only in coinbase/coinstake, otherwise
///    MIN_TXOUT_AMOUNT ≤ o.value ≤ MAX_MONEY, and the running total stays in range
/// 4. No prevout is spent twice
/// 5. Coinbase: 2 ≤ |scriptSig| ≤ 100; otherwise no null prevouts
pub fn check_transaction(tx: &Transaction) -> Result<()> {
    if tx.inputs.is_empty() {
        return Err(ConsensusError::structural("vin empty", 10));
    }
    if tx.outputs.is_empty() {
        return Err(ConsensusError::structural("vout empty", 10));
    }
    if tx.serialized_size() > MAX_BLOCK_SIZE {
        return Err(ConsensusError::structural("size limits failed", 100));
    }

    let is_coinbase = tx.is_coinbase();
    let may_have_empty = is_coinbase || tx.is_coinstake();
    let mut value_out: i64 = 0;
    for output in &tx.outputs {
        if output.is_empty() {
            if !may_have_empty {
                return Err(ConsensusError::structural("txout empty for user transaction", 100));
            }
        } else if output.value < MIN_TXOUT_AMOUNT {
            return Err(ConsensusError::structural("txout.value below minimum", 100));
        }
        if output.value > MAX_MONEY {
            return Err(ConsensusError::structural("txout.value too high", 100));
        }
        value_out = value_out.saturating_add(output.value);
        if !money_range(value_out) {
            return Err(ConsensusError::structural("txout total out of range", 100));
        }
    }

    let mut seen = HashSet::with_capacity(tx.inputs.len());
    for input in &tx.inputs {
        if !seen.insert(input.prevout) {
            return Err(ConsensusError::structural("duplicate inputs", 0));
        }
    }

    if is_coinbase {
        let len = tx.inputs[0].script_sig.len();
        if !(2..=100).contains(&len) {
            return Err(ConsensusError::structural("coinbase script size", 100));
        }
    } else if tx.inputs.iter().any(|input| input.prevout.is_null()) {
        return Err(ConsensusError::structural("prevout is null", 10));
    }
    Ok(())
}

/// Which fee schedule applies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeeMode {
    /// Assembling a block
    Block,
    /// Relaying to peers
    Relay,
}

/// GetMinFee
///
/// 1. base = MIN_TX_FEE (block) or MIN_RELAY_TX_FEE (relay)
/// 2. fee = (1 + bytes / 1000) × base
/// 3. With `allow_free`, free while the block including the transaction
///    stays under FREE_TX_SIZE_LIMIT
/// 4. Past half of MAX_BLOCK_SIZE_GEN, scale by gen / (gen − new size);
///    a full block prices it at MAX_MONEY
pub fn get_min_fee(tx: &Transaction, block_size: usize, allow_free: bool, mode: FeeMode) -> i64 {
    let base_fee = match mode {
        FeeMode::Block => MIN_TX_FEE,
        FeeMode::Relay => MIN_RELAY_TX_FEE,
    };
    let bytes = tx.serialized_size();
    let new_block_size = block_size + bytes;
    let mut min_fee = (1 + bytes as i64 / 1000) * base_fee;

    if allow_free && new_block_size < FREE_TX_SIZE_LIMIT {
        min_fee = 0;
    }

    if new_block_size >= MAX_BLOCK_SIZE_GEN / 2 {
        if new_block_size >= MAX_BLOCK_SIZE_GEN {
            return MAX_MONEY;
        }
        min_fee = min_fee.saturating_mul((MAX_BLOCK_SIZE_GEN / (MAX_BLOCK_SIZE_GEN - new_block_size)) as i64);
    }

    if !money_range(min_fee) {
        min_fee = MAX_MONEY;
    }
    min_fee
}

/// A resolved input source
#[derive(Debug, Clone)]
pub struct PrevTx {
    pub tx: Transaction,
    /// Spentness as seen by the view, updated by `connect_inputs`
    pub index: TxIndex,
    /// Height and time of the containing block; `None` while only pooled
    pub height: Option<u32>,
    pub block_time: Option<u32>,
}

impl PrevTx {
    pub fn is_confirmed(&self) -> bool {
        self.height.is_some()
    }
}

pub type PrevTxs = HashMap<Hash, PrevTx>;

/// FetchInputs
///
/// Resolve every prevout through the view (confirmed transactions) and then
/// the pool (unconfirmed parents). Any unresolved parent yields
/// `MissingInputs`; a prevout index past the parent's outputs is invalid.
pub fn fetch_inputs(
    tx: &Transaction,
    view: &UtxoView<'_>,
    chain: &ChainIndex,
    mempool: Option<&Mempool>,
) -> Result<PrevTxs> {
    let mut prevs = PrevTxs::new();
    if tx.is_coinbase() {
        return Ok(prevs);
    }

    for input in &tx.inputs {
        let hash = input.prevout.hash;
        if prevs.contains_key(&hash) {
            continue;
        }

        let prev = if let Some(index) = view.get(&hash)? {
            let prev_tx = view.store().read_transaction(index.pos)?;
            let node = chain.lookup_pos(index.pos.block).ok_or_else(|| {
                ConsensusError::Storage(format!("block of transaction {} not indexed", short_hash(&hash)))
            })?;
            let node = chain.node(node);
            PrevTx { tx: prev_tx, index, height: Some(node.height), block_time: Some(node.time()) }
        } else if let Some(prev_tx) = mempool.and_then(|pool| pool.get(&hash)) {
            let index = TxIndex::new(TxPos::MEMPOOL, prev_tx.outputs.len());
            PrevTx { tx: prev_tx.clone(), index, height: None, block_time: None }
        } else {
            return Err(ConsensusError::MissingInputs);
        };
        prevs.insert(hash, prev);
    }

    for input in &tx.inputs {
        let prev = &prevs[&input.prevout.hash];
        let n = input.prevout.index as usize;
        if n >= prev.tx.outputs.len() || n >= prev.index.spent.len() {
            return Err(ConsensusError::violation(
                format!("{} prevout index out of range", input.prevout),
                100,
            ));
        }
    }
    Ok(prevs)
}

/// Where and how a transaction spends its inputs
#[derive(Debug, Clone, Copy)]
pub struct SpendContext {
    /// Height of the block (or next block, for the pool) that spends
    pub height: u32,
    /// Time of the spending block; coin age is measured to it
    pub time: u32,
    pub script_flags: u32,
    pub verify_scripts: bool,
}

/// Totals of a successful `connect_inputs`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectedInputs {
    pub value_in: i64,
    /// Zero for coinstakes
    pub fee: i64,
}

/// ConnectInputs
///
/// For every input of a non-coinbase tx:
/// 1. Coinbase and coinstake sources must have matured
/// 2. Input values must be in range
/// 3. The output must be unspent, and the scriptSig must satisfy it
/// 4. Mark it spent by `pos` (in `prevs` only)
///
/// Then a coinstake may claim at most the stake reward for its coin age;
/// any other transaction must not create value and its fee must be in range.
pub fn connect_inputs(
    tx: &Transaction,
    prevs: &mut PrevTxs,
    pos: TxPos,
    ctx: &SpendContext,
    params: &ChainParams,
) -> Result<ConnectedInputs> {
    if tx.is_coinbase() {
        return Ok(ConnectedInputs { value_in: 0, fee: 0 });
    }

    let mut value_in: i64 = 0;
    let mut stake_inputs = Vec::new();
    for input in &tx.inputs {
        let prev = prevs.get(&input.prevout.hash).ok_or(ConsensusError::MissingInputs)?;
        let n = input.prevout.index as usize;
        let output = prev.tx.outputs.get(n).ok_or_else(|| {
            ConsensusError::violation(format!("{} prevout index out of range", input.prevout), 100)
        })?;

        if prev.tx.is_coinbase() || prev.tx.is_coinstake() {
            if let Some(height) = prev.height {
                if ctx.height.saturating_sub(height) < params.coinbase_maturity {
                    return Err(ConsensusError::violation(
                        format!("tried to spend immature output at depth {}", ctx.height.saturating_sub(height)),
                        0,
                    ));
                }
            }
        }

        value_in = value_in.saturating_add(output.value);
        if !money_range(output.value) || !money_range(value_in) {
            return Err(ConsensusError::violation("txin values out of range", 100));
        }
        stake_inputs.push((output.value, prev.block_time.unwrap_or(ctx.time)));
    }

    for (n, input) in tx.inputs.iter().enumerate() {
        let prev = prevs.get_mut(&input.prevout.hash).ok_or(ConsensusError::MissingInputs)?;
        let index = input.prevout.index as usize;
        if prev.index.spent.get(index).copied().flatten().is_some() {
            return Err(ConsensusError::violation(format!("{} already spent", input.prevout), 10));
        }

        if ctx.verify_scripts {
            let script_pubkey = &prev.tx.outputs[index].script_pubkey;
            if let Err(err) = script::verify_script_detailed(&input.script_sig, script_pubkey, tx, n, ctx.script_flags) {
                return Err(ConsensusError::violation(
                    format!("script verification failed on input {}: {}", n, err),
                    100,
                ));
            }
        }

        prev.index.spent[index] = Some(pos);
    }

    let value_out = tx
        .value_out()
        .ok_or_else(|| ConsensusError::structural("txout total out of range", 100))?;

    if tx.is_coinstake() {
        let coin_age = kernel::coin_age(&stake_inputs, ctx.time, params)?;
        let reward = value_out - value_in;
        let allowed = reward::proof_of_stake_reward(coin_age);
        if reward > allowed {
            return Err(ConsensusError::violation(
                format!("coinstake pays too much (actual={} vs calculated={})", reward, allowed),
                100,
            ));
        }
        return Ok(ConnectedInputs { value_in, fee: 0 });
    }

    if value_in < value_out {
        return Err(ConsensusError::violation("value in below value out", 100));
    }
    let fee = value_in - value_out;
    if !money_range(fee) {
        return Err(ConsensusError::violation("fee out of range", 100));
    }
    Ok(ConnectedInputs { value_in, fee })
}

/// Signature operations counted without looking at previous outputs
pub fn legacy_sigop_count(tx: &Transaction) -> usize {
    let inputs: usize = tx.inputs.iter().map(|i| script::sigop_count(&i.script_sig, false)).sum();
    let outputs: usize = tx.outputs.iter().map(|o| script::sigop_count(&o.script_pubkey, false)).sum();
    inputs + outputs
}

/// Signature operations hidden in pay-to-script-hash redeem scripts
pub fn p2sh_sigop_count(tx: &Transaction, prevs: &PrevTxs) -> usize {
    if tx.is_coinbase() {
        return 0;
    }
    tx.inputs
        .iter()
        .filter_map(|input| {
            let prev = prevs.get(&input.prevout.hash)?;
            let output = prev.tx.outputs.get(input.prevout.index as usize)?;
            if script::is_pay_to_script_hash(&output.script_pubkey) {
                Some(script::p2sh_sigop_count(&output.script_pubkey, &input.script_sig))
            } else {
                None
            }
        })
        .sum()
}

/// Priority: Σ input value × confirmations / size
pub fn priority(tx: &Transaction, prevs: &PrevTxs, next_height: u32) -> f64 {
    let mut total = 0f64;
    for input in &tx.inputs {
        let Some(prev) = prevs.get(&input.prevout.hash) else {
            continue;
        };
        let Some(output) = prev.tx.outputs.get(input.prevout.index as usize) else {
            continue;
        };
        let confirmations = prev.height.map(|h| next_height.saturating_sub(h)).unwrap_or(0);
        total += output.value as f64 * confirmations as f64;
    }
    total / tx.serialized_size().max(1) as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::{OP_1, OP_CHECKSIG};

    fn user_tx() -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TransactionInput::new(OutPoint::new([1; 32], 0), vec![OP_1])],
            outputs: vec![TransactionOutput::new(CENT, vec![OP_1])],
            lock_time: 0,
        }
    }

    fn coinbase() -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TransactionInput::new(OutPoint::null(), vec![1, 2])],
            outputs: vec![TransactionOutput::new(50 * COIN, vec![OP_CHECKSIG])],
            lock_time: 0,
        }
    }

    #[test]
    fn test_check_transaction_valid() {
        assert!(check_transaction(&user_tx()).is_ok());
        assert!(check_transaction(&coinbase()).is_ok());
    }

    #[test]
    fn test_empty_inputs_and_outputs() {
        let mut tx = user_tx();
        tx.inputs.clear();
        assert_eq!(check_transaction(&tx).unwrap_err().dos_score(), 10);
        let mut tx = user_tx();
        tx.outputs.clear();
        assert_eq!(check_transaction(&tx).unwrap_err().dos_score(), 10);
    }

    #[test]
    fn test_output_values() {
        let mut tx = user_tx();
        tx.outputs[0].value = CENT - 1;
        assert!(check_transaction(&tx).unwrap_err().to_string().contains("below minimum"));

        let mut tx = user_tx();
        tx.outputs[0].value = MAX_MONEY + 1;
        assert_eq!(check_transaction(&tx).unwrap_err().dos_score(), 100);

        let mut tx = user_tx();
        tx.outputs = vec![TransactionOutput::new(MAX_MONEY, vec![OP_1]), TransactionOutput::new(MAX_MONEY, vec![OP_1])];
        assert!(check_transaction(&tx).unwrap_err().to_string().contains("total"));

        let mut tx = user_tx();
        tx.outputs.push(TransactionOutput::empty());
        assert!(check_transaction(&tx).unwrap_err().to_string().contains("empty"));
    }

    #[test]
    fn test_duplicate_inputs() {
        let mut tx = user_tx();
        tx.inputs.push(tx.inputs[0].clone());
        let err = check_transaction(&tx).unwrap_err();
        assert!(err.to_string().contains("duplicate"));
        assert_eq!(err.dos_score(), 0);
    }

    #[test]
    fn test_coinbase_script_size() {
        let mut tx = coinbase();
        tx.inputs[0].script_sig = vec![1];
        assert!(check_transaction(&tx).is_err());
        tx.inputs[0].script_sig = vec![1; 101];
        assert!(check_transaction(&tx).is_err());
        tx.inputs[0].script_sig = vec![1; 100];
        assert!(check_transaction(&tx).is_ok());
    }

    #[test]
    fn test_null_prevout_outside_coinbase() {
        let mut tx = user_tx();
        tx.inputs.push(TransactionInput::new(OutPoint::null(), vec![]));
        assert_eq!(check_transaction(&tx).unwrap_err().dos_score(), 10);
    }

    #[test]
    fn test_min_fee() {
        let tx = user_tx();
        assert_eq!(get_min_fee(&tx, 1000, false, FeeMode::Relay), MIN_RELAY_TX_FEE);
        assert_eq!(get_min_fee(&tx, 1000, true, FeeMode::Relay), 0);
        // the block is already past the free area
        assert_eq!(get_min_fee(&tx, FREE_TX_SIZE_LIMIT, true, FeeMode::Block), MIN_TX_FEE);
        // price rises as the block fills
        let half = MAX_BLOCK_SIZE_GEN / 2;
        assert!(get_min_fee(&tx, half, false, FeeMode::Block) > MIN_TX_FEE);
        assert_eq!(get_min_fee(&tx, MAX_BLOCK_SIZE_GEN, false, FeeMode::Block), MAX_MONEY);
    }

    #[test]
    fn test_min_fee_grows_per_kilobyte() {
        let mut tx = user_tx();
        tx.inputs[0].script_sig = vec![OP_1; 2500];
        assert_eq!(get_min_fee(&tx, 1000, false, FeeMode::Relay), 3 * MIN_RELAY_TX_FEE);
    }

    fn prevs_for(tx: &Transaction, prev: Transaction, height: Option<u32>) -> PrevTxs {
        let mut prevs = PrevTxs::new();
        let index = TxIndex::new(TxPos::new(BlockPos(0), 0), prev.outputs.len());
        prevs.insert(tx.inputs[0].prevout.hash, PrevTx { tx: prev, index, height, block_time: Some(0) });
        prevs
    }

    fn ctx(height: u32) -> SpendContext {
        SpendContext { height, time: 100_000, script_flags: script::SCRIPT_VERIFY_P2SH, verify_scripts: true }
    }

    #[test]
    fn test_connect_inputs_fee_and_spent() {
        let params = ChainParams::regtest();
        let prev = Transaction {
            version: 1,
            inputs: vec![TransactionInput::new(OutPoint::new([8; 32], 0), vec![])],
            outputs: vec![TransactionOutput::new(3 * CENT, vec![OP_1])],
            lock_time: 0,
        };
        let mut tx = user_tx();
        tx.inputs[0].prevout = OutPoint::new(prev.hash(), 0);
        let mut prevs = prevs_for(&tx, prev, Some(1));

        let pos = TxPos::new(BlockPos(4), 1);
        let connected = connect_inputs(&tx, &mut prevs, pos, &ctx(5), &params).unwrap();
        assert_eq!(connected, ConnectedInputs { value_in: 3 * CENT, fee: 2 * CENT });
        assert_eq!(prevs[&tx.inputs[0].prevout.hash].index.spent[0], Some(pos));

        // spending it again fails
        let err = connect_inputs(&tx, &mut prevs, pos, &ctx(5), &params).unwrap_err();
        assert!(err.to_string().contains("already spent"));
    }

    #[test]
    fn test_connect_inputs_value_created() {
        let params = ChainParams::regtest();
        let prev = Transaction {
            version: 1,
            inputs: vec![TransactionInput::new(OutPoint::new([8; 32], 0), vec![])],
            outputs: vec![TransactionOutput::new(CENT / 2, vec![OP_1])],
            lock_time: 0,
        };
        let mut tx = user_tx();
        tx.inputs[0].prevout = OutPoint::new(prev.hash(), 0);
        let mut prevs = prevs_for(&tx, prev, Some(1));
        let err = connect_inputs(&tx, &mut prevs, TxPos::MEMPOOL, &ctx(5), &params).unwrap_err();
        assert_eq!(err.dos_score(), 100);
    }

    #[test]
    fn test_coinbase_maturity() {
        let params = ChainParams::regtest();
        let prev = coinbase();
        let mut tx = user_tx();
        tx.inputs[0].prevout = OutPoint::new(prev.hash(), 0);

        // coinbase at height 1, spend at 50: depth 49
        let mut prevs = prevs_for(&tx, prev.clone(), Some(1));
        let err = connect_inputs(&tx, &mut prevs, TxPos::MEMPOOL, &ctx(50), &params).unwrap_err();
        assert!(err.to_string().contains("immature"));

        // depth exactly the maturity floor
        let mut tx_ok = tx.clone();
        tx_ok.inputs[0].script_sig = vec![OP_1];
        let mut prevs = prevs_for(&tx_ok, prev.clone(), Some(1));
        let mut relaxed = ctx(51);
        relaxed.verify_scripts = false;
        assert!(connect_inputs(&tx_ok, &mut prevs, TxPos::MEMPOOL, &relaxed, &params).is_ok());

        let mut prevs = prevs_for(&tx_ok, prev, Some(1));
        relaxed.height = 102;
        assert!(connect_inputs(&tx_ok, &mut prevs, TxPos::MEMPOOL, &relaxed, &params).is_ok());
    }

    #[test]
    fn test_script_failure_is_violation() {
        let params = ChainParams::regtest();
        let prev = Transaction {
            version: 1,
            inputs: vec![TransactionInput::new(OutPoint::new([8; 32], 0), vec![])],
            outputs: vec![TransactionOutput::new(3 * CENT, vec![script::OP_0])],
            lock_time: 0,
        };
        let mut tx = user_tx();
        tx.inputs[0].prevout = OutPoint::new(prev.hash(), 0);
        tx.inputs[0].script_sig = vec![];
        let mut prevs = prevs_for(&tx, prev, Some(1));
        let err = connect_inputs(&tx, &mut prevs, TxPos::MEMPOOL, &ctx(5), &params).unwrap_err();
        assert!(err.to_string().contains("script verification failed"));
        // nothing was marked spent
        assert!(prevs.values().all(|p| p.index.spent.iter().all(Option::is_none)));
    }

    #[test]
    fn test_legacy_sigops() {
        let mut tx = user_tx();
        tx.outputs[0].script_pubkey = vec![OP_CHECKSIG, OP_CHECKSIG];
        assert_eq!(legacy_sigop_count(&tx), 2);
    }
}
