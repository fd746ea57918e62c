//! Block validation
//!
//! `check_block` is context free apart from the clock. `connect_block` and
//! `disconnect_block` apply and revert a block's transaction index changes on
//! a `UtxoView`; nothing reaches the store until the caller commits the view.

use std::collections::HashSet;

use log::debug;
use secp256k1::{ecdsa::Signature, Message, PublicKey, Secp256k1, SecretKey};

use crate::chain_index::{ChainIndex, NodeId};
use crate::checkpoints::Checkpoints;
use crate::config::ChainParams;
use crate::constants::*;
use crate::error::{ConsensusError, Result};
use crate::pow::check_proof_of_work;
use crate::reward::proof_of_work_subsidy;
use crate::script::SCRIPT_VERIFY_P2SH;
use crate::serialize::sha256d_concat;
use crate::standard::{solve, ScriptTemplate};
use crate::storage::{TxIndex, UtxoView};
use crate::transaction::{
    check_transaction, connect_inputs, fetch_inputs, legacy_sigop_count, p2sh_sigop_count, SpendContext,
};
use crate::types::*;

/// Merkle root over transaction ids, duplicating the last hash of odd levels
pub fn merkle_root(transactions: &[Transaction]) -> Hash {
    let mut level: Vec<Hash> = transactions.iter().map(Transaction::hash).collect();
    if level.is_empty() {
        return NULL_HASH;
    }
    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| {
                let right = pair.get(1).unwrap_or(&pair[0]);
                sha256d_concat(&[&pair[0], right])
            })
            .collect();
    }
    level[0]
}

/// CheckBlock: ℬ × ℕ → {valid, invalid}
///
/// 1. At least one transaction and size ≤ MAX_BLOCK_SIZE
/// 2. Proof-of-work blocks meet their target
/// 3. Timestamp ≤ adjusted time + maximum drift
/// 4. Coinbase first and only first; coinstake only second
/// 5. Proof-of-stake coinbase pays nothing
/// 6. Every transaction passes `check_transaction`, txids unique
/// 7. Legacy sigops ≤ MAX_BLOCK_SIGOPS
/// 8. Merkle root and block signature match
pub fn check_block(block: &Block, params: &ChainParams, adjusted_time: i64) -> Result<()> {
    if block.transactions.is_empty() || block.serialized_size() > MAX_BLOCK_SIZE {
        return Err(ConsensusError::structural("size limits failed", 100));
    }

    let proof_of_stake = block.is_proof_of_stake();
    if !proof_of_stake {
        check_proof_of_work(&block.hash(), block.header.bits, params)?;
    }

    if block.header.timestamp as i64 > adjusted_time + params.max_clock_drift as i64 {
        return Err(ConsensusError::violation("block timestamp too far in the future", 0));
    }

    if !block.transactions[0].is_coinbase() {
        return Err(ConsensusError::structural("first tx is not coinbase", 100));
    }
    if block.transactions.iter().skip(1).any(Transaction::is_coinbase) {
        return Err(ConsensusError::structural("more than one coinbase", 100));
    }
    if block.transactions.iter().skip(2).any(Transaction::is_coinstake) {
        return Err(ConsensusError::structural("coinstake in wrong position", 100));
    }
    if proof_of_stake {
        let coinbase = &block.transactions[0];
        if coinbase.outputs.len() != 1 || !coinbase.outputs[0].is_empty() {
            return Err(ConsensusError::structural("coinbase output not empty for proof-of-stake block", 100));
        }
    }

    for tx in &block.transactions {
        check_transaction(tx)?;
    }

    let mut txids = HashSet::with_capacity(block.transactions.len());
    if !block.transactions.iter().all(|tx| txids.insert(tx.hash())) {
        return Err(ConsensusError::structural("duplicate transaction", 100));
    }

    let sigops: usize = block.transactions.iter().map(legacy_sigop_count).sum();
    if sigops > MAX_BLOCK_SIGOPS {
        return Err(ConsensusError::structural("out-of-bounds sigop count", 100));
    }

    if block.header.merkle_root != merkle_root(&block.transactions) {
        return Err(ConsensusError::structural("hash merkle root mismatch", 100));
    }

    if !check_block_signature(block) {
        return Err(ConsensusError::structural("bad block signature", 100));
    }
    Ok(())
}

/// Key that must sign a proof-of-stake block: the pay-to-pubkey key of the
/// coinstake's first real output
fn staker_key(block: &Block) -> Option<PublicKey> {
    let coinstake = block.transactions.get(1)?;
    let output = coinstake.outputs.get(1)?;
    match solve(&output.script_pubkey) {
        ScriptTemplate::PubKey(key) => PublicKey::from_slice(&key).ok(),
        _ => None,
    }
}

/// CheckBlockSignature
///
/// Work blocks carry no signature. Stake blocks are signed over the block
/// hash by the staker's key.
pub fn check_block_signature(block: &Block) -> bool {
    if block.is_proof_of_work() {
        return block.signature.is_empty();
    }
    let Some(key) = staker_key(block) else {
        return false;
    };
    let Ok(mut sig) = Signature::from_der_lax(&block.signature) else {
        return false;
    };
    sig.normalize_s();
    let Ok(message) = Message::from_digest_slice(&block.hash()) else {
        return false;
    };
    Secp256k1::verification_only().verify_ecdsa(&message, &sig, &key).is_ok()
}

/// Sign a proof-of-stake block with the staker's key
pub fn sign_block(block: &mut Block, key: &SecretKey) -> Result<()> {
    let secp = Secp256k1::signing_only();
    let expected = staker_key(block)
        .ok_or_else(|| ConsensusError::structural("block has no pay-to-pubkey coinstake output", 0))?;
    if PublicKey::from_secret_key(&secp, key) != expected {
        return Err(ConsensusError::structural("key does not match coinstake output", 0));
    }
    let message = Message::from_digest_slice(&block.hash())
        .map_err(|e| ConsensusError::Serialization(e.to_string()))?;
    block.signature = secp.sign_ecdsa(&message, key).serialize_der().to_vec();
    Ok(())
}

/// Totals of a connected block
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectedBlock {
    pub value_in: i64,
    pub value_out: i64,
    pub fees: i64,
    /// Value created: out − in + fees
    pub mint: i64,
}

/// ConnectBlock: ℬ × 𝒰𝒱 → {valid, invalid} × 𝒰𝒱
///
/// For block b stored at `node`'s position:
/// 1. No transaction may overwrite an existing index record
/// 2. Resolve and spend every input (scripts checked above the last
///    checkpoint); accumulate fees
/// 3. Sigops including P2SH redeem scripts ≤ MAX_BLOCK_SIGOPS
/// 4. A work block's coinbase may claim at most subsidy + fees
/// 5. Record an index entry for every transaction
pub fn connect_block(
    block: &Block,
    node: NodeId,
    chain: &ChainIndex,
    view: &mut UtxoView<'_>,
    params: &ChainParams,
    checkpoints: &Checkpoints,
) -> Result<ConnectedBlock> {
    let node = chain.node(node);
    let ctx = SpendContext {
        height: node.height,
        time: block.header.timestamp,
        script_flags: SCRIPT_VERIFY_P2SH,
        verify_scripts: node.height >= checkpoints.total_blocks_estimate(),
    };

    let mut totals = ConnectedBlock::default();
    let mut sigops = 0usize;
    for (i, tx) in block.transactions.iter().enumerate() {
        let txid = tx.hash();
        if view.contains(&txid)? {
            return Err(ConsensusError::violation(
                format!("tried to overwrite transaction {}", short_hash(&txid)),
                100,
            ));
        }

        sigops += legacy_sigop_count(tx);
        if sigops > MAX_BLOCK_SIGOPS {
            return Err(ConsensusError::violation("too many sigops", 100));
        }

        let pos = TxPos::new(node.pos, i as u32);
        if !tx.is_coinbase() {
            let mut prevs = match fetch_inputs(tx, view, chain, None) {
                Err(ConsensusError::MissingInputs) => {
                    return Err(ConsensusError::violation(
                        format!("inputs of {} missing", short_hash(&txid)),
                        0,
                    ));
                }
                other => other?,
            };

            sigops += p2sh_sigop_count(tx, &prevs);
            if sigops > MAX_BLOCK_SIGOPS {
                return Err(ConsensusError::violation("too many sigops", 100));
            }

            let connected = connect_inputs(tx, &mut prevs, pos, &ctx, params)?;
            for (hash, prev) in prevs {
                view.put(hash, prev.index);
            }
            totals.value_in += connected.value_in;
            totals.fees += connected.fee;
        }

        totals.value_out += tx
            .value_out()
            .ok_or_else(|| ConsensusError::structural("txout total out of range", 100))?;
        view.put(txid, TxIndex::new(pos, tx.outputs.len()));
    }

    if block.is_proof_of_work() {
        let claimed = block.transactions[0]
            .value_out()
            .ok_or_else(|| ConsensusError::structural("txout total out of range", 100))?;
        let allowed = proof_of_work_subsidy(node.height, params) + totals.fees;
        if claimed > allowed {
            return Err(ConsensusError::violation(
                format!("coinbase reward exceeded ({} > {})", claimed, allowed),
                50,
            ));
        }
    }

    totals.mint = totals.value_out - totals.value_in + totals.fees;
    debug!(
        "connected block {} at height {}: mint {} fees {}",
        short_hash(&node.hash),
        node.height,
        totals.mint,
        totals.fees
    );
    Ok(totals)
}

/// DisconnectBlock
///
/// Exact inverse of `connect_block`: walking the transactions backwards,
/// release every input this block spent and erase the block's own records.
pub fn disconnect_block(block: &Block, node: NodeId, chain: &ChainIndex, view: &mut UtxoView<'_>) -> Result<()> {
    let block_pos = chain.node(node).pos;
    for (i, tx) in block.transactions.iter().enumerate().rev() {
        let pos = TxPos::new(block_pos, i as u32);
        if !tx.is_coinbase() {
            for input in tx.inputs.iter().rev() {
                let hash = input.prevout.hash;
                let mut index = view.get(&hash)?.ok_or_else(|| {
                    ConsensusError::Storage(format!("no index record for spent transaction {}", short_hash(&hash)))
                })?;
                let slot = index.spent.get_mut(input.prevout.index as usize).ok_or_else(|| {
                    ConsensusError::Storage(format!("{} out of range on disconnect", input.prevout))
                })?;
                if *slot != Some(pos) {
                    return Err(ConsensusError::Storage(format!("{} not spent by this block", input.prevout)));
                }
                *slot = None;
                view.put(hash, index);
            }
        }
        view.erase(tx.hash());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain_index::tests::node;
    use crate::pow::{compact_to_target, hash_to_u256};
    use crate::script::OP_1;
    use crate::standard::pay_to_pubkey;
    use crate::storage::{ChainStore, MemoryStore, WriteBatch};

    fn coinbase(tag: u8, value: i64) -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TransactionInput::new(OutPoint::null(), vec![tag, 0])],
            outputs: vec![TransactionOutput::new(value, vec![OP_1])],
            lock_time: 0,
        }
    }

    fn mined(mut block: Block) -> Block {
        block.header.merkle_root = merkle_root(&block.transactions);
        let target = compact_to_target(block.header.bits).unwrap();
        while hash_to_u256(&block.hash()) > target {
            block.header.nonce += 1;
        }
        block
    }

    fn work_block(transactions: Vec<Transaction>) -> Block {
        mined(Block {
            header: BlockHeader {
                version: 1,
                prev_block_hash: NULL_HASH,
                merkle_root: NULL_HASH,
                timestamp: 1_000,
                bits: 0x207fffff,
                nonce: 0,
            },
            transactions,
            signature: Vec::new(),
        })
    }

    #[test]
    fn test_merkle_root() {
        let a = coinbase(1, CENT);
        let b = coinbase(2, CENT);
        let c = coinbase(3, CENT);
        assert_eq!(merkle_root(&[]), NULL_HASH);
        assert_eq!(merkle_root(&[a.clone()]), a.hash());
        let ab = sha256d_concat(&[&a.hash(), &b.hash()]);
        assert_eq!(merkle_root(&[a.clone(), b.clone()]), ab);
        let cc = sha256d_concat(&[&c.hash(), &c.hash()]);
        assert_eq!(merkle_root(&[a, b, c]), sha256d_concat(&[&ab, &cc]));
    }

    #[test]
    fn test_check_block_valid() {
        let params = ChainParams::regtest();
        let block = work_block(vec![coinbase(1, CENT)]);
        assert!(check_block(&block, &params, 1_000).is_ok());
    }

    #[test]
    fn test_check_block_rejections() {
        let params = ChainParams::regtest();

        let mut bad_root = work_block(vec![coinbase(1, CENT)]);
        bad_root.header.merkle_root[0] ^= 1;
        let target = compact_to_target(bad_root.header.bits).unwrap();
        while hash_to_u256(&bad_root.hash()) > target {
            bad_root.header.nonce += 1;
        }
        assert!(check_block(&bad_root, &params, 1_000).unwrap_err().to_string().contains("merkle"));

        let two_coinbases = work_block(vec![coinbase(1, CENT), coinbase(2, CENT)]);
        assert!(check_block(&two_coinbases, &params, 1_000)
            .unwrap_err()
            .to_string()
            .contains("more than one coinbase"));

        let future = work_block(vec![coinbase(1, CENT)]);
        let err = check_block(&future, &params, 1_000 - params.max_clock_drift as i64 - 1).unwrap_err();
        assert!(err.to_string().contains("future"));

        let mut signed_work = work_block(vec![coinbase(1, CENT)]);
        signed_work.signature = vec![0x30];
        assert!(check_block(&signed_work, &params, 1_000).unwrap_err().to_string().contains("signature"));

        let mut dup = work_block(vec![coinbase(1, CENT)]);
        let spend = Transaction {
            version: 1,
            inputs: vec![TransactionInput::new(OutPoint::new([5; 32], 0), vec![])],
            outputs: vec![TransactionOutput::new(CENT, vec![OP_1])],
            lock_time: 0,
        };
        dup.transactions.push(spend.clone());
        dup.transactions.push(spend);
        let dup = mined(dup);
        assert!(check_block(&dup, &params, 1_000).unwrap_err().to_string().contains("duplicate"));
    }

    #[test]
    fn test_stake_block_signature() {
        let secp = Secp256k1::new();
        let key = SecretKey::from_slice(&[0x11; 32]).unwrap();
        let pubkey = PublicKey::from_secret_key(&secp, &key).serialize();

        let coinstake = Transaction {
            version: 1,
            inputs: vec![TransactionInput::new(OutPoint::new([3; 32], 0), vec![])],
            outputs: vec![TransactionOutput::empty(), TransactionOutput::new(COIN, pay_to_pubkey(&pubkey))],
            lock_time: 0,
        };
        let mut empty_coinbase = coinbase(1, 0);
        empty_coinbase.outputs = vec![TransactionOutput::empty()];
        let mut block = Block {
            header: BlockHeader {
                version: 1,
                prev_block_hash: NULL_HASH,
                merkle_root: NULL_HASH,
                timestamp: 1_000,
                bits: 0x207fffff,
                nonce: 0,
            },
            transactions: vec![empty_coinbase, coinstake],
            signature: Vec::new(),
        };
        block.header.merkle_root = merkle_root(&block.transactions);
        assert!(block.is_proof_of_stake());
        assert!(!check_block_signature(&block));

        let other = SecretKey::from_slice(&[0x22; 32]).unwrap();
        assert!(sign_block(&mut block, &other).is_err());

        sign_block(&mut block, &key).unwrap();
        assert!(check_block_signature(&block));
        assert!(check_block(&block, &ChainParams::regtest(), 1_000).is_ok());

        block.header.nonce += 1;
        assert!(!check_block_signature(&block));
    }

    #[test]
    fn test_connect_disconnect_inverse() {
        let params = ChainParams::regtest();
        let checkpoints = Checkpoints::new();
        let mut store = MemoryStore::new();

        let funding = Transaction {
            version: 1,
            inputs: vec![TransactionInput::new(OutPoint::new([9; 32], 0), vec![])],
            outputs: vec![TransactionOutput::new(3 * CENT, vec![OP_1])],
            lock_time: 0,
        };
        let base = work_block(vec![coinbase(0, CENT), funding.clone()]);
        let base_pos = store.append_block(&base).unwrap();
        store
            .write_batch(WriteBatch {
                tx_index: vec![(funding.hash(), Some(TxIndex::new(TxPos::new(base_pos, 1), 1)))],
                best_chain: None,
            })
            .unwrap();

        let spend = Transaction {
            version: 1,
            inputs: vec![TransactionInput::new(OutPoint::new(funding.hash(), 0), vec![])],
            outputs: vec![TransactionOutput::new(CENT, vec![OP_1])],
            lock_time: 0,
        };
        let next = work_block(vec![coinbase(1, params.pow_subsidy + 2 * CENT), spend.clone()]);
        let next_pos = store.append_block(&next).unwrap();

        let mut chain = ChainIndex::new();
        let mut genesis = node(1, None, 0, 900);
        genesis.pos = base_pos;
        let genesis = chain.insert(genesis);
        let mut child = node(1, Some(genesis), 1, 1_000);
        child.pos = next_pos;
        let child = chain.insert(child);

        let before = store.read_tx_index(&funding.hash()).unwrap();

        let mut view = UtxoView::new(&store);
        let totals = connect_block(&next, child, &chain, &mut view, &params, &checkpoints).unwrap();
        assert_eq!(totals.fees, 2 * CENT);
        assert_eq!(totals.value_in, 3 * CENT);
        assert_eq!(totals.mint, params.pow_subsidy + 2 * CENT);
        let batch = view.into_batch(None);
        store.write_batch(batch).unwrap();
        assert!(store.read_tx_index(&funding.hash()).unwrap().unwrap().is_spent(0));
        assert!(store.read_tx_index(&spend.hash()).unwrap().is_some());

        let mut view = UtxoView::new(&store);
        disconnect_block(&next, child, &chain, &mut view).unwrap();
        store.write_batch(view.into_batch(None)).unwrap();
        assert_eq!(store.read_tx_index(&funding.hash()).unwrap(), before);
        assert_eq!(store.read_tx_index(&spend.hash()).unwrap(), None);
        assert_eq!(store.read_tx_index(&next.transactions[0].hash()).unwrap(), None);
    }

    #[test]
    fn test_coinbase_overpay() {
        let params = ChainParams::regtest();
        let mut store = MemoryStore::new();
        let block = work_block(vec![coinbase(1, params.pow_subsidy + 1)]);
        let pos = store.append_block(&block).unwrap();
        let mut chain = ChainIndex::new();
        let mut genesis = node(1, None, 0, 900);
        genesis.pos = pos;
        let id = chain.insert(genesis);
        let mut view = UtxoView::new(&store);
        let err = connect_block(&block, id, &chain, &mut view, &params, &Checkpoints::new()).unwrap_err();
        assert_eq!(err.dos_score(), 50);
    }
}
