//! Shared fixtures: a regtest node with a manual clock and one signing key

#![allow(dead_code)]

use std::sync::Arc;

use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};
use stake_ledger::block::{merkle_root, sign_block};
use stake_ledger::pow::{compact_to_target, hash_to_u256, next_target_required};
use stake_ledger::reward::proof_of_work_subsidy;
use stake_ledger::script::{push_data, signature_hash, SIGHASH_ALL};
use stake_ledger::standard::pay_to_pubkey;
use stake_ledger::*;

pub const PEER: u64 = 7;
pub const BLOCK_SPACING: u32 = 60;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub struct Harness {
    pub node: LedgerNode,
    pub clock: Arc<ManualClock>,
    pub params: ChainParams,
    pub key: SecretKey,
    pub pubkey: Vec<u8>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_params(ChainParams::regtest())
    }

    pub fn with_params(params: ChainParams) -> Self {
        Self::with_store(params, MemoryStore::new())
    }

    pub fn with_store(params: ChainParams, store: MemoryStore) -> Self {
        init_logging();
        let clock = Arc::new(ManualClock::new(params.genesis_time as i64));
        let node = LedgerNode::new(params.clone(), Box::new(store), clock.clone()).unwrap();
        let key = SecretKey::from_slice(&[0x42; 32]).unwrap();
        let pubkey = PublicKey::from_secret_key(&Secp256k1::new(), &key).serialize().to_vec();
        Self { node, clock, params, key, pubkey }
    }

    pub fn script_pubkey(&self) -> Vec<u8> {
        pay_to_pubkey(&self.pubkey)
    }

    /// Height and time of an indexed block
    pub fn block_info(&self, hash: &Hash) -> (u32, u32) {
        self.node.with_chain(|chain| {
            let id = chain.index().lookup(hash).unwrap();
            let node = chain.index().node(id);
            (node.height, node.time())
        })
    }

    /// Proof-of-work block on `prev` paying subsidy plus `fees` to our key
    pub fn build_block(&self, prev: Hash, transactions: Vec<Transaction>, fees: i64, tag: u8) -> Block {
        let (prev_height, prev_time) = self.block_info(&prev);
        let height = prev_height + 1;
        let bits = self.node.with_chain(|chain| {
            let prev_id = chain.index().lookup(&prev);
            next_target_required(chain.index(), prev_id, false, chain.params())
        });

        let mut script_sig = push_data(&height.to_le_bytes());
        script_sig.push(tag);
        let coinbase = Transaction {
            version: 1,
            inputs: vec![TransactionInput::new(OutPoint::null(), script_sig)],
            outputs: vec![TransactionOutput::new(
                proof_of_work_subsidy(height, &self.params) + fees,
                self.script_pubkey(),
            )],
            lock_time: 0,
        };
        let mut txs = vec![coinbase];
        txs.extend(transactions);

        let mut block = Block {
            header: BlockHeader {
                version: 1,
                prev_block_hash: prev,
                merkle_root: merkle_root(&txs),
                timestamp: prev_time + BLOCK_SPACING,
                bits,
                nonce: 0,
            },
            transactions: txs,
            signature: Vec::new(),
        };
        let target = compact_to_target(bits).unwrap();
        while hash_to_u256(&block.hash()) > target {
            block.header.nonce += 1;
        }
        block
    }

    /// Feed a block, moving the clock up to its timestamp first
    pub fn submit(&self, block: &Block) -> ProcessOutcome {
        let time = block.header.timestamp as i64;
        if self.clock.now() < time {
            self.clock.set(time);
        }
        self.node.process_block(PEER, block)
    }

    /// Mine one block on the tip and require it to be accepted
    pub fn mine(&self, transactions: Vec<Transaction>, fees: i64) -> Block {
        let block = self.build_block(self.node.best_hash(), transactions, fees, 0);
        assert_eq!(self.submit(&block), ProcessOutcome::Accepted);
        block
    }

    pub fn mine_empty(&self, count: usize) -> Vec<Block> {
        (0..count).map(|_| self.mine(Vec::new(), 0)).collect()
    }

    /// Spend `prevout` (paying to our key) into the given outputs
    pub fn spend(&self, prevout: OutPoint, prev_script: &[u8], outputs: Vec<TransactionOutput>) -> Transaction {
        let mut tx = Transaction {
            version: 1,
            inputs: vec![TransactionInput::new(prevout, Vec::new())],
            outputs,
            lock_time: 0,
        };
        tx.inputs[0].script_sig = push_data(&self.sign(&tx, 0, prev_script));
        tx
    }

    /// Signature plus hash type for input `index` of `tx`
    pub fn sign(&self, tx: &Transaction, index: usize, script_code: &[u8]) -> Vec<u8> {
        let hash = signature_hash(script_code, tx, index, SIGHASH_ALL as u32);
        let message = Message::from_digest_slice(&hash).unwrap();
        let mut sig = Secp256k1::new().sign_ecdsa(&message, &self.key).serialize_der().to_vec();
        sig.push(SIGHASH_ALL);
        sig
    }

    /// Proof-of-stake block on `prev` staking output 0 of `source`
    pub fn build_stake_block(&self, prev: Hash, source: &Transaction, time_offset: u32) -> Block {
        let (prev_height, prev_time) = self.block_info(&prev);
        let height = prev_height + 1;
        let bits = self.node.with_chain(|chain| {
            let prev_id = chain.index().lookup(&prev);
            next_target_required(chain.index(), prev_id, true, chain.params())
        });

        let value = source.outputs[0].value;
        let coinstake = self.spend(
            OutPoint::new(source.hash(), 0),
            &source.outputs[0].script_pubkey,
            vec![TransactionOutput::empty(), TransactionOutput::new(value, self.script_pubkey())],
        );
        let coinbase = Transaction {
            version: 1,
            inputs: vec![TransactionInput::new(OutPoint::null(), push_data(&height.to_le_bytes()))],
            outputs: vec![TransactionOutput::empty()],
            lock_time: 0,
        };
        let txs = vec![coinbase, coinstake];
        let mut block = Block {
            header: BlockHeader {
                version: 1,
                prev_block_hash: prev,
                merkle_root: merkle_root(&txs),
                timestamp: prev_time + time_offset,
                bits,
                nonce: 0,
            },
            transactions: txs,
            signature: Vec::new(),
        };
        sign_block(&mut block, &self.key).unwrap();
        block
    }
}
