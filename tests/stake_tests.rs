//! Proof-of-stake blocks on a regtest chain

mod common;

use common::*;
use secp256k1::SecretKey;
use stake_ledger::block::{merkle_root, sign_block};
use stake_ledger::*;

/// Chain of `count` work blocks; the first coinbase is the stake source
fn staking_harness(params: ChainParams, count: usize) -> (Harness, Transaction) {
    let harness = Harness::with_params(params);
    let blocks = harness.mine_empty(count);
    let source = blocks[0].transactions[0].clone();
    (harness, source)
}

#[test]
fn test_stake_block_accepted() {
    let (harness, source) = staking_harness(ChainParams::regtest(), 55);
    let block = harness.build_stake_block(harness.node.best_hash(), &source, BLOCK_SPACING);
    assert!(block.is_proof_of_stake());

    assert_eq!(harness.submit(&block), ProcessOutcome::Accepted);
    assert_eq!(harness.node.best_hash(), block.hash());
    assert_eq!(harness.node.best_height(), 56);

    harness.node.with_chain(|chain| {
        let tip = chain.best_node();
        assert!(tip.is_pos);
        assert_eq!(tip.stake, block.proof_of_stake());
        assert_ne!(tip.hash_proof, NULL_HASH);
        assert!(chain.is_stake_seen(&(OutPoint::new(source.hash(), 0), block.header.timestamp)));
        let spent = chain.store().output_state(&OutPoint::new(source.hash(), 0)).unwrap();
        assert!(matches!(spent, Some(Some(_))));
    });

    // work blocks still extend a stake tip
    harness.mine_empty(1);
    assert_eq!(harness.node.best_height(), 57);
}

#[test]
fn test_duplicate_stake_rejected() {
    let (harness, source) = staking_harness(ChainParams::regtest(), 55);
    let prev = harness.node.best_hash();
    let block = harness.build_stake_block(prev, &source, BLOCK_SPACING);
    assert_eq!(harness.submit(&block), ProcessOutcome::Accepted);

    // same kernel, different block
    let mut copy = block.clone();
    copy.transactions[0].inputs[0].script_sig.push(0x01);
    copy.header.merkle_root = merkle_root(&copy.transactions);
    sign_block(&mut copy, &harness.key).unwrap();
    assert_ne!(copy.hash(), block.hash());

    match harness.submit(&copy) {
        ProcessOutcome::Rejected { dos, reason } => {
            assert_eq!(dos, 0);
            assert!(reason.contains("duplicate proof-of-stake"), "{}", reason);
        }
        other => panic!("unexpected {:?}", other),
    }
    assert!(!harness.node.has_block(&copy.hash()));
}

#[test]
fn test_stake_block_signed_by_wrong_key() {
    let (harness, source) = staking_harness(ChainParams::regtest(), 55);
    let mut block = harness.build_stake_block(harness.node.best_hash(), &source, BLOCK_SPACING);
    let other = SecretKey::from_slice(&[0x24; 32]).unwrap();
    sign_block(&mut block, &other).unwrap();

    match harness.submit(&block) {
        ProcessOutcome::Rejected { dos, reason } => {
            assert_eq!(dos, 100);
            assert!(reason.contains("signature"), "{}", reason);
        }
        other => panic!("unexpected {:?}", other),
    }

    // the stake itself is still usable
    let good = harness.build_stake_block(harness.node.best_hash(), &source, BLOCK_SPACING);
    assert_eq!(harness.submit(&good), ProcessOutcome::Accepted);
}

#[test]
fn test_stake_below_min_age_rejected() {
    let mut params = ChainParams::regtest();
    params.stake_min_age = 100_000;
    params.stake_max_age = 200_000;
    let (harness, source) = staking_harness(params, 55);
    let block = harness.build_stake_block(harness.node.best_hash(), &source, BLOCK_SPACING);

    match harness.submit(&block) {
        ProcessOutcome::Rejected { dos, reason } => {
            assert_eq!(dos, 100);
            assert!(reason.contains("min age"), "{}", reason);
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(harness.node.best_height(), 55);
}

#[test]
fn test_stake_of_immature_coinbase_rejected() {
    // 20 blocks satisfy the kernel age but not coinbase maturity
    let (harness, source) = staking_harness(ChainParams::regtest(), 20);
    let block = harness.build_stake_block(harness.node.best_hash(), &source, BLOCK_SPACING);
    match harness.submit(&block) {
        ProcessOutcome::Rejected { reason, .. } => assert!(reason.contains("immature"), "{}", reason),
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(harness.node.best_height(), 20);
}

#[test]
fn test_evicted_stake_orphan_can_return() {
    let mut params = ChainParams::regtest();
    params.max_orphan_blocks = 1;
    let source = Harness::with_params(params.clone());
    let blocks = source.mine_empty(55);
    let parent = blocks[54].hash();
    let stake = source.build_stake_block(parent, &blocks[0].transactions[0], BLOCK_SPACING);

    let harness = Harness::with_params(params);
    for block in &blocks[..54] {
        assert_eq!(harness.submit(block), ProcessOutcome::Accepted);
    }

    // a full buffer evicts at random, sometimes the block just inserted
    for tag in 1..=8u8 {
        let rival = source.build_block(parent, Vec::new(), 0, tag);
        assert_eq!(harness.submit(&rival), ProcessOutcome::Orphan { request: parent });
        match harness.submit(&stake) {
            ProcessOutcome::Orphan { request } => assert_eq!(request, parent),
            ProcessOutcome::AlreadyKnown => {}
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(harness.node.orphan_block_count(), 1);
        assert!(harness.node.orphan_stake_count() <= 1);
    }

    assert_eq!(harness.submit(&blocks[54]), ProcessOutcome::Accepted);
    if harness.node.best_hash() != stake.hash() {
        assert_eq!(harness.submit(&stake), ProcessOutcome::Accepted);
    }
    assert_eq!(harness.node.best_hash(), stake.hash());
    assert_eq!(harness.node.best_height(), 56);
    assert_eq!(harness.node.orphan_stake_count(), 0);
}
