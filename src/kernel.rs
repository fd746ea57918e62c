//! Proof-of-stake kernel
//!
//! A coinstake proves its right to mint a block by hashing a kernel built from
//! the stake modifier, the staked output and the block time, and showing that
//! the hash falls below the target scaled by the output's coin-day weight.
//!
//! The stake modifier is a 64-bit value mixed from the entropy bits of blocks
//! selected pseudo-randomly out of a window of past blocks. It is regenerated
//! once per modifier interval and prevents a staker from precomputing future
//! kernels at the time the output is confirmed.

use std::collections::HashSet;

use log::debug;
use primitive_types::{U256, U512};

use crate::chain_index::{ChainIndex, NodeId};
use crate::config::ChainParams;
use crate::constants::{CENT, COIN, SECONDS_PER_DAY};
use crate::error::{ConsensusError, Result};
use crate::pow::{compact_to_target, hash_to_u256};
use crate::serialize::sha256d_concat;
use crate::types::{short_hash, Hash, OutPoint};

/// Ratio of group interval length between the last group and the first group
pub const MODIFIER_INTERVAL_RATIO: i64 = 3;

/// Length of selection round `section` (0..64)
pub fn selection_interval_section(section: u32, modifier_interval: u32) -> i64 {
    let section = section as i64;
    modifier_interval as i64 * 63 / (63 + ((63 - section) * (MODIFIER_INTERVAL_RATIO - 1)))
}

/// Total length of the 64 selection rounds
pub fn selection_interval(modifier_interval: u32) -> i64 {
    (0..64).map(|k| selection_interval_section(k, modifier_interval)).sum()
}

/// Entropy bit contributed by a block: the lowest bit of its hash
pub fn stake_entropy_bit(block_hash: &Hash) -> bool {
    block_hash[0] & 1 == 1
}

/// Walk back from `id` to the latest block that generated a modifier
fn last_stake_modifier(index: &ChainIndex, mut id: NodeId) -> Result<(u64, u32)> {
    loop {
        let node = index.node(id);
        if node.generated_modifier {
            return Ok((node.stake_modifier, node.time()));
        }
        match node.prev {
            Some(prev) => id = prev,
            None => {
                return Err(ConsensusError::MissingStakeData(
                    "no stake modifier generated at genesis".to_string(),
                ))
            }
        }
    }
}

/// Pick the candidate with the smallest selection hash among those not yet
/// selected; once one is found, later candidates past `stop` are ignored
fn select_block_from_candidates(
    index: &ChainIndex,
    sorted: &[(u32, Hash)],
    selected: &HashSet<Hash>,
    stop: i64,
    prev_modifier: u64,
) -> Option<NodeId> {
    let mut best: Option<(U256, NodeId)> = None;
    for (time, hash) in sorted {
        if best.is_some() && *time as i64 > stop {
            break;
        }
        if selected.contains(hash) {
            continue;
        }
        let Some(id) = index.lookup(hash) else {
            continue;
        };
        let node = index.node(id);
        let proof = if node.is_pos { node.hash_proof } else { node.hash };
        let mut selection = hash_to_u256(&sha256d_concat(&[&proof, &prev_modifier.to_le_bytes()]));
        // favour proof-of-stake blocks
        if node.is_pos {
            selection >>= 32;
        }
        match best {
            Some((best_hash, _)) if selection >= best_hash => {}
            _ => best = Some((selection, id)),
        }
    }
    best.map(|(_, id)| id)
}

/// ComputeNextStakeModifier
///
/// Modifier for the child of `prev` (`None` for genesis). Returns the modifier
/// and whether it was newly generated:
/// 1. Genesis gets modifier zero, marked as generated
/// 2. Keep the last modifier while still inside its interval
/// 3. Otherwise sort the blocks of the selection window by (time, hash) and
///    run 64 selection rounds, one entropy bit per round
pub fn compute_next_stake_modifier(
    index: &ChainIndex,
    prev: Option<NodeId>,
    params: &ChainParams,
) -> Result<(u64, bool)> {
    let Some(prev) = prev else {
        return Ok((0, true));
    };
    let interval = params.modifier_interval.max(1);
    let (modifier, modifier_time) = last_stake_modifier(index, prev)?;
    let prev_time = index.node(prev).time();
    if modifier_time / interval >= prev_time / interval {
        return Ok((modifier, false));
    }

    let window = selection_interval(interval);
    let window_start = (prev_time / interval * interval) as i64 - window;

    let mut candidates = Vec::new();
    let mut cursor = Some(prev);
    while let Some(id) = cursor {
        let node = index.node(id);
        if (node.time() as i64) < window_start {
            break;
        }
        candidates.push((node.time(), node.hash));
        cursor = node.prev;
    }
    candidates.reverse();
    candidates.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| hash_to_u256(&a.1).cmp(&hash_to_u256(&b.1))));

    let mut new_modifier = 0u64;
    let mut stop = window_start;
    let mut selected = HashSet::new();
    let rounds = candidates.len().min(64) as u32;
    for round in 0..rounds {
        stop += selection_interval_section(round, interval);
        let chosen = select_block_from_candidates(index, &candidates, &selected, stop, modifier)
            .ok_or_else(|| {
                ConsensusError::MissingStakeData(format!("unable to select block at round {}", round))
            })?;
        let node = index.node(chosen);
        if node.entropy_bit {
            new_modifier |= 1u64 << round;
        }
        selected.insert(node.hash);
    }

    debug!(
        "new stake modifier {:016x} at time {} from {} candidates",
        new_modifier,
        prev_time,
        candidates.len()
    );
    Ok((new_modifier, true))
}

/// Modifier a kernel must use when its stake comes from block `from`
///
/// The first modifier generated at least one selection interval after `from`,
/// found by walking forward along the branch that ends at `branch_tip`. The
/// result is indeterminate while the branch is not yet long enough.
pub fn kernel_stake_modifier(
    index: &ChainIndex,
    from: NodeId,
    branch_tip: NodeId,
    params: &ChainParams,
) -> Result<u64> {
    let from_node = index.node(from);
    let deadline = from_node.time() as i64 + selection_interval(params.modifier_interval.max(1));

    let mut path = Vec::new();
    let mut cursor = Some(branch_tip);
    while let Some(id) = cursor {
        if id == from {
            break;
        }
        let node = index.node(id);
        if node.height <= from_node.height {
            return Err(ConsensusError::MissingStakeData(format!(
                "stake source {} is not on this branch",
                short_hash(&from_node.hash)
            )));
        }
        path.push(id);
        cursor = node.prev;
    }
    if cursor.is_none() {
        return Err(ConsensusError::MissingStakeData("stake source is not an ancestor".to_string()));
    }

    let mut modifier_time = from_node.time() as i64;
    let mut modifier = from_node.stake_modifier;
    for id in path.into_iter().rev() {
        if modifier_time >= deadline {
            break;
        }
        let node = index.node(id);
        if node.generated_modifier {
            modifier_time = node.time() as i64;
            modifier = node.stake_modifier;
        }
    }
    if modifier_time < deadline {
        return Err(ConsensusError::MissingStakeData(format!(
            "stake modifier for {} not yet generated",
            short_hash(&from_node.hash)
        )));
    }
    Ok(modifier)
}

/// Coin-day weight of a staked output at `tx_time`
pub fn coin_day_weight(value: i64, from_time: u32, tx_time: u32, params: &ChainParams) -> u128 {
    let age = (tx_time as i64 - from_time as i64).min(params.stake_max_age as i64);
    let weight_time = (age - params.stake_min_age as i64).max(0);
    (value.max(0) as u128) * (weight_time as u128) / (COIN as u128) / (SECONDS_PER_DAY as u128)
}

/// The kernel hash: modifier ‖ source block time ‖ prevout ‖ coinstake time
pub fn kernel_hash(modifier: u64, block_from_time: u32, prevout: &OutPoint, tx_time: u32) -> Hash {
    sha256d_concat(&[
        &modifier.to_le_bytes(),
        &block_from_time.to_le_bytes(),
        &prevout.hash,
        &prevout.index.to_le_bytes(),
        &tx_time.to_le_bytes(),
    ])
}

/// CheckStakeKernelHash
///
/// 1. The coinstake may not predate its source and the source must be at
///    least the minimum stake age old
/// 2. Hash the kernel
/// 3. Accept iff hash ≤ target × coin-day weight (512-bit comparison)
///
/// Returns the kernel hash, which becomes the block's proof hash.
pub fn check_stake_kernel_hash(
    bits: u32,
    modifier: u64,
    block_from_time: u32,
    prev_value: i64,
    prevout: &OutPoint,
    tx_time: u32,
    params: &ChainParams,
) -> Result<Hash> {
    if tx_time < block_from_time {
        return Err(ConsensusError::violation("kernel time violation", 100));
    }
    if block_from_time as u64 + params.stake_min_age as u64 > tx_time as u64 {
        return Err(ConsensusError::violation("kernel min age violation", 100));
    }

    let target = compact_to_target(bits)
        .ok_or_else(|| ConsensusError::structural("invalid stake target", 100))?;
    let weight = coin_day_weight(prev_value, block_from_time, tx_time, params);
    let hash = kernel_hash(modifier, block_from_time, prevout, tx_time);

    let weight = U256::from(weight);
    let bound: U512 = target.full_mul(weight);
    if U512::from(hash_to_u256(&hash)) > bound {
        return Err(ConsensusError::violation("kernel hash above target", 1));
    }
    Ok(hash)
}

/// GetCoinAge
///
/// Coin-days consumed by a transaction: Σ value × age / CENT over inputs older
/// than the minimum stake age, converted from cent-seconds to coin-days.
pub fn coin_age(inputs: &[(i64, u32)], tx_time: u32, params: &ChainParams) -> Result<u64> {
    let mut cent_seconds: u128 = 0;
    for &(value, from_time) in inputs {
        if tx_time < from_time {
            return Err(ConsensusError::violation("coin age timestamp violation", 100));
        }
        if from_time as u64 + params.stake_min_age as u64 > tx_time as u64 {
            continue;
        }
        cent_seconds += value.max(0) as u128 * (tx_time - from_time) as u128 / CENT as u128;
    }
    let coin_days = cent_seconds * CENT as u128 / COIN as u128 / SECONDS_PER_DAY as u128;
    Ok(coin_days.min(u64::MAX as u128) as u64)
}

/// Running checksum over the stake modifier chain: the top 32 bits of
/// sha256d(previous checksum ‖ flags ‖ proof hash ‖ modifier)
pub fn stake_modifier_checksum(prev_checksum: Option<u32>, flags: u32, hash_proof: &Hash, modifier: u64) -> u32 {
    let prev = prev_checksum.map(u32::to_le_bytes);
    let prev_bytes: &[u8] = match &prev {
        Some(bytes) => bytes,
        None => &[],
    };
    let hash = sha256d_concat(&[prev_bytes, &flags.to_le_bytes(), hash_proof, &modifier.to_le_bytes()]);
    (hash_to_u256(&hash) >> 224).low_u32()
}
