//! Targets, proof of work, retargeting and block trust
//!
//! Targets are 256-bit unsigned integers carried in blocks in the compact
//! "bits" form; block hashes are compared against them as little-endian
//! integers. Both block kinds retarget every block with an exponential moving
//! adjustment toward their own spacing.

use primitive_types::{U256, U512};

use crate::chain_index::{ChainIndex, NodeId};
use crate::config::ChainParams;
use crate::error::{ConsensusError, Result};
use crate::types::Hash;

/// Interpret a hash as a little-endian 256-bit integer
pub fn hash_to_u256(hash: &Hash) -> U256 {
    U256::from_little_endian(hash)
}

/// Expand a compact target
///
/// The format is one size byte followed by a 3-byte mantissa whose top bit is
/// a sign: value = mantissa × 256^(size − 3). Returns `None` for negative or
/// overflowing encodings.
pub fn compact_to_target(bits: u32) -> Option<U256> {
    let size = bits >> 24;
    let word = bits & 0x007f_ffff;

    let negative = word != 0 && (bits & 0x0080_0000) != 0;
    let overflow = word != 0
        && (size > 34 || (word > 0xff && size > 33) || (word > 0xffff && size > 32));
    if negative || overflow {
        return None;
    }

    let target = if size <= 3 {
        U256::from(word >> (8 * (3 - size)))
    } else {
        U256::from(word) << (8 * (size - 3) as usize)
    };
    Some(target)
}

/// Compress a target into compact form
pub fn target_to_compact(target: U256) -> u32 {
    let mut size = (target.bits() + 7) / 8;
    let mut compact = if size <= 3 {
        (target.low_u64() << (8 * (3 - size))) as u32
    } else {
        (target >> (8 * (size - 3))).low_u64() as u32
    };
    // keep the sign bit clear
    if compact & 0x0080_0000 != 0 {
        compact >>= 8;
        size += 1;
    }
    compact | ((size as u32) << 24)
}

/// CheckProofOfWork
///
/// 1. The target must be positive and no easier than the proof-of-work limit
/// 2. The block hash, as an integer, must not exceed the target
pub fn check_proof_of_work(hash: &Hash, bits: u32, params: &ChainParams) -> Result<()> {
    let target = match compact_to_target(bits) {
        Some(target) if !target.is_zero() && target <= params.pow_limit() => target,
        _ => return Err(ConsensusError::structural("nBits below minimum work", 20)),
    };
    if hash_to_u256(hash) > target {
        return Err(ConsensusError::structural("proof of work failed", 50));
    }
    Ok(())
}

/// Trust contributed by a single block
///
/// Proof-of-stake blocks weigh 2^256 / (target + 1). Proof-of-work blocks
/// weigh pow_limit / (target + 1), with a floor of one, so that work blocks
/// alone never outweigh an honest stake history.
pub fn block_trust(bits: u32, proof_of_stake: bool, params: &ChainParams) -> U256 {
    let target = match compact_to_target(bits) {
        Some(target) if !target.is_zero() => target,
        _ => return U256::zero(),
    };
    let Some(divisor) = target.checked_add(U256::one()) else {
        return U256::one();
    };
    if proof_of_stake {
        // 2^256 / (t + 1) == (~t / (t + 1)) + 1
        (!target / divisor) + U256::one()
    } else {
        (params.pow_limit() / divisor).max(U256::one())
    }
}

/// Walk back from `id` to the nearest block of the requested kind (or genesis)
pub fn last_block_of_kind(index: &ChainIndex, mut id: NodeId, proof_of_stake: bool) -> NodeId {
    loop {
        let node = index.node(id);
        match node.prev {
            Some(prev) if node.is_pos != proof_of_stake => id = prev,
            _ => return id,
        }
    }
}

/// Spacing the next block of the given kind is aiming for
///
/// Proof-of-work spacing stretches with the number of blocks since the last
/// work block, capped at the configured maximum.
pub fn target_spacing(proof_of_stake: bool, height_gap: u32, params: &ChainParams) -> i64 {
    if proof_of_stake {
        params.stake_target_spacing as i64
    } else {
        let stretched = params.stake_target_spacing as i64 * (1 + height_gap as i64);
        stretched.min(params.work_target_spacing_max as i64)
    }
}

/// One retarget step
///
/// new = prev × ((interval − 1) × spacing + 2 × actual) / ((interval + 1) × spacing),
/// computed in 512-bit precision and capped at `limit`.
pub fn retarget(prev_target: U256, actual_spacing: i64, spacing: i64, timespan: i64, limit: U256) -> U256 {
    let spacing = spacing.max(1);
    let actual = if actual_spacing < 0 { spacing } else { actual_spacing };
    let interval = (timespan / spacing).max(1);

    let numerator = (interval - 1) * spacing + 2 * actual;
    let denominator = (interval + 1) * spacing;

    let scaled: U512 = prev_target.full_mul(U256::from(numerator as u64)) / U512::from(denominator as u64);
    match U256::try_from(scaled) {
        Ok(target) if target <= limit => target,
        _ => limit,
    }
}

/// GetNextTargetRequired
///
/// Compact target the child of `prev` must carry for the given kind:
/// 1. No parent, or fewer than two earlier blocks of that kind: the kind's limit
/// 2. Otherwise retarget the last block of that kind by the spacing between
///    it and the one before it
pub fn next_target_required(
    index: &ChainIndex,
    prev: Option<NodeId>,
    proof_of_stake: bool,
    params: &ChainParams,
) -> u32 {
    let limit = if proof_of_stake { params.pos_limit() } else { params.pow_limit() };
    let limit_bits = target_to_compact(limit);

    let Some(last) = prev else {
        return limit_bits;
    };
    if params.no_retargeting {
        return limit_bits;
    }

    let prev_kind = last_block_of_kind(index, last, proof_of_stake);
    let Some(before) = index.node(prev_kind).prev else {
        return limit_bits;
    };
    let prev_prev_kind = last_block_of_kind(index, before, proof_of_stake);
    if index.node(prev_prev_kind).prev.is_none() {
        return limit_bits;
    }

    let newer = index.node(prev_kind);
    let older = index.node(prev_prev_kind);
    let actual = newer.header.timestamp as i64 - older.header.timestamp as i64;
    let height_gap = index.node(last).height - newer.height;
    let spacing = target_spacing(proof_of_stake, height_gap, params);

    let prev_target = compact_to_target(newer.header.bits).unwrap_or(limit);
    target_to_compact(retarget(prev_target, actual, spacing, params.target_timespan as i64, limit))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compact_known_values() {
        assert_eq!(compact_to_target(0x1d00ffff), Some(U256::from(0xffffu64) << 208));
        assert_eq!(compact_to_target(0x01003456), Some(U256::zero()));
        assert_eq!(compact_to_target(0x01123456), Some(U256::from(0x12u64)));
        assert_eq!(compact_to_target(0x04923456), None);
        assert_eq!(compact_to_target(0xff123456), None);
    }

    #[test]
    fn test_compact_round_trip() {
        for bits in [0x1d00ffffu32, 0x1e0fffff, 0x207fffff, 0x1b0404cb, 0x05009234] {
            let target = compact_to_target(bits).unwrap();
            assert_eq!(target_to_compact(target), bits);
        }
    }

    #[test]
    fn test_compact_sign_bit_moves_to_size() {
        assert_eq!(target_to_compact(U256::from(0x80u64)), 0x02008000);
    }

    #[test]
    fn test_check_proof_of_work() {
        let params = ChainParams::regtest();
        let mut easy = [0u8; 32];
        easy[31] = 0x10;
        assert!(check_proof_of_work(&easy, params.pow_limit_bits, &params).is_ok());

        let hard = [0xffu8; 32];
        let err = check_proof_of_work(&hard, params.pow_limit_bits, &params).unwrap_err();
        assert_eq!(err.dos_score(), 50);

        // easier than the limit
        assert!(check_proof_of_work(&easy, 0x2100ffff, &params).is_err());
    }

    #[test]
    fn test_block_trust() {
        let params = ChainParams::mainnet();
        let bits = params.pow_limit_bits;
        // a work block at the limit is worth exactly one
        assert_eq!(block_trust(bits, false, &params), U256::one());
        let pos = block_trust(bits, true, &params);
        assert!(pos > U256::from(1u64 << 20));
        // harder targets are worth more
        let harder = target_to_compact(compact_to_target(bits).unwrap() >> 4);
        assert!(block_trust(harder, true, &params) > pos);
        assert!(block_trust(harder, false, &params) > U256::one());
    }

    #[test]
    fn test_retarget_direction() {
        let limit = U256::MAX >> 20;
        let prev = limit >> 8;
        let timespan = 7 * 24 * 3600;
        assert!(retarget(prev, 10, 20, timespan, limit) < prev);
        assert!(retarget(prev, 40, 20, timespan, limit) > prev);
        assert_eq!(retarget(prev, 20, 20, timespan, limit), prev);
        assert_eq!(retarget(limit, 1_000_000, 20, timespan, limit), limit);
    }

    #[test]
    fn test_target_spacing() {
        let params = ChainParams::mainnet();
        assert_eq!(target_spacing(true, 7, &params), 20);
        assert_eq!(target_spacing(false, 0, &params), 20);
        assert_eq!(target_spacing(false, 2, &params), 60);
        assert_eq!(target_spacing(false, 50, &params), 120);
    }
}
