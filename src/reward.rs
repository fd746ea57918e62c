//! Minting rules: proof-of-work subsidy and proof-of-stake interest

use crate::config::ChainParams;
use crate::constants::*;

/// GetProofOfWorkReward: ℕ → ℤ
///
/// Subsidy for a work block at `height`, halving every
/// `subsidy_halving_interval` blocks:
///
/// subsidy = S × 2^(-⌊h/H⌋), zero after 64 halvings
///
/// Fees are added on top by the caller.
pub fn proof_of_work_subsidy(height: u32, params: &ChainParams) -> i64 {
    let halvings = height / params.subsidy_halving_interval.max(1);
    if halvings >= 64 {
        return 0;
    }
    params.pow_subsidy >> halvings
}

/// GetProofOfStakeReward
///
/// Interest on consumed coin age at MAX_MINT_PROOF_OF_STAKE per coin-year:
///
/// reward = coin_age × 33 / (365 × 33 + 8) × rate
///
/// The 33/(365·33+8) factor is one over the mean year length in days.
pub fn proof_of_stake_reward(coin_age: u64) -> i64 {
    let reward = coin_age as i128 * 33 / (365 * 33 + 8) * MAX_MINT_PROOF_OF_STAKE as i128;
    reward.min(MAX_MONEY as i128) as i64
}

/// Total proof-of-work subsidy issued by heights 0..=height
pub fn total_work_subsidy(height: u32, params: &ChainParams) -> i64 {
    let interval = params.subsidy_halving_interval.max(1) as i64;
    let mut total = 0i64;
    let mut start = 0i64;
    let end = height as i64 + 1;
    while start < end {
        let subsidy = proof_of_work_subsidy(start as u32, params);
        if subsidy == 0 {
            break;
        }
        let era_end = ((start / interval) + 1) * interval;
        let blocks = era_end.min(end) - start;
        total = total.saturating_add(subsidy.saturating_mul(blocks));
        start = era_end;
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subsidy_halves() {
        let params = ChainParams::regtest();
        let initial = params.pow_subsidy;
        assert_eq!(proof_of_work_subsidy(0, &params), initial);
        assert_eq!(proof_of_work_subsidy(149, &params), initial);
        assert_eq!(proof_of_work_subsidy(150, &params), initial / 2);
        assert_eq!(proof_of_work_subsidy(150 * 64, &params), 0);
    }

    #[test]
    fn test_total_work_subsidy() {
        let params = ChainParams::regtest();
        let initial = params.pow_subsidy;
        assert_eq!(total_work_subsidy(0, &params), initial);
        assert_eq!(total_work_subsidy(151, &params), 150 * initial + 2 * (initial / 2));
        let brute: i64 = (0..=400).map(|h| proof_of_work_subsidy(h, &params)).sum();
        assert_eq!(total_work_subsidy(400, &params), brute);
    }

    #[test]
    fn test_stake_reward() {
        // one coin-year earns the yearly rate, less integer truncation
        assert_eq!(proof_of_stake_reward(0), 0);
        assert_eq!(proof_of_stake_reward(366), MAX_MINT_PROOF_OF_STAKE);
        assert_eq!(proof_of_stake_reward(365 * 10), 9 * MAX_MINT_PROOF_OF_STAKE);
    }

    #[test]
    fn test_supply_stays_in_range() {
        let params = ChainParams::mainnet();
        assert!(money_range(total_work_subsidy(u32::MAX - 1, &params)));
    }
}
