//! Chain parameters
//!
//! Everything a node needs to agree with its peers on which blocks are valid,
//! plus the local policy knobs (orphan limits, free relay, ban threshold).
//! Presets exist for the main network, the test network and a regression-test
//! network with trivial proof-of-work; any field may be overridden from JSON.

use std::path::Path;

use anyhow::Context;
use primitive_types::U256;
use serde::{Deserialize, Serialize};

use crate::constants::{COIN, COINBASE_MATURITY, MAX_CLOCK_DRIFT};
use crate::pow::compact_to_target;

/// Hash pin at a height
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub height: u32,
    /// Display-order hex
    pub hash: String,
}

/// Stake modifier checksum pin at a height
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModifierCheckpoint {
    pub height: u32,
    pub checksum: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainParams {
    pub network: String,

    /// Proof-of-work target limit, compact form
    pub pow_limit_bits: u32,
    /// Proof-of-stake target limit, compact form
    pub pos_limit_bits: u32,
    /// Keep every target at its limit (regression testing)
    pub no_retargeting: bool,

    pub stake_target_spacing: u32,
    /// Upper bound of the proof-of-work spacing
    pub work_target_spacing_max: u32,
    pub target_timespan: u32,

    pub stake_min_age: u32,
    pub stake_max_age: u32,
    pub modifier_interval: u32,

    pub coinbase_maturity: u32,
    pub max_clock_drift: u32,

    /// Initial proof-of-work subsidy in base units
    pub pow_subsidy: i64,
    /// Blocks between subsidy halvings
    pub subsidy_halving_interval: u32,

    pub genesis_time: u32,
    pub genesis_nonce: u32,
    /// Expected genesis hash (display-order hex), verified at startup when set
    pub genesis_hash: Option<String>,

    pub checkpoints: Vec<Checkpoint>,
    pub stake_modifier_checkpoints: Vec<ModifierCheckpoint>,

    pub max_orphan_transactions: usize,
    pub max_orphan_blocks: usize,
    /// Seed for orphan eviction
    pub orphan_seed: u64,

    /// Free relay budget in thousands of bytes per minute
    pub limit_free_relay: u32,
    pub ban_threshold: u32,
    pub accept_nonstandard: bool,
}

impl Default for ChainParams {
    fn default() -> Self {
        Self::mainnet()
    }
}

impl ChainParams {
    pub fn mainnet() -> Self {
        ChainParams {
            network: "main".to_string(),
            pow_limit_bits: 0x1e0f_ffff,
            pos_limit_bits: 0x1e0f_ffff,
            no_retargeting: false,
            stake_target_spacing: 20,
            work_target_spacing_max: 120,
            target_timespan: 7 * 24 * 60 * 60,
            stake_min_age: 24 * 60 * 60,
            stake_max_age: 30 * 24 * 60 * 60,
            modifier_interval: 10 * 60,
            coinbase_maturity: COINBASE_MATURITY,
            max_clock_drift: MAX_CLOCK_DRIFT,
            pow_subsidy: 1_000 * COIN,
            subsidy_halving_interval: 525_600,
            genesis_time: 1_398_357_357,
            genesis_nonce: 0,
            genesis_hash: None,
            checkpoints: Vec::new(),
            stake_modifier_checkpoints: Vec::new(),
            max_orphan_transactions: 10_000,
            max_orphan_blocks: 750,
            orphan_seed: 0x5eed_0f_0a11,
            limit_free_relay: 15,
            ban_threshold: 100,
            accept_nonstandard: false,
        }
    }

    pub fn testnet() -> Self {
        ChainParams {
            network: "test".to_string(),
            stake_min_age: 60 * 60,
            modifier_interval: 60,
            genesis_time: 1_398_357_000,
            accept_nonstandard: true,
            ..Self::mainnet()
        }
    }

    /// Trivial targets and short stake ages
    pub fn regtest() -> Self {
        ChainParams {
            network: "regtest".to_string(),
            pow_limit_bits: 0x207f_ffff,
            pos_limit_bits: 0x207f_ffff,
            no_retargeting: true,
            stake_min_age: 60,
            stake_max_age: 24 * 60 * 60,
            modifier_interval: 10,
            pow_subsidy: 1_000 * COIN,
            subsidy_halving_interval: 150,
            genesis_time: 1_400_000_000,
            max_orphan_transactions: 100,
            max_orphan_blocks: 100,
            ..Self::mainnet()
        }
    }

    pub fn pow_limit(&self) -> U256 {
        compact_to_target(self.pow_limit_bits).unwrap_or_default()
    }

    pub fn pos_limit(&self) -> U256 {
        compact_to_target(self.pos_limit_bits).unwrap_or_default()
    }

    /// Retarget averaging window, in blocks
    pub fn target_interval(&self, proof_of_stake: bool) -> u32 {
        let spacing = if proof_of_stake {
            self.stake_target_spacing
        } else {
            self.work_target_spacing_max
        };
        self.target_timespan / spacing.max(1)
    }

    /// Parse parameters from JSON; missing fields take the mainnet value
    pub fn from_json_str(json: &str) -> anyhow::Result<Self> {
        let params: ChainParams = serde_json::from_str(json).context("invalid chain parameters")?;
        params.validate()?;
        Ok(params)
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("reading chain parameters from {}", path.display()))?;
        Self::from_json_str(&json).with_context(|| format!("loading {}", path.display()))
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            compact_to_target(self.pow_limit_bits).is_some(),
            "pow_limit_bits {:#010x} is not a valid target",
            self.pow_limit_bits
        );
        anyhow::ensure!(
            compact_to_target(self.pos_limit_bits).is_some(),
            "pos_limit_bits {:#010x} is not a valid target",
            self.pos_limit_bits
        );
        anyhow::ensure!(self.stake_target_spacing > 0, "stake_target_spacing must be positive");
        anyhow::ensure!(self.modifier_interval > 0, "modifier_interval must be positive");
        anyhow::ensure!(
            self.stake_max_age > self.stake_min_age,
            "stake_max_age must exceed stake_min_age"
        );
        for checkpoint in &self.checkpoints {
            anyhow::ensure!(
                crate::types::hash_from_hex(&checkpoint.hash).is_some(),
                "checkpoint at height {} has a malformed hash",
                checkpoint.height
            );
        }
        Ok(())
    }
}
