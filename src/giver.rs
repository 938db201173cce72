use num_bigint::BigUint;
use num_traits::{ToPrimitive, Zero};
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::config::ConfigError;
use crate::error::RpcError;
use crate::retry::call_for_success;
use crate::rpc::{Backend, BlockRef, StackEntry, StackReader};

/// Get-method exposing the current proof-of-work challenge.
pub const POW_PARAMS_METHOD: &str = "get_pow_params";

/// Hash space the giver complexity is measured against.
pub const TOTAL_DIFF: &str =
    "115792089237277217110272752943501742914102634520085823245724998868298727686144";

pub fn total_difficulty() -> BigUint {
    BigUint::parse_bytes(TOTAL_DIFF.as_bytes(), 10).expect("TOTAL_DIFF is a valid decimal")
}

/// Which of the three published giver lists to mine against.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum GiverSet {
    Small,
    Medium,
    #[default]
    Large,
}

impl GiverSet {
    /// Key of this set in the givers file.
    pub fn key(&self) -> &'static str {
        match self {
            GiverSet::Small => "100",
            GiverSet::Medium => "1000",
            GiverSet::Large => "10000",
        }
    }
}

impl FromStr for GiverSet {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "100" | "small" => Ok(GiverSet::Small),
            "1000" | "medium" => Ok(GiverSet::Medium),
            "10000" | "large" => Ok(GiverSet::Large),
            other => Err(ConfigError::InvalidConfig(format!(
                "GIVERS must be 100, 1000 or 10000, got `{other}`"
            ))),
        }
    }
}

impl fmt::Display for GiverSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// A giver contract and the reward it pays per accepted proof.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Giver {
    pub address: String,
    pub reward: f64,
}

/// Pick one set out of a givers document (`{"100": [...], "1000": [...], "10000": [...]}`).
pub fn parse_givers(json: &str, set: GiverSet) -> Result<Vec<Giver>, ConfigError> {
    let mut sets: HashMap<String, Vec<Giver>> = serde_json::from_str(json)
        .map_err(|e| ConfigError::InvalidConfig(format!("givers file: {e}")))?;
    let givers = sets.remove(set.key()).unwrap_or_default();
    if givers.is_empty() {
        return Err(ConfigError::InvalidConfig(format!(
            "givers file has no entries for set {set}"
        )));
    }
    if let Some(bad) = givers
        .iter()
        .find(|g| g.address.trim().is_empty() || !g.reward.is_finite() || g.reward <= 0.0)
    {
        return Err(ConfigError::InvalidConfig(format!(
            "giver `{}` needs a non-empty address and a positive reward",
            bad.address
        )));
    }
    Ok(givers)
}

pub fn load_givers(path: &Path, set: GiverSet) -> Result<Vec<Giver>, ConfigError> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::MissingConfig(format!("{}: {e}", path.display())))?;
    parse_givers(&raw, set)
}

/// Proof-of-work challenge as published by a giver at one point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PowParams {
    pub seed: BigUint,
    pub complexity: BigUint,
    pub iterations: BigUint,
}

impl PowParams {
    pub fn from_stack(stack: &[StackEntry]) -> Result<Self, RpcError> {
        let mut reader = StackReader::new(stack);
        let mut next = |field: &str| -> Result<BigUint, RpcError> {
            reader
                .read_big_number()?
                .to_biguint()
                .ok_or_else(|| RpcError::Decode(format!("negative {field}")))
        };
        Ok(Self {
            seed: next("seed")?,
            complexity: next("complexity")?,
            iterations: next("iterations")?,
        })
    }

    /// Expected hashes for one proof: `total / complexity`.
    pub fn hashes_needed(&self, total: &BigUint) -> Option<BigUint> {
        if self.complexity.is_zero() {
            return None;
        }
        Some(total / &self.complexity)
    }

    /// Reward per expected hash, or `None` when it is not a usable positive number.
    pub fn coins_per_hash(&self, reward: f64, total: &BigUint) -> Option<f64> {
        let hashes = self.hashes_needed(total)?.to_f64()?;
        let coins = reward / hashes;
        (coins.is_finite() && coins > 0.0).then_some(coins)
    }
}

/// One `get_pow_params` call at a fixed head.
pub async fn pow_params_at(
    backend: &dyn Backend,
    block: BlockRef,
    address: &str,
) -> Result<PowParams, RpcError> {
    let stack = backend.run_method(block, address, POW_PARAMS_METHOD).await?;
    PowParams::from_stack(&stack)
}

/// Fresh parameters at the latest head, both calls retried.
pub async fn fetch_pow_params(backend: &dyn Backend, address: &str) -> Result<PowParams, RpcError> {
    let head = call_for_success(|| backend.last_block()).await?;
    call_for_success(|| pow_params_at(backend, head, address)).await
}
