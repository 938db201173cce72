use serde::Serialize;
use std::sync::Arc;

use crate::evaluator::SharedBest;
use crate::giver::GiverSet;
use crate::stats::MinerStats;

/// Read-only handles the status endpoints report from.
pub struct AppState {
    pub best: SharedBest,
    pub stats: Arc<MinerStats>,
    pub giver_set: GiverSet,
    pub giver_count: usize,
    pub wallet: String,
}

#[derive(Serialize)]
pub struct BestGiverResponse {
    pub address: String,
    pub coins_per_hash: f64,
}

#[derive(Serialize)]
pub struct StatsResponse {
    pub wallet: String,
    pub giver_set: String,
    pub giver_count: usize,
    pub best_giver: Option<BestGiverResponse>,
    pub attempts: u64,
    pub not_mined: u64,
    pub mined: u64,
    pub stale: u64,
    pub sends_ok: u64,
    pub sends_failed: u64,
    pub last_mined_at: Option<String>, // RFC3339
}
