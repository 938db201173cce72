use actix_web::{HttpResponse, Responder, get, web};

use super::models::{AppState, BestGiverResponse, StatsResponse};

#[get("/stats/")]
pub async fn get_stats(state: web::Data<AppState>) -> impl Responder {
    let best = state.best.snapshot();
    let snap = state.stats.snapshot();

    HttpResponse::Ok().json(StatsResponse {
        wallet: state.wallet.clone(),
        giver_set: state.giver_set.to_string(),
        giver_count: state.giver_count,
        best_giver: (!best.is_empty()).then(|| BestGiverResponse {
            address: best.address.clone(),
            coins_per_hash: best.coins_per_hash,
        }),
        attempts: snap.attempts,
        not_mined: snap.not_mined,
        mined: snap.mined,
        stale: snap.stale,
        sends_ok: snap.sends_ok,
        sends_failed: snap.sends_failed,
        last_mined_at: snap.last_mined_at.map(|t| t.to_rfc3339()),
    })
}
