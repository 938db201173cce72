mod api;
mod boc;
mod config;
mod error;
mod evaluator;
mod giver;
mod miner;
mod retry;
mod rpc;
mod stats;
mod submit;
mod wallet;

use actix_web::{App, HttpServer, web};
use log::{debug, error, info};
use std::sync::Arc;

use api::AppState;
use config::Config;
use error::MinerError;
use evaluator::{GiverEvaluator, SharedBest};
use miner::{MiningLoop, PowMiner};
use rpc::EndpointPool;
use rpc::pool::NetworkConnector;
use stats::MinerStats;
use submit::Submitter;
use wallet::{LocalSigner, WalletAccount};

#[actix_web::main]
async fn main() {
    let env_files = Config::load_env_files();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    for file in env_files {
        debug!("loaded settings from {file}");
    }

    if let Err(err) = run().await {
        error!("{err}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), MinerError> {
    let config = Config::from_env()?;
    let signer = LocalSigner::from_mnemonic(&config.mnemonic)?;
    let wallet = config.wallet_address.clone();
    info!("mining for wallet {wallet}");
    debug!("signing with key {}", signer.public_key_hex());
    let account = WalletAccount::new(wallet.clone(), Arc::new(signer));

    let givers = giver::load_givers(&config.givers_file, config.givers)?;
    info!("loaded {} givers from set {}", givers.len(), config.givers);

    let connector = NetworkConnector::from_config(&config);
    let pool = Arc::new(EndpointPool::new(Arc::new(connector), config.api));
    let query = pool.query_backend().await?;
    info!("querying through `{}` ({} flavor)", query.name(), pool.preferred());
    let broadcast: Vec<String> = pool
        .broadcast_backends()
        .await
        .iter()
        .map(|b| b.name().to_string())
        .collect();
    info!("proofs go out through [{}]", broadcast.join(", "));

    tokio::fs::create_dir_all(&config.bocs_dir).await?;

    let best = SharedBest::default();
    let stats = Arc::new(MinerStats::default());
    let giver_count = givers.len();

    let evaluator = Arc::new(GiverEvaluator::new(pool.clone(), givers, best.clone()));
    evaluator.refresh().await;
    tokio::spawn(evaluator.run(config.evaluate_interval));

    let miner = PowMiner {
        bin: config.miner_bin.clone(),
        gpu: config.gpu,
        timeout_secs: config.timeout_secs,
        wallet: wallet.clone(),
        bocs_dir: config.bocs_dir.clone(),
    };
    info!("using miner {} on gpu {}", miner.bin.display(), miner.gpu);
    let submitter = Arc::new(Submitter::new(pool.clone(), account, stats.clone()));
    let mining = tokio::spawn(MiningLoop::new(pool, best.clone(), miner, submitter, stats.clone()).run());

    let Some((host, port)) = config.status_addr else {
        if let Err(err) = mining.await {
            error!("mining loop stopped: {err}");
        }
        return Ok(());
    };

    info!("status API at http://{host}:{port}/api/v1/stats/");
    let state = web::Data::new(AppState {
        best,
        stats,
        giver_set: config.givers,
        giver_count,
        wallet,
    });

    HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .configure(api::init_routes)
    })
    .bind((host.as_str(), port))?
    .run()
    .await?;
    Ok(())
}
