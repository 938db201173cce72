use futures::future::join_all;
use log::{debug, info, warn};
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::process::Command;
use tokio::task::JoinHandle;

use crate::boc::{self, BocError, Cell};
use crate::evaluator::SharedBest;
use crate::giver::{PowParams, fetch_pow_params};
use crate::rpc::EndpointPool;
use crate::stats::MinerStats;
use crate::submit::{SubmitOutcome, Submitter};

/// Value passed to the miner's `-F` flag.
pub const BATCH_SIZE: u32 = 128;

/// Extra time the miner gets past its own `-t` limit before it is killed.
const PROCESS_GRACE: Duration = Duration::from_secs(1);

/// Pause while the evaluator has not selected a giver yet.
const IDLE_WAIT: Duration = Duration::from_millis(500);

/// Raw bag-of-cells written by the miner when it finds a proof.
#[derive(Debug, Clone)]
pub struct MinedProof {
    bytes: Vec<u8>,
}

impl MinedProof {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// First reference of the root cell, the body the giver expects.
    pub fn payload(&self) -> Result<Arc<Cell>, BocError> {
        let roots = boc::deserialize(&self.bytes)?;
        let root = roots.first().ok_or(BocError::NoRoot)?;
        root.reference(0).cloned().ok_or(BocError::NoReference)
    }
}

/// Wrapper around the external proof-of-work executable.
#[derive(Debug, Clone)]
pub struct PowMiner {
    pub bin: PathBuf,
    pub gpu: u32,
    pub timeout_secs: u64,
    /// Address the giver pays out to.
    pub wallet: String,
    pub bocs_dir: PathBuf,
}

impl PowMiner {
    pub fn command_args(&self, params: &PowParams, giver: &str, out: &Path) -> Vec<String> {
        vec![
            "-g".to_string(),
            self.gpu.to_string(),
            "-F".to_string(),
            BATCH_SIZE.to_string(),
            "-t".to_string(),
            self.timeout_secs.to_string(),
            self.wallet.clone(),
            params.seed.to_string(),
            params.complexity.to_string(),
            params.iterations.to_string(),
            giver.to_string(),
            out.display().to_string(),
        ]
    }

    /// Fresh `{bocs_dir}/{16 hex}.boc` path.
    pub fn artifact_path(&self) -> PathBuf {
        let token: [u8; 8] = rand::random();
        self.bocs_dir.join(format!("{}.boc", hex::encode(token)))
    }

    /// Run the miner once. Any failure to produce the artifact means no proof.
    pub async fn attempt(&self, params: &PowParams, giver: &str) -> Option<MinedProof> {
        let path = self.artifact_path();
        let limit = Duration::from_secs(self.timeout_secs) + PROCESS_GRACE;

        let mut cmd = Command::new(&self.bin);
        cmd.args(self.command_args(params, giver, &path))
            .stdin(Stdio::null())
            .kill_on_drop(true);

        match tokio::time::timeout(limit, cmd.output()).await {
            Ok(Ok(output)) if !output.status.success() => {
                debug!(
                    "miner exited with {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                );
            }
            Ok(Ok(_)) => {}
            Ok(Err(err)) => warn!("could not start miner {}: {err}", self.bin.display()),
            Err(_) => warn!("miner still running after {limit:?}, killed"),
        }

        take_artifact(&path).await
    }
}

/// Read and delete the artifact. Missing file means nothing was found.
async fn take_artifact(path: &Path) -> Option<MinedProof> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return None,
        Err(err) => {
            warn!("could not read {}: {err}", path.display());
            return None;
        }
    };
    if let Err(err) = fs::remove_file(path).await {
        warn!("could not delete {}: {err}", path.display());
    }
    Some(MinedProof::new(bytes))
}

#[derive(Debug)]
pub enum AttemptOutcome {
    /// No giver selected yet.
    Idle,
    /// The selected giver could not be queried.
    ParamsUnavailable,
    NotMined,
    /// A proof was handed to the submitter, which keeps running on its own.
    Dispatched(JoinHandle<SubmitOutcome>),
}

/// Sequential mining loop: one miner run at a time, submissions in the background.
pub struct MiningLoop {
    pool: Arc<EndpointPool>,
    best: SharedBest,
    miner: PowMiner,
    submitter: Arc<Submitter>,
    stats: Arc<MinerStats>,
}

impl MiningLoop {
    pub fn new(
        pool: Arc<EndpointPool>,
        best: SharedBest,
        miner: PowMiner,
        submitter: Arc<Submitter>,
        stats: Arc<MinerStats>,
    ) -> Self {
        Self {
            pool,
            best,
            miner,
            submitter,
            stats,
        }
    }

    pub async fn run_once(&self) -> AttemptOutcome {
        let best = self.best.snapshot();
        if best.is_empty() {
            return AttemptOutcome::Idle;
        }
        let giver = best.address.clone();

        // the snapshot may be older than the giver's current seed
        let params = match self.pool.query_backend().await {
            Ok(backend) => fetch_pow_params(backend.as_ref(), &giver).await,
            Err(err) => Err(err),
        };
        let params = match params {
            Ok(params) => params,
            Err(err) => {
                warn!("could not read pow params of {giver}: {err}");
                return AttemptOutcome::ParamsUnavailable;
            }
        };

        let n = self.stats.record_attempt();
        match self.miner.attempt(&params, &giver).await {
            None => {
                self.stats.record_not_mined();
                info!("not mined seed {} attempt {n}", params.seed);
                AttemptOutcome::NotMined
            }
            Some(proof) => {
                debug!("attempt {n} produced {} bytes for {giver}", proof.as_bytes().len());
                let submitter = Arc::clone(&self.submitter);
                AttemptOutcome::Dispatched(tokio::spawn(submitter.submit(proof, giver, params.seed)))
            }
        }
    }

    /// Mine until the process exits.
    pub async fn run(self) {
        loop {
            match self.run_once().await {
                AttemptOutcome::Idle => {
                    debug!("no giver selected yet");
                    tokio::time::sleep(IDLE_WAIT).await;
                }
                AttemptOutcome::Dispatched(handle) => {
                    tokio::spawn(report(handle));
                }
                AttemptOutcome::ParamsUnavailable | AttemptOutcome::NotMined => {}
            }
        }
    }
}

/// Wait for a background submission and log how it ended. Returns the
/// number of send tasks that ran to completion.
async fn report(handle: JoinHandle<SubmitOutcome>) -> usize {
    match handle.await {
        Ok(SubmitOutcome::Dispatched(sends)) => {
            let total = sends.len();
            let finished = join_all(sends).await.into_iter().filter(Result::is_ok).count();
            debug!("submission finished, {finished}/{total} send tasks completed");
            finished
        }
        Ok(SubmitOutcome::Stale { current_seed }) => {
            debug!("submission skipped, giver already at seed {current_seed}");
            0
        }
        Ok(SubmitOutcome::Discarded(reason)) => {
            debug!("submission discarded: {reason}");
            0
        }
        Ok(SubmitOutcome::Unverified) => 0,
        Err(err) => {
            warn!("submission task failed: {err}");
            0
        }
    }
}
