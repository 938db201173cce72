use log::{debug, info, warn};
use num_bigint::BigUint;
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::giver::fetch_pow_params;
use crate::miner::MinedProof;
use crate::retry::call_for_success;
use crate::rpc::{EndpointPool, WalletSession};
use crate::stats::MinerStats;
use crate::wallet::{SignedMessage, Transfer, WalletAccount};

/// Value attached to every proof message: 0.05 in nano units.
pub const SUBMIT_VALUE_NANO: u64 = 50_000_000;

/// How many times the same message goes out through each backend.
pub const BROADCAST_ROUNDS: usize = 3;

#[derive(Debug)]
pub enum SubmitOutcome {
    /// The giver could not be re-read, so freshness is unknown.
    Unverified,
    /// The giver moved on to a new seed while we were mining.
    Stale { current_seed: BigUint },
    /// The proof or the message could not be built.
    Discarded(String),
    /// Detached send tasks, one per backend and round.
    Dispatched(Vec<JoinHandle<()>>),
}

pub struct Submitter {
    pool: Arc<EndpointPool>,
    account: WalletAccount,
    stats: Arc<MinerStats>,
}

impl Submitter {
    pub fn new(pool: Arc<EndpointPool>, account: WalletAccount, stats: Arc<MinerStats>) -> Self {
        Self {
            pool,
            account,
            stats,
        }
    }

    /// Check that `seed` is still current for `giver`, then broadcast the proof.
    pub async fn submit(self: Arc<Self>, proof: MinedProof, giver: String, seed: BigUint) -> SubmitOutcome {
        let backend = match self.pool.query_backend().await {
            Ok(backend) => backend,
            Err(err) => {
                warn!("proof for {giver} dropped, no query backend: {err}");
                return SubmitOutcome::Unverified;
            }
        };
        let fresh = match fetch_pow_params(backend.as_ref(), &giver).await {
            Ok(params) => params,
            Err(err) => {
                warn!("proof for {giver} dropped, could not re-read its seed: {err}");
                return SubmitOutcome::Unverified;
            }
        };
        if fresh.seed != seed {
            info!("mined already too late seed {seed}, {giver} is at {}", fresh.seed);
            self.stats.record_stale();
            return SubmitOutcome::Stale {
                current_seed: fresh.seed,
            };
        }

        self.stats.record_mined();
        info!("mined seed {seed} for {giver}");

        let session = WalletSession::open(backend, &self.account);
        let seqno = match call_for_success(|| session.sequence_number()).await {
            Ok(seqno) => seqno,
            Err(err) => {
                warn!("wallet seqno unavailable ({err}), sending with 0");
                0
            }
        };

        let body = match proof.payload() {
            Ok(body) => body,
            Err(err) => {
                warn!("mined artifact for {giver} is unusable: {err}");
                return SubmitOutcome::Discarded(err.to_string());
            }
        };
        let transfer = Transfer {
            seqno,
            destination: giver.clone(),
            value: SUBMIT_VALUE_NANO,
            bounce: true,
            body,
        };
        let message = match self.account.sign(&transfer) {
            Ok(message) => message,
            Err(err) => {
                warn!("could not sign proof transfer to {giver}: {err}");
                return SubmitOutcome::Discarded(err.to_string());
            }
        };

        SubmitOutcome::Dispatched(self.broadcast(message).await)
    }

    /// Send one signed message through every reachable backend, `BROADCAST_ROUNDS` times.
    /// Every send is its own task and failures only get counted.
    pub async fn broadcast(&self, message: SignedMessage) -> Vec<JoinHandle<()>> {
        let backends = self.pool.broadcast_backends().await;
        if backends.is_empty() {
            warn!("no backend reachable, proof not sent");
            return Vec::new();
        }

        let message = Arc::new(message);
        let mut handles = Vec::with_capacity(backends.len() * BROADCAST_ROUNDS);
        for round in 1..=BROADCAST_ROUNDS {
            for backend in &backends {
                let session = WalletSession::open(Arc::clone(backend), &self.account);
                let message = Arc::clone(&message);
                let stats = Arc::clone(&self.stats);
                handles.push(tokio::spawn(async move {
                    match session.send_transaction(&message).await {
                        Ok(()) => {
                            debug!("round {round}: sent via {}", session.backend_name());
                            stats.record_send(true);
                        }
                        Err(err) => {
                            debug!("round {round}: send via {} failed: {err}", session.backend_name());
                            stats.record_send(false);
                        }
                    }
                }));
            }
        }
        handles
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::mock::{MockBackend, pool_with};
    use crate::rpc::{Flavor, SEQNO_METHOD, StackEntry};
    use crate::wallet::LocalSigner;
    use futures::future::join_all;

    const PROOF: &str = "b5ee9c72010102010006000100010002ab";

    fn proof() -> MinedProof {
        MinedProof::new(hex::decode(PROOF).unwrap())
    }

    fn account() -> WalletAccount {
        WalletAccount::new("EQminer", Arc::new(LocalSigner::random()))
    }

    struct Setup {
        submitter: Arc<Submitter>,
        backends: Vec<Arc<MockBackend>>,
        stats: Arc<MinerStats>,
    }

    fn setup(seqno: Option<u32>, fail_secondary: bool) -> Setup {
        let primary = Arc::new(MockBackend::named("primary"));
        primary.set_pow("EQgiver", 42, 10, 1);
        if let Some(seqno) = seqno {
            primary.set_stack("EQminer", SEQNO_METHOD, Ok(vec![StackEntry::int(seqno)]));
        }
        let secondary = Arc::new(MockBackend {
            fail_send: fail_secondary,
            ..MockBackend::named("secondary")
        });
        let peer = Arc::new(MockBackend::named("peer"));
        let backends = vec![primary, secondary, peer];

        let pool = pool_with(
            Flavor::ALL
                .iter()
                .copied()
                .zip(backends.iter().cloned())
                .collect(),
        );
        let stats = Arc::new(MinerStats::default());
        Setup {
            submitter: Arc::new(Submitter::new(pool, account(), stats.clone())),
            backends,
            stats,
        }
    }

    async fn finish(outcome: SubmitOutcome) -> usize {
        match outcome {
            SubmitOutcome::Dispatched(handles) => {
                let n = handles.len();
                for res in join_all(handles).await {
                    res.unwrap();
                }
                n
            }
            other => panic!("expected dispatch, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn fresh_seed_is_sent_three_times_per_backend() {
        let s = setup(Some(5), true);
        let outcome = s.submitter.clone().submit(proof(), "EQgiver".into(), BigUint::from(42u8)).await;
        assert_eq!(finish(outcome).await, 9);

        // the failing backend did not stop the others
        for b in &s.backends {
            assert_eq!(b.sends(), 3, "{}", b.name);
        }
        let snap = s.stats.snapshot();
        assert_eq!(snap.mined, 1);
        assert_eq!(snap.sends_ok, 6);
        assert_eq!(snap.sends_failed, 3);

        // identical bytes everywhere
        let sent = s.backends[0].sent.lock().unwrap().clone();
        assert!(sent.windows(2).all(|w| w[0] == w[1]));
        let json: serde_json::Value = serde_json::from_slice(&sent[0]).unwrap();
        assert_eq!(json["seqno"], 5);
        assert_eq!(json["destination"], "EQgiver");
        assert_eq!(json["value"], SUBMIT_VALUE_NANO);
        assert_eq!(json["bounce"], true);
    }

    #[tokio::test]
    async fn stale_seed_sends_nothing() {
        let s = setup(Some(5), false);
        let outcome = s.submitter.clone().submit(proof(), "EQgiver".into(), BigUint::from(41u8)).await;

        match outcome {
            SubmitOutcome::Stale { current_seed } => assert_eq!(current_seed, BigUint::from(42u8)),
            other => panic!("expected stale, got {other:?}"),
        }
        for b in &s.backends {
            assert_eq!(b.sends(), 0);
        }
        assert_eq!(s.stats.snapshot().stale, 1);
        assert_eq!(s.stats.snapshot().mined, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_seqno_falls_back_to_zero() {
        let s = setup(None, false);
        let outcome = s.submitter.clone().submit(proof(), "EQgiver".into(), BigUint::from(42u8)).await;
        assert_eq!(finish(outcome).await, 9);

        let sent = s.backends[2].sent.lock().unwrap().clone();
        let json: serde_json::Value = serde_json::from_slice(&sent[0]).unwrap();
        assert_eq!(json["seqno"], 0);
    }

    #[tokio::test]
    async fn malformed_artifact_is_discarded() {
        let s = setup(Some(1), false);
        let outcome = s
            .submitter
            .clone()
            .submit(MinedProof::new(vec![1, 2, 3]), "EQgiver".into(), BigUint::from(42u8))
            .await;
        assert!(matches!(outcome, SubmitOutcome::Discarded(_)));
        for b in &s.backends {
            assert_eq!(b.sends(), 0);
        }
    }

    #[tokio::test]
    async fn broadcast_covers_only_reachable_backends() {
        let only = Arc::new(MockBackend::named("only"));
        let pool = pool_with(vec![(Flavor::Secondary, only.clone())]);
        let submitter = Submitter::new(pool, account(), Arc::new(MinerStats::default()));

        let handles = submitter.broadcast(SignedMessage::from_bytes(vec![9])).await;
        assert_eq!(handles.len(), BROADCAST_ROUNDS);
        join_all(handles).await;
        assert_eq!(only.sends(), 3);
    }
}
