use futures::future::join_all;
use log::{debug, info, warn};
use num_bigint::BigUint;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};

use crate::giver::{Giver, pow_params_at, total_difficulty};
use crate::retry::call_for_success;
use crate::rpc::EndpointPool;

/// Most profitable giver found by the last successful cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BestGiver {
    pub address: String,
    pub coins_per_hash: f64,
}

impl BestGiver {
    /// True until the first cycle selects something.
    pub fn is_empty(&self) -> bool {
        self.address.is_empty()
    }
}

/// Selection shared between the evaluator (single writer) and the mining loop.
/// Readers clone the inner `Arc`, so nobody ever sees a half-written value.
#[derive(Clone, Default)]
pub struct SharedBest(Arc<Mutex<Arc<BestGiver>>>);

impl SharedBest {
    pub fn snapshot(&self) -> Arc<BestGiver> {
        self.0.lock().expect("mutex poisoned").clone()
    }

    pub fn replace(&self, best: BestGiver) {
        *self.0.lock().expect("mutex poisoned") = Arc::new(best);
    }
}

pub struct GiverEvaluator {
    pool: Arc<EndpointPool>,
    givers: Vec<Giver>,
    best: SharedBest,
    total: BigUint,
}

impl GiverEvaluator {
    pub fn new(pool: Arc<EndpointPool>, givers: Vec<Giver>, best: SharedBest) -> Self {
        Self::with_total_difficulty(pool, givers, best, total_difficulty())
    }

    pub fn with_total_difficulty(
        pool: Arc<EndpointPool>,
        givers: Vec<Giver>,
        best: SharedBest,
        total: BigUint,
    ) -> Self {
        Self {
            pool,
            givers,
            best,
            total,
        }
    }

    #[cfg(test)]
    pub fn best(&self) -> &SharedBest {
        &self.best
    }

    /// One cycle: every giver is queried at the same head and the highest
    /// reward per expected hash wins. Earlier givers win ties.
    ///
    /// `None` when no giver produced a usable ratio.
    pub async fn evaluate(&self) -> Option<BestGiver> {
        let backend = match self.pool.query_backend().await {
            Ok(backend) => backend,
            Err(err) => {
                warn!("evaluator has no query backend: {err}");
                return None;
            }
        };
        let head = match call_for_success(|| backend.last_block()).await {
            Ok(head) => head,
            Err(err) => {
                warn!("evaluator could not read the chain head: {err}");
                return None;
            }
        };

        let backend = backend.as_ref();
        let results = join_all(self.givers.iter().map(|giver| async move {
            call_for_success(|| pow_params_at(backend, head, &giver.address)).await
        }))
        .await;

        let mut best: Option<BestGiver> = None;
        for (giver, result) in self.givers.iter().zip(results) {
            let params = match result {
                Ok(params) => params,
                Err(err) => {
                    warn!("giver {} skipped this cycle: {err}", giver.address);
                    continue;
                }
            };
            let Some(coins) = params.coins_per_hash(giver.reward, &self.total) else {
                debug!("giver {} has unusable complexity {}", giver.address, params.complexity);
                continue;
            };
            if best.as_ref().is_none_or(|b| coins > b.coins_per_hash) {
                best = Some(BestGiver {
                    address: giver.address.clone(),
                    coins_per_hash: coins,
                });
            }
        }
        best
    }

    /// Evaluate and publish. An empty cycle keeps the previous selection.
    pub async fn refresh(&self) {
        match self.evaluate().await {
            Some(best) => {
                let previous = self.best.snapshot();
                if previous.address != best.address {
                    info!(
                        "best giver is now {} ({:e} coins/hash)",
                        best.address, best.coins_per_hash
                    );
                }
                self.best.replace(best);
            }
            None => {
                let kept = self.best.snapshot();
                warn!(
                    "no giver answered, keeping {}",
                    if kept.is_empty() { "<none>" } else { kept.address.as_str() }
                );
            }
        }
    }

    /// Refresh every `period`. The first refresh happens one period from now;
    /// callers run the startup refresh themselves. A slow cycle delays the next
    /// one instead of overlapping it.
    pub async fn run(self: Arc<Self>, period: Duration) {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            self.refresh().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::Flavor;
    use crate::rpc::mock::{MockBackend, pool_with};

    fn giver(address: &str, reward: f64) -> Giver {
        Giver {
            address: address.to_string(),
            reward,
        }
    }

    fn evaluator(backend: Arc<MockBackend>, givers: Vec<Giver>) -> GiverEvaluator {
        GiverEvaluator::with_total_difficulty(
            pool_with(vec![(Flavor::Primary, backend)]),
            givers,
            SharedBest::default(),
            BigUint::from(1000u32),
        )
    }

    #[tokio::test]
    async fn picks_highest_coins_per_hash() {
        let backend = Arc::new(MockBackend::named("mock"));
        backend.set_pow("g0", 1, 10, 1);
        backend.set_pow("g1", 1, 20, 1);
        backend.set_pow("g2", 1, 5, 1);
        let ev = evaluator(
            backend,
            vec![giver("g0", 100.0), giver("g1", 300.0), giver("g2", 50.0)],
        );

        // hashes 100, 50, 200 -> coins 1.0, 6.0, 0.25
        let best = ev.evaluate().await.unwrap();
        assert_eq!(best.address, "g1");
        assert_eq!(best.coins_per_hash, 6.0);

        ev.refresh().await;
        assert_eq!(ev.best().snapshot().address, "g1");
    }

    #[tokio::test]
    async fn ties_go_to_the_earlier_giver() {
        let backend = Arc::new(MockBackend::named("mock"));
        backend.set_pow("first", 1, 10, 1);
        backend.set_pow("second", 2, 10, 1);
        let ev = evaluator(backend, vec![giver("first", 100.0), giver("second", 100.0)]);

        assert_eq!(ev.evaluate().await.unwrap().address, "first");
    }

    #[tokio::test(start_paused = true)]
    async fn failing_giver_is_excluded() {
        let backend = Arc::new(MockBackend::named("mock"));
        // "rich" has no stack scripted, every query fails
        backend.set_pow("poor", 1, 10, 1);
        let ev = evaluator(backend, vec![giver("rich", 1e9), giver("poor", 1.0)]);

        assert_eq!(ev.evaluate().await.unwrap().address, "poor");
    }

    #[tokio::test(start_paused = true)]
    async fn all_failing_keeps_previous_selection() {
        let backend = Arc::new(MockBackend::named("mock"));
        let ev = evaluator(backend, vec![giver("g0", 1.0), giver("g1", 1.0)]);
        ev.best().replace(BestGiver {
            address: "g-old".into(),
            coins_per_hash: 0.5,
        });

        ev.refresh().await;
        let kept = ev.best().snapshot();
        assert_eq!(kept.address, "g-old");
        assert_eq!(kept.coins_per_hash, 0.5);
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_head_keeps_previous_selection() {
        let backend = Arc::new(MockBackend {
            fail_head: true,
            ..MockBackend::named("mock")
        });
        backend.set_pow("g0", 1, 10, 1);
        let ev = evaluator(backend.clone(), vec![giver("g0", 1.0)]);

        ev.refresh().await;
        assert!(ev.best().snapshot().is_empty());
        assert_eq!(backend.method_calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn one_head_per_cycle() {
        let backend = Arc::new(MockBackend::named("mock"));
        for g in ["a", "b", "c"] {
            backend.set_pow(g, 1, 10, 1);
        }
        let ev = evaluator(
            backend.clone(),
            vec![giver("a", 1.0), giver("b", 2.0), giver("c", 3.0)],
        );

        ev.evaluate().await.unwrap();
        assert_eq!(backend.head_calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(*backend.seen_blocks.lock().unwrap(), vec![7, 7, 7]);
    }

    #[tokio::test]
    async fn zero_complexity_is_skipped() {
        let backend = Arc::new(MockBackend::named("mock"));
        backend.set_pow("broken", 1, 0, 1);
        backend.set_pow("fine", 1, 10, 1);
        let ev = evaluator(backend, vec![giver("broken", 1e6), giver("fine", 1.0)]);

        assert_eq!(ev.evaluate().await.unwrap().address, "fine");
    }

    #[tokio::test(start_paused = true)]
    async fn run_refreshes_on_the_interval() {
        let backend = Arc::new(MockBackend::named("mock"));
        backend.set_pow("g0", 1, 10, 1);
        let ev = Arc::new(evaluator(backend.clone(), vec![giver("g0", 1.0)]));
        let best = ev.best().clone();

        let task = tokio::spawn(ev.run(Duration::from_millis(1000)));
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(best.snapshot().is_empty());
        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(best.snapshot().address, "g0");
        task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn slow_cycle_delays_the_next_instead_of_overlapping() {
        let backend = Arc::new(MockBackend {
            head_delay: Duration::from_millis(2500),
            ..MockBackend::named("mock")
        });
        backend.set_pow("g0", 1, 10, 1);
        let ev = Arc::new(evaluator(backend.clone(), vec![giver("g0", 1.0)]));
        let best = ev.best().clone();
        let heads = || backend.head_calls.load(std::sync::atomic::Ordering::SeqCst);

        let task = tokio::spawn(ev.run(Duration::from_millis(1000)));
        // first cycle starts at 1s and is still waiting on the head at 3.4s
        tokio::time::sleep(Duration::from_millis(3400)).await;
        assert_eq!(heads(), 1);
        assert!(best.snapshot().is_empty());

        // it completes at 3.5s, the ticks at 2s and 3s were skipped
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(best.snapshot().address, "g0");
        assert_eq!(heads(), 1);

        // next cycle starts on the 4s tick and runs until 6.5s
        tokio::time::sleep(Duration::from_millis(3200)).await;
        assert_eq!(heads(), 2);
        task.abort();
    }
}
