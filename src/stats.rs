use chrono::{DateTime, Utc};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters shared by the mining loop, the submitter and the status API.
#[derive(Default)]
pub struct MinerStats {
    attempts: AtomicU64,
    not_mined: AtomicU64,
    mined: AtomicU64,
    stale: AtomicU64,
    sends_ok: AtomicU64,
    sends_failed: AtomicU64,
    last_mined_at: Mutex<Option<DateTime<Utc>>>,
}

/// Point-in-time copy of [`MinerStats`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatsSnapshot {
    pub attempts: u64,
    pub not_mined: u64,
    pub mined: u64,
    pub stale: u64,
    pub sends_ok: u64,
    pub sends_failed: u64,
    pub last_mined_at: Option<DateTime<Utc>>,
}

impl MinerStats {
    /// Returns the number of this attempt, starting at 1.
    pub fn record_attempt(&self) -> u64 {
        self.attempts.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_not_mined(&self) {
        self.not_mined.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_mined(&self) {
        self.mined.fetch_add(1, Ordering::Relaxed);
        *self.last_mined_at.lock().expect("mutex poisoned") = Some(Utc::now());
    }

    pub fn record_stale(&self) {
        self.stale.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_send(&self, ok: bool) {
        let counter = if ok { &self.sends_ok } else { &self.sends_failed };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            attempts: self.attempts.load(Ordering::Relaxed),
            not_mined: self.not_mined.load(Ordering::Relaxed),
            mined: self.mined.load(Ordering::Relaxed),
            stale: self.stale.load(Ordering::Relaxed),
            sends_ok: self.sends_ok.load(Ordering::Relaxed),
            sends_failed: self.sends_failed.load(Ordering::Relaxed),
            last_mined_at: *self.last_mined_at.lock().expect("mutex poisoned"),
        }
    }
}
