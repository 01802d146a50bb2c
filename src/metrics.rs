//! Process-wide decryption counters.
//!
//! Plain relaxed atomics; a snapshot is not a consistent cut across counters.
use std::sync::atomic::{AtomicU64, Ordering};

static DECRYPT_ATTEMPTS: AtomicU64 = AtomicU64::new(0);
static DECRYPT_MATCHES: AtomicU64 = AtomicU64::new(0);
static DECRYPT_NO_MATCH: AtomicU64 = AtomicU64::new(0);
static KEY_TRIALS: AtomicU64 = AtomicU64::new(0);
static SWEEPS_STARTED: AtomicU64 = AtomicU64::new(0);
static SWEEPS_COMPLETED: AtomicU64 = AtomicU64::new(0);
static SWEEPS_FAILED: AtomicU64 = AtomicU64::new(0);
static SWEEPS_REJECTED: AtomicU64 = AtomicU64::new(0);

pub fn inc_decrypt_attempt() {
    DECRYPT_ATTEMPTS.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_decrypt_match() {
    DECRYPT_MATCHES.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_decrypt_no_match() {
    DECRYPT_NO_MATCH.fetch_add(1, Ordering::Relaxed);
}
/// One key tried against one payload.
pub fn inc_key_trial() {
    KEY_TRIALS.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_sweep_started() {
    SWEEPS_STARTED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_sweep_completed() {
    SWEEPS_COMPLETED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_sweep_failed() {
    SWEEPS_FAILED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_sweep_rejected() {
    SWEEPS_REJECTED.fetch_add(1, Ordering::Relaxed);
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub decrypt_attempts: u64,
    pub decrypt_matches: u64,
    pub decrypt_no_match: u64,
    pub key_trials: u64,
    pub sweeps_started: u64,
    pub sweeps_completed: u64,
    pub sweeps_failed: u64,
    pub sweeps_rejected: u64,
}

impl Snapshot {
    /// Average number of keys tried per attempt; 0.0 before any attempt.
    pub fn trials_per_attempt(&self) -> f64 {
        if self.decrypt_attempts == 0 {
            0.0
        } else {
            self.key_trials as f64 / self.decrypt_attempts as f64
        }
    }
}

pub fn snapshot() -> Snapshot {
    Snapshot {
        decrypt_attempts: DECRYPT_ATTEMPTS.load(Ordering::Relaxed),
        decrypt_matches: DECRYPT_MATCHES.load(Ordering::Relaxed),
        decrypt_no_match: DECRYPT_NO_MATCH.load(Ordering::Relaxed),
        key_trials: KEY_TRIALS.load(Ordering::Relaxed),
        sweeps_started: SWEEPS_STARTED.load(Ordering::Relaxed),
        sweeps_completed: SWEEPS_COMPLETED.load(Ordering::Relaxed),
        sweeps_failed: SWEEPS_FAILED.load(Ordering::Relaxed),
        sweeps_rejected: SWEEPS_REJECTED.load(Ordering::Relaxed),
    }
}
