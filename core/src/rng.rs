//! Deterministic random number generation for cohort assignment.
//!
//! RULE: nothing in the core may call a platform RNG.
//! Assignment randomness flows through a `RandomSource`, normally a
//! `SeededRng` handed out by the `RngBank` for one (experiment, day) pair.
//! Re-running a day with the same master seed replays the same draws.

use chrono::{Datelike, NaiveDate};
use rand::{RngCore, SeedableRng};
use rand_pcg::Pcg64Mcg;

/// The draws the cohort assigner needs. Tests inject scripted sources.
pub trait RandomSource {
    /// A float in [0.0, 1.0).
    fn next_f64(&mut self) -> f64;

    /// A u64 in [0, n). `n` must be > 0.
    fn next_u64_below(&mut self, n: u64) -> u64 {
        assert!(n > 0, "n must be > 0");
        ((self.next_f64() * n as f64) as u64).min(n - 1)
    }
}

/// A named PCG stream.
pub struct SeededRng {
    pub name: String,
    inner: Pcg64Mcg,
}

impl SeededRng {
    pub fn new(seed: u64) -> Self {
        Self {
            name: "unnamed".into(),
            inner: Pcg64Mcg::seed_from_u64(seed),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn next_u64(&mut self) -> u64 {
        self.inner.next_u64()
    }
}

impl RandomSource for SeededRng {
    fn next_f64(&mut self) -> f64 {
        let bits = self.inner.next_u64();
        (bits >> 11) as f64 * (1.0 / (1u64 << 53) as f64)
    }

    fn next_u64_below(&mut self, n: u64) -> u64 {
        assert!(n > 0, "n must be > 0");
        self.inner.next_u64() % n
    }
}

/// Derives independent streams from a single master seed.
pub struct RngBank {
    master_seed: u64,
}

impl RngBank {
    pub fn new(master_seed: u64) -> Self {
        Self { master_seed }
    }

    pub fn master_seed(&self) -> u64 {
        self.master_seed
    }

    /// One stream per experiment per day. Adding an experiment never shifts
    /// another experiment's draws.
    pub fn for_experiment(&self, lookup_name: &str, date: NaiveDate) -> SeededRng {
        let day = date.num_days_from_ce() as u64;
        let derived = self.master_seed
            ^ fnv1a(lookup_name.as_bytes())
            ^ day.wrapping_mul(0x9e37_79b9_7f4a_7c15);
        SeededRng::new(derived).with_name(format!("{lookup_name}@{date}"))
    }
}

// Stable across platforms and releases, unlike std's DefaultHasher.
fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in bytes {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}
