//! Per-chain service metrics.
//!
//! Tracks, per hosted chain:
//! - relays served and relays that failed downstream
//! - cumulative and average execution time
//! - accepted challenges

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::debug;

/// Counters for one chain.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ChainMetrics {
    /// Relays answered successfully.
    pub relays: u64,
    /// Relays whose downstream execution failed.
    pub errors: u64,
    /// Accepted challenges.
    pub challenges: u64,
    /// Total execution time of successful relays.
    pub total_time: Duration,
}

impl ChainMetrics {
    /// Average execution time of successful relays.
    #[must_use]
    pub fn average_time(&self) -> Duration {
        u32::try_from(self.relays)
            .ok()
            .filter(|n| *n > 0)
            .map_or(Duration::ZERO, |n| self.total_time / n)
    }
}

/// Tracker for relay service metrics.
#[derive(Debug)]
pub struct ServiceMetrics {
    chains: RwLock<BTreeMap<String, ChainMetrics>>,
    start_time: Instant,
}

impl ServiceMetrics {
    /// Create an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self {
            chains: RwLock::new(BTreeMap::new()),
            start_time: Instant::now(),
        }
    }

    /// Record a relay served for `chain` in `elapsed`.
    pub fn record_relay(&self, chain: &str, elapsed: Duration) {
        let mut chains = self.chains.write();
        let entry = chains.entry(chain.to_string()).or_default();
        entry.relays += 1;
        entry.total_time += elapsed;
        debug!(
            "Relay served for chain {} in {:?}, total {}",
            chain, elapsed, entry.relays
        );
    }

    /// Record a downstream failure for `chain`.
    pub fn record_error(&self, chain: &str) {
        self.chains
            .write()
            .entry(chain.to_string())
            .or_default()
            .errors += 1;
    }

    /// Record an accepted challenge for `chain`.
    pub fn record_challenge(&self, chain: &str) {
        self.chains
            .write()
            .entry(chain.to_string())
            .or_default()
            .challenges += 1;
    }

    /// Snapshot of the counters for `chain`.
    #[must_use]
    pub fn chain(&self, chain: &str) -> ChainMetrics {
        self.chains.read().get(chain).cloned().unwrap_or_default()
    }

    /// Snapshot of every chain's counters.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<String, ChainMetrics> {
        self.chains.read().clone()
    }

    /// Relays served across all chains.
    #[must_use]
    pub fn total_relays(&self) -> u64 {
        self.chains.read().values().map(|m| m.relays).sum()
    }

    /// Time since the tracker was created.
    #[must_use]
    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }
}

impl Default for ServiceMetrics {
    fn default() -> Self {
        Self::new()
    }
}
