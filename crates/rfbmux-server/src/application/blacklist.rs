//! Per-address authentication-failure rate limiter.
//!
//! Every failed authentication attempt adds a strike against the peer's
//! address. Once the strike count crosses the threshold the address is
//! blocked for a window that doubles with each further strike, up to a cap.
//! A successful authentication clears the address completely.
//!
//! Blocked peers are refused before a session is even allocated, so a
//! brute-forcing client costs the server nothing but the refusal bytes.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::application::timer::Clock;

/// Tuning knobs for the blacklist.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct BlacklistConfig {
    /// Number of strikes before an address is blocked.
    #[serde(default = "default_threshold")]
    pub threshold: u32,
    /// Length of the first block window, in seconds.
    #[serde(default = "default_initial_block_secs")]
    pub initial_block_secs: u64,
    /// Upper bound for the doubling block window, in seconds.
    #[serde(default = "default_max_block_secs")]
    pub max_block_secs: u64,
}

fn default_threshold() -> u32 {
    5
}
fn default_initial_block_secs() -> u64 {
    10
}
fn default_max_block_secs() -> u64 {
    // One day.
    24 * 60 * 60
}

impl Default for BlacklistConfig {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
            initial_block_secs: default_initial_block_secs(),
            max_block_secs: default_max_block_secs(),
        }
    }
}

#[derive(Debug)]
struct Entry {
    marks: u32,
    block_until: Option<Instant>,
    block_window: Duration,
}

/// The strike table. One entry per address that has ever failed; entries
/// are dropped again when the peer authenticates successfully.
pub struct Blacklist {
    config: BlacklistConfig,
    clock: Arc<dyn Clock>,
    entries: HashMap<IpAddr, Entry>,
}

impl Blacklist {
    pub fn new(config: BlacklistConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            entries: HashMap::new(),
        }
    }

    /// Whether connections from `addr` should currently be refused.
    pub fn is_blackmarked(&self, addr: &IpAddr) -> bool {
        let Some(entry) = self.entries.get(addr) else {
            return false;
        };
        entry.marks >= self.config.threshold
            && entry
                .block_until
                .is_some_and(|until| self.clock.now() < until)
    }

    /// Records one authentication failure for `addr`.
    pub fn add_blackmark(&mut self, addr: IpAddr) {
        let initial = Duration::from_secs(self.config.initial_block_secs);
        let cap = Duration::from_secs(self.config.max_block_secs);

        let entry = self.entries.entry(addr).or_insert(Entry {
            marks: 0,
            block_until: None,
            block_window: initial,
        });
        entry.marks += 1;

        if entry.marks < self.config.threshold {
            return;
        }
        if entry.marks > self.config.threshold {
            entry.block_window = (entry.block_window * 2).min(cap);
        }
        entry.block_until = Some(self.clock.now() + entry.block_window);
        warn!(
            "blocking {} for {:?} after {} authentication failures",
            addr, entry.block_window, entry.marks
        );
    }

    /// Forgets `addr` entirely. Called when the peer authenticates.
    pub fn clear_blackmark(&mut self, addr: &IpAddr) {
        self.entries.remove(addr);
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
