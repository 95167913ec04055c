//! Routing table tunables.

use std::{collections::HashSet, net::IpAddr};

use time::Duration;

use crate::core::kuid::Kuid;

/// The protocol's replication parameter, the default capacity of each bucket list.
pub const K: usize = 20;

/// Whether the local node serves RPCs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// Answers RPCs and keeps a full-resolution table around its own identifier.
    #[default]
    Active,
    /// Only issues requests, the table is kept shallow to bound memory use.
    Passive,
}

/// Routing table configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub mode: Mode,
    /// The capacity of each of the good, stale and pending lists of a bucket.
    pub k: usize,
    /// The depth ceiling for buckets in active mode.
    pub max_depth: u8,
    /// The depth ceiling for buckets in passive mode.
    pub max_depth_passive: u8,
    /// Number of extra levels a bucket leaving the closest subtree may still be split.
    pub subdivide: u8,
    /// The maximum number of contacts from the same network held by one bucket.
    pub max_per_class_c: usize,
    /// The number of consecutive RPC timeouts after which a contact is considered dead.
    pub max_timeouts: u8,
    pub alive_period: Duration,
    pub alive_period_passive: Duration,
    pub refresh_period: Duration,
    /// Refresh period of the bucket holding the local identifier.
    pub our_refresh_period: Duration,
    /// Timers fire within ± this percentage of their period.
    pub jitter_percent: u8,
    /// How long a tracked RPC may remain unanswered before it counts as timed out.
    pub rpc_timeout: Duration,
    /// Addresses refused when restoring a persisted table.
    pub hostiles: HashSet<IpAddr>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: Mode::Active,
            k: K,
            max_depth: (Kuid::BITS - 1) as u8,
            max_depth_passive: 16,
            subdivide: 5,
            max_per_class_c: 3,
            max_timeouts: 5,
            alive_period: Duration::minutes(10),
            alive_period_passive: Duration::minutes(20),
            refresh_period: Duration::hours(1),
            our_refresh_period: Duration::minutes(15),
            jitter_percent: 5,
            rpc_timeout: Duration::seconds(30),
            hostiles: HashSet::new(),
        }
    }
}

impl Config {
    /// The depth ceiling for the current mode, never past the last bit of an identifier.
    pub fn depth_ceiling(&self) -> u8 {
        let ceiling = match self.mode {
            Mode::Active => self.max_depth,
            Mode::Passive => self.max_depth_passive,
        };

        ceiling.min((Kuid::BITS - 1) as u8)
    }

    /// The alive-check period for the current mode.
    pub fn alive(&self) -> Duration {
        match self.mode {
            Mode::Active => self.alive_period,
            Mode::Passive => self.alive_period_passive,
        }
    }

    /// The number of closest nodes sampled for the local size estimate.
    pub fn estimate_sample(&self) -> usize {
        5 * self.k
    }
}
