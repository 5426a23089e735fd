//! # config
//!
//! why: every timing decision in the protocol derives from one network round-trip estimate
//! relations: consumed by raft-runtime timers and the simulator's config file
//! what: RaftConfig and the timeouts derived from it

use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;
use std::time::Duration;

/// Timing configuration for a Raft node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftConfig {
    /// Estimated network round-trip time in milliseconds
    #[serde(default = "default_rtt_ms")]
    pub rtt_ms: u64,

    /// Probe for a reachable majority before starting an election
    #[serde(default = "default_pre_vote")]
    pub pre_vote: bool,
}

fn default_rtt_ms() -> u64 {
    50
}

fn default_pre_vote() -> bool {
    true
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            rtt_ms: default_rtt_ms(),
            pre_vote: default_pre_vote(),
        }
    }
}

impl RaftConfig {
    pub fn with_rtt(rtt_ms: u64) -> Self {
        Self {
            rtt_ms,
            ..Self::default()
        }
    }

    pub fn rtt(&self) -> Duration {
        Duration::from_millis(self.rtt_ms.max(1))
    }

    /// Election timeouts are drawn uniformly from `[rtt, 5 * rtt]`.
    pub fn election_timeout_range(&self) -> RangeInclusive<Duration> {
        self.rtt()..=self.rtt() * 5
    }

    /// Leaders heartbeat every `rtt / 2`.
    pub fn heartbeat_interval(&self) -> Duration {
        (self.rtt() / 2).max(Duration::from_millis(1))
    }

    /// How often a follower checks whether its election timeout elapsed.
    /// Bounds how far an election can start past its timeout.
    pub fn election_check_interval(&self) -> Duration {
        (self.rtt() / 10).max(Duration::from_millis(1))
    }
}
