// Pacemaker implementation for liveness
//
// Implements leader rotation, the tick-driven view timer with exponential
// backoff, and collection of timeout messages for view changes

use crate::hotstuff::types::{QuorumCertificate, Timeout};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

/// A view times out after this many ticks when no timeouts preceded it
pub const BASE_TIMEOUT_TICKS: u64 = 2;

/// Default cap on the backoff exponent
pub const DEFAULT_MAX_BACKOFF: u32 = 6;

/// Pacemaker ensures liveness by managing view progression and leader election
#[derive(Debug, Clone)]
pub struct Pacemaker {
    /// Current view number
    current_view: u64,

    /// Duration of one tick of the node loop
    interval: Duration,

    /// Cap on the backoff exponent
    max_backoff: u32,

    /// Number of consecutive timeouts (for exponential backoff)
    timeout_count: u32,

    /// Ticks spent in the current view
    ticks: u64,

    /// Total number of replicas in the network
    validator_count: usize,
}

impl Pacemaker {
    /// Create a new Pacemaker
    ///
    /// # Arguments
    /// * `validator_count` - Total number of replicas (n = 3f + 1)
    /// * `interval` - Duration of one tick
    /// * `max_backoff` - Cap on the backoff exponent
    pub fn new(validator_count: usize, interval: Duration, max_backoff: u32) -> Self {
        Self {
            current_view: 1,
            interval,
            max_backoff,
            timeout_count: 0,
            ticks: 0,
            validator_count: validator_count.max(1),
        }
    }

    /// Get current view number
    pub fn current_view(&self) -> u64 {
        self.current_view
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Consecutive timeouts since the last QC
    pub fn timeout_count(&self) -> u32 {
        self.timeout_count
    }

    /// Leader election using deterministic round-robin
    ///
    /// Returns the 1-based replica index: leader(v) = (v mod n) + 1
    pub fn leader(&self, view: u64) -> u64 {
        (view % self.validator_count as u64) + 1
    }

    /// Get the current leader for the current view
    pub fn current_leader(&self) -> u64 {
        self.leader(self.current_view)
    }

    /// Check if replica `index` leads `view`
    pub fn is_leader(&self, view: u64, index: u64) -> bool {
        self.leader(view) == index
    }

    /// Ticks the current view may run before timing out
    ///
    /// Formula: BASE_TIMEOUT_TICKS * 2^min(timeout_count, max_backoff)
    pub fn timeout_ticks(&self) -> u64 {
        BASE_TIMEOUT_TICKS << self.timeout_count.min(self.max_backoff)
    }

    /// Wall-clock length of the current view's timeout
    pub fn next_view_timeout(&self) -> Duration {
        self.interval.saturating_mul(self.timeout_ticks() as u32)
    }

    /// Record one tick; true when the current view has timed out
    pub fn tick(&mut self) -> bool {
        self.ticks += 1;
        self.ticks >= self.timeout_ticks()
    }

    /// Give up on the current view
    ///
    /// Moves to the next view and increases the backoff. Returns the new view.
    pub fn on_timeout(&mut self) -> u64 {
        self.current_view += 1;
        self.timeout_count = self.timeout_count.saturating_add(1);
        self.ticks = 0;
        self.current_view
    }

    /// Move to `view` if it is ahead of the current one
    ///
    /// `progress` marks a view change caused by a QC, which resets the
    /// backoff. Returns whether the view changed.
    pub fn advance_view(&mut self, view: u64, progress: bool) -> bool {
        if progress {
            self.timeout_count = 0;
        }
        if view <= self.current_view {
            return false;
        }
        self.current_view = view;
        self.ticks = 0;
        true
    }
}

/// Timeout collection errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TimeoutError {
    #[error("Duplicate timeout from voter {voter} for view {view}")]
    Duplicate { view: u64, voter: u64 },
}

/// Timeout messages per view
///
/// Every replica collects timeouts: f+1 of them for a higher view pull a
/// replica into that view, and a quorum lets the view's leader propose on
/// the highest QC they carry.
#[derive(Debug, Default)]
pub struct TimeoutCollector {
    views: BTreeMap<u64, BTreeMap<u64, Timeout>>,
}

impl TimeoutCollector {
    /// Create a new collector
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a verified timeout message
    ///
    /// Returns the number of distinct voters collected for its view.
    pub fn add(&mut self, timeout: Timeout) -> Result<usize, TimeoutError> {
        let view = timeout.view;
        let voters = self.views.entry(view).or_default();
        if voters.contains_key(&timeout.voter) {
            return Err(TimeoutError::Duplicate {
                view,
                voter: timeout.voter,
            });
        }
        voters.insert(timeout.voter, timeout);
        Ok(voters.len())
    }

    /// Get number of collected timeouts for `view`
    pub fn count(&self, view: u64) -> usize {
        self.views.get(&view).map_or(0, BTreeMap::len)
    }

    pub fn has_quorum(&self, view: u64, quorum_size: usize) -> bool {
        self.count(view) >= quorum_size
    }

    /// Whether `voter` already sent a timeout for `view`
    pub fn contains(&self, view: u64, voter: u64) -> bool {
        self.views
            .get(&view)
            .is_some_and(|voters| voters.contains_key(&voter))
    }

    /// Get the highest QC carried by the timeouts for `view`
    pub fn high_qc(&self, view: u64) -> Option<&QuorumCertificate> {
        self.views
            .get(&view)?
            .values()
            .map(|timeout| &timeout.high_qc)
            .max_by_key(|qc| qc.view)
    }

    /// Drop every view below `view`
    pub fn prune(&mut self, view: u64) {
        self.views = self.views.split_off(&view);
    }
}
