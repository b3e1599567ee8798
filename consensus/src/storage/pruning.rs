/// Pruning logic for storage management
///
/// Deletes payloads of committed blocks that fall outside the retention
/// window. Headers are never pruned, so the committed chain stays iterable
/// down to genesis.

use crate::hotstuff::types::Header;
use crate::storage::{BlockStore, Result};
use serde::{Deserialize, Serialize};

/// Pruning configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PruningConfig {
    /// Retention policy
    pub policy: RetentionPolicy,
}

impl Default for PruningConfig {
    fn default() -> Self {
        Self {
            policy: RetentionPolicy::KeepRecent(100),
        }
    }
}

/// Retention policy determines how many committed payloads to keep
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetentionPolicy {
    /// Keep all payloads (never prune)
    KeepAll,

    /// Keep payloads of the last N views behind the committed head
    KeepRecent(u64),
}

/// Pruner manages storage pruning based on configuration
#[derive(Clone, Debug)]
pub struct Pruner {
    config: PruningConfig,
}

impl Pruner {
    /// Create a new pruner with the given configuration
    pub fn new(config: PruningConfig) -> Self {
        Self { config }
    }

    pub fn with_policy(policy: RetentionPolicy) -> Self {
        Self::new(PruningConfig { policy })
    }

    /// Determine if a block at `block_view` should be pruned
    /// Keeping the last N views means: at head view H, keep views (H-N+1) to H
    pub fn should_prune(&self, block_view: u64, head_view: u64) -> bool {
        match self.config.policy {
            RetentionPolicy::KeepAll => false,
            RetentionPolicy::KeepRecent(n) => head_view >= n && block_view <= head_view - n,
        }
    }

    /// Prune payloads of committed blocks behind `committed`
    ///
    /// Resumes from the view reached by the previous run, so each payload is
    /// visited once.
    pub fn prune(&self, store: &BlockStore, committed: &Header) -> Result<PruneStats> {
        let mut stats = PruneStats::default();

        // Don't prune if policy is KeepAll
        if matches!(self.config.policy, RetentionPolicy::KeepAll) {
            return Ok(stats);
        }

        let pruned_view = store.pruned_view()?;
        let mut cursor = committed.clone();
        let mut highest = None;

        while !cursor.is_genesis() && cursor.view > pruned_view {
            if self.should_prune(cursor.view, committed.view) {
                store.delete_data(&cursor.hash())?;
                stats.payloads_pruned += 1;
                highest.get_or_insert(cursor.view);
            }
            cursor = match store.get(&cursor.parent)? {
                Some(parent) => parent,
                None => break,
            };
        }

        if let Some(view) = highest {
            store.set_pruned_view(view)?;
            stats.pruned_to_view = view;
            tracing::debug!(view, pruned = stats.payloads_pruned, "Pruned committed payloads");
        }

        Ok(stats)
    }
}

/// Statistics from pruning operation
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct PruneStats {
    pub payloads_pruned: usize,
    pub pruned_to_view: u64,
}
