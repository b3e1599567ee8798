/// Node configuration

use crate::crypto::BLSPublicKey;
use crate::pacemaker::DEFAULT_MAX_BACKOFF;
use crate::replica::{Replica, ReplicaError, ReplicaSet};
use crate::storage::RetentionPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Default capacity of the inbound and outbound channels
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid replica set: {0}")]
    Replicas(#[from] ReplicaError),

    #[error("Node identity is not in the replica set")]
    UnknownIdentity,

    #[error("Tick interval must be non-zero")]
    ZeroInterval,

    #[error("Channel capacity must be non-zero")]
    ZeroCapacity,

    #[error("Backoff exponent {0} is too large")]
    BackoffTooLarge(u32),
}

/// Configuration of one replica
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// All replicas, in index order
    pub replicas: Vec<Replica>,

    /// This node's public key; must appear in `replicas`
    pub id: BLSPublicKey,

    /// Duration of one pacemaker tick
    pub interval: Duration,

    /// Capacity of the inbound and outbound channels
    pub channel_capacity: usize,

    /// Cap on the timeout backoff exponent
    pub max_backoff: u32,

    /// How many committed payloads to keep
    pub retention: RetentionPolicy,
}

impl NodeConfig {
    /// Config with default channel capacity, backoff and retention
    pub fn new(replicas: Vec<Replica>, id: BLSPublicKey, interval: Duration) -> Self {
        Self {
            replicas,
            id,
            interval,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            max_backoff: DEFAULT_MAX_BACKOFF,
            retention: RetentionPolicy::KeepAll,
        }
    }

    /// Check the config and resolve this node's index
    pub fn validate(&self) -> Result<(ReplicaSet, u64), ConfigError> {
        if self.interval.is_zero() {
            return Err(ConfigError::ZeroInterval);
        }
        if self.channel_capacity == 0 {
            return Err(ConfigError::ZeroCapacity);
        }
        // Tick counts are shifted by the exponent
        if self.max_backoff > 32 {
            return Err(ConfigError::BackoffTooLarge(self.max_backoff));
        }
        let replicas = ReplicaSet::new(self.replicas.clone())?;
        let index = replicas
            .index_of(&self.id)
            .ok_or(ConfigError::UnknownIdentity)?;
        Ok((replicas, index))
    }
}
