/// Replica set and quorum arithmetic
///
/// Replicas are identified by their BLS public key. Each one gets a stable
/// index 1..=n from its position in the configured list; votes and quorum
/// certificates refer to replicas by that index.

use crate::crypto::BLSPublicKey;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReplicaError {
    #[error("Replica set is empty")]
    Empty,

    #[error("Replica {0} appears more than once")]
    Duplicate(u64),
}

/// A member of the replica set
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Replica {
    pub id: BLSPublicKey,
}

impl Replica {
    pub fn new(id: BLSPublicKey) -> Self {
        Self { id }
    }
}

/// Ordered, immutable set of replicas
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplicaSet {
    replicas: Vec<Replica>,
}

impl ReplicaSet {
    pub fn new(replicas: Vec<Replica>) -> Result<Self, ReplicaError> {
        if replicas.is_empty() {
            return Err(ReplicaError::Empty);
        }
        let mut seen = HashSet::new();
        for (position, replica) in replicas.iter().enumerate() {
            if !seen.insert(replica.id.clone()) {
                return Err(ReplicaError::Duplicate(position as u64 + 1));
            }
        }
        Ok(Self { replicas })
    }

    /// Total number of replicas (n)
    pub fn len(&self) -> usize {
        self.replicas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.replicas.is_empty()
    }

    /// Maximum Byzantine faults tolerated (f)
    pub fn max_faults(&self) -> usize {
        (self.replicas.len() - 1) / 3
    }

    /// Votes needed for a certificate: n - f, i.e. 2f + 1 when n = 3f + 1
    pub fn quorum_size(&self) -> usize {
        self.replicas.len() - self.max_faults()
    }

    /// Whether `index` names a member (indices start at 1)
    pub fn contains(&self, index: u64) -> bool {
        index >= 1 && index as usize <= self.replicas.len()
    }

    pub fn get(&self, index: u64) -> Option<&Replica> {
        if !self.contains(index) {
            return None;
        }
        self.replicas.get(index as usize - 1)
    }

    pub fn public_key(&self, index: u64) -> Option<&BLSPublicKey> {
        self.get(index).map(|replica| &replica.id)
    }

    /// Index of the replica with this public key
    pub fn index_of(&self, id: &BLSPublicKey) -> Option<u64> {
        self.replicas
            .iter()
            .position(|replica| &replica.id == id)
            .map(|position| position as u64 + 1)
    }

    /// All member indices in order
    pub fn indices(&self) -> impl Iterator<Item = u64> {
        1..=self.replicas.len() as u64
    }

    pub fn replicas(&self) -> &[Replica] {
        &self.replicas
    }
}
