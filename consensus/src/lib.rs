//! HotStuff Consensus
//!
//! A chained HotStuff BFT replication engine for n = 3f + 1 replicas:
//! - BLS-signed votes aggregated into quorum certificates
//! - Optimistic responsiveness: leaders advance as soon as a QC forms
//! - Round-robin leaders with exponential-backoff view changes
//! - Three-chain commit over a persistent block store
//!
//! `ConsensusEngine` is a synchronous state machine; `Node` runs it on tokio
//! and exposes channels for the transport and the application.

pub mod crypto;
pub mod hotstuff;
pub mod node;
pub mod pacemaker;
pub mod replica;
pub mod storage;

pub use crypto::{BLSKeyPair, BLSPublicKey, BLSSecretKey, BLSSignature, Hash};
pub use hotstuff::engine::{Action, ConsensusEngine, EngineConfig, EngineError};
pub use hotstuff::types::{
    Block, ConsensusState, Genesis, Header, Message, MsgTo, Proposal, QuorumCertificate, Timeout,
    Vote,
};
pub use node::{Event, Node, NodeConfig, NodeError, NodeHandle, Outbound};
pub use replica::{Replica, ReplicaSet};
pub use storage::{BlockStore, ChainIterator, MemoryDatabase, RocksDatabase, StorageError};
