/// Storage layer
///
/// A content-addressed block store on top of a minimal key-value interface.
/// Backends: an in-memory map for tests and simulations, RocksDB for
/// persistent replicas. Values are bincode encoded.

use crate::crypto::Hash;
use crate::hotstuff::types::{ConsensusState, Genesis, Header};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

pub mod iterator;
pub mod memory;
pub mod pruning;
pub mod rocks;

// Re-export for convenience
pub use iterator::{ChainIterator, ChainStatus};
pub use memory::MemoryDatabase;
pub use pruning::{PruneStats, Pruner, PruningConfig, RetentionPolicy};
pub use rocks::RocksDatabase;

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] rocksdb::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] bincode::Error),

    #[error("Header not found: {0}")]
    HeaderNotFound(Hash),

    #[error("Store has no genesis")]
    NotInitialized,

    #[error("Store already initialized with a different genesis")]
    AlreadyInitialized,

    #[error("Header {proposed} does not extend the committed head {committed}")]
    ConflictingCommit { committed: Hash, proposed: Hash },

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Lock poisoned")]
    LockPoisoned,
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Key prefixes and metadata keys
const PREFIX_HEADER: &[u8] = b"hdr/";
const PREFIX_DATA: &[u8] = b"dat/";
const KEY_GENESIS: &[u8] = b"meta/genesis";
const KEY_HEAD: &[u8] = b"meta/head";
const KEY_COMMITTED: &[u8] = b"meta/committed";
const KEY_STATE: &[u8] = b"meta/state";
const KEY_PRUNED: &[u8] = b"meta/pruned";

/// A single write in a batch
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BatchOp {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

/// Writes applied atomically by `Database::write`
#[derive(Clone, Debug, Default)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.ops.push(BatchOp::Put(key.into(), value.into()));
    }

    pub fn delete(&mut self, key: impl Into<Vec<u8>>) {
        self.ops.push(BatchOp::Delete(key.into()));
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn into_ops(self) -> Vec<BatchOp> {
        self.ops
    }
}

/// Key-value backend required by the block store
pub trait Database: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;

    fn delete(&self, key: &[u8]) -> Result<()>;

    /// Apply all writes or none
    fn write(&self, batch: WriteBatch) -> Result<()>;
}

fn prefixed(prefix: &[u8], hash: &Hash) -> Vec<u8> {
    let mut key = Vec::with_capacity(prefix.len() + 32);
    key.extend_from_slice(prefix);
    key.extend_from_slice(hash.as_bytes());
    key
}

fn decode_hash(bytes: &[u8]) -> Result<Hash> {
    Hash::from_slice(bytes).map_err(|e| StorageError::InvalidData(e.to_string()))
}

/// Content-addressed header and payload store
///
/// Cheap to clone; clones share the backend. The consensus engine is the
/// only writer, readers (iterators, tests) only observe committed state.
#[derive(Clone)]
pub struct BlockStore {
    db: Arc<dyn Database>,
}

impl BlockStore {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    /// Store backed by a fresh in-memory database
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryDatabase::new()))
    }

    /// Store backed by RocksDB at `path`
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self::new(Arc::new(RocksDatabase::open(path)?)))
    }

    fn get_value<T: DeserializeOwned>(&self, key: &[u8]) -> Result<Option<T>> {
        match self.db.get(key)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
        Ok(bincode::serialize(value)?)
    }

    /// Seed the store with the genesis header and certificate
    ///
    /// Importing the same genesis again is a no-op; a different one fails.
    pub fn import_genesis(&self, genesis: &Genesis) -> Result<()> {
        if let Some(existing) = self.genesis()? {
            if &existing == genesis {
                return Ok(());
            }
            return Err(StorageError::AlreadyInitialized);
        }

        let hash = genesis.hash();
        let mut batch = WriteBatch::new();
        batch.put(KEY_GENESIS, Self::encode(genesis)?);
        batch.put(prefixed(PREFIX_HEADER, &hash), Self::encode(&genesis.header)?);
        batch.put(KEY_HEAD, hash.to_vec());
        batch.put(KEY_COMMITTED, hash.to_vec());
        self.db.write(batch)
    }

    pub fn genesis(&self) -> Result<Option<Genesis>> {
        self.get_value(KEY_GENESIS)
    }

    /// Persist a header and its payload, keyed by the header hash
    pub fn put(&self, header: &Header, data: &[u8]) -> Result<Hash> {
        let hash = header.hash();
        if self.contains(&hash)? {
            return Ok(hash);
        }
        let mut batch = WriteBatch::new();
        batch.put(prefixed(PREFIX_HEADER, &hash), Self::encode(header)?);
        batch.put(prefixed(PREFIX_DATA, &hash), data.to_vec());
        self.db.write(batch)?;
        Ok(hash)
    }

    pub fn get(&self, hash: &Hash) -> Result<Option<Header>> {
        self.get_value(&prefixed(PREFIX_HEADER, hash))
    }

    pub fn get_data(&self, hash: &Hash) -> Result<Option<Vec<u8>>> {
        self.db.get(&prefixed(PREFIX_DATA, hash))
    }

    pub fn contains(&self, hash: &Hash) -> Result<bool> {
        Ok(self.db.get(&prefixed(PREFIX_HEADER, hash))?.is_some())
    }

    /// Drop a payload, keeping its header
    pub fn delete_data(&self, hash: &Hash) -> Result<()> {
        self.db.delete(&prefixed(PREFIX_DATA, hash))
    }

    fn pointer(&self, key: &[u8]) -> Result<Header> {
        let bytes = self.db.get(key)?.ok_or(StorageError::NotInitialized)?;
        let hash = decode_hash(&bytes)?;
        self.get(&hash)?.ok_or(StorageError::HeaderNotFound(hash))
    }

    /// Block certified by the highest known QC
    pub fn head(&self) -> Result<Header> {
        self.pointer(KEY_HEAD)
    }

    pub fn set_head(&self, hash: &Hash) -> Result<()> {
        if !self.contains(hash)? {
            return Err(StorageError::HeaderNotFound(*hash));
        }
        self.db.put(KEY_HEAD, hash.as_bytes())
    }

    /// Committed head
    pub fn committed(&self) -> Result<Header> {
        self.pointer(KEY_COMMITTED)
    }

    /// Finalize `hash` and its ancestors
    ///
    /// The header must descend from the current committed head. Re-committing
    /// the head or one of its ancestors is a no-op.
    pub fn set_committed(&self, hash: &Hash) -> Result<()> {
        let committed = self.committed()?;
        let committed_hash = committed.hash();
        let committed_view = committed.view;
        let header = self.get(hash)?.ok_or(StorageError::HeaderNotFound(*hash))?;
        let advances = header.view > committed_view;

        let (mut cursor, target, target_view) = if advances {
            (header, committed_hash, committed_view)
        } else {
            let view = header.view;
            (committed, *hash, view)
        };
        while cursor.view > target_view {
            cursor = self
                .get(&cursor.parent)?
                .ok_or(StorageError::HeaderNotFound(cursor.parent))?;
        }
        if cursor.hash() != target {
            return Err(StorageError::ConflictingCommit {
                committed: committed_hash,
                proposed: *hash,
            });
        }

        if advances {
            self.db.put(KEY_COMMITTED, hash.as_bytes())?;
        }
        Ok(())
    }

    /// Persist the replica's vote state
    pub fn save_state(&self, state: &ConsensusState) -> Result<()> {
        self.db.put(KEY_STATE, &Self::encode(state)?)
    }

    pub fn load_state(&self) -> Result<Option<ConsensusState>> {
        self.get_value(KEY_STATE)
    }

    /// View up to which committed payloads have been pruned
    pub fn pruned_view(&self) -> Result<u64> {
        match self.db.get(KEY_PRUNED)? {
            Some(bytes) => {
                let array: [u8; 8] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| StorageError::InvalidData("Invalid pruned view bytes".into()))?;
                Ok(u64::from_le_bytes(array))
            }
            None => Ok(0),
        }
    }

    pub(crate) fn set_pruned_view(&self, view: u64) -> Result<()> {
        self.db.put(KEY_PRUNED, &view.to_le_bytes())
    }

    /// Iterate the committed chain from the committed head back to genesis
    pub fn iter(&self) -> ChainIterator {
        ChainIterator::new(self.clone())
    }
}

impl std::fmt::Debug for BlockStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockStore").finish_non_exhaustive()
    }
}
