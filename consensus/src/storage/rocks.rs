/// RocksDB key-value backend
///
/// Batches map onto a native RocksDB WriteBatch, so a batch is applied
/// atomically even across a crash.

use crate::storage::{BatchOp, Database, Result, WriteBatch};
use rocksdb::{Options, DB};
use std::path::Path;

pub struct RocksDatabase {
    db: DB,
}

impl RocksDatabase {
    /// Open (or create) a database at `path`
    pub fn open(path: &Path) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);

        let db = DB::open(&opts, path)?;
        Ok(Self { db })
    }
}

impl Database for RocksDatabase {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.db.get(key)?)
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.db.put(key, value)?;
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.db.delete(key)?;
        Ok(())
    }

    fn write(&self, batch: WriteBatch) -> Result<()> {
        let mut native = rocksdb::WriteBatch::default();
        for op in batch.into_ops() {
            match op {
                BatchOp::Put(key, value) => native.put(key, value),
                BatchOp::Delete(key) => native.delete(key),
            }
        }
        self.db.write(native)?;
        Ok(())
    }
}
