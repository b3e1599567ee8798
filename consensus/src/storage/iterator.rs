/// Chain iteration over committed headers
///
/// Walks parent links from the committed head back to genesis. Only
/// committed state is read, so iteration tolerates a concurrent writer.

use crate::crypto::Hash;
use crate::hotstuff::types::Header;
use crate::storage::BlockStore;

/// Position of a chain iterator
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChainStatus {
    /// Positioned on a header
    Active,
    /// Walked past genesis
    Finished,
    /// Parent of the last header is not in the store
    MissingLink(Hash),
    /// Parent view is not strictly below its child's
    ViewOrder { child: u64, parent: u64 },
    /// Backend failure
    Failed(String),
}

/// Restartable cursor from the committed head to genesis
pub struct ChainIterator {
    store: BlockStore,
    current: Option<Header>,
    status: ChainStatus,
}

impl ChainIterator {
    pub fn new(store: BlockStore) -> Self {
        let mut iter = Self {
            store,
            current: None,
            status: ChainStatus::Active,
        };
        iter.reset();
        iter
    }

    /// Restart from the (current) committed head
    pub fn reset(&mut self) {
        match self.store.committed() {
            Ok(head) => {
                self.current = Some(head);
                self.status = ChainStatus::Active;
            }
            Err(e) => self.fail(ChainStatus::Failed(e.to_string())),
        }
    }

    /// Whether the cursor denotes a real header
    pub fn valid(&self) -> bool {
        self.current.is_some()
    }

    pub fn header(&self) -> Option<&Header> {
        self.current.as_ref()
    }

    pub fn status(&self) -> &ChainStatus {
        &self.status
    }

    /// Move to the parent header
    pub fn advance(&mut self) {
        let Some(current) = self.current.take() else {
            return;
        };
        if current.is_genesis() {
            self.status = ChainStatus::Finished;
            return;
        }

        match self.store.get(&current.parent) {
            Ok(Some(parent)) if parent.view < current.view => self.current = Some(parent),
            Ok(Some(parent)) => self.fail(ChainStatus::ViewOrder {
                child: current.view,
                parent: parent.view,
            }),
            Ok(None) => self.fail(ChainStatus::MissingLink(current.parent)),
            Err(e) => self.fail(ChainStatus::Failed(e.to_string())),
        }
    }

    fn fail(&mut self, status: ChainStatus) {
        tracing::warn!(?status, "Chain iteration stopped");
        self.current = None;
        self.status = status;
    }
}

impl Iterator for ChainIterator {
    type Item = Header;

    fn next(&mut self) -> Option<Header> {
        let header = self.current.clone()?;
        self.advance();
        Some(header)
    }
}
