/// Block tree
///
/// Uncommitted headers indexed by hash, each with the QC known to certify
/// it. Lookups fall back to the block store, so ancestry walks keep working
/// after a restart empties the in-memory index.

use crate::hotstuff::types::{Hash, Header, QuorumCertificate};
use crate::storage::{BlockStore, Result};
use std::collections::HashMap;

#[derive(Debug, Clone)]
struct PendingHeader {
    header: Header,
    certificate: Option<QuorumCertificate>,
}

#[derive(Debug)]
pub struct BlockTree {
    store: BlockStore,
    pending: HashMap<Hash, PendingHeader>,
    committed: Header,
}

impl BlockTree {
    /// Load the committed head from the store
    pub fn new(store: BlockStore) -> Result<Self> {
        let committed = store.committed()?;
        Ok(Self {
            store,
            pending: HashMap::new(),
            committed,
        })
    }

    pub fn store(&self) -> &BlockStore {
        &self.store
    }

    /// Committed head
    pub fn committed(&self) -> &Header {
        &self.committed
    }

    /// Number of uncommitted headers held in memory
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Persist a header with its payload
    ///
    /// Headers at or below the committed view are stored but not indexed.
    pub fn insert(&mut self, header: Header, data: &[u8]) -> Result<Hash> {
        let hash = self.store.put(&header, data)?;
        if header.view > self.committed.view {
            self.pending.entry(hash).or_insert(PendingHeader {
                header,
                certificate: None,
            });
        }
        Ok(hash)
    }

    pub fn get(&self, hash: &Hash) -> Result<Option<Header>> {
        if let Some(entry) = self.pending.get(hash) {
            return Ok(Some(entry.header.clone()));
        }
        self.store.get(hash)
    }

    pub fn contains(&self, hash: &Hash) -> Result<bool> {
        if self.pending.contains_key(hash) {
            return Ok(true);
        }
        self.store.contains(hash)
    }

    /// Record a verified QC for a pending header
    pub fn certify(&mut self, qc: &QuorumCertificate) {
        if let Some(entry) = self.pending.get_mut(&qc.block_hash) {
            entry.certificate.get_or_insert_with(|| qc.clone());
        }
    }

    pub fn certificate(&self, hash: &Hash) -> Option<&QuorumCertificate> {
        self.pending.get(hash)?.certificate.as_ref()
    }

    /// Whether `header` descends from (or is) the header `ancestor`
    pub fn extends(&self, header: &Header, ancestor: &Hash) -> Result<bool> {
        let Some(target) = self.get(ancestor)? else {
            return Ok(false);
        };

        let mut current = header.clone();
        loop {
            if current.hash() == *ancestor {
                return Ok(true);
            }
            if current.view <= target.view || current.is_genesis() {
                return Ok(false);
            }
            match self.get(&current.parent)? {
                Some(parent) => current = parent,
                None => return Ok(false),
            }
        }
    }

    /// Headers from just above the committed head up to `tip`, oldest first
    ///
    /// None if `tip` does not descend from the committed head.
    pub fn branch(&self, tip: &Header) -> Result<Option<Vec<Header>>> {
        let committed_hash = self.committed.hash();
        let mut branch = Vec::new();
        let mut current = tip.clone();

        while current.view > self.committed.view {
            let parent = current.parent;
            branch.push(current);
            match self.get(&parent)? {
                Some(header) => current = header,
                None => return Ok(None),
            }
        }

        if current.hash() != committed_hash {
            return Ok(None);
        }
        branch.reverse();
        Ok(Some(branch))
    }

    /// Move the committed head and drop everything at or below it
    pub fn prune(&mut self, committed: Header) {
        let view = committed.view;
        self.pending.retain(|_, entry| entry.header.view > view);
        self.committed = committed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::tests::{child, test_genesis};

    fn tree_with_chain(len: u64) -> (BlockTree, Vec<Header>) {
        let store = BlockStore::in_memory();
        let genesis = test_genesis(b"tree");
        store.import_genesis(&genesis).unwrap();
        let mut tree = BlockTree::new(store).unwrap();

        let mut headers = vec![genesis.header];
        for view in 1..=len {
            let header = child(headers.last().unwrap(), view, &[view as u8]);
            tree.insert(header.clone(), &[view as u8]).unwrap();
            headers.push(header);
        }
        (tree, headers)
    }

    #[test]
    fn test_insert_and_get() {
        let (tree, headers) = tree_with_chain(2);

        assert_eq!(tree.pending_len(), 2);
        assert_eq!(tree.get(&headers[2].hash()).unwrap(), Some(headers[2].clone()));
        // Genesis comes from the store
        assert_eq!(tree.get(&headers[0].hash()).unwrap(), Some(headers[0].clone()));
        assert!(tree.contains(&headers[1].hash()).unwrap());
        assert!(tree.store().contains(&headers[1].hash()).unwrap());
    }

    #[test]
    fn test_extends() {
        let (mut tree, headers) = tree_with_chain(3);
        let fork = child(&headers[1], 4, b"fork");
        tree.insert(fork.clone(), b"fork").unwrap();

        assert!(tree.extends(&headers[3], &headers[1].hash()).unwrap());
        assert!(tree.extends(&headers[3], &headers[3].hash()).unwrap());
        assert!(tree.extends(&fork, &headers[1].hash()).unwrap());
        assert!(!tree.extends(&fork, &headers[2].hash()).unwrap());
        assert!(!tree.extends(&headers[1], &headers[3].hash()).unwrap());
        assert!(!tree.extends(&headers[3], &Hash::new([1u8; 32])).unwrap());
    }

    #[test]
    fn test_branch() {
        let (tree, headers) = tree_with_chain(3);

        let branch = tree.branch(&headers[3]).unwrap().unwrap();
        assert_eq!(branch, headers[1..=3].to_vec());
    }

    #[test]
    fn test_branch_rejects_fork_of_committed() {
        let (mut tree, headers) = tree_with_chain(3);
        tree.store().set_committed(&headers[2].hash()).unwrap();
        tree.prune(headers[2].clone());

        let fork = child(&headers[1], 4, b"fork");
        tree.insert(fork.clone(), b"fork").unwrap();

        assert!(tree.branch(&fork).unwrap().is_none());
        assert_eq!(tree.branch(&headers[3]).unwrap(), Some(vec![headers[3].clone()]));
    }

    #[test]
    fn test_certify() {
        let (mut tree, headers) = tree_with_chain(2);
        let hash = headers[2].hash();
        let qc = QuorumCertificate::new(2, hash, vec![1, 2, 3], vec![]);

        assert!(tree.certificate(&hash).is_none());
        tree.certify(&qc);
        assert_eq!(tree.certificate(&hash), Some(&qc));
    }

    #[test]
    fn test_prune_on_commit() {
        let (mut tree, headers) = tree_with_chain(4);

        tree.prune(headers[2].clone());
        assert_eq!(tree.pending_len(), 2);
        assert_eq!(tree.committed(), &headers[2]);

        // Pruned headers remain reachable through the store
        assert!(tree.get(&headers[1].hash()).unwrap().is_some());
        assert!(tree.extends(&headers[4], &headers[1].hash()).unwrap());
    }
}
