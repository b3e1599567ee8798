// HotStuff-BFT consensus implementation
// Based on HotStuff: BFT Consensus in the Lens of Blockchain (chained variant)
// Safety state, certificate handling and the event-driven consensus engine

pub mod certificate;
pub mod engine;
pub mod tree;
pub mod types;

#[cfg(test)]
pub(crate) mod fixtures;


use crate::crypto::BLSSecretKey;
use crate::storage::Result;
use certificate::sign_vote;
use tree::BlockTree;
use types::{ConsensusState, Header, QuorumCertificate, Vote};

/// Safety state of a replica
///
/// Owns the signing key so that every vote goes through `vote`, which
/// refuses to sign twice in one view.
pub struct Validator {
    /// Replica index in the replica set (1-based)
    index: u64,

    /// Key used to sign votes
    secret_key: BLSSecretKey,

    /// Highest view this replica has voted in
    last_voted: u64,

    /// QC on the second link of the newest two-chain
    locked_qc: QuorumCertificate,

    /// Highest QC observed
    high_qc: QuorumCertificate,
}

impl Validator {
    /// Fresh validator anchored at the genesis certificate
    pub fn new(index: u64, secret_key: BLSSecretKey, genesis_qc: QuorumCertificate) -> Self {
        Self {
            index,
            secret_key,
            last_voted: 0,
            locked_qc: genesis_qc.clone(),
            high_qc: genesis_qc,
        }
    }

    /// Validator resumed from persisted state
    pub fn restore(index: u64, secret_key: BLSSecretKey, state: &ConsensusState) -> Self {
        Self {
            index,
            secret_key,
            last_voted: state.last_voted,
            locked_qc: state.locked_qc.clone(),
            high_qc: state.high_qc.clone(),
        }
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn secret_key(&self) -> &BLSSecretKey {
        &self.secret_key
    }

    pub fn last_voted(&self) -> u64 {
        self.last_voted
    }

    pub fn locked_qc(&self) -> &QuorumCertificate {
        &self.locked_qc
    }

    pub fn high_qc(&self) -> &QuorumCertificate {
        &self.high_qc
    }

    /// Snapshot of the durable state at `view`
    pub fn state(&self, view: u64) -> ConsensusState {
        ConsensusState {
            view,
            last_voted: self.last_voted,
            high_qc: self.high_qc.clone(),
            locked_qc: self.locked_qc.clone(),
        }
    }

    /// SafeNode predicate
    ///
    /// A header is safe to vote for when its view is above the last voted
    /// view and either it extends the locked block (safety rule) or its
    /// justify QC is newer than the lock (liveness rule).
    pub fn safe_node(&self, header: &Header, tree: &BlockTree) -> Result<bool> {
        if header.view <= self.last_voted {
            return Ok(false);
        }

        // Safety rule: proposal extends the locked branch
        if tree.extends(header, &self.locked_qc.block_hash)? {
            return Ok(true);
        }

        // Liveness rule: a higher QC view allows unlocking
        Ok(header
            .justify
            .as_ref()
            .is_some_and(|justify| justify.view > self.locked_qc.view))
    }

    /// Sign a vote for `header`
    ///
    /// Returns None if this replica already voted in the header's view or
    /// a later one.
    pub fn vote(&mut self, header: &Header) -> Option<Vote> {
        if header.view <= self.last_voted {
            return None;
        }
        self.last_voted = header.view;

        let block_hash = header.hash();
        let signature = sign_vote(&self.secret_key, header.view, &block_hash);
        Some(Vote::new(header.view, block_hash, self.index, signature))
    }

    /// Adopt `qc` if it is newer than the current high QC
    pub fn update_high_qc(&mut self, qc: &QuorumCertificate) -> bool {
        if qc.view <= self.high_qc.view {
            return false;
        }
        self.high_qc = qc.clone();
        true
    }

    /// Raise the lock to `qc` if it is newer
    pub fn update_lock(&mut self, qc: &QuorumCertificate) -> bool {
        if qc.view <= self.locked_qc.view {
            return false;
        }
        self.locked_qc = qc.clone();
        true
    }

    /// Three-chain commit rule
    ///
    /// `qc` certifies b'', whose justify certifies b', whose justify
    /// certifies b. When b <- b' <- b'' are direct parent links across
    /// consecutive views, b is returned for commit.
    pub fn check_commit(&self, qc: &QuorumCertificate, tree: &BlockTree) -> Result<Option<Header>> {
        let Some(b2) = tree.get(&qc.block_hash)? else {
            return Ok(None);
        };
        let Some(qc2) = b2.justify.as_ref() else {
            return Ok(None);
        };
        let Some(b1) = tree.get(&qc2.block_hash)? else {
            return Ok(None);
        };
        let Some(qc1) = b1.justify.as_ref() else {
            return Ok(None);
        };
        let Some(b0) = tree.get(&qc1.block_hash)? else {
            return Ok(None);
        };

        let linked = b2.parent == qc2.block_hash && b1.parent == qc1.block_hash;
        let consecutive = b2.view == b1.view + 1 && b1.view == b0.view + 1;
        if linked && consecutive {
            return Ok(Some(b0));
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hotstuff::fixtures::Cluster;
    use crate::storage::tests::child;

    /// Extend `parent` at `view` with a real QC over `parent`
    fn certified_child(cluster: &Cluster, parent: &Header, view: u64, data: &[u8]) -> Header {
        let qc = cluster.certify(parent);
        Header::new(view, parent.hash(), crate::crypto::hash_data(data), Some(qc))
    }

    fn setup() -> (Cluster, Validator, BlockTree) {
        let cluster = Cluster::new(4);
        let validator = Validator::new(1, cluster.secret_key(1), cluster.genesis.certificate.clone());
        let tree = BlockTree::new(cluster.store(1)).unwrap();
        (cluster, validator, tree)
    }

    #[test]
    fn test_validator_creation() {
        let (cluster, validator, _) = setup();
        assert_eq!(validator.index(), 1);
        assert_eq!(validator.last_voted(), 0);
        assert_eq!(validator.high_qc(), &cluster.genesis.certificate);
        assert_eq!(validator.locked_qc(), &cluster.genesis.certificate);
    }

    #[test]
    fn test_safe_node_extends_locked() {
        let (cluster, validator, mut tree) = setup();
        let b1 = certified_child(&cluster, &cluster.genesis.header, 1, b"b1");
        tree.insert(b1.clone(), b"b1").unwrap();

        let b2 = certified_child(&cluster, &b1, 2, b"b2");
        assert!(validator.safe_node(&b1, &tree).unwrap());
        assert!(validator.safe_node(&b2, &tree).unwrap());
    }

    #[test]
    fn test_safe_node_rejects_conflicting() {
        let (cluster, mut validator, mut tree) = setup();
        let b1 = certified_child(&cluster, &cluster.genesis.header, 1, b"b1");
        tree.insert(b1.clone(), b"b1").unwrap();

        // Lock on b1 at view 1
        validator.update_lock(&cluster.certify(&b1));

        // Conflicting proposal justified by the genesis QC
        let conflicting = certified_child(&cluster, &cluster.genesis.header, 2, b"other");
        assert!(!validator.safe_node(&conflicting, &tree).unwrap());
    }

    #[test]
    fn test_safe_node_liveness_rule_unlock() {
        let (cluster, mut validator, mut tree) = setup();
        let b1 = certified_child(&cluster, &cluster.genesis.header, 1, b"b1");
        let fork1 = certified_child(&cluster, &cluster.genesis.header, 2, b"fork1");
        tree.insert(b1.clone(), b"b1").unwrap();
        tree.insert(fork1.clone(), b"fork1").unwrap();
        validator.update_lock(&cluster.certify(&b1));

        // A QC on the fork newer than the lock unlocks
        let fork2 = certified_child(&cluster, &fork1, 3, b"fork2");
        assert!(!tree.extends(&fork2, &b1.hash()).unwrap());
        assert!(validator.safe_node(&fork2, &tree).unwrap());
    }

    #[test]
    fn test_safe_node_requires_fresh_view() {
        let (cluster, mut validator, tree) = setup();
        let b1 = certified_child(&cluster, &cluster.genesis.header, 1, b"b1");

        assert!(validator.vote(&b1).is_some());
        assert!(!validator.safe_node(&b1, &tree).unwrap());
    }

    #[test]
    fn test_vote_once_per_view() {
        let (cluster, mut validator, _) = setup();
        let b1 = certified_child(&cluster, &cluster.genesis.header, 1, b"b1");
        let b1_alt = certified_child(&cluster, &cluster.genesis.header, 1, b"alt");

        let vote = validator.vote(&b1).unwrap();
        assert_eq!(vote.view, 1);
        assert_eq!(vote.voter, 1);
        assert_eq!(vote.block_hash, b1.hash());
        assert!(certificate::verify_vote(&vote, &cluster.replicas).is_ok());

        assert!(validator.vote(&b1_alt).is_none());
        assert!(validator.vote(&b1).is_none());
        assert_eq!(validator.last_voted(), 1);
    }

    #[test]
    fn test_qc_updates_are_monotonic() {
        let (cluster, mut validator, _) = setup();
        let b1 = certified_child(&cluster, &cluster.genesis.header, 1, b"b1");
        let qc1 = cluster.certify(&b1);

        assert!(validator.update_high_qc(&qc1));
        assert!(!validator.update_high_qc(&cluster.genesis.certificate));
        assert_eq!(validator.high_qc(), &qc1);

        assert!(validator.update_lock(&qc1));
        assert!(!validator.update_lock(&qc1));
    }

    #[test]
    fn test_three_chain_commit() {
        let (cluster, validator, mut tree) = setup();
        let g = cluster.genesis.header.clone();
        let b1 = certified_child(&cluster, &g, 1, b"b1");
        let b2 = certified_child(&cluster, &b1, 2, b"b2");
        let b3 = certified_child(&cluster, &b2, 3, b"b3");
        for header in [&b1, &b2, &b3] {
            tree.insert(header.clone(), b"").unwrap();
        }

        // QC on b2 only gives a two-chain above genesis, which commits genesis
        let committed = validator.check_commit(&cluster.certify(&b2), &tree).unwrap();
        assert_eq!(committed, Some(g));

        let committed = validator.check_commit(&cluster.certify(&b3), &tree).unwrap();
        assert_eq!(committed, Some(b1));
    }

    #[test]
    fn test_three_chain_non_consecutive_views() {
        let (cluster, validator, mut tree) = setup();
        let b1 = certified_child(&cluster, &cluster.genesis.header, 1, b"b1");
        let b2 = certified_child(&cluster, &b1, 2, b"b2");
        // View gap after a timeout
        let b4 = certified_child(&cluster, &b2, 4, b"b4");
        let b5 = certified_child(&cluster, &b4, 5, b"b5");
        for header in [&b1, &b2, &b4, &b5] {
            tree.insert(header.clone(), b"").unwrap();
        }

        assert_eq!(validator.check_commit(&cluster.certify(&b4), &tree).unwrap(), None);
        assert_eq!(validator.check_commit(&cluster.certify(&b5), &tree).unwrap(), None);

        let b6 = certified_child(&cluster, &b5, 6, b"b6");
        tree.insert(b6.clone(), b"").unwrap();
        assert_eq!(validator.check_commit(&cluster.certify(&b6), &tree).unwrap(), Some(b4));
    }

    #[test]
    fn test_three_chain_requires_direct_parents() {
        let (cluster, validator, mut tree) = setup();
        let g = cluster.genesis.header.clone();
        let b1 = certified_child(&cluster, &g, 1, b"b1");
        let b2 = certified_child(&cluster, &b1, 2, b"b2");
        // b3 carries the QC on b1 although its parent is b2
        let mut b3 = child(&b2, 3, b"b3");
        b3.justify = Some(cluster.certify(&b1));
        for header in [&b1, &b2, &b3] {
            tree.insert(header.clone(), b"").unwrap();
        }

        assert_eq!(validator.check_commit(&cluster.certify(&b3), &tree).unwrap(), None);
    }

    #[test]
    fn test_restore_preserves_last_voted() {
        let (cluster, mut validator, _) = setup();
        let b1 = certified_child(&cluster, &cluster.genesis.header, 1, b"b1");
        validator.vote(&b1).unwrap();

        let state = validator.state(1);
        let mut restored = Validator::restore(1, cluster.secret_key(1), &state);
        assert_eq!(restored.last_voted(), 1);
        assert!(restored.vote(&b1).is_none());
    }
}
