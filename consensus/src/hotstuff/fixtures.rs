/// Shared test fixtures: a replica set with keys, a signed genesis and one
/// in-memory store per replica

use crate::crypto::{BLSKeyPair, BLSSecretKey};
use crate::hotstuff::certificate::{aggregate_qc, sign_vote};
use crate::hotstuff::types::{Genesis, Header, QuorumCertificate, Vote};
use crate::replica::{Replica, ReplicaSet};
use crate::storage::BlockStore;

pub(crate) struct Cluster {
    pub keys: Vec<BLSKeyPair>,
    pub replicas: ReplicaSet,
    pub genesis: Genesis,
    stores: Vec<BlockStore>,
}

impl Cluster {
    pub fn new(n: usize) -> Self {
        let keys: Vec<BLSKeyPair> = (0..n).map(|_| BLSKeyPair::generate()).collect();
        let replicas = ReplicaSet::new(
            keys.iter()
                .map(|k| Replica::new(k.public_key.clone()))
                .collect(),
        )
        .unwrap();

        let header = Header::genesis(b"genesis");
        let certificate = certify_with(&keys, &replicas, &header);
        let genesis = Genesis::new(header, certificate).unwrap();

        let stores = (0..n)
            .map(|_| {
                let store = BlockStore::in_memory();
                store.import_genesis(&genesis).unwrap();
                store
            })
            .collect();

        Self {
            keys,
            replicas,
            genesis,
            stores,
        }
    }

    pub fn secret_key(&self, index: u64) -> BLSSecretKey {
        self.keys[index as usize - 1].secret_key.clone()
    }

    pub fn store(&self, index: u64) -> BlockStore {
        self.stores[index as usize - 1].clone()
    }

    /// Valid QC over `header` signed by the first quorum of replicas
    pub fn certify(&self, header: &Header) -> QuorumCertificate {
        certify_with(&self.keys, &self.replicas, header)
    }
}

fn certify_with(keys: &[BLSKeyPair], replicas: &ReplicaSet, header: &Header) -> QuorumCertificate {
    let hash = header.hash();
    let votes: Vec<Vote> = keys
        .iter()
        .take(replicas.quorum_size())
        .enumerate()
        .map(|(i, k)| Vote::new(header.view, hash, i as u64 + 1, sign_vote(&k.secret_key, header.view, &hash)))
        .collect();
    aggregate_qc(header.view, hash, &votes, replicas.quorum_size()).unwrap()
}
