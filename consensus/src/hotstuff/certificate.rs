/// Certificate layer
///
/// Signs votes, aggregates a quorum of votes into a QuorumCertificate and
/// verifies certificates against the replica set. Verification is pure and
/// must succeed before a certificate influences any state.

use crate::crypto::{sign, verify, BLSSecretKey, BLSSignature};
use crate::hotstuff::types::{Hash, QuorumCertificate, Vote};
use crate::replica::ReplicaSet;
use std::collections::{BTreeMap, HashSet};
use thiserror::Error;

const VOTE_DOMAIN: &[u8] = b"hotstuff/vote";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CertificateError {
    #[error("Insufficient votes: need {needed}, got {got}")]
    InsufficientVotes { needed: usize, got: usize },

    #[error("Duplicate voter {0}")]
    DuplicateVoter(u64),

    #[error("Vote from {voter} is for a different view or block")]
    VoteMismatch { voter: u64 },

    #[error("Quorum too small: need {needed}, got {got}")]
    QuorumTooSmall { needed: usize, got: usize },

    #[error("Unknown voter {0}")]
    UnknownVoter(u64),

    #[error("Bad signature from voter {0}")]
    BadSignature(u64),

    #[error("Malformed certificate: {voters} voters but {signatures} signatures")]
    Malformed { voters: usize, signatures: usize },
}

pub type Result<T> = std::result::Result<T, CertificateError>;

/// Canonical bytes a vote signs: domain tag, view (LE), block hash
pub fn vote_message(view: u64, block_hash: &Hash) -> Vec<u8> {
    let mut data = Vec::with_capacity(VOTE_DOMAIN.len() + 8 + 32);
    data.extend_from_slice(VOTE_DOMAIN);
    data.extend_from_slice(&view.to_le_bytes());
    data.extend_from_slice(block_hash.as_bytes());
    data
}

/// Sign a (view, block hash) pair
pub fn sign_vote(secret_key: &BLSSecretKey, view: u64, block_hash: &Hash) -> BLSSignature {
    sign(secret_key, &vote_message(view, block_hash))
}

/// Check a single vote's signature against the replica set
pub fn verify_vote(vote: &Vote, replicas: &ReplicaSet) -> Result<()> {
    let public_key = replicas
        .public_key(vote.voter)
        .ok_or(CertificateError::UnknownVoter(vote.voter))?;
    if !verify(public_key, &vote_message(vote.view, &vote.block_hash), &vote.signature) {
        return Err(CertificateError::BadSignature(vote.voter));
    }
    Ok(())
}

/// Combine votes into a Quorum Certificate
///
/// Votes are not re-verified here; callers aggregate votes they already
/// checked. The result lists voters in ascending order.
pub fn aggregate_qc(
    view: u64,
    block_hash: Hash,
    votes: &[Vote],
    quorum_size: usize,
) -> Result<QuorumCertificate> {
    let mut by_voter = BTreeMap::new();
    for vote in votes {
        if vote.view != view || vote.block_hash != block_hash {
            return Err(CertificateError::VoteMismatch { voter: vote.voter });
        }
        if by_voter.insert(vote.voter, vote.signature.clone()).is_some() {
            return Err(CertificateError::DuplicateVoter(vote.voter));
        }
    }

    if by_voter.len() < quorum_size {
        return Err(CertificateError::InsufficientVotes {
            needed: quorum_size,
            got: by_voter.len(),
        });
    }

    let (voters, signatures) = by_voter.into_iter().unzip();
    Ok(QuorumCertificate::new(view, block_hash, voters, signatures))
}

/// Verify a QC against the replica set
///
/// Fails on the first violation: shape, quorum size, duplicate voter,
/// unknown voter, then each signature in order.
pub fn verify_qc(qc: &QuorumCertificate, replicas: &ReplicaSet) -> Result<()> {
    if qc.voters.len() != qc.signatures.len() {
        return Err(CertificateError::Malformed {
            voters: qc.voters.len(),
            signatures: qc.signatures.len(),
        });
    }

    let needed = replicas.quorum_size();
    if qc.voters.len() < needed {
        return Err(CertificateError::QuorumTooSmall {
            needed,
            got: qc.voters.len(),
        });
    }

    let mut seen = HashSet::with_capacity(qc.voters.len());
    for voter in &qc.voters {
        if !seen.insert(*voter) {
            return Err(CertificateError::DuplicateVoter(*voter));
        }
        if !replicas.contains(*voter) {
            return Err(CertificateError::UnknownVoter(*voter));
        }
    }

    let message = vote_message(qc.view, &qc.block_hash);
    for (voter, signature) in qc.voters.iter().zip(&qc.signatures) {
        let public_key = replicas
            .public_key(*voter)
            .ok_or(CertificateError::UnknownVoter(*voter))?;
        if !verify(public_key, &message, signature) {
            return Err(CertificateError::BadSignature(*voter));
        }
    }

    Ok(())
}
