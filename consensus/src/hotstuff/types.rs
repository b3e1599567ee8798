/// Core HotStuff data structures
///
/// Header, Block, Vote, QC, Timeout, Proposal and Genesis, plus the tagged
/// wire message exchanged between replicas.

use crate::crypto::{hash_data, BLSSignature};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// Re-export Hash for convenience
pub use crate::crypto::Hash;

const PROPOSAL_DOMAIN: &[u8] = b"hotstuff/proposal";
const TIMEOUT_DOMAIN: &[u8] = b"hotstuff/timeout";

/// Wire encoding errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),
}

/// Header structure
/// Contains view number, parent hash, payload digest and the QC justifying the parent
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub view: u64,
    pub parent: Hash,
    pub data_hash: Hash,
    pub justify: Option<QuorumCertificate>,
}

impl Header {
    /// Create a new header
    pub fn new(view: u64, parent: Hash, data_hash: Hash, justify: Option<QuorumCertificate>) -> Self {
        Self {
            view,
            parent,
            data_hash,
            justify,
        }
    }

    /// Create a genesis header committing to `data`
    pub fn genesis(data: &[u8]) -> Self {
        Self {
            view: 0,
            parent: Hash::zero(),
            data_hash: hash_data(data),
            justify: None,
        }
    }

    pub fn is_genesis(&self) -> bool {
        self.view == 0 && self.justify.is_none()
    }

    /// Compute the content hash of this header.
    ///
    /// Covers the QC's view and block hash but none of its signatures.
    pub fn hash(&self) -> Hash {
        let mut data = Vec::with_capacity(8 + 32 + 32 + 1 + 8 + 32);
        data.extend_from_slice(&self.view.to_le_bytes());
        data.extend_from_slice(self.parent.as_bytes());
        data.extend_from_slice(self.data_hash.as_bytes());

        match self.justify {
            Some(ref qc) => {
                data.push(1);
                data.extend_from_slice(&qc.view.to_le_bytes());
                data.extend_from_slice(qc.block_hash.as_bytes());
            }
            None => data.push(0),
        }

        hash_data(&data)
    }

    /// Check if this header directly extends another header
    pub fn extends_from(&self, other: &Header) -> bool {
        self.parent == other.hash()
    }
}

/// Block: a header plus the opaque payload it commits to
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: Header,
    pub data: Vec<u8>,
}

impl Block {
    pub fn new(header: Header, data: Vec<u8>) -> Self {
        Self { header, data }
    }

    pub fn hash(&self) -> Hash {
        self.header.hash()
    }

    /// Whether the payload matches the header's data hash
    pub fn is_consistent(&self) -> bool {
        hash_data(&self.data) == self.header.data_hash
    }
}

/// Quorum Certificate (QC)
/// Proof that a quorum of replicas voted for `block_hash` at `view`.
/// `voters` is sorted ascending and `signatures[i]` belongs to `voters[i]`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuorumCertificate {
    pub view: u64,
    pub block_hash: Hash,
    pub voters: Vec<u64>,
    pub signatures: Vec<BLSSignature>,
}

impl QuorumCertificate {
    pub fn new(view: u64, block_hash: Hash, voters: Vec<u64>, signatures: Vec<BLSSignature>) -> Self {
        Self {
            view,
            block_hash,
            voters,
            signatures,
        }
    }
}

/// Vote structure
/// Represents a single replica's vote on a header at a view
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    pub view: u64,
    pub block_hash: Hash,
    pub voter: u64,
    pub signature: BLSSignature,
}

impl Vote {
    pub fn new(view: u64, block_hash: Hash, voter: u64, signature: BLSSignature) -> Self {
        Self {
            view,
            block_hash,
            voter,
            signature,
        }
    }
}

/// Timeout message sent on view change.
///
/// `view` is the view the sender moves into; `high_qc` is the highest QC it
/// knows, so the next leader can extend it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timeout {
    pub view: u64,
    pub high_qc: QuorumCertificate,
    pub voter: u64,
    pub signature: BLSSignature,
}

impl Timeout {
    pub fn new(view: u64, high_qc: QuorumCertificate, voter: u64, signature: BLSSignature) -> Self {
        Self {
            view,
            high_qc,
            voter,
            signature,
        }
    }

    /// Bytes signed by the sender of a timeout
    pub fn signing_bytes(view: u64, high_qc: &QuorumCertificate) -> Vec<u8> {
        let mut data = Vec::with_capacity(TIMEOUT_DOMAIN.len() + 8 + 8 + 32);
        data.extend_from_slice(TIMEOUT_DOMAIN);
        data.extend_from_slice(&view.to_le_bytes());
        data.extend_from_slice(&high_qc.view.to_le_bytes());
        data.extend_from_slice(high_qc.block_hash.as_bytes());
        data
    }
}

/// Block proposal from the leader of `header.view`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    pub header: Header,
    pub data: Vec<u8>,
    pub signature: BLSSignature,
}

impl Proposal {
    pub fn new(header: Header, data: Vec<u8>, signature: BLSSignature) -> Self {
        Self {
            header,
            data,
            signature,
        }
    }

    /// Bytes signed by the proposer
    pub fn signing_bytes(header_hash: &Hash) -> Vec<u8> {
        let mut data = Vec::with_capacity(PROPOSAL_DOMAIN.len() + 32);
        data.extend_from_slice(PROPOSAL_DOMAIN);
        data.extend_from_slice(header_hash.as_bytes());
        data
    }
}

/// Genesis validation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GenesisError {
    #[error("Genesis header must be at view 0 without a justify QC")]
    InvalidHeader,

    #[error("Genesis certificate must certify the genesis header at view 0")]
    CertificateMismatch,
}

/// Genesis: the view 0 header and the certificate agreed out of band
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Genesis {
    pub header: Header,
    pub certificate: QuorumCertificate,
}

impl Genesis {
    pub fn new(header: Header, certificate: QuorumCertificate) -> Result<Self, GenesisError> {
        let genesis = Self { header, certificate };
        genesis.validate()?;
        Ok(genesis)
    }

    /// Structural checks; signatures are checked against a replica set separately
    pub fn validate(&self) -> Result<(), GenesisError> {
        if !self.header.is_genesis() {
            return Err(GenesisError::InvalidHeader);
        }
        if self.certificate.view != 0 || self.certificate.block_hash != self.header.hash() {
            return Err(GenesisError::CertificateMismatch);
        }
        Ok(())
    }

    pub fn hash(&self) -> Hash {
        self.header.hash()
    }
}

/// Durable part of the replica's consensus state
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusState {
    pub view: u64,
    pub last_voted: u64,
    pub high_qc: QuorumCertificate,
    pub locked_qc: QuorumCertificate,
}

/// Protocol messages exchanged between replicas
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    Proposal(Proposal),
    Vote(Vote),
    Certificate(QuorumCertificate),
    Timeout(Timeout),
}

impl Message {
    /// View the message refers to
    pub fn view(&self) -> u64 {
        match self {
            Message::Proposal(proposal) => proposal.header.view,
            Message::Vote(vote) => vote.view,
            Message::Certificate(qc) => qc.view,
            Message::Timeout(timeout) => timeout.view,
        }
    }

    /// Canonical wire encoding (bincode, fixed-width little-endian integers)
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Outbound message with the replica indices it is addressed to
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MsgTo {
    pub recipients: Vec<u64>,
    pub message: Message,
}

impl MsgTo {
    pub fn new(recipients: Vec<u64>, message: Message) -> Self {
        Self { recipients, message }
    }
}
