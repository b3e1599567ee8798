/// BLS signature implementation
/// 
/// Based on the BLS12-381 curve (min-pk variant), providing:
/// - 48-byte compressed public keys
/// - 96-byte compressed signatures
/// - Deterministic signatures (same key and message give the same bytes)
///
/// Every replica signs votes, proposals and timeouts with its BLS key. Quorum
/// certificates carry one signature per voter, positionally aligned with the
/// voter list, so each signature can be checked on its own.

use blst::min_pk::{
    PublicKey as BlstPublicKey, SecretKey as BlstSecretKey, Signature as BlstSignature,
};
use blst::BLST_ERROR;
use std::fmt;
use std::hash::{Hash as StdHash, Hasher};
use thiserror::Error;

pub const BLS_SIGNATURE_SIZE: usize = 96;
pub const BLS_PUBLIC_KEY_SIZE: usize = 48;
pub const BLS_SECRET_KEY_SIZE: usize = 32;

/// Domain separation tag for hash-to-curve (proof-of-possession ciphersuite)
const DST: &[u8] = b"BLS_SIG_BLS12381G2_XMD:SHA-256_SSWU_RO_POP_";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BLSError {
    #[error("Invalid signature")]
    InvalidSignature,
    #[error("Invalid key")]
    InvalidKey,
    #[error("Key material must be at least {BLS_SECRET_KEY_SIZE} bytes, got {0}")]
    ShortKeyMaterial(usize),
    #[error("Invalid hex encoding: {0}")]
    InvalidHex(String),
}

/// BLS secret key wrapper
#[derive(Clone)]
pub struct BLSSecretKey {
    inner: BlstSecretKey,
}

impl BLSSecretKey {
    /// Generate a new random secret key
    pub fn generate() -> Self {
        loop {
            let mut ikm = [0u8; 32];
            rand::Rng::fill(&mut rand::thread_rng(), &mut ikm);
            if let Ok(key) = Self::from_seed(&ikm) {
                return key;
            }
        }
    }

    /// Derive a secret key from at least 32 bytes of input key material
    pub fn from_seed(ikm: &[u8]) -> Result<Self, BLSError> {
        if ikm.len() < BLS_SECRET_KEY_SIZE {
            return Err(BLSError::ShortKeyMaterial(ikm.len()));
        }
        let inner = BlstSecretKey::key_gen(ikm, &[]).map_err(|_| BLSError::InvalidKey)?;
        Ok(Self { inner })
    }

    /// Create from raw bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BLSError> {
        let inner = BlstSecretKey::from_bytes(bytes).map_err(|_| BLSError::InvalidKey)?;
        Ok(Self { inner })
    }

    /// Serialize to bytes
    pub fn to_bytes(&self) -> [u8; BLS_SECRET_KEY_SIZE] {
        self.inner.to_bytes()
    }

    /// Get the corresponding public key
    pub fn public_key(&self) -> BLSPublicKey {
        BLSPublicKey {
            inner: self.inner.sk_to_pk(),
        }
    }
}

impl fmt::Debug for BLSSecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BLSSecretKey({})", self.public_key())
    }
}

/// BLS public key wrapper
#[derive(Clone)]
pub struct BLSPublicKey {
    inner: BlstPublicKey,
}

impl BLSPublicKey {
    /// Create from raw bytes (compressed or serialized form), validating the point
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BLSError> {
        let inner = BlstPublicKey::key_validate(bytes).map_err(|_| BLSError::InvalidKey)?;
        Ok(Self { inner })
    }

    /// Serialize to compressed bytes
    pub fn to_bytes(&self) -> [u8; BLS_PUBLIC_KEY_SIZE] {
        self.inner.to_bytes()
    }
}

impl PartialEq for BLSPublicKey {
    fn eq(&self, other: &Self) -> bool {
        self.to_bytes() == other.to_bytes()
    }
}

impl Eq for BLSPublicKey {}

impl StdHash for BLSPublicKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.to_bytes().hash(state);
    }
}

impl fmt::Display for BLSPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.to_bytes()[..8]))
    }
}

impl fmt::Debug for BLSPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BLSPublicKey({})", hex::encode(self.to_bytes()))
    }
}

/// BLS signature wrapper (constant 96 bytes)
#[derive(Clone)]
pub struct BLSSignature {
    inner: BlstSignature,
}

impl BLSSignature {
    /// Create from raw bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BLSError> {
        let inner = BlstSignature::from_bytes(bytes).map_err(|_| BLSError::InvalidSignature)?;
        Ok(Self { inner })
    }

    /// Serialize to bytes (always 96 bytes)
    pub fn to_bytes(&self) -> [u8; BLS_SIGNATURE_SIZE] {
        self.inner.to_bytes()
    }

    /// Get signature size (constant)
    pub fn size() -> usize {
        BLS_SIGNATURE_SIZE
    }
}

impl PartialEq for BLSSignature {
    fn eq(&self, other: &Self) -> bool {
        self.to_bytes() == other.to_bytes()
    }
}

impl Eq for BLSSignature {}

impl fmt::Debug for BLSSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BLSSignature({})", hex::encode(&self.to_bytes()[..8]))
    }
}

/// BLS Key pair (secret + public key)
#[derive(Clone, Debug)]
pub struct BLSKeyPair {
    pub secret_key: BLSSecretKey,
    pub public_key: BLSPublicKey,
}

impl BLSKeyPair {
    /// Generate a new key pair
    pub fn generate() -> Self {
        Self::from_secret(BLSSecretKey::generate())
    }

    /// Build the pair for an existing secret key
    pub fn from_secret(secret_key: BLSSecretKey) -> Self {
        let public_key = secret_key.public_key();
        Self { secret_key, public_key }
    }
}

/// Sign a message
pub fn sign(secret_key: &BLSSecretKey, message: &[u8]) -> BLSSignature {
    BLSSignature {
        inner: secret_key.inner.sign(message, DST, &[]),
    }
}

/// Verify a single signature against one public key
pub fn verify(public_key: &BLSPublicKey, message: &[u8], signature: &BLSSignature) -> bool {
    let result = signature
        .inner
        .verify(true, message, DST, &[], &public_key.inner, false);
    result == BLST_ERROR::BLST_SUCCESS
}

macro_rules! impl_serde_bytes {
    ($ty:ident, $expecting:literal) => {
        impl serde::Serialize for $ty {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                if serializer.is_human_readable() {
                    serializer.serialize_str(&hex::encode(self.to_bytes()))
                } else {
                    serializer.serialize_bytes(&self.to_bytes())
                }
            }
        }

        impl<'de> serde::Deserialize<'de> for $ty {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                use serde::de::Error;

                let bytes = if deserializer.is_human_readable() {
                    let text = String::deserialize(deserializer)?;
                    hex::decode(text)
                        .map_err(|e| D::Error::custom(BLSError::InvalidHex(e.to_string())))?
                } else {
                    Vec::<u8>::deserialize(deserializer)?
                };
                $ty::from_bytes(&bytes)
                    .map_err(|e| D::Error::custom(format!("{}: {}", $expecting, e)))
            }
        }
    };
}

impl_serde_bytes!(BLSPublicKey, "BLS public key");
impl_serde_bytes!(BLSSignature, "BLS signature");
