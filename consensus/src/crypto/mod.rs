/// Cryptography module for the replica
/// 
/// Implements:
/// - BLS signatures for votes, proposals and timeouts
/// - Hash function (BLAKE3) for content addressing

pub mod bls;
pub mod hash;

pub use bls::{sign, verify, BLSError, BLSKeyPair, BLSPublicKey, BLSSecretKey, BLSSignature};
pub use hash::{hash_data, Hash, HashError};

// Convenience re-exports
pub use hash::hash_data as hash;
