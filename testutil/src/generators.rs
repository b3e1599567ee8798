/// Test data generators

use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Environment variable overriding the seed used by [`test_seed`].
pub const SEED_ENV: &str = "HOTSTUFF_TEST_SEED";

/// Seed for a test run.
///
/// Reads `HOTSTUFF_TEST_SEED` when set so a failing run can be replayed,
/// otherwise derives one from the wall clock.
pub fn test_seed() -> u64 {
    if let Some(seed) = std::env::var(SEED_ENV).ok().and_then(|s| s.parse().ok()) {
        return seed;
    }
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// Deterministic RNG for the given seed
pub fn seeded_rng(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

/// Generate random bytes
pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    (0..len).map(|_| rng.gen()).collect()
}

/// Generate random message for testing
pub fn random_message() -> Vec<u8> {
    random_bytes(32)
}

/// 32 bytes of key material drawn from `rng`, suitable as BLS key-gen input
pub fn key_material(rng: &mut StdRng) -> [u8; 32] {
    let mut ikm = [0u8; 32];
    rng.fill(&mut ikm);
    ikm
}

/// Arbitrary opaque payloads, including the empty one
pub fn payload_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..256)
}
