/// Testing utilities for hotstuff-consensus
/// 
/// Provides:
/// - Seeded random generators for reproducible runs
/// - Proptest strategies for payloads
/// - Lossy link simulation for message drop tests

pub mod generators;
pub mod network;

pub use generators::*;
pub use network::LossyLink;
