/// Lossy link simulation

use rand::rngs::StdRng;
use rand::Rng;
use std::sync::Mutex;

use crate::generators::seeded_rng;

/// Decides which outbound batches a simulated transport drops.
///
/// Every call to [`LossyLink::should_drop`] draws once from a seeded RNG, so a
/// whole batch is either delivered or lost.
pub struct LossyLink {
    drop_percent: u32,
    rng: Mutex<StdRng>,
}

impl LossyLink {
    /// Link dropping `drop_percent` percent of batches
    pub fn new(drop_percent: u32, seed: u64) -> Self {
        Self {
            drop_percent: drop_percent.min(100),
            rng: Mutex::new(seeded_rng(seed)),
        }
    }

    /// Link that delivers everything
    pub fn reliable() -> Self {
        Self::new(0, 0)
    }

    pub fn drop_percent(&self) -> u32 {
        self.drop_percent
    }

    /// Whether the next batch should be dropped
    pub fn should_drop(&self) -> bool {
        if self.drop_percent == 0 {
            return false;
        }
        let mut rng = match self.rng.lock() {
            Ok(rng) => rng,
            Err(poisoned) => poisoned.into_inner(),
        };
        rng.gen_range(0..100) < self.drop_percent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reliable_link_never_drops() {
        let link = LossyLink::reliable();
        assert!((0..1000).all(|_| !link.should_drop()));
    }

    #[test]
    fn test_full_loss_always_drops() {
        let link = LossyLink::new(100, 1);
        assert!((0..1000).all(|_| link.should_drop()));
    }

    #[test]
    fn test_drop_rate_is_roughly_respected() {
        let link = LossyLink::new(10, 42);
        let dropped = (0..10_000).filter(|_| link.should_drop()).count();
        assert!(dropped > 700 && dropped < 1300, "dropped {}", dropped);
    }
}
