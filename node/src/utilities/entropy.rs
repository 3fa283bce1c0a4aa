//! Pluggable randomness for proposal tickets and priorities.
//!
//! Every proposal carries a random rank deciding which proposal a round
//! favours. Ranks do not have to be collision free; collisions only lower
//! the odds that a round commits. The default source is the operating
//! system CSPRNG; deterministic and low-entropy sources exist for tests.

use rand::rngs::OsRng;
use rand::{Rng, RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Mask keeping the low 63 bits, so drawn values stay non-negative when
/// widened to `i64`.
const MASK_63: u64 = (1 << 63) - 1;

/// A source of uniformly random 63-bit non-negative values.
pub trait Entropy: Send {
    fn next(&mut self) -> u64;
}

/// Operating-system CSPRNG source, the default for production groups.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsEntropy;

impl Entropy for OsEntropy {
    fn next(&mut self) -> u64 {
        OsRng.gen::<u64>() & MASK_63
    }
}

/// Deterministic source for reproducible simulations.
#[derive(Debug, Clone)]
pub struct SeededEntropy(ChaCha8Rng);

impl SeededEntropy {
    pub fn new(seed: u64) -> SeededEntropy {
        SeededEntropy(ChaCha8Rng::seed_from_u64(seed))
    }
}

impl Entropy for SeededEntropy {
    fn next(&mut self) -> u64 {
        self.0.next_u64() & MASK_63
    }
}

/// Restricts an inner source to `0..bound`, making rank collisions likely.
/// Collisions exercise the no-commit paths of consensus rounds.
#[derive(Debug, Clone)]
pub struct BoundedEntropy<E> {
    inner: E,
    bound: u64,
}

impl<E: Entropy> BoundedEntropy<E> {
    pub fn new(inner: E, bound: u64) -> BoundedEntropy<E> {
        assert!(bound > 0, "entropy bound must be positive");
        BoundedEntropy { inner, bound }
    }
}

impl<E: Entropy> Entropy for BoundedEntropy<E> {
    fn next(&mut self) -> u64 {
        self.inner.next() % self.bound
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn values_fit_in_63_bits() {
        let mut entropy = OsEntropy;
        for _ in 0..64 {
            assert!(entropy.next() <= MASK_63);
        }
    }

    #[test]
    fn seeded_source_is_reproducible() {
        let mut a = SeededEntropy::new(7);
        let mut b = SeededEntropy::new(7);
        for _ in 0..16 {
            assert_eq!(a.next(), b.next());
        }
    }

    #[test]
    fn bounded_source_respects_bound() {
        let mut entropy = BoundedEntropy::new(SeededEntropy::new(1), 2);
        for _ in 0..32 {
            assert!(entropy.next() < 2);
        }
    }
}
