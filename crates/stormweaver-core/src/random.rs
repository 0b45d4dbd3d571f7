//! Seeded randomness for workers.
//!
//! Every worker owns one [`WorkloadRng`] derived from the run seed and its
//! worker id. The same run seed therefore reproduces every worker's random
//! stream, independent of how workers interleave.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;

/// Longest string [`WorkloadRng::alphanumeric`] produces.
pub const MAX_STRING_LEN: usize = 1 << 20;

const ALPHANUMERIC: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// Derive the seed of one worker's stream from the run seed.
pub fn derive_seed(run_seed: u64, worker: u32) -> u64 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"stormweaver-worker-seed");
    hasher.update(&run_seed.to_le_bytes());
    hasher.update(&worker.to_le_bytes());
    let hash = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&hash.as_bytes()[..8]);
    u64::from_le_bytes(bytes)
}

/// Draw a fresh run seed when the configuration doesn't fix one.
pub fn random_run_seed() -> u64 {
    rand::random()
}

/// Weights whose sum does not fit in a `u64`.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("total weight overflows u64")]
pub struct WeightOverflow;

/// Deterministic random source handed to a sandbox on every step.
#[derive(Debug, Clone)]
pub struct WorkloadRng {
    inner: StdRng,
}

impl WorkloadRng {
    pub fn new(seed: u64) -> Self {
        Self {
            inner: StdRng::seed_from_u64(seed),
        }
    }

    pub fn for_worker(run_seed: u64, worker: u32) -> Self {
        Self::new(derive_seed(run_seed, worker))
    }

    pub fn next_u64(&mut self) -> u64 {
        self.inner.random()
    }

    /// Uniform integer in `[min, max]`. Bounds given in the wrong order are swapped.
    pub fn int_range(&mut self, min: i64, max: i64) -> i64 {
        let (lo, hi) = if min <= max { (min, max) } else { (max, min) };
        self.inner.random_range(lo..=hi)
    }

    /// Uniform float in `[0, 1)`.
    pub fn float(&mut self) -> f64 {
        self.inner.random()
    }

    /// Uniform index into a collection of `len` elements; `None` when empty.
    pub fn index(&mut self, len: usize) -> Option<usize> {
        (len > 0).then(|| self.inner.random_range(0..len))
    }

    /// Alphanumeric string with a length drawn from `[min_len, max_len]`,
    /// both clamped to [`MAX_STRING_LEN`].
    pub fn alphanumeric(&mut self, min_len: usize, max_len: usize) -> String {
        let (lo, hi) = if min_len <= max_len {
            (min_len, max_len)
        } else {
            (max_len, min_len)
        };
        let (lo, hi) = (lo.min(MAX_STRING_LEN), hi.min(MAX_STRING_LEN));
        let len = self.inner.random_range(lo..=hi);
        (0..len)
            .map(|_| ALPHANUMERIC[self.inner.random_range(0..ALPHANUMERIC.len())] as char)
            .collect()
    }

    /// Pick an index proportionally to `weights`.
    ///
    /// Draws an offset into the cumulative weight and returns the first entry
    /// whose running total exceeds it. Zero weights are never picked; `None`
    /// when the total weight is zero.
    pub fn weighted_index(&mut self, weights: &[u64]) -> Result<Option<usize>, WeightOverflow> {
        let total = weights
            .iter()
            .try_fold(0u64, |sum, w| sum.checked_add(*w))
            .ok_or(WeightOverflow)?;
        if total == 0 {
            return Ok(None);
        }
        let offset = self.inner.random_range(0..total);
        let mut running = 0u64;
        for (idx, weight) in weights.iter().enumerate() {
            running += weight;
            if offset < running {
                return Ok(Some(idx));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_seed_same_stream() {
        let mut a = WorkloadRng::for_worker(42, 3);
        let mut b = WorkloadRng::for_worker(42, 3);
        for _ in 0..100 {
            assert_eq!(a.next_u64(), b.next_u64());
        }
    }

    #[test]
    fn test_workers_get_distinct_streams() {
        assert_ne!(derive_seed(42, 1), derive_seed(42, 2));
        assert_ne!(derive_seed(42, 1), derive_seed(43, 1));
    }

    #[test]
    fn test_int_range_bounds() {
        let mut rng = WorkloadRng::new(7);
        for _ in 0..1000 {
            let v = rng.int_range(-3, 3);
            assert!((-3..=3).contains(&v));
        }
        assert_eq!(rng.int_range(5, 5), 5);
        let swapped = rng.int_range(10, 1);
        assert!((1..=10).contains(&swapped));
    }

    #[test]
    fn test_alphanumeric() {
        let mut rng = WorkloadRng::new(7);
        for _ in 0..100 {
            let s = rng.alphanumeric(2, 8);
            assert!((2..=8).contains(&s.len()));
            assert!(s.chars().all(|c| c.is_ascii_alphanumeric()));
        }
    }

    #[test]
    fn test_weighted_index_skips_zero_weights() {
        let mut rng = WorkloadRng::new(1);
        let mut counts = [0usize; 3];
        for _ in 0..2000 {
            counts[rng.weighted_index(&[1, 0, 3]).unwrap().unwrap()] += 1;
        }
        assert_eq!(counts[1], 0);
        assert!(counts[2] > counts[0]);
        assert_eq!(rng.weighted_index(&[0, 0]), Ok(None));
        assert_eq!(rng.weighted_index(&[]), Ok(None));
    }

    #[test]
    fn test_weighted_index_rejects_overflowing_total() {
        let mut rng = WorkloadRng::new(1);
        assert_eq!(rng.weighted_index(&[u64::MAX, u64::MAX, 5]), Err(WeightOverflow));
        assert_eq!(rng.weighted_index(&[u64::MAX, 0]), Ok(Some(0)));
    }

    #[test]
    fn test_alphanumeric_length_is_capped() {
        let mut rng = WorkloadRng::new(1);
        assert_eq!(rng.alphanumeric(usize::MAX, usize::MAX).len(), MAX_STRING_LEN);
    }

    #[test]
    fn test_index_of_empty_is_none() {
        let mut rng = WorkloadRng::new(1);
        assert_eq!(rng.index(0), None);
        assert_eq!(rng.index(1), Some(0));
    }
}
