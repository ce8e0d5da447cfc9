//! Memory-region key source.
//!
//! Keys are drawn from one process-wide pool in blocks of 256, so every key
//! source hands out globally distinct values without further coordination.
//! On a provider-keyed domain the values are advisory, but each
//! registration still cites one.

use std::sync::atomic::{AtomicU64, Ordering};

/// Block width each source claims from the pool.
pub const KEY_STRIDE: u64 = 256;

static NEXT_KEY_POOL: AtomicU64 = AtomicU64::new(512);

/// Monotonic allocator of 64-bit memory-region keys.
#[derive(Debug, Default)]
pub struct KeySource {
    next_key: u64,
}

impl KeySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next key. Claims a fresh 256-wide block when the current one is
    /// exhausted (and on first use).
    pub fn next(&mut self) -> u64 {
        if self.next_key % KEY_STRIDE == 0 {
            self.next_key = NEXT_KEY_POOL.fetch_add(KEY_STRIDE, Ordering::Relaxed);
        }
        let key = self.next_key;
        self.next_key += 1;
        key
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_monotonic_within_block() {
        let mut src = KeySource::new();
        let first = src.next();
        assert_eq!(first % KEY_STRIDE, 0);
        for i in 1..KEY_STRIDE {
            assert_eq!(src.next(), first + i);
        }
        // next call rolls into a fresh block
        let rolled = src.next();
        assert_eq!(rolled % KEY_STRIDE, 0);
        assert_ne!(rolled, first);
    }

    #[test]
    fn test_sources_never_collide() {
        let mut a = KeySource::new();
        let mut b = KeySource::new();
        let from_a: Vec<u64> = (0..KEY_STRIDE * 2).map(|_| a.next()).collect();
        let from_b: Vec<u64> = (0..KEY_STRIDE * 2).map(|_| b.next()).collect();
        for k in &from_b {
            assert!(!from_a.contains(k));
        }
    }
}
