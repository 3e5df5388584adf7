//! Sliding window for transport counter replay protection.
//!
//! # Design
//!
//! - The window is a ring of 128 blocks of 64 bits each
//! - One block is always being cleared, so 8128 counters are tracked
//! - Counters older than `last - 8128` are rejected
//! - Counters already seen within the window are rejected
//! - Counters at or beyond the reject limit are rejected
//!
//! # Thread Safety
//!
//! This implementation is NOT thread-safe. Wrap in a Mutex if needed.

use noisy_core::REJECT_AFTER_MESSAGES;

const BLOCK_BITS_LOG: u64 = 6;
const BLOCK_BITS: u64 = 1 << BLOCK_BITS_LOG;
const RING_BLOCKS: u64 = 1 << 7;
const BLOCK_MASK: u64 = RING_BLOCKS - 1;
const BIT_MASK: u64 = BLOCK_BITS - 1;

/// Number of counters tracked behind the highest one seen.
pub const WINDOW_SIZE: u64 = (RING_BLOCKS - 1) * BLOCK_BITS;

#[derive(Debug, Clone)]
pub struct ReplayFilter {
    /// Highest counter seen
    last: u64,
    ring: [u64; RING_BLOCKS as usize],
}

impl Default for ReplayFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplayFilter {
    pub fn new() -> Self {
        Self {
            last: 0,
            ring: [0; RING_BLOCKS as usize],
        }
    }

    /// Reset the window to initial state.
    pub fn reset(&mut self) {
        self.last = 0;
        self.ring = [0; RING_BLOCKS as usize];
    }

    /// Check and update using the protocol reject limit.
    pub fn check_and_update(&mut self, counter: u64) -> bool {
        self.validate_counter(counter, REJECT_AFTER_MESSAGES)
    }

    /// Returns true if `counter` is fresh and below `limit`, marking it as seen.
    pub fn validate_counter(&mut self, counter: u64, limit: u64) -> bool {
        if counter >= limit {
            return false;
        }

        let mut index_block = counter >> BLOCK_BITS_LOG;
        if counter > self.last {
            // Clear the blocks the window slides over
            let current = self.last >> BLOCK_BITS_LOG;
            let diff = (index_block - current).min(RING_BLOCKS);
            for i in current + 1..=current + diff {
                self.ring[(i & BLOCK_MASK) as usize] = 0;
            }
            self.last = counter;
        } else if self.last - counter > WINDOW_SIZE {
            return false;
        }

        index_block &= BLOCK_MASK;
        let index_bit = counter & BIT_MASK;
        let old = self.ring[index_block as usize];
        let new = old | (1 << index_bit);
        self.ring[index_block as usize] = new;
        old != new
    }

    /// Get the highest counter seen.
    pub fn last(&self) -> u64 {
        self.last
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequential_counters() {
        let mut filter = ReplayFilter::new();
        for i in 0..1000 {
            assert!(filter.check_and_update(i), "counter {} should be valid", i);
        }
    }

    #[test]
    fn test_replay_detection() {
        let mut filter = ReplayFilter::new();
        assert!(filter.check_and_update(0));
        assert!(filter.check_and_update(1));
        assert!(!filter.check_and_update(0));
        assert!(!filter.check_and_update(1));
    }

    #[test]
    fn test_out_of_order_within_window() {
        let mut filter = ReplayFilter::new();
        assert!(filter.check_and_update(10_000));
        assert!(filter.check_and_update(10_000 - WINDOW_SIZE));
        assert!(filter.check_and_update(4000));
        assert!(!filter.check_and_update(4000));
        assert!(!filter.check_and_update(10_000 - WINDOW_SIZE - 1));
    }

    #[test]
    fn test_window_slides() {
        let mut filter = ReplayFilter::new();
        assert!(filter.check_and_update(1));
        assert!(filter.check_and_update(WINDOW_SIZE + 1));
        // Exactly at the window edge
        assert!(!filter.check_and_update(1));
        assert!(filter.check_and_update(2));
        assert!(filter.check_and_update(WINDOW_SIZE + 3));
        assert!(!filter.check_and_update(2));
    }

    #[test]
    fn test_large_jump_clears_ring() {
        let mut filter = ReplayFilter::new();
        for i in 0..64 {
            assert!(filter.check_and_update(i));
        }
        let far = 1_000_000;
        assert!(filter.check_and_update(far));
        assert!(filter.check_and_update(far - 10));
        assert!(!filter.check_and_update(63));
    }

    #[test]
    fn test_reject_limit() {
        let mut filter = ReplayFilter::new();
        assert!(!filter.check_and_update(REJECT_AFTER_MESSAGES));
        assert!(!filter.validate_counter(10, 10));
        assert!(filter.validate_counter(9, 10));
    }

    #[test]
    fn test_reset() {
        let mut filter = ReplayFilter::new();
        assert!(filter.check_and_update(7));
        filter.reset();
        assert_eq!(filter.last(), 0);
        assert!(filter.check_and_update(7));
    }
}
