//! Per-peer reorder buffer.
//!
//! Packets are tagged with a per-peer sequence number when they are queued
//! for encryption or decryption. Workers finish them in any order; the peer's
//! sequential routine inserts each finished packet here and releases only
//! the consecutive run starting at the next expected sequence number.

use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReorderError {
    PacketTooOld,
}

/// Reorder buffer over `u64` sequence numbers with a bounded window.
#[derive(Debug)]
pub struct ReorderBuffer<T> {
    slots: VecDeque<Option<T>>,
    // Items pushed out of the window by a slide, still in sequence order.
    released: Vec<T>,
    window_start: u64,
    window_size: u64,
}

impl<T> ReorderBuffer<T> {
    /// Create a buffer expecting `start` next. Sequence numbers more than
    /// `window_size` ahead of the oldest missing one push the window forward;
    /// items already held behind the new start are released by the next
    /// flush, and only the missing sequence numbers are given up.
    pub fn new(start: u64, window_size: u64) -> Self {
        Self {
            slots: VecDeque::new(),
            released: Vec::new(),
            window_start: start,
            window_size: window_size.max(1),
        }
    }

    pub fn insert(&mut self, seq: u64, item: T) -> Result<(), ReorderError> {
        if seq < self.window_start {
            return Err(ReorderError::PacketTooOld);
        }

        // Slide window forward if packet is beyond our window
        if seq >= self.window_start + self.window_size {
            let advance = seq - self.window_start - self.window_size + 1;
            self.slide_window(advance);
        }

        let idx = (seq - self.window_start) as usize;
        if self.slots.len() <= idx {
            self.slots.resize_with(idx + 1, || None);
        }
        self.slots[idx] = Some(item);
        Ok(())
    }

    /// Remove everything released by a slide, then all consecutive items
    /// starting from the window start.
    pub fn flush_ordered(&mut self) -> Vec<T> {
        let mut result = std::mem::take(&mut self.released);
        while let Some(Some(_)) = self.slots.front() {
            if let Some(Some(item)) = self.slots.pop_front() {
                result.push(item);
                self.window_start += 1;
            }
        }
        result
    }

    /// Move the window start forward by `count`, keeping any items held in
    /// the slots it passes over.
    fn slide_window(&mut self, count: u64) {
        for _ in 0..count {
            if let Some(Some(item)) = self.slots.pop_front() {
                self.released.push(item);
            }
            self.window_start += 1;
        }
    }

    pub fn window_start(&self) -> u64 {
        self.window_start
    }

    #[cfg(test)]
    fn packet_count(&self) -> usize {
        self.released.len() + self.slots.iter().filter(|p| p.is_some()).count()
    }
}
