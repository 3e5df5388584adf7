//! Reusable packet buffers.
//!
//! Every datagram and every staged plaintext lives in a fixed-capacity buffer
//! drawn from a shared pool. Buffers return to the pool when dropped, so the
//! steady-state data path does not allocate. A pool may cap the number of
//! buffers in flight, in which case acquisition waits for a buffer to be
//! returned.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

use noisy_core::{MESSAGE_TRANSPORT_HEADER_SIZE, POLY1305_TAG_SIZE};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Buffers kept for reuse by an uncapped pool.
const DEFAULT_RETAIN: usize = 1024;

/// Statistics about buffer pool usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BufferPoolStats {
    pub allocations: u64,
    pub reuses: u64,
    pub in_use_count: usize,
    pub available_count: usize,
}

struct PoolShared {
    buffer_size: usize,
    retain: usize,
    available: Mutex<Vec<Vec<u8>>>,
    stats: Mutex<BufferPoolStats>,
}

impl PoolShared {
    fn release(&self, data: Vec<u8>) {
        let available = {
            let mut available = match self.available.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if available.len() < self.retain {
                available.push(data);
            }
            available.len()
        };
        if let Ok(mut stats) = self.stats.lock() {
            stats.in_use_count = stats.in_use_count.saturating_sub(1);
            stats.available_count = available;
        }
    }
}

/// Shared pool of fixed-capacity packet buffers.
#[derive(Clone)]
pub struct BufferPool {
    shared: Arc<PoolShared>,
    limit: Option<Arc<Semaphore>>,
}

impl BufferPool {
    /// Create a pool of `buffer_size`-byte buffers. `max_buffers == 0` leaves
    /// the pool uncapped.
    pub fn new(buffer_size: usize, max_buffers: usize) -> Self {
        let (retain, limit) = if max_buffers == 0 {
            (DEFAULT_RETAIN, None)
        } else {
            (max_buffers, Some(Arc::new(Semaphore::new(max_buffers))))
        };
        Self {
            shared: Arc::new(PoolShared {
                buffer_size,
                retain,
                available: Mutex::new(Vec::new()),
                stats: Mutex::new(BufferPoolStats::default()),
            }),
            limit,
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.shared.buffer_size
    }

    /// Acquire a buffer, waiting for one to be returned if the pool is capped
    /// and exhausted.
    pub async fn get(&self) -> PacketBuffer {
        let permit = match &self.limit {
            // The semaphore is never closed, so acquisition only fails if it were.
            Some(limit) => limit.clone().acquire_owned().await.ok(),
            None => None,
        };
        self.take(permit)
    }

    /// Acquire a buffer without waiting. Returns `None` when a capped pool is
    /// exhausted.
    pub fn try_get(&self) -> Option<PacketBuffer> {
        let permit = match &self.limit {
            Some(limit) => Some(limit.clone().try_acquire_owned().ok()?),
            None => None,
        };
        Some(self.take(permit))
    }

    fn take(&self, permit: Option<OwnedSemaphorePermit>) -> PacketBuffer {
        let reused = match self.shared.available.lock() {
            Ok(mut available) => available.pop(),
            Err(poisoned) => poisoned.into_inner().pop(),
        };
        let data = match reused {
            Some(data) => {
                if let Ok(mut stats) = self.shared.stats.lock() {
                    stats.reuses += 1;
                    stats.in_use_count += 1;
                    stats.available_count = stats.available_count.saturating_sub(1);
                }
                data
            }
            None => {
                if let Ok(mut stats) = self.shared.stats.lock() {
                    stats.allocations += 1;
                    stats.in_use_count += 1;
                }
                vec![0u8; self.shared.buffer_size]
            }
        };
        PacketBuffer {
            data,
            len: 0,
            pool: Some(self.shared.clone()),
            _permit: permit,
        }
    }

    /// Get current statistics about pool usage.
    pub fn stats(&self) -> BufferPoolStats {
        self.shared
            .stats
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }
}

/// A pooled buffer. Dereferences to the filled portion `[..len]`.
///
/// Outbound plaintext is written after a reserved transport header so that
/// encryption can happen in place.
pub struct PacketBuffer {
    data: Vec<u8>,
    len: usize,
    pool: Option<Arc<PoolShared>>,
    _permit: Option<OwnedSemaphorePermit>,
}

impl PacketBuffer {
    /// A standalone buffer that is not returned to any pool.
    pub fn detached(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity],
            len: 0,
            pool: None,
            _permit: None,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// The whole backing storage, for receiving a datagram into.
    pub fn storage_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn set_len(&mut self, len: usize) {
        self.len = len.min(self.data.len());
    }

    /// Largest plaintext that still leaves room for the header and tag.
    pub fn max_payload(&self) -> usize {
        self.data
            .len()
            .saturating_sub(MESSAGE_TRANSPORT_HEADER_SIZE + POLY1305_TAG_SIZE)
    }

    /// Copy `payload` after the reserved header. Returns false if it does not fit.
    pub fn set_payload(&mut self, payload: &[u8]) -> bool {
        if payload.len() > self.max_payload() {
            return false;
        }
        let start = MESSAGE_TRANSPORT_HEADER_SIZE;
        self.data[start..start + payload.len()].copy_from_slice(payload);
        self.len = start + payload.len();
        true
    }

    /// Bytes between the reserved header and `len`.
    pub fn payload(&self) -> &[u8] {
        let start = MESSAGE_TRANSPORT_HEADER_SIZE.min(self.len);
        &self.data[start..self.len]
    }
}

impl Deref for PacketBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data[..self.len]
    }
}

impl DerefMut for PacketBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data[..self.len]
    }
}

impl Drop for PacketBuffer {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.release(std::mem::take(&mut self.data));
        }
    }
}

impl std::fmt::Debug for PacketBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketBuffer")
            .field("len", &self.len)
            .field("capacity", &self.data.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_buffer_pool_reuse() {
        let pool = BufferPool::new(128, 0);

        let buf = pool.get().await;
        assert_eq!(buf.capacity(), 128);
        drop(buf);

        let _buf = pool.get().await;
        let stats = pool.stats();
        assert_eq!(stats.allocations, 1);
        assert_eq!(stats.reuses, 1);
        assert_eq!(stats.in_use_count, 1);
    }

    #[tokio::test]
    async fn test_capped_pool_blocks_until_release() {
        let pool = BufferPool::new(64, 1);
        let held = pool.get().await;
        assert!(pool.try_get().is_none());

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.get().await.capacity() })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(held);
        let capacity = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter released")
            .unwrap();
        assert_eq!(capacity, 64);
    }

    #[test]
    fn test_payload_reserves_header_and_tag() {
        let mut buf = PacketBuffer::detached(64);
        assert_eq!(buf.max_payload(), 32);
        assert!(buf.set_payload(&[7u8; 32]));
        assert_eq!(buf.len(), 48);
        assert_eq!(buf.payload(), &[7u8; 32]);
        assert!(!buf.set_payload(&[7u8; 33]));
    }

    #[test]
    fn test_empty_payload() {
        let mut buf = PacketBuffer::detached(64);
        assert!(buf.set_payload(&[]));
        assert_eq!(buf.len(), MESSAGE_TRANSPORT_HEADER_SIZE);
        assert!(buf.payload().is_empty());
    }
}
