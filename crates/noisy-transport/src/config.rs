//! Engine sizing and load-shedding knobs.

use std::time::Duration;

use noisy_core::{MAX_SEGMENT_SIZE, MESSAGE_INITIATION_SIZE};
use serde::{Deserialize, Serialize};

use crate::error::TransportError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Per-peer backlog of plaintext waiting for a session key.
    pub queue_staged_size: usize,
    pub queue_outbound_size: usize,
    pub queue_inbound_size: usize,
    pub queue_handshake_size: usize,
    /// Size of every pooled packet buffer.
    pub max_segment_size: usize,
    /// Cap on buffers in flight. Zero leaves the pool unbounded.
    pub preallocated_buffers_per_pool: usize,
    /// Workers per pool. Zero uses the available parallelism.
    pub workers: usize,
    /// Under load once the handshake queue holds capacity / divisor messages.
    pub under_load_divisor: usize,
    /// How long the under-load state persists after the queue drains.
    pub under_load_after_ms: u64,
    pub max_peers: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            queue_staged_size: 128,
            queue_outbound_size: 1024,
            queue_inbound_size: 1024,
            queue_handshake_size: 1024,
            max_segment_size: MAX_SEGMENT_SIZE,
            preallocated_buffers_per_pool: 0,
            workers: 0,
            under_load_divisor: 8,
            under_load_after_ms: 1000,
            max_peers: 1 << 16,
        }
    }
}

impl TransportConfig {
    pub fn from_json(json: &str) -> Result<Self, TransportError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), TransportError> {
        let queues = [
            ("queue_staged_size", self.queue_staged_size),
            ("queue_outbound_size", self.queue_outbound_size),
            ("queue_inbound_size", self.queue_inbound_size),
            ("queue_handshake_size", self.queue_handshake_size),
        ];
        for (name, size) in queues {
            if size == 0 {
                return Err(TransportError::InvalidConfig(format!("{} must be non-zero", name)));
            }
        }
        if self.under_load_divisor == 0 {
            return Err(TransportError::InvalidConfig(
                "under_load_divisor must be non-zero".into(),
            ));
        }
        if self.max_segment_size < MESSAGE_INITIATION_SIZE
            || self.max_segment_size > MAX_SEGMENT_SIZE
        {
            return Err(TransportError::InvalidConfig(format!(
                "max_segment_size must be between {} and {}",
                MESSAGE_INITIATION_SIZE, MAX_SEGMENT_SIZE
            )));
        }
        if self.max_peers == 0 {
            return Err(TransportError::InvalidConfig("max_peers must be non-zero".into()));
        }
        Ok(())
    }

    pub fn worker_count(&self) -> usize {
        if self.workers > 0 {
            return self.workers;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }

    pub fn under_load_after(&self) -> Duration {
        Duration::from_millis(self.under_load_after_ms)
    }

    /// Handshake queue depth at which the transport is considered under load.
    pub fn under_load_threshold(&self) -> usize {
        self.queue_handshake_size / self.under_load_divisor
    }
}
