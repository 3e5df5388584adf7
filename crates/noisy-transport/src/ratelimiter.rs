//! Per-source token bucket for handshake messages.
//!
//! Tokens are kept in nanoseconds: each packet costs `1s / PACKETS_PER_SECOND`
//! and a bucket holds at most `PACKETS_BURSTABLE` packets worth. IPv6 sources
//! are bucketed by their /64 prefix. Idle buckets are garbage collected once
//! per second.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv6Addr};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tracing::debug;

pub const PACKETS_PER_SECOND: u64 = 20;
pub const PACKETS_BURSTABLE: u64 = 5;
pub const GARBAGE_COLLECT_TIME: Duration = Duration::from_secs(1);
const PACKET_COST: u64 = 1_000_000_000 / PACKETS_PER_SECOND;
const MAX_TOKENS: u64 = PACKET_COST * PACKETS_BURSTABLE;

#[derive(Debug, Clone, Copy)]
struct RateLimiterEntry {
    last_time: Instant,
    tokens: u64,
}

pub struct RateLimiter {
    table: Mutex<HashMap<IpAddr, RateLimiterEntry>>,
    gc: Mutex<Option<JoinHandle<()>>>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

fn bucket_key(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V4(_) => ip,
        IpAddr::V6(v6) => {
            if let Some(v4) = v6.to_ipv4_mapped() {
                return IpAddr::V4(v4);
            }
            let mut octets = v6.octets();
            octets[8..].fill(0);
            IpAddr::V6(Ipv6Addr::from(octets))
        }
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            table: Mutex::new(HashMap::new()),
            gc: Mutex::new(None),
        }
    }

    /// Start the background garbage collector. Requires a tokio runtime.
    pub fn start(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(GARBAGE_COLLECT_TIME);
            loop {
                interval.tick().await;
                let Some(limiter) = weak.upgrade() else {
                    break;
                };
                let removed = limiter.garbage_collect_at(Instant::now());
                if removed > 0 {
                    debug!("rate limiter collected {} idle entries", removed);
                }
            }
        });
        if let Ok(mut gc) = self.gc.lock() {
            if let Some(old) = gc.replace(handle) {
                old.abort();
            }
        }
    }

    /// Stop the garbage collector and forget all buckets.
    pub fn close(&self) {
        if let Ok(mut gc) = self.gc.lock() {
            if let Some(handle) = gc.take() {
                handle.abort();
            }
        }
        if let Ok(mut table) = self.table.lock() {
            table.clear();
        }
    }

    pub fn allow(&self, ip: IpAddr) -> bool {
        self.allow_at(ip, Instant::now())
    }

    pub fn allow_at(&self, ip: IpAddr, now: Instant) -> bool {
        let Ok(mut table) = self.table.lock() else {
            return false;
        };
        let key = bucket_key(ip);
        if !table.contains_key(&key) {
            table.insert(
                key,
                RateLimiterEntry {
                    last_time: now,
                    tokens: MAX_TOKENS - PACKET_COST,
                },
            );
            return true;
        }
        let Some(entry) = table.get_mut(&key) else {
            return false;
        };

        let elapsed = now.saturating_duration_since(entry.last_time).as_nanos();
        entry.tokens = (entry.tokens as u128 + elapsed).min(MAX_TOKENS as u128) as u64;
        entry.last_time = entry.last_time.max(now);

        if entry.tokens >= PACKET_COST {
            entry.tokens -= PACKET_COST;
            true
        } else {
            false
        }
    }

    /// Drop buckets idle for longer than the collection interval.
    pub fn garbage_collect_at(&self, now: Instant) -> usize {
        let Ok(mut table) = self.table.lock() else {
            return 0;
        };
        let before = table.len();
        table.retain(|_, entry| {
            now.saturating_duration_since(entry.last_time) <= GARBAGE_COLLECT_TIME
        });
        before - table.len()
    }

    pub fn len(&self) -> usize {
        self.table.lock().map(|t| t.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for RateLimiter {
    fn drop(&mut self) {
        if let Ok(mut gc) = self.gc.lock() {
            if let Some(handle) = gc.take() {
                handle.abort();
            }
        }
    }
}
