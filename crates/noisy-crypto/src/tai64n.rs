//! TAI64N timestamps.
//!
//! An initiation carries the sender's wall-clock time so the responder can
//! reject replays of older initiations. The nanosecond field is whitened to
//! avoid leaking a precise clock to the network.

use std::time::{SystemTime, UNIX_EPOCH};

pub const TIMESTAMP_SIZE: usize = 12;

const TAI64_BASE: u64 = (1 << 62) + 10;
const WHITENER_MASK: u32 = 0x1000000 - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct Timestamp([u8; TIMESTAMP_SIZE]);

impl Timestamp {
    pub fn now() -> Self {
        Self::from_system_time(SystemTime::now())
    }

    pub fn from_system_time(time: SystemTime) -> Self {
        let since_epoch = time.duration_since(UNIX_EPOCH).unwrap_or_default();
        let secs = TAI64_BASE + since_epoch.as_secs();
        let nanos = since_epoch.subsec_nanos() & !WHITENER_MASK;

        let mut out = [0u8; TIMESTAMP_SIZE];
        out[..8].copy_from_slice(&secs.to_be_bytes());
        out[8..].copy_from_slice(&nanos.to_be_bytes());
        Self(out)
    }

    pub fn from_bytes(bytes: [u8; TIMESTAMP_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; TIMESTAMP_SIZE] {
        &self.0
    }

    /// Big-endian encoding makes byte order equal time order.
    pub fn after(&self, other: &Timestamp) -> bool {
        self.0 > other.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_ordering() {
        let base = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let earlier = Timestamp::from_system_time(base);
        let later = Timestamp::from_system_time(base + Duration::from_secs(1));
        assert!(later.after(&earlier));
        assert!(!earlier.after(&later));
        assert!(!earlier.after(&earlier));
    }

    #[test]
    fn test_nanos_whitened() {
        let base = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let a = Timestamp::from_system_time(base + Duration::from_nanos(1));
        let b = Timestamp::from_system_time(base + Duration::from_nanos(1000));
        assert_eq!(a, b);
    }

    #[test]
    fn test_default_is_before_now() {
        assert!(Timestamp::now().after(&Timestamp::default()));
    }
}
