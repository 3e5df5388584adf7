//! Session keypairs and their rotation.
//!
//! A peer holds at most three keypairs:
//! - `current`: sends and receives
//! - `previous`: receive-only, absorbs packets still in flight after a rotation
//! - `next`: derived by the responder, promoted once the initiator uses it

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chacha20poly1305::ChaCha20Poly1305;
use noisy_core::{
    REJECT_AFTER_MESSAGES, REJECT_AFTER_TIME, REKEY_AFTER_MESSAGES, REKEY_AFTER_TIME,
};
use noisy_crypto::aead::{self, CryptoError, TAG_SIZE};
use noisy_crypto::ReplayFilter;

pub struct Keypair {
    send: ChaCha20Poly1305,
    receive: ChaCha20Poly1305,
    send_nonce: AtomicU64,
    replay_filter: Mutex<ReplayFilter>,
    is_initiator: bool,
    created: Instant,
    local_index: u32,
    remote_index: u32,
}

impl Keypair {
    pub fn new(
        send_key: [u8; 32],
        receive_key: [u8; 32],
        is_initiator: bool,
        local_index: u32,
        remote_index: u32,
    ) -> Self {
        Self {
            send: aead::cipher(&send_key),
            receive: aead::cipher(&receive_key),
            send_nonce: AtomicU64::new(0),
            replay_filter: Mutex::new(ReplayFilter::new()),
            is_initiator,
            created: Instant::now(),
            local_index,
            remote_index,
        }
    }

    pub fn local_index(&self) -> u32 {
        self.local_index
    }

    pub fn remote_index(&self) -> u32 {
        self.remote_index
    }

    pub fn is_initiator(&self) -> bool {
        self.is_initiator
    }

    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }

    /// Past the hard age limit; no longer usable in either direction.
    pub fn is_expired(&self) -> bool {
        self.age() >= REJECT_AFTER_TIME
    }

    pub fn send_nonce(&self) -> u64 {
        self.send_nonce.load(Ordering::Acquire)
    }

    /// Usable for sending: below both hard limits.
    pub fn can_send(&self) -> bool {
        self.send_nonce() < REJECT_AFTER_MESSAGES && !self.is_expired()
    }

    /// Reserve the next send nonce. `None` once the message limit is reached.
    pub fn next_nonce(&self) -> Option<u64> {
        let nonce = self.send_nonce.fetch_add(1, Ordering::AcqRel);
        if nonce >= REJECT_AFTER_MESSAGES {
            self.send_nonce.store(REJECT_AFTER_MESSAGES, Ordering::Release);
            return None;
        }
        Some(nonce)
    }

    /// Make the keypair unusable for sending.
    pub fn expire_sending(&self) {
        self.send_nonce.store(REJECT_AFTER_MESSAGES, Ordering::Release);
    }

    /// A new handshake should be started after sending under this keypair.
    pub fn needs_rekey_after_send(&self) -> bool {
        self.send_nonce() > REKEY_AFTER_MESSAGES
            || (self.is_initiator && self.age() > REKEY_AFTER_TIME)
    }

    /// Encrypt `buffer` in place. The receiver index is the associated data.
    pub fn seal(&self, nonce: u64, buffer: &mut [u8]) -> Result<[u8; TAG_SIZE], CryptoError> {
        aead::seal_in_place(&self.send, nonce, &self.remote_index.to_le_bytes(), buffer)
    }

    pub fn open(
        &self,
        nonce: u64,
        buffer: &mut [u8],
        tag: &[u8; TAG_SIZE],
    ) -> Result<(), CryptoError> {
        aead::open_in_place(
            &self.receive,
            nonce,
            &self.local_index.to_le_bytes(),
            buffer,
            tag,
        )
    }

    /// Record an authenticated counter. False for replays and stale counters.
    pub fn accept_counter(&self, counter: u64) -> bool {
        match self.replay_filter.lock() {
            Ok(mut filter) => filter.validate_counter(counter, REJECT_AFTER_MESSAGES),
            Err(_) => false,
        }
    }

    #[cfg(test)]
    pub(crate) fn set_send_nonce(&self, nonce: u64) {
        self.send_nonce.store(nonce, Ordering::Release);
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("local_index", &self.local_index)
            .field("remote_index", &self.remote_index)
            .field("is_initiator", &self.is_initiator)
            .field("send_nonce", &self.send_nonce())
            .finish()
    }
}

/// The current/previous/next keypairs of one peer.
#[derive(Default)]
pub struct Keypairs {
    pub current: Option<Arc<Keypair>>,
    pub previous: Option<Arc<Keypair>>,
    pub next: Option<Arc<Keypair>>,
}

impl Keypairs {
    /// Install a keypair derived from a completed handshake. Returns the
    /// keypairs that were displaced, whose indices must be released.
    pub fn install(&mut self, keypair: Arc<Keypair>) -> Vec<Arc<Keypair>> {
        let mut displaced = Vec::new();
        if keypair.is_initiator() {
            match self.next.take() {
                Some(next) => {
                    // Responder-derived key never used; keep it receive-only.
                    displaced.extend(self.current.take());
                    displaced.extend(self.previous.replace(next));
                }
                None => {
                    let current = self.current.take();
                    displaced.extend(std::mem::replace(&mut self.previous, current));
                }
            }
            self.current = Some(keypair);
        } else {
            displaced.extend(self.next.replace(keypair));
            displaced.extend(self.previous.take());
        }
        displaced
    }

    /// Promote `next` if `received` is it. Returns whether a promotion took
    /// place and the displaced previous keypair, if any.
    pub fn received_with(&mut self, received: &Arc<Keypair>) -> (bool, Option<Arc<Keypair>>) {
        match &self.next {
            Some(next) if Arc::ptr_eq(next, received) => {}
            _ => return (false, None),
        }
        let old = self.previous.take();
        self.previous = self.current.take();
        self.current = self.next.take();
        (true, old)
    }

    /// Take every keypair, leaving the set empty.
    pub fn clear(&mut self) -> Vec<Arc<Keypair>> {
        [self.previous.take(), self.current.take(), self.next.take()]
            .into_iter()
            .flatten()
            .collect()
    }

    /// The current keypair if it may still be used for sending.
    pub fn sendable(&self) -> Option<Arc<Keypair>> {
        self.current.as_ref().filter(|k| k.can_send()).cloned()
    }

    pub fn receive_capable(&self) -> usize {
        [&self.current, &self.previous, &self.next]
            .into_iter()
            .filter(|k| k.is_some())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(initiator: bool, index: u32) -> Arc<Keypair> {
        Arc::new(Keypair::new(
            [index as u8; 32],
            [index as u8 + 1; 32],
            initiator,
            index,
            index + 100,
        ))
    }

    fn matching(a: &Keypair) -> Keypair {
        // Swap directions and indices to get the remote side's view.
        Keypair::new(
            [a.local_index as u8 + 1; 32],
            [a.local_index as u8; 32],
            !a.is_initiator,
            a.remote_index,
            a.local_index,
        )
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let a = pair(true, 1);
        let b = matching(&a);

        let mut buf = *b"abc";
        let nonce = a.next_nonce().unwrap();
        let tag = a.seal(nonce, &mut buf).unwrap();
        assert_ne!(&buf, b"abc");
        b.open(nonce, &mut buf, &tag).unwrap();
        assert_eq!(&buf, b"abc");
        assert!(b.accept_counter(nonce));
        assert!(!b.accept_counter(nonce));
    }

    #[test]
    fn test_tampered_ciphertext_rejected() {
        let a = pair(true, 1);
        let b = matching(&a);

        let mut buf = *b"abc";
        let tag = a.seal(0, &mut buf).unwrap();
        buf[0] ^= 1;
        assert!(b.open(0, &mut buf, &tag).is_err());

        let mut buf = *b"abc";
        let tag = a.seal(0, &mut buf).unwrap();
        assert!(b.open(1, &mut buf, &tag).is_err());
    }

    #[test]
    fn test_nonce_limits() {
        let a = pair(true, 1);
        assert_eq!(a.next_nonce(), Some(0));
        assert_eq!(a.next_nonce(), Some(1));

        a.set_send_nonce(REKEY_AFTER_MESSAGES + 1);
        assert!(a.needs_rekey_after_send());
        assert!(a.can_send());

        a.set_send_nonce(REJECT_AFTER_MESSAGES);
        assert!(!a.can_send());
        assert_eq!(a.next_nonce(), None);
        assert_eq!(a.send_nonce(), REJECT_AFTER_MESSAGES);
    }

    #[test]
    fn test_initiator_rotation() {
        let mut set = Keypairs::default();
        let first = pair(true, 1);
        assert!(set.install(first.clone()).is_empty());
        assert!(Arc::ptr_eq(set.current.as_ref().unwrap(), &first));

        let second = pair(true, 2);
        assert!(set.install(second.clone()).is_empty());
        assert!(Arc::ptr_eq(set.current.as_ref().unwrap(), &second));
        assert!(Arc::ptr_eq(set.previous.as_ref().unwrap(), &first));

        let third = pair(true, 3);
        let displaced = set.install(third.clone());
        assert_eq!(displaced.len(), 1);
        assert!(Arc::ptr_eq(&displaced[0], &first));
        assert!(set.receive_capable() <= 2);
    }

    #[test]
    fn test_responder_promotion_on_first_packet() {
        let mut set = Keypairs::default();
        let old = pair(true, 1);
        set.install(old.clone());

        let new = pair(false, 2);
        assert!(set.install(new.clone()).is_empty());
        // Still sending under the old key until the initiator uses the new one.
        assert!(Arc::ptr_eq(&set.sendable().unwrap(), &old));

        let unrelated = pair(false, 9);
        assert_eq!(set.received_with(&unrelated).0, false);
        assert_eq!(set.received_with(&old).0, false);

        let (promoted, displaced) = set.received_with(&new);
        assert!(promoted);
        assert!(displaced.is_none());
        assert!(Arc::ptr_eq(set.current.as_ref().unwrap(), &new));
        assert!(Arc::ptr_eq(set.previous.as_ref().unwrap(), &old));
        assert!(set.next.is_none());
    }

    #[test]
    fn test_never_more_than_two_receive_keys() {
        let mut set = Keypairs::default();
        for i in 0..10u32 {
            set.install(pair(i % 2 == 0, i + 1));
            assert!(set.receive_capable() <= 2, "after install {}", i);
            if let Some(next) = set.next.clone() {
                set.received_with(&next);
                assert!(set.receive_capable() <= 2, "after promotion {}", i);
            }
        }
    }

    #[test]
    fn test_previous_still_decrypts_after_rotation() {
        let mut set = Keypairs::default();
        let old = pair(true, 1);
        let remote_old = matching(&old);
        set.install(old.clone());
        set.install(pair(true, 2));

        let mut buf = *b"late packet";
        let tag = remote_old.seal(7, &mut buf).unwrap();
        let previous = set.previous.clone().unwrap();
        previous.open(7, &mut buf, &tag).unwrap();
        assert_eq!(&buf, b"late packet");
    }

    #[test]
    fn test_clear() {
        let mut set = Keypairs::default();
        set.install(pair(true, 1));
        set.install(pair(false, 2));
        assert_eq!(set.clear().len(), 2);
        assert_eq!(set.receive_capable(), 0);
    }
}
