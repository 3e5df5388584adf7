//! Cookie MACs for handshake denial-of-service mitigation.
//!
//! Every handshake message ends with two MACs:
//!
//! ```text
//! mac1 = MAC(HASH("mac1----" || responder_static), msg[..len - 32])
//! mac2 = MAC(cookie, msg[..len - 16])            (zero when no cookie)
//! cookie = MAC(secret, source_ip || source_port)
//! ```
//!
//! `mac1` proves the sender knows the responder's public key and is always
//! checked. When the responder is under load it also requires `mac2`, and
//! answers initiations without one by sending the cookie back, sealed with
//! XChaCha20-Poly1305 under `HASH("cookie--" || responder_static)` and bound
//! to the offending message's `mac1`.

use std::net::{IpAddr, SocketAddr};
use std::time::Instant;

use noisy_core::{MessageCookieReply, COOKIE_REFRESH_TIME, MAC_SIZE};
use rand::rngs::OsRng;
use rand::RngCore;
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

use crate::aead::{xopen, xseal, CryptoError};
use crate::hash::{hash, mac, HASH_SIZE};
use crate::keys::NoisePublicKey;

pub const LABEL_MAC1: &[u8; 8] = b"mac1----";
pub const LABEL_COOKIE: &[u8; 8] = b"cookie--";

type Cookie = [u8; MAC_SIZE];

fn mac1_key(key: &NoisePublicKey) -> [u8; HASH_SIZE] {
    hash(&[LABEL_MAC1, key.as_bytes()])
}

fn cookie_key(key: &NoisePublicKey) -> [u8; HASH_SIZE] {
    hash(&[LABEL_COOKIE, key.as_bytes()])
}

fn mac_offsets(msg: &[u8]) -> Option<(usize, usize)> {
    let smac2 = msg.len().checked_sub(MAC_SIZE)?;
    let smac1 = smac2.checked_sub(MAC_SIZE)?;
    Some((smac1, smac2))
}

fn source_bytes(src: &SocketAddr) -> Vec<u8> {
    let mut out = match src.ip() {
        IpAddr::V4(ip) => ip.octets().to_vec(),
        IpAddr::V6(ip) => ip.octets().to_vec(),
    };
    out.extend_from_slice(&src.port().to_be_bytes());
    out
}

/// Responder side: validates MACs and issues cookies.
pub struct CookieChecker {
    mac1_key: [u8; HASH_SIZE],
    encryption_key: [u8; HASH_SIZE],
    secret: [u8; HASH_SIZE],
    secret_set: Option<Instant>,
}

impl CookieChecker {
    pub fn new(local: &NoisePublicKey) -> Self {
        Self {
            mac1_key: mac1_key(local),
            encryption_key: cookie_key(local),
            secret: [0u8; HASH_SIZE],
            secret_set: None,
        }
    }

    /// Re-derive the keys for a new local identity.
    pub fn init(&mut self, local: &NoisePublicKey) {
        self.mac1_key = mac1_key(local);
        self.encryption_key = cookie_key(local);
        self.secret.zeroize();
        self.secret_set = None;
    }

    pub fn check_mac1(&self, msg: &[u8]) -> bool {
        let Some((smac1, smac2)) = mac_offsets(msg) else {
            return false;
        };
        let expected = mac(&self.mac1_key, &[&msg[..smac1]]);
        expected[..].ct_eq(&msg[smac1..smac2]).into()
    }

    /// Only valid while the secret that produced the cookie is still fresh.
    pub fn check_mac2(&self, msg: &[u8], src: &SocketAddr) -> bool {
        let Some((_, smac2)) = mac_offsets(msg) else {
            return false;
        };
        match self.secret_set {
            Some(set) if set.elapsed() <= COOKIE_REFRESH_TIME => {}
            _ => return false,
        }
        let cookie = self.cookie(src);
        let expected = mac(&cookie, &[&msg[..smac2]]);
        expected[..].ct_eq(&msg[smac2..]).into()
    }

    /// Build a cookie reply for `msg`, addressed to the sender's index `receiver`.
    pub fn create_reply(
        &mut self,
        msg: &[u8],
        receiver: u32,
        src: &SocketAddr,
    ) -> Result<MessageCookieReply, CryptoError> {
        let (smac1, smac2) = mac_offsets(msg).ok_or(CryptoError::Seal)?;

        let stale = self
            .secret_set
            .map_or(true, |set| set.elapsed() > COOKIE_REFRESH_TIME);
        if stale {
            OsRng.fill_bytes(&mut self.secret);
            self.secret_set = Some(Instant::now());
        }

        let mut cookie = self.cookie(src);
        let mut nonce = [0u8; 24];
        OsRng.fill_bytes(&mut nonce);
        let sealed = xseal(&self.encryption_key, &nonce, &cookie, &msg[smac1..smac2]);
        cookie.zeroize();

        let mut reply = MessageCookieReply {
            receiver,
            nonce,
            cookie: [0u8; 32],
        };
        reply.cookie.copy_from_slice(&sealed?);
        Ok(reply)
    }

    fn cookie(&self, src: &SocketAddr) -> Cookie {
        mac(&self.secret, &[&source_bytes(src)])
    }
}

/// Initiator side: adds MACs to outgoing handshake messages and remembers
/// cookies received from the remote peer.
pub struct CookieGenerator {
    mac1_key: [u8; HASH_SIZE],
    encryption_key: [u8; HASH_SIZE],
    cookie: Cookie,
    cookie_set: Option<Instant>,
    last_mac1: Option<[u8; MAC_SIZE]>,
}

impl CookieGenerator {
    pub fn new(remote: &NoisePublicKey) -> Self {
        Self {
            mac1_key: mac1_key(remote),
            encryption_key: cookie_key(remote),
            cookie: [0u8; MAC_SIZE],
            cookie_set: None,
            last_mac1: None,
        }
    }

    /// Decrypt and store the cookie from a reply. Fails when no handshake
    /// message has been sent or the reply does not match its `mac1`.
    pub fn consume_reply(&mut self, reply: &MessageCookieReply) -> Result<(), CryptoError> {
        let last_mac1 = self.last_mac1.ok_or(CryptoError::Open)?;
        let mut cookie = xopen(&self.encryption_key, &reply.nonce, &reply.cookie, &last_mac1)?;
        if cookie.len() != MAC_SIZE {
            cookie.zeroize();
            return Err(CryptoError::Open);
        }
        self.cookie.copy_from_slice(&cookie);
        cookie.zeroize();
        self.cookie_set = Some(Instant::now());
        self.last_mac1 = None;
        Ok(())
    }

    /// Fill in `mac1` and, while a fresh cookie is held, `mac2`.
    pub fn add_macs(&mut self, msg: &mut [u8]) {
        let Some((smac1, smac2)) = mac_offsets(msg) else {
            return;
        };

        let mac1 = mac(&self.mac1_key, &[&msg[..smac1]]);
        msg[smac1..smac2].copy_from_slice(&mac1);
        self.last_mac1 = Some(mac1);

        let fresh = self
            .cookie_set
            .is_some_and(|set| set.elapsed() <= COOKIE_REFRESH_TIME);
        if !fresh {
            msg[smac2..].fill(0);
            return;
        }
        let mac2 = mac(&self.cookie, &[&msg[..smac2]]);
        msg[smac2..].copy_from_slice(&mac2);
    }
}

impl Drop for CookieChecker {
    fn drop(&mut self) {
        self.secret.zeroize();
    }
}

impl Drop for CookieGenerator {
    fn drop(&mut self) {
        self.cookie.zeroize();
    }
}
