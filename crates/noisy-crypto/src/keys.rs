//! Curve25519 static keys and preshared keys.
//!
//! Keys are written as standard base64 (44 characters with padding), the
//! same text form used by common tunnel configuration files.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use std::fmt;
use std::str::FromStr;
use subtle::ConstantTimeEq;
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::aead::CryptoError;

pub const KEY_SIZE: usize = 32;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("invalid base64 key encoding")]
    Encoding,

    #[error("invalid key length: expected 32 bytes, got {0}")]
    Length(usize),
}

fn decode_key(s: &str) -> Result<[u8; KEY_SIZE], KeyError> {
    let mut bytes = STANDARD.decode(s.trim()).map_err(|_| KeyError::Encoding)?;
    if bytes.len() != KEY_SIZE {
        let len = bytes.len();
        bytes.zeroize();
        return Err(KeyError::Length(len));
    }
    let mut key = [0u8; KEY_SIZE];
    key.copy_from_slice(&bytes);
    bytes.zeroize();
    Ok(key)
}

/// Curve25519 public key identifying a peer.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct NoisePublicKey([u8; KEY_SIZE]);

impl NoisePublicKey {
    pub const fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.ct_eq(&[0u8; KEY_SIZE]).into()
    }

    /// Constant-time comparison.
    pub fn equals(&self, other: &NoisePublicKey) -> bool {
        self.0.ct_eq(&other.0).into()
    }

    pub(crate) fn to_dalek(self) -> PublicKey {
        PublicKey::from(self.0)
    }
}

impl From<PublicKey> for NoisePublicKey {
    fn from(key: PublicKey) -> Self {
        Self(key.to_bytes())
    }
}

impl fmt::Display for NoisePublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", STANDARD.encode(self.0))
    }
}

impl fmt::Debug for NoisePublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NoisePublicKey({})", self)
    }
}

impl FromStr for NoisePublicKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        decode_key(s).map(Self)
    }
}

/// Curve25519 private key. The scalar is clamped on construction and
/// zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct NoisePrivateKey([u8; KEY_SIZE]);

impl NoisePrivateKey {
    /// Generate a new random key using the OS CSPRNG.
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut bytes);
        let key = Self::from_bytes(bytes);
        bytes.zeroize();
        key
    }

    pub fn from_bytes(mut bytes: [u8; KEY_SIZE]) -> Self {
        bytes[0] &= 248;
        bytes[31] &= 127;
        bytes[31] |= 64;
        Self(bytes)
    }

    /// Get the private key bytes.
    ///
    /// # Security
    /// Handle with care! These bytes recreate the identity.
    pub fn to_bytes(&self) -> [u8; KEY_SIZE] {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.ct_eq(&[0u8; KEY_SIZE]).into()
    }

    pub fn public_key(&self) -> NoisePublicKey {
        NoisePublicKey::from(PublicKey::from(&self.secret()))
    }

    /// X25519 with a peer's public key. Rejects low-order points, which
    /// would yield an all-zero shared secret.
    pub fn shared_secret(&self, peer: &NoisePublicKey) -> Result<[u8; KEY_SIZE], CryptoError> {
        let shared = self.secret().diffie_hellman(&peer.to_dalek());
        if !shared.was_contributory() {
            return Err(CryptoError::NonContributory);
        }
        Ok(shared.to_bytes())
    }

    fn secret(&self) -> StaticSecret {
        StaticSecret::from(self.0)
    }
}

impl fmt::Debug for NoisePrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("NoisePrivateKey(..)")
    }
}

impl FromStr for NoisePrivateKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = decode_key(s)?;
        let key = Self::from_bytes(bytes);
        bytes.zeroize();
        Ok(key)
    }
}

/// Optional symmetric key mixed into the handshake. All-zero means unset.
#[derive(Clone, Default, Zeroize, ZeroizeOnDrop)]
pub struct NoisePresharedKey([u8; KEY_SIZE]);

impl NoisePresharedKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl fmt::Debug for NoisePresharedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("NoisePresharedKey(..)")
    }
}

impl FromStr for NoisePresharedKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        decode_key(s).map(Self)
    }
}
