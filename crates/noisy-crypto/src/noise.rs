//! Noise IKpsk2 symmetric state.
//!
//! The handshake transcript is tracked as a chaining key `ck` and a hash `h`:
//!
//! ```text
//! Ci := HASH(Construction)
//! Hi := HASH(Ci || Identifier)
//! ```

use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::aead::{self, CryptoError};
use crate::hash::{hash, kdf1, kdf2, kdf3, HASH_SIZE};

pub const CONSTRUCTION: &[u8] = b"Noise_IKpsk2_25519_ChaChaPoly_BLAKE2s";
pub const IDENTIFIER: &[u8] = b"WireGuard v1 zx2c4 Jason@zx2c4.com";

/// HASH(Construction)
pub const INITIAL_CHAIN_KEY: [u8; HASH_SIZE] = [
    96, 226, 109, 174, 243, 39, 239, 192, 46, 195, 53, 226, 160, 37, 210, 208, 22, 235, 66, 6, 248,
    114, 119, 245, 45, 56, 209, 152, 139, 120, 205, 54,
];

/// HASH(INITIAL_CHAIN_KEY || Identifier)
pub const INITIAL_HASH: [u8; HASH_SIZE] = [
    34, 17, 179, 97, 8, 26, 197, 102, 105, 18, 67, 219, 69, 138, 213, 50, 45, 156, 108, 102, 34,
    147, 232, 183, 14, 225, 156, 101, 186, 7, 158, 243,
];

#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SymmetricState {
    chaining_key: [u8; HASH_SIZE],
    hash: [u8; HASH_SIZE],
}

impl Default for SymmetricState {
    fn default() -> Self {
        Self::new()
    }
}

impl SymmetricState {
    pub fn new() -> Self {
        Self {
            chaining_key: INITIAL_CHAIN_KEY,
            hash: INITIAL_HASH,
        }
    }

    pub fn hash(&self) -> &[u8; HASH_SIZE] {
        &self.hash
    }

    pub fn chaining_key(&self) -> &[u8; HASH_SIZE] {
        &self.chaining_key
    }

    pub fn mix_hash(&mut self, data: &[u8]) {
        self.hash = hash(&[&self.hash, data]);
    }

    /// Mix public input (an ephemeral key) into the chaining key.
    pub fn mix_key(&mut self, input: &[u8]) {
        self.chaining_key = kdf1(&self.chaining_key, input);
    }

    /// Mix a DH result into the chaining key and return the derived cipher key.
    pub fn mix_key_with_output(&mut self, input: &[u8]) -> [u8; HASH_SIZE] {
        let (ck, key) = kdf2(&self.chaining_key, input);
        self.chaining_key = ck;
        key
    }

    /// Mix the preshared key. The middle output goes into the transcript hash.
    pub fn mix_key_and_hash(&mut self, psk: &[u8; HASH_SIZE]) -> [u8; HASH_SIZE] {
        let (ck, mut tau, key) = kdf3(&self.chaining_key, psk);
        self.chaining_key = ck;
        self.mix_hash(&tau);
        tau.zeroize();
        key
    }

    pub fn encrypt_and_hash(
        &mut self,
        key: &[u8; HASH_SIZE],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let ciphertext = aead::seal(key, plaintext, &self.hash)?;
        self.mix_hash(&ciphertext);
        Ok(ciphertext)
    }

    pub fn decrypt_and_hash(
        &mut self,
        key: &[u8; HASH_SIZE],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let plaintext = aead::open(key, ciphertext, &self.hash)?;
        self.mix_hash(ciphertext);
        Ok(plaintext)
    }

    /// Derive the transport keys: `(initiator-to-responder, responder-to-initiator)`.
    pub fn split(&self) -> ([u8; HASH_SIZE], [u8; HASH_SIZE]) {
        kdf2(&self.chaining_key, &[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_construction_identifier() {
        let c = hash(&[CONSTRUCTION]);
        let h = hash(&[&c, IDENTIFIER]);
        assert_eq!(c, INITIAL_CHAIN_KEY);
        assert_eq!(h, INITIAL_HASH);
    }

    #[test]
    fn test_both_sides_stay_in_sync() {
        let mut a = SymmetricState::new();
        let mut b = SymmetricState::new();
        a.mix_hash(b"responder static");
        b.mix_hash(b"responder static");
        a.mix_key(b"ephemeral");
        b.mix_key(b"ephemeral");
        let ka = a.mix_key_with_output(b"dh");
        let kb = b.mix_key_with_output(b"dh");
        assert_eq!(ka, kb);

        let ct = a.encrypt_and_hash(&ka, b"secret").unwrap();
        assert_eq!(b.decrypt_and_hash(&kb, &ct).unwrap(), b"secret");
        assert_eq!(a.hash(), b.hash());

        let psk = [0u8; 32];
        assert_eq!(a.mix_key_and_hash(&psk), b.mix_key_and_hash(&psk));
        assert_eq!(a.split(), b.split());
    }

    #[test]
    fn test_tampered_transcript_fails() {
        let mut a = SymmetricState::new();
        let mut b = SymmetricState::new();
        b.mix_hash(b"diverged");
        let key = [1u8; 32];
        let ct = a.encrypt_and_hash(&key, b"secret").unwrap();
        assert_eq!(b.decrypt_and_hash(&key, &ct), Err(CryptoError::Open));
    }
}
