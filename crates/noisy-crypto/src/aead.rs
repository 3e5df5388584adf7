//! AEAD helpers.
//!
//! Transport and handshake fields use ChaCha20-Poly1305 with a 96-bit nonce
//! made of four zero bytes followed by the little-endian 64-bit counter.
//! Cookie replies use XChaCha20-Poly1305 with a random 192-bit nonce.

use chacha20poly1305::{
    aead::{Aead, AeadInPlace, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce, Tag, XChaCha20Poly1305, XNonce,
};
use thiserror::Error;

pub const KEY_SIZE: usize = 32;
pub const TAG_SIZE: usize = 16;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("encryption failed")]
    Seal,

    #[error("authentication failed")]
    Open,

    #[error("key exchange produced a non-contributory shared secret")]
    NonContributory,
}

/// Build the 96-bit nonce for a counter value.
pub fn counter_nonce(counter: u64) -> Nonce {
    let mut nonce = [0u8; 12];
    nonce[4..].copy_from_slice(&counter.to_le_bytes());
    Nonce::from(nonce)
}

pub fn cipher(key: &[u8; KEY_SIZE]) -> ChaCha20Poly1305 {
    ChaCha20Poly1305::new(Key::from_slice(key))
}

/// Seal a handshake field. Handshake keys are used once, so the counter is zero.
pub fn seal(key: &[u8; KEY_SIZE], plaintext: &[u8], ad: &[u8]) -> Result<Vec<u8>, CryptoError> {
    cipher(key)
        .encrypt(
            &counter_nonce(0),
            Payload {
                msg: plaintext,
                aad: ad,
            },
        )
        .map_err(|_| CryptoError::Seal)
}

pub fn open(key: &[u8; KEY_SIZE], ciphertext: &[u8], ad: &[u8]) -> Result<Vec<u8>, CryptoError> {
    cipher(key)
        .decrypt(
            &counter_nonce(0),
            Payload {
                msg: ciphertext,
                aad: ad,
            },
        )
        .map_err(|_| CryptoError::Open)
}

/// Encrypt `buffer` in place and return the detached tag.
pub fn seal_in_place(
    cipher: &ChaCha20Poly1305,
    counter: u64,
    ad: &[u8],
    buffer: &mut [u8],
) -> Result<[u8; TAG_SIZE], CryptoError> {
    let tag = cipher
        .encrypt_in_place_detached(&counter_nonce(counter), ad, buffer)
        .map_err(|_| CryptoError::Seal)?;
    Ok(tag.into())
}

/// Decrypt `buffer` in place, verifying the detached tag.
pub fn open_in_place(
    cipher: &ChaCha20Poly1305,
    counter: u64,
    ad: &[u8],
    buffer: &mut [u8],
    tag: &[u8; TAG_SIZE],
) -> Result<(), CryptoError> {
    cipher
        .decrypt_in_place_detached(&counter_nonce(counter), ad, buffer, Tag::from_slice(tag))
        .map_err(|_| CryptoError::Open)
}

pub fn xseal(
    key: &[u8; KEY_SIZE],
    nonce: &[u8; 24],
    plaintext: &[u8],
    ad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    XChaCha20Poly1305::new(Key::from_slice(key))
        .encrypt(
            XNonce::from_slice(nonce),
            Payload {
                msg: plaintext,
                aad: ad,
            },
        )
        .map_err(|_| CryptoError::Seal)
}

pub fn xopen(
    key: &[u8; KEY_SIZE],
    nonce: &[u8; 24],
    ciphertext: &[u8],
    ad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    XChaCha20Poly1305::new(Key::from_slice(key))
        .decrypt(
            XNonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad: ad,
            },
        )
        .map_err(|_| CryptoError::Open)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_nonce_layout() {
        let nonce = counter_nonce(0x0102_0304_0506_0708);
        assert_eq!(&nonce[..4], &[0, 0, 0, 0]);
        assert_eq!(&nonce[4..], &[8, 7, 6, 5, 4, 3, 2, 1]);
    }

    #[test]
    fn test_seal_open() {
        let key = [3u8; 32];
        let sealed = seal(&key, b"static key", b"transcript").unwrap();
        assert_eq!(sealed.len(), 10 + TAG_SIZE);
        assert_eq!(open(&key, &sealed, b"transcript").unwrap(), b"static key");
        assert_eq!(open(&key, &sealed, b"other"), Err(CryptoError::Open));
    }

    #[test]
    fn test_in_place_counter_mismatch_fails() {
        let c = cipher(&[9u8; 32]);
        let mut buf = *b"payload";
        let tag = seal_in_place(&c, 5, b"ad", &mut buf).unwrap();
        let mut wrong = buf;
        assert_eq!(
            open_in_place(&c, 6, b"ad", &mut wrong, &tag),
            Err(CryptoError::Open)
        );
        open_in_place(&c, 5, b"ad", &mut buf, &tag).unwrap();
        assert_eq!(&buf, b"payload");
    }

    #[test]
    fn test_xseal_xopen() {
        let key = [4u8; 32];
        let nonce = [5u8; 24];
        let sealed = xseal(&key, &nonce, &[6u8; 16], &[7u8; 16]).unwrap();
        assert_eq!(sealed.len(), 32);
        assert_eq!(xopen(&key, &nonce, &sealed, &[7u8; 16]).unwrap(), vec![6u8; 16]);
        assert!(xopen(&key, &nonce, &sealed, &[8u8; 16]).is_err());
    }
}
