//! BLAKE2s hashing, keyed MAC and key derivation.
//!
//! ```text
//! HASH(input)      = BLAKE2s-256(input)
//! MAC(key, input)  = keyed BLAKE2s-128(key, input)
//! HMAC(key, input) = HMAC-BLAKE2s-256(key, input)
//! KDFn(key, input):
//!   prk = HMAC(key, input)
//!   t0  = HMAC(prk, 0x1)
//!   ti  = HMAC(prk, t(i-1) || i+1)
//! ```

use blake2::digest::consts::U16;
use blake2::digest::{FixedOutput, KeyInit, Mac, Update};
use blake2::{Blake2s256, Blake2sMac, Digest};
use hmac::SimpleHmac;
use zeroize::Zeroize;

pub const HASH_SIZE: usize = 32;
pub const MAC_SIZE: usize = 16;

pub fn hash(parts: &[&[u8]]) -> [u8; HASH_SIZE] {
    let mut hasher = Blake2s256::new();
    for part in parts {
        Digest::update(&mut hasher, part);
    }
    hasher.finalize().into()
}

/// Keyed BLAKE2s with a 16-byte output. Keys longer than 32 bytes are not
/// representable, which the fixed-size key parameter rules out.
pub fn mac<const N: usize>(key: &[u8; N], parts: &[&[u8]]) -> [u8; MAC_SIZE] {
    let mut m = <Blake2sMac<U16> as KeyInit>::new_from_slice(key)
        .expect("blake2s accepts keys up to 32 bytes");
    for part in parts {
        Update::update(&mut m, part);
    }
    m.finalize_fixed().into()
}

pub fn hmac(key: &[u8], parts: &[&[u8]]) -> [u8; HASH_SIZE] {
    let mut m = <SimpleHmac<Blake2s256> as KeyInit>::new_from_slice(key)
        .expect("hmac accepts keys of any length");
    for part in parts {
        Mac::update(&mut m, part);
    }
    m.finalize().into_bytes().into()
}

pub fn kdf1(key: &[u8; HASH_SIZE], input: &[u8]) -> [u8; HASH_SIZE] {
    let mut prk = hmac(key, &[input]);
    let t0 = hmac(&prk, &[&[0x1]]);
    prk.zeroize();
    t0
}

pub fn kdf2(key: &[u8; HASH_SIZE], input: &[u8]) -> ([u8; HASH_SIZE], [u8; HASH_SIZE]) {
    let mut prk = hmac(key, &[input]);
    let t0 = hmac(&prk, &[&[0x1]]);
    let t1 = hmac(&prk, &[&t0, &[0x2]]);
    prk.zeroize();
    (t0, t1)
}

pub fn kdf3(
    key: &[u8; HASH_SIZE],
    input: &[u8],
) -> ([u8; HASH_SIZE], [u8; HASH_SIZE], [u8; HASH_SIZE]) {
    let mut prk = hmac(key, &[input]);
    let t0 = hmac(&prk, &[&[0x1]]);
    let t1 = hmac(&prk, &[&t0, &[0x2]]);
    let t2 = hmac(&prk, &[&t1, &[0x3]]);
    prk.zeroize();
    (t0, t1, t2)
}
