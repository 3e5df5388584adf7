//! Cryptographic primitives for noisy-transport.
//!
//! This crate provides:
//! - Curve25519 static keys, preshared keys and their text encoding
//! - BLAKE2s hashing, keyed MACs and the HKDF-style key derivation
//! - The Noise IKpsk2 symmetric state (chaining key and transcript hash)
//! - ChaCha20-Poly1305 / XChaCha20-Poly1305 sealing helpers
//! - TAI64N timestamps for initiation replay protection
//! - The sliding replay filter for transport counters
//! - Cookie MACs for handshake denial-of-service mitigation
//!
//! # Design
//!
//! The handshake follows `Noise_IKpsk2_25519_ChaChaPoly_BLAKE2s`. The
//! initiator knows the responder's static key up front, so the handshake
//! completes in a single round trip. Transport messages carry an explicit
//! 64-bit counter that doubles as the AEAD nonce, which lets the receiver
//! decrypt out-of-order datagrams.

#![forbid(unsafe_code)]

pub mod aead;
pub mod cookie;
pub mod hash;
pub mod keys;
pub mod noise;
pub mod replay;
pub mod tai64n;

pub use aead::CryptoError;
pub use cookie::{CookieChecker, CookieGenerator};
pub use keys::{KeyError, NoisePresharedKey, NoisePrivateKey, NoisePublicKey};
pub use noise::SymmetricState;
pub use replay::ReplayFilter;
pub use tai64n::Timestamp;
