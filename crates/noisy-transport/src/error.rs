use std::io;

use noisy_crypto::CryptoError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("bind error: {0}")]
    Bind(#[from] io::Error),

    #[error("transport is closed")]
    Closed,

    #[error("peer limit of {0} reached")]
    PeerLimit(usize),

    #[error("peer already exists")]
    DuplicatePeer,

    #[error("peer key equals the local public key")]
    OwnKey,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("config parse error: {0}")]
    Config(#[from] serde_json::Error),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("handshake in wrong state")]
    WrongState,

    #[error("invalid public key")]
    InvalidPublicKey,

    #[error("no private key configured")]
    NoPrivateKey,

    #[error("unknown peer")]
    UnknownPeer,

    #[error("initiation timestamp replayed")]
    Replay,

    #[error("initiation arrived too soon after the previous one")]
    Flood,

    #[error("message does not belong to this handshake")]
    IndexMismatch,

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
}
