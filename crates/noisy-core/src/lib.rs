//! Core noisy-transport protocol types, framing, and constants.
//!
//! This crate provides:
//! - Message type identifiers and fixed message sizes
//! - Handshake message layouts (initiation, response, cookie reply)
//! - The data message header
//! - Protocol timing constants shared by the crypto and transport layers
//!
//! All integers on the wire are little-endian.

#![forbid(unsafe_code)]

pub mod messages;

use std::time::Duration;

pub use messages::{
    message_type, MessageCookieReply, MessageInitiation, MessageResponse, TransportHeader,
};

/// Message type: handshake initiation.
pub const MESSAGE_INITIATION_TYPE: u32 = 1;
/// Message type: handshake response.
pub const MESSAGE_RESPONSE_TYPE: u32 = 2;
/// Message type: cookie reply.
pub const MESSAGE_COOKIE_REPLY_TYPE: u32 = 3;
/// Message type: transport data.
pub const MESSAGE_TRANSPORT_TYPE: u32 = 4;

pub const NOISE_PUBLIC_KEY_SIZE: usize = 32;
pub const NOISE_PRIVATE_KEY_SIZE: usize = 32;
pub const NOISE_PRESHARED_KEY_SIZE: usize = 32;
pub const POLY1305_TAG_SIZE: usize = 16;
pub const TAI64N_SIZE: usize = 12;
pub const MAC_SIZE: usize = 16;
pub const COOKIE_SIZE: usize = 16;
pub const XNONCE_SIZE: usize = 24;

/// Initiation (148 bytes)
/// [Type (4B)][Sender (4B)][Ephemeral (32B)][Static (48B)][Timestamp (28B)][MAC1 (16B)][MAC2 (16B)]
pub const MESSAGE_INITIATION_SIZE: usize = 148;

/// Response (92 bytes)
/// [Type (4B)][Sender (4B)][Receiver (4B)][Ephemeral (32B)][Empty (16B)][MAC1 (16B)][MAC2 (16B)]
pub const MESSAGE_RESPONSE_SIZE: usize = 92;

/// Cookie reply (64 bytes)
/// [Type (4B)][Receiver (4B)][Nonce (24B)][Cookie (32B)]
pub const MESSAGE_COOKIE_REPLY_SIZE: usize = 64;

/// Transport header (16 bytes)
/// [Type (4B)][Receiver (4B)][Counter (8B)]
pub const MESSAGE_TRANSPORT_HEADER_SIZE: usize = 16;

/// Smallest valid transport message: header plus an empty, authenticated payload.
pub const MESSAGE_TRANSPORT_SIZE: usize = MESSAGE_TRANSPORT_HEADER_SIZE + POLY1305_TAG_SIZE;

/// A keepalive is a transport message with no payload.
pub const MESSAGE_KEEPALIVE_SIZE: usize = MESSAGE_TRANSPORT_SIZE;

pub const MESSAGE_TRANSPORT_OFFSET_RECEIVER: usize = 4;
pub const MESSAGE_TRANSPORT_OFFSET_COUNTER: usize = 8;
pub const MESSAGE_TRANSPORT_OFFSET_CONTENT: usize = 16;

/// Largest possible UDP datagram.
pub const MAX_SEGMENT_SIZE: usize = (1 << 16) - 1;

/// Largest plaintext that fits into a single transport message.
pub const MAX_CONTENT_SIZE: usize = MAX_SEGMENT_SIZE - MESSAGE_TRANSPORT_SIZE;

pub const REKEY_AFTER_MESSAGES: u64 = 1 << 60;
pub const REJECT_AFTER_MESSAGES: u64 = u64::MAX - (1 << 13);
pub const REKEY_AFTER_TIME: Duration = Duration::from_secs(120);
pub const REKEY_ATTEMPT_TIME: Duration = Duration::from_secs(90);
pub const REKEY_TIMEOUT: Duration = Duration::from_secs(5);
pub const MAX_TIMER_HANDSHAKES: u32 =
    (REKEY_ATTEMPT_TIME.as_secs() / REKEY_TIMEOUT.as_secs()) as u32;
pub const REKEY_TIMEOUT_JITTER_MAX: Duration = Duration::from_millis(334);
pub const REJECT_AFTER_TIME: Duration = Duration::from_secs(180);
pub const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(10);
pub const COOKIE_REFRESH_TIME: Duration = Duration::from_secs(120);
pub const HANDSHAKE_INITIATION_RATE: Duration = Duration::from_millis(50);

/// Decoded message kind, as read from the first four bytes of a datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Initiation,
    Response,
    CookieReply,
    Transport,
}

impl MessageType {
    pub fn as_u32(self) -> u32 {
        match self {
            MessageType::Initiation => MESSAGE_INITIATION_TYPE,
            MessageType::Response => MESSAGE_RESPONSE_TYPE,
            MessageType::CookieReply => MESSAGE_COOKIE_REPLY_TYPE,
            MessageType::Transport => MESSAGE_TRANSPORT_TYPE,
        }
    }

    /// True for the message kinds that are processed by the handshake workers.
    pub fn is_handshake(self) -> bool {
        !matches!(self, MessageType::Transport)
    }
}

impl TryFrom<u32> for MessageType {
    type Error = WireError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            MESSAGE_INITIATION_TYPE => Ok(MessageType::Initiation),
            MESSAGE_RESPONSE_TYPE => Ok(MessageType::Response),
            MESSAGE_COOKIE_REPLY_TYPE => Ok(MessageType::CookieReply),
            MESSAGE_TRANSPORT_TYPE => Ok(MessageType::Transport),
            other => Err(WireError::UnknownType(other)),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WireError {
    #[error("packet too short: {0}")]
    TooShort(usize),
    #[error("unknown message type: {0}")]
    UnknownType(u32),
    #[error("unexpected message type: {0}")]
    UnexpectedType(u32),
    #[error("invalid length for {kind:?}: expected {expected}, got {actual}")]
    InvalidLength {
        kind: MessageType,
        expected: usize,
        actual: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_roundtrip() {
        for kind in [
            MessageType::Initiation,
            MessageType::Response,
            MessageType::CookieReply,
            MessageType::Transport,
        ] {
            assert_eq!(MessageType::try_from(kind.as_u32()).unwrap(), kind);
        }
        assert_eq!(MessageType::try_from(9), Err(WireError::UnknownType(9)));
    }

    #[test]
    fn test_handshake_classification() {
        assert!(MessageType::Initiation.is_handshake());
        assert!(MessageType::Response.is_handshake());
        assert!(MessageType::CookieReply.is_handshake());
        assert!(!MessageType::Transport.is_handshake());
    }

    #[test]
    fn test_timer_handshake_budget() {
        assert_eq!(MAX_TIMER_HANDSHAKES, 18);
        assert!(REJECT_AFTER_MESSAGES > REKEY_AFTER_MESSAGES);
        assert!(REJECT_AFTER_TIME > REKEY_AFTER_TIME);
    }
}
