use bytes::{Buf, BufMut, BytesMut};

use crate::{
    MessageType, WireError, COOKIE_SIZE, MAC_SIZE, MESSAGE_COOKIE_REPLY_SIZE,
    MESSAGE_INITIATION_SIZE, MESSAGE_RESPONSE_SIZE, MESSAGE_TRANSPORT_HEADER_SIZE,
    MESSAGE_TRANSPORT_SIZE, NOISE_PUBLIC_KEY_SIZE, POLY1305_TAG_SIZE, TAI64N_SIZE, XNONCE_SIZE,
};

/// Read the message type from the first four bytes of a datagram.
pub fn message_type(packet: &[u8]) -> Result<MessageType, WireError> {
    if packet.len() < 4 {
        return Err(WireError::TooShort(packet.len()));
    }
    let mut buf = packet;
    MessageType::try_from(buf.get_u32_le())
}

fn expect_type(buf: &mut &[u8], kind: MessageType, expected: usize) -> Result<(), WireError> {
    if buf.len() != expected {
        return Err(WireError::InvalidLength {
            kind,
            expected,
            actual: buf.len(),
        });
    }
    let raw = buf.get_u32_le();
    if raw != kind.as_u32() {
        return Err(WireError::UnexpectedType(raw));
    }
    Ok(())
}

fn take<const N: usize>(buf: &mut &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    buf.copy_to_slice(&mut out);
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageInitiation {
    pub sender: u32,
    pub ephemeral: [u8; NOISE_PUBLIC_KEY_SIZE],
    pub static_key: [u8; NOISE_PUBLIC_KEY_SIZE + POLY1305_TAG_SIZE],
    pub timestamp: [u8; TAI64N_SIZE + POLY1305_TAG_SIZE],
    pub mac1: [u8; MAC_SIZE],
    pub mac2: [u8; MAC_SIZE],
}

impl MessageInitiation {
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(MESSAGE_INITIATION_SIZE);
        buf.put_u32_le(MessageType::Initiation.as_u32());
        buf.put_u32_le(self.sender);
        buf.put_slice(&self.ephemeral);
        buf.put_slice(&self.static_key);
        buf.put_slice(&self.timestamp);
        buf.put_slice(&self.mac1);
        buf.put_slice(&self.mac2);
        buf
    }

    pub fn decode(packet: &[u8]) -> Result<Self, WireError> {
        let mut buf = packet;
        expect_type(&mut buf, MessageType::Initiation, MESSAGE_INITIATION_SIZE)?;
        Ok(Self {
            sender: buf.get_u32_le(),
            ephemeral: take(&mut buf),
            static_key: take(&mut buf),
            timestamp: take(&mut buf),
            mac1: take(&mut buf),
            mac2: take(&mut buf),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageResponse {
    pub sender: u32,
    pub receiver: u32,
    pub ephemeral: [u8; NOISE_PUBLIC_KEY_SIZE],
    pub empty: [u8; POLY1305_TAG_SIZE],
    pub mac1: [u8; MAC_SIZE],
    pub mac2: [u8; MAC_SIZE],
}

impl MessageResponse {
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(MESSAGE_RESPONSE_SIZE);
        buf.put_u32_le(MessageType::Response.as_u32());
        buf.put_u32_le(self.sender);
        buf.put_u32_le(self.receiver);
        buf.put_slice(&self.ephemeral);
        buf.put_slice(&self.empty);
        buf.put_slice(&self.mac1);
        buf.put_slice(&self.mac2);
        buf
    }

    pub fn decode(packet: &[u8]) -> Result<Self, WireError> {
        let mut buf = packet;
        expect_type(&mut buf, MessageType::Response, MESSAGE_RESPONSE_SIZE)?;
        Ok(Self {
            sender: buf.get_u32_le(),
            receiver: buf.get_u32_le(),
            ephemeral: take(&mut buf),
            empty: take(&mut buf),
            mac1: take(&mut buf),
            mac2: take(&mut buf),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageCookieReply {
    pub receiver: u32,
    pub nonce: [u8; XNONCE_SIZE],
    pub cookie: [u8; COOKIE_SIZE + POLY1305_TAG_SIZE],
}

impl MessageCookieReply {
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(MESSAGE_COOKIE_REPLY_SIZE);
        buf.put_u32_le(MessageType::CookieReply.as_u32());
        buf.put_u32_le(self.receiver);
        buf.put_slice(&self.nonce);
        buf.put_slice(&self.cookie);
        buf
    }

    pub fn decode(packet: &[u8]) -> Result<Self, WireError> {
        let mut buf = packet;
        expect_type(&mut buf, MessageType::CookieReply, MESSAGE_COOKIE_REPLY_SIZE)?;
        Ok(Self {
            receiver: buf.get_u32_le(),
            nonce: take(&mut buf),
            cookie: take(&mut buf),
        })
    }
}

/// Header preceding every encrypted transport payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportHeader {
    pub receiver: u32,
    pub counter: u64,
}

impl TransportHeader {
    /// Write the header into the first 16 bytes of `out`.
    pub fn write(&self, out: &mut [u8]) -> Result<(), WireError> {
        if out.len() < MESSAGE_TRANSPORT_HEADER_SIZE {
            return Err(WireError::TooShort(out.len()));
        }
        let mut buf = &mut out[..MESSAGE_TRANSPORT_HEADER_SIZE];
        buf.put_u32_le(MessageType::Transport.as_u32());
        buf.put_u32_le(self.receiver);
        buf.put_u64_le(self.counter);
        Ok(())
    }

    /// Parse the header of a transport message. The packet must be at least
    /// large enough to carry an authentication tag.
    pub fn decode(packet: &[u8]) -> Result<Self, WireError> {
        if packet.len() < MESSAGE_TRANSPORT_SIZE {
            return Err(WireError::TooShort(packet.len()));
        }
        let mut buf = packet;
        let raw = buf.get_u32_le();
        if raw != MessageType::Transport.as_u32() {
            return Err(WireError::UnexpectedType(raw));
        }
        Ok(Self {
            receiver: buf.get_u32_le(),
            counter: buf.get_u64_le(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_initiation() -> MessageInitiation {
        MessageInitiation {
            sender: 0xdead_beef,
            ephemeral: [1u8; 32],
            static_key: [2u8; 48],
            timestamp: [3u8; 28],
            mac1: [4u8; 16],
            mac2: [5u8; 16],
        }
    }

    #[test]
    fn test_initiation_layout() {
        let msg = sample_initiation();
        let bytes = msg.encode();
        assert_eq!(bytes.len(), MESSAGE_INITIATION_SIZE);
        assert_eq!(&bytes[0..4], &[1, 0, 0, 0]);
        assert_eq!(&bytes[4..8], &0xdead_beefu32.to_le_bytes());
        assert_eq!(&bytes[116..132], &[4u8; 16]);
        assert_eq!(&bytes[132..148], &[5u8; 16]);
        assert_eq!(MessageInitiation::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_response_layout() {
        let msg = MessageResponse {
            sender: 7,
            receiver: 9,
            ephemeral: [6u8; 32],
            empty: [7u8; 16],
            mac1: [8u8; 16],
            mac2: [0u8; 16],
        };
        let bytes = msg.encode();
        assert_eq!(bytes.len(), MESSAGE_RESPONSE_SIZE);
        assert_eq!(&bytes[8..12], &9u32.to_le_bytes());
        assert_eq!(MessageResponse::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_cookie_reply_layout() {
        let msg = MessageCookieReply {
            receiver: 42,
            nonce: [9u8; 24],
            cookie: [10u8; 32],
        };
        let bytes = msg.encode();
        assert_eq!(bytes.len(), MESSAGE_COOKIE_REPLY_SIZE);
        assert_eq!(MessageCookieReply::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_wrong_length_rejected() {
        let bytes = sample_initiation().encode();
        let err = MessageInitiation::decode(&bytes[..100]).unwrap_err();
        assert_eq!(
            err,
            WireError::InvalidLength {
                kind: MessageType::Initiation,
                expected: MESSAGE_INITIATION_SIZE,
                actual: 100,
            }
        );
    }

    #[test]
    fn test_wrong_type_rejected() {
        let mut bytes = sample_initiation().encode();
        bytes[0] = 2;
        assert_eq!(
            MessageInitiation::decode(&bytes).unwrap_err(),
            WireError::UnexpectedType(2)
        );
    }

    #[test]
    fn test_transport_header() {
        let mut packet = [0u8; MESSAGE_TRANSPORT_SIZE];
        let header = TransportHeader {
            receiver: 0x0102_0304,
            counter: 77,
        };
        header.write(&mut packet).unwrap();
        assert_eq!(&packet[0..4], &[4, 0, 0, 0]);
        assert_eq!(&packet[4..8], &[4, 3, 2, 1]);
        assert_eq!(TransportHeader::decode(&packet).unwrap(), header);
        assert_eq!(
            TransportHeader::decode(&packet[..20]).unwrap_err(),
            WireError::TooShort(20)
        );
    }

    #[test]
    fn test_message_type_short() {
        assert_eq!(message_type(&[1, 0]), Err(WireError::TooShort(2)));
        assert_eq!(message_type(&[3, 0, 0, 0]), Ok(MessageType::CookieReply));
    }
}
