//! Inbound path.
//!
//! Each open receiver gets a routine that classifies datagrams. Transport
//! messages are matched to a keypair by receiver index and queued for
//! decryption; handshake messages go to the handshake workers through a
//! lossy queue. Decrypted packets return to their peer's sequential
//! receiver, which restores arrival order, applies the replay filter and
//! writes plaintext to the sink.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use noisy_core::{
    message_type, MessageCookieReply, MessageInitiation, MessageResponse, MessageType,
    TransportHeader, KEEPALIVE_TIMEOUT, MESSAGE_COOKIE_REPLY_SIZE, MESSAGE_INITIATION_SIZE,
    MESSAGE_RESPONSE_SIZE, MESSAGE_TRANSPORT_HEADER_SIZE, POLY1305_TAG_SIZE, REJECT_AFTER_TIME,
    REKEY_TIMEOUT,
};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::conn::Receiver;
use crate::error::HandshakeError;
use crate::handshake::decrypt_initiation;
use crate::keypair::Keypair;
use crate::peer::Peer;
use crate::pool::PacketBuffer;
use crate::sequence::ReorderBuffer;
use crate::source_sink::{InboundPacket, SourceError};
use crate::sync;
use crate::transport::TransportInner;

/// Consecutive receive errors tolerated before a receive routine gives up.
const MAX_RECEIVE_ERRORS: u32 = 10;

/// A transport message on its way through the decryption workers.
pub(crate) struct InboundElement {
    pub peer: Arc<Peer>,
    pub seq: u64,
    pub buffer: PacketBuffer,
    pub keypair: Arc<Keypair>,
    pub counter: u64,
    pub endpoint: SocketAddr,
    pub dropped: bool,
}

pub(crate) struct HandshakeElement {
    pub kind: MessageType,
    pub buffer: PacketBuffer,
    pub endpoint: SocketAddr,
}

fn expected_handshake_size(kind: MessageType) -> usize {
    match kind {
        MessageType::Initiation => MESSAGE_INITIATION_SIZE,
        MessageType::Response => MESSAGE_RESPONSE_SIZE,
        MessageType::CookieReply => MESSAGE_COOKIE_REPLY_SIZE,
        MessageType::Transport => MESSAGE_TRANSPORT_HEADER_SIZE + POLY1305_TAG_SIZE,
    }
}

/// Receives batches from one socket path until the bind is closed.
pub(crate) async fn receive_routine(inner: Arc<TransportInner>, receiver: Arc<dyn Receiver>) {
    let batch = inner.batch_size().max(1);
    let mut buffers: Vec<PacketBuffer> = Vec::with_capacity(batch);
    let mut sizes = vec![0usize; batch];
    let mut endpoints: Vec<Option<SocketAddr>> = vec![None; batch];
    let mut errors = 0u32;
    debug!("Routine: receive incoming - started");

    loop {
        while buffers.len() < batch {
            buffers.push(inner.pool.get().await);
        }
        let count = match receiver.receive(&mut buffers, &mut sizes, &mut endpoints).await {
            Ok(count) => {
                errors = 0;
                count
            }
            Err(e) if e.kind() == io::ErrorKind::NotConnected => break,
            Err(e) => {
                errors += 1;
                if errors >= MAX_RECEIVE_ERRORS || inner.is_closed() {
                    warn!("Failed to receive packets, giving up: {}", e);
                    break;
                }
                debug!("Failed to receive packets: {}", e);
                tokio::time::sleep(Duration::from_secs(1) / 3).await;
                continue;
            }
        };

        let received: Vec<PacketBuffer> = buffers.drain(..count.min(batch)).collect();
        for (i, mut buffer) in received.into_iter().enumerate() {
            let Some(endpoint) = endpoints[i].take() else {
                continue;
            };
            buffer.set_len(sizes[i]);
            inner.route_datagram(buffer, endpoint).await;
        }
    }

    debug!("Routine: receive incoming - stopped");
}

/// Opens the payload in place and trims the tag.
fn open_packet(buffer: &mut PacketBuffer, keypair: &Keypair, counter: u64) -> bool {
    let len = buffer.len();
    if len < MESSAGE_TRANSPORT_HEADER_SIZE + POLY1305_TAG_SIZE {
        return false;
    }
    let mut tag = [0u8; POLY1305_TAG_SIZE];
    tag.copy_from_slice(&buffer[len - POLY1305_TAG_SIZE..]);
    let body = &mut buffer[MESSAGE_TRANSPORT_HEADER_SIZE..len - POLY1305_TAG_SIZE];
    if keypair.open(counter, body, &tag).is_err() {
        return false;
    }
    buffer.set_len(len - POLY1305_TAG_SIZE);
    true
}

pub(crate) async fn decryption_worker(inner: Arc<TransportInner>, id: usize) {
    debug!("Routine: decryption worker {} - started", id);
    while let Some(mut elem) = inner.queues.decryption.pop().await {
        if !elem.dropped && !open_packet(&mut elem.buffer, &elem.keypair, elem.counter) {
            elem.dropped = true;
        }
        let peer = elem.peer.clone();
        peer.deliver_inbound(elem).await;
    }
    debug!("Routine: decryption worker {} - stopped", id);
}

pub(crate) async fn handshake_worker(inner: Arc<TransportInner>, id: usize) {
    debug!("Routine: handshake worker {} - started", id);
    while let Some(elem) = inner.queues.handshake.pop().await {
        inner.handle_handshake(elem).await;
    }
    debug!("Routine: handshake worker {} - stopped", id);
}

/// Releases a peer's decrypted packets in sequence order.
pub(crate) async fn sequential_receiver(
    peer: Arc<Peer>,
    mut rx: mpsc::Receiver<InboundElement>,
    start: u64,
    window: u64,
) {
    debug!("{} - Routine: sequential receiver - started", peer);
    let mut reorder = ReorderBuffer::new(start, window);

    while let Some(elem) = rx.recv().await {
        let seq = elem.seq;
        if reorder.insert(seq, elem).is_err() {
            debug!("{} - Dropping stale inbound packet {}", peer, seq);
            continue;
        }

        let mut packets = Vec::new();
        for elem in reorder.flush_ordered() {
            if let Some(packet) = peer.accept_inbound(elem).await {
                packets.push(packet);
            }
        }
        if packets.is_empty() || !peer.is_running() {
            continue;
        }
        let Some(transport) = peer.transport() else {
            continue;
        };
        match transport.source_sink.write(packets).await {
            Ok(_) => {}
            Err(SourceError::Closed) => debug!("{} - Sink closed, dropping packets", peer),
            Err(e) => warn!("{} - Failed to write packets to sink: {}", peer, e),
        }
    }

    debug!("{} - Routine: sequential receiver - stopped", peer);
}

impl Peer {
    /// Post-decryption checks for one packet. Returns the plaintext to hand
    /// to the sink, or `None` for keepalives and rejected packets.
    async fn accept_inbound(&self, elem: InboundElement) -> Option<InboundPacket> {
        if elem.dropped {
            return None;
        }
        if !elem.keypair.accept_counter(elem.counter) {
            debug!("{} - Dropping replayed packet {}", self, elem.counter);
            return None;
        }

        self.set_endpoint(elem.endpoint);
        if self.received_with_keypair(&elem.keypair) {
            self.timers_handshake_complete();
            self.send_staged_packets().await;
        }
        self.keep_key_fresh_receiving().await;
        self.timers_any_authenticated_packet_traversal();
        self.timers_any_authenticated_packet_received();
        self.add_rx_bytes(elem.buffer.len() + POLY1305_TAG_SIZE);

        if elem.buffer.len() == MESSAGE_TRANSPORT_HEADER_SIZE {
            debug!("{} - Receiving keepalive packet", self);
            return None;
        }
        self.timers_data_received();

        Some(InboundPacket {
            peer: self.public_key(),
            data: Bytes::copy_from_slice(elem.buffer.payload()),
        })
    }

    /// An initiator whose keypair is close to the hard age limit gets one
    /// last chance to rekey before it stops being able to receive.
    pub(crate) async fn keep_key_fresh_receiving(&self) {
        let current = sync::read(&self.keypairs).current.clone();
        let Some(keypair) = current else {
            return;
        };
        if !keypair.is_initiator()
            || keypair.age() <= REJECT_AFTER_TIME - KEEPALIVE_TIMEOUT - REKEY_TIMEOUT
        {
            return;
        }
        if self
            .timers
            .sent_last_minute_handshake
            .swap(true, std::sync::atomic::Ordering::AcqRel)
        {
            return;
        }
        self.send_handshake_initiation(false).await;
    }
}

impl TransportInner {
    /// Classify one datagram and queue it for the right workers.
    pub(crate) async fn route_datagram(&self, buffer: PacketBuffer, endpoint: SocketAddr) {
        let kind = match message_type(&buffer) {
            Ok(kind) => kind,
            Err(e) => {
                debug!("Dropping datagram from {}: {}", endpoint, e);
                return;
            }
        };

        if kind.is_handshake() {
            if buffer.len() != expected_handshake_size(kind) {
                debug!("Dropping {:?} of invalid size {} from {}", kind, buffer.len(), endpoint);
                return;
            }
            let elem = HandshakeElement {
                kind,
                buffer,
                endpoint,
            };
            if self.queues.handshake.try_push(elem).is_err() {
                debug!("Dropping handshake packet from {}: queue full", endpoint);
            }
            return;
        }

        let header = match TransportHeader::decode(&buffer) {
            Ok(header) => header,
            Err(e) => {
                debug!("Dropping transport message from {}: {}", endpoint, e);
                return;
            }
        };
        let Some(entry) = self.index_table.lookup(header.receiver) else {
            return;
        };
        let Some(keypair) = entry.keypair else {
            return;
        };
        if keypair.is_expired() {
            return;
        }
        let Some(peer) = entry.peer.upgrade() else {
            return;
        };
        if !peer.is_running() {
            return;
        }

        let elem = InboundElement {
            peer: peer.clone(),
            seq: peer.next_rx_seq(),
            buffer,
            keypair,
            counter: header.counter,
            endpoint,
            dropped: false,
        };
        if let Err(mut elem) = self.queues.decryption.push(elem).await {
            elem.dropped = true;
            peer.deliver_inbound(elem).await;
        }
    }

    /// Validate and process one handshake message. MAC1 first, then the
    /// cookie when under load, then the per-source rate limit, and only
    /// then any Diffie-Hellman work.
    pub(crate) async fn handle_handshake(&self, elem: HandshakeElement) {
        let HandshakeElement {
            kind,
            buffer,
            endpoint,
        } = elem;

        if kind == MessageType::CookieReply {
            self.handle_cookie_reply(&buffer, endpoint);
            return;
        }

        let mac1_valid = sync::lock(&self.cookie_checker).check_mac1(&buffer);
        if !mac1_valid {
            debug!("Received {:?} with invalid mac1 from {}", kind, endpoint);
            return;
        }
        if self.is_under_load() {
            let mac2_valid = sync::lock(&self.cookie_checker).check_mac2(&buffer, &endpoint);
            if !mac2_valid {
                self.send_handshake_cookie(&buffer, endpoint).await;
                return;
            }
        }
        if !self.rate_limiter.allow(endpoint.ip()) {
            debug!("Rate limiting {:?} from {}", kind, endpoint);
            return;
        }

        match kind {
            MessageType::Initiation => {
                let peer = match MessageInitiation::decode(&buffer)
                    .map_err(|_| HandshakeError::WrongState)
                    .and_then(|msg| self.consume_initiation(&msg))
                {
                    Ok(peer) => peer,
                    Err(e) => {
                        debug!("Received invalid initiation message from {}: {}", endpoint, e);
                        return;
                    }
                };
                peer.set_endpoint(endpoint);
                debug!("{} - Received handshake initiation", peer);
                peer.add_rx_bytes(buffer.len());
                peer.timers_any_authenticated_packet_traversal();
                peer.timers_any_authenticated_packet_received();
                peer.send_handshake_response().await;
            }
            MessageType::Response => {
                let peer = match MessageResponse::decode(&buffer)
                    .map_err(|_| HandshakeError::WrongState)
                    .and_then(|msg| self.consume_response(&msg))
                {
                    Ok(peer) => peer,
                    Err(e) => {
                        debug!("Received invalid response message from {}: {}", endpoint, e);
                        return;
                    }
                };
                peer.set_endpoint(endpoint);
                debug!("{} - Received handshake response", peer);
                peer.add_rx_bytes(buffer.len());
                peer.timers_any_authenticated_packet_traversal();
                peer.timers_any_authenticated_packet_received();
                if let Err(e) = peer.begin_symmetric_session() {
                    debug!("{} - Failed to derive keypair: {}", peer, e);
                    return;
                }
                peer.timers_session_derived();
                peer.timers_handshake_complete();
                // Confirm the session so the responder promotes its keypair.
                peer.send_keepalive().await;
            }
            MessageType::CookieReply | MessageType::Transport => {}
        }
    }

    fn handle_cookie_reply(&self, buffer: &[u8], endpoint: SocketAddr) {
        let reply = match MessageCookieReply::decode(buffer) {
            Ok(reply) => reply,
            Err(e) => {
                debug!("Dropping cookie reply from {}: {}", endpoint, e);
                return;
            }
        };
        let Some(peer) = self
            .index_table
            .lookup(reply.receiver)
            .and_then(|entry| entry.peer.upgrade())
        else {
            return;
        };
        if !peer.is_running() {
            return;
        }
        let consumed = sync::lock(&peer.cookie_generator).consume_reply(&reply);
        match consumed {
            Ok(()) => debug!("{} - Received cookie reply from {}", peer, endpoint),
            Err(_) => debug!("{} - Could not decrypt invalid cookie reply", peer),
        }
    }

    /// Decrypt an initiation, find the peer it comes from and advance that
    /// peer's handshake.
    pub(crate) fn consume_initiation(
        &self,
        msg: &MessageInitiation,
    ) -> Result<Arc<Peer>, HandshakeError> {
        let identity = sync::read(&self.identity);
        let Some(private_key) = identity.private_key.as_ref() else {
            return Err(HandshakeError::NoPrivateKey);
        };
        let decrypted = decrypt_initiation(private_key, msg)?;
        let peer = self
            .lookup_peer(&decrypted.remote_static)
            .ok_or(HandshakeError::UnknownPeer)?;
        if !peer.is_running() {
            return Err(HandshakeError::UnknownPeer);
        }
        sync::write(&peer.handshake).accept_initiation(decrypted, Instant::now())?;
        Ok(peer)
    }

    pub(crate) fn consume_response(
        &self,
        msg: &MessageResponse,
    ) -> Result<Arc<Peer>, HandshakeError> {
        let entry = self
            .index_table
            .lookup(msg.receiver)
            .ok_or(HandshakeError::IndexMismatch)?;
        if entry.keypair.is_some() {
            return Err(HandshakeError::IndexMismatch);
        }
        let peer = entry.peer.upgrade().ok_or(HandshakeError::UnknownPeer)?;
        if !peer.is_running() {
            return Err(HandshakeError::UnknownPeer);
        }
        let identity = sync::read(&self.identity);
        let Some(private_key) = identity.private_key.as_ref() else {
            return Err(HandshakeError::NoPrivateKey);
        };
        sync::write(&peer.handshake).consume_response(private_key, msg)?;
        Ok(peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_trims_tag() {
        let sender = Keypair::new([7; 32], [8; 32], true, 5, 6);
        let receiver = Keypair::new([8; 32], [7; 32], false, 6, 5);

        let mut buffer = PacketBuffer::detached(128);
        assert!(buffer.set_payload(b"payload"));
        let end = buffer.len();
        TransportHeader {
            receiver: 6,
            counter: 3,
        }
        .write(&mut buffer)
        .unwrap();
        let tag = sender
            .seal(3, &mut buffer[MESSAGE_TRANSPORT_HEADER_SIZE..end])
            .unwrap();
        buffer.set_len(end + POLY1305_TAG_SIZE);
        buffer[end..].copy_from_slice(&tag);

        assert!(open_packet(&mut buffer, &receiver, 3));
        assert_eq!(buffer.payload(), b"payload");
    }

    #[test]
    fn test_open_rejects_wrong_key() {
        let sender = Keypair::new([1; 32], [2; 32], true, 5, 6);
        let stranger = Keypair::new([9; 32], [9; 32], false, 6, 5);

        let mut buffer = PacketBuffer::detached(128);
        assert!(buffer.set_payload(b"secret"));
        let end = buffer.len();
        let tag = sender
            .seal(0, &mut buffer[MESSAGE_TRANSPORT_HEADER_SIZE..end])
            .unwrap();
        buffer.set_len(end + POLY1305_TAG_SIZE);
        buffer[end..].copy_from_slice(&tag);

        let len = buffer.len();
        assert!(!open_packet(&mut buffer, &stranger, 0));
        assert_eq!(buffer.len(), len);
    }

    #[test]
    fn test_open_rejects_runt() {
        let receiver = Keypair::new([1; 32], [2; 32], false, 1, 2);
        let mut buffer = PacketBuffer::detached(64);
        buffer.set_len(MESSAGE_TRANSPORT_HEADER_SIZE + 4);
        assert!(!open_packet(&mut buffer, &receiver, 0));
    }

    #[test]
    fn test_handshake_sizes() {
        assert_eq!(expected_handshake_size(MessageType::Initiation), 148);
        assert_eq!(expected_handshake_size(MessageType::Response), 92);
        assert_eq!(expected_handshake_size(MessageType::CookieReply), 64);
    }
}
