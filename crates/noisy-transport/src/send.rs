//! Outbound path.
//!
//! ```text
//! SourceSink -> read_routine -> peer staged queue -> encryption queue
//!     -> encryption workers -> peer sequential sender -> Bind
//! ```
//!
//! Plaintext waits in the peer's staged queue until a sendable keypair
//! exists. Staged packets get a nonce and a per-peer sequence number when
//! they are handed to the workers; the sequential sender restores that order
//! before anything reaches the network.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use noisy_core::{
    TransportHeader, MESSAGE_KEEPALIVE_SIZE, MESSAGE_TRANSPORT_HEADER_SIZE, REKEY_TIMEOUT,
};
use noisy_crypto::CryptoError;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::keypair::Keypair;
use crate::peer::Peer;
use crate::pool::PacketBuffer;
use crate::sequence::ReorderBuffer;
use crate::source_sink::SourceError;
use crate::sync;
use crate::transport::TransportInner;

/// A staged packet on its way through the encryption workers.
pub(crate) struct OutboundElement {
    pub peer: Arc<Peer>,
    pub seq: u64,
    pub buffer: PacketBuffer,
    pub keypair: Option<Arc<Keypair>>,
    pub nonce: u64,
    pub dropped: bool,
}

/// Reads plaintext from the source and stages it on the addressed peer.
/// Exits when the source reports it is closed.
pub(crate) async fn read_routine(inner: Arc<TransportInner>) {
    let batch = inner.source_sink.batch_size().max(1);
    let mut packets = Vec::with_capacity(batch);
    debug!("Routine: source reader - started");

    loop {
        if inner.is_closed() {
            break;
        }
        packets.clear();
        match inner.source_sink.read(&mut packets, batch).await {
            Ok(0) => {
                tokio::task::yield_now().await;
                continue;
            }
            Ok(_) => {}
            Err(SourceError::Closed) => break,
            Err(e) => {
                warn!("Failed to read packets from source: {}", e);
                tokio::time::sleep(Duration::from_millis(1)).await;
                continue;
            }
        }

        let mut touched: Vec<Arc<Peer>> = Vec::new();
        for packet in packets.drain(..) {
            let Some(peer) = inner.lookup_peer(&packet.peer) else {
                debug!("Dropping packet for unknown peer {}", packet.peer);
                continue;
            };
            if !peer.is_running() {
                continue;
            }
            let mut buffer = inner.pool.get().await;
            if !buffer.set_payload(&packet.data) {
                debug!(
                    "{} - Dropping packet of {} bytes, larger than {}",
                    peer,
                    packet.data.len(),
                    buffer.max_payload()
                );
                continue;
            }
            peer.stage_packet(buffer);
            if !touched.iter().any(|p| Arc::ptr_eq(p, &peer)) {
                touched.push(peer);
            }
        }
        for peer in touched {
            peer.send_staged_packets().await;
        }
    }

    debug!("Routine: source reader - stopped");
}

/// Write the transport header and encrypt the payload behind it in place,
/// appending the tag.
fn seal_packet(
    buffer: &mut PacketBuffer,
    keypair: &Keypair,
    nonce: u64,
) -> Result<(), CryptoError> {
    let end = buffer.len();
    let header = TransportHeader {
        receiver: keypair.remote_index(),
        counter: nonce,
    };
    header.write(buffer).map_err(|_| CryptoError::Seal)?;
    let tag = keypair.seal(nonce, &mut buffer[MESSAGE_TRANSPORT_HEADER_SIZE..end])?;
    buffer.set_len(end + tag.len());
    buffer[end..].copy_from_slice(&tag);
    Ok(())
}

/// Encrypts staged packets in place. Every element is handed to its peer's
/// sequential sender, failed ones marked dropped, so the sequence has no gaps.
pub(crate) async fn encryption_worker(inner: Arc<TransportInner>, id: usize) {
    debug!("Routine: encryption worker {} - started", id);
    while let Some(mut elem) = inner.queues.encryption.pop().await {
        if !elem.dropped {
            let sealed = match elem.keypair.as_ref() {
                Some(keypair) => seal_packet(&mut elem.buffer, keypair, elem.nonce),
                None => Err(CryptoError::Seal),
            };
            if let Err(e) = sealed {
                debug!("{} - Failed to encrypt packet: {}", elem.peer, e);
                elem.dropped = true;
            }
        }
        let peer = elem.peer.clone();
        peer.deliver_outbound(elem).await;
    }
    debug!("Routine: encryption worker {} - stopped", id);
}

/// Writes a peer's encrypted packets to the network in sequence order.
pub(crate) async fn sequential_sender(
    peer: Arc<Peer>,
    mut rx: mpsc::Receiver<OutboundElement>,
    start: u64,
    window: u64,
) {
    debug!("{} - Routine: sequential sender - started", peer);
    let mut reorder = ReorderBuffer::new(start, window);

    while let Some(elem) = rx.recv().await {
        let seq = elem.seq;
        if reorder.insert(seq, elem).is_err() {
            debug!("{} - Dropping stale outbound packet {}", peer, seq);
            continue;
        }
        let ready = reorder.flush_ordered();
        if !peer.is_running() {
            continue;
        }

        let packets: Vec<&[u8]> = ready
            .iter()
            .filter(|elem| !elem.dropped)
            .map(|elem| &elem.buffer[..])
            .collect();
        if packets.is_empty() {
            continue;
        }
        let data_sent = packets.iter().any(|p| p.len() != MESSAGE_KEEPALIVE_SIZE);

        peer.timers_any_authenticated_packet_traversal();
        peer.timers_any_authenticated_packet_sent();
        if let Err(e) = peer.send_buffers(&packets).await {
            debug!("{} - Failed to send data packets: {}", peer, e);
            continue;
        }
        if data_sent {
            peer.timers_data_sent();
        }
        peer.keep_key_fresh_sending().await;
    }

    debug!("{} - Routine: sequential sender - stopped", peer);
}

impl Peer {
    /// Send datagrams to the peer's current endpoint.
    pub(crate) async fn send_buffers(&self, buffers: &[&[u8]]) -> io::Result<()> {
        let Some(transport) = self.transport() else {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "transport gone"));
        };
        let Some(endpoint) = self.endpoint() else {
            return Err(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                "no known endpoint for peer",
            ));
        };
        transport.bind.send(buffers, endpoint).await?;
        self.add_tx_bytes(buffers.iter().map(|b| b.len()).sum());
        Ok(())
    }

    /// Start a new handshake. Suppressed while the previous initiation is
    /// younger than REKEY_TIMEOUT.
    pub(crate) async fn send_handshake_initiation(&self, is_retry: bool) {
        if !is_retry {
            self.timers.handshake_attempts.store(0, std::sync::atomic::Ordering::Release);
        }
        let Some(transport) = self.transport() else {
            return;
        };

        let msg = {
            let identity = sync::read(&transport.identity);
            let Some(private_key) = identity.private_key.as_ref() else {
                debug!("{} - No private key, not sending handshake initiation", self);
                return;
            };
            let mut handshake = sync::write(&self.handshake);
            if let Some(last) = handshake.last_sent_handshake {
                if last.elapsed() < REKEY_TIMEOUT {
                    return;
                }
            }
            handshake.last_sent_handshake = Some(Instant::now());

            transport.index_table.delete(handshake.local_index);
            let index = transport.index_table.new_index_for_handshake(self.weak());
            match handshake.create_initiation(private_key, index) {
                Ok(msg) => msg,
                Err(e) => {
                    transport.index_table.delete(index);
                    handshake.local_index = 0;
                    error!("{} - Failed to create initiation message: {}", self, e);
                    return;
                }
            }
        };

        let mut packet = msg.encode();
        sync::lock(&self.cookie_generator).add_macs(&mut packet);

        debug!("{} - Sending handshake initiation", self);
        self.timers_any_authenticated_packet_traversal();
        self.timers_any_authenticated_packet_sent();
        if let Err(e) = self.send_buffers(&[&packet[..]]).await {
            error!("{} - Failed to send handshake initiation: {}", self, e);
        }
        self.timers_handshake_initiated();
    }

    /// Answer a consumed initiation and install the resulting keypair as `next`.
    pub(crate) async fn send_handshake_response(&self) {
        let Some(transport) = self.transport() else {
            return;
        };

        let (msg, keypair) = {
            let mut handshake = sync::write(&self.handshake);
            handshake.last_sent_handshake = Some(Instant::now());
            transport.index_table.delete(handshake.local_index);
            let index = transport.index_table.new_index_for_handshake(self.weak());
            let msg = match handshake.create_response(index) {
                Ok(msg) => msg,
                Err(e) => {
                    transport.index_table.delete(index);
                    handshake.local_index = 0;
                    error!("{} - Failed to create response message: {}", self, e);
                    return;
                }
            };
            match handshake.begin_session() {
                Ok(keypair) => (msg, keypair),
                Err(e) => {
                    transport.index_table.delete(index);
                    error!("{} - Failed to derive keypair: {}", self, e);
                    return;
                }
            }
        };
        self.install_keypair(keypair);

        let mut packet = msg.encode();
        sync::lock(&self.cookie_generator).add_macs(&mut packet);

        debug!("{} - Sending handshake response", self);
        self.timers_session_derived();
        self.timers_any_authenticated_packet_traversal();
        self.timers_any_authenticated_packet_sent();
        if let Err(e) = self.send_buffers(&[&packet[..]]).await {
            error!("{} - Failed to send handshake response: {}", self, e);
        }
    }

    /// Queue an empty packet unless data is already waiting, then flush.
    pub(crate) async fn send_keepalive(&self) {
        if !self.has_staged() && self.is_running() {
            if let Some(transport) = self.transport() {
                let mut buffer = transport.pool.get().await;
                buffer.set_payload(&[]);
                self.stage_packet(buffer);
                debug!("{} - Sending keepalive packet", self);
            }
        }
        self.send_staged_packets().await;
    }

    /// Hand the staged queue to the encryption workers, or start a
    /// handshake if there is no usable keypair.
    pub(crate) async fn send_staged_packets(&self) {
        let Some(transport) = self.transport() else {
            return;
        };
        let Some(me) = self.this() else {
            return;
        };
        let _sending = self.send_lock.lock().await;

        loop {
            if !self.has_staged() {
                return;
            }
            let keypair = sync::read(&self.keypairs).sendable();
            let Some(keypair) = keypair else {
                self.send_handshake_initiation(false).await;
                return;
            };

            let mut staged = self.take_staged().into_iter();
            let mut leftover = Vec::new();
            for buffer in staged.by_ref() {
                let Some(nonce) = keypair.next_nonce() else {
                    leftover.push(buffer);
                    break;
                };
                let elem = OutboundElement {
                    peer: me.clone(),
                    seq: self.next_tx_seq(),
                    buffer,
                    keypair: Some(keypair.clone()),
                    nonce,
                    dropped: false,
                };
                if let Err(mut elem) = transport.queues.encryption.push(elem).await {
                    elem.dropped = true;
                    self.deliver_outbound(elem).await;
                }
            }
            leftover.extend(staged);
            if leftover.is_empty() {
                return;
            }
            // Out of nonces mid-batch; the next pass sees no sendable keypair.
            self.restage(leftover);
        }
    }

    pub(crate) async fn keep_key_fresh_sending(&self) {
        let current = sync::read(&self.keypairs).current.clone();
        let Some(keypair) = current else {
            return;
        };
        if keypair.needs_rekey_after_send() {
            self.send_handshake_initiation(false).await;
        }
    }
}

impl TransportInner {
    /// Reply to a handshake message with a cookie instead of processing it.
    pub(crate) async fn send_handshake_cookie(&self, msg: &[u8], src: SocketAddr) {
        let Some(sender) = msg.get(4..8) else {
            return;
        };
        let sender = u32::from_le_bytes([sender[0], sender[1], sender[2], sender[3]]);
        let reply = sync::lock(&self.cookie_checker).create_reply(msg, sender, &src);
        let reply = match reply {
            Ok(reply) => reply,
            Err(e) => {
                error!("Failed to create cookie reply: {}", e);
                return;
            }
        };
        debug!("Sending cookie reply to {}", src);
        let packet = reply.encode();
        if let Err(e) = self.bind.send(&[&packet[..]], src).await {
            debug!("Failed to send cookie reply to {}: {}", src, e);
        }
    }
}
