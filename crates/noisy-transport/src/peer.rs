//! Remote peers.
//!
//! A peer owns its handshake, its keypairs, a backlog of plaintext staged
//! until a session exists, and three tasks while running: the timer task
//! and the two sequential routines that put worker output back in order.

use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, SystemTime};

use noisy_crypto::{CookieGenerator, NoisePresharedKey, NoisePrivateKey, NoisePublicKey};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::HandshakeError;
use crate::handshake::Handshake;
use crate::keypair::{Keypair, Keypairs};
use crate::pool::PacketBuffer;
use crate::receive::{self, InboundElement};
use crate::send::{self, OutboundElement};
use crate::sync;
use crate::timers::{self, Timers};
use crate::transport::TransportInner;

/// Traffic counters for one peer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerStats {
    pub tx_bytes: u64,
    pub rx_bytes: u64,
    pub last_handshake: Option<SystemTime>,
}

struct PeerRoutines {
    timers: JoinHandle<()>,
    sender: JoinHandle<()>,
    receiver: JoinHandle<()>,
}

pub struct Peer {
    me: Weak<Peer>,
    transport: Weak<TransportInner>,
    public_key: NoisePublicKey,

    pub(crate) handshake: RwLock<Handshake>,
    pub(crate) keypairs: RwLock<Keypairs>,
    pub(crate) cookie_generator: Mutex<CookieGenerator>,
    pub(crate) timers: Timers,

    endpoint: Mutex<Option<SocketAddr>>,
    persistent_keepalive_secs: AtomicU32,
    tx_bytes: AtomicU64,
    rx_bytes: AtomicU64,
    last_handshake: Mutex<Option<SystemTime>>,

    staged: Mutex<VecDeque<PacketBuffer>>,
    staged_capacity: usize,
    pub(crate) send_lock: tokio::sync::Mutex<()>,

    tx_seq: AtomicU64,
    rx_seq: AtomicU64,
    outbound: Mutex<Option<mpsc::Sender<OutboundElement>>>,
    inbound: Mutex<Option<mpsc::Sender<InboundElement>>>,

    running: AtomicBool,
    routines: tokio::sync::Mutex<Option<PeerRoutines>>,
}

impl Peer {
    pub(crate) fn new(
        transport: &Arc<TransportInner>,
        public_key: NoisePublicKey,
        local: Option<&NoisePrivateKey>,
    ) -> Arc<Self> {
        let staged_capacity = transport.config.queue_staged_size;
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            transport: Arc::downgrade(transport),
            public_key,
            handshake: RwLock::new(Handshake::new(local, public_key)),
            keypairs: RwLock::new(Keypairs::default()),
            cookie_generator: Mutex::new(CookieGenerator::new(&public_key)),
            timers: Timers::new(),
            endpoint: Mutex::new(None),
            persistent_keepalive_secs: AtomicU32::new(0),
            tx_bytes: AtomicU64::new(0),
            rx_bytes: AtomicU64::new(0),
            last_handshake: Mutex::new(None),
            staged: Mutex::new(VecDeque::with_capacity(staged_capacity)),
            staged_capacity,
            send_lock: tokio::sync::Mutex::new(()),
            tx_seq: AtomicU64::new(0),
            rx_seq: AtomicU64::new(0),
            outbound: Mutex::new(None),
            inbound: Mutex::new(None),
            running: AtomicBool::new(false),
            routines: tokio::sync::Mutex::new(None),
        })
    }

    pub(crate) fn transport(&self) -> Option<Arc<TransportInner>> {
        self.transport.upgrade()
    }

    pub(crate) fn this(&self) -> Option<Arc<Peer>> {
        self.me.upgrade()
    }

    pub(crate) fn weak(&self) -> Weak<Peer> {
        self.me.clone()
    }

    pub fn public_key(&self) -> NoisePublicKey {
        self.public_key
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn endpoint(&self) -> Option<SocketAddr> {
        *sync::lock(&self.endpoint)
    }

    /// Set the address packets are sent to. Updated automatically from
    /// every authenticated packet, so a roaming peer is followed.
    pub fn set_endpoint(&self, endpoint: SocketAddr) {
        *sync::lock(&self.endpoint) = Some(endpoint);
    }

    pub fn persistent_keepalive(&self) -> Duration {
        Duration::from_secs(self.persistent_keepalive_secs.load(Ordering::Acquire) as u64)
    }

    /// Send a keepalive every `interval` of silence. Zero disables.
    pub async fn set_persistent_keepalive(&self, interval: Duration) {
        let secs = interval.as_secs().min(u32::MAX as u64) as u32;
        let old = self.persistent_keepalive_secs.swap(secs, Ordering::AcqRel);
        // Get the first one out now so the timer has something to count from.
        if old == 0 && secs > 0 && self.transport().is_some_and(|t| t.is_up()) {
            self.send_keepalive().await;
        }
    }

    pub fn set_preshared_key(&self, psk: NoisePresharedKey) {
        sync::write(&self.handshake).set_preshared_key(psk);
    }

    pub fn stats(&self) -> PeerStats {
        PeerStats {
            tx_bytes: self.tx_bytes.load(Ordering::Relaxed),
            rx_bytes: self.rx_bytes.load(Ordering::Relaxed),
            last_handshake: *sync::lock(&self.last_handshake),
        }
    }

    pub(crate) fn add_tx_bytes(&self, n: usize) {
        self.tx_bytes.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn add_rx_bytes(&self, n: usize) {
        self.rx_bytes.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn set_last_handshake(&self, at: SystemTime) {
        *sync::lock(&self.last_handshake) = Some(at);
    }

    pub(crate) fn next_tx_seq(&self) -> u64 {
        self.tx_seq.fetch_add(1, Ordering::AcqRel)
    }

    pub(crate) fn next_rx_seq(&self) -> u64 {
        self.rx_seq.fetch_add(1, Ordering::AcqRel)
    }

    /// Start the peer's routines. No-op unless the transport is up.
    pub(crate) async fn start(&self) {
        let Some(transport) = self.transport() else {
            return;
        };
        let Some(me) = self.this() else {
            return;
        };
        if !transport.is_up() {
            return;
        }
        let mut routines = self.routines.lock().await;
        if routines.is_some() {
            return;
        }
        debug!("{} - Starting", self);

        self.timers.reset();
        sync::write(&self.handshake).last_sent_handshake = None;

        let config = &transport.config;
        let (out_tx, out_rx) = mpsc::channel(config.queue_outbound_size);
        let (in_tx, in_rx) = mpsc::channel(config.queue_inbound_size);
        *sync::lock(&self.outbound) = Some(out_tx);
        *sync::lock(&self.inbound) = Some(in_tx);

        // Anything numbered before this point belongs to a previous run.
        let tx_start = self.tx_seq.load(Ordering::Acquire);
        let rx_start = self.rx_seq.load(Ordering::Acquire);
        let workers = config.worker_count();
        let tx_window = (config.queue_outbound_size + workers) as u64;
        let rx_window = (config.queue_inbound_size + workers) as u64;

        *routines = Some(PeerRoutines {
            timers: tokio::spawn(timers::run(me.clone())),
            sender: tokio::spawn(send::sequential_sender(me.clone(), out_rx, tx_start, tx_window)),
            receiver: tokio::spawn(receive::sequential_receiver(me, in_rx, rx_start, rx_window)),
        });
        self.running.store(true, Ordering::Release);
    }

    /// Stop the routines, wait for them, then drop all key material and
    /// staged packets.
    pub(crate) async fn stop(&self) {
        let mut routines = self.routines.lock().await;
        let Some(running) = routines.take() else {
            return;
        };
        self.running.store(false, Ordering::Release);
        debug!("{} - Stopping", self);

        running.timers.abort();
        self.timers.reset();
        sync::lock(&self.outbound).take();
        sync::lock(&self.inbound).take();

        let _ = running.timers.await;
        let _ = running.sender.await;
        let _ = running.receiver.await;

        self.zero_and_flush_all();
    }

    pub(crate) async fn deliver_outbound(&self, elem: OutboundElement) {
        let tx = sync::lock(&self.outbound).clone();
        if let Some(tx) = tx {
            let _ = tx.send(elem).await;
        }
    }

    pub(crate) async fn deliver_inbound(&self, elem: InboundElement) {
        let tx = sync::lock(&self.inbound).clone();
        if let Some(tx) = tx {
            let _ = tx.send(elem).await;
        }
    }

    /// Queue plaintext until a session key can encrypt it. A full backlog
    /// drops its oldest packet.
    pub(crate) fn stage_packet(&self, buffer: PacketBuffer) {
        let mut staged = sync::lock(&self.staged);
        while staged.len() >= self.staged_capacity {
            staged.pop_front();
        }
        staged.push_back(buffer);
    }

    pub(crate) fn take_staged(&self) -> Vec<PacketBuffer> {
        sync::lock(&self.staged).drain(..).collect()
    }

    /// Put packets back at the head of the backlog, ahead of anything staged since.
    pub(crate) fn restage(&self, buffers: Vec<PacketBuffer>) {
        let mut staged = sync::lock(&self.staged);
        for buffer in buffers.into_iter().rev() {
            staged.push_front(buffer);
        }
        while staged.len() > self.staged_capacity {
            staged.pop_back();
        }
    }

    pub(crate) fn has_staged(&self) -> bool {
        !sync::lock(&self.staged).is_empty()
    }

    pub(crate) fn flush_staged_packets(&self) {
        sync::lock(&self.staged).clear();
    }

    /// Derive the session from a completed handshake and install it.
    pub(crate) fn begin_symmetric_session(&self) -> Result<(), HandshakeError> {
        let keypair = sync::write(&self.handshake).begin_session()?;
        self.install_keypair(keypair);
        Ok(())
    }

    pub(crate) fn install_keypair(&self, keypair: Keypair) {
        let Some(transport) = self.transport() else {
            return;
        };
        let keypair = Arc::new(keypair);
        transport
            .index_table
            .swap_index_for_keypair(keypair.local_index(), keypair.clone());
        let displaced = sync::write(&self.keypairs).install(keypair);
        for old in displaced {
            transport.index_table.delete(old.local_index());
        }
    }

    /// Promote `next` once the remote side has used it. Returns true on promotion.
    pub(crate) fn received_with_keypair(&self, received: &Arc<Keypair>) -> bool {
        {
            let keypairs = sync::read(&self.keypairs);
            match &keypairs.next {
                Some(next) if Arc::ptr_eq(next, received) => {}
                _ => return false,
            }
        }
        let (promoted, displaced) = sync::write(&self.keypairs).received_with(received);
        if let (Some(old), Some(transport)) = (displaced, self.transport()) {
            transport.index_table.delete(old.local_index());
        }
        promoted
    }

    pub(crate) fn zero_and_flush_all(&self) {
        let transport = self.transport();
        let old = sync::write(&self.keypairs).clear();
        let index = sync::write(&self.handshake).clear();
        if let Some(transport) = transport {
            for keypair in old {
                transport.index_table.delete(keypair.local_index());
            }
            transport.index_table.delete(index);
        }
        self.flush_staged_packets();
    }

    /// Stop sending under the current keys and allow an immediate new handshake.
    pub(crate) fn expire_current_keypairs(&self) {
        {
            let mut handshake = sync::write(&self.handshake);
            let index = handshake.clear();
            if let Some(transport) = self.transport() {
                transport.index_table.delete(index);
            }
            handshake.last_sent_handshake = None;
        }
        let keypairs = sync::read(&self.keypairs);
        if let Some(current) = &keypairs.current {
            current.expire_sending();
        }
        if let Some(next) = &keypairs.next {
            next.expire_sending();
        }
    }

    /// The current keypair, if any.
    pub fn current_keypair(&self) -> Option<Arc<Keypair>> {
        sync::read(&self.keypairs).current.clone()
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let key = self.public_key.to_string();
        if key.len() >= 43 {
            write!(f, "peer({}…{})", &key[0..4], &key[39..43])
        } else {
            write!(f, "peer({})", key)
        }
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("public_key", &self.public_key)
            .field("endpoint", &self.endpoint())
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    use crate::config::TransportConfig;
    use crate::conn::UdpBind;
    use crate::source_sink::ChannelSourceSink;
    use crate::transport::Transport;

    async fn peer_with_staged_capacity(capacity: usize) -> (Transport, Arc<Peer>) {
        let config = TransportConfig {
            workers: 1,
            queue_staged_size: capacity,
            ..TransportConfig::default()
        };
        let (sink, _handle) = ChannelSourceSink::new(8);
        let bind = Arc::new(UdpBind::new(IpAddr::V4(Ipv4Addr::LOCALHOST)));
        let transport = Transport::new(config, bind, sink).unwrap();
        let peer = transport
            .new_peer(NoisePrivateKey::generate().public_key())
            .await
            .unwrap();
        (transport, peer)
    }

    fn buffer(tag: u8) -> PacketBuffer {
        let mut buffer = PacketBuffer::detached(64);
        assert!(buffer.set_payload(&[tag]));
        buffer
    }

    fn tags(buffers: &[PacketBuffer]) -> Vec<u8> {
        buffers.iter().map(|b| b.payload()[0]).collect()
    }

    #[tokio::test]
    async fn test_full_backlog_drops_oldest() {
        let (transport, peer) = peer_with_staged_capacity(3).await;
        for tag in 0..5 {
            peer.stage_packet(buffer(tag));
        }
        assert_eq!(tags(&peer.take_staged()), vec![2, 3, 4]);
        assert!(!peer.has_staged());
        transport.close().await;
    }

    #[tokio::test]
    async fn test_restage_goes_ahead_of_newer_packets() {
        let (transport, peer) = peer_with_staged_capacity(4).await;
        peer.stage_packet(buffer(9));
        peer.restage(vec![buffer(1), buffer(2)]);
        assert_eq!(tags(&peer.take_staged()), vec![1, 2, 9]);

        peer.stage_packet(buffer(7));
        peer.stage_packet(buffer(8));
        peer.restage(vec![buffer(1), buffer(2), buffer(3)]);
        assert_eq!(tags(&peer.take_staged()), vec![1, 2, 3, 7]);
        transport.close().await;
    }

    #[tokio::test]
    async fn test_display_abbreviates_key() {
        let (transport, peer) = peer_with_staged_capacity(1).await;
        let key = peer.public_key().to_string();
        let shown = peer.to_string();
        assert!(shown.starts_with(&format!("peer({}", &key[0..4])));
        assert!(shown.ends_with(&format!("{})", &key[39..43])));
        assert!(!peer.is_running());
        transport.close().await;
    }
}
