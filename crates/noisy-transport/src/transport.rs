//! The transport: lifecycle, static identity, peer table and the shared
//! worker pipeline.
//!
//! State transitions (`up`, `down`, `close`) and peer table mutations are
//! serialized by one async lifecycle lock. The state itself lives in an
//! atomic so the data path can check it without locking; those reads are
//! advisory and may lag a transition in progress.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use noisy_crypto::{CookieChecker, NoisePrivateKey, NoisePublicKey};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::TransportConfig;
use crate::conn::Bind;
use crate::error::TransportError;
use crate::index::IndexTable;
use crate::peer::Peer;
use crate::pool::BufferPool;
use crate::queue::WorkQueue;
use crate::ratelimiter::RateLimiter;
use crate::receive::{self, HandshakeElement, InboundElement};
use crate::send::{self, OutboundElement};
use crate::source_sink::SourceSink;
use crate::sync;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Down,
    Up,
    Closed,
}

impl TransportState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => TransportState::Up,
            2 => TransportState::Closed,
            _ => TransportState::Down,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            TransportState::Down => 0,
            TransportState::Up => 1,
            TransportState::Closed => 2,
        }
    }
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportState::Down => write!(f, "down"),
            TransportState::Up => write!(f, "up"),
            TransportState::Closed => write!(f, "closed"),
        }
    }
}

pub(crate) struct StaticIdentity {
    pub private_key: Option<NoisePrivateKey>,
    pub public_key: Option<NoisePublicKey>,
}

pub(crate) struct Queues {
    pub encryption: WorkQueue<OutboundElement>,
    pub decryption: WorkQueue<InboundElement>,
    pub handshake: WorkQueue<HandshakeElement>,
}

impl Queues {
    fn close(&self) {
        self.encryption.close();
        self.decryption.close();
        self.handshake.close();
    }
}

struct NetState {
    port: u16,
    receivers: Vec<JoinHandle<()>>,
}

pub(crate) struct TransportInner {
    pub config: TransportConfig,
    state: AtomicU8,
    state_lock: tokio::sync::Mutex<()>,

    pub identity: RwLock<StaticIdentity>,
    peers: RwLock<HashMap<NoisePublicKey, Arc<Peer>>>,
    pub index_table: IndexTable<Peer>,

    pub cookie_checker: Mutex<CookieChecker>,
    pub rate_limiter: Arc<RateLimiter>,
    under_load_until: Mutex<Option<Instant>>,

    pub pool: BufferPool,
    pub queues: Queues,
    pub bind: Arc<dyn Bind>,
    pub source_sink: Arc<dyn SourceSink>,

    net: tokio::sync::Mutex<NetState>,
    routines: Mutex<Vec<JoinHandle<()>>>,
    closed: watch::Sender<bool>,
}

impl TransportInner {
    pub fn state(&self) -> TransportState {
        TransportState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: TransportState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    pub fn is_up(&self) -> bool {
        self.state() == TransportState::Up
    }

    pub fn is_closed(&self) -> bool {
        self.state() == TransportState::Closed
    }

    /// Whether handshakes must carry a valid cookie. Set while the handshake
    /// queue is past its threshold and for a grace period afterwards.
    pub fn is_under_load(&self) -> bool {
        let now = Instant::now();
        let mut until = sync::lock(&self.under_load_until);
        if self.queues.handshake.len() >= self.config.under_load_threshold() {
            *until = Some(now + self.config.under_load_after());
            return true;
        }
        until.is_some_and(|deadline| now < deadline)
    }

    pub fn batch_size(&self) -> usize {
        self.bind.batch_size().max(self.source_sink.batch_size())
    }

    pub fn lookup_peer(&self, public_key: &NoisePublicKey) -> Option<Arc<Peer>> {
        sync::read(&self.peers).get(public_key).cloned()
    }

    pub fn peer_list(&self) -> Vec<Arc<Peer>> {
        sync::read(&self.peers).values().cloned().collect()
    }

    /// Close the bind, wait for its receive routines, and reopen it on
    /// `port` if the transport is up.
    async fn bind_update(self: &Arc<Self>, port: u16) -> Result<(), TransportError> {
        let mut net = self.net.lock().await;
        self.close_bind_locked(&mut net).await;
        if !self.is_up() {
            return Ok(());
        }

        let (receivers, actual) = self.bind.open(port).await?;
        net.port = actual;
        for receiver in receivers {
            net.receivers
                .push(tokio::spawn(receive::receive_routine(self.clone(), receiver)));
        }
        debug!("UDP bind has been updated, listening on port {}", actual);
        Ok(())
    }

    async fn close_bind_locked(&self, net: &mut NetState) {
        if let Err(e) = self.bind.close().await {
            warn!("Failed to close bind: {}", e);
        }
        for routine in net.receivers.drain(..) {
            let _ = routine.await;
        }
    }

    async fn up_locked(self: &Arc<Self>) -> Result<(), TransportError> {
        if self.state() != TransportState::Down {
            return Ok(());
        }
        self.set_state(TransportState::Up);

        let port = self.net.lock().await.port;
        if let Err(e) = self.bind_update(port).await {
            warn!("Failed to open bind on port {}: {}", port, e);
            self.set_state(TransportState::Down);
            return Err(e);
        }

        for peer in self.peer_list() {
            peer.start().await;
            if !peer.persistent_keepalive().is_zero() {
                peer.send_keepalive().await;
            }
        }
        info!("Transport is up");
        Ok(())
    }

    async fn down_locked(self: &Arc<Self>) {
        if self.state() != TransportState::Up {
            return;
        }
        self.set_state(TransportState::Down);
        if let Err(e) = self.bind_update(0).await {
            warn!("Failed to close bind: {}", e);
        }
        for peer in self.peer_list() {
            peer.stop().await;
        }
        info!("Transport is down");
    }

    fn remove_peer_locked(&self, public_key: &NoisePublicKey) -> Option<Arc<Peer>> {
        sync::write(&self.peers).remove(public_key)
    }
}

/// Handle to a running transport. Cheap to clone.
///
/// Must be created inside a tokio runtime; the worker pools are spawned on
/// construction and run until [`Transport::close`].
#[derive(Clone)]
pub struct Transport {
    inner: Arc<TransportInner>,
}

impl Transport {
    pub fn new(
        config: TransportConfig,
        bind: Arc<dyn Bind>,
        source_sink: Arc<dyn SourceSink>,
    ) -> Result<Self, TransportError> {
        config.validate()?;

        let rate_limiter = Arc::new(RateLimiter::new());
        rate_limiter.start();
        let (closed, _) = watch::channel(false);

        let inner = Arc::new(TransportInner {
            state: AtomicU8::new(TransportState::Down.as_u8()),
            state_lock: tokio::sync::Mutex::new(()),
            identity: RwLock::new(StaticIdentity {
                private_key: None,
                public_key: None,
            }),
            peers: RwLock::new(HashMap::new()),
            index_table: IndexTable::new(),
            cookie_checker: Mutex::new(CookieChecker::new(&NoisePublicKey::default())),
            rate_limiter,
            under_load_until: Mutex::new(None),
            pool: BufferPool::new(config.max_segment_size, config.preallocated_buffers_per_pool),
            queues: Queues {
                encryption: WorkQueue::new(config.queue_outbound_size),
                decryption: WorkQueue::new(config.queue_inbound_size),
                handshake: WorkQueue::new(config.queue_handshake_size),
            },
            bind,
            source_sink,
            net: tokio::sync::Mutex::new(NetState {
                port: 0,
                receivers: Vec::new(),
            }),
            routines: Mutex::new(Vec::new()),
            closed,
            config,
        });

        let workers = inner.config.worker_count();
        let mut routines = Vec::with_capacity(workers * 3 + 1);
        for id in 0..workers {
            routines.push(tokio::spawn(send::encryption_worker(inner.clone(), id)));
            routines.push(tokio::spawn(receive::decryption_worker(inner.clone(), id)));
            routines.push(tokio::spawn(receive::handshake_worker(inner.clone(), id)));
        }
        routines.push(tokio::spawn(send::read_routine(inner.clone())));
        *sync::lock(&inner.routines) = routines;

        debug!("Transport created with {} workers per pool", workers);
        Ok(Self { inner })
    }

    pub fn state(&self) -> TransportState {
        self.inner.state()
    }

    pub fn is_under_load(&self) -> bool {
        self.inner.is_under_load()
    }

    pub fn config(&self) -> &TransportConfig {
        &self.inner.config
    }

    /// Open the bind and start every peer. No-op when already up or closed.
    /// A bind failure leaves the transport down.
    pub async fn up(&self) -> Result<(), TransportError> {
        let _lifecycle = self.inner.state_lock.lock().await;
        self.inner.up_locked().await
    }

    /// Close the bind and stop every peer, discarding their session keys.
    pub async fn down(&self) -> Result<(), TransportError> {
        let _lifecycle = self.inner.state_lock.lock().await;
        self.inner.down_locked().await;
        Ok(())
    }

    /// Shut everything down and wait for all routines to exit. Idempotent.
    pub async fn close(&self) {
        let inner = &self.inner;
        let _lifecycle = inner.state_lock.lock().await;
        if inner.is_closed() {
            return;
        }
        info!("Transport closing");

        // Closing the sink first unblocks sequential receivers mid-write.
        if let Err(e) = inner.source_sink.close().await {
            warn!("Failed to close source/sink: {}", e);
        }
        inner.down_locked().await;
        inner.set_state(TransportState::Closed);
        {
            let mut net = inner.net.lock().await;
            inner.close_bind_locked(&mut net).await;
        }

        let peers: Vec<Arc<Peer>> = sync::write(&inner.peers).drain().map(|(_, p)| p).collect();
        for peer in peers {
            peer.stop().await;
            peer.zero_and_flush_all();
        }

        inner.queues.close();
        let routines = std::mem::take(&mut *sync::lock(&inner.routines));
        for routine in routines {
            let _ = routine.await;
        }
        inner.rate_limiter.close();

        inner.closed.send_replace(true);
        info!("Transport closed");
    }

    /// Resolves once the transport has been closed.
    pub async fn wait(&self) {
        let mut closed = self.inner.closed.subscribe();
        let _ = closed.wait_for(|closed| *closed).await;
    }

    /// Replace the static identity. Peers whose key equals the new public
    /// key are removed; every other peer drops its current session and will
    /// handshake again under the new identity.
    pub async fn set_private_key(&self, private_key: NoisePrivateKey) {
        let inner = &self.inner;
        let _lifecycle = inner.state_lock.lock().await;
        if inner.is_closed() {
            return;
        }
        let public_key = private_key.public_key();

        let removed: Vec<Arc<Peer>> = {
            let mut identity = sync::write(&inner.identity);
            if identity.public_key == Some(public_key) {
                return;
            }
            let mut peers = sync::write(&inner.peers);
            let matching: Vec<NoisePublicKey> = peers
                .keys()
                .filter(|key| key.equals(&public_key))
                .copied()
                .collect();
            let removed: Vec<Arc<Peer>> = matching
                .iter()
                .filter_map(|key| peers.remove(key))
                .collect();

            identity.private_key = Some(private_key);
            identity.public_key = Some(public_key);
            sync::lock(&inner.cookie_checker).init(&public_key);

            for peer in peers.values() {
                sync::write(&peer.handshake).set_static_identity(identity.private_key.as_ref());
                peer.expire_current_keypairs();
            }
            removed
        };

        for peer in removed {
            debug!("{} - Removing, key matches the new local identity", peer);
            peer.stop().await;
            peer.zero_and_flush_all();
        }
        debug!("Static identity updated to {}", public_key);
    }

    pub fn public_key(&self) -> Option<NoisePublicKey> {
        sync::read(&self.inner.identity).public_key
    }

    /// Add a peer. It starts immediately if the transport is up.
    pub async fn new_peer(&self, public_key: NoisePublicKey) -> Result<Arc<Peer>, TransportError> {
        let inner = &self.inner;
        let _lifecycle = inner.state_lock.lock().await;
        if inner.is_closed() {
            return Err(TransportError::Closed);
        }

        let peer = {
            let identity = sync::read(&inner.identity);
            if identity.public_key == Some(public_key) {
                return Err(TransportError::OwnKey);
            }
            let mut peers = sync::write(&inner.peers);
            if peers.contains_key(&public_key) {
                return Err(TransportError::DuplicatePeer);
            }
            if peers.len() >= inner.config.max_peers {
                return Err(TransportError::PeerLimit(inner.config.max_peers));
            }
            let peer = Peer::new(inner, public_key, identity.private_key.as_ref());
            peers.insert(public_key, peer.clone());
            peer
        };

        if inner.is_up() {
            peer.start().await;
        }
        debug!("{} - Created", peer);
        Ok(peer)
    }

    pub fn lookup_peer(&self, public_key: &NoisePublicKey) -> Option<Arc<Peer>> {
        self.inner.lookup_peer(public_key)
    }

    pub fn peers(&self) -> Vec<Arc<Peer>> {
        self.inner.peer_list()
    }

    /// Stop and forget a peer. Other peers are unaffected.
    pub async fn remove_peer(&self, public_key: &NoisePublicKey) {
        let _lifecycle = self.inner.state_lock.lock().await;
        let removed = self.inner.remove_peer_locked(public_key);
        if let Some(peer) = removed {
            peer.stop().await;
            peer.zero_and_flush_all();
            debug!("{} - Removed", peer);
        }
    }

    pub async fn remove_all_peers(&self) {
        let _lifecycle = self.inner.state_lock.lock().await;
        let peers: Vec<Arc<Peer>> = sync::write(&self.inner.peers)
            .drain()
            .map(|(_, peer)| peer)
            .collect();
        for peer in peers {
            peer.stop().await;
            peer.zero_and_flush_all();
        }
    }

    /// The bound port while up, or the port the next `up` will bind.
    pub async fn port(&self) -> u16 {
        self.inner.net.lock().await.port
    }

    /// Change the listening port, rebinding if up. On failure the previous
    /// port is reopened.
    pub async fn update_port(&self, port: u16) -> Result<(), TransportError> {
        let inner = &self.inner;
        let _lifecycle = inner.state_lock.lock().await;
        if inner.is_closed() {
            return Ok(());
        }
        let old = {
            let mut net = inner.net.lock().await;
            if net.port == port {
                return Ok(());
            }
            if !inner.is_up() {
                net.port = port;
                return Ok(());
            }
            net.port
        };

        if let Err(e) = inner.bind_update(port).await {
            warn!("Failed to rebind to port {}, restoring {}: {}", port, old, e);
            if let Err(restore) = inner.bind_update(old).await {
                warn!("Failed to restore port {}: {}", old, restore);
            }
            return Err(e);
        }
        Ok(())
    }

    pub fn batch_size(&self) -> usize {
        self.inner.batch_size()
    }

    /// Send a keepalive to every peer whose current keypair is still usable.
    pub async fn send_keepalives_to_peers_with_current_keypair(&self) {
        if !self.inner.is_up() {
            return;
        }
        for peer in self.inner.peer_list() {
            let usable = peer.current_keypair().is_some_and(|k| k.can_send());
            if usable {
                peer.send_keepalive().await;
            }
        }
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("state", &self.state())
            .field("public_key", &self.public_key())
            .field("peers", &sync::read(&self.inner.peers).len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use std::time::Duration;

    use noisy_core::{MESSAGE_INITIATION_SIZE, MESSAGE_INITIATION_TYPE, REKEY_AFTER_MESSAGES};
    use noisy_crypto::CookieGenerator;

    use crate::conn::UdpBind;
    use crate::pool::PacketBuffer;
    use crate::source_sink::{ChannelSourceSink, TunnelHandle};

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    struct Node {
        transport: Transport,
        handle: TunnelHandle,
        key: NoisePrivateKey,
    }

    async fn node(config: TransportConfig) -> Node {
        let (sink, handle) = ChannelSourceSink::new(256);
        let bind = Arc::new(UdpBind::new(LOCALHOST));
        let transport = Transport::new(config, bind, sink).unwrap();
        let key = NoisePrivateKey::generate();
        transport.set_private_key(key.clone()).await;
        transport.up().await.unwrap();
        Node {
            transport,
            handle,
            key,
        }
    }

    async fn connect(a: &Node, b: &Node) -> (Arc<Peer>, Arc<Peer>) {
        let a_to_b = a.transport.new_peer(b.key.public_key()).await.unwrap();
        let b_to_a = b.transport.new_peer(a.key.public_key()).await.unwrap();
        a_to_b.set_endpoint(SocketAddr::new(LOCALHOST, b.transport.port().await));
        b_to_a.set_endpoint(SocketAddr::new(LOCALHOST, a.transport.port().await));
        (a_to_b, b_to_a)
    }

    async fn expect(node: &mut Node, data: &[u8]) {
        let packet = tokio::time::timeout(Duration::from_secs(10), node.handle.recv())
            .await
            .expect("timed out waiting for packet")
            .expect("sink closed");
        assert_eq!(&packet.data[..], data);
    }

    fn small_config() -> TransportConfig {
        TransportConfig {
            workers: 2,
            ..TransportConfig::default()
        }
    }

    #[tokio::test]
    async fn test_rekey_after_messages_keeps_old_key_as_previous() {
        let a = node(small_config()).await;
        let mut b = node(small_config()).await;
        let (a_to_b, _b_to_a) = connect(&a, &b).await;

        a.handle.send(b.key.public_key(), &b"abc"[..]).await.unwrap();
        expect(&mut b, b"abc").await;

        let old = a_to_b.current_keypair().unwrap();
        old.set_send_nonce(REKEY_AFTER_MESSAGES + 1);
        sync::write(&a_to_b.handshake).last_sent_handshake = None;

        // Still sent under the old key, then triggers the rekey.
        a.handle.send(b.key.public_key(), &b"def"[..]).await.unwrap();
        expect(&mut b, b"def").await;

        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let current = a_to_b.current_keypair().unwrap();
            if !Arc::ptr_eq(&current, &old) {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "rekey did not happen");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let previous = sync::read(&a_to_b.keypairs).previous.clone().unwrap();
        assert!(Arc::ptr_eq(&previous, &old));

        a.handle.send(b.key.public_key(), &b"ghi"[..]).await.unwrap();
        expect(&mut b, b"ghi").await;

        a.transport.close().await;
        b.transport.close().await;
    }

    fn junk_initiation(responder: &NoisePublicKey) -> PacketBuffer {
        let mut buffer = PacketBuffer::detached(MESSAGE_INITIATION_SIZE);
        buffer.set_len(MESSAGE_INITIATION_SIZE);
        for (i, byte) in buffer.iter_mut().enumerate() {
            *byte = i as u8;
        }
        buffer[..4].copy_from_slice(&MESSAGE_INITIATION_TYPE.to_le_bytes());
        CookieGenerator::new(responder).add_macs(&mut buffer);
        buffer
    }

    #[tokio::test]
    async fn test_rate_limit_applies_after_mac1() {
        let node = node(small_config()).await;
        let inner = node.transport.inner.clone();
        let public_key = node.key.public_key();

        let flooder = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 4000);
        for _ in 0..8 {
            inner
                .handle_handshake(HandshakeElement {
                    kind: noisy_core::MessageType::Initiation,
                    buffer: junk_initiation(&public_key),
                    endpoint: flooder,
                })
                .await;
        }
        assert!(!inner.rate_limiter.allow(flooder.ip()));

        // Invalid MAC1 never reaches the limiter.
        let forger = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)), 4000);
        let stranger = NoisePrivateKey::generate().public_key();
        for _ in 0..8 {
            inner
                .handle_handshake(HandshakeElement {
                    kind: noisy_core::MessageType::Initiation,
                    buffer: junk_initiation(&stranger),
                    endpoint: forger,
                })
                .await;
        }
        assert!(inner.rate_limiter.allow(forger.ip()));

        node.transport.close().await;
    }

    #[tokio::test]
    async fn test_under_load_is_sticky() {
        let config = TransportConfig {
            workers: 1,
            under_load_after_ms: 60_000,
            ..TransportConfig::default()
        };
        let (sink, _handle) = ChannelSourceSink::new(8);
        let transport = Transport::new(config, Arc::new(UdpBind::new(LOCALHOST)), sink).unwrap();
        let inner = transport.inner.clone();
        assert!(!inner.is_under_load());

        *sync::lock(&inner.under_load_until) = Some(Instant::now() + Duration::from_secs(60));
        assert!(inner.is_under_load());
        *sync::lock(&inner.under_load_until) = None;
        assert!(!inner.is_under_load());

        transport.close().await;
    }

    #[tokio::test]
    async fn test_state_transitions() {
        let (sink, _handle) = ChannelSourceSink::new(8);
        let transport =
            Transport::new(small_config(), Arc::new(UdpBind::new(LOCALHOST)), sink).unwrap();
        assert_eq!(transport.state(), TransportState::Down);
        transport.down().await.unwrap();
        assert_eq!(transport.state(), TransportState::Down);

        transport.up().await.unwrap();
        assert_eq!(transport.state(), TransportState::Up);
        assert_ne!(transport.port().await, 0);
        transport.up().await.unwrap();
        assert_eq!(transport.state(), TransportState::Up);

        transport.down().await.unwrap();
        assert_eq!(transport.state(), TransportState::Down);

        transport.close().await;
        assert_eq!(transport.state(), TransportState::Closed);
        transport.up().await.unwrap();
        assert_eq!(transport.state(), TransportState::Closed);
    }
}
