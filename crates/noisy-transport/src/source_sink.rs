//! Application side of the tunnel.
//!
//! The transport reads plaintext destined for a peer from a [`SourceSink`]
//! and writes decrypted plaintext back to it. [`ChannelSourceSink`] is an
//! in-process implementation over bounded tokio channels; the application
//! talks to it through a [`TunnelHandle`].

use std::io;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use noisy_crypto::NoisePublicKey;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("source/sink closed")]
    Closed,

    #[error("source/sink I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Plaintext to be encrypted and sent to `peer`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundPacket {
    pub peer: NoisePublicKey,
    pub data: Bytes,
}

/// Plaintext received from `peer`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundPacket {
    pub peer: NoisePublicKey,
    pub data: Bytes,
}

pub trait SourceSink: Send + Sync + 'static {
    /// Append up to `max` packets to `packets`. Resolves once at least one
    /// packet is available; `Err(Closed)` ends the transport's read routine.
    fn read<'a>(
        &'a self,
        packets: &'a mut Vec<OutboundPacket>,
        max: usize,
    ) -> BoxFuture<'a, Result<usize, SourceError>>;

    /// Deliver decrypted packets. Returns how many were accepted.
    fn write(&self, packets: Vec<InboundPacket>) -> BoxFuture<'_, Result<usize, SourceError>>;

    fn close(&self) -> BoxFuture<'_, Result<(), SourceError>>;

    fn batch_size(&self) -> usize;
}

/// [`SourceSink`] backed by a pair of bounded channels.
pub struct ChannelSourceSink {
    outbound: Mutex<mpsc::Receiver<OutboundPacket>>,
    inbound: mpsc::Sender<InboundPacket>,
    closed: watch::Sender<bool>,
    batch_size: usize,
}

/// Application end of a [`ChannelSourceSink`].
pub struct TunnelHandle {
    outbound: mpsc::Sender<OutboundPacket>,
    inbound: mpsc::Receiver<InboundPacket>,
}

impl ChannelSourceSink {
    pub const DEFAULT_BATCH_SIZE: usize = 32;

    pub fn new(capacity: usize) -> (Arc<Self>, TunnelHandle) {
        let (out_tx, out_rx) = mpsc::channel(capacity.max(1));
        let (in_tx, in_rx) = mpsc::channel(capacity.max(1));
        let (closed, _) = watch::channel(false);
        let sink = Arc::new(Self {
            outbound: Mutex::new(out_rx),
            inbound: in_tx,
            closed,
            batch_size: Self::DEFAULT_BATCH_SIZE,
        });
        let handle = TunnelHandle {
            outbound: out_tx,
            inbound: in_rx,
        };
        (sink, handle)
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

impl SourceSink for ChannelSourceSink {
    fn read<'a>(
        &'a self,
        packets: &'a mut Vec<OutboundPacket>,
        max: usize,
    ) -> BoxFuture<'a, Result<usize, SourceError>> {
        Box::pin(async move {
            let mut closed = self.closed.subscribe();
            if *closed.borrow_and_update() {
                return Err(SourceError::Closed);
            }
            let mut rx = tokio::select! {
                rx = self.outbound.lock() => rx,
                _ = closed.changed() => return Err(SourceError::Closed),
            };
            let first = tokio::select! {
                packet = rx.recv() => packet,
                _ = closed.changed() => return Err(SourceError::Closed),
            };
            let Some(first) = first else {
                // Every handle dropped.
                return Err(SourceError::Closed);
            };
            packets.push(first);
            let mut count = 1;
            while count < max {
                match rx.try_recv() {
                    Ok(packet) => {
                        packets.push(packet);
                        count += 1;
                    }
                    Err(_) => break,
                }
            }
            Ok(count)
        })
    }

    fn write(&self, packets: Vec<InboundPacket>) -> BoxFuture<'_, Result<usize, SourceError>> {
        Box::pin(async move {
            let mut closed = self.closed.subscribe();
            let mut written = 0;
            for packet in packets {
                if *closed.borrow_and_update() {
                    return Err(SourceError::Closed);
                }
                tokio::select! {
                    res = self.inbound.send(packet) => {
                        if res.is_err() {
                            return Err(SourceError::Closed);
                        }
                    }
                    _ = closed.changed() => return Err(SourceError::Closed),
                }
                written += 1;
            }
            Ok(written)
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<(), SourceError>> {
        Box::pin(async move {
            self.closed.send_replace(true);
            Ok(())
        })
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }
}

impl TunnelHandle {
    /// Queue `data` for encryption to `peer`.
    pub async fn send(
        &self,
        peer: NoisePublicKey,
        data: impl Into<Bytes>,
    ) -> Result<(), SourceError> {
        self.outbound
            .send(OutboundPacket {
                peer,
                data: data.into(),
            })
            .await
            .map_err(|_| SourceError::Closed)
    }

    /// Next decrypted packet. `None` once the sink is gone.
    pub async fn recv(&mut self) -> Option<InboundPacket> {
        self.inbound.recv().await
    }

    /// A cloneable sender for producing from several tasks.
    pub fn sender(&self) -> mpsc::Sender<OutboundPacket> {
        self.outbound.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn key(b: u8) -> NoisePublicKey {
        NoisePublicKey::from_bytes([b; 32])
    }

    #[tokio::test]
    async fn test_read_batches_available_packets() {
        let (sink, handle) = ChannelSourceSink::new(8);
        for i in 0..3u8 {
            handle.send(key(1), vec![i]).await.unwrap();
        }
        let mut packets = Vec::new();
        assert_eq!(sink.read(&mut packets, 2).await.unwrap(), 2);
        assert_eq!(sink.read(&mut packets, 2).await.unwrap(), 1);
        let data: Vec<u8> = packets.iter().map(|p| p.data[0]).collect();
        assert_eq!(data, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_read_waits_for_first_packet() {
        let (sink, handle) = ChannelSourceSink::new(8);
        let reader = {
            let sink = sink.clone();
            tokio::spawn(async move {
                let mut packets = Vec::new();
                let n = sink.read(&mut packets, 4).await;
                (n, packets)
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!reader.is_finished());

        handle.send(key(3), &b"late"[..]).await.unwrap();
        let (n, packets) = tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n.unwrap(), 1);
        assert_eq!(&packets[0].data[..], b"late");
    }

    #[tokio::test]
    async fn test_write_reaches_handle() {
        let (sink, mut handle) = ChannelSourceSink::new(8);
        let n = sink
            .write(vec![InboundPacket {
                peer: key(2),
                data: Bytes::from_static(b"abc"),
            }])
            .await
            .unwrap();
        assert_eq!(n, 1);
        let packet = handle.recv().await.unwrap();
        assert_eq!(packet.peer, key(2));
        assert_eq!(&packet.data[..], b"abc");
    }

    #[tokio::test]
    async fn test_close_unblocks_read() {
        let (sink, _handle) = ChannelSourceSink::new(8);
        let reader = {
            let sink = sink.clone();
            tokio::spawn(async move {
                let mut packets = Vec::new();
                sink.read(&mut packets, 4).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        sink.close().await.unwrap();
        let res = tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(res, Err(SourceError::Closed)));
        assert!(sink.is_closed());
    }

    #[tokio::test]
    async fn test_dropped_handle_closes_source() {
        let (sink, handle) = ChannelSourceSink::new(8);
        drop(handle);
        let mut packets = Vec::new();
        assert!(matches!(
            sink.read(&mut packets, 4).await,
            Err(SourceError::Closed)
        ));
    }
}
