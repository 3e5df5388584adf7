//! Network binding.
//!
//! A [`Bind`] opens the datagram sockets the transport sends and receives
//! on. Opening returns one [`Receiver`] per socket path; the transport runs a
//! receive routine for each. Closing a bind makes every pending and future
//! receive fail so those routines exit.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};

use futures_util::future::BoxFuture;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::debug;

use crate::pool::PacketBuffer;

pub trait Bind: Send + Sync + 'static {
    /// Bind to `port` (0 picks any). Returns the receivers and the actual port.
    fn open(&self, port: u16) -> BoxFuture<'_, io::Result<(Vec<Arc<dyn Receiver>>, u16)>>;

    fn close(&self) -> BoxFuture<'_, io::Result<()>>;

    /// Send each buffer as one datagram to `endpoint`.
    fn send<'a>(&'a self, buffers: &'a [&'a [u8]], endpoint: SocketAddr)
        -> BoxFuture<'a, io::Result<()>>;

    /// Number of datagrams a receiver may return per call.
    fn batch_size(&self) -> usize;
}

pub trait Receiver: Send + Sync {
    /// Fill up to `buffers.len()` buffers. Waits for at least one datagram and
    /// returns how many were received; `sizes[i]` and `endpoints[i]` describe
    /// buffer `i`.
    fn receive<'a>(
        &'a self,
        buffers: &'a mut [PacketBuffer],
        sizes: &'a mut [usize],
        endpoints: &'a mut [Option<SocketAddr>],
    ) -> BoxFuture<'a, io::Result<usize>>;
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "bind closed")
}

struct OpenSocket {
    socket: Arc<UdpSocket>,
    shutdown: watch::Sender<bool>,
}

/// [`Bind`] over a single tokio UDP socket.
pub struct UdpBind {
    addr: IpAddr,
    batch_size: usize,
    socket: Mutex<Option<OpenSocket>>,
}

impl Default for UdpBind {
    fn default() -> Self {
        Self::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
    }
}

impl UdpBind {
    pub const DEFAULT_BATCH_SIZE: usize = 32;

    pub fn new(addr: IpAddr) -> Self {
        Self {
            addr,
            batch_size: Self::DEFAULT_BATCH_SIZE,
            socket: Mutex::new(None),
        }
    }

    fn current(&self) -> Option<Arc<UdpSocket>> {
        match self.socket.lock() {
            Ok(guard) => guard.as_ref().map(|s| s.socket.clone()),
            Err(poisoned) => poisoned.into_inner().as_ref().map(|s| s.socket.clone()),
        }
    }
}

impl Bind for UdpBind {
    fn open(&self, port: u16) -> BoxFuture<'_, io::Result<(Vec<Arc<dyn Receiver>>, u16)>> {
        Box::pin(async move {
            if self.current().is_some() {
                return Err(io::Error::new(io::ErrorKind::AlreadyExists, "bind already open"));
            }
            let socket = Arc::new(UdpSocket::bind(SocketAddr::new(self.addr, port)).await?);
            let actual = socket.local_addr()?.port();
            let (shutdown, rx) = watch::channel(false);

            let receiver: Arc<dyn Receiver> = Arc::new(UdpReceiver {
                socket: socket.clone(),
                shutdown: rx,
            });
            let mut guard = self
                .socket
                .lock()
                .map_err(|_| io::Error::new(io::ErrorKind::Other, "bind state poisoned"))?;
            if guard.is_some() {
                return Err(io::Error::new(io::ErrorKind::AlreadyExists, "bind already open"));
            }
            *guard = Some(OpenSocket { socket, shutdown });
            debug!("UDP bind listening on {}:{}", self.addr, actual);
            Ok((vec![receiver], actual))
        })
    }

    fn close(&self) -> BoxFuture<'_, io::Result<()>> {
        Box::pin(async move {
            let open = match self.socket.lock() {
                Ok(mut guard) => guard.take(),
                Err(poisoned) => poisoned.into_inner().take(),
            };
            if let Some(open) = open {
                let _ = open.shutdown.send(true);
            }
            Ok(())
        })
    }

    fn send<'a>(
        &'a self,
        buffers: &'a [&'a [u8]],
        endpoint: SocketAddr,
    ) -> BoxFuture<'a, io::Result<()>> {
        Box::pin(async move {
            let socket = self.current().ok_or_else(closed_error)?;
            for buffer in buffers {
                socket.send_to(buffer, endpoint).await?;
            }
            Ok(())
        })
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }
}

struct UdpReceiver {
    socket: Arc<UdpSocket>,
    shutdown: watch::Receiver<bool>,
}

impl Receiver for UdpReceiver {
    fn receive<'a>(
        &'a self,
        buffers: &'a mut [PacketBuffer],
        sizes: &'a mut [usize],
        endpoints: &'a mut [Option<SocketAddr>],
    ) -> BoxFuture<'a, io::Result<usize>> {
        Box::pin(async move {
            let limit = buffers.len().min(sizes.len()).min(endpoints.len());
            if limit == 0 {
                return Ok(0);
            }
            let mut shutdown = self.shutdown.clone();
            if *shutdown.borrow_and_update() {
                return Err(closed_error());
            }

            let (size, src) = tokio::select! {
                res = self.socket.recv_from(buffers[0].storage_mut()) => res?,
                _ = shutdown.changed() => return Err(closed_error()),
            };
            sizes[0] = size;
            endpoints[0] = Some(src);

            // Drain whatever else is already queued without waiting.
            let mut count = 1;
            while count < limit {
                match self.socket.try_recv_from(buffers[count].storage_mut()) {
                    Ok((size, src)) => {
                        sizes[count] = size;
                        endpoints[count] = Some(src);
                        count += 1;
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => return Err(e),
                }
            }
            Ok(count)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_open_send_receive() {
        let a = UdpBind::new(IpAddr::V4(Ipv4Addr::LOCALHOST));
        let b = UdpBind::new(IpAddr::V4(Ipv4Addr::LOCALHOST));
        let (_, port_a) = a.open(0).await.unwrap();
        let (receivers, port_b) = b.open(0).await.unwrap();
        assert_ne!(port_b, 0);

        let dest = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port_b);
        a.send(&[&b"one"[..], &b"two"[..]], dest).await.unwrap();

        let mut buffers = vec![PacketBuffer::detached(64), PacketBuffer::detached(64)];
        let mut sizes = [0usize; 2];
        let mut endpoints = [None; 2];
        let mut got = Vec::new();
        while got.len() < 2 {
            let n = receivers[0]
                .receive(&mut buffers, &mut sizes, &mut endpoints)
                .await
                .unwrap();
            for i in 0..n {
                assert_eq!(endpoints[i].unwrap().port(), port_a);
                got.push(buffers[i].storage_mut()[..sizes[i]].to_vec());
            }
        }
        assert_eq!(got, vec![b"one".to_vec(), b"two".to_vec()]);
    }

    #[tokio::test]
    async fn test_close_unblocks_receiver() {
        let bind = Arc::new(UdpBind::new(IpAddr::V4(Ipv4Addr::LOCALHOST)));
        let (receivers, _) = bind.open(0).await.unwrap();
        let receiver = receivers[0].clone();

        let task = tokio::spawn(async move {
            let mut buffers = vec![PacketBuffer::detached(64)];
            let mut sizes = [0usize; 1];
            let mut endpoints = [None; 1];
            receiver.receive(&mut buffers, &mut sizes, &mut endpoints).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        bind.close().await.unwrap();

        let res = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(res.unwrap_err().kind(), io::ErrorKind::NotConnected);
        assert!(bind.send(&[&b"x"[..]], "127.0.0.1:9".parse().unwrap()).await.is_err());
    }

    #[tokio::test]
    async fn test_double_open_rejected() {
        let bind = UdpBind::new(IpAddr::V4(Ipv4Addr::LOCALHOST));
        bind.open(0).await.unwrap();
        assert!(bind.open(0).await.is_err());
        bind.close().await.unwrap();
        bind.open(0).await.unwrap();
    }
}
