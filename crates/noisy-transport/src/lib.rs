//! Noise IK tunnel engine.
//!
//! This crate provides:
//! - The [`Transport`] lifecycle (down, up, closed) and its peer table
//! - Per-peer handshakes, keypair rotation and protocol timers
//! - Cookie and rate-limit defenses against handshake floods
//! - The encryption/decryption worker pipeline with per-peer ordering
//! - The [`Bind`] and [`SourceSink`] collaborator traits, with a UDP bind
//!   and a channel-backed source/sink
//!
//! # Design
//!
//! Work fans out to shared worker pools and fans back in per peer:
//!
//! ```text
//! SourceSink -> staged -> encryption workers -> sequential sender -> Bind
//! Bind -> receive routine -> decryption workers -> sequential receiver -> SourceSink
//!                        \-> handshake workers
//! ```
//!
//! Packets are numbered per peer when they enter a worker queue, and the
//! sequential routines put them back in that order, so workers never need
//! to coordinate with each other.

#![forbid(unsafe_code)]

pub mod config;
pub mod conn;
pub mod error;
pub mod handshake;
pub mod keypair;
pub mod peer;
pub mod pool;
pub mod ratelimiter;
pub mod sequence;
pub mod source_sink;
pub mod transport;

mod index;
mod queue;
mod receive;
mod send;
mod sync;
mod timers;

pub use config::TransportConfig;
pub use conn::{Bind, Receiver, UdpBind};
pub use error::{HandshakeError, TransportError};
pub use peer::{Peer, PeerStats};
pub use pool::{BufferPool, BufferPoolStats, PacketBuffer};
pub use ratelimiter::RateLimiter;
pub use source_sink::{
    ChannelSourceSink, InboundPacket, OutboundPacket, SourceError, SourceSink, TunnelHandle,
};
pub use transport::{Transport, TransportState};
