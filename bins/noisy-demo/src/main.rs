#![forbid(unsafe_code)]

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use noisy_crypto::NoisePrivateKey;
use noisy_transport::{
    ChannelSourceSink, OutboundPacket, Transport, TransportConfig, TunnelHandle, UdpBind,
};
use rand::{Rng, RngCore};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

#[derive(Parser, Debug)]
#[command(name = "noisy-demo", about = "Send messages between two transports on loopback")]
struct Args {
    /// Number of messages A sends to B.
    #[arg(long, default_value_t = 100_000)]
    count: u64,

    #[arg(long, default_value_t = 12345)]
    port_a: u16,

    #[arg(long, default_value_t = 12346)]
    port_b: u16,

    /// Largest random message size in bytes.
    #[arg(long, default_value_t = 1200)]
    max_size: usize,

    /// Transport configuration as JSON. Defaults apply to missing fields.
    #[arg(long, env = "NOISY_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, default_value = "info")]
    log_level: String,
}

struct Endpoint {
    transport: Transport,
    handle: TunnelHandle,
    key: NoisePrivateKey,
}

async fn endpoint(config: TransportConfig, port: u16) -> Result<Endpoint> {
    let (sink, handle) = ChannelSourceSink::new(config.queue_inbound_size);
    let transport = Transport::new(config, Arc::new(UdpBind::new(LOCALHOST)), sink)?;
    let key = NoisePrivateKey::generate();
    transport.set_private_key(key.clone()).await;
    transport
        .update_port(port)
        .await
        .with_context(|| format!("failed to set port {}", port))?;
    Ok(Endpoint {
        transport,
        handle,
        key,
    })
}

fn load_config(path: Option<&PathBuf>) -> Result<TransportConfig> {
    match path {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            Ok(TransportConfig::from_json(&json)?)
        }
        None => Ok(TransportConfig::default()),
    }
}

async fn run(args: Args) -> Result<()> {
    let config = load_config(args.config.as_ref())?;
    if args.max_size == 0 || args.max_size > config.max_segment_size - 32 {
        return Err(anyhow!(
            "--max-size must be between 1 and {}",
            config.max_segment_size - 32
        ));
    }

    let a = endpoint(config.clone(), args.port_a).await?;
    let mut b = endpoint(config, args.port_b).await?;

    let a_to_b = a.transport.new_peer(b.key.public_key()).await?;
    a_to_b.set_endpoint(SocketAddr::new(LOCALHOST, args.port_b));
    let b_to_a = b.transport.new_peer(a.key.public_key()).await?;
    b_to_a.set_endpoint(SocketAddr::new(LOCALHOST, args.port_a));

    a.transport.up().await?;
    b.transport.up().await?;
    info!(
        "A ({}) on port {}, B ({}) on port {}",
        a.key.public_key(),
        a.transport.port().await,
        b.key.public_key(),
        b.transport.port().await
    );

    // Handshake before the burst; the staged backlog is small.
    a_to_b.set_persistent_keepalive(Duration::from_secs(25)).await;
    let deadline = Instant::now() + Duration::from_secs(10);
    while a_to_b.current_keypair().is_none() {
        if Instant::now() >= deadline {
            return Err(anyhow!("handshake with {} did not complete", a_to_b));
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    info!("Session established");

    let started = Instant::now();
    let sender = a.handle.sender();
    let destination = b.key.public_key();
    let count = args.count;
    let max_size = args.max_size;
    let producer = tokio::spawn(async move {
        for _ in 0..count {
            let message = {
                let mut rng = rand::thread_rng();
                let mut message = vec![0u8; rng.gen_range(1..=max_size)];
                rng.fill_bytes(&mut message);
                message
            };
            let packet = OutboundPacket {
                peer: destination,
                data: message.into(),
            };
            if sender.send(packet).await.is_err() {
                break;
            }
        }
    });

    let mut received = 0u64;
    let mut bytes = 0u64;
    let mut last_report = Instant::now();
    loop {
        tokio::select! {
            packet = tokio::time::timeout(Duration::from_secs(5), b.handle.recv()) => {
                match packet {
                    Ok(Some(packet)) => {
                        received += 1;
                        bytes += packet.data.len() as u64;
                    }
                    Ok(None) => break,
                    Err(_) => {
                        warn!("No messages for 5 seconds, giving up");
                        break;
                    }
                }
                if received == count {
                    break;
                }
                if last_report.elapsed() >= Duration::from_secs(1) {
                    info!("received {}/{} messages", received, count);
                    last_report = Instant::now();
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }

    let elapsed = started.elapsed();
    producer.abort();
    let stats = a_to_b.stats();
    info!(
        "received {}/{} messages ({} bytes) in {:.2?}, {:.1} Mbit/s, A sent {} bytes",
        received,
        count,
        bytes,
        elapsed,
        (bytes as f64 * 8.0) / elapsed.as_secs_f64().max(f64::EPSILON) / 1_000_000.0,
        stats.tx_bytes
    );

    a.transport.close().await;
    b.transport.close().await;
    a.transport.wait().await;
    b.transport.wait().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    run(args).await
}
