use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use clap::Parser;
use matter_controller_core::collab::{
    DataVersionFilter, InteractionClient, InterfaceId, MdnsSocket, PeerAddress, PeerSet,
    PersistentStore, ReadResponse, SubscribeParams, SubscribeResponse, SubscriptionHandler,
};
use matter_controller_core::config::ControllerConfig;
use matter_controller_core::error::{ControllerError, Result as ControllerResult};
use matter_controller_core::mdns::records::CommissionableIdentifier;
use matter_controller_core::mdns::MdnsEngine;
use matter_controller_core::store::SqliteStore;
use matter_controller_core::{Clock, SystemClock};
use tokio::net::UdpSocket;
use tracing::{error, info, warn};

const IPV4_MULTICAST: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 251);
const MDNS_PORT: u16 = 5353;

/// Wiring shim for `matter-controller-core`: a real UDP mDNS socket and a
/// SQLite-backed persistent store behind the library's collaborator traits.
/// Real Matter exchange transport (PASE/CASE, TLV) is an explicit non-goal,
/// so the interaction client and peer set below are stand-ins that log
/// rather than actually negotiate a secure session.
#[derive(Parser, Debug)]
#[command(name = "controller-cli", version, about)]
struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, default_value = "/etc/matter-controller/config.toml")]
    config: String,

    /// SQLite database URL for the persistent store.
    #[arg(long, default_value = "sqlite://matter-controller.db")]
    database_url: String,

    /// Long discriminator of a commissionable device to watch for, if any.
    #[arg(long)]
    discriminator: Option<u16>,
}

/// Sends and receives raw mDNS packets over real IPv4 multicast UDP.
struct UdpMdnsSocket {
    socket: UdpSocket,
}

impl UdpMdnsSocket {
    async fn bind() -> std::io::Result<Self> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, MDNS_PORT)).await?;
        socket.join_multicast_v4(IPV4_MULTICAST, Ipv4Addr::UNSPECIFIED)?;
        Ok(Self { socket })
    }
}

#[async_trait]
impl MdnsSocket for UdpMdnsSocket {
    async fn send_multicast(&self, packet: &[u8], _ipv6: bool) -> ControllerResult<()> {
        let dest = SocketAddr::from((IPV4_MULTICAST, MDNS_PORT));
        self.socket
            .send_to(packet, dest)
            .await
            .map_err(|e| ControllerError::Transient(e.to_string()))?;
        Ok(())
    }

    async fn recv(&self) -> ControllerResult<(Vec<u8>, InterfaceId)> {
        let mut buf = vec![0u8; 9000];
        let (len, _from) = self
            .socket
            .recv_from(&mut buf)
            .await
            .map_err(|e| ControllerError::Transient(e.to_string()))?;
        buf.truncate(len);
        Ok((buf, matter_controller_core::collab::interface_loopback()))
    }
}

/// Real exchange transport (PASE/CASE session establishment, TLV encode) is
/// an explicit non-goal; this client only logs what it would have sent.
struct LoggingInteractionClient {
    peer: PeerAddress,
}

#[async_trait]
impl InteractionClient for LoggingInteractionClient {
    async fn read_all(&self, _filters: &[DataVersionFilter]) -> ControllerResult<ReadResponse> {
        warn!(peer = %self.peer, "read_all requested but no exchange transport is wired up");
        Ok(ReadResponse { attributes: Vec::new() })
    }

    async fn subscribe_all(
        &self,
        _params: SubscribeParams,
        _filters: &[DataVersionFilter],
        _handler: SubscriptionHandler,
    ) -> ControllerResult<SubscribeResponse> {
        warn!(peer = %self.peer, "subscribe_all requested but no exchange transport is wired up");
        Ok(SubscribeResponse {
            max_interval_secs: 60,
            initial_report: Vec::new(),
        })
    }

    async fn invoke(
        &self,
        endpoint: u16,
        cluster_id: u32,
        command_id: u32,
        _payload: serde_json::Value,
    ) -> ControllerResult<serde_json::Value> {
        warn!(peer = %self.peer, endpoint, cluster_id, command_id, "invoke requested but no exchange transport is wired up");
        Ok(serde_json::Value::Null)
    }

    async fn write(
        &self,
        endpoint: u16,
        cluster_id: u32,
        attribute_id: u32,
        _value: serde_json::Value,
    ) -> ControllerResult<()> {
        warn!(peer = %self.peer, endpoint, cluster_id, attribute_id, "write requested but no exchange transport is wired up");
        Ok(())
    }
}

struct LoggingPeerSet;

#[async_trait]
impl PeerSet for LoggingPeerSet {
    async fn connect(&self, peer: PeerAddress) -> ControllerResult<Arc<dyn InteractionClient>> {
        info!(%peer, "building interaction client (no real exchange transport wired up)");
        Ok(Arc::new(LoggingInteractionClient { peer }))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "controller_cli=info".into()),
        )
        .init();

    let cli = Cli::parse();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting matter-controller-core demonstration agent"
    );

    let cfg = ControllerConfig::from_file(&cli.config).unwrap_or_else(|e| {
        warn!("Falling back to default configuration: {e}");
        ControllerConfig::default()
    });
    info!(?cfg, "Configuration loaded");

    let store = SqliteStore::connect(&cli.database_url).await?;
    let _store: Arc<dyn PersistentStore> = Arc::new(store);
    let _peer_set: Arc<dyn PeerSet> = Arc::new(LoggingPeerSet);

    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());

    // Main loop: bind the mDNS socket, run discovery, reconnect on failure.
    let mut backoff_secs = 1u64;
    let max_backoff = 60u64;

    loop {
        info!("Binding mDNS multicast socket...");
        let socket = match UdpMdnsSocket::bind().await {
            Ok(s) => Arc::new(s),
            Err(e) => {
                error!("Failed to bind mDNS socket: {e}");
                tokio::time::sleep(Duration::from_secs(backoff_secs)).await;
                backoff_secs = (backoff_secs * 2).min(max_backoff);
                continue;
            }
        };

        let engine = MdnsEngine::new(socket.clone(), clock.clone(), cfg.ttl_grace_factor, cfg.ipv4_enabled);

        let recv_engine = engine.clone();
        let recv_socket = socket.clone();
        let recv_task = tokio::spawn(async move {
            loop {
                match recv_socket.recv().await {
                    Ok((bytes, interface)) => recv_engine.handle_incoming(&bytes, interface).await,
                    Err(e) => {
                        error!("mDNS recv error: {e}");
                        return;
                    }
                }
            }
        });

        let tick_engine = engine.clone();
        let tick_interval_ms = cfg.query_backoff_initial_ms.max(100);
        let tick_task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(tick_interval_ms));
            loop {
                interval.tick().await;
                tick_engine.tick().await;
            }
        });

        if let Some(discriminator) = cli.discriminator {
            info!(discriminator, "Watching for commissionable device");
            let devices = engine
                .find_commissionable(
                    CommissionableIdentifier::LongDiscriminator(discriminator),
                    Duration::from_secs(30),
                )
                .await;
            for device in devices {
                info!(instance = %device.instance_name, port = device.port, "Discovered commissionable device");
            }
        }

        tokio::select! {
            _ = recv_task => {
                error!("mDNS recv task ended; reconnecting after backoff");
            }
            _ = tick_task => {
                error!("mDNS tick task ended; reconnecting after backoff");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal");
                return Ok(());
            }
        }

        info!(backoff_secs, "Reconnecting after backoff");
        tokio::time::sleep(Duration::from_secs(backoff_secs)).await;
        backoff_secs = (backoff_secs * 2).min(max_backoff);
    }
}
