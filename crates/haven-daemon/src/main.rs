//! havend: the haven storage node daemon.
//!
//! Wires the subsystems together and runs them on a Tokio runtime: the
//! message store, the swarm map fed by the chain oracle, the peer bus with
//! its dispatch loop, the legacy HTTP surface, and the cleanup ticker.

mod config;
mod dispatch;
mod http;
mod keys;
mod logbuf;
mod oracle;
mod relay;
mod sweeper;

use std::sync::Arc;
use std::time::Instant;

use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use haven_crypto::ed25519::KeyPair;
use haven_crypto::x25519::X25519SecretKey;
use haven_rpc::handler::HandlerParts;
use haven_rpc::stats::{AccessKeys, LogBuffer};
use haven_rpc::{MonitorMap, RequestHandler};
use haven_store::MessageStore;
use haven_swarm::SwarmMap;
use haven_transport::PeerBus;

use crate::config::NodeConfig;
use crate::keys::NodeKeys;
use crate::oracle::OracleClient;
use crate::relay::BusReplicator;

/// Shared node state handed to every subsystem task.
pub struct NodeState {
    pub store: Arc<MessageStore>,
    pub swarm: Arc<SwarmMap>,
    pub handler: Arc<RequestHandler>,
    pub bus: Arc<PeerBus>,
    pub onion_secret: X25519SecretKey,
    pub started: Instant,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = NodeConfig::load()?;
    let data_dir = config.data_dir();
    std::fs::create_dir_all(&data_dir)?;

    let logs = Arc::new(LogBuffer::default());
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(logbuf::BufferMakeWriter::new(logs.clone())),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), network = ?config.network, "havend starting");

    let node_keys = NodeKeys::load_or_create(&data_dir)?;
    let local_ed25519 = node_keys.ed25519.verifying_key.to_bytes();
    info!(identity = %hex::encode(local_ed25519), "node identity loaded");

    let store = Arc::new(MessageStore::open(
        &data_dir.join("messages.db"),
        config.storage.size_cap,
    )?);
    let swarm = Arc::new(SwarmMap::new(local_ed25519));
    let monitors = Arc::new(MonitorMap::new());

    let bus_identity = KeyPair::from_bytes(&node_keys.ed25519.signing_key.to_bytes());
    let (bus, bus_events) = PeerBus::start(config.listen.bus, bus_identity)?;

    let oracle = Arc::new(OracleClient::new(
        bus.clone(),
        config.oracle.address,
        config.oracle_pubkey(),
    ));

    let handler = Arc::new(RequestHandler::new(HandlerParts {
        network: config.network,
        store: store.clone(),
        swarm: swarm.clone(),
        monitors,
        replicator: Arc::new(BusReplicator::new(bus.clone(), swarm.clone())),
        oracle: oracle.clone(),
        access: AccessKeys::new(config.stats_access_keys()),
        logs,
    }));

    let node = Arc::new(NodeState {
        store,
        swarm: swarm.clone(),
        handler,
        bus,
        onion_secret: node_keys.x25519,
        started: Instant::now(),
    });

    // Prime the swarm map before serving; a failure here is survivable,
    // the ticker retries every cleanup period.
    match oracle.fetch_snapshot().await {
        Ok(snapshot) => swarm.update(&snapshot),
        Err(e) => warn!("initial swarm snapshot unavailable: {e}"),
    }

    tokio::spawn(dispatch::run(bus_events, node.clone()));
    tokio::spawn(sweeper::run(node.clone(), oracle));

    let http_node = node.clone();
    let http_bind = config.listen.http;
    tokio::spawn(async move {
        if let Err(e) = http::serve(http_node, http_bind).await {
            warn!("http surface stopped: {e}");
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    Ok(())
}
