//! conduitd — the Conduit messaging broker daemon.
//!
//! Binds the block transfer listener pair (the configured port for inbound
//! commands, port + 1 for outbound pushes), wires the dispatching backend
//! and the optional chunk storage, and serves until interrupted.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;

use conduit_core::block::{BlockPool, DEFAULT_BLOCK_CAPACITY};
use conduit_core::config::BrokerConfig;
use conduit_core::PeerId;
use conduit_messaging::backend::BackendProcessing;
use conduit_messaging::broker::{run_acceptor, BrokerSessionContext};
use conduit_messaging::executor::AsyncBlockExecutor;
use conduit_messaging::storage::{
    ChunkStorage, MultiFileChunkStorage, SingleFileChunkStorage,
};
use conduit_messaging::{BrokerDispatchingBackend, ControlTokenSource, PeerQueueRegistry};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialise tracing — RUST_LOG controls verbosity
    // e.g. RUST_LOG=debug cargo run -p conduitd
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = BrokerConfig::load().context("failed to load broker configuration")?;

    let peer_id = if config.network.peer_id.is_empty() {
        PeerId::generate()
    } else {
        PeerId::parse(&config.network.peer_id).context("invalid network.peer_id")?
    };

    tracing::info!(
        peer = %peer_id,
        host = %config.network.host,
        port = config.network.port,
        "conduitd starting"
    );

    let storage: Option<Arc<dyn ChunkStorage>> = if config.storage.root.as_os_str().is_empty() {
        None
    } else if config.storage.single_file {
        Some(Arc::new(
            SingleFileChunkStorage::open(&config.storage.root)
                .context("failed to open single-file chunk storage")?,
        ))
    } else {
        Some(Arc::new(
            MultiFileChunkStorage::open(&config.storage.root)
                .context("failed to open chunk storage")?,
        ))
    };

    let pool = BlockPool::new(DEFAULT_BLOCK_CAPACITY);
    let registry = PeerQueueRegistry::new();
    let backend = BrokerDispatchingBackend::new(registry, None, None);

    let executor = Arc::new(
        AsyncBlockExecutor::new(pool.clone()).with_server_state_callback({
            let backend = backend.clone();
            Box::new(move |block| {
                let state = serde_json::json!({
                    "peerId": peer_id.to_string(),
                    "connectedPeers": backend.all_active_queue_ids().len(),
                });
                let bytes = serde_json::to_vec(&state)
                    .map_err(|e| conduit_core::Error::server("failed to serialize server state", e))?;
                block.copy_from_slice(&bytes);
                Ok(())
            })
        }),
    );

    let ctx = Arc::new(BrokerSessionContext {
        local_peer_id: peer_id,
        backend: backend.clone(),
        storage: storage.clone(),
        executor,
        pool,
    });

    let tls = conduit_core::tls::server_config(
        &config.tls.certificate_file,
        &config.tls.private_key_file,
    )
    .context("failed to load the broker TLS identity")?;
    let acceptor = tokio_rustls::TlsAcceptor::from(tls);

    let inbound = TcpListener::bind((config.network.host.as_str(), config.network.port))
        .await
        .with_context(|| format!("failed to bind inbound port {}", config.network.port))?;
    let outbound = TcpListener::bind((config.network.host.as_str(), config.network.port + 1))
        .await
        .with_context(|| format!("failed to bind outbound port {}", config.network.port + 1))?;

    let control = ControlTokenSource::new();
    let acceptor_task = tokio::spawn(run_acceptor(
        inbound,
        outbound,
        Some(acceptor),
        ctx,
        control.token(),
    ));

    tokio::signal::ctrl_c()
        .await
        .context("failed to wait for the interrupt signal")?;
    tracing::info!("shutdown requested");

    // Disposal order: stop accepting, dispose the backend, then storage.
    control.cancel();
    let _ = acceptor_task.await;
    backend.dispose();
    if let Some(storage) = storage {
        storage.dispose();
    }

    tracing::info!("conduitd stopped");
    Ok(())
}
