//! conduit-gateway — the HTTPS gateway bridge onto the messaging plane.

use std::sync::Arc;

use anyhow::{Context, Result};
use conduit_core::block::{BlockPool, DEFAULT_BLOCK_CAPACITY};
use conduit_core::PeerId;
use conduit_messaging::forwarding::{
    ForwardingOptions, MessagingClientFactory, TcpTlsConnector,
};
use conduit_messaging::ForwardingBackend;

use conduit_gateway::bridge::{GatewayBridge, PendingMap, ResponseSink};
use conduit_gateway::options::{parse_args, usage, GatewayOptions};
use conduit_gateway::server;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let options = match parse_args(&args) {
        Ok(options) => options,
        Err(err) => {
            eprintln!("error: {err}\n\n{}", usage());
            std::process::exit(2);
        }
    };

    let runtime = tokio::runtime::Runtime::new().expect("failed to start the runtime");
    if let Err(err) = runtime.block_on(run(options)) {
        tracing::error!(error = ?err, "gateway terminated");
    }

    // The gateway always exits with a non-zero code so operational
    // supervisors treat termination as alertable.
    std::process::exit(1);
}

async fn run(options: GatewayOptions) -> Result<()> {
    let source_peer_id = options.source_peer_id.unwrap_or_else(PeerId::generate);

    tracing::info!(
        source = %source_peer_id,
        target = %options.target_peer_id,
        endpoints = ?options.broker_endpoints.iter().map(ToString::to_string).collect::<Vec<_>>(),
        cookies = ?options.token_cookie_names,
        "gateway starting"
    );

    let server_tls =
        conduit_core::tls::server_config(&options.certificate_file, &options.private_key_file)
            .context("failed to load the gateway TLS identity")?;

    let roots = match &options.verify_root_ca {
        Some(path) => conduit_core::tls::load_certs(path)
            .context("failed to load the extra trust root")?,
        None => Vec::new(),
    };
    let client_tls =
        conduit_core::tls::client_config(roots).context("failed to build the client TLS config")?;

    let pool = BlockPool::new(DEFAULT_BLOCK_CAPACITY);
    let pending: Arc<PendingMap> = Arc::new(PendingMap::new());
    let sink = ResponseSink::new(pending.clone(), pool.clone());

    let factory = MessagingClientFactory::new(
        TcpTlsConnector::new(client_tls),
        source_peer_id,
        pool.clone(),
        sink,
    );

    let backend = ForwardingBackend::create(
        factory,
        options.broker_endpoints.clone(),
        ForwardingOptions {
            connections: options.connections,
            ..ForwardingOptions::default()
        },
    )
    .await
    .context("failed to establish broker connectivity")?;

    if options.expected_security_id.is_some() {
        // The check needs a principal, which needs an authorization
        // upstream; the bridge enforces it whenever a cache is wired in.
        tracing::warn!(
            "--expected-security-id is set but no authorization service is configured"
        );
    }

    let bridge = GatewayBridge::new(
        source_peer_id,
        options.target_peer_id,
        backend,
        pool,
        pending,
        None,
        options.token_cookie_names.clone(),
        options.token_type_default.clone(),
        options.token_data_default.clone(),
        options.request_timeout,
        options.expected_security_id.clone(),
        options.no_server_authentication_required,
        options.log_unauthorized_messages,
    );

    server::serve(bridge, options.inbound_port, server_tls).await
}
