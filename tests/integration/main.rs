//! Conduit integration test harness.
//!
//! Everything runs in-process over real TCP (and TLS where the scenario
//! calls for it) on loopback: brokers are served by the library acceptor,
//! peers are forwarding backends, and the gateway bridge is driven both
//! directly and through a real HTTPS listener.

mod authorization;
mod endpoints;
mod fault;
mod framing;
mod messaging;
mod storage;

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use conduit_core::block::{BlockPool, DEFAULT_BLOCK_CAPACITY};
use conduit_core::endpoint::Endpoint;
use conduit_core::{DataBlock, PeerId};
use conduit_messaging::broker::{run_acceptor, testing::bind_port_pair, BrokerSessionContext};
use conduit_messaging::executor::AsyncBlockExecutor;
use conduit_messaging::forwarding::{
    ClientRetryPolicy, ForwardingBackend, ForwardingOptions, IncomingBlockHandler,
    MessagingClientFactory, PlainTcpConnector, StreamConnector, TcpTlsConnector,
};
use conduit_messaging::storage::ChunkStorage;
use conduit_messaging::{BrokerDispatchingBackend, ControlTokenSource, PeerQueueRegistry};

static COUNTER: AtomicU64 = AtomicU64::new(0);

/// Installs a process-wide rustls crypto provider exactly once.
///
/// Pulling in both `rustls` (workspace default) and `reqwest`'s
/// `rustls-tls` feature links two candidate providers into the test
/// binary, so rustls can no longer pick one automatically.
fn ensure_crypto_provider() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// A fresh scratch directory under the system temp dir.
pub fn temp_dir(tag: &str) -> PathBuf {
    let id = COUNTER.fetch_add(1, Ordering::Relaxed);
    let dir = std::env::temp_dir().join(format!(
        "conduit-it-{tag}-{}-{id}",
        std::process::id()
    ));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

// ── Test certificates ─────────────────────────────────────────────────────────

pub struct TestCerts {
    pub dir: PathBuf,
    pub certificate_file: PathBuf,
    pub private_key_file: PathBuf,
}

/// Self-signed identity for 127.0.0.1, written as PEM files the way a
/// deployment would provide them.
pub fn write_test_certificates() -> TestCerts {
    let dir = temp_dir("certs");

    let certified =
        rcgen::generate_simple_self_signed(vec!["127.0.0.1".to_string(), "localhost".to_string()])
            .expect("generate test certificate");

    let certificate_file = dir.join("cert.pem");
    let private_key_file = dir.join("key.pem");
    std::fs::write(&certificate_file, certified.cert.pem()).expect("write cert");
    std::fs::write(&private_key_file, certified.key_pair.serialize_pem()).expect("write key");

    TestCerts {
        dir,
        certificate_file,
        private_key_file,
    }
}

impl TestCerts {
    pub fn server_config(&self) -> Arc<rustls::ServerConfig> {
        ensure_crypto_provider();
        conduit_core::tls::server_config(&self.certificate_file, &self.private_key_file)
            .expect("server tls config")
    }

    pub fn client_connector(&self) -> Arc<TcpTlsConnector> {
        ensure_crypto_provider();
        let roots = conduit_core::tls::load_certs(&self.certificate_file).expect("load roots");
        let config = conduit_core::tls::client_config(roots).expect("client tls config");
        TcpTlsConnector::new(config)
    }
}

// ── In-process broker ─────────────────────────────────────────────────────────

pub struct TestBroker {
    pub port: u16,
    pub peer_id: PeerId,
    pub ctx: Arc<BrokerSessionContext>,
    pub control: ControlTokenSource,
    task: tokio::task::JoinHandle<()>,
}

pub async fn start_broker(
    tls: Option<Arc<rustls::ServerConfig>>,
    storage: Option<Arc<dyn ChunkStorage>>,
) -> TestBroker {
    let (inbound, outbound, port) = bind_port_pair().await;

    let peer_id = PeerId::generate();
    let pool = BlockPool::new(DEFAULT_BLOCK_CAPACITY);

    // Same server-state surface conduitd installs.
    let executor = Arc::new(
        AsyncBlockExecutor::new(pool.clone()).with_server_state_callback(Box::new(
            move |block| {
                let state = serde_json::json!({ "peerId": peer_id.to_string() });
                block.copy_from_slice(&serde_json::to_vec(&state).expect("serialize state"));
                Ok(())
            },
        )),
    );

    let ctx = Arc::new(BrokerSessionContext {
        local_peer_id: peer_id,
        backend: BrokerDispatchingBackend::new(PeerQueueRegistry::new(), None, None),
        storage,
        executor,
        pool,
    });

    let control = ControlTokenSource::new();
    let task = tokio::spawn(run_acceptor(
        inbound,
        outbound,
        tls.map(tokio_rustls::TlsAcceptor::from),
        ctx.clone(),
        control.token(),
    ));

    TestBroker {
        port,
        peer_id,
        ctx,
        control,
        task,
    }
}

impl TestBroker {
    pub async fn stop(self) {
        self.control.cancel();
        self.task.abort();
        let _ = self.task.await;
    }
}

// ── Forwarding backend helpers ────────────────────────────────────────────────

pub fn fast_options() -> ForwardingOptions {
    ForwardingOptions {
        connections: 2,
        wait_all_to_connect: false,
        connect_wait_budget: Duration::from_secs(5),
        poll_interval: Duration::from_millis(20),
        retry: ClientRetryPolicy {
            max_retry_count: 2,
            retry_timeout: Duration::from_millis(50),
        },
    }
}

pub async fn connect_backend(
    port: u16,
    local_peer_id: PeerId,
    pool: Arc<BlockPool>,
    handler: Arc<dyn IncomingBlockHandler>,
    connector: Arc<dyn StreamConnector>,
) -> Arc<ForwardingBackend> {
    ForwardingBackend::create(
        MessagingClientFactory::new(connector, local_peer_id, pool, handler),
        vec![Endpoint::new("127.0.0.1", port)],
        fast_options(),
    )
    .await
    .expect("forwarding backend connects")
}

pub fn plain_connector() -> Arc<dyn StreamConnector> {
    Arc::new(PlainTcpConnector)
}

// ── Shared handlers ───────────────────────────────────────────────────────────

/// Records every pushed block.
pub struct CollectingHandler {
    pub received: Mutex<Vec<Vec<u8>>>,
}

impl CollectingHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            received: Mutex::new(Vec::new()),
        })
    }

    pub async fn wait_for(&self, count: usize, budget: Duration) {
        let deadline = tokio::time::Instant::now() + budget;
        loop {
            let have = self.received.lock().unwrap().len();
            if have >= count {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "expected {count} blocks, got {have}"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

impl IncomingBlockHandler for CollectingHandler {
    fn handle_block(
        &self,
        _source_peer_id: PeerId,
        _frame: conduit_core::wire::CommandFrame,
        block: DataBlock,
    ) {
        self.received.lock().unwrap().push(block.as_slice().to_vec());
    }
}

/// Poll until `predicate` holds or the budget lapses.
pub async fn wait_until<F: Fn() -> bool>(predicate: F, budget: Duration, what: &str) {
    let deadline = tokio::time::Instant::now() + budget;
    loop {
        if predicate() {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
