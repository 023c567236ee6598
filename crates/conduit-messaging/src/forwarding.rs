//! The client-side forwarding backend.
//!
//! Maintains N outbound messaging clients per configured broker endpoint,
//! exposes the same backend interface as the broker-side dispatcher, and
//! round-robins block sends across whichever clients are currently
//! connected. Each client owns a connection pair: one connection carrying
//! its sends to the broker (the broker's inbound port) and one carrying the
//! broker's pushes back (inbound port + 1).

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use conduit_core::endpoint::{Endpoint, EndpointSelector};
use conduit_core::wire::{BlockType, CommandFrame};
use conduit_core::{BlockPool, DataBlock, Error, PeerId, Result};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};

use crate::backend::{BackendProcessing, BackendRequest, OperationId, Task};
use crate::control::{ControlToken, ControlTokenSource};
use crate::queue::QueuedBlock;
use crate::transfer::BlockTransferConnection;

/// Endpoint lists are expanded so every broker gets at least this many
/// client connections.
pub const MIN_CONNECTIONS_PER_ENDPOINT: usize = 8;

/// Expand the configured endpoints to the full client list:
/// `max(requested, MIN_CONNECTIONS_PER_ENDPOINT × endpoints)` entries,
/// round-robin over the endpoint order.
pub fn expand_endpoints(requested: usize, endpoints: &[Endpoint]) -> Vec<Endpoint> {
    assert!(!endpoints.is_empty(), "endpoint list is empty");
    let count = requested.max(MIN_CONNECTIONS_PER_ENDPOINT * endpoints.len());
    (0..count)
        .map(|i| endpoints[i % endpoints.len()].clone())
        .collect()
}

// ── Stream connectors ────────────────────────────────────────────────────────

/// Object-safe duplex byte stream.
pub trait DuplexStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> DuplexStream for T {}

pub type BoxedDuplex = Box<dyn DuplexStream>;

/// Dials one endpoint and yields a byte stream. Production uses
/// [`TcpTlsConnector`]; tests use [`PlainTcpConnector`].
pub trait StreamConnector: Send + Sync {
    fn connect(
        &self,
        endpoint: &Endpoint,
    ) -> Pin<Box<dyn Future<Output = Result<BoxedDuplex>> + Send + 'static>>;
}

/// TCP + TLS with certificate verification against the configured roots.
pub struct TcpTlsConnector {
    config: Arc<rustls::ClientConfig>,
}

impl TcpTlsConnector {
    pub fn new(config: Arc<rustls::ClientConfig>) -> Arc<Self> {
        Arc::new(Self { config })
    }
}

impl StreamConnector for TcpTlsConnector {
    fn connect(
        &self,
        endpoint: &Endpoint,
    ) -> Pin<Box<dyn Future<Output = Result<BoxedDuplex>> + Send + 'static>> {
        let host = endpoint.host.clone();
        let port = endpoint.port;
        let connector = tokio_rustls::TlsConnector::from(self.config.clone());

        Box::pin(async move {
            let tcp = TcpStream::connect((host.as_str(), port)).await?;
            tcp.set_nodelay(true)?;

            let name = conduit_core::tls::server_name(&host)
                .map_err(|e| Error::Connectivity(e.to_string()))?;
            let stream = connector.connect(name, tcp).await.map_err(|e| {
                Error::Connectivity(format!("TLS handshake with {host}:{port} failed: {e}"))
            })?;

            Ok(Box::new(stream) as BoxedDuplex)
        })
    }
}

/// Plain TCP, for tests and trusted-network deployments.
pub struct PlainTcpConnector;

impl StreamConnector for PlainTcpConnector {
    fn connect(
        &self,
        endpoint: &Endpoint,
    ) -> Pin<Box<dyn Future<Output = Result<BoxedDuplex>> + Send + 'static>> {
        let host = endpoint.host.clone();
        let port = endpoint.port;

        Box::pin(async move {
            let tcp = TcpStream::connect((host.as_str(), port)).await?;
            tcp.set_nodelay(true)?;
            Ok(Box::new(tcp) as BoxedDuplex)
        })
    }
}

// ── Incoming block handler ───────────────────────────────────────────────────

/// Receives blocks pushed by the broker. The handler owns the block.
pub trait IncomingBlockHandler: Send + Sync {
    fn handle_block(&self, source_peer_id: PeerId, frame: CommandFrame, block: DataBlock);
}

// ── Messaging client ─────────────────────────────────────────────────────────

/// Connection policy for one messaging client.
#[derive(Debug, Clone)]
pub struct ClientRetryPolicy {
    pub max_retry_count: usize,
    pub retry_timeout: Duration,
}

impl Default for ClientRetryPolicy {
    fn default() -> Self {
        Self {
            max_retry_count: conduit_core::endpoint::DEFAULT_MAX_RETRY_COUNT,
            retry_timeout: conduit_core::endpoint::DEFAULT_RETRY_TIMEOUT,
        }
    }
}

/// One outbound client: a send/receive connection pair to a single broker
/// endpoint, kept alive by a background task with a bounded retry budget.
pub struct MessagingClient {
    endpoint: Endpoint,
    tx: mpsc::UnboundedSender<QueuedBlock>,
    connected: Arc<AtomicBool>,
    broker_peer_id: Arc<Mutex<Option<PeerId>>>,
}

impl MessagingClient {
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// The broker's peer id, once the first handshake completed.
    pub fn broker_peer_id(&self) -> Option<PeerId> {
        *self.broker_peer_id.lock().expect("client state lock")
    }

    /// Queue one block for `target` through this client. The task resolves
    /// when the broker acknowledged the block.
    pub fn dispatch_block(&self, target_peer_id: PeerId, block: DataBlock) -> Task {
        let (done_tx, done_rx) = oneshot::channel();
        let entry = QueuedBlock {
            target_peer_id,
            block,
            on_ready: Box::new(move |result| {
                let _ = done_tx.send(result);
            }),
        };

        let send_failed = self.tx.send(entry).is_err();
        let endpoint = self.endpoint.clone();

        Box::pin(async move {
            if send_failed {
                return Err(Error::Connectivity(format!(
                    "client for {endpoint} is gone"
                )));
            }
            match done_rx.await {
                Ok(result) => result.map(|()| None),
                Err(_) => Err(Error::Connectivity(format!(
                    "client for {endpoint} dropped the send"
                ))),
            }
        })
    }
}

/// Creates messaging clients bound to one local peer identity.
pub struct MessagingClientFactory {
    connector: Arc<dyn StreamConnector>,
    local_peer_id: PeerId,
    pool: Arc<BlockPool>,
    handler: Arc<dyn IncomingBlockHandler>,
    retry: ClientRetryPolicy,
}

impl MessagingClientFactory {
    pub fn new(
        connector: Arc<dyn StreamConnector>,
        local_peer_id: PeerId,
        pool: Arc<BlockPool>,
        handler: Arc<dyn IncomingBlockHandler>,
    ) -> Self {
        Self {
            connector,
            local_peer_id,
            pool,
            handler,
            retry: ClientRetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: ClientRetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Start a client for `endpoint` (its port is the broker's inbound
    /// port; the receive connection dials port + 1). The client begins
    /// connecting immediately and keeps retrying within its budget.
    pub fn start_client(&self, endpoint: Endpoint, token: ControlToken) -> Arc<MessagingClient> {
        let (tx, rx) = mpsc::unbounded_channel();
        let connected = Arc::new(AtomicBool::new(false));
        let broker_peer_id = Arc::new(Mutex::new(None));

        let client = Arc::new(MessagingClient {
            endpoint: endpoint.clone(),
            tx,
            connected: connected.clone(),
            broker_peer_id: broker_peer_id.clone(),
        });

        tokio::spawn(run_client(
            endpoint,
            self.connector.clone(),
            self.local_peer_id,
            self.pool.clone(),
            self.handler.clone(),
            self.retry.clone(),
            token,
            connected,
            broker_peer_id,
            rx,
        ));

        client
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_client(
    endpoint: Endpoint,
    connector: Arc<dyn StreamConnector>,
    local_peer_id: PeerId,
    pool: Arc<BlockPool>,
    handler: Arc<dyn IncomingBlockHandler>,
    retry: ClientRetryPolicy,
    mut token: ControlToken,
    connected: Arc<AtomicBool>,
    broker_peer_id: Arc<Mutex<Option<PeerId>>>,
    mut rx: mpsc::UnboundedReceiver<QueuedBlock>,
) {
    let mut iterator = EndpointSelector::single(endpoint.clone())
        .with_retry_policy(retry.max_retry_count, retry.retry_timeout)
        .iterator();

    loop {
        // Gate on the retry clock before dialing.
        loop {
            if token.is_canceled() {
                crate::queue::drain_with_disconnect_error(local_peer_id, &mut rx, &pool);
                return;
            }

            let (allowed, wait) = iterator.can_retry_now();
            if allowed {
                break;
            }
            if wait.is_zero() {
                // Budget exhausted; this client is permanently down.
                tracing::warn!(endpoint = %endpoint, "client retry budget exhausted");
                crate::queue::drain_with_disconnect_error(local_peer_id, &mut rx, &pool);
                return;
            }

            tokio::select! {
                () = tokio::time::sleep(wait) => {}
                () = token.canceled() => {}
            }
        }

        match establish_pair(&*connector, &endpoint, local_peer_id, &pool, &token).await {
            Ok((send_conn, recv_conn)) => {
                let broker = send_conn.remote_peer_id();
                *broker_peer_id.lock().expect("client state lock") = broker;
                iterator.reset_retry();
                connected.store(true, Ordering::SeqCst);
                tracing::info!(endpoint = %endpoint, broker = ?broker, "messaging client connected");

                rx = run_connected(send_conn, recv_conn, rx, &pool, &handler, &token).await;

                connected.store(false, Ordering::SeqCst);
                tracing::info!(endpoint = %endpoint, "messaging client disconnected");

                if token.is_canceled() {
                    crate::queue::drain_with_disconnect_error(local_peer_id, &mut rx, &pool);
                    return;
                }
            }
            Err(err) => {
                tracing::debug!(endpoint = %endpoint, error = %err, "client connect failed");
                if !iterator.select_next() {
                    tracing::warn!(endpoint = %endpoint, "client retry budget exhausted");
                    crate::queue::drain_with_disconnect_error(local_peer_id, &mut rx, &pool);
                    return;
                }
            }
        }
    }
}

/// Dial the (send, receive) connection pair and run the version exchange on
/// both.
async fn establish_pair(
    connector: &dyn StreamConnector,
    endpoint: &Endpoint,
    local_peer_id: PeerId,
    pool: &Arc<BlockPool>,
    token: &ControlToken,
) -> Result<(
    BlockTransferConnection<BoxedDuplex>,
    BlockTransferConnection<BoxedDuplex>,
)> {
    let receive_endpoint = Endpoint::new(endpoint.host.clone(), endpoint.port + 1);

    let (send_stream, recv_stream) = tokio::try_join!(
        connector.connect(endpoint),
        connector.connect(&receive_endpoint),
    )?;

    let (send_conn, recv_conn) = tokio::try_join!(
        BlockTransferConnection::connect(send_stream, pool.clone(), local_peer_id, token.clone()),
        BlockTransferConnection::connect(recv_stream, pool.clone(), local_peer_id, token.clone()),
    )?;

    Ok((send_conn, recv_conn))
}

/// Drive the connected pair until either side fails or the token fires.
/// The send and receive loops run as separate tasks because a frame read
/// cannot be abandoned halfway.
async fn run_connected(
    send_conn: BlockTransferConnection<BoxedDuplex>,
    recv_conn: BlockTransferConnection<BoxedDuplex>,
    rx: mpsc::UnboundedReceiver<QueuedBlock>,
    pool: &Arc<BlockPool>,
    handler: &Arc<dyn IncomingBlockHandler>,
    token: &ControlToken,
) -> mpsc::UnboundedReceiver<QueuedBlock> {
    let pair = Arc::new(ControlTokenSource::new());

    // Propagate parent cancellation into the pair token.
    let watcher = {
        let pair = pair.clone();
        let mut parent = token.clone();
        tokio::spawn(async move {
            parent.canceled().await;
            pair.cancel();
        })
    };

    let send_task = tokio::spawn(send_loop(send_conn, rx, pool.clone(), pair.clone()));
    let recv_task = tokio::spawn(recv_loop(recv_conn, handler.clone(), pair.clone()));

    let rx = send_task.await.expect("send loop must not panic");
    recv_task.await.expect("receive loop must not panic");
    watcher.abort();

    rx
}

async fn send_loop(
    mut conn: BlockTransferConnection<BoxedDuplex>,
    mut rx: mpsc::UnboundedReceiver<QueuedBlock>,
    pool: Arc<BlockPool>,
    pair: Arc<ControlTokenSource>,
) -> mpsc::UnboundedReceiver<QueuedBlock> {
    let mut pair_token = pair.token();

    loop {
        let entry = tokio::select! {
            entry = rx.recv() => entry,
            () = pair_token.canceled() => break,
        };

        let entry = match entry {
            Some(entry) => entry,
            None => break, // client handle dropped
        };

        let result = conn
            .send_block(entry.target_peer_id, &entry.block, BlockType::Normal)
            .await;
        pool.release(entry.block);

        // A server-level error ack (target gone, chunk missing) fails only
        // this entry; transport-level failures end the connection.
        let fatal = matches!(
            result,
            Err(Error::Connectivity(_) | Error::Protocol(_) | Error::Canceled)
        );
        if let Err(err) = &result {
            if !err.is_expected() {
                tracing::debug!(error = %err, "client send failed");
            }
        }
        (entry.on_ready)(result);

        if fatal {
            break;
        }
    }

    let _ = conn.shutdown().await;
    pair.cancel();
    rx
}

async fn recv_loop(
    mut conn: BlockTransferConnection<BoxedDuplex>,
    handler: Arc<dyn IncomingBlockHandler>,
    pair: Arc<ControlTokenSource>,
) {
    let mut pair_token = pair.token();

    loop {
        let received = tokio::select! {
            received = conn.receive_block() => received,
            () = pair_token.canceled() => break,
        };

        match received {
            Ok(Some((frame, block))) => {
                handler.handle_block(frame.peer_id, frame, block);
            }
            Ok(None) => break,
            Err(err) => {
                if !err.is_expected() {
                    tracing::debug!(error = %err, "client receive failed");
                }
                break;
            }
        }
    }

    let _ = conn.shutdown().await;
    pair.cancel();
}

// ── Forwarding backend ───────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ForwardingOptions {
    /// Requested client count, before the per-endpoint minimum applies.
    pub connections: usize,
    /// Wait for every client (not just one) before construction returns.
    pub wait_all_to_connect: bool,
    pub connect_wait_budget: Duration,
    pub poll_interval: Duration,
    pub retry: ClientRetryPolicy,
}

impl Default for ForwardingOptions {
    fn default() -> Self {
        Self {
            connections: 0,
            wait_all_to_connect: false,
            connect_wait_budget: Duration::from_secs(60),
            poll_interval: Duration::from_millis(100),
            retry: ClientRetryPolicy::default(),
        }
    }
}

/// Round-robin dispatcher over the client list, skipping disconnected
/// clients and wrapping at the end.
pub struct RotatingDispatch {
    clients: Vec<Arc<MessagingClient>>,
    cursor: AtomicUsize,
}

impl RotatingDispatch {
    pub fn new(clients: Vec<Arc<MessagingClient>>) -> Self {
        Self {
            clients,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn next_connected(&self) -> Option<Arc<MessagingClient>> {
        let count = self.clients.len();
        for _ in 0..count {
            let index = self.cursor.fetch_add(1, Ordering::Relaxed) % count;
            let client = &self.clients[index];
            if client.is_connected() {
                return Some(client.clone());
            }
        }
        None
    }

    pub fn clients(&self) -> &[Arc<MessagingClient>] {
        &self.clients
    }

    pub fn connected_count(&self) -> usize {
        self.clients.iter().filter(|c| c.is_connected()).count()
    }
}

/// The forwarding backend proper.
pub struct ForwardingBackend {
    dispatch: RotatingDispatch,
    control: ControlTokenSource,
    disposed: AtomicBool,
}

impl std::fmt::Debug for ForwardingBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForwardingBackend").finish_non_exhaustive()
    }
}

impl ForwardingBackend {
    /// Build the backend: expand the endpoint list, start every client in
    /// parallel, and wait (polling) until enough of them are connected.
    /// Fails with a connectivity error when no endpoint becomes reachable
    /// within the budget.
    pub async fn create(
        factory: MessagingClientFactory,
        endpoints: Vec<Endpoint>,
        options: ForwardingOptions,
    ) -> Result<Arc<Self>> {
        let factory = factory.with_retry_policy(options.retry.clone());
        let control = ControlTokenSource::new();

        let expanded = expand_endpoints(options.connections, &endpoints);
        let clients: Vec<_> = expanded
            .into_iter()
            .map(|endpoint| factory.start_client(endpoint, control.token()))
            .collect();

        let dispatch = RotatingDispatch::new(clients);

        let deadline = tokio::time::Instant::now() + options.connect_wait_budget;
        loop {
            let connected = dispatch.connected_count();
            let enough = if options.wait_all_to_connect {
                connected == dispatch.clients().len()
            } else {
                connected > 0
            };

            if enough {
                break;
            }

            if tokio::time::Instant::now() >= deadline {
                if connected > 0 {
                    tracing::warn!(
                        connected,
                        total = dispatch.clients().len(),
                        "proceeding without all clients connected"
                    );
                    break;
                }
                control.cancel();
                return Err(Error::Connectivity(
                    "the backend can't connect to any of the endpoints provided".into(),
                ));
            }

            tokio::time::sleep(options.poll_interval).await;
        }

        Ok(Arc::new(Self {
            dispatch,
            control,
            disposed: AtomicBool::new(false),
        }))
    }

    pub fn dispatch_block(&self, target_peer_id: PeerId, block: DataBlock) -> Task {
        match self.dispatch.next_connected() {
            Some(client) => client.dispatch_block(target_peer_id, block),
            None => Box::pin(async move {
                Err(Error::Connectivity(
                    "no connected outbound channel is available".into(),
                ))
            }),
        }
    }

    pub fn connected_count(&self) -> usize {
        self.dispatch.connected_count()
    }
}

impl BackendProcessing for ForwardingBackend {
    fn create_backend_processing_task(&self, request: BackendRequest) -> Option<Task> {
        if request.operation_id != OperationId::Put {
            return None;
        }
        let block = request.block?;
        Some(self.dispatch_block(request.target_peer_id, block))
    }

    fn is_connected(&self) -> bool {
        self.dispatch.connected_count() > 0
    }

    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.control.cancel();
    }
}
