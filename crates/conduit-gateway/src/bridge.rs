//! HTTP ⇄ messaging bridge.
//!
//! The request path: extract the authentication token from the configured
//! cookies, optionally gate through the authorization cache, wrap the
//! request in a JSON envelope, dispatch it as a Normal block to the target
//! peer, and wait for the correlated reply envelope. The envelope below is
//! the gateway's wire contract with the peer it forwards to.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::header::COOKIE;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::Response;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use uuid::Uuid;

use conduit_core::wire::MAX_CHUNK_SIZE;
use conduit_core::{BlockPool, DataBlock, Error, PeerId};
use conduit_messaging::authorization::AuthorizationCache;
use conduit_messaging::backend::{BackendProcessing, BackendRequest};
use conduit_messaging::forwarding::IncomingBlockHandler;

/// Upper bound on diagnostic text included in an error response body.
const SAFE_DIAGNOSTIC_LIMIT: usize = 256;

// ── Envelopes ────────────────────────────────────────────────────────────────

/// The request side of the gateway's envelope contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestEnvelope {
    pub conversation_id: Uuid,
    /// Peer id replies must be dispatched to.
    pub source_peer_id: PeerId,
    pub method: String,
    pub uri: String,
    pub headers: BTreeMap<String, String>,
    pub body: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_data: Option<String>,
}

/// The reply side, correlated by `conversation_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseEnvelope {
    pub conversation_id: Uuid,
    pub status: u16,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: String,
}

/// The error envelope returned for every failed request.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEnvelope {
    pub status: u16,
    pub message: String,
    pub correlation_id: Uuid,
}

// ── Correlation ──────────────────────────────────────────────────────────────

pub type PendingMap = DashMap<Uuid, oneshot::Sender<ResponseEnvelope>>;

/// The forwarding backend's incoming-block handler: parses reply envelopes
/// and completes the matching pending request.
pub struct ResponseSink {
    pending: Arc<PendingMap>,
    pool: Arc<BlockPool>,
}

impl ResponseSink {
    pub fn new(pending: Arc<PendingMap>, pool: Arc<BlockPool>) -> Arc<Self> {
        Arc::new(Self { pending, pool })
    }
}

impl IncomingBlockHandler for ResponseSink {
    fn handle_block(
        &self,
        source_peer_id: PeerId,
        _frame: conduit_core::wire::CommandFrame,
        block: DataBlock,
    ) {
        let bytes = &block.as_slice()[block.offset1()..];

        match serde_json::from_slice::<ResponseEnvelope>(bytes) {
            Ok(envelope) => match self.pending.remove(&envelope.conversation_id) {
                Some((_, tx)) => {
                    let _ = tx.send(envelope);
                }
                None => {
                    tracing::debug!(
                        peer = %source_peer_id,
                        conversation = %envelope.conversation_id,
                        "reply for an unknown or expired conversation"
                    );
                }
            },
            Err(err) => {
                tracing::warn!(peer = %source_peer_id, error = %err, "malformed reply envelope");
            }
        }

        self.pool.release(block);
    }
}

// ── Bridge ───────────────────────────────────────────────────────────────────

struct ExtractedToken {
    token_type: String,
    data: Vec<u8>,
}

enum BridgeFailure {
    Core(Error),
    /// The authorization upstream could not be reached at all.
    AuthUpstreamUnavailable(Error),
}

impl From<Error> for BridgeFailure {
    fn from(err: Error) -> Self {
        BridgeFailure::Core(err)
    }
}

pub struct GatewayBridge {
    source_peer_id: PeerId,
    target_peer_id: PeerId,
    backend: Arc<dyn BackendProcessing>,
    pool: Arc<BlockPool>,
    pending: Arc<PendingMap>,
    auth: Option<Arc<AuthorizationCache>>,
    token_cookie_names: Vec<String>,
    token_type_default: Option<String>,
    token_data_default: Option<String>,
    request_timeout: Option<Duration>,
    expected_security_id: Option<String>,
    no_auth_required: bool,
    log_unauthorized: bool,
}

#[allow(clippy::too_many_arguments)]
impl GatewayBridge {
    pub fn new(
        source_peer_id: PeerId,
        target_peer_id: PeerId,
        backend: Arc<dyn BackendProcessing>,
        pool: Arc<BlockPool>,
        pending: Arc<PendingMap>,
        auth: Option<Arc<AuthorizationCache>>,
        token_cookie_names: Vec<String>,
        token_type_default: Option<String>,
        token_data_default: Option<String>,
        request_timeout: Option<Duration>,
        expected_security_id: Option<String>,
        no_auth_required: bool,
        log_unauthorized: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            source_peer_id,
            target_peer_id,
            backend,
            pool,
            pending,
            auth,
            token_cookie_names,
            token_type_default,
            token_data_default,
            request_timeout,
            expected_security_id,
            no_auth_required,
            log_unauthorized,
        })
    }

    /// Serve one HTTP request end to end.
    pub async fn handle(
        &self,
        method: Method,
        uri: Uri,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Response {
        let conversation_id = Uuid::new_v4();

        match self
            .process(method, uri, headers, body, conversation_id)
            .await
        {
            Ok(response) => response,
            Err(failure) => self.error_response(failure, conversation_id),
        }
    }

    async fn process(
        &self,
        method: Method,
        uri: Uri,
        headers: &HeaderMap,
        body: &[u8],
        conversation_id: Uuid,
    ) -> Result<Response, BridgeFailure> {
        let token = self.extract_token(headers)?;

        if let (Some(token), Some(cache)) = (&token, &self.auth) {
            let principal = match cache.try_get_authorized_principal(&token.data) {
                Some(principal) => principal,
                None => match cache.update(&token.data).await {
                    Ok(principal) => principal,
                    Err(err @ Error::Authorization(_)) => return Err(err.into()),
                    Err(err) => return Err(BridgeFailure::AuthUpstreamUnavailable(err)),
                },
            };

            if let Some(expected) = &self.expected_security_id {
                if principal.sid != *expected {
                    return Err(Error::Authorization(format!(
                        "principal {} does not match the expected security id",
                        principal.sid
                    ))
                    .into());
                }
            }
        }

        let envelope = RequestEnvelope {
            conversation_id,
            source_peer_id: self.source_peer_id,
            method: method.to_string(),
            uri: uri.to_string(),
            headers: forwarded_headers(headers),
            body: String::from_utf8_lossy(body).into_owned(),
            token_type: token.as_ref().map(|t| t.token_type.clone()),
            token_data: token
                .as_ref()
                .map(|t| String::from_utf8_lossy(&t.data).into_owned()),
        };

        let bytes = serde_json::to_vec(&envelope)
            .map_err(|e| Error::server("failed to serialize the request envelope", e))?;
        if bytes.len() > MAX_CHUNK_SIZE as usize {
            return Err(Error::Protocol(format!(
                "request envelope of {} bytes exceeds the chunk size limit",
                bytes.len()
            ))
            .into());
        }

        let mut block = self.pool.acquire_for(bytes.len());
        block.copy_from_slice(&bytes);

        let (tx, rx) = oneshot::channel();
        self.pending.insert(conversation_id, tx);

        let request = BackendRequest::put(
            conversation_id,
            self.source_peer_id,
            self.target_peer_id,
            block,
        );

        let dispatch = self
            .backend
            .create_backend_processing_task(request)
            .ok_or_else(|| Error::server_msg("the forwarding backend refused the block"))?;

        if let Err(err) = dispatch.await {
            self.pending.remove(&conversation_id);
            return Err(err.into());
        }

        let reply = match self.request_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, rx).await {
                Ok(received) => received,
                Err(_) => {
                    self.pending.remove(&conversation_id);
                    return Err(Error::timeout().into());
                }
            },
            None => rx.await,
        }
        .map_err(|_| Error::Connectivity("the reply channel was dropped".into()))?;

        Ok(reply_to_response(reply))
    }

    fn extract_token(&self, headers: &HeaderMap) -> Result<Option<ExtractedToken>, Error> {
        for name in &self.token_cookie_names {
            if let Some(value) = find_cookie(headers, name) {
                return Ok(Some(ExtractedToken {
                    token_type: name.clone(),
                    data: value.into_bytes(),
                }));
            }
        }

        if let (Some(token_type), Some(data)) =
            (&self.token_type_default, &self.token_data_default)
        {
            return Ok(Some(ExtractedToken {
                token_type: token_type.clone(),
                data: data.clone().into_bytes(),
            }));
        }

        if self.no_auth_required {
            return Ok(None);
        }

        Err(Error::Authorization(
            "no authentication token was found in the request".into(),
        ))
    }

    fn error_response(&self, failure: BridgeFailure, correlation_id: Uuid) -> Response {
        let (status, err) = match &failure {
            BridgeFailure::AuthUpstreamUnavailable(err) => (StatusCode::BAD_GATEWAY, err),
            BridgeFailure::Core(err) => {
                let status = match err {
                    Error::Authorization(_) => StatusCode::UNAUTHORIZED,
                    Error::TargetPeerNotFound(_) => StatusCode::SERVICE_UNAVAILABLE,
                    Error::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
                    _ => StatusCode::BAD_REQUEST,
                };
                (status, err)
            }
        };

        if status == StatusCode::UNAUTHORIZED && self.log_unauthorized {
            tracing::info!(%correlation_id, error = %err, "request not authorized");
        } else {
            tracing::debug!(%correlation_id, status = status.as_u16(), error = %err, "request failed");
        }

        let mut message = err.to_string();
        message.truncate(SAFE_DIAGNOSTIC_LIMIT);

        let envelope = ErrorEnvelope {
            status: status.as_u16(),
            message,
            correlation_id,
        };
        let body = serde_json::to_string(&envelope)
            .unwrap_or_else(|_| format!("{{\"status\":{}}}", status.as_u16()));

        Response::builder()
            .status(status)
            .header("content-type", "application/json")
            .body(Body::from(body))
            .expect("static response must build")
    }
}

fn reply_to_response(reply: ResponseEnvelope) -> Response {
    let status = StatusCode::from_u16(reply.status).unwrap_or(StatusCode::BAD_GATEWAY);

    let mut builder = Response::builder().status(status);
    for (name, value) in &reply.headers {
        builder = builder.header(name, value);
    }

    builder
        .body(Body::from(reply.body))
        .unwrap_or_else(|_| {
            Response::builder()
                .status(StatusCode::BAD_GATEWAY)
                .body(Body::from("malformed reply headers"))
                .expect("static response must build")
        })
}

/// Headers forwarded inside the envelope. Cookies and hop-by-hop headers
/// stay on the HTTP leg.
fn forwarded_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    headers
        .iter()
        .filter(|(name, _)| {
            !matches!(
                name.as_str(),
                "cookie" | "connection" | "keep-alive" | "transfer-encoding" | "upgrade"
            )
        })
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

fn find_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| key.trim() == name)
        .map(|(_, value)| value.trim().to_string())
}
