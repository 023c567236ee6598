//! The HTTPS listener: a TLS accept loop feeding axum connections.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::response::Response;
use axum::Router;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use hyper_util::service::TowerToHyperService;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

use conduit_core::wire::MAX_CHUNK_SIZE;

use crate::bridge::GatewayBridge;

/// Every request, whatever its path, goes through the bridge.
pub fn router(bridge: Arc<GatewayBridge>) -> Router {
    Router::new().fallback(proxy).with_state(bridge)
}

async fn proxy(State(bridge): State<Arc<GatewayBridge>>, request: Request) -> Response {
    let (parts, body) = request.into_parts();

    let bytes = match axum::body::to_bytes(body, MAX_CHUNK_SIZE as usize).await {
        Ok(bytes) => bytes,
        Err(err) => {
            tracing::debug!(error = %err, "failed to read the request body");
            return Response::builder()
                .status(StatusCode::PAYLOAD_TOO_LARGE)
                .body(Body::from("request body too large"))
                .expect("static response must build");
        }
    };

    bridge
        .handle(parts.method, parts.uri, &parts.headers, &bytes)
        .await
}

/// Bind the HTTPS listener and serve until the listener fails.
pub async fn serve(
    bridge: Arc<GatewayBridge>,
    port: u16,
    tls: Arc<rustls::ServerConfig>,
) -> Result<()> {
    let app = router(bridge);
    let acceptor = TlsAcceptor::from(tls);

    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("failed to bind the HTTPS listener on port {port}"))?;
    tracing::info!(port, "HTTPS gateway listening");

    loop {
        let (tcp, remote) = listener
            .accept()
            .await
            .context("the HTTPS listener failed")?;
        let _ = tcp.set_nodelay(true);

        let acceptor = acceptor.clone();
        let app = app.clone();

        tokio::spawn(async move {
            let stream = match acceptor.accept(tcp).await {
                Ok(stream) => stream,
                Err(err) => {
                    // Plain-HTTP probes and scanners fail here routinely.
                    tracing::trace!(%remote, error = %err, "TLS accept failed");
                    return;
                }
            };

            let service = TowerToHyperService::new(app);
            if let Err(err) = AutoBuilder::new(TokioExecutor::new())
                .serve_connection(TokioIo::new(stream), service)
                .await
            {
                tracing::trace!(%remote, error = %err, "connection ended with error");
            }
        });
    }
}
