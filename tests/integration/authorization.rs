//! Authorization cache behavior through the gateway bridge: miss → upstream
//! call, hit within freshness → no call, lapse → upstream call again.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use conduit_core::block::BlockPool;
use conduit_core::{Error, PeerId};
use conduit_gateway::bridge::{
    GatewayBridge, PendingMap, RequestEnvelope, ResponseEnvelope,
};
use conduit_messaging::authorization::{
    AuthorizationCache, AuthorizationService, SecurityPrincipal,
};
use conduit_messaging::backend::{BackendProcessing, BackendRequest, Task};

/// Upstream stub that counts calls and accepts any token.
struct CountingService {
    calls: AtomicUsize,
}

impl AuthorizationService for CountingService {
    fn token_type(&self) -> &str {
        "test-sso"
    }

    fn authorize(
        &self,
        token: Vec<u8>,
    ) -> Pin<Box<dyn Future<Output = conduit_core::Result<SecurityPrincipal>> + Send + 'static>>
    {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move {
            Ok(SecurityPrincipal::new(
                "alice",
                "Alice",
                "Example",
                "alice@example.com",
                "user",
                token,
            ))
        })
    }
}

/// Backend stub that immediately answers every envelope with 200/"ok".
struct EchoPeer {
    pending: Arc<PendingMap>,
}

impl BackendProcessing for EchoPeer {
    fn create_backend_processing_task(&self, request: BackendRequest) -> Option<Task> {
        let block = request.block?;
        let envelope: RequestEnvelope =
            serde_json::from_slice(block.as_slice()).expect("valid envelope");

        let pending = self.pending.clone();
        Some(Box::pin(async move {
            if let Some((_, tx)) = pending.remove(&envelope.conversation_id) {
                let _ = tx.send(ResponseEnvelope {
                    conversation_id: envelope.conversation_id,
                    status: 200,
                    headers: BTreeMap::new(),
                    body: "ok".into(),
                });
            }
            Ok(None)
        }))
    }

    fn dispose(&self) {}
}

use axum::http::header::COOKIE;
use axum::http::{HeaderMap, Method};

fn request_headers(token: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(COOKIE, format!("auth={token}").parse().unwrap());
    headers
}

#[tokio::test]
async fn cache_miss_hit_and_lapse() {
    let service = Arc::new(CountingService {
        calls: AtomicUsize::new(0),
    });
    let cache = AuthorizationCache::new(service.clone());
    cache.configure_freshness_interval(Some(Duration::from_millis(300)));

    let pending: Arc<PendingMap> = Arc::new(PendingMap::new());
    let bridge = GatewayBridge::new(
        PeerId::generate(),
        PeerId::generate(),
        Arc::new(EchoPeer {
            pending: pending.clone(),
        }),
        BlockPool::new(4096),
        pending,
        Some(cache),
        vec!["auth".to_string()],
        None,
        None,
        Some(Duration::from_secs(2)),
        None,
        false,
        false,
    );

    // t = 0: new token — the upstream must be consulted.
    let response = bridge
        .handle(
            Method::GET,
            "/a".parse().unwrap(),
            &request_headers("token-T"),
            b"",
        )
        .await;
    assert_eq!(response.status(), 200);
    assert_eq!(service.calls.load(Ordering::SeqCst), 1);

    // Within freshness: served from the cache, no upstream call.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let response = bridge
        .handle(
            Method::GET,
            "/b".parse().unwrap(),
            &request_headers("token-T"),
            b"",
        )
        .await;
    assert_eq!(response.status(), 200);
    assert_eq!(service.calls.load(Ordering::SeqCst), 1);

    // After the freshness window: consulted again.
    tokio::time::sleep(Duration::from_millis(350)).await;
    let response = bridge
        .handle(
            Method::GET,
            "/c".parse().unwrap(),
            &request_headers("token-T"),
            b"",
        )
        .await;
    assert_eq!(response.status(), 200);
    assert_eq!(service.calls.load(Ordering::SeqCst), 2);
}

/// An upstream that refuses yields 401; one that cannot be reached at all
/// yields 502.
#[tokio::test]
async fn upstream_refusal_and_unreachability_map_differently() {
    struct Refusing;
    impl AuthorizationService for Refusing {
        fn token_type(&self) -> &str {
            "test-sso"
        }
        fn authorize(
            &self,
            _token: Vec<u8>,
        ) -> Pin<Box<dyn Future<Output = conduit_core::Result<SecurityPrincipal>> + Send + 'static>>
        {
            Box::pin(async { Err(Error::Authorization("bad token".into())) })
        }
    }

    struct Unreachable;
    impl AuthorizationService for Unreachable {
        fn token_type(&self) -> &str {
            "test-sso"
        }
        fn authorize(
            &self,
            _token: Vec<u8>,
        ) -> Pin<Box<dyn Future<Output = conduit_core::Result<SecurityPrincipal>> + Send + 'static>>
        {
            Box::pin(async { Err(Error::Connectivity("connection refused".into())) })
        }
    }

    for (service, expected_status) in [
        (Arc::new(Refusing) as Arc<dyn AuthorizationService>, 401),
        (Arc::new(Unreachable), 502),
    ] {
        let pending: Arc<PendingMap> = Arc::new(PendingMap::new());
        let bridge = GatewayBridge::new(
            PeerId::generate(),
            PeerId::generate(),
            Arc::new(EchoPeer {
                pending: pending.clone(),
            }),
            BlockPool::new(4096),
            pending,
            Some(AuthorizationCache::new(service)),
            vec!["auth".to_string()],
            None,
            None,
            Some(Duration::from_secs(2)),
            None,
            false,
            false,
        );

        let response = bridge
            .handle(
                Method::GET,
                "/x".parse().unwrap(),
                &request_headers("whatever"),
                b"",
            )
            .await;
        assert_eq!(response.status(), expected_status);
    }
}

/// The expected-security-id gate refuses a mismatched principal.
#[tokio::test]
async fn expected_security_id_mismatch_is_unauthorized() {
    let service = Arc::new(CountingService {
        calls: AtomicUsize::new(0),
    });

    let pending: Arc<PendingMap> = Arc::new(PendingMap::new());
    let bridge = GatewayBridge::new(
        PeerId::generate(),
        PeerId::generate(),
        Arc::new(EchoPeer {
            pending: pending.clone(),
        }),
        BlockPool::new(4096),
        pending,
        Some(AuthorizationCache::new(service)),
        vec!["auth".to_string()],
        None,
        None,
        Some(Duration::from_secs(2)),
        Some("bob".to_string()), // the stub always authorizes "alice"
        false,
        false,
    );

    let response = bridge
        .handle(
            Method::GET,
            "/x".parse().unwrap(),
            &request_headers("token"),
            b"",
        )
        .await;
    assert_eq!(response.status(), 401);
}
