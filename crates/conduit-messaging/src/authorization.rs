//! Token → principal authorization cache backed by an upstream
//! authorization service.
//!
//! Lookups are gated by a freshness interval (default 15 minutes) checked
//! lazily at read time. The cached principal carries a potentially
//! refreshed token which is preferred over the caller's original for
//! subsequent upstream calls, so token rotation upstream does not invalidate
//! the cache key the caller knows.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use conduit_core::{Error, Result};

pub const FRESHNESS_INTERVAL_DEFAULT: Duration = Duration::from_secs(15 * 60);

/// An authorized identity as reported by the authorization service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityPrincipal {
    pub sid: String,
    pub given_name: String,
    pub family_name: String,
    pub email: String,
    pub type_id: String,
    authentication_token: Vec<u8>,
}

impl SecurityPrincipal {
    pub fn new(
        sid: impl Into<String>,
        given_name: impl Into<String>,
        family_name: impl Into<String>,
        email: impl Into<String>,
        type_id: impl Into<String>,
        authentication_token: Vec<u8>,
    ) -> Self {
        Self {
            sid: sid.into(),
            given_name: given_name.into(),
            family_name: family_name.into(),
            email: email.into(),
            type_id: type_id.into(),
            authentication_token,
        }
    }

    /// The (possibly refreshed) token to use for subsequent upstream calls.
    pub fn authentication_token(&self) -> &[u8] {
        &self.authentication_token
    }
}

/// The upstream authorization service contract.
pub trait AuthorizationService: Send + Sync {
    /// The token type this service understands (e.g. a cookie name).
    fn token_type(&self) -> &str;

    /// Authorize a raw token; resolves with the principal or refuses.
    fn authorize(
        &self,
        token: Vec<u8>,
    ) -> Pin<Box<dyn Future<Output = Result<SecurityPrincipal>> + Send + 'static>>;
}

struct AuthorizationEntry {
    principal: Arc<SecurityPrincipal>,
    timestamp: SystemTime,
}

struct CacheState {
    freshness_interval: Duration,
    entries: HashMap<[u8; 32], AuthorizationEntry>,
}

pub struct AuthorizationCache {
    service: Arc<dyn AuthorizationService>,
    state: Mutex<CacheState>,
}

impl AuthorizationCache {
    pub fn new(service: Arc<dyn AuthorizationService>) -> Arc<Self> {
        Arc::new(Self {
            service,
            state: Mutex::new(CacheState {
                freshness_interval: FRESHNESS_INTERVAL_DEFAULT,
                entries: HashMap::new(),
            }),
        })
    }

    pub fn token_type(&self) -> String {
        self.service.token_type().to_string()
    }

    /// `None` restores the default interval.
    pub fn configure_freshness_interval(&self, interval: Option<Duration>) {
        self.state.lock().expect("authorization cache lock").freshness_interval =
            interval.unwrap_or(FRESHNESS_INTERVAL_DEFAULT);
    }

    fn key(token: &[u8]) -> [u8; 32] {
        *blake3::hash(token).as_bytes()
    }

    /// The cached principal, or `None` when the token was never authorized
    /// or its entry has outlived the freshness interval.
    pub fn try_get_authorized_principal(&self, token: &[u8]) -> Option<Arc<SecurityPrincipal>> {
        let state = self.state.lock().expect("authorization cache lock");
        let entry = state.entries.get(&Self::key(token))?;

        let now = SystemTime::now();
        let age = now
            .duration_since(entry.timestamp)
            .expect("invalid timestamp in the authorization cache");

        if age > state.freshness_interval {
            return None;
        }

        Some(entry.principal.clone())
    }

    /// The token to hand upstream: the refreshed token from a prior
    /// authorization when one exists, the caller's otherwise.
    fn latest_token(&self, token: &[u8]) -> Vec<u8> {
        let state = self.state.lock().expect("authorization cache lock");
        match state.entries.get(&Self::key(token)) {
            Some(entry) => entry.principal.authentication_token().to_vec(),
            None => token.to_vec(),
        }
    }

    async fn update_internal(
        &self,
        token: &[u8],
        executed: Option<Result<SecurityPrincipal>>,
        try_only: bool,
    ) -> Result<Option<Arc<SecurityPrincipal>>> {
        let outcome = match executed {
            Some(outcome) => outcome,
            None => self.service.authorize(self.latest_token(token)).await,
        };

        let principal = match outcome {
            Ok(principal) => Arc::new(principal),
            Err(_) if try_only => return Ok(None),
            // Transport-level failures stay distinguishable from refusals:
            // callers route "upstream unreachable" differently from "upstream
            // said no".
            Err(err @ (Error::Connectivity(_) | Error::Timeout { .. })) => {
                return Err(Error::server(
                    "the authorization service could not be reached",
                    err,
                ));
            }
            Err(err) => {
                return Err(Error::Authorization(format!(
                    "authorization request to the authorization service has failed: {err}"
                )));
            }
        };

        let mut state = self.state.lock().expect("authorization cache lock");
        state.entries.insert(
            Self::key(token),
            AuthorizationEntry {
                principal: principal.clone(),
                timestamp: SystemTime::now(),
            },
        );

        Ok(Some(principal))
    }

    /// Authorize (or re-authorize) a token and cache the result. Upstream
    /// refusal surfaces as an authorization failure.
    pub async fn update(&self, token: &[u8]) -> Result<Arc<SecurityPrincipal>> {
        Ok(self
            .update_internal(token, None, false)
            .await?
            .expect("non-try update always yields a principal"))
    }

    /// Like `update`, but consuming an already-executed authorization
    /// outcome instead of calling upstream.
    pub async fn update_with(
        &self,
        token: &[u8],
        executed: Result<SecurityPrincipal>,
    ) -> Result<Arc<SecurityPrincipal>> {
        Ok(self
            .update_internal(token, Some(executed), false)
            .await?
            .expect("non-try update always yields a principal"))
    }

    /// `None` on upstream failure instead of an error.
    pub async fn try_update(&self, token: &[u8]) -> Option<Arc<SecurityPrincipal>> {
        self.update_internal(token, None, true)
            .await
            .expect("try update never fails")
    }

    pub fn evict(&self, token: &[u8]) {
        self.state
            .lock()
            .expect("authorization cache lock")
            .entries
            .remove(&Self::key(token));
    }
}
