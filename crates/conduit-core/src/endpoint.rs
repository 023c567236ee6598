//! Endpoint selection with a per-endpoint retry budget.
//!
//! A selector owns an ordered endpoint list and hands out circular
//! iterators. Each iterator carries its own retry counters and retry
//! clock, so concurrent connection attempts do not share state.

use std::time::{Duration, Instant};

pub const DEFAULT_MAX_RETRY_COUNT: usize = 5;
pub const DEFAULT_RETRY_TIMEOUT: Duration = Duration::from_secs(2);

/// Extra slack added to reported waits so that sleeping on the returned
/// duration is guaranteed to cross the retry threshold.
const RETRY_WAIT_SLACK: Duration = Duration::from_millis(200);

/// A `(host, port)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse `host[:port]`, falling back to `default_port` when the port is
    /// absent.
    pub fn parse(text: &str, default_port: u16) -> Option<Self> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }

        match text.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() => {
                let port = port.parse().ok()?;
                Some(Self::new(host, port))
            }
            _ => Some(Self::new(text, default_port)),
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// An endpoint selector: a fixed list plus the retry policy its iterators
/// inherit. The single-endpoint form is `EndpointSelector::single`.
#[derive(Debug, Clone)]
pub struct EndpointSelector {
    entries: Vec<Endpoint>,
    max_retry_count: usize,
    retry_timeout: Duration,
}

impl EndpointSelector {
    /// Selector bound to a single fixed endpoint.
    pub fn single(endpoint: Endpoint) -> Self {
        Self::new(vec![endpoint])
    }

    /// Round-robin selector over an ordered endpoint list.
    ///
    /// Panics when the list is empty — an empty selector is a configuration
    /// bug, not a runtime condition.
    pub fn new(entries: Vec<Endpoint>) -> Self {
        assert!(!entries.is_empty(), "endpoint selector is empty");
        Self {
            entries,
            max_retry_count: DEFAULT_MAX_RETRY_COUNT,
            retry_timeout: DEFAULT_RETRY_TIMEOUT,
        }
    }

    pub fn with_retry_policy(mut self, max_retry_count: usize, retry_timeout: Duration) -> Self {
        self.max_retry_count = max_retry_count;
        self.retry_timeout = retry_timeout;
        self
    }

    pub fn count(&self) -> usize {
        self.entries.len()
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.entries
    }

    /// A fresh circular iterator with its own retry budget.
    pub fn iterator(&self) -> EndpointIterator {
        EndpointIterator {
            entries: self.entries.clone(),
            index: 0,
            retry_counts: vec![0; self.entries.len()],
            last_retry: None,
            max_retry_count: self.max_retry_count,
            retry_timeout: self.retry_timeout,
        }
    }
}

/// Circular iterator over a selector's endpoints with per-endpoint retry
/// counters and a shared retry clock.
#[derive(Debug)]
pub struct EndpointIterator {
    entries: Vec<Endpoint>,
    index: usize,
    retry_counts: Vec<usize>,
    last_retry: Option<Instant>,
    max_retry_count: usize,
    retry_timeout: Duration,
}

impl EndpointIterator {
    /// Advance to the next endpoint (wrapping), charging one retry against
    /// it. Returns whether that endpoint can still be retried.
    pub fn select_next(&mut self) -> bool {
        self.index = (self.index + 1) % self.entries.len();
        self.retry_counts[self.index] += 1;
        self.last_retry = Some(Instant::now());
        self.can_retry()
    }

    /// Has the current endpoint's retry budget been exhausted?
    pub fn can_retry(&self) -> bool {
        self.retry_counts[self.index] < self.max_retry_count
    }

    /// Gate on both the retry budget and the retry clock. When the answer
    /// is no, the returned wait is long enough that sleeping on it will
    /// cross the threshold (the slack is deliberate).
    pub fn can_retry_now(&mut self) -> (bool, Duration) {
        if !self.can_retry() {
            return (false, Duration::ZERO);
        }

        let now = Instant::now();

        let last = match self.last_retry {
            None => {
                self.last_retry = Some(now);
                return (true, Duration::ZERO);
            }
            Some(last) => last,
        };

        let next_attempt = last + self.retry_timeout;

        if now >= next_attempt {
            self.last_retry = Some(now);
            return (true, Duration::ZERO);
        }

        (false, next_attempt - now + RETRY_WAIT_SLACK)
    }

    pub fn reset_retry(&mut self) {
        for count in &mut self.retry_counts {
            *count = 0;
        }
        self.last_retry = None;
    }

    pub fn host(&self) -> &str {
        &self.entries[self.index].host
    }

    pub fn port(&self) -> u16 {
        self.entries[self.index].port
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.entries[self.index]
    }

    pub fn count(&self) -> usize {
        self.entries.len()
    }
}
