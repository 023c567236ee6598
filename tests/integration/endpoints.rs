//! Endpoint iterator boundary behavior: retry budget, reset, and the
//! retry-clock wait rule.

use std::time::{Duration, Instant};

use conduit_core::endpoint::{Endpoint, EndpointSelector};

#[test]
fn budget_exhausts_and_reset_restores_it() {
    let mut it = EndpointSelector::single(Endpoint::new("broker", 28100))
        .with_retry_policy(5, Duration::from_millis(10))
        .iterator();

    let mut retries = 0;
    while it.select_next() {
        retries += 1;
    }
    // select_next returned false on the attempt that exhausted the budget.
    assert_eq!(retries + 1, 5);
    assert!(!it.can_retry());

    it.reset_retry();
    assert!(it.can_retry());
}

#[test]
fn wait_rule_guarantees_the_threshold_is_crossed() {
    let retry_timeout = Duration::from_millis(120);
    let mut it = EndpointSelector::single(Endpoint::new("broker", 28100))
        .with_retry_policy(5, retry_timeout)
        .iterator();

    // First call starts the clock.
    let (allowed, _) = it.can_retry_now();
    assert!(allowed);
    let started = Instant::now();

    // Denied while inside the gap; the reported wait carries the 200 ms
    // slack, so sleeping on it must land past the threshold.
    let (allowed, wait) = it.can_retry_now();
    assert!(!allowed);
    assert!(wait > retry_timeout - started.elapsed());

    std::thread::sleep(wait);
    assert!(started.elapsed() >= retry_timeout);
    let (allowed, _) = it.can_retry_now();
    assert!(allowed);
}

#[test]
fn multi_endpoint_budgets_are_independent() {
    let mut it = EndpointSelector::new(vec![
        Endpoint::new("a", 28100),
        Endpoint::new("b", 28100),
        Endpoint::new("c", 28100),
    ])
    .with_retry_policy(2, Duration::from_millis(10))
    .iterator();

    assert_eq!(it.count(), 3);
    assert_eq!(it.host(), "a");

    // One full rotation charges one retry per endpoint; every endpoint
    // still has budget left.
    for expected in ["b", "c", "a"] {
        assert!(it.select_next());
        assert_eq!(it.host(), expected);
    }

    // A second rotation exhausts each in turn.
    assert!(!it.select_next());
    assert_eq!(it.host(), "b");
}
