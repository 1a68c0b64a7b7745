use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use anyhow::Result;

use crate::config::{ChunkServiceConfig, ThrottlerConfig};
use crate::error::AppError;
use crate::models::ROOT_USER;
use crate::throttler::{RequestThrottler, MAX_THROTTLE_DELAY};

const REQUEST_BYTES: u64 = 1_000;
const REQUEST_WORK: Duration = Duration::from_millis(100);
const REQUEST_COUNT: u32 = 10;

fn config(enabled: bool, limit: Option<f64>) -> ChunkServiceConfig {
    ChunkServiceConfig {
        enable_per_user_request_bytes_throttling: enabled,
        default_per_user_request_bytes_throttler: ThrottlerConfig { limit },
    }
}

/// Simulate a user issuing sequential requests, returning the total elapsed time.
fn simulate(throttler: &RequestThrottler, user: &str, start: Instant) -> Duration {
    let mut now = start;
    for _ in 0..REQUEST_COUNT {
        now += throttler.acquire(user, REQUEST_BYTES, now);
        now += REQUEST_WORK;
    }
    now - start
}

#[test]
fn throttled_user_is_slowed_down_while_others_are_not() -> Result<()> {
    let throttler = RequestThrottler::new(&config(true, None));
    throttler.set_override("tenant", Some(2_000.0))?;
    let start = Instant::now();
    let baseline = REQUEST_WORK * REQUEST_COUNT;

    let throttled = simulate(&throttler, "tenant", start);
    assert!(
        throttled.as_secs_f64() >= baseline.as_secs_f64() * 2.5,
        "expected throttled user to be at least 2.5x slower, took {:?}",
        throttled
    );
    assert_eq!(simulate(&throttler, "other", start), baseline, "expected user without a limit to be unaffected");
    assert_eq!(simulate(&throttler, ROOT_USER, start), baseline, "expected root to never be throttled");
    Ok(())
}

#[test]
fn removing_override_falls_back_to_default() -> Result<()> {
    let throttler = RequestThrottler::new(&config(true, Some(1_000_000.0)));
    throttler.set_override("tenant", Some(2_000.0))?;
    assert_eq!(throttler.limit_of("tenant"), Some(2_000.0));
    let start = Instant::now();
    let baseline = REQUEST_WORK * REQUEST_COUNT;
    assert!(simulate(&throttler, "tenant", start) > baseline);

    throttler.set_override("tenant", None)?;
    assert_eq!(throttler.limit_of("tenant"), Some(1_000_000.0), "expected default limit after override removal");
    let later = start + Duration::from_secs(60);
    assert_eq!(simulate(&throttler, "tenant", later), baseline, "expected default limit to admit requests freely");
    Ok(())
}

#[test]
fn disabling_throttling_is_immediate() -> Result<()> {
    let throttler = RequestThrottler::new(&config(true, Some(100.0)));
    let now = Instant::now();
    let delay = throttler.acquire("tenant", 10_000, now);
    assert!(delay > Duration::from_secs(1), "expected oversized request to be delayed");

    throttler.reconfigure(&config(false, Some(100.0)));
    assert_eq!(throttler.acquire("tenant", 10_000, now), Duration::ZERO, "expected no delay once disabled");
    assert_eq!(throttler.limit_of("tenant"), None);
    Ok(())
}

#[test]
fn invalid_overrides_are_rejected() {
    let throttler = RequestThrottler::new(&config(true, None));
    let res = throttler.set_override(ROOT_USER, Some(10.0));
    assert!(matches!(res, Err(AppError::InvalidInput(_))), "expected root override to be rejected");
    for limit in [0.0, -1.0, f64::NAN, f64::INFINITY] {
        let res = throttler.set_override("tenant", Some(limit));
        assert!(matches!(res, Err(AppError::InvalidInput(_))), "expected limit {} to be rejected", limit);
    }
    assert_eq!(throttler.limit_of("tenant"), None);
}

#[test]
fn synced_overrides_skip_root() {
    let throttler = RequestThrottler::new(&config(true, None));
    let mut overrides = BTreeMap::new();
    overrides.insert("tenant".to_string(), 500.0);
    overrides.insert(ROOT_USER.to_string(), 500.0);
    throttler.sync_overrides(&overrides);
    assert_eq!(throttler.limit_of("tenant"), Some(500.0));
    assert_eq!(throttler.limit_of(ROOT_USER), None, "expected root to stay unthrottled");
}

#[test]
fn oversized_requests_are_delayed_by_a_bounded_amount() {
    let throttler = RequestThrottler::new(&config(true, Some(0.5)));
    let now = Instant::now();
    let delay = throttler.acquire("alice", u64::MAX, now);
    assert_eq!(delay, MAX_THROTTLE_DELAY, "expected the delay of a huge request to be capped");
    let delay = throttler.acquire("alice", REQUEST_BYTES, now);
    assert_eq!(delay, MAX_THROTTLE_DELAY, "expected an exhausted bucket to stay capped");
}

#[tokio::test]
async fn throttle_resolves_immediately_when_unthrottled() {
    let throttler = RequestThrottler::new(&config(false, Some(1.0)));
    let start = Instant::now();
    throttler.throttle("tenant", 1 << 30).await;
    assert!(start.elapsed() < Duration::from_secs(1), "expected no delay while throttling is disabled");
}
