//! Per-user request bytes throttling.
//!
//! Every user is assigned a token bucket refilled at the user's byte rate limit, with a burst of
//! one second worth of bytes. A request consumes its bytes from the bucket, going into debt if
//! needed, and is delayed until the debt is repaid. Buckets are local to this process, while
//! per-user overrides are replicated master state mirrored into the throttler.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use dashmap::DashMap;

use crate::config::{validate_throttle_limit, ChunkServiceConfig};
use crate::error::{AppError, AppResult};
use crate::models::ROOT_USER;

const METRIC_THROTTLER_VALUE: &str = "chunk_service_bytes_throttler_value";

/// The longest delay imposed on a single request.
pub const MAX_THROTTLE_DELAY: Duration = Duration::from_secs(60 * 60);

/// The effective throttling settings.
#[derive(Clone, Debug, Default)]
struct ThrottleSettings {
    enabled: bool,
    /// The limit of users without an override.
    default_limit: Option<f64>,
    overrides: HashMap<String, f64>,
}

#[derive(Clone, Debug)]
struct Bucket {
    limit: f64,
    /// Available bytes, negative while in debt.
    available: f64,
    refilled_at: Instant,
}

impl Bucket {
    fn new(limit: f64, now: Instant) -> Self {
        Self {
            limit,
            available: limit,
            refilled_at: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.refilled_at).as_secs_f64();
        self.available = (self.available + elapsed * self.limit).min(self.limit);
        self.refilled_at = now;
    }
}

/// A throttler of request bytes per user.
pub struct RequestThrottler {
    settings: ArcSwap<ThrottleSettings>,
    buckets: DashMap<String, Bucket>,
}

impl RequestThrottler {
    /// Create a new instance from the given config.
    pub fn new(config: &ChunkServiceConfig) -> Self {
        metrics::register_counter!(METRIC_THROTTLER_VALUE, metrics::Unit::Bytes, "bytes of requests admitted by the per-user bytes throttler");
        let throttler = Self {
            settings: ArcSwap::from_pointee(ThrottleSettings::default()),
            buckets: DashMap::new(),
        };
        throttler.reconfigure(config);
        throttler
    }

    /// Apply a new chunk service config.
    ///
    /// Disabling throttling takes effect immediately, including for requests already in debt.
    pub fn reconfigure(&self, config: &ChunkServiceConfig) {
        let current = self.settings.load();
        let enabled = config.enable_per_user_request_bytes_throttling;
        let default_limit = config.default_per_user_request_bytes_throttler.limit;
        if current.enabled == enabled && current.default_limit == default_limit {
            return;
        }
        tracing::info!(enabled, ?default_limit, "request throttler reconfigured");
        let mut next = ThrottleSettings::clone(&current);
        next.enabled = enabled;
        next.default_limit = default_limit;
        self.settings.store(Arc::new(next));
        self.buckets.clear();
    }

    /// Set or clear the limit override of a user.
    ///
    /// Once an override is cleared, the user falls back to the default limit.
    pub fn set_override(&self, user: &str, limit: Option<f64>) -> AppResult<()> {
        if user == ROOT_USER {
            return Err(AppError::InvalidInput(format!("user {} can not be throttled", ROOT_USER)));
        }
        if let Some(limit) = limit {
            validate_throttle_limit(limit)?;
        }
        let mut next = ThrottleSettings::clone(&self.settings.load());
        match limit {
            Some(limit) => next.overrides.insert(user.into(), limit),
            None => next.overrides.remove(user),
        };
        self.settings.store(Arc::new(next));
        self.buckets.remove(user);
        Ok(())
    }

    /// Replace all limit overrides, as restored from master state.
    pub fn sync_overrides(&self, overrides: &BTreeMap<String, f64>) {
        let mut next = ThrottleSettings::clone(&self.settings.load());
        next.overrides = overrides
            .iter()
            .filter(|(user, _)| user.as_str() != ROOT_USER)
            .map(|(user, limit)| (user.clone(), *limit))
            .collect();
        self.settings.store(Arc::new(next));
        self.buckets.clear();
    }

    /// The effective limit of the given user, if the user is throttled.
    pub fn limit_of(&self, user: &str) -> Option<f64> {
        let settings = self.settings.load();
        if !settings.enabled || user == ROOT_USER {
            return None;
        }
        settings.overrides.get(user).copied().or(settings.default_limit)
    }

    /// Admit a request of the given size, returning the delay to impose on it.
    pub fn acquire(&self, user: &str, bytes: u64, now: Instant) -> Duration {
        let limit = match self.limit_of(user) {
            Some(limit) => limit,
            None => return Duration::ZERO,
        };
        metrics::counter!(METRIC_THROTTLER_VALUE, bytes, "user" => user.to_string());
        let mut bucket = self.buckets.entry(user.into()).or_insert_with(|| Bucket::new(limit, now));
        if (bucket.limit - limit).abs() > f64::EPSILON {
            *bucket = Bucket::new(limit, now);
        }
        bucket.refill(now);
        bucket.available -= bytes as f64;
        if bucket.available >= 0.0 {
            return Duration::ZERO;
        }
        Duration::try_from_secs_f64(-bucket.available / limit)
            .map(|delay| delay.min(MAX_THROTTLE_DELAY))
            .unwrap_or(MAX_THROTTLE_DELAY)
    }

    /// Throttle a request of the given size, resolving once it may proceed.
    pub async fn throttle(&self, user: &str, bytes: u64) {
        let delay = self.acquire(user, bytes, Instant::now());
        if !delay.is_zero() {
            tracing::trace!(user, bytes, ?delay, "throttling request");
            tokio::time::sleep(delay).await;
        }
    }
}
