//! Download quotas and device lockout over windowed counters.
//!
//! Two independent counter families live in the key-value store:
//! - downloads per user (and per material) per window
//! - validation failures per device per window
//!
//! Both windows open on the first increment and close when the key expires.
//! Counter failures degrade open: a broken key-value store must not lock
//! every user out, so errors are logged and the request proceeds.

use crate::cache::format::{
    device_block_key, material_download_key, user_download_key, validation_failure_key,
};
use crate::cache::kv::{Counter, KeyValueStore};
use crate::clock::{to_chrono, Clock};
use crate::config::RateLimitPolicy;
use crate::OfflineError;
use chrono::{DateTime, Utc};
use http::header::{HeaderMap, HeaderName, HeaderValue, RETRY_AFTER};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// `X-RateLimit-Limit` header name.
pub static X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");

/// `X-RateLimit-Remaining` header name.
pub static X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");

/// `X-RateLimit-Reset` header name.
pub static X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Quota state for one counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitStatus {
    /// Whether another request fits in the window.
    pub allowed: bool,
    /// Configured limit.
    pub limit: u64,
    /// Requests left in the window.
    pub remaining: u64,
    /// When the window resets.
    pub reset_at: DateTime<Utc>,
}

impl RateLimitStatus {
    fn from_counter(limit: u64, counter: Option<Counter>, fresh_reset: DateTime<Utc>) -> Self {
        match counter {
            Some(c) => Self {
                allowed: c.value < limit,
                limit,
                remaining: limit.saturating_sub(c.value),
                reset_at: c.expires_at,
            },
            None => Self {
                allowed: limit > 0,
                limit,
                remaining: limit,
                reset_at: fresh_reset,
            },
        }
    }

    /// Seconds until the window resets, at least one.
    pub fn retry_after_seconds(&self, now: DateTime<Utc>) -> u64 {
        (self.reset_at - now).num_seconds().max(1) as u64
    }

    /// The `RateLimited` error for this status.
    pub fn to_error(&self, now: DateTime<Utc>) -> OfflineError {
        OfflineError::RateLimited {
            limit: self.limit,
            retry_after_seconds: self.retry_after_seconds(now),
            reset_at: self.reset_at,
        }
    }

    /// Rate-limit response headers; `Retry-After` only when throttled.
    pub fn headers(&self, now: DateTime<Utc>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(X_RATELIMIT_LIMIT.clone(), HeaderValue::from(self.limit));
        headers.insert(X_RATELIMIT_REMAINING.clone(), HeaderValue::from(self.remaining));
        headers.insert(
            X_RATELIMIT_RESET.clone(),
            HeaderValue::from(self.reset_at.timestamp()),
        );
        if !self.allowed {
            headers.insert(RETRY_AFTER, HeaderValue::from(self.retry_after_seconds(now)));
        }
        headers
    }
}

/// Rate limiter and abuse guard.
pub struct RateLimiter {
    kv: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    policy: RateLimitPolicy,
}

impl RateLimiter {
    /// Create a limiter over `kv`.
    pub fn new(kv: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>, policy: RateLimitPolicy) -> Self {
        Self { kv, clock, policy }
    }

    fn fresh_reset(&self) -> DateTime<Utc> {
        self.clock.now_utc() + to_chrono(self.policy.window)
    }

    async fn read(&self, key: &str) -> Option<Counter> {
        match self.kv.counter(key).await {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(key, error = %e, "counter read failed, allowing");
                None
            }
        }
    }

    async fn bump(&self, key: &str) -> Option<Counter> {
        match self.kv.incr_with_expiry(key, self.policy.window).await {
            Ok(c) => Some(c),
            Err(e) => {
                tracing::warn!(key, error = %e, "counter increment failed, allowing");
                None
            }
        }
    }

    /// Current download quota of a user, without consuming it.
    pub async fn check_download_limit(&self, user_id: Uuid) -> RateLimitStatus {
        let counter = self.read(&user_download_key(user_id)).await;
        RateLimitStatus::from_counter(self.policy.downloads_per_user, counter, self.fresh_reset())
    }

    /// Current download quota of a material, without consuming it.
    pub async fn check_material_limit(&self, material_id: Uuid) -> RateLimitStatus {
        let counter = self.read(&material_download_key(material_id)).await;
        RateLimitStatus::from_counter(
            self.policy.downloads_per_material,
            counter,
            self.fresh_reset(),
        )
    }

    /// Consume one download from the user's and the material's quota.
    ///
    /// Increment-then-compare, so concurrent downloads cannot both take the
    /// last slot. When the material quota refuses, the user's slot is given
    /// back.
    ///
    /// # Errors
    /// `RateLimited` when either quota is exhausted.
    pub async fn acquire_download(
        &self,
        user_id: Uuid,
        material_id: Uuid,
    ) -> Result<RateLimitStatus, OfflineError> {
        let now = self.clock.now_utc();

        let user = self.bump(&user_download_key(user_id)).await;
        let user_status = match user {
            Some(c) => RateLimitStatus {
                allowed: c.value <= self.policy.downloads_per_user,
                limit: self.policy.downloads_per_user,
                remaining: self.policy.downloads_per_user.saturating_sub(c.value),
                reset_at: c.expires_at,
            },
            None => RateLimitStatus::from_counter(
                self.policy.downloads_per_user,
                None,
                self.fresh_reset(),
            ),
        };
        if !user_status.allowed {
            tracing::info!(%user_id, "download quota exhausted");
            return Err(user_status.to_error(now));
        }

        if let Some(c) = self.bump(&material_download_key(material_id)).await {
            if c.value > self.policy.downloads_per_material {
                tracing::info!(%material_id, "material download quota exhausted");
                if user.is_some() {
                    if let Err(e) = self.kv.decr(&user_download_key(user_id)).await {
                        tracing::warn!(%user_id, error = %e, "failed to return download slot");
                    }
                }
                let status = RateLimitStatus {
                    allowed: false,
                    limit: self.policy.downloads_per_material,
                    remaining: 0,
                    reset_at: c.expires_at,
                };
                return Err(status.to_error(now));
            }
        }

        Ok(user_status)
    }

    /// Record a failed validation; returns the count in the window.
    pub async fn record_validation_failure(&self, device_id: Uuid) -> u64 {
        let count = self
            .bump(&validation_failure_key(device_id))
            .await
            .map_or(0, |c| c.value);
        if count >= self.policy.validation_failures_before_block {
            tracing::warn!(%device_id, failures = count, "device locked out after validation failures");
        }
        count
    }

    /// Reset a device's validation-failure counter.
    pub async fn reset_validation_failures(&self, device_id: Uuid) {
        if let Err(e) = self.kv.delete(&[validation_failure_key(device_id)]).await {
            tracing::warn!(%device_id, error = %e, "failed to reset validation failures");
        }
    }

    /// Whether a device is blocked, by lockout or by an operator.
    pub async fn is_device_blocked(&self, device_id: Uuid) -> bool {
        match self.kv.get(&device_block_key(device_id)).await {
            Ok(Some(_)) => return true,
            Ok(None) => {}
            Err(e) => tracing::warn!(%device_id, error = %e, "block lookup failed, allowing"),
        }
        self.read(&validation_failure_key(device_id))
            .await
            .is_some_and(|c| c.value >= self.policy.validation_failures_before_block)
    }

    /// Block a device for `duration` regardless of its failure count.
    pub async fn block_device(&self, device_id: Uuid, duration: Duration) -> Result<(), OfflineError> {
        tracing::info!(%device_id, seconds = duration.as_secs(), "device blocked by operator");
        self.kv.set(&device_block_key(device_id), "1", duration).await
    }

    /// Lift a block and clear the device's failure counter.
    pub async fn unblock_device(&self, device_id: Uuid) -> Result<(), OfflineError> {
        self.kv
            .delete(&[device_block_key(device_id), validation_failure_key(device_id)])
            .await
    }
}
