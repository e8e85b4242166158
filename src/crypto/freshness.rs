//! Signed-request freshness enforcement (replay window).

use crate::clock::Clock;
use crate::config::IntegrityPolicy;
use crate::OfflineError;
use chrono::{DateTime, TimeZone, Utc};

/// Convert a unix timestamp from a signature header.
pub fn parse_unix_timestamp(timestamp: i64) -> Result<DateTime<Utc>, OfflineError> {
    Utc.timestamp_opt(timestamp, 0)
        .single()
        .ok_or_else(|| OfflineError::MalformedSignature(format!("timestamp {} out of range", timestamp)))
}

/// Check that a signed request is fresh.
///
/// # Arguments
/// * `request_time` - Timestamp from the signature header
/// * `policy` - Replay window and future tolerance
/// * `clock` - Clock implementation for current time
///
/// # Errors
/// * `StaleRequest` - Older than the replay window, or further in the future
///   than the tolerance allows
pub fn check_freshness<C: Clock + ?Sized>(
    request_time: DateTime<Utc>,
    policy: &IntegrityPolicy,
    clock: &C,
) -> Result<(), OfflineError> {
    let now = clock.now_utc();
    let age_seconds = (now - request_time).num_seconds();

    if age_seconds > policy.replay_window.as_secs() as i64 {
        return Err(OfflineError::StaleRequest {
            skew_seconds: age_seconds,
        });
    }

    if age_seconds < -(policy.future_tolerance.as_secs() as i64) {
        return Err(OfflineError::StaleRequest {
            skew_seconds: age_seconds,
        });
    }

    Ok(())
}
