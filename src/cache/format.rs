//! Cache record format and key layout.
//!
//! Cached values are wrapped in a record carrying the time they were cached
//! and a SHA-256 digest of the body. On load we:
//! 1. Recompute the digest (mismatch means corruption or tampering)
//! 2. Reject records cached in the future (clock tampering)
//! 3. Deserialize the body
//!
//! Any failure is reported as an error which the cache layer turns into a
//! miss.
//!
//! Records also carry the revision of their key at the moment the value was
//! read from the durable store. Invalidation bumps the revision, so a fill
//! that raced a write is recognised as stale and ignored.

use crate::clock::Clock;
use crate::crypto::digest::sha256_b64;
use crate::OfflineError;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use uuid::Uuid;

/// Namespace shared by every key this subsystem writes.
pub const KEY_PREFIX: &str = "offline";

/// Key of a cached license.
pub fn license_key(license_id: Uuid) -> String {
    format!("{}:license:{}", KEY_PREFIX, license_id)
}

/// Key of a cached device.
pub fn device_key(device_id: Uuid) -> String {
    format!("{}:device:{}", KEY_PREFIX, device_id)
}

/// Key of a user's cached active device list.
pub fn user_devices_key(user_id: Uuid) -> String {
    format!("{}:devices:user:{}", KEY_PREFIX, user_id)
}

/// Key of a user's hourly download counter.
pub fn user_download_key(user_id: Uuid) -> String {
    format!("{}:ratelimit:download:user:{}", KEY_PREFIX, user_id)
}

/// Key of a material's hourly download counter.
pub fn material_download_key(material_id: Uuid) -> String {
    format!("{}:ratelimit:download:material:{}", KEY_PREFIX, material_id)
}

/// Key of a device's validation-failure counter.
pub fn validation_failure_key(device_id: Uuid) -> String {
    format!("{}:ratelimit:validation:{}", KEY_PREFIX, device_id)
}

/// Key marking a device as blocked by an operator.
pub fn device_block_key(device_id: Uuid) -> String {
    format!("{}:ratelimit:block:{}", KEY_PREFIX, device_id)
}

/// Key of the revision counter guarding a cached key.
pub fn revision_key(key: &str) -> String {
    format!("{}:rev", key)
}

/// Key recording a used request nonce.
pub fn replay_key(nonce: &str) -> String {
    format!("{}:replay:{}", KEY_PREFIX, nonce)
}

/// Integrity-checked cache record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheRecord {
    /// Serialized value (JSON).
    pub body: String,

    /// SHA-256 of `body`, base64.
    pub digest: String,

    /// When this record was cached.
    pub cached_at: DateTime<Utc>,

    /// Revision of the key observed before the value was loaded.
    #[serde(default)]
    pub revision: Option<String>,
}

impl CacheRecord {
    /// Wrap a value for caching.
    pub fn wrap<T: Serialize>(value: &T, clock: &dyn Clock) -> Result<Self, OfflineError> {
        let body = serde_json::to_string(value)
            .map_err(|e| OfflineError::CacheIO(format!("Failed to serialize cache value: {}", e)))?;
        Ok(Self {
            digest: sha256_b64(body.as_bytes()),
            body,
            cached_at: clock.now_utc(),
            revision: None,
        })
    }

    /// Tag the record with the revision it was loaded under.
    pub fn at_revision(mut self, revision: impl Into<String>) -> Self {
        self.revision = Some(revision.into());
        self
    }

    /// Serialize the record to JSON.
    pub fn to_json(&self) -> Result<String, OfflineError> {
        serde_json::to_string(self)
            .map_err(|e| OfflineError::CacheIO(format!("Failed to serialize cache: {}", e)))
    }

    /// Deserialize a record from JSON.
    pub fn from_json(json: &str) -> Result<Self, OfflineError> {
        serde_json::from_str(json)
            .map_err(|e| OfflineError::CacheIO(format!("Failed to deserialize cache: {}", e)))
    }

    /// Verify the record and extract its value.
    pub fn open<T: DeserializeOwned>(&self, clock: &dyn Clock) -> Result<T, OfflineError> {
        if sha256_b64(self.body.as_bytes()) != self.digest {
            return Err(OfflineError::CacheTampered);
        }

        if self.cached_at > clock.now_utc() {
            return Err(OfflineError::CacheTampered);
        }

        serde_json::from_str(&self.body)
            .map_err(|e| OfflineError::CacheIO(format!("Failed to decode cached value: {}", e)))
    }
}
