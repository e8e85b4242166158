//! Offline subsystem configuration.
//!
//! Policy values (validity, grace, caps, windows) live here rather than in
//! the engines, so deployments can tune them without code changes. Key
//! material is kept apart in [`ServiceSecrets`].

use crate::cache::layer::REVISION_TTL;
use crate::crypto::keys::ContentKeyring;
use crate::OfflineError;
use std::time::Duration;

/// License lifetime policy.
#[derive(Debug, Clone)]
pub struct LicensePolicy {
    /// How long a freshly issued or renewed license is valid.
    pub validity: Duration,

    /// How long past `expires_at` a license may still validate offline.
    pub offline_grace: Duration,

    /// Accepted length of the nonce presented on validate.
    pub nonce_min_len: usize,

    /// Accepted length of the nonce presented on validate.
    pub nonce_max_len: usize,
}

/// Device trust limits.
#[derive(Debug, Clone)]
pub struct DevicePolicy {
    /// Hard cap on active devices per user.
    pub max_active_per_user: usize,

    /// Minimum fingerprint length.
    pub fingerprint_min_len: usize,

    /// Maximum fingerprint length.
    pub fingerprint_max_len: usize,

    /// Maximum device name length after sanitization.
    pub name_max_len: usize,
}

/// Quotas and lockout thresholds.
#[derive(Debug, Clone)]
pub struct RateLimitPolicy {
    /// Downloads allowed per user per window.
    pub downloads_per_user: u64,

    /// Downloads allowed per material per window.
    pub downloads_per_material: u64,

    /// Validation failures per device before it is blocked.
    pub validation_failures_before_block: u64,

    /// Counter window length.
    pub window: Duration,
}

/// Cache entry lifetimes.
#[derive(Debug, Clone)]
pub struct CacheTtls {
    /// License lookups.
    pub license: Duration,

    /// Single device lookups.
    pub device: Duration,

    /// Per-user active device lists.
    pub device_list: Duration,
}

/// Request integrity windows.
#[derive(Debug, Clone)]
pub struct IntegrityPolicy {
    /// Maximum accepted age of a signed request; also the nonce retention.
    pub replay_window: Duration,

    /// Maximum accepted clock skew into the future.
    pub future_tolerance: Duration,
}

/// Encryption worker pool settings.
#[derive(Debug, Clone)]
pub struct JobPolicy {
    /// Number of concurrent workers.
    pub workers: usize,

    /// How often idle workers re-check the queue.
    pub poll_interval: Duration,

    /// Total attempts before a job is marked failed.
    pub max_attempts: u32,

    /// First retry delay; doubles per retry.
    pub retry_base: Duration,

    /// Upper bound on retry delay.
    pub retry_max: Duration,

    /// How long shutdown waits for in-flight jobs.
    pub shutdown_grace: Duration,

    /// How long a claimed job may stay `processing` before it is reclaimed
    /// as a failed attempt. Must exceed the longest encryption.
    pub lease_timeout: Duration,
}

/// Download delivery settings.
#[derive(Debug, Clone)]
pub struct DownloadPolicy {
    /// Lifetime of a signed fetch URL.
    pub url_ttl: Duration,

    /// Plaintext bytes per encrypted chunk.
    pub chunk_size: usize,

    /// Base URL of the encrypted object host (no trailing slash).
    pub object_base_url: String,

    /// File types that may be packaged for offline use.
    pub supported_file_types: Vec<String>,
}

/// Configuration for the offline license and download subsystem.
#[derive(Debug, Clone)]
pub struct OfflineConfig {
    /// License lifetime policy.
    pub license: LicensePolicy,

    /// Device trust limits.
    pub devices: DevicePolicy,

    /// Quotas and lockout.
    pub rate_limits: RateLimitPolicy,

    /// Cache lifetimes.
    pub cache: CacheTtls,

    /// Request integrity windows.
    pub integrity: IntegrityPolicy,

    /// Encryption worker pool.
    pub jobs: JobPolicy,

    /// Download delivery.
    pub download: DownloadPolicy,

    /// Deadline applied to every externally-facing operation.
    pub request_timeout: Duration,

    /// Capacity of the audit dispatch channel.
    pub audit_buffer: usize,
}

impl Default for OfflineConfig {
    fn default() -> Self {
        Self {
            license: LicensePolicy {
                validity: Duration::from_secs(30 * 24 * 60 * 60),
                offline_grace: Duration::from_secs(72 * 60 * 60),
                nonce_min_len: 16,
                nonce_max_len: 64,
            },
            devices: DevicePolicy {
                max_active_per_user: 5,
                fingerprint_min_len: 32,
                fingerprint_max_len: 512,
                name_max_len: 255,
            },
            rate_limits: RateLimitPolicy {
                downloads_per_user: 10,
                downloads_per_material: 100,
                validation_failures_before_block: 5,
                window: Duration::from_secs(60 * 60),
            },
            cache: CacheTtls {
                license: Duration::from_secs(5 * 60),
                device: Duration::from_secs(10 * 60),
                device_list: Duration::from_secs(10 * 60),
            },
            integrity: IntegrityPolicy {
                replay_window: Duration::from_secs(5 * 60),
                future_tolerance: Duration::from_secs(60),
            },
            jobs: JobPolicy {
                workers: 2,
                poll_interval: Duration::from_secs(1),
                max_attempts: 3,
                retry_base: Duration::from_secs(1),
                retry_max: Duration::from_secs(5 * 60),
                shutdown_grace: Duration::from_secs(60),
                lease_timeout: Duration::from_secs(15 * 60),
            },
            download: DownloadPolicy {
                url_ttl: Duration::from_secs(60 * 60),
                chunk_size: 1024 * 1024,
                object_base_url: "https://objects.localhost".to_string(),
                supported_file_types: vec!["pdf".into(), "docx".into(), "pptx".into()],
            },
            request_timeout: Duration::from_secs(30),
            audit_buffer: 1024,
        }
    }
}

impl OfflineConfig {
    /// Validate configuration for obvious errors.
    pub fn validate(&self) -> Result<(), OfflineError> {
        if self.license.validity.is_zero() {
            return Err(OfflineError::Config(
                "license validity cannot be zero".to_string(),
            ));
        }
        if self.license.nonce_min_len == 0 || self.license.nonce_min_len > self.license.nonce_max_len
        {
            return Err(OfflineError::Config(format!(
                "nonce length bounds invalid: {}..={}",
                self.license.nonce_min_len, self.license.nonce_max_len
            )));
        }
        if self.devices.max_active_per_user == 0 {
            return Err(OfflineError::Config(
                "max_active_per_user must be at least 1".to_string(),
            ));
        }
        if self.devices.fingerprint_min_len > self.devices.fingerprint_max_len {
            return Err(OfflineError::Config(format!(
                "fingerprint length bounds invalid: {}..={}",
                self.devices.fingerprint_min_len, self.devices.fingerprint_max_len
            )));
        }
        if self.rate_limits.window.as_secs() == 0 {
            return Err(OfflineError::Config(
                "rate limit window must be at least one second".to_string(),
            ));
        }
        if self.rate_limits.validation_failures_before_block == 0 {
            return Err(OfflineError::Config(
                "validation_failures_before_block must be at least 1".to_string(),
            ));
        }
        if self.jobs.workers == 0 || self.jobs.max_attempts == 0 {
            return Err(OfflineError::Config(
                "job workers and max_attempts must be at least 1".to_string(),
            ));
        }
        if self.jobs.lease_timeout.is_zero() {
            return Err(OfflineError::Config("lease_timeout cannot be zero".to_string()));
        }
        let longest_ttl = self
            .cache
            .license
            .max(self.cache.device)
            .max(self.cache.device_list);
        if longest_ttl > REVISION_TTL {
            return Err(OfflineError::Config(format!(
                "cache TTLs cannot exceed {}s",
                REVISION_TTL.as_secs()
            )));
        }
        if self.download.chunk_size == 0 {
            return Err(OfflineError::Config("chunk_size cannot be zero".to_string()));
        }
        if self.download.object_base_url.is_empty() || self.download.object_base_url.ends_with('/')
        {
            return Err(OfflineError::Config(
                "object_base_url must be non-empty without a trailing slash".to_string(),
            ));
        }
        if self.audit_buffer == 0 {
            return Err(OfflineError::Config("audit_buffer cannot be zero".to_string()));
        }
        Ok(())
    }
}

/// Connection settings for the content service.
#[derive(Debug, Clone)]
pub struct ContentServiceConfig {
    /// Base URL, e.g. "https://content.internal" (no trailing slash).
    pub base_url: String,

    /// Bearer token for service-to-service calls.
    pub service_token: Option<String>,

    /// User-Agent product identifier.
    pub user_agent_product: String,

    /// Per-request timeout.
    pub timeout: Duration,
}

impl ContentServiceConfig {
    /// Validate configuration for obvious errors.
    pub fn validate(&self) -> Result<(), OfflineError> {
        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            return Err(OfflineError::Config(format!(
                "content service base_url must be http(s), got {:?}",
                self.base_url
            )));
        }
        if self.base_url.ends_with('/') {
            return Err(OfflineError::Config(
                "content service base_url must not end with '/'".to_string(),
            ));
        }
        Ok(())
    }
}

/// Key material for the subsystem.
///
/// Never logged; `Debug` is implemented by hand to redact it.
#[derive(Clone)]
pub struct ServiceSecrets {
    /// Root secret request-signing keys are derived from.
    pub request_signing_root: Vec<u8>,

    /// Versioned master keys per-material content keys are derived from.
    pub content_keys: ContentKeyring,

    /// Ed25519 seed used to sign download URLs.
    pub url_signing_seed: [u8; 32],
}

impl ServiceSecrets {
    /// Validate key lengths.
    pub fn validate(&self) -> Result<(), OfflineError> {
        if self.request_signing_root.len() < 32 {
            return Err(OfflineError::Config(format!(
                "request_signing_root must be at least 32 bytes, got {}",
                self.request_signing_root.len()
            )));
        }
        self.content_keys.validate()
    }
}

impl std::fmt::Debug for ServiceSecrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceSecrets").finish_non_exhaustive()
    }
}
