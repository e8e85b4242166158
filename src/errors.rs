//! Offline subsystem error types.
//!
//! Every failure carries a distinct variant so callers can tell a device that
//! should be re-registered from a license that should be re-issued from a
//! client that should simply back off. [`OfflineError::kind`] folds the
//! variants into the coarse taxonomy used at the HTTP edge.

use chrono::{DateTime, Utc};
use http::StatusCode;
use thiserror::Error;
use uuid::Uuid;

use crate::protocol::models::JobStatus;

/// Coarse error classes surfaced to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// No or invalid caller identity.
    Unauthorized,
    /// Malformed input the client must fix.
    BadRequest,
    /// The caller is identified but not allowed.
    Forbidden,
    /// The addressed resource does not exist.
    NotFound,
    /// Work is still in progress; poll again.
    Conflict,
    /// Client must back off until the window resets.
    RateLimited,
    /// Temporarily unable to serve; ask again later.
    Unavailable,
    /// Failure not attributable to the caller.
    Internal,
}

/// Errors that can occur in the offline license and download subsystem.
#[derive(Debug, Error)]
pub enum OfflineError {
    /// Configuration is invalid.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Caller is not authenticated.
    #[error("Authentication required")]
    Unauthorized,

    /// Request input failed validation.
    #[error("Invalid request: {0}")]
    InvalidInput(String),

    /// Fingerprint length is out of bounds.
    #[error("Fingerprint must be between {min} and {max} characters, got {len}")]
    InvalidFingerprint {
        /// Supplied length.
        len: usize,
        /// Minimum accepted length.
        min: usize,
        /// Maximum accepted length.
        max: usize,
    },

    /// Platform is not one of the supported values.
    #[error("Unsupported platform: {0}")]
    InvalidPlatform(String),

    /// Device public key is not an uncompressed secp256k1 point.
    #[error("Invalid device public key: {0}")]
    InvalidPublicKey(String),

    /// Range header is malformed.
    #[error("Invalid Range header: {0}")]
    InvalidRange(String),

    /// Material type cannot be packaged for offline use.
    #[error("Unsupported file type: {0}")]
    UnsupportedFileType(String),

    /// User already holds the maximum number of active devices.
    #[error("Device limit exceeded (max {max})")]
    DeviceLimitExceeded {
        /// The active device cap.
        max: usize,
    },

    /// Fingerprint is already registered under a conflicting identity.
    #[error("Fingerprint already registered to another device")]
    DuplicateFingerprint,

    /// Device does not exist, is revoked, or belongs to someone else.
    #[error("Device not found")]
    DeviceNotFound,

    /// Caller tried to act on a device owned by another user.
    #[error("Device is owned by another user")]
    DeviceForbidden,

    /// Supplied fingerprint does not match the stored one.
    #[error("Device fingerprint mismatch")]
    FingerprintMismatch,

    /// Device is locked out after repeated validation failures.
    #[error("Device is temporarily blocked")]
    DeviceBlocked,

    /// License does not exist.
    #[error("License not found")]
    LicenseNotFound,

    /// License is past expiry and offline grace.
    #[error("License expired")]
    LicenseExpired,

    /// License was revoked.
    #[error("License revoked")]
    LicenseRevoked,

    /// Presented nonce is stale or forged.
    #[error("License nonce mismatch")]
    NonceMismatch,

    /// License does not authorize this download.
    #[error("License is not valid for this download: {0}")]
    LicenseInvalid(String),

    /// Material access gate denied the request.
    #[error("Access to material denied")]
    AccessDenied,

    /// Material does not exist.
    #[error("Material not found")]
    MaterialNotFound,

    /// Encryption job does not exist.
    #[error("Encryption job not found")]
    JobNotFound,

    /// Encrypted artifact is still being produced.
    #[error("Artifact not ready (job {job_id} is {status})")]
    ArtifactNotReady {
        /// The job producing the artifact.
        job_id: Uuid,
        /// Its current status.
        status: JobStatus,
    },

    /// Encryption exhausted its retries.
    #[error("Artifact preparation failed (job {job_id})")]
    ArtifactFailed {
        /// The failed job.
        job_id: Uuid,
        /// Last recorded failure.
        reason: String,
    },

    /// Quota for the current window is exhausted.
    #[error("Rate limit exceeded, retry after {retry_after_seconds}s")]
    RateLimited {
        /// Configured limit for the window.
        limit: u64,
        /// Seconds until the window resets.
        retry_after_seconds: u64,
        /// When the window resets.
        reset_at: DateTime<Utc>,
    },

    /// Request signature header could not be parsed.
    #[error("Malformed signature header: {0}")]
    MalformedSignature(String),

    /// Request signature verification failed.
    #[error("Request signature verification failed")]
    SignatureInvalid,

    /// Request timestamp is outside the accepted window.
    #[error("Request timestamp outside accepted window ({skew_seconds}s)")]
    StaleRequest {
        /// Signed age of the request in seconds; negative means future.
        skew_seconds: i64,
    },

    /// Nonce was already used within the replay window.
    #[error("Request nonce already used")]
    Replay,

    /// Durable store failure.
    #[error("Store error: {0}")]
    Store(String),

    /// Key-value cache failure.
    #[error("Cache I/O error: {0}")]
    CacheIO(String),

    /// Cached record failed its integrity check.
    #[error("Cache tampering detected")]
    CacheTampered,

    /// Replay store could not be consulted.
    #[error("Replay protection unavailable: {0}")]
    ReplayStoreUnavailable(String),

    /// Object storage failure.
    #[error("Object storage error: {0}")]
    Storage(String),

    /// No content key is configured for this key version.
    #[error("Unknown content key version {0}")]
    UnknownKeyVersion(u32),

    /// Encryption or decryption failure.
    #[error("Encryption error: {0}")]
    Encryption(String),

    /// Content service transport failure.
    #[error("Content service transport error: {0}")]
    Upstream(String),

    /// Content service returned something unparseable.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Operation exceeded the request deadline.
    #[error("Request deadline exceeded")]
    DeadlineExceeded,
}

impl OfflineError {
    /// Classify the error into the client-facing taxonomy.
    pub fn kind(&self) -> ErrorKind {
        use OfflineError::*;
        match self {
            Unauthorized => ErrorKind::Unauthorized,
            InvalidInput(_)
            | InvalidFingerprint { .. }
            | InvalidPlatform(_)
            | InvalidPublicKey(_)
            | InvalidRange(_)
            | UnsupportedFileType(_)
            | MalformedSignature(_) => ErrorKind::BadRequest,
            DeviceLimitExceeded { .. }
            | DuplicateFingerprint
            | DeviceForbidden
            | FingerprintMismatch
            | DeviceBlocked
            | LicenseExpired
            | LicenseRevoked
            | NonceMismatch
            | LicenseInvalid(_)
            | AccessDenied
            | SignatureInvalid
            | StaleRequest { .. }
            | Replay => ErrorKind::Forbidden,
            DeviceNotFound | LicenseNotFound | MaterialNotFound | JobNotFound => {
                ErrorKind::NotFound
            }
            ArtifactNotReady { .. } => ErrorKind::Conflict,
            RateLimited { .. } => ErrorKind::RateLimited,
            ArtifactFailed { .. } | ReplayStoreUnavailable(_) | DeadlineExceeded => {
                ErrorKind::Unavailable
            }
            Config(_) | Store(_) | CacheIO(_) | CacheTampered | Storage(_) | Encryption(_)
            | UnknownKeyVersion(_) | Upstream(_) | Protocol(_) => ErrorKind::Internal,
        }
    }

    /// HTTP status code for this error.
    pub fn status(&self) -> StatusCode {
        match self.kind() {
            ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorKind::BadRequest => StatusCode::BAD_REQUEST,
            ErrorKind::Forbidden => StatusCode::FORBIDDEN,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable error code.
    pub fn code(&self) -> &'static str {
        use OfflineError::*;
        match self {
            Config(_) => "CONFIG_ERROR",
            Unauthorized => "UNAUTHORIZED",
            InvalidInput(_) => "INVALID_REQUEST",
            InvalidFingerprint { .. } => "INVALID_FINGERPRINT",
            InvalidPlatform(_) => "INVALID_PLATFORM",
            InvalidPublicKey(_) => "INVALID_PUBLIC_KEY",
            InvalidRange(_) => "INVALID_RANGE",
            UnsupportedFileType(_) => "UNSUPPORTED_FILE_TYPE",
            DeviceLimitExceeded { .. } => "DEVICE_LIMIT_EXCEEDED",
            DuplicateFingerprint => "DEVICE_ALREADY_REGISTERED",
            DeviceNotFound => "DEVICE_NOT_FOUND",
            DeviceForbidden => "DEVICE_FORBIDDEN",
            FingerprintMismatch => "DEVICE_FINGERPRINT_MISMATCH",
            DeviceBlocked => "DEVICE_BLOCKED",
            LicenseNotFound => "LICENSE_NOT_FOUND",
            LicenseExpired => "LICENSE_EXPIRED",
            LicenseRevoked => "LICENSE_REVOKED",
            NonceMismatch => "INVALID_NONCE",
            LicenseInvalid(_) => "LICENSE_INVALID",
            AccessDenied => "MATERIAL_ACCESS_DENIED",
            MaterialNotFound => "MATERIAL_NOT_FOUND",
            JobNotFound => "JOB_NOT_FOUND",
            ArtifactNotReady { .. } => "JOB_IN_PROGRESS",
            ArtifactFailed { .. } => "JOB_FAILED",
            RateLimited { .. } => "RATE_LIMIT_EXCEEDED",
            MalformedSignature(_) => "INVALID_SIGNATURE_HEADER",
            SignatureInvalid => "INVALID_SIGNATURE",
            StaleRequest { .. } => "REQUEST_EXPIRED",
            Replay => "REPLAY_ATTACK",
            Store(_) => "DATABASE_ERROR",
            CacheIO(_) | CacheTampered => "CACHE_ERROR",
            ReplayStoreUnavailable(_) => "SERVICE_UNAVAILABLE",
            Storage(_) => "STORAGE_ERROR",
            Encryption(_) => "ENCRYPTION_FAILED",
            UnknownKeyVersion(_) => "KEY_VERSION_UNKNOWN",
            Upstream(_) | Protocol(_) => "UPSTREAM_ERROR",
            DeadlineExceeded => "DEADLINE_EXCEEDED",
        }
    }

    /// Message safe to return to clients.
    ///
    /// Internal causes are replaced with an opaque message; everything else
    /// uses the display text, which never embeds storage details.
    pub fn public_message(&self) -> String {
        match self.kind() {
            ErrorKind::Internal => "An internal error occurred".to_string(),
            ErrorKind::Unavailable => match self {
                OfflineError::ArtifactFailed { .. } => {
                    "The offline copy could not be prepared; try again later or contact support"
                        .to_string()
                }
                _ => "Service temporarily unavailable".to_string(),
            },
            _ => self.to_string(),
        }
    }

    /// Seconds the client should wait before retrying, when known.
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            OfflineError::RateLimited {
                retry_after_seconds,
                ..
            } => Some(*retry_after_seconds),
            _ => None,
        }
    }
}
