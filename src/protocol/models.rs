//! Records owned by the offline subsystem and the shapes it returns.

use crate::OfflineError;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Client platform of a trusted device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    /// Apple mobile.
    Ios,
    /// Android mobile.
    Android,
    /// Desktop app.
    Desktop,
}

impl FromStr for Platform {
    type Err = OfflineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ios" => Ok(Platform::Ios),
            "android" => Ok(Platform::Android),
            "desktop" => Ok(Platform::Desktop),
            other => Err(OfflineError::InvalidPlatform(other.to_string())),
        }
    }
}

/// Device lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    /// Trusted and counted against the cap.
    Active,
    /// Deregistered.
    Revoked,
}

/// A trusted device of one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    /// Device id.
    pub id: Uuid,
    /// Owning user.
    pub user_id: Uuid,
    /// Client-derived opaque fingerprint.
    pub fingerprint: String,
    /// Display name.
    pub name: String,
    /// Platform.
    pub platform: Platform,
    /// Hex uncompressed secp256k1 key that device keys are wrapped to.
    #[serde(default)]
    pub public_key: String,
    /// Lifecycle status.
    pub status: DeviceStatus,
    /// Last authenticated use.
    pub last_used_at: DateTime<Utc>,
    /// Registration time.
    pub created_at: DateTime<Utc>,
}

impl Device {
    /// Whether the device is active.
    pub fn is_active(&self) -> bool {
        self.status == DeviceStatus::Active
    }
}

/// Stored license status.
///
/// `Expired` is normally computed from the clock; it is only stored when a
/// hard-expired record is superseded by a fresh issuance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LicenseStatus {
    /// Usable subject to expiry.
    Active,
    /// Past expiry and grace.
    Expired,
    /// Revoked explicitly or by device cascade.
    Revoked,
}

/// Permission for one (user, material, device) triple to hold an offline copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct License {
    /// License id.
    pub id: Uuid,
    /// Holder.
    pub user_id: Uuid,
    /// Licensed material.
    pub material_id: Uuid,
    /// Bound device.
    pub device_id: Uuid,
    /// Stored status.
    pub status: LicenseStatus,
    /// End of the validity period.
    pub expires_at: DateTime<Utc>,
    /// Grace past `expires_at`, in seconds.
    #[serde(rename = "offline_grace_period")]
    pub offline_grace_seconds: i64,
    /// Last successful validate or renew.
    pub last_validated_at: Option<DateTime<Utc>>,
    /// Current anti-replay token.
    pub nonce: String,
    /// Issuance time.
    pub created_at: DateTime<Utc>,
}

impl License {
    /// Grace period as a duration.
    pub fn offline_grace(&self) -> Duration {
        Duration::seconds(self.offline_grace_seconds)
    }

    /// Instant after which the license is unusable.
    pub fn hard_expiry(&self) -> DateTime<Utc> {
        self.expires_at + self.offline_grace()
    }

    /// Past `expires_at`; used for renewal messaging only.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// Past `expires_at + grace`.
    pub fn is_hard_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.hard_expiry()
    }

    /// Status with time-driven expiry applied.
    pub fn status_at(&self, now: DateTime<Utc>) -> LicenseStatus {
        match self.status {
            LicenseStatus::Active if self.is_hard_expired(now) => LicenseStatus::Expired,
            other => other,
        }
    }

    /// Check the license can be used at `now`.
    ///
    /// # Errors
    /// * `LicenseRevoked` - Revoked explicitly or by cascade
    /// * `LicenseExpired` - Past `expires_at + offline_grace_period`
    pub fn check_usable(&self, now: DateTime<Utc>) -> Result<(), OfflineError> {
        match self.status_at(now) {
            LicenseStatus::Active => Ok(()),
            LicenseStatus::Revoked => Err(OfflineError::LicenseRevoked),
            LicenseStatus::Expired => Err(OfflineError::LicenseExpired),
        }
    }

    /// Whether the license is bound to this triple.
    pub fn is_bound_to(&self, user_id: Uuid, material_id: Uuid, device_id: Uuid) -> bool {
        self.user_id == user_id && self.material_id == material_id && self.device_id == device_id
    }
}

/// Encryption job priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobPriority {
    /// Served first.
    High = 1,
    /// Default for downloads.
    Normal = 2,
    /// Background prefetch.
    Low = 3,
}

/// Encryption job lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting for a worker.
    Pending,
    /// Claimed by a worker.
    Processing,
    /// Artifact stored.
    Completed,
    /// Retries exhausted.
    Failed,
}

impl JobStatus {
    /// Whether no further transitions happen without operator action.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Requester context recorded on a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOrigin {
    /// Requesting user.
    pub user_id: Option<Uuid>,
    /// Requesting device.
    pub device_id: Option<Uuid>,
    /// License the request was made under.
    pub license_id: Option<Uuid>,
}

/// Work item producing the encrypted artifact of one material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionJob {
    /// Job id.
    pub id: Uuid,
    /// Material to encrypt.
    pub material_id: Uuid,
    /// Requesting user.
    pub user_id: Option<Uuid>,
    /// Requesting device.
    pub device_id: Option<Uuid>,
    /// License the request was made under.
    pub license_id: Option<Uuid>,
    /// Queue priority.
    pub priority: JobPriority,
    /// Lifecycle status.
    pub status: JobStatus,
    /// Last failure message.
    pub error: Option<String>,
    /// Failed attempts so far.
    pub retry_count: u32,
    /// Enqueue time.
    pub created_at: DateTime<Utc>,
    /// Start of the latest attempt.
    pub started_at: Option<DateTime<Utc>>,
    /// Completion time.
    pub completed_at: Option<DateTime<Utc>>,
    /// Earliest time a worker may claim the job again.
    pub not_before: Option<DateTime<Utc>>,
}

impl EncryptionJob {
    /// Create a pending job.
    pub fn pending(
        material_id: Uuid,
        priority: JobPriority,
        origin: JobOrigin,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            material_id,
            user_id: origin.user_id,
            device_id: origin.device_id,
            license_id: origin.license_id,
            priority,
            status: JobStatus::Pending,
            error: None,
            retry_count: 0,
            created_at: now,
            started_at: None,
            completed_at: None,
            not_before: None,
        }
    }

    /// Whether a worker may claim the job at `now`.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.not_before.map_or(true, |t| t <= now)
    }
}

/// One entry of a chunk table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkInfo {
    /// Zero-based chunk index.
    pub index: u32,
    /// Byte offset in the encrypted object.
    pub offset: u64,
    /// Encrypted chunk size in bytes.
    pub size: u64,
}

/// Stored metadata of an encrypted material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedArtifact {
    /// Artifact id.
    pub id: Uuid,
    /// Source material.
    pub material_id: Uuid,
    /// Key of the encrypted object in storage.
    pub object_key: String,
    /// File type of the original.
    pub file_type: String,
    /// Size of the original in bytes.
    pub original_size: u64,
    /// Size of the encrypted object in bytes.
    pub total_size: u64,
    /// SHA-256 hex of the original.
    pub original_hash: String,
    /// SHA-256 hex of the encrypted object.
    pub encrypted_hash: String,
    /// Plaintext bytes per chunk.
    pub chunk_size: u64,
    /// Chunk table over the encrypted object.
    pub chunks: Vec<ChunkInfo>,
    /// Content master key version the artifact is sealed under.
    pub key_version: u32,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// Chunk table and hashes handed to a client for one download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadManifest {
    /// Material.
    pub material_id: Uuid,
    /// License the download is made under.
    pub license_id: Uuid,
    /// Number of chunks.
    pub total_chunks: u32,
    /// Encrypted object size; equals the sum of chunk sizes.
    pub total_size: u64,
    /// SHA-256 hex of the original.
    pub original_hash: String,
    /// SHA-256 hex of the encrypted object.
    pub encrypted_hash: String,
    /// Plaintext bytes per chunk.
    pub chunk_size: u64,
    /// Chunk table.
    pub chunks: Vec<ChunkInfo>,
    /// File type of the original.
    pub file_type: String,
    /// Content master key version; selects the wrapped key to use.
    pub key_version: u32,
    /// Build time.
    pub created_at: DateTime<Utc>,
}

impl DownloadManifest {
    /// Build a manifest from stored artifact metadata.
    pub fn from_artifact(artifact: &EncryptedArtifact, license_id: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            material_id: artifact.material_id,
            license_id,
            total_chunks: artifact.chunks.len() as u32,
            total_size: artifact.total_size,
            original_hash: artifact.original_hash.clone(),
            encrypted_hash: artifact.encrypted_hash.clone(),
            chunk_size: artifact.chunk_size,
            chunks: artifact.chunks.clone(),
            file_type: artifact.file_type.clone(),
            key_version: artifact.key_version,
            created_at: now,
        }
    }
}

/// Material metadata served by the content service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaterialInfo {
    /// Material id.
    pub id: Uuid,
    /// Owning content container.
    pub container_id: Uuid,
    /// Title.
    pub title: String,
    /// File type (extension without dot).
    pub file_type: String,
    /// Storage key or URL of the original.
    pub file_url: String,
    /// Size of the original in bytes.
    pub file_size: u64,
}
