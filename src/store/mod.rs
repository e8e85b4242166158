//! Durable repository seams.
//!
//! These traits are the source of truth for devices, licenses, jobs and
//! artifacts. Every uniqueness rule the subsystem depends on is expressed as
//! a conditional operation here, so it holds across independent request
//! handlers without application-level locks:
//! - at most `max` active devices per user, fingerprints unique per user
//! - at most one active license per (user, material, device)
//! - at most one encryption job per material
//! - nonce rotation only from the nonce the caller presented
//! - a job attempt writes its outcome only while it still holds the lease

pub mod memory;

use crate::protocol::models::{Device, EncryptedArtifact, EncryptionJob, License};
use crate::OfflineError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

pub use memory::{MemoryArtifactStore, MemoryDeviceStore, MemoryJobStore, MemoryLicenseStore};

/// Outcome of a capped device insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceInsert {
    /// The device was stored.
    Inserted(Device),
    /// An active device with the same fingerprint already exists for the user.
    Existing(Device),
    /// The user already holds the maximum number of active devices.
    LimitReached,
}

/// Outcome of a conditional license insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LicenseInsert {
    /// The license was stored.
    Inserted(License),
    /// A usable active license already exists for the triple.
    Existing(License),
}

/// Device persistence.
#[async_trait]
pub trait DeviceStore: Send + Sync {
    /// Load a device by id, any status.
    async fn get(&self, id: Uuid) -> Result<Option<Device>, OfflineError>;

    /// Active devices of a user, most recently used first.
    async fn list_active(&self, user_id: Uuid) -> Result<Vec<Device>, OfflineError>;

    /// Insert an active device unless the user is at `max_active` or already
    /// has an active device with the same fingerprint. Check and insert are
    /// one atomic step.
    async fn insert_capped(
        &self,
        device: Device,
        max_active: usize,
    ) -> Result<DeviceInsert, OfflineError>;

    /// Refresh `last_used_at`; returns the device if it exists.
    async fn touch(&self, id: Uuid, at: DateTime<Utc>) -> Result<Option<Device>, OfflineError>;

    /// Mark a device revoked; returns the updated record if it exists.
    async fn revoke(&self, id: Uuid) -> Result<Option<Device>, OfflineError>;
}

/// License persistence.
#[async_trait]
pub trait LicenseStore: Send + Sync {
    /// Load a license by id. May be served from a cache.
    async fn get(&self, id: Uuid) -> Result<Option<License>, OfflineError>;

    /// Load a license by id from the source of truth, bypassing any cache.
    ///
    /// Status and nonce decisions use this.
    async fn get_current(&self, id: Uuid) -> Result<Option<License>, OfflineError> {
        self.get(id).await
    }

    /// Insert `license` unless an active license usable at `now` exists for
    /// its triple, in which case that one is returned. An active record for
    /// the triple that is already past its hard expiry is marked expired in
    /// the same step.
    async fn insert_active(
        &self,
        license: License,
        now: DateTime<Utc>,
    ) -> Result<LicenseInsert, OfflineError>;

    /// Replace the nonce and `last_validated_at` only if the stored nonce is
    /// still `expected_nonce` and the license is active. Returns the updated
    /// record, or `None` when the condition failed.
    async fn rotate_nonce(
        &self,
        id: Uuid,
        expected_nonce: &str,
        new_nonce: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<License>, OfflineError>;

    /// Extend an active license; returns the updated record, or `None` if it
    /// is no longer active.
    async fn renew(
        &self,
        id: Uuid,
        expires_at: DateTime<Utc>,
        new_nonce: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<License>, OfflineError>;

    /// Revoke one license; returns it if it exists.
    async fn revoke(&self, id: Uuid) -> Result<Option<License>, OfflineError>;

    /// Revoke every non-revoked license of a material; returns those changed.
    async fn revoke_by_material(&self, material_id: Uuid) -> Result<Vec<License>, OfflineError>;

    /// Revoke every non-revoked license bound to a device; returns those changed.
    async fn revoke_by_device(&self, device_id: Uuid) -> Result<Vec<License>, OfflineError>;
}

/// Encryption job persistence and queue.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Load a job by id.
    async fn get(&self, id: Uuid) -> Result<Option<EncryptionJob>, OfflineError>;

    /// The job of a material, if any.
    async fn find_by_material(&self, material_id: Uuid)
        -> Result<Option<EncryptionJob>, OfflineError>;

    /// Store `job` unless the material already has one; returns the stored
    /// job and whether it was created by this call.
    async fn create_if_absent(
        &self,
        job: EncryptionJob,
    ) -> Result<(EncryptionJob, bool), OfflineError>;

    /// Atomically move the best claimable pending job (priority, then FIFO)
    /// to `processing` and return it.
    async fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<EncryptionJob>, OfflineError>;

    /// Persist a job's new state.
    async fn update(&self, job: &EncryptionJob) -> Result<(), OfflineError>;

    /// Jobs still `processing` whose attempt started before `stale_before`.
    async fn list_stale(&self, stale_before: DateTime<Utc>) -> Result<Vec<EncryptionJob>, OfflineError>;

    /// Persist `job` only while the stored copy is `processing` under the
    /// attempt that started at `lease`. Returns whether it was written.
    async fn update_leased(
        &self,
        job: &EncryptionJob,
        lease: DateTime<Utc>,
    ) -> Result<bool, OfflineError>;

    /// Delete completed jobs that finished before `cutoff`; returns how many.
    async fn delete_completed_before(&self, cutoff: DateTime<Utc>) -> Result<usize, OfflineError>;
}

/// Encrypted artifact metadata persistence.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Artifact of a material, if produced.
    async fn get(&self, material_id: Uuid) -> Result<Option<EncryptedArtifact>, OfflineError>;

    /// Store or replace the artifact of a material.
    async fn put(&self, artifact: EncryptedArtifact) -> Result<(), OfflineError>;

    /// Artifacts sealed under a content key version older than `version`.
    async fn list_below_key_version(&self, version: u32)
        -> Result<Vec<EncryptedArtifact>, OfflineError>;
}
