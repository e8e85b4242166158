//! In-memory repositories.
//!
//! Each store keeps its records behind one mutex, which makes every
//! conditional operation a single critical section. They back tests and
//! single-node deployments; a relational implementation gets the same
//! guarantees from unique indexes and conditional updates.

use super::{ArtifactStore, DeviceInsert, DeviceStore, JobStore, LicenseInsert, LicenseStore};
use crate::protocol::models::{
    Device, DeviceStatus, EncryptedArtifact, EncryptionJob, JobStatus, License, LicenseStatus,
};
use crate::OfflineError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

/// Lock a store, recovering the data from a poisoned mutex.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        tracing::warn!("store mutex was poisoned, recovering");
        poisoned.into_inner()
    })
}

/// In-memory device store.
#[derive(Debug, Default)]
pub struct MemoryDeviceStore {
    devices: Mutex<HashMap<Uuid, Device>>,
}

impl MemoryDeviceStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeviceStore for MemoryDeviceStore {
    async fn get(&self, id: Uuid) -> Result<Option<Device>, OfflineError> {
        Ok(lock(&self.devices).get(&id).cloned())
    }

    async fn list_active(&self, user_id: Uuid) -> Result<Vec<Device>, OfflineError> {
        let mut devices: Vec<Device> = lock(&self.devices)
            .values()
            .filter(|d| d.user_id == user_id && d.is_active())
            .cloned()
            .collect();
        devices.sort_by(|a, b| b.last_used_at.cmp(&a.last_used_at));
        Ok(devices)
    }

    async fn insert_capped(
        &self,
        device: Device,
        max_active: usize,
    ) -> Result<DeviceInsert, OfflineError> {
        let mut devices = lock(&self.devices);

        let mut active = 0usize;
        for existing in devices.values() {
            if existing.user_id != device.user_id || !existing.is_active() {
                continue;
            }
            if existing.fingerprint == device.fingerprint {
                return Ok(DeviceInsert::Existing(existing.clone()));
            }
            active += 1;
        }

        if active >= max_active {
            return Ok(DeviceInsert::LimitReached);
        }

        devices.insert(device.id, device.clone());
        Ok(DeviceInsert::Inserted(device))
    }

    async fn touch(&self, id: Uuid, at: DateTime<Utc>) -> Result<Option<Device>, OfflineError> {
        Ok(lock(&self.devices).get_mut(&id).map(|device| {
            if at > device.last_used_at {
                device.last_used_at = at;
            }
            device.clone()
        }))
    }

    async fn revoke(&self, id: Uuid) -> Result<Option<Device>, OfflineError> {
        let mut devices = lock(&self.devices);
        Ok(devices.get_mut(&id).map(|device| {
            device.status = DeviceStatus::Revoked;
            device.clone()
        }))
    }
}

/// In-memory license store.
#[derive(Debug, Default)]
pub struct MemoryLicenseStore {
    licenses: Mutex<HashMap<Uuid, License>>,
}

impl MemoryLicenseStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of active records for a triple; the uniqueness rule keeps it at most 1.
    pub fn active_count(&self, user_id: Uuid, material_id: Uuid, device_id: Uuid) -> usize {
        lock(&self.licenses)
            .values()
            .filter(|l| {
                l.status == LicenseStatus::Active && l.is_bound_to(user_id, material_id, device_id)
            })
            .count()
    }

    fn revoke_where(&self, pred: impl Fn(&License) -> bool) -> Vec<License> {
        let mut licenses = lock(&self.licenses);
        licenses
            .values_mut()
            .filter(|l| l.status != LicenseStatus::Revoked && pred(l))
            .map(|l| {
                l.status = LicenseStatus::Revoked;
                l.clone()
            })
            .collect()
    }
}

#[async_trait]
impl LicenseStore for MemoryLicenseStore {
    async fn get(&self, id: Uuid) -> Result<Option<License>, OfflineError> {
        Ok(lock(&self.licenses).get(&id).cloned())
    }

    async fn insert_active(
        &self,
        license: License,
        now: DateTime<Utc>,
    ) -> Result<LicenseInsert, OfflineError> {
        let mut licenses = lock(&self.licenses);

        for existing in licenses.values_mut() {
            if existing.status != LicenseStatus::Active
                || !existing.is_bound_to(license.user_id, license.material_id, license.device_id)
            {
                continue;
            }
            if existing.is_hard_expired(now) {
                existing.status = LicenseStatus::Expired;
            } else {
                return Ok(LicenseInsert::Existing(existing.clone()));
            }
        }

        licenses.insert(license.id, license.clone());
        Ok(LicenseInsert::Inserted(license))
    }

    async fn rotate_nonce(
        &self,
        id: Uuid,
        expected_nonce: &str,
        new_nonce: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<License>, OfflineError> {
        let mut licenses = lock(&self.licenses);
        let Some(license) = licenses.get_mut(&id) else {
            return Ok(None);
        };
        if license.status != LicenseStatus::Active || license.nonce != expected_nonce {
            return Ok(None);
        }
        license.nonce = new_nonce.to_string();
        license.last_validated_at = Some(at);
        Ok(Some(license.clone()))
    }

    async fn renew(
        &self,
        id: Uuid,
        expires_at: DateTime<Utc>,
        new_nonce: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<License>, OfflineError> {
        let mut licenses = lock(&self.licenses);
        let Some(license) = licenses.get_mut(&id) else {
            return Ok(None);
        };
        if license.status != LicenseStatus::Active {
            return Ok(None);
        }
        license.expires_at = expires_at;
        license.nonce = new_nonce.to_string();
        license.last_validated_at = Some(at);
        Ok(Some(license.clone()))
    }

    async fn revoke(&self, id: Uuid) -> Result<Option<License>, OfflineError> {
        let mut licenses = lock(&self.licenses);
        Ok(licenses.get_mut(&id).map(|license| {
            license.status = LicenseStatus::Revoked;
            license.clone()
        }))
    }

    async fn revoke_by_material(&self, material_id: Uuid) -> Result<Vec<License>, OfflineError> {
        Ok(self.revoke_where(|l| l.material_id == material_id))
    }

    async fn revoke_by_device(&self, device_id: Uuid) -> Result<Vec<License>, OfflineError> {
        Ok(self.revoke_where(|l| l.device_id == device_id))
    }
}

/// In-memory job store and priority queue.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<Uuid, EncryptionJob>>,
}

impl MemoryJobStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of job records.
    pub fn len(&self) -> usize {
        lock(&self.jobs).len()
    }

    /// Whether no job has been recorded.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn get(&self, id: Uuid) -> Result<Option<EncryptionJob>, OfflineError> {
        Ok(lock(&self.jobs).get(&id).cloned())
    }

    async fn find_by_material(
        &self,
        material_id: Uuid,
    ) -> Result<Option<EncryptionJob>, OfflineError> {
        Ok(lock(&self.jobs)
            .values()
            .find(|j| j.material_id == material_id)
            .cloned())
    }

    async fn create_if_absent(
        &self,
        job: EncryptionJob,
    ) -> Result<(EncryptionJob, bool), OfflineError> {
        let mut jobs = lock(&self.jobs);
        if let Some(existing) = jobs.values().find(|j| j.material_id == job.material_id) {
            return Ok((existing.clone(), false));
        }
        jobs.insert(job.id, job.clone());
        Ok((job, true))
    }

    async fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<EncryptionJob>, OfflineError> {
        let mut jobs = lock(&self.jobs);
        let next = jobs
            .values()
            .filter(|j| j.is_claimable(now))
            .min_by_key(|j| (j.priority, j.created_at))
            .map(|j| j.id);

        Ok(next.and_then(|id| jobs.get_mut(&id)).map(|job| {
            job.status = JobStatus::Processing;
            job.started_at = Some(now);
            job.not_before = None;
            job.clone()
        }))
    }

    async fn update(&self, job: &EncryptionJob) -> Result<(), OfflineError> {
        let mut jobs = lock(&self.jobs);
        match jobs.get_mut(&job.id) {
            Some(slot) => {
                *slot = job.clone();
                Ok(())
            }
            None => Err(OfflineError::JobNotFound),
        }
    }

    async fn list_stale(&self, stale_before: DateTime<Utc>) -> Result<Vec<EncryptionJob>, OfflineError> {
        Ok(lock(&self.jobs)
            .values()
            .filter(|j| j.status == JobStatus::Processing && j.started_at.map_or(true, |t| t < stale_before))
            .cloned()
            .collect())
    }

    async fn update_leased(
        &self,
        job: &EncryptionJob,
        lease: DateTime<Utc>,
    ) -> Result<bool, OfflineError> {
        let mut jobs = lock(&self.jobs);
        let slot = jobs.get_mut(&job.id).ok_or(OfflineError::JobNotFound)?;
        if slot.status != JobStatus::Processing || slot.started_at != Some(lease) {
            return Ok(false);
        }
        *slot = job.clone();
        Ok(true)
    }

    async fn delete_completed_before(&self, cutoff: DateTime<Utc>) -> Result<usize, OfflineError> {
        let mut jobs = lock(&self.jobs);
        let before = jobs.len();
        jobs.retain(|_, j| {
            !(j.status == JobStatus::Completed && j.completed_at.is_some_and(|t| t < cutoff))
        });
        Ok(before - jobs.len())
    }
}

/// In-memory artifact metadata store.
#[derive(Debug, Default)]
pub struct MemoryArtifactStore {
    artifacts: Mutex<HashMap<Uuid, EncryptedArtifact>>,
}

impl MemoryArtifactStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn get(&self, material_id: Uuid) -> Result<Option<EncryptedArtifact>, OfflineError> {
        Ok(lock(&self.artifacts).get(&material_id).cloned())
    }

    async fn put(&self, artifact: EncryptedArtifact) -> Result<(), OfflineError> {
        lock(&self.artifacts).insert(artifact.material_id, artifact);
        Ok(())
    }

    async fn list_below_key_version(
        &self,
        version: u32,
    ) -> Result<Vec<EncryptedArtifact>, OfflineError> {
        Ok(lock(&self.artifacts)
            .values()
            .filter(|a| a.key_version < version)
            .cloned()
            .collect())
    }
}
