//! License engine: issuance, offline validation, renewal and revocation.
//!
//! States:
//! ```text
//! active --(now > expires_at + grace)--> expired   (computed, not stored)
//! active --(revoke / device cascade)---> revoked
//! active --(validate / renew)----------> active
//! ```
//! `expired` and `revoked` are terminal.

use crate::clock::{to_chrono, Clock};
use crate::config::{DevicePolicy, LicensePolicy};
use crate::crypto::keys::generate_nonce;
use crate::crypto::verify::constant_time_eq;
use crate::meter::RateLimiter;
use crate::policy::access::{require_access, MaterialAccessGate};
use crate::protocol::models::{Device, License, LicenseStatus};
use crate::protocol::validation::{validate_fingerprint, validate_nonce};
use crate::store::{DeviceStore, LicenseInsert, LicenseStore};
use crate::OfflineError;
use std::sync::Arc;
use uuid::Uuid;

/// Outcome of an issuance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Issued {
    /// The active license for the triple.
    pub license: License,
    /// False when an existing active license was returned.
    pub created: bool,
}

/// License lifecycle engine.
pub struct LicenseEngine {
    licenses: Arc<dyn LicenseStore>,
    devices: Arc<dyn DeviceStore>,
    gate: Arc<dyn MaterialAccessGate>,
    limiter: Arc<RateLimiter>,
    clock: Arc<dyn Clock>,
    policy: LicensePolicy,
    device_policy: DevicePolicy,
}

impl LicenseEngine {
    /// Create an engine.
    pub fn new(
        licenses: Arc<dyn LicenseStore>,
        devices: Arc<dyn DeviceStore>,
        gate: Arc<dyn MaterialAccessGate>,
        limiter: Arc<RateLimiter>,
        clock: Arc<dyn Clock>,
        policy: LicensePolicy,
        device_policy: DevicePolicy,
    ) -> Self {
        Self {
            licenses,
            devices,
            gate,
            limiter,
            clock,
            policy,
            device_policy,
        }
    }

    /// Load a device the user owns and that is active.
    async fn owned_active_device(&self, user_id: Uuid, device_id: Uuid) -> Result<Device, OfflineError> {
        match self.devices.get(device_id).await? {
            Some(d) if d.user_id == user_id && d.is_active() => Ok(d),
            _ => Err(OfflineError::DeviceNotFound),
        }
    }

    /// Load a license the user holds.
    async fn owned_license(&self, user_id: Uuid, license_id: Uuid) -> Result<License, OfflineError> {
        match self.licenses.get(license_id).await? {
            Some(l) if l.user_id == user_id => Ok(l),
            _ => Err(OfflineError::LicenseNotFound),
        }
    }

    /// Like `owned_license`, read from the durable store. Used by every
    /// check that authorizes something.
    async fn owned_current_license(&self, user_id: Uuid, license_id: Uuid) -> Result<License, OfflineError> {
        match self.licenses.get_current(license_id).await? {
            Some(l) if l.user_id == user_id => Ok(l),
            _ => Err(OfflineError::LicenseNotFound),
        }
    }

    async fn touch_device(&self, device_id: Uuid) {
        if let Err(e) = self.devices.touch(device_id, self.clock.now_utc()).await {
            tracing::warn!(%device_id, error = %e, "failed to refresh device last_used_at");
        }
    }

    /// Issue a license for (user, material, device).
    ///
    /// Returns the existing active license when one is already usable for the
    /// triple; concurrent calls converge on one record.
    ///
    /// # Errors
    /// * `InvalidFingerprint` - Fingerprint length out of bounds
    /// * `DeviceNotFound` - Device missing, revoked or owned by another user
    /// * `FingerprintMismatch` - Fingerprint differs from the stored one
    /// * `AccessDenied` - Material access gate refused
    pub async fn issue(
        &self,
        user_id: Uuid,
        material_id: Uuid,
        device_id: Uuid,
        fingerprint: &str,
    ) -> Result<Issued, OfflineError> {
        validate_fingerprint(fingerprint, &self.device_policy)?;

        // 1. Device belongs to the user and is active
        let device = self.owned_active_device(user_id, device_id).await?;

        // 2. Fingerprint matches
        if !constant_time_eq(device.fingerprint.as_bytes(), fingerprint.as_bytes()) {
            return Err(OfflineError::FingerprintMismatch);
        }

        // 3. Content service grants access
        require_access(self.gate.as_ref(), user_id, material_id).await?;

        // 4. Conditional insert
        let now = self.clock.now_utc();
        let candidate = License {
            id: Uuid::new_v4(),
            user_id,
            material_id,
            device_id,
            status: LicenseStatus::Active,
            expires_at: now + to_chrono(self.policy.validity),
            offline_grace_seconds: to_chrono(self.policy.offline_grace).num_seconds(),
            last_validated_at: None,
            nonce: generate_nonce(),
            created_at: now,
        };

        let issued = match self.licenses.insert_active(candidate, now).await? {
            LicenseInsert::Inserted(license) => {
                tracing::info!(
                    license_id = %license.id,
                    %user_id,
                    %material_id,
                    %device_id,
                    expires_at = %license.expires_at,
                    "license issued"
                );
                Issued {
                    license,
                    created: true,
                }
            }
            LicenseInsert::Existing(license) => Issued {
                license,
                created: false,
            },
        };

        self.touch_device(device_id).await;
        Ok(issued)
    }

    /// Validate a license for offline use and rotate its nonce.
    ///
    /// Checks, in order: exists and not revoked; inside grace; device not
    /// blocked; fingerprint; nonce. Fingerprint and nonce mismatches count
    /// toward the device's lockout.
    ///
    /// # Errors
    /// * `LicenseNotFound`, `LicenseRevoked`, `LicenseExpired`
    /// * `DeviceBlocked` - Device is locked out
    /// * `FingerprintMismatch`, `NonceMismatch` - Possible cloned license
    pub async fn validate(
        &self,
        user_id: Uuid,
        license_id: Uuid,
        fingerprint: &str,
        nonce: &str,
    ) -> Result<License, OfflineError> {
        validate_fingerprint(fingerprint, &self.device_policy)?;
        validate_nonce(nonce, &self.policy)?;

        let now = self.clock.now_utc();

        // 1. Exists and not revoked
        let license = self.owned_current_license(user_id, license_id).await?;
        if license.status == LicenseStatus::Revoked {
            return Err(OfflineError::LicenseRevoked);
        }

        // 2. Inside expiry + grace
        license.check_usable(now)?;

        // 3. Device not blocked
        if self.limiter.is_device_blocked(license.device_id).await {
            tracing::warn!(%license_id, device_id = %license.device_id, "validation from blocked device");
            return Err(OfflineError::DeviceBlocked);
        }

        // A license never outlives its device
        let device = match self.devices.get(license.device_id).await? {
            Some(d) if d.is_active() => d,
            _ => return Err(OfflineError::LicenseRevoked),
        };

        // 4. Fingerprint
        if !constant_time_eq(device.fingerprint.as_bytes(), fingerprint.as_bytes()) {
            let failures = self.limiter.record_validation_failure(device.id).await;
            tracing::warn!(%license_id, device_id = %device.id, failures, "fingerprint mismatch");
            return Err(OfflineError::FingerprintMismatch);
        }

        // 5. Nonce
        if !constant_time_eq(license.nonce.as_bytes(), nonce.as_bytes()) {
            let failures = self.limiter.record_validation_failure(device.id).await;
            tracing::warn!(%license_id, device_id = %device.id, failures, "nonce mismatch");
            return Err(OfflineError::NonceMismatch);
        }

        // Rotate only from the nonce we just checked
        let rotated = self
            .licenses
            .rotate_nonce(license_id, nonce, &generate_nonce(), now)
            .await?;
        let Some(updated) = rotated else {
            return match self.licenses.get_current(license_id).await? {
                Some(l) if l.status != LicenseStatus::Active => Err(OfflineError::LicenseRevoked),
                _ => {
                    self.limiter.record_validation_failure(device.id).await;
                    tracing::warn!(%license_id, "nonce consumed by a concurrent validation");
                    Err(OfflineError::NonceMismatch)
                }
            };
        };

        self.limiter.reset_validation_failures(device.id).await;
        self.touch_device(device.id).await;
        tracing::debug!(%license_id, "license validated");
        Ok(updated)
    }

    /// Extend a license from now.
    ///
    /// Does not require the current nonce, but rotates it.
    ///
    /// # Errors
    /// * `LicenseNotFound` - Missing or held by another user
    /// * `LicenseRevoked`, `LicenseExpired` - Terminal states
    /// * `LicenseInvalid` - Device is not the one the license is bound to
    /// * `DeviceNotFound` - Device missing or revoked
    /// * `FingerprintMismatch` - Fingerprint differs from the stored one
    pub async fn renew(
        &self,
        user_id: Uuid,
        license_id: Uuid,
        device_id: Uuid,
        fingerprint: &str,
    ) -> Result<License, OfflineError> {
        validate_fingerprint(fingerprint, &self.device_policy)?;
        let now = self.clock.now_utc();

        let license = self.owned_current_license(user_id, license_id).await?;
        license.check_usable(now)?;

        if license.device_id != device_id {
            return Err(OfflineError::LicenseInvalid(
                "license is bound to another device".to_string(),
            ));
        }

        let device = self.owned_active_device(user_id, device_id).await?;
        if !constant_time_eq(device.fingerprint.as_bytes(), fingerprint.as_bytes()) {
            return Err(OfflineError::FingerprintMismatch);
        }

        let expires_at = now + to_chrono(self.policy.validity);
        let renewed = self
            .licenses
            .renew(license_id, expires_at, &generate_nonce(), now)
            .await?
            .ok_or(OfflineError::LicenseRevoked)?;

        self.touch_device(device_id).await;
        tracing::info!(%license_id, expires_at = %renewed.expires_at, "license renewed");
        Ok(renewed)
    }

    /// Check a license authorizes a download for (user, material, device).
    ///
    /// This is the usability check only; it neither rotates the nonce nor
    /// touches the lockout counters.
    ///
    /// # Errors
    /// `LicenseInvalid` with the reason.
    pub async fn check_download(
        &self,
        user_id: Uuid,
        material_id: Uuid,
        device_id: Uuid,
        license_id: Uuid,
    ) -> Result<License, OfflineError> {
        let license = self
            .licenses
            .get_current(license_id)
            .await?
            .ok_or_else(|| OfflineError::LicenseInvalid("license not found".to_string()))?;

        if !license.is_bound_to(user_id, material_id, device_id) {
            return Err(OfflineError::LicenseInvalid(
                "license does not match user, material and device".to_string(),
            ));
        }

        license
            .check_usable(self.clock.now_utc())
            .map_err(|e| OfflineError::LicenseInvalid(e.to_string()))?;

        Ok(license)
    }

    /// Load a license the user holds. May be served from cache.
    pub async fn get(&self, user_id: Uuid, license_id: Uuid) -> Result<License, OfflineError> {
        self.owned_license(user_id, license_id).await
    }

    /// Revoke one license. Idempotent.
    ///
    /// # Errors
    /// `LicenseNotFound` if the license does not exist.
    pub async fn revoke(&self, license_id: Uuid) -> Result<License, OfflineError> {
        let license = self
            .licenses
            .revoke(license_id)
            .await?
            .ok_or(OfflineError::LicenseNotFound)?;
        tracing::info!(%license_id, "license revoked");
        Ok(license)
    }

    /// Revoke every license of a material. Idempotent.
    pub async fn revoke_by_material(&self, material_id: Uuid) -> Result<Vec<License>, OfflineError> {
        let revoked = self.licenses.revoke_by_material(material_id).await?;
        tracing::info!(%material_id, count = revoked.len(), "licenses revoked for material");
        Ok(revoked)
    }

    /// Revoke every license bound to a device. Idempotent.
    pub async fn revoke_by_device(&self, device_id: Uuid) -> Result<Vec<License>, OfflineError> {
        let revoked = self.licenses.revoke_by_device(device_id).await?;
        tracing::info!(%device_id, count = revoked.len(), "licenses revoked for device");
        Ok(revoked)
    }
}
