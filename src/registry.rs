//! Device registry: registration, listing and deregistration.

use crate::clock::Clock;
use crate::config::DevicePolicy;
use crate::crypto::wrap::parse_public_key;
use crate::license::LicenseEngine;
use crate::protocol::models::{Device, DeviceStatus, License, Platform};
use crate::protocol::validation::{validate_device_name, validate_fingerprint};
use crate::store::{DeviceInsert, DeviceStore};
use crate::OfflineError;
use std::sync::Arc;
use uuid::Uuid;

/// Registration request.
#[derive(Debug, Clone)]
pub struct DeviceRegistration {
    /// Client-computed device fingerprint.
    pub fingerprint: String,
    /// Display name; sanitized before storage.
    pub name: String,
    /// Platform string: "ios", "android" or "desktop".
    pub platform: String,
    /// Hex uncompressed secp256k1 public key generated on the device.
    pub public_key: String,
}

/// A registered device and its request-signing key, wrapped to the device.
#[derive(Debug, Clone)]
pub struct Enrollment {
    /// The device.
    pub device: Device,
    /// Base64 ECIES envelope holding the device's request-signing key.
    pub wrapped_request_key: String,
}

/// Result of deregistering a device.
#[derive(Debug, Clone)]
pub struct Deregistered {
    /// The device, now revoked.
    pub device: Device,
    /// Licenses revoked with it.
    pub revoked_licenses: Vec<License>,
}

/// Device registry.
pub struct DeviceRegistry {
    devices: Arc<dyn DeviceStore>,
    licenses: Arc<LicenseEngine>,
    clock: Arc<dyn Clock>,
    policy: DevicePolicy,
}

impl DeviceRegistry {
    /// Create a registry.
    pub fn new(
        devices: Arc<dyn DeviceStore>,
        licenses: Arc<LicenseEngine>,
        clock: Arc<dyn Clock>,
        policy: DevicePolicy,
    ) -> Self {
        Self {
            devices,
            licenses,
            clock,
            policy,
        }
    }

    /// Register a device for a user.
    ///
    /// Re-registering an active fingerprint with the same platform and
    /// public key returns the existing device; anything else is rejected.
    ///
    /// # Errors
    /// * `InvalidFingerprint`, `InvalidInput`, `InvalidPlatform`,
    ///   `InvalidPublicKey` - Bad request
    /// * `DeviceLimitExceeded` - User already holds the maximum active devices
    /// * `DuplicateFingerprint` - Fingerprint active under another platform
    ///   or key
    pub async fn register(
        &self,
        user_id: Uuid,
        registration: DeviceRegistration,
    ) -> Result<Device, OfflineError> {
        validate_fingerprint(&registration.fingerprint, &self.policy)?;
        let name = validate_device_name(&registration.name, &self.policy)?;
        let platform: Platform = registration.platform.parse()?;
        let public_key = hex::encode(parse_public_key(&registration.public_key)?);

        let now = self.clock.now_utc();
        let candidate = Device {
            id: Uuid::new_v4(),
            user_id,
            fingerprint: registration.fingerprint,
            name,
            platform,
            public_key: public_key.clone(),
            status: DeviceStatus::Active,
            last_used_at: now,
            created_at: now,
        };

        match self
            .devices
            .insert_capped(candidate, self.policy.max_active_per_user)
            .await?
        {
            DeviceInsert::Inserted(device) => {
                tracing::info!(device_id = %device.id, %user_id, platform = ?device.platform, "device registered");
                Ok(device)
            }
            DeviceInsert::Existing(mut device) => {
                if device.platform != platform || device.public_key != public_key {
                    tracing::warn!(device_id = %device.id, %user_id, "fingerprint re-registered with another platform or key");
                    return Err(OfflineError::DuplicateFingerprint);
                }
                self.devices.touch(device.id, now).await?;
                device.last_used_at = now;
                Ok(device)
            }
            DeviceInsert::LimitReached => Err(OfflineError::DeviceLimitExceeded {
                max: self.policy.max_active_per_user,
            }),
        }
    }

    /// Active devices of a user, most recently used first.
    pub async fn list(&self, user_id: Uuid) -> Result<Vec<Device>, OfflineError> {
        self.devices.list_active(user_id).await
    }

    /// Load an active device owned by the user.
    ///
    /// # Errors
    /// * `DeviceNotFound` - Missing or revoked
    /// * `DeviceForbidden` - Owned by another user
    pub async fn get_owned(&self, user_id: Uuid, device_id: Uuid) -> Result<Device, OfflineError> {
        let device = self
            .devices
            .get(device_id)
            .await?
            .filter(Device::is_active)
            .ok_or(OfflineError::DeviceNotFound)?;
        if device.user_id != user_id {
            return Err(OfflineError::DeviceForbidden);
        }
        Ok(device)
    }

    /// Deregister a device and revoke every license bound to it.
    ///
    /// Licenses go first, so a failure part-way leaves the device active
    /// with nothing usable bound to it rather than the reverse.
    ///
    /// # Errors
    /// * `DeviceNotFound` - Missing or already revoked
    /// * `DeviceForbidden` - Owned by another user
    pub async fn deregister(&self, user_id: Uuid, device_id: Uuid) -> Result<Deregistered, OfflineError> {
        self.get_owned(user_id, device_id).await?;

        let revoked_licenses = self.licenses.revoke_by_device(device_id).await?;
        let device = self
            .devices
            .revoke(device_id)
            .await?
            .ok_or(OfflineError::DeviceNotFound)?;

        tracing::info!(
            %device_id,
            %user_id,
            licenses = revoked_licenses.len(),
            "device deregistered"
        );
        Ok(Deregistered {
            device,
            revoked_licenses,
        })
    }

    /// Refresh a device's `last_used_at`. Failures are logged, not returned.
    pub async fn touch(&self, device_id: Uuid) {
        if let Err(e) = self.devices.touch(device_id, self.clock.now_utc()).await {
            tracing::warn!(%device_id, error = %e, "failed to refresh device last_used_at");
        }
    }
}
