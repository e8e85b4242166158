//! Domain events published after state changes.
//!
//! Events are notifications for other services (search indexing, analytics,
//! notification fan-out). They are published after the change is durable;
//! a failing publisher is logged and never fails the operation.

use crate::protocol::models::{Device, EncryptionJob, License};
use crate::OfflineError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use uuid::Uuid;

/// License lifecycle payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LicenseEvent {
    /// License id.
    pub license_id: Uuid,
    /// Holder.
    pub user_id: Uuid,
    /// Licensed material.
    pub material_id: Uuid,
    /// Bound device.
    pub device_id: Uuid,
}

impl From<&License> for LicenseEvent {
    fn from(license: &License) -> Self {
        Self {
            license_id: license.id,
            user_id: license.user_id,
            material_id: license.material_id,
            device_id: license.device_id,
        }
    }
}

/// Device lifecycle payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceEvent {
    /// Device id.
    pub device_id: Uuid,
    /// Owner.
    pub user_id: Uuid,
    /// Platform wire name.
    pub platform: String,
}

impl From<&Device> for DeviceEvent {
    fn from(device: &Device) -> Self {
        let platform = serde_json::to_value(device.platform)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        Self {
            device_id: device.id,
            user_id: device.user_id,
            platform,
        }
    }
}

/// Encryption job payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobEvent {
    /// Job id.
    pub job_id: Uuid,
    /// Material being encrypted.
    pub material_id: Uuid,
    /// Requesting user.
    pub user_id: Option<Uuid>,
    /// Requesting device.
    pub device_id: Option<Uuid>,
    /// License the request was made under.
    pub license_id: Option<Uuid>,
    /// Failure message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&EncryptionJob> for JobEvent {
    fn from(job: &EncryptionJob) -> Self {
        Self {
            job_id: job.id,
            material_id: job.material_id,
            user_id: job.user_id,
            device_id: job.device_id,
            license_id: job.license_id,
            error: job.error.clone(),
        }
    }
}

/// Download payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadEvent {
    /// Downloading user.
    pub user_id: Uuid,
    /// Material.
    pub material_id: Uuid,
    /// Device.
    pub device_id: Uuid,
    /// License the download was made under.
    pub license_id: Uuid,
}

/// Event published by the subsystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum OfflineEvent {
    /// A new license was stored.
    LicenseIssued(LicenseEvent),
    /// An offline validation succeeded and rotated the nonce.
    LicenseValidated(LicenseEvent),
    /// A license was extended.
    LicenseRenewed(LicenseEvent),
    /// A license was revoked, directly or by cascade.
    LicenseRevoked(LicenseEvent),
    /// A device was registered.
    DeviceRegistered(DeviceEvent),
    /// A device was deregistered.
    DeviceDeregistered(DeviceEvent),
    /// An encryption job was queued.
    EncryptionRequested(JobEvent),
    /// An encryption job stored its artifact.
    EncryptionCompleted(JobEvent),
    /// An encryption job exhausted its retries.
    EncryptionFailed(JobEvent),
    /// A download URL was issued.
    MaterialDownloaded(DownloadEvent),
}

impl OfflineEvent {
    /// Message bus subject of the event.
    pub fn subject(&self) -> &'static str {
        match self {
            OfflineEvent::LicenseIssued(_) => "offline.license.issued",
            OfflineEvent::LicenseValidated(_) => "offline.license.validated",
            OfflineEvent::LicenseRenewed(_) => "offline.license.renewed",
            OfflineEvent::LicenseRevoked(_) => "offline.license.revoked",
            OfflineEvent::DeviceRegistered(_) => "offline.device.registered",
            OfflineEvent::DeviceDeregistered(_) => "offline.device.deregistered",
            OfflineEvent::EncryptionRequested(_) => "offline.encryption.requested",
            OfflineEvent::EncryptionCompleted(_) => "offline.encryption.completed",
            OfflineEvent::EncryptionFailed(_) => "offline.encryption.failed",
            OfflineEvent::MaterialDownloaded(_) => "offline.material.downloaded",
        }
    }
}

/// Destination of domain events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish one event.
    async fn publish(&self, event: &OfflineEvent) -> Result<(), OfflineError>;
}

/// Publish and log a failure instead of returning it.
pub async fn publish_quietly(publisher: &dyn EventPublisher, event: OfflineEvent) {
    if let Err(e) = publisher.publish(&event).await {
        tracing::warn!(subject = event.subject(), error = %e, "event publish failed");
    }
}

/// Publisher that emits events as `tracing` events on the `events` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventPublisher;

#[async_trait]
impl EventPublisher for TracingEventPublisher {
    async fn publish(&self, event: &OfflineEvent) -> Result<(), OfflineError> {
        let payload = serde_json::to_string(event)
            .map_err(|e| OfflineError::Protocol(format!("event encode failed: {}", e)))?;
        tracing::debug!(target: "events", subject = event.subject(), %payload, "event");
        Ok(())
    }
}

/// Publisher that keeps events in memory.
#[derive(Debug, Default)]
pub struct MemoryEventPublisher {
    events: Mutex<Vec<OfflineEvent>>,
}

impl MemoryEventPublisher {
    /// Create an empty publisher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Events published so far.
    pub fn events(&self) -> Vec<OfflineEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Subjects published so far, in order.
    pub fn subjects(&self) -> Vec<&'static str> {
        self.events().iter().map(OfflineEvent::subject).collect()
    }
}

#[async_trait]
impl EventPublisher for MemoryEventPublisher {
    async fn publish(&self, event: &OfflineEvent) -> Result<(), OfflineError> {
        self.events
            .lock()
            .map_err(|_| OfflineError::Store("event publisher lock poisoned".to_string()))?
            .push(event.clone());
        Ok(())
    }
}
