//! Asynchronous audit trail for security-relevant actions.
//!
//! Records are handed to a bounded channel with `try_send` and written by a
//! background task. A full channel or a failing sink drops the record with a
//! warning; neither ever reaches the request that produced it.

use crate::OfflineError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Audited action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    /// Device registration.
    DeviceRegister,
    /// Device deregistration.
    DeviceDeregister,
    /// License issuance.
    LicenseIssue,
    /// Offline license validation.
    LicenseValidate,
    /// License renewal.
    LicenseRenew,
    /// License revocation.
    LicenseRevoke,
    /// Download preparation.
    Download,
}

impl AuditAction {
    /// Wire name of the action.
    pub fn as_str(self) -> &'static str {
        match self {
            AuditAction::DeviceRegister => "device_register",
            AuditAction::DeviceDeregister => "device_deregister",
            AuditAction::LicenseIssue => "license_issue",
            AuditAction::LicenseValidate => "license_validate",
            AuditAction::LicenseRenew => "license_renew",
            AuditAction::LicenseRevoke => "license_revoke",
            AuditAction::Download => "download",
        }
    }

    /// Resource type the action applies to.
    pub fn resource_type(self) -> ResourceType {
        match self {
            AuditAction::DeviceRegister | AuditAction::DeviceDeregister => ResourceType::Device,
            AuditAction::LicenseIssue
            | AuditAction::LicenseValidate
            | AuditAction::LicenseRenew
            | AuditAction::LicenseRevoke => ResourceType::License,
            AuditAction::Download => ResourceType::Material,
        }
    }
}

/// Audited resource type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    /// A device.
    Device,
    /// A license.
    License,
    /// A material.
    Material,
}

/// One audit entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Acting user.
    pub user_id: Uuid,
    /// Device involved, if any.
    pub device_id: Option<Uuid>,
    /// What happened.
    pub action: AuditAction,
    /// Kind of resource acted on.
    pub resource_type: ResourceType,
    /// Resource id.
    pub resource_id: Option<Uuid>,
    /// Client address.
    pub ip: Option<String>,
    /// Client User-Agent.
    pub user_agent: Option<String>,
    /// Whether the action succeeded.
    pub success: bool,
    /// Error code on failure.
    pub error_code: Option<String>,
    /// Time of the action.
    pub created_at: DateTime<Utc>,
}

impl AuditRecord {
    /// Build a record for `action` from an operation outcome.
    pub fn from_outcome<T>(
        user_id: Uuid,
        device_id: Option<Uuid>,
        action: AuditAction,
        resource_id: Option<Uuid>,
        outcome: &Result<T, OfflineError>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            user_id,
            device_id,
            action,
            resource_type: action.resource_type(),
            resource_id,
            ip: None,
            user_agent: None,
            success: outcome.is_ok(),
            error_code: outcome.as_ref().err().map(|e| e.code().to_string()),
            created_at: now,
        }
    }

    /// Attach client address and User-Agent.
    pub fn with_client(mut self, ip: Option<String>, user_agent: Option<String>) -> Self {
        self.ip = ip;
        self.user_agent = user_agent;
        self
    }
}

/// Upper bound on records returned by one query.
pub const MAX_AUDIT_QUERY: usize = 1000;

/// Filter over a user's audit trail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditQuery {
    /// Whose records.
    pub user_id: Uuid,
    /// Only this device.
    pub device_id: Option<Uuid>,
    /// Only this action.
    pub action: Option<AuditAction>,
    /// Only records at or after this time.
    pub since: Option<DateTime<Utc>>,
    /// Maximum records, capped at [`MAX_AUDIT_QUERY`].
    pub limit: usize,
}

impl AuditQuery {
    /// Latest 100 records of a user.
    pub fn for_user(user_id: Uuid) -> Self {
        Self {
            user_id,
            device_id: None,
            action: None,
            since: None,
            limit: 100,
        }
    }

    /// Whether `record` passes the filter.
    pub fn matches(&self, record: &AuditRecord) -> bool {
        record.user_id == self.user_id
            && self.device_id.map_or(true, |d| record.device_id == Some(d))
            && self.action.map_or(true, |a| record.action == a)
            && self.since.map_or(true, |t| record.created_at >= t)
    }
}

/// Destination of audit records.
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Persist one record.
    async fn write(&self, record: AuditRecord) -> Result<(), OfflineError>;

    /// Records matching `query`, newest first.
    ///
    /// Write-only sinks return nothing.
    async fn query(&self, _query: &AuditQuery) -> Result<Vec<AuditRecord>, OfflineError> {
        Ok(Vec::new())
    }
}

/// Sink that emits records as `tracing` events on the `audit` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn write(&self, record: AuditRecord) -> Result<(), OfflineError> {
        tracing::info!(
            target: "audit",
            user_id = %record.user_id,
            device_id = ?record.device_id,
            action = record.action.as_str(),
            resource_id = ?record.resource_id,
            ip = ?record.ip,
            success = record.success,
            error_code = ?record.error_code,
            "audit"
        );
        Ok(())
    }
}

/// Sink that keeps records in memory.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditSink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records written so far.
    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn write(&self, record: AuditRecord) -> Result<(), OfflineError> {
        self.records
            .lock()
            .map_err(|_| OfflineError::Store("audit sink lock poisoned".to_string()))?
            .push(record);
        Ok(())
    }

    async fn query(&self, query: &AuditQuery) -> Result<Vec<AuditRecord>, OfflineError> {
        let records = self
            .records
            .lock()
            .map_err(|_| OfflineError::Store("audit sink lock poisoned".to_string()))?;
        Ok(records
            .iter()
            .rev()
            .filter(|r| query.matches(r))
            .take(query.limit.min(MAX_AUDIT_QUERY))
            .cloned()
            .collect())
    }
}

enum AuditMessage {
    Record(AuditRecord),
    Flush(oneshot::Sender<()>),
}

/// Non-blocking audit dispatcher.
pub struct AuditLogger {
    tx: mpsc::Sender<AuditMessage>,
    task: JoinHandle<()>,
}

impl AuditLogger {
    /// Start the dispatcher on the current runtime.
    pub fn start(sink: Arc<dyn AuditSink>, capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel(capacity.max(1));
        let task = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                match message {
                    AuditMessage::Record(record) => {
                        let action = record.action.as_str();
                        if let Err(e) = sink.write(record).await {
                            tracing::warn!(action, error = %e, "audit write failed");
                        }
                    }
                    AuditMessage::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
        });
        Self { tx, task }
    }

    /// Queue a record. Never blocks; drops the record if the queue is full.
    pub fn record(&self, record: AuditRecord) {
        if let Err(e) = self.tx.try_send(AuditMessage::Record(record)) {
            let reason = match e {
                mpsc::error::TrySendError::Full(_) => "queue full",
                mpsc::error::TrySendError::Closed(_) => "dispatcher stopped",
            };
            tracing::warn!(reason, "audit record dropped");
        }
    }

    /// Wait until every record queued before this call has been written.
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        if self.tx.send(AuditMessage::Flush(done)).await.is_ok() {
            let _ = wait.await;
        }
    }

    /// Drain the queue and stop the dispatcher.
    pub async fn shutdown(self) {
        drop(self.tx);
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "audit dispatcher ended abnormally");
        }
    }
}
