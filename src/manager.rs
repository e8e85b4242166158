//! Offline service - the public API of the subsystem.
//!
//! `OfflineService` wires the registry, license engine, download service,
//! request guard and audit logger together and exposes the REST-shaped
//! operations a host HTTP layer maps its routes onto:
//!
//! | Operation | Route |
//! |---|---|
//! | [`register_device`](OfflineService::register_device) | POST /devices |
//! | [`list_devices`](OfflineService::list_devices) | GET /devices |
//! | [`deregister_device`](OfflineService::deregister_device) | DELETE /devices/{id} |
//! | [`issue_license`](OfflineService::issue_license) | POST /materials/{id}/license |
//! | [`validate_license`](OfflineService::validate_license) | POST /licenses/{id}/validate |
//! | [`renew_license`](OfflineService::renew_license) | POST /licenses/{id}/renew |
//! | [`download_material`](OfflineService::download_material) | GET /materials/{id}/download |
//! | [`revoke_license`](OfflineService::revoke_license) | DELETE /licenses/{id} |
//! | [`audit_logs`](OfflineService::audit_logs) | GET /audit-logs |
//!
//! Every operation runs under the configured request deadline. Successful
//! state changes are published as [`OfflineEvent`]s and every audited
//! outcome is counted in [`OfflineMetrics`].

use crate::audit::{AuditAction, AuditLogger, AuditQuery, AuditRecord, AuditSink, TracingAuditSink};
use crate::cache::kv::{KeyValueStore, MemoryKv};
use crate::cache::layer::{CacheLayer, CachedDeviceStore, CachedLicenseStore};
use crate::clock::{Clock, SystemClock};
use crate::config::{OfflineConfig, ServiceSecrets};
use crate::crypto::signing::UrlSigner;
use crate::download::{DownloadRequest, DownloadService, DownloadTicket};
use crate::events::{
    publish_quietly, DownloadEvent, EventPublisher, OfflineEvent, TracingEventPublisher,
};
use crate::guard::{RequestGuard, SignedRequest};
use crate::license::{Issued, LicenseEngine};
use crate::meter::RateLimiter;
use crate::metrics::OfflineMetrics;
use crate::pipeline::{EncryptionPipeline, ObjectStorage, WorkerPool};
use crate::policy::access::{MaterialAccessGate, MaterialCatalog, MaterialDirectory};
use crate::protocol::models::{Device, EncryptionJob, License};
use crate::registry::{DeviceRegistration, DeviceRegistry, Deregistered, Enrollment};
use crate::store::{
    ArtifactStore, DeviceStore, JobStore, LicenseStore, MemoryArtifactStore, MemoryDeviceStore,
    MemoryJobStore, MemoryLicenseStore,
};
use crate::OfflineError;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// External dependencies of the service.
#[derive(Clone)]
pub struct Collaborators {
    /// Durable device records.
    pub devices: Arc<dyn DeviceStore>,
    /// Durable license records.
    pub licenses: Arc<dyn LicenseStore>,
    /// Durable encryption jobs.
    pub jobs: Arc<dyn JobStore>,
    /// Durable artifact metadata.
    pub artifacts: Arc<dyn ArtifactStore>,
    /// Shared key-value store for cache, counters and replay nonces.
    pub kv: Arc<dyn KeyValueStore>,
    /// Material access decisions.
    pub gate: Arc<dyn MaterialAccessGate>,
    /// Material metadata.
    pub catalog: Arc<dyn MaterialCatalog>,
    /// Original files and encrypted artifacts.
    pub storage: Arc<dyn ObjectStorage>,
    /// Audit destination.
    pub audit: Arc<dyn AuditSink>,
    /// Domain event destination.
    pub events: Arc<dyn EventPublisher>,
    /// Put the read-through cache in front of device and license stores.
    pub cache_enabled: bool,
}

impl Collaborators {
    /// In-memory stores around a material directory and object storage.
    pub fn in_memory(
        directory: Arc<MaterialDirectory>,
        storage: Arc<dyn ObjectStorage>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            devices: Arc::new(MemoryDeviceStore::new()),
            licenses: Arc::new(MemoryLicenseStore::new()),
            jobs: Arc::new(MemoryJobStore::new()),
            artifacts: Arc::new(MemoryArtifactStore::new()),
            kv: Arc::new(MemoryKv::new(clock)),
            gate: directory.clone(),
            catalog: directory,
            storage,
            audit: Arc::new(TracingAuditSink),
            events: Arc::new(TracingEventPublisher),
            cache_enabled: true,
        }
    }
}

/// Caller context of one request, as extracted by the host HTTP layer.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// Authenticated user; `None` means the caller is not authenticated.
    pub user_id: Option<Uuid>,
    /// Device id header.
    pub device_id: Option<Uuid>,
    /// Client address.
    pub ip: Option<String>,
    /// Client User-Agent.
    pub user_agent: Option<String>,
    /// HTTP method.
    pub method: String,
    /// Path including query string.
    pub path: String,
    /// Raw body.
    pub body: Vec<u8>,
    /// `timestamp:nonce:signature` header, if sent.
    pub signature: Option<String>,
}

impl RequestContext {
    /// Context for an authenticated user.
    pub fn user(user_id: Uuid) -> Self {
        Self {
            user_id: Some(user_id),
            ..Self::default()
        }
    }

    /// Attach the signed parts of the request.
    pub fn signed(
        mut self,
        method: impl Into<String>,
        path: impl Into<String>,
        body: Vec<u8>,
        device_id: Uuid,
        signature: impl Into<String>,
    ) -> Self {
        self.method = method.into();
        self.path = path.into();
        self.body = body;
        self.device_id = Some(device_id);
        self.signature = Some(signature.into());
        self
    }

    /// Attach client address and User-Agent.
    pub fn client(mut self, ip: impl Into<String>, user_agent: impl Into<String>) -> Self {
        self.ip = Some(ip.into());
        self.user_agent = Some(user_agent.into());
        self
    }

    fn authenticated_user(&self) -> Result<Uuid, OfflineError> {
        self.user_id.ok_or(OfflineError::Unauthorized)
    }

    fn signed_request(&self) -> SignedRequest<'_> {
        SignedRequest {
            method: &self.method,
            path: &self.path,
            body: &self.body,
            device_id: self.device_id,
            signature: self.signature.as_deref(),
        }
    }
}

/// Query of a download request.
#[derive(Debug, Clone)]
pub struct DownloadParams {
    /// Material to download.
    pub material_id: Uuid,
    /// Requesting device.
    pub device_id: Uuid,
    /// Device fingerprint.
    pub fingerprint: String,
    /// License the download is made under.
    pub license_id: Uuid,
    /// `Range` header, if sent.
    pub range: Option<String>,
}

/// Offline license and download service.
///
/// Create one per process and share it; it is `Send + Sync`.
pub struct OfflineService {
    config: OfflineConfig,
    clock: Arc<dyn Clock>,
    registry: DeviceRegistry,
    licenses: Arc<LicenseEngine>,
    downloads: DownloadService,
    pipeline: Arc<EncryptionPipeline>,
    limiter: Arc<RateLimiter>,
    guard: RequestGuard,
    audit: AuditLogger,
    audit_sink: Arc<dyn AuditSink>,
    events: Arc<dyn EventPublisher>,
    metrics: Arc<OfflineMetrics>,
}

impl OfflineService {
    /// Create the service with the system clock.
    ///
    /// Must be called from within a tokio runtime; the audit dispatcher is
    /// spawned on it.
    ///
    /// # Errors
    /// `Config` if configuration or secrets are invalid, or no runtime is
    /// running.
    pub fn new(
        config: OfflineConfig,
        secrets: ServiceSecrets,
        collaborators: Collaborators,
    ) -> Result<Self, OfflineError> {
        Self::with_clock(config, secrets, collaborators, Arc::new(SystemClock))
    }

    /// Create the service with an injected clock.
    #[cfg(any(test, feature = "test-seams"))]
    pub fn new_with_clock(
        config: OfflineConfig,
        secrets: ServiceSecrets,
        collaborators: Collaborators,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, OfflineError> {
        Self::with_clock(config, secrets, collaborators, clock)
    }

    fn with_clock(
        config: OfflineConfig,
        secrets: ServiceSecrets,
        collaborators: Collaborators,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, OfflineError> {
        config.validate()?;
        secrets.validate()?;
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(OfflineError::Config(
                "OfflineService must be created inside a tokio runtime".to_string(),
            ));
        }

        let Collaborators {
            devices,
            licenses,
            jobs,
            artifacts,
            kv,
            gate,
            catalog,
            storage,
            audit,
            events,
            cache_enabled,
        } = collaborators;
        let metrics = Arc::new(OfflineMetrics::new());

        let (devices, licenses): (Arc<dyn DeviceStore>, Arc<dyn LicenseStore>) = if cache_enabled {
            (
                Arc::new(CachedDeviceStore::new(
                    devices,
                    CacheLayer::new(kv.clone(), clock.clone()),
                    config.cache.clone(),
                )),
                Arc::new(CachedLicenseStore::new(
                    licenses,
                    CacheLayer::new(kv.clone(), clock.clone()),
                    config.cache.clone(),
                )),
            )
        } else {
            (devices, licenses)
        };

        let limiter = Arc::new(RateLimiter::new(
            kv.clone(),
            clock.clone(),
            config.rate_limits.clone(),
        ));

        let engine = Arc::new(LicenseEngine::new(
            licenses,
            devices.clone(),
            gate.clone(),
            limiter.clone(),
            clock.clone(),
            config.license.clone(),
            config.devices.clone(),
        ));

        let registry = DeviceRegistry::new(
            devices.clone(),
            engine.clone(),
            clock.clone(),
            config.devices.clone(),
        );

        let pipeline = Arc::new(
            EncryptionPipeline::new(
                jobs,
                artifacts,
                catalog.clone(),
                storage,
                clock.clone(),
                secrets.content_keys.clone(),
                config.download.clone(),
                config.jobs.clone(),
            )
            .with_observers(events.clone(), metrics.clone()),
        );

        let downloads = DownloadService::new(
            engine.clone(),
            devices,
            gate,
            catalog,
            pipeline.clone(),
            limiter.clone(),
            UrlSigner::new(&secrets.url_signing_seed, config.download.object_base_url.clone()),
            clock.clone(),
            config.download.clone(),
            config.devices.clone(),
        );

        let guard = RequestGuard::new(
            kv,
            clock.clone(),
            secrets.request_signing_root.clone(),
            config.integrity.clone(),
        );

        let audit_sink = audit;
        let audit = AuditLogger::start(audit_sink.clone(), config.audit_buffer);

        tracing::info!(cache_enabled, workers = config.jobs.workers, "offline service ready");

        Ok(Self {
            config,
            clock,
            registry,
            licenses: engine,
            downloads,
            pipeline,
            limiter,
            guard,
            audit,
            audit_sink,
            events,
            metrics,
        })
    }

    /// Current configuration.
    pub fn config(&self) -> &OfflineConfig {
        &self.config
    }

    /// Operation counters; render with [`OfflineMetrics::prometheus`].
    pub fn metrics(&self) -> &OfflineMetrics {
        &self.metrics
    }

    /// Hex verifying key download URLs are signed with.
    pub fn url_public_key_hex(&self) -> String {
        self.downloads.url_public_key_hex()
    }

    async fn bounded<T>(&self, work: impl Future<Output = Result<T, OfflineError>>) -> Result<T, OfflineError> {
        match tokio::time::timeout(self.config.request_timeout, work).await {
            Ok(outcome) => outcome,
            Err(_) => Err(OfflineError::DeadlineExceeded),
        }
    }

    fn record<T>(
        &self,
        ctx: &RequestContext,
        user_id: Uuid,
        device_id: Option<Uuid>,
        action: AuditAction,
        resource_id: Option<Uuid>,
        outcome: &Result<T, OfflineError>,
    ) {
        let record = AuditRecord::from_outcome(
            user_id,
            device_id,
            action,
            resource_id,
            outcome,
            self.clock.now_utc(),
        )
        .with_client(ctx.ip.clone(), ctx.user_agent.clone());
        self.audit.record(record);
        self.metrics.observe(action, outcome);
    }

    async fn publish(&self, event: OfflineEvent) {
        publish_quietly(self.events.as_ref(), event).await;
    }

    async fn publish_revoked(&self, revoked: &[License]) {
        self.metrics.licenses_revoked(revoked.len());
        for license in revoked {
            self.publish(OfflineEvent::LicenseRevoked(license.into())).await;
        }
    }

    /// POST /devices
    ///
    /// Returns the device with its request-signing key wrapped to the
    /// registered public key.
    pub async fn register_device(
        &self,
        ctx: &RequestContext,
        registration: DeviceRegistration,
    ) -> Result<Enrollment, OfflineError> {
        let user_id = ctx.authenticated_user()?;
        let outcome = self
            .bounded(async {
                self.guard.verify(&ctx.signed_request()).await?;
                let device = self.registry.register(user_id, registration).await?;
                let wrapped_request_key = self.guard.wrapped_request_key(&device)?;
                Ok(Enrollment {
                    device,
                    wrapped_request_key,
                })
            })
            .await;
        let device_id = outcome.as_ref().ok().map(|e| e.device.id);
        self.record(ctx, user_id, device_id, AuditAction::DeviceRegister, device_id, &outcome);
        if let Ok(enrollment) = &outcome {
            self.publish(OfflineEvent::DeviceRegistered((&enrollment.device).into())).await;
        }
        outcome
    }

    /// GET /devices
    pub async fn list_devices(&self, ctx: &RequestContext) -> Result<Vec<Device>, OfflineError> {
        let user_id = ctx.authenticated_user()?;
        self.bounded(self.registry.list(user_id)).await
    }

    /// DELETE /devices/{id}
    pub async fn deregister_device(
        &self,
        ctx: &RequestContext,
        device_id: Uuid,
    ) -> Result<Deregistered, OfflineError> {
        let user_id = ctx.authenticated_user()?;
        let outcome = self
            .bounded(async {
                self.guard.verify(&ctx.signed_request()).await?;
                self.registry.deregister(user_id, device_id).await
            })
            .await;
        self.record(
            ctx,
            user_id,
            Some(device_id),
            AuditAction::DeviceDeregister,
            Some(device_id),
            &outcome,
        );
        if let Ok(gone) = &outcome {
            self.publish(OfflineEvent::DeviceDeregistered((&gone.device).into())).await;
            self.publish_revoked(&gone.revoked_licenses).await;
        }
        outcome
    }

    /// POST /materials/{id}/license
    pub async fn issue_license(
        &self,
        ctx: &RequestContext,
        material_id: Uuid,
        device_id: Uuid,
        fingerprint: &str,
    ) -> Result<Issued, OfflineError> {
        let user_id = ctx.authenticated_user()?;
        let outcome = self
            .bounded(async {
                self.guard.verify(&ctx.signed_request()).await?;
                self.licenses
                    .issue(user_id, material_id, device_id, fingerprint)
                    .await
            })
            .await;
        let license_id = outcome.as_ref().ok().map(|i| i.license.id);
        self.record(ctx, user_id, Some(device_id), AuditAction::LicenseIssue, license_id, &outcome);
        if let Ok(issued) = &outcome {
            if issued.created {
                self.publish(OfflineEvent::LicenseIssued((&issued.license).into())).await;
            }
        }
        outcome
    }

    /// POST /licenses/{id}/validate
    pub async fn validate_license(
        &self,
        ctx: &RequestContext,
        license_id: Uuid,
        fingerprint: &str,
        nonce: &str,
    ) -> Result<License, OfflineError> {
        let user_id = ctx.authenticated_user()?;
        let outcome = self
            .bounded(async {
                self.guard.verify(&ctx.signed_request()).await?;
                self.licenses
                    .validate(user_id, license_id, fingerprint, nonce)
                    .await
            })
            .await;
        let device_id = outcome.as_ref().ok().map(|l| l.device_id).or(ctx.device_id);
        self.record(ctx, user_id, device_id, AuditAction::LicenseValidate, Some(license_id), &outcome);
        if let Ok(license) = &outcome {
            self.publish(OfflineEvent::LicenseValidated(license.into())).await;
        }
        outcome
    }

    /// POST /licenses/{id}/renew
    pub async fn renew_license(
        &self,
        ctx: &RequestContext,
        license_id: Uuid,
        device_id: Uuid,
        fingerprint: &str,
    ) -> Result<License, OfflineError> {
        let user_id = ctx.authenticated_user()?;
        let outcome = self
            .bounded(async {
                self.guard.verify(&ctx.signed_request()).await?;
                self.licenses
                    .renew(user_id, license_id, device_id, fingerprint)
                    .await
            })
            .await;
        self.record(ctx, user_id, Some(device_id), AuditAction::LicenseRenew, Some(license_id), &outcome);
        if let Ok(license) = &outcome {
            self.publish(OfflineEvent::LicenseRenewed(license.into())).await;
        }
        outcome
    }

    /// GET /materials/{id}/download
    pub async fn download_material(
        &self,
        ctx: &RequestContext,
        params: DownloadParams,
    ) -> Result<DownloadTicket, OfflineError> {
        let user_id = ctx.authenticated_user()?;
        let (material_id, device_id) = (params.material_id, params.device_id);
        let request = DownloadRequest {
            user_id,
            material_id,
            device_id,
            fingerprint: params.fingerprint,
            license_id: params.license_id,
            range: params.range,
        };
        let outcome = self
            .bounded(async {
                self.guard.verify(&ctx.signed_request()).await?;
                self.downloads.prepare_download(&request).await
            })
            .await;
        self.record(ctx, user_id, Some(device_id), AuditAction::Download, Some(material_id), &outcome);
        if let Ok(ticket) = &outcome {
            self.publish(OfflineEvent::MaterialDownloaded(DownloadEvent {
                user_id,
                material_id,
                device_id,
                license_id: ticket.manifest.license_id,
            }))
            .await;
        }
        outcome
    }

    /// DELETE /licenses/{id}
    ///
    /// Revokes one of the caller's own licenses. Idempotent.
    ///
    /// # Errors
    /// `LicenseNotFound` if the license is missing or held by another user.
    pub async fn revoke_license(&self, ctx: &RequestContext, license_id: Uuid) -> Result<License, OfflineError> {
        let user_id = ctx.authenticated_user()?;
        let outcome = self
            .bounded(async {
                self.guard.verify(&ctx.signed_request()).await?;
                self.licenses.get(user_id, license_id).await?;
                self.licenses.revoke(license_id).await
            })
            .await;
        let device_id = outcome.as_ref().ok().map(|l| l.device_id);
        self.record(ctx, user_id, device_id, AuditAction::LicenseRevoke, Some(license_id), &outcome);
        if let Ok(license) = &outcome {
            self.publish(OfflineEvent::LicenseRevoked(license.into())).await;
        }
        outcome
    }

    /// Revoke every license of a material, e.g. after it is deleted
    /// (operator).
    pub async fn revoke_material_licenses(&self, material_id: Uuid) -> Result<Vec<License>, OfflineError> {
        let revoked = self.bounded(self.licenses.revoke_by_material(material_id)).await?;
        self.publish_revoked(&revoked).await;
        Ok(revoked)
    }

    /// GET /audit-logs
    ///
    /// The caller's own audit trail, newest first. `query.user_id` is
    /// replaced by the caller.
    pub async fn audit_logs(
        &self,
        ctx: &RequestContext,
        mut query: AuditQuery,
    ) -> Result<Vec<AuditRecord>, OfflineError> {
        query.user_id = ctx.authenticated_user()?;
        self.bounded(self.audit_sink.query(&query)).await
    }

    /// Block a device for `duration` (operator).
    pub async fn block_device(&self, device_id: Uuid, duration: Duration) -> Result<(), OfflineError> {
        self.limiter.block_device(device_id, duration).await
    }

    /// Lift a device block and clear its failure counter (operator).
    pub async fn unblock_device(&self, device_id: Uuid) -> Result<(), OfflineError> {
        self.limiter.unblock_device(device_id).await
    }

    /// Look up an encryption job.
    pub async fn job(&self, job_id: Uuid) -> Result<EncryptionJob, OfflineError> {
        self.pipeline.job(job_id).await
    }

    /// The encryption job of a material, if any.
    pub async fn job_for_material(&self, material_id: Uuid) -> Result<Option<EncryptionJob>, OfflineError> {
        self.pipeline.job_for_material(material_id).await
    }

    /// Requeue a failed encryption job (operator).
    pub async fn requeue_job(&self, job_id: Uuid) -> Result<EncryptionJob, OfflineError> {
        self.pipeline.requeue_failed(job_id).await
    }

    /// Delete completed jobs finished more than `older_than` ago (operator).
    pub async fn cleanup_jobs(&self, older_than: Duration) -> Result<usize, OfflineError> {
        self.pipeline.cleanup_completed(older_than).await
    }

    /// Re-encrypt artifacts sealed under retired content keys (operator).
    ///
    /// Old artifacts stay downloadable until their replacement is stored.
    pub async fn rotate_content_keys(&self) -> Result<Vec<EncryptionJob>, OfflineError> {
        self.pipeline.rotate_content_keys().await
    }

    /// Start the background encryption workers.
    pub fn start_workers(&self) -> WorkerPool {
        WorkerPool::start(self.pipeline.clone())
    }

    /// Process ready jobs on the calling task until none is claimable.
    ///
    /// Returns the number of attempts made. For embedders without a worker
    /// pool and for tests.
    pub async fn run_pending_jobs(&self) -> Result<usize, OfflineError> {
        let mut attempts = 0;
        while self.pipeline.process_next().await?.is_some() {
            attempts += 1;
        }
        Ok(attempts)
    }

    /// Wait until queued audit records are written.
    pub async fn flush_audit(&self) {
        self.audit.flush().await;
    }

    /// Drain the audit queue and stop the dispatcher.
    pub async fn shutdown(self) {
        self.audit.shutdown().await;
        tracing::info!("offline service stopped");
    }
}
