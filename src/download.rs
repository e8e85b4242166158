//! Download preparation: license gate, quota, artifact, signed URL.

use crate::clock::{to_chrono, Clock};
use crate::config::{DevicePolicy, DownloadPolicy};
use crate::crypto::signing::UrlSigner;
use crate::crypto::verify::constant_time_eq;
use crate::crypto::wrap::wrap_for_device;
use crate::license::LicenseEngine;
use crate::meter::{RateLimitStatus, RateLimiter};
use crate::pipeline::EncryptionPipeline;
use crate::policy::access::{require_access, MaterialAccessGate, MaterialCatalog};
use crate::protocol::models::{DownloadManifest, EncryptedArtifact, JobOrigin, JobPriority, JobStatus};
use crate::protocol::range::{parse_range_header, ResolvedRange};
use crate::protocol::validation::validate_fingerprint;
use crate::store::DeviceStore;
use crate::OfflineError;
use chrono::{DateTime, Utc};
use http::{HeaderMap, StatusCode};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

/// Parameters of a download request.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    /// Requesting user.
    pub user_id: Uuid,
    /// Material to download.
    pub material_id: Uuid,
    /// Requesting device.
    pub device_id: Uuid,
    /// Device fingerprint.
    pub fingerprint: String,
    /// License the download is made under.
    pub license_id: Uuid,
    /// Raw `Range` header, if sent.
    pub range: Option<String>,
}

/// A prepared download.
#[derive(Debug, Clone, Serialize)]
pub struct DownloadTicket {
    /// Chunk table and hashes.
    pub manifest: DownloadManifest,
    /// Signed fetch URL of the encrypted object.
    pub url: String,
    /// Content key of the artifact, ECIES-wrapped to the device (base64).
    pub wrapped_key: String,
    /// URL expiry.
    pub expires_at: DateTime<Utc>,
    /// Quota state after this download.
    #[serde(skip)]
    pub rate_limit: RateLimitStatus,
    /// Requested byte range, resolved against the encrypted object.
    #[serde(skip)]
    pub range: Option<ResolvedRange>,
    #[serde(skip)]
    issued_at: DateTime<Utc>,
}

impl DownloadTicket {
    /// 206 for a range request, 200 otherwise.
    pub fn status(&self) -> StatusCode {
        if self.range.is_some() {
            StatusCode::PARTIAL_CONTENT
        } else {
            StatusCode::OK
        }
    }

    /// Rate-limit headers plus range framing when a range was requested.
    pub fn headers(&self) -> HeaderMap {
        let mut headers = self.rate_limit.headers(self.issued_at);
        if let Some(range) = &self.range {
            range.apply_headers(&mut headers);
        }
        headers
    }
}

/// Download preparation service.
pub struct DownloadService {
    licenses: Arc<LicenseEngine>,
    devices: Arc<dyn DeviceStore>,
    gate: Arc<dyn MaterialAccessGate>,
    catalog: Arc<dyn MaterialCatalog>,
    pipeline: Arc<EncryptionPipeline>,
    limiter: Arc<RateLimiter>,
    signer: UrlSigner,
    clock: Arc<dyn Clock>,
    policy: DownloadPolicy,
    device_policy: DevicePolicy,
}

impl DownloadService {
    /// Create a download service.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        licenses: Arc<LicenseEngine>,
        devices: Arc<dyn DeviceStore>,
        gate: Arc<dyn MaterialAccessGate>,
        catalog: Arc<dyn MaterialCatalog>,
        pipeline: Arc<EncryptionPipeline>,
        limiter: Arc<RateLimiter>,
        signer: UrlSigner,
        clock: Arc<dyn Clock>,
        policy: DownloadPolicy,
        device_policy: DevicePolicy,
    ) -> Self {
        Self {
            licenses,
            devices,
            gate,
            catalog,
            pipeline,
            limiter,
            signer,
            clock,
            policy,
            device_policy,
        }
    }

    /// Hex verifying key of the URL signer, for the object host.
    pub fn url_public_key_hex(&self) -> String {
        self.signer.public_key_hex()
    }

    /// Prepare a download.
    ///
    /// Quota is only consumed once the artifact is ready and a URL is about
    /// to be minted, so polling while encryption runs is free.
    ///
    /// # Errors
    /// * `InvalidFingerprint`, `InvalidRange` - Bad request
    /// * `LicenseInvalid` - License missing, not bound to the triple, expired or revoked
    /// * `DeviceNotFound`, `FingerprintMismatch` - Device check failed
    /// * `AccessDenied` - Access gate refused
    /// * `RateLimited` - Quota exhausted
    /// * `MaterialNotFound`, `UnsupportedFileType` - Material cannot be packaged
    /// * `ArtifactNotReady` - No artifact yet and encryption pending or
    ///   running; retry later
    /// * `ArtifactFailed` - No artifact and encryption exhausted its retries
    /// * `InvalidPublicKey` - The device has no usable public key
    pub async fn prepare_download(&self, request: &DownloadRequest) -> Result<DownloadTicket, OfflineError> {
        validate_fingerprint(&request.fingerprint, &self.device_policy)?;
        let range = request.range.as_deref().map(parse_range_header).transpose()?;

        // 1. License usable for the triple
        let license = self
            .licenses
            .check_download(
                request.user_id,
                request.material_id,
                request.device_id,
                request.license_id,
            )
            .await?;

        // 2. Device active, owned and presenting its fingerprint
        let device = match self.devices.get(request.device_id).await? {
            Some(d) if d.user_id == request.user_id && d.is_active() => d,
            _ => return Err(OfflineError::DeviceNotFound),
        };
        if !constant_time_eq(device.fingerprint.as_bytes(), request.fingerprint.as_bytes()) {
            return Err(OfflineError::FingerprintMismatch);
        }

        // 3. Access still granted
        require_access(self.gate.as_ref(), request.user_id, request.material_id).await?;

        // 4. Quota (read-only)
        let now = self.clock.now_utc();
        let quota = self.limiter.check_download_limit(request.user_id).await;
        if !quota.allowed {
            tracing::info!(user_id = %request.user_id, "download refused by quota");
            return Err(quota.to_error(now));
        }

        // 5. Material can be packaged
        let info = self
            .catalog
            .get(request.material_id)
            .await?
            .ok_or(OfflineError::MaterialNotFound)?;
        let file_type = info.file_type.to_ascii_lowercase();
        if !self.policy.supported_file_types.contains(&file_type) {
            return Err(OfflineError::UnsupportedFileType(file_type));
        }

        // 6. Artifact ready. A stored artifact is served even while a
        // re-encryption job for the material is queued or running.
        let origin = JobOrigin {
            user_id: Some(request.user_id),
            device_id: Some(request.device_id),
            license_id: Some(license.id),
        };
        let artifact = match self.pipeline.artifact(request.material_id).await? {
            Some(artifact) => artifact,
            None => self.artifact_from_job(request.material_id, origin).await?,
        };

        let range = range.map(|r| r.resolve(artifact.total_size)).transpose()?;
        let content_key = self
            .pipeline
            .content_key(artifact.key_version, request.material_id)?;
        let wrapped_key = wrap_for_device(&content_key, &device.public_key)?;

        // 7. Consume quota, then mint the URL
        let rate_limit = self
            .limiter
            .acquire_download(request.user_id, request.material_id)
            .await?;
        let signed = self
            .signer
            .sign(&artifact.object_key, now + to_chrono(self.policy.url_ttl));

        if let Err(e) = self.devices.touch(device.id, now).await {
            tracing::warn!(device_id = %device.id, error = %e, "failed to refresh device last_used_at");
        }

        tracing::info!(
            user_id = %request.user_id,
            material_id = %request.material_id,
            license_id = %license.id,
            partial = range.is_some(),
            "download prepared"
        );

        Ok(DownloadTicket {
            manifest: DownloadManifest::from_artifact(&artifact, license.id, now),
            url: signed.url,
            wrapped_key,
            expires_at: signed.expires_at,
            rate_limit,
            range,
            issued_at: now,
        })
    }

    /// Queue or look up the material's encryption job; the artifact once it
    /// has completed.
    async fn artifact_from_job(&self, material_id: Uuid, origin: JobOrigin) -> Result<EncryptedArtifact, OfflineError> {
        let job = self
            .pipeline
            .ensure_artifact(material_id, JobPriority::Normal, origin)
            .await?;
        match job.status {
            JobStatus::Completed => {}
            JobStatus::Failed => {
                return Err(OfflineError::ArtifactFailed {
                    job_id: job.id,
                    reason: job.error.unwrap_or_default(),
                })
            }
            status => {
                return Err(OfflineError::ArtifactNotReady {
                    job_id: job.id,
                    status,
                })
            }
        }
        self.pipeline.artifact(material_id).await?.ok_or_else(|| {
            OfflineError::Storage(format!("job {} completed without artifact metadata", job.id))
        })
    }
}
