//! Encryption pipeline: one job per material, processed by a worker pool.
//!
//! ```text
//! pending --claim--> processing --ok--> completed --re-key--> pending
//!    ^                   |
//!    +--- retry budget --+--exhausted--> failed --requeue--> pending
//! ```
//!
//! A claim is a lease. An attempt still `processing` after the lease timeout
//! (worker aborted, process crashed) is reclaimed and counted as a failed
//! attempt, and the stale attempt can no longer record an outcome.

pub mod storage;
pub mod worker;

use crate::clock::{to_chrono, Clock};
use crate::config::{DownloadPolicy, JobPolicy};
use crate::crypto::cipher::encrypt_chunked;
use crate::crypto::digest::sha256_hex;
use crate::crypto::keys::{generate_iv_seed, ContentKeyring};
use crate::events::{publish_quietly, EventPublisher, OfflineEvent, TracingEventPublisher};
use crate::metrics::OfflineMetrics;
use crate::policy::access::MaterialCatalog;
use crate::protocol::models::{EncryptedArtifact, EncryptionJob, JobOrigin, JobPriority, JobStatus};
use crate::store::{ArtifactStore, JobStore};
use crate::OfflineError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use uuid::Uuid;

pub use storage::{FileObjectStorage, MemoryObjectStorage, ObjectStorage};
pub use worker::WorkerPool;

/// Retry delay after `retry` previous failures: `min(base * 2^retry, max)`.
pub fn backoff_delay(retry: u32, base: Duration, max: Duration) -> Duration {
    let factor = 2u32.checked_pow(retry).unwrap_or(u32::MAX);
    base.checked_mul(factor).map_or(max, |d| d.min(max))
}

/// Object key of an encrypted artifact.
pub fn artifact_object_key(material_id: Uuid, artifact_id: Uuid) -> String {
    format!("encrypted/{}/{}.enc", material_id, artifact_id)
}

/// Encryption job coordinator.
pub struct EncryptionPipeline {
    jobs: Arc<dyn JobStore>,
    artifacts: Arc<dyn ArtifactStore>,
    catalog: Arc<dyn MaterialCatalog>,
    storage: Arc<dyn ObjectStorage>,
    clock: Arc<dyn Clock>,
    keys: ContentKeyring,
    download: DownloadPolicy,
    policy: JobPolicy,
    events: Arc<dyn EventPublisher>,
    metrics: Arc<OfflineMetrics>,
    wakeup: Notify,
}

impl EncryptionPipeline {
    /// Create a pipeline.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        jobs: Arc<dyn JobStore>,
        artifacts: Arc<dyn ArtifactStore>,
        catalog: Arc<dyn MaterialCatalog>,
        storage: Arc<dyn ObjectStorage>,
        clock: Arc<dyn Clock>,
        keys: ContentKeyring,
        download: DownloadPolicy,
        policy: JobPolicy,
    ) -> Self {
        Self {
            jobs,
            artifacts,
            catalog,
            storage,
            clock,
            keys,
            download,
            policy,
            events: Arc::new(TracingEventPublisher),
            metrics: Arc::new(OfflineMetrics::new()),
            wakeup: Notify::new(),
        }
    }

    /// Publish job transitions to `events` and count them in `metrics`.
    pub fn with_observers(mut self, events: Arc<dyn EventPublisher>, metrics: Arc<OfflineMetrics>) -> Self {
        self.events = events;
        self.metrics = metrics;
        self
    }

    /// Worker pool settings.
    pub fn policy(&self) -> &JobPolicy {
        &self.policy
    }

    /// Wait until new work is announced.
    pub(crate) async fn work_available(&self) {
        self.wakeup.notified().await;
    }

    /// Return the material's job, creating a pending one if it has none.
    ///
    /// Never waits for encryption. Concurrent callers for one material get
    /// the same job.
    pub async fn ensure_artifact(
        &self,
        material_id: Uuid,
        priority: JobPriority,
        origin: JobOrigin,
    ) -> Result<EncryptionJob, OfflineError> {
        if let Some(job) = self.jobs.find_by_material(material_id).await? {
            return Ok(job);
        }

        let candidate = EncryptionJob::pending(material_id, priority, origin, self.clock.now_utc());
        let (job, created) = self.jobs.create_if_absent(candidate).await?;
        if created {
            tracing::info!(job_id = %job.id, %material_id, priority = ?job.priority, "encryption job queued");
            self.announce(&job).await;
        }
        Ok(job)
    }

    async fn announce(&self, job: &EncryptionJob) {
        self.metrics.job_queued();
        publish_quietly(self.events.as_ref(), OfflineEvent::EncryptionRequested(job.into())).await;
        self.wakeup.notify_one();
    }

    /// Content key of a material under master key `version`.
    pub fn content_key(&self, version: u32, material_id: Uuid) -> Result<[u8; 32], OfflineError> {
        self.keys.content_key(version, material_id)
    }

    /// Queue re-encryption of a material under the current key version.
    ///
    /// A pending or running job is left alone. The existing artifact keeps
    /// being served until the new one is stored.
    pub async fn reencrypt(&self, material_id: Uuid) -> Result<EncryptionJob, OfflineError> {
        let Some(mut job) = self.jobs.find_by_material(material_id).await? else {
            return self
                .ensure_artifact(material_id, JobPriority::Low, JobOrigin::default())
                .await;
        };
        if !job.status.is_terminal() {
            return Ok(job);
        }

        job.status = JobStatus::Pending;
        job.priority = JobPriority::Low;
        job.retry_count = 0;
        job.error = None;
        job.not_before = None;
        job.started_at = None;
        job.completed_at = None;
        self.jobs.update(&job).await?;

        tracing::info!(job_id = %job.id, %material_id, key_version = self.keys.current_version(), "re-encryption queued");
        self.announce(&job).await;
        Ok(job)
    }

    /// Queue re-encryption of every artifact sealed under an older key
    /// version. Returns the jobs touched.
    pub async fn rotate_content_keys(&self) -> Result<Vec<EncryptionJob>, OfflineError> {
        let current = self.keys.current_version();
        let stale = self.artifacts.list_below_key_version(current).await?;
        let mut jobs = Vec::with_capacity(stale.len());
        for artifact in stale {
            jobs.push(self.reencrypt(artifact.material_id).await?);
        }
        tracing::info!(key_version = current, artifacts = jobs.len(), "content key rotation queued");
        Ok(jobs)
    }

    /// Delete completed jobs older than `older_than`; returns how many.
    ///
    /// Artifacts are kept and remain downloadable.
    pub async fn cleanup_completed(&self, older_than: Duration) -> Result<usize, OfflineError> {
        let cutoff = self.clock.now_utc() - to_chrono(older_than);
        let removed = self.jobs.delete_completed_before(cutoff).await?;
        tracing::info!(removed, %cutoff, "old encryption jobs removed");
        Ok(removed)
    }

    /// Load a job by id.
    pub async fn job(&self, job_id: Uuid) -> Result<EncryptionJob, OfflineError> {
        self.jobs.get(job_id).await?.ok_or(OfflineError::JobNotFound)
    }

    /// The material's job, if any.
    pub async fn job_for_material(&self, material_id: Uuid) -> Result<Option<EncryptionJob>, OfflineError> {
        self.jobs.find_by_material(material_id).await
    }

    /// Stored artifact metadata of a material.
    pub async fn artifact(&self, material_id: Uuid) -> Result<Option<EncryptedArtifact>, OfflineError> {
        self.artifacts.get(material_id).await
    }

    /// Put a failed job back in the queue with a fresh attempt budget.
    ///
    /// Jobs in any other state are returned unchanged.
    pub async fn requeue_failed(&self, job_id: Uuid) -> Result<EncryptionJob, OfflineError> {
        let mut job = self.job(job_id).await?;
        if job.status != JobStatus::Failed {
            return Ok(job);
        }

        job.status = JobStatus::Pending;
        job.retry_count = 0;
        job.error = None;
        job.not_before = None;
        job.started_at = None;
        self.jobs.update(&job).await?;

        tracing::info!(%job_id, material_id = %job.material_id, "failed job requeued");
        self.wakeup.notify_one();
        Ok(job)
    }

    /// Reclaim stale leases, then claim and process the next ready job.
    ///
    /// Returns the job in its post-attempt state, or `None` if the queue had
    /// nothing claimable.
    pub async fn process_next(&self) -> Result<Option<EncryptionJob>, OfflineError> {
        self.reclaim_stale().await?;
        let Some(job) = self.jobs.claim_next(self.clock.now_utc()).await? else {
            return Ok(None);
        };
        self.process_job(job).await.map(Some)
    }

    /// Count every attempt whose lease expired as failed. Returns the jobs
    /// reclaimed by this call.
    pub async fn reclaim_stale(&self) -> Result<Vec<EncryptionJob>, OfflineError> {
        let stale_before = self.clock.now_utc() - to_chrono(self.policy.lease_timeout);
        let mut reclaimed = Vec::new();
        for mut job in self.jobs.list_stale(stale_before).await? {
            let Some(lease) = job.started_at else {
                continue;
            };
            tracing::warn!(job_id = %job.id, material_id = %job.material_id, started_at = %lease, "encryption lease expired");
            self.record_failure(&mut job, "lease expired before the attempt finished");
            if self.jobs.update_leased(&job, lease).await? {
                self.after_failure(&job).await;
                reclaimed.push(job);
            }
        }
        Ok(reclaimed)
    }

    /// Apply a failed attempt to `job`: back off, or fail once the budget is
    /// spent.
    fn record_failure(&self, job: &mut EncryptionJob, error: &str) {
        let delay = backoff_delay(job.retry_count, self.policy.retry_base, self.policy.retry_max);
        job.retry_count += 1;
        job.error = Some(error.to_string());
        if job.retry_count < self.policy.max_attempts {
            job.status = JobStatus::Pending;
            job.not_before = Some(self.clock.now_utc() + to_chrono(delay));
            tracing::warn!(
                job_id = %job.id,
                retry_count = job.retry_count,
                delay_ms = delay.as_millis() as u64,
                error,
                "encryption attempt failed, retrying"
            );
        } else {
            job.status = JobStatus::Failed;
            job.completed_at = Some(self.clock.now_utc());
            tracing::error!(job_id = %job.id, retry_count = job.retry_count, error, "encryption failed");
        }
    }

    async fn after_failure(&self, job: &EncryptionJob) {
        if job.status == JobStatus::Failed {
            self.metrics.job_failed();
            publish_quietly(self.events.as_ref(), OfflineEvent::EncryptionFailed(job.into())).await;
        } else {
            self.wakeup.notify_one();
        }
    }

    /// Run one attempt of a claimed job and record the outcome.
    async fn process_job(&self, mut job: EncryptionJob) -> Result<EncryptionJob, OfflineError> {
        let Some(lease) = job.started_at else {
            return Err(OfflineError::Store(format!("job {} claimed without a start time", job.id)));
        };
        tracing::debug!(job_id = %job.id, material_id = %job.material_id, attempt = job.retry_count + 1, "encryption started");

        let outcome = self.encrypt_material(job.material_id).await;
        match &outcome {
            Ok(artifact) => {
                job.status = JobStatus::Completed;
                job.error = None;
                job.completed_at = Some(self.clock.now_utc());
                tracing::info!(
                    job_id = %job.id,
                    material_id = %job.material_id,
                    artifact_id = %artifact.id,
                    key_version = artifact.key_version,
                    chunks = artifact.chunks.len(),
                    "encryption completed"
                );
            }
            Err(e) => self.record_failure(&mut job, &e.to_string()),
        }

        if !self.jobs.update_leased(&job, lease).await? {
            tracing::warn!(job_id = %job.id, "lease lost, attempt outcome discarded");
            return self.job(job.id).await;
        }

        if outcome.is_ok() {
            self.metrics.job_succeeded();
            publish_quietly(self.events.as_ref(), OfflineEvent::EncryptionCompleted((&job).into())).await;
        } else {
            self.after_failure(&job).await;
        }
        Ok(job)
    }

    /// Fetch, encrypt and store one material.
    async fn encrypt_material(&self, material_id: Uuid) -> Result<EncryptedArtifact, OfflineError> {
        let info = self
            .catalog
            .get(material_id)
            .await?
            .ok_or(OfflineError::MaterialNotFound)?;

        let file_type = info.file_type.to_ascii_lowercase();
        if !self.download.supported_file_types.contains(&file_type) {
            return Err(OfflineError::UnsupportedFileType(file_type));
        }

        let original = self
            .storage
            .get(&info.file_url)
            .await?
            .ok_or_else(|| OfflineError::Storage(format!("original not found: {}", info.file_url)))?;

        let key_version = self.keys.current_version();
        let key = self.keys.content_key(key_version, material_id)?;
        let seed = generate_iv_seed();
        let chunk_size = self.download.chunk_size;
        let original_hash = sha256_hex(&original);
        let original_size = original.len() as u64;

        let payload = tokio::task::spawn_blocking(move || encrypt_chunked(&original, &key, chunk_size, &seed))
            .await
            .map_err(|e| OfflineError::Encryption(format!("encryption task failed: {}", e)))??;

        let artifact_id = Uuid::new_v4();
        let object_key = artifact_object_key(material_id, artifact_id);
        let artifact = EncryptedArtifact {
            id: artifact_id,
            material_id,
            object_key: object_key.clone(),
            file_type,
            original_size,
            total_size: payload.data.len() as u64,
            original_hash,
            encrypted_hash: sha256_hex(&payload.data),
            chunk_size: chunk_size as u64,
            chunks: payload.chunks,
            key_version,
            created_at: self.clock.now_utc(),
        };

        self.storage.put(&object_key, payload.data).await?;
        self.artifacts.put(artifact.clone()).await?;
        Ok(artifact)
    }
}
