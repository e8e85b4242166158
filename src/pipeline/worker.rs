//! Bounded pool of encryption workers.
//!
//! Workers run detached from any request. Each drains the queue, then sleeps
//! until a new job is announced or the poll interval elapses (retries with a
//! not-before time are picked up by polling).

use super::EncryptionPipeline;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Running worker pool.
pub struct WorkerPool {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
    pipeline: Arc<EncryptionPipeline>,
}

impl WorkerPool {
    /// Spawn `policy.workers` workers on the current runtime.
    pub fn start(pipeline: Arc<EncryptionPipeline>) -> Self {
        let (shutdown, rx) = watch::channel(false);
        let workers = pipeline.policy().workers.max(1);

        let handles = (0..workers)
            .map(|worker| tokio::spawn(run_worker(worker, pipeline.clone(), rx.clone())))
            .collect();

        tracing::info!(workers, "encryption worker pool started");
        Self {
            shutdown,
            handles,
            pipeline,
        }
    }

    /// Number of workers.
    pub fn size(&self) -> usize {
        self.handles.len()
    }

    /// Stop accepting work and wait for in-flight jobs.
    ///
    /// Workers still busy after the shutdown grace are aborted; their jobs
    /// stay `processing` until the lease times out and a later pool
    /// reclaims them.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let grace = self.pipeline.policy().shutdown_grace;
        let mut handles = self.handles;

        let drained = tokio::time::timeout(grace, async {
            for handle in handles.iter_mut() {
                if let Err(e) = handle.await {
                    tracing::warn!(error = %e, "encryption worker ended abnormally");
                }
            }
        })
        .await;

        if drained.is_err() {
            tracing::warn!(grace_secs = grace.as_secs(), "shutdown grace elapsed, aborting workers");
            for handle in &handles {
                handle.abort();
            }
        }
        tracing::info!("encryption worker pool stopped");
    }
}

async fn run_worker(worker: usize, pipeline: Arc<EncryptionPipeline>, mut shutdown: watch::Receiver<bool>) {
    let poll = pipeline.policy().poll_interval;
    loop {
        if *shutdown.borrow() {
            break;
        }

        match pipeline.process_next().await {
            Ok(Some(_)) => continue,
            Ok(None) => {}
            Err(e) => tracing::warn!(worker, error = %e, "job queue error"),
        }

        tokio::select! {
            _ = pipeline.work_available() => {}
            _ = tokio::time::sleep(poll) => {}
            _ = shutdown.changed() => {}
        }
    }
    tracing::debug!(worker, "encryption worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::config::OfflineConfig;
    use crate::crypto::keys::ContentKeyring;
    use crate::pipeline::{MemoryObjectStorage, ObjectStorage};
    use crate::OfflineError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use crate::policy::access::MaterialDirectory;
    use crate::protocol::models::{JobOrigin, JobPriority, JobStatus, MaterialInfo};
    use crate::store::{MemoryArtifactStore, MemoryJobStore};
    use std::time::Duration;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_pool_completes_queued_jobs_and_shuts_down() {
        let mut config = OfflineConfig::default();
        config.jobs.poll_interval = Duration::from_millis(20);
        config.jobs.shutdown_grace = Duration::from_secs(5);

        let storage = Arc::new(MemoryObjectStorage::new());
        let directory = Arc::new(MaterialDirectory::new());
        let pipeline = Arc::new(EncryptionPipeline::new(
            Arc::new(MemoryJobStore::new()),
            Arc::new(MemoryArtifactStore::new()),
            directory.clone(),
            storage.clone(),
            Arc::new(SystemClock),
            ContentKeyring::new(1, [3u8; 32]),
            config.download,
            config.jobs,
        ));

        let pool = WorkerPool::start(pipeline.clone());
        assert_eq!(pool.size(), 2);

        let mut materials = Vec::new();
        for n in 0..4 {
            let id = Uuid::new_v4();
            let file_url = format!("materials/{}.pdf", n);
            storage.put(&file_url, vec![n as u8; 100]).await.unwrap();
            directory.add_material(MaterialInfo {
                id,
                container_id: Uuid::new_v4(),
                title: format!("Doc {}", n),
                file_type: "pdf".to_string(),
                file_url,
                file_size: 100,
            });
            pipeline
                .ensure_artifact(id, JobPriority::Normal, JobOrigin::default())
                .await
                .unwrap();
            materials.push(id);
        }

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let mut done = 0;
            for id in &materials {
                if let Some(job) = pipeline.job_for_material(*id).await.unwrap() {
                    if job.status == JobStatus::Completed {
                        done += 1;
                    }
                }
            }
            if done == materials.len() {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "jobs did not complete");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        pool.shutdown().await;
    }

    /// Storage whose reads never finish while `hang` is set.
    #[derive(Default)]
    struct HangingStorage {
        inner: MemoryObjectStorage,
        hang: AtomicBool,
    }

    #[async_trait]
    impl ObjectStorage for HangingStorage {
        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, OfflineError> {
            if self.hang.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            self.inner.get(key).await
        }

        async fn put(&self, key: &str, data: Vec<u8>) -> Result<(), OfflineError> {
            self.inner.put(key, data).await
        }

        async fn exists(&self, key: &str) -> Result<bool, OfflineError> {
            self.inner.exists(key).await
        }
    }

    async fn wait_for_status(pipeline: &EncryptionPipeline, material: Uuid, status: JobStatus) -> u32 {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(job) = pipeline.job_for_material(material).await.unwrap() {
                if job.status == status {
                    return job.retry_count;
                }
            }
            assert!(tokio::time::Instant::now() < deadline, "job never reached {}", status);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_job_aborted_at_shutdown_is_finished_by_next_pool() {
        let mut config = OfflineConfig::default();
        config.jobs.workers = 1;
        config.jobs.poll_interval = Duration::from_millis(20);
        config.jobs.shutdown_grace = Duration::from_millis(50);
        config.jobs.lease_timeout = Duration::from_millis(100);
        config.jobs.retry_base = Duration::from_millis(10);

        let storage = Arc::new(HangingStorage::default());
        storage.hang.store(true, Ordering::SeqCst);
        let directory = Arc::new(MaterialDirectory::new());
        let pipeline = Arc::new(EncryptionPipeline::new(
            Arc::new(MemoryJobStore::new()),
            Arc::new(MemoryArtifactStore::new()),
            directory.clone(),
            storage.clone(),
            Arc::new(SystemClock),
            ContentKeyring::new(1, [3u8; 32]),
            config.download,
            config.jobs,
        ));

        let material = Uuid::new_v4();
        storage.inner.put("materials/slow.pdf", vec![1u8; 64]).await.unwrap();
        directory.add_material(MaterialInfo {
            id: material,
            container_id: Uuid::new_v4(),
            title: "Slow".to_string(),
            file_type: "pdf".to_string(),
            file_url: "materials/slow.pdf".to_string(),
            file_size: 64,
        });

        let pool = WorkerPool::start(pipeline.clone());
        pipeline
            .ensure_artifact(material, JobPriority::Normal, JobOrigin::default())
            .await
            .unwrap();
        wait_for_status(&pipeline, material, JobStatus::Processing).await;

        // The worker is stuck past the grace and gets aborted mid-job
        pool.shutdown().await;
        let stuck = pipeline.job_for_material(material).await.unwrap().unwrap();
        assert_eq!(stuck.status, JobStatus::Processing);

        storage.hang.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(150)).await;

        let pool = WorkerPool::start(pipeline.clone());
        let retries = wait_for_status(&pipeline, material, JobStatus::Completed).await;
        assert_eq!(retries, 1);
        assert!(pipeline.artifact(material).await.unwrap().is_some());
        pool.shutdown().await;
    }
}
