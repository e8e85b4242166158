//! Shared fixtures for integration tests.

#![allow(dead_code)]

use offline_warden::crypto::wrap::public_key_hex;
use offline_warden::store::{MemoryArtifactStore, MemoryJobStore, MemoryLicenseStore};
use offline_warden::{
    Clock, Collaborators, ContentKeyring, Device, DeviceRegistration, Enrollment,
    MaterialDirectory, MaterialInfo, MemoryAuditSink, MemoryEventPublisher, MemoryObjectStorage,
    ObjectStorage, OfflineConfig, OfflineService, RequestContext, ServiceSecrets, SystemClock,
};
use std::sync::Arc;
use uuid::Uuid;

/// Install a test-writer subscriber once; honours `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

pub fn secrets() -> ServiceSecrets {
    ServiceSecrets {
        request_signing_root: b"integration-test-request-signing-root".to_vec(),
        content_keys: ContentKeyring::new(1, [0x42; 32]),
        url_signing_seed: [0x17; 32],
    }
}

pub fn config() -> OfflineConfig {
    let mut config = OfflineConfig::default();
    config.download.chunk_size = 64;
    config
}

pub fn fingerprint(n: usize) -> String {
    format!("fp-{:0>36}", n)
}

/// secp256k1 private key of test device `n`; stays on the device.
pub fn device_secret(n: usize) -> [u8; 32] {
    [n as u8 + 1; 32]
}

pub fn registration(n: usize, platform: &str) -> DeviceRegistration {
    DeviceRegistration {
        fingerprint: fingerprint(n),
        name: format!("Device {}", n),
        platform: platform.to_string(),
        public_key: public_key_hex(&device_secret(n)).expect("device public key"),
    }
}

pub struct Harness {
    pub service: Arc<OfflineService>,
    pub directory: Arc<MaterialDirectory>,
    pub storage: Arc<MemoryObjectStorage>,
    pub licenses: Arc<MemoryLicenseStore>,
    pub jobs: Arc<MemoryJobStore>,
    pub artifacts: Arc<MemoryArtifactStore>,
    pub audit: Arc<MemoryAuditSink>,
    pub events: Arc<MemoryEventPublisher>,
    pub user: Uuid,
    pub container: Uuid,
}

impl Harness {
    pub fn new(cache_enabled: bool) -> Self {
        Self::build(config(), cache_enabled, Arc::new(SystemClock), |config, collaborators, _| {
            OfflineService::new(config, secrets(), collaborators)
        })
    }

    #[cfg(feature = "test-seams")]
    pub fn with_clock(clock: Arc<offline_warden::MockClock>, config: OfflineConfig) -> Self {
        Self::build(config, true, clock, |config, collaborators, clock| {
            OfflineService::new_with_clock(config, secrets(), collaborators, clock)
        })
    }

    fn build(
        config: OfflineConfig,
        cache_enabled: bool,
        clock: Arc<dyn Clock>,
        make: impl FnOnce(
            OfflineConfig,
            Collaborators,
            Arc<dyn Clock>,
        ) -> Result<OfflineService, offline_warden::OfflineError>,
    ) -> Self {
        init_tracing();

        let directory = Arc::new(MaterialDirectory::new());
        let storage = Arc::new(MemoryObjectStorage::new());
        let licenses = Arc::new(MemoryLicenseStore::new());
        let jobs = Arc::new(MemoryJobStore::new());
        let artifacts = Arc::new(MemoryArtifactStore::new());
        let audit = Arc::new(MemoryAuditSink::new());
        let events = Arc::new(MemoryEventPublisher::new());

        let mut collaborators = Collaborators::in_memory(directory.clone(), storage.clone(), clock.clone());
        collaborators.licenses = licenses.clone();
        collaborators.jobs = jobs.clone();
        collaborators.artifacts = artifacts.clone();
        collaborators.audit = audit.clone();
        collaborators.events = events.clone();
        collaborators.cache_enabled = cache_enabled;

        let service = Arc::new(make(config, collaborators, clock).expect("service"));

        let user = Uuid::new_v4();
        let container = Uuid::new_v4();
        directory.add_container(container, user, false);

        Self {
            service,
            directory,
            storage,
            licenses,
            jobs,
            artifacts,
            audit,
            events,
            user,
            container,
        }
    }

    pub fn ctx(&self) -> RequestContext {
        RequestContext::user(self.user).client("203.0.113.7", "offline-tests/1.0")
    }

    pub async fn enroll(&self, n: usize) -> Enrollment {
        self.service
            .register_device(&self.ctx(), registration(n, "desktop"))
            .await
            .expect("register device")
    }

    pub async fn register(&self, n: usize) -> Device {
        self.enroll(n).await.device
    }

    pub async fn add_material(&self, file_type: &str, body: &[u8]) -> Uuid {
        let id = Uuid::new_v4();
        let file_url = format!("materials/{}.{}", id, file_type);
        self.storage
            .put(&file_url, body.to_vec())
            .await
            .expect("store original");
        self.directory.add_material(MaterialInfo {
            id,
            container_id: self.container,
            title: format!("Material {}", id),
            file_type: file_type.to_string(),
            file_url,
            file_size: body.len() as u64,
        });
        id
    }
}
