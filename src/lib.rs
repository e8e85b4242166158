//! # offline-warden
//!
//! **Offline licensing and encrypted downloads for learning materials.**
//!
//! offline-warden lets a user take course materials onto a trusted device
//! and use them without a network connection, while keeping the service in
//! control of who may read what and for how long.
//!
//! ## Features
//!
//! - **Device registry**: at most 5 trusted devices per user, identified by fingerprint
//! - **Offline licenses**: bound to (user, material, device), 30-day validity plus a 72-hour offline grace
//! - **Nonce rotation**: every offline validation rotates the license nonce, so a copied license goes stale
//! - **Device lockout**: repeated validation failures block the device for the window
//! - **Encrypted artifacts**: AES-256-GCM in 1 MiB chunks, produced once per material by a worker pool
//! - **Signed downloads**: Ed25519-signed, short-lived object URLs with HTTP Range framing
//! - **Key delivery**: content and request-signing keys reach devices ECIES-wrapped to their registered public key
//! - **Key rotation**: versioned content master keys; old artifacts are re-encrypted in the background
//! - **Signed requests**: optional HMAC request signatures with anti-replay nonces
//! - **Audit trail**: non-blocking audit records for every security-relevant action, queryable per user
//! - **Events and metrics**: domain events after each state change, Prometheus-style counters
//!
//! ## Quickstart
//!
//! ```no_run
//! use offline_warden::{
//!     Collaborators, ContentKeyring, DeviceRegistration, MaterialDirectory, MemoryObjectStorage,
//!     OfflineConfig, OfflineService, RequestContext, ServiceSecrets, SystemClock,
//! };
//! use std::sync::Arc;
//! use uuid::Uuid;
//!
//! # async fn run() -> Result<(), offline_warden::OfflineError> {
//! let secrets = ServiceSecrets {
//!     request_signing_root: vec![0x5a; 32],
//!     content_keys: ContentKeyring::new(1, [0x42; 32]),
//!     url_signing_seed: [0x17; 32],
//! };
//! let collaborators = Collaborators::in_memory(
//!     Arc::new(MaterialDirectory::new()),
//!     Arc::new(MemoryObjectStorage::new()),
//!     Arc::new(SystemClock),
//! );
//! let service = OfflineService::new(OfflineConfig::default(), secrets, collaborators)?;
//! let workers = service.start_workers();
//!
//! let ctx = RequestContext::user(Uuid::new_v4());
//! # let device_public_key = String::new();
//! let enrollment = service
//!     .register_device(
//!         &ctx,
//!         DeviceRegistration {
//!             fingerprint: "c0ffee".repeat(8),
//!             name: "Study tablet".to_string(),
//!             platform: "android".to_string(),
//!             public_key: device_public_key,
//!         },
//!     )
//!     .await?;
//! println!("registered {}", enrollment.device.id);
//!
//! workers.shutdown().await;
//! service.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Threat Model
//!
//! offline-warden protects against:
//! - **License copying**: a cloned license loses the nonce race after the next validation
//! - **Credential probing**: wrong fingerprints or nonces lock the device out
//! - **Request replay**: signed requests are single-use within a 5-minute window
//! - **URL sharing**: download URLs expire after one hour, and the content key only unwraps on the licensed device
//!
//! It does **not** protect decrypted content on a compromised device.
//!
//! ## Collaborators
//!
//! Durable stores, the shared key-value store, the content service and object
//! storage are traits ([`DeviceStore`], [`LicenseStore`], [`JobStore`],
//! [`ArtifactStore`], [`KeyValueStore`], [`MaterialAccessGate`],
//! [`MaterialCatalog`], [`ObjectStorage`]). In-memory implementations ship
//! with the crate; [`ContentServiceClient`] talks to a content service over
//! HTTP.

#![deny(missing_docs)]

// Core modules
pub mod clock;
pub mod config;
pub mod errors;

// Crypto layer
pub mod crypto;

// Protocol layer
pub mod protocol;

// Persistence and cache layers
pub mod cache;
pub mod store;

// Metering layer
pub mod meter;

// Policy and client layers
pub mod client;
pub mod policy;

// Services
pub mod audit;
pub mod download;
pub mod events;
pub mod guard;
pub mod license;
pub mod pipeline;
pub mod registry;

// Observability
pub mod metrics;

// Facade (main public API)
pub mod manager;

// Re-exports for public API
pub use audit::{
    AuditAction, AuditQuery, AuditRecord, AuditSink, MemoryAuditSink, TracingAuditSink,
};
pub use cache::{KeyValueStore, MemoryKv};
pub use client::ContentServiceClient;
pub use clock::{Clock, SystemClock};
pub use config::{ContentServiceConfig, OfflineConfig, ServiceSecrets};
pub use crypto::keys::ContentKeyring;
pub use download::DownloadTicket;
pub use errors::{ErrorKind, OfflineError};
pub use events::{EventPublisher, MemoryEventPublisher, OfflineEvent, TracingEventPublisher};
pub use license::Issued;
pub use manager::{Collaborators, DownloadParams, OfflineService, RequestContext};
pub use metrics::{MetricsSnapshot, OfflineMetrics};
pub use pipeline::{FileObjectStorage, MemoryObjectStorage, ObjectStorage, WorkerPool};
pub use policy::{MaterialAccessGate, MaterialCatalog, MaterialDirectory};
pub use protocol::models::{
    Device, DeviceStatus, DownloadManifest, EncryptionJob, JobStatus, License, LicenseStatus,
    MaterialInfo, Platform,
};
pub use registry::{DeviceRegistration, Deregistered, Enrollment};
pub use store::{ArtifactStore, DeviceStore, JobStore, LicenseStore};

#[cfg(any(test, feature = "test-seams"))]
pub use clock::MockClock;
