//! Read-through cache decorators over the durable stores.
//!
//! The cache is a derived view. Every write goes to the inner store first and
//! then invalidates the affected keys; values only enter the cache through a
//! read-through fill. Each key has a revision counter that invalidation bumps,
//! and a fill is stamped with the revision seen before the inner read, so a
//! fill that raced a write is never served. Cache failures are logged and
//! treated as a miss, never surfaced. Wiring the inner store directly in place
//! of a decorator changes latency, not behavior.

use super::format::{device_key, license_key, revision_key, user_devices_key, CacheRecord};
use super::kv::KeyValueStore;
use crate::clock::Clock;
use crate::config::CacheTtls;
use crate::protocol::models::{Device, License};
use crate::store::{DeviceInsert, DeviceStore, LicenseInsert, LicenseStore};
use crate::OfflineError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Lifetime of a revision counter. Must exceed every cache TTL.
pub const REVISION_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Fire-and-forget access to cache records in a key-value store.
#[derive(Clone)]
pub struct CacheLayer {
    kv: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
}

impl CacheLayer {
    /// Create a cache layer over `kv`.
    pub fn new(kv: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>) -> Self {
        Self { kv, clock }
    }

    /// Current revision of `key`, or `None` when it cannot be read.
    pub async fn revision(&self, key: &str) -> Option<String> {
        match self.kv.counter(&revision_key(key)).await {
            Ok(Some(c)) => Some(format!("{}@{}", c.value, c.expires_at.timestamp_millis())),
            Ok(None) => Some("0".to_string()),
            Err(e) => {
                tracing::warn!(key, error = %e, "cache revision read failed");
                None
            }
        }
    }

    /// Load a value; any failure or stale revision is a miss.
    pub async fn read<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = match self.kv.get(key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(key, error = %e, "cache read failed, falling back to store");
                return None;
            }
        };

        let record = match CacheRecord::from_json(&raw) {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(key, error = %e, "discarding unreadable cache record");
                self.invalidate(vec![key.to_string()]).await;
                return None;
            }
        };

        let current = self.revision(key).await?;
        if record.revision.as_deref() != Some(current.as_str()) {
            tracing::debug!(key, "ignoring cache record from an older revision");
            return None;
        }

        match record.open(self.clock.as_ref()) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(key, error = %e, "discarding unreadable cache record");
                self.invalidate(vec![key.to_string()]).await;
                None
            }
        }
    }

    /// Store a value loaded under `revision`; failures are logged and ignored.
    pub async fn fill<T: Serialize>(&self, key: &str, value: &T, ttl: Duration, revision: String) {
        let json = match CacheRecord::wrap(value, self.clock.as_ref())
            .and_then(|r| r.at_revision(revision).to_json())
        {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!(key, error = %e, "cache encode failed");
                return;
            }
        };
        if let Err(e) = self.kv.set(key, &json, ttl).await {
            tracing::warn!(key, error = %e, "cache write failed");
        }
    }

    /// Bump the revision of each key, then drop it. Failures are logged and
    /// ignored.
    pub async fn invalidate(&self, keys: Vec<String>) {
        if keys.is_empty() {
            return;
        }
        for key in &keys {
            if let Err(e) = self.kv.incr_with_expiry(&revision_key(key), REVISION_TTL).await {
                tracing::warn!(key = %key, error = %e, "cache revision bump failed");
            }
        }
        if let Err(e) = self.kv.delete(&keys).await {
            tracing::warn!(count = keys.len(), error = %e, "cache invalidation failed");
        }
    }
}

/// Read through the cache, filling it from `load` on a miss.
async fn read_through<T, F, Fut>(
    cache: &CacheLayer,
    key: &str,
    ttl: Duration,
    load: F,
) -> Result<T, OfflineError>
where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<T, OfflineError>>,
{
    if let Some(value) = cache.read::<T>(key).await {
        return Ok(value);
    }
    let revision = cache.revision(key).await;
    let value = load().await?;
    if let Some(revision) = revision {
        cache.fill(key, &value, ttl, revision).await;
    }
    Ok(value)
}

/// Device store decorated with the cache.
pub struct CachedDeviceStore {
    inner: Arc<dyn DeviceStore>,
    cache: CacheLayer,
    ttls: CacheTtls,
}

impl CachedDeviceStore {
    /// Wrap `inner`.
    pub fn new(inner: Arc<dyn DeviceStore>, cache: CacheLayer, ttls: CacheTtls) -> Self {
        Self { inner, cache, ttls }
    }
}

#[async_trait]
impl DeviceStore for CachedDeviceStore {
    async fn get(&self, id: Uuid) -> Result<Option<Device>, OfflineError> {
        read_through(&self.cache, &device_key(id), self.ttls.device, || {
            self.inner.get(id)
        })
        .await
    }

    async fn list_active(&self, user_id: Uuid) -> Result<Vec<Device>, OfflineError> {
        read_through(&self.cache, &user_devices_key(user_id), self.ttls.device_list, || {
            self.inner.list_active(user_id)
        })
        .await
    }

    async fn insert_capped(
        &self,
        device: Device,
        max_active: usize,
    ) -> Result<DeviceInsert, OfflineError> {
        let user_id = device.user_id;
        let outcome = self.inner.insert_capped(device, max_active).await?;
        if let DeviceInsert::Inserted(ref d) = outcome {
            self.cache
                .invalidate(vec![user_devices_key(user_id), device_key(d.id)])
                .await;
        }
        Ok(outcome)
    }

    async fn touch(&self, id: Uuid, at: DateTime<Utc>) -> Result<Option<Device>, OfflineError> {
        let device = self.inner.touch(id, at).await?;
        let mut keys = vec![device_key(id)];
        if let Some(ref d) = device {
            // The list is ordered by last use
            keys.push(user_devices_key(d.user_id));
        }
        self.cache.invalidate(keys).await;
        Ok(device)
    }

    async fn revoke(&self, id: Uuid) -> Result<Option<Device>, OfflineError> {
        let device = self.inner.revoke(id).await?;
        let mut keys = vec![device_key(id)];
        if let Some(ref d) = device {
            keys.push(user_devices_key(d.user_id));
        }
        self.cache.invalidate(keys).await;
        Ok(device)
    }
}

/// License store decorated with the cache.
pub struct CachedLicenseStore {
    inner: Arc<dyn LicenseStore>,
    cache: CacheLayer,
    ttls: CacheTtls,
}

impl CachedLicenseStore {
    /// Wrap `inner`.
    pub fn new(inner: Arc<dyn LicenseStore>, cache: CacheLayer, ttls: CacheTtls) -> Self {
        Self { inner, cache, ttls }
    }

    async fn evict_all(&self, licenses: &[License]) {
        self.cache
            .invalidate(licenses.iter().map(|l| license_key(l.id)).collect())
            .await;
    }
}

#[async_trait]
impl LicenseStore for CachedLicenseStore {
    async fn get(&self, id: Uuid) -> Result<Option<License>, OfflineError> {
        read_through(&self.cache, &license_key(id), self.ttls.license, || {
            self.inner.get(id)
        })
        .await
    }

    async fn get_current(&self, id: Uuid) -> Result<Option<License>, OfflineError> {
        self.inner.get_current(id).await
    }

    async fn insert_active(
        &self,
        license: License,
        now: DateTime<Utc>,
    ) -> Result<LicenseInsert, OfflineError> {
        let outcome = self.inner.insert_active(license, now).await?;
        if let LicenseInsert::Inserted(ref l) = outcome {
            self.cache.invalidate(vec![license_key(l.id)]).await;
        }
        Ok(outcome)
    }

    async fn rotate_nonce(
        &self,
        id: Uuid,
        expected_nonce: &str,
        new_nonce: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<License>, OfflineError> {
        let license = self.inner.rotate_nonce(id, expected_nonce, new_nonce, at).await?;
        self.cache.invalidate(vec![license_key(id)]).await;
        Ok(license)
    }

    async fn renew(
        &self,
        id: Uuid,
        expires_at: DateTime<Utc>,
        new_nonce: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<License>, OfflineError> {
        let license = self.inner.renew(id, expires_at, new_nonce, at).await?;
        self.cache.invalidate(vec![license_key(id)]).await;
        Ok(license)
    }

    async fn revoke(&self, id: Uuid) -> Result<Option<License>, OfflineError> {
        let license = self.inner.revoke(id).await?;
        self.cache.invalidate(vec![license_key(id)]).await;
        Ok(license)
    }

    async fn revoke_by_material(&self, material_id: Uuid) -> Result<Vec<License>, OfflineError> {
        let revoked = self.inner.revoke_by_material(material_id).await?;
        self.evict_all(&revoked).await;
        Ok(revoked)
    }

    async fn revoke_by_device(&self, device_id: Uuid) -> Result<Vec<License>, OfflineError> {
        let revoked = self.inner.revoke_by_device(device_id).await?;
        self.evict_all(&revoked).await;
        Ok(revoked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::kv::{Counter, MemoryKv};
    use crate::clock::MockClock;
    use crate::config::OfflineConfig;
    use crate::protocol::models::{DeviceStatus, LicenseStatus, Platform};
    use crate::store::{MemoryDeviceStore, MemoryLicenseStore};
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::Notify;

    /// Key-value store that fails every call.
    struct BrokenKv;

    #[async_trait]
    impl KeyValueStore for BrokenKv {
        async fn get(&self, _: &str) -> Result<Option<String>, OfflineError> {
            Err(OfflineError::CacheIO("down".to_string()))
        }
        async fn set(&self, _: &str, _: &str, _: Duration) -> Result<(), OfflineError> {
            Err(OfflineError::CacheIO("down".to_string()))
        }
        async fn set_if_absent(&self, _: &str, _: &str, _: Duration) -> Result<bool, OfflineError> {
            Err(OfflineError::CacheIO("down".to_string()))
        }
        async fn delete(&self, _: &[String]) -> Result<(), OfflineError> {
            Err(OfflineError::CacheIO("down".to_string()))
        }
        async fn incr_with_expiry(&self, _: &str, _: Duration) -> Result<Counter, OfflineError> {
            Err(OfflineError::CacheIO("down".to_string()))
        }
        async fn counter(&self, _: &str) -> Result<Option<Counter>, OfflineError> {
            Err(OfflineError::CacheIO("down".to_string()))
        }
        async fn decr(&self, _: &str) -> Result<(), OfflineError> {
            Err(OfflineError::CacheIO("down".to_string()))
        }
    }

    /// License store whose next `get` pauses after reading, until released.
    #[derive(Default)]
    struct PausingLicenseStore {
        inner: MemoryLicenseStore,
        pause_next_get: AtomicBool,
        paused: Notify,
        release: Notify,
    }

    #[async_trait]
    impl LicenseStore for PausingLicenseStore {
        async fn get(&self, id: Uuid) -> Result<Option<License>, OfflineError> {
            let license = self.inner.get(id).await?;
            if self.pause_next_get.swap(false, Ordering::SeqCst) {
                self.paused.notify_one();
                self.release.notified().await;
            }
            Ok(license)
        }
        async fn insert_active(&self, license: License, now: DateTime<Utc>) -> Result<LicenseInsert, OfflineError> {
            self.inner.insert_active(license, now).await
        }
        async fn rotate_nonce(
            &self,
            id: Uuid,
            expected_nonce: &str,
            new_nonce: &str,
            at: DateTime<Utc>,
        ) -> Result<Option<License>, OfflineError> {
            self.inner.rotate_nonce(id, expected_nonce, new_nonce, at).await
        }
        async fn renew(
            &self,
            id: Uuid,
            expires_at: DateTime<Utc>,
            new_nonce: &str,
            at: DateTime<Utc>,
        ) -> Result<Option<License>, OfflineError> {
            self.inner.renew(id, expires_at, new_nonce, at).await
        }
        async fn revoke(&self, id: Uuid) -> Result<Option<License>, OfflineError> {
            self.inner.revoke(id).await
        }
        async fn revoke_by_material(&self, material_id: Uuid) -> Result<Vec<License>, OfflineError> {
            self.inner.revoke_by_material(material_id).await
        }
        async fn revoke_by_device(&self, device_id: Uuid) -> Result<Vec<License>, OfflineError> {
            self.inner.revoke_by_device(device_id).await
        }
    }

    fn clock() -> Arc<MockClock> {
        Arc::new(MockClock::from_rfc3339("2025-01-15T12:00:00Z").unwrap())
    }

    fn license(now: DateTime<Utc>) -> License {
        License {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            material_id: Uuid::new_v4(),
            device_id: Uuid::new_v4(),
            status: LicenseStatus::Active,
            expires_at: now + chrono::Duration::days(30),
            offline_grace_seconds: 3600,
            last_validated_at: None,
            nonce: "b".repeat(64),
            created_at: now,
        }
    }

    #[tokio::test]
    async fn test_broken_cache_degrades_to_store() {
        let clock = clock();
        let inner = Arc::new(MemoryLicenseStore::new());
        let cached = CachedLicenseStore::new(
            inner.clone(),
            CacheLayer::new(Arc::new(BrokenKv), clock.clone()),
            OfflineConfig::default().cache,
        );
        let l = license(clock.now_utc());
        let id = l.id;
        cached.insert_active(l, clock.now_utc()).await.unwrap();
        assert_eq!(cached.get(id).await.unwrap().unwrap().id, id);
        assert!(cached.revoke(id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_revoke_evicts_cached_license() {
        let clock = clock();
        let kv = Arc::new(MemoryKv::new(clock.clone()));
        let cached = CachedLicenseStore::new(
            Arc::new(MemoryLicenseStore::new()),
            CacheLayer::new(kv.clone(), clock.clone()),
            OfflineConfig::default().cache,
        );
        let l = license(clock.now_utc());
        let (id, device_id) = (l.id, l.device_id);
        cached.insert_active(l, clock.now_utc()).await.unwrap();
        assert!(kv.get(&license_key(id)).await.unwrap().is_none());
        cached.get(id).await.unwrap();
        assert!(kv.get(&license_key(id)).await.unwrap().is_some());

        cached.revoke_by_device(device_id).await.unwrap();
        assert!(kv.get(&license_key(id)).await.unwrap().is_none());
        let reloaded = cached.get(id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, LicenseStatus::Revoked);
    }

    #[tokio::test]
    async fn test_corrupt_record_is_a_miss() {
        let clock = clock();
        let kv = Arc::new(MemoryKv::new(clock.clone()));
        let inner = Arc::new(MemoryDeviceStore::new());
        let cached = CachedDeviceStore::new(
            inner.clone(),
            CacheLayer::new(kv.clone(), clock.clone()),
            OfflineConfig::default().cache,
        );
        let device = Device {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            fingerprint: "f".repeat(32),
            name: "Phone".to_string(),
            platform: Platform::Android,
            public_key: String::new(),
            status: DeviceStatus::Active,
            last_used_at: clock.now_utc(),
            created_at: clock.now_utc(),
        };
        inner.insert_capped(device.clone(), 5).await.unwrap();
        kv.set(&device_key(device.id), "garbage", Duration::from_secs(60))
            .await
            .unwrap();

        assert_eq!(cached.get(device.id).await.unwrap(), Some(device.clone()));
        let list = cached.list_active(device.user_id).await.unwrap();
        assert_eq!(list, vec![device]);
    }

    #[tokio::test]
    async fn test_fill_racing_a_revoke_is_never_served() {
        let clock = clock();
        let kv = Arc::new(MemoryKv::new(clock.clone()));
        let inner = Arc::new(PausingLicenseStore::default());
        let cached = Arc::new(CachedLicenseStore::new(
            inner.clone(),
            CacheLayer::new(kv.clone(), clock.clone()),
            OfflineConfig::default().cache,
        ));
        let l = license(clock.now_utc());
        let id = l.id;
        cached.insert_active(l, clock.now_utc()).await.unwrap();

        // A reader loads the active record, then stalls before filling
        inner.pause_next_get.store(true, Ordering::SeqCst);
        let reader = tokio::spawn({
            let cached = cached.clone();
            async move { cached.get(id).await }
        });
        inner.paused.notified().await;

        cached.revoke(id).await.unwrap();
        inner.release.notify_one();
        let stale = reader.await.unwrap().unwrap().unwrap();
        assert_eq!(stale.status, LicenseStatus::Active);

        // The late fill landed but carries the pre-revoke revision
        assert!(kv.get(&license_key(id)).await.unwrap().is_some());
        let seen = cached.get(id).await.unwrap().unwrap();
        assert_eq!(seen.status, LicenseStatus::Revoked);
    }

    #[tokio::test]
    async fn test_touch_refreshes_cached_device_list() {
        let clock = clock();
        let kv = Arc::new(MemoryKv::new(clock.clone()));
        let cached = CachedDeviceStore::new(
            Arc::new(MemoryDeviceStore::new()),
            CacheLayer::new(kv, clock.clone()),
            OfflineConfig::default().cache,
        );
        let user = Uuid::new_v4();
        let mut ids = Vec::new();
        for n in 0..2 {
            let device = Device {
                id: Uuid::new_v4(),
                user_id: user,
                fingerprint: format!("{:f>32}", n),
                name: format!("Device {}", n),
                platform: Platform::Ios,
                public_key: String::new(),
                status: DeviceStatus::Active,
                last_used_at: clock.now_utc(),
                created_at: clock.now_utc(),
            };
            ids.push(device.id);
            cached.insert_capped(device, 5).await.unwrap();
            clock.advance(chrono::Duration::minutes(1));
        }
        let before = cached.list_active(user).await.unwrap();
        assert_eq!(before[0].id, ids[1]);

        clock.advance(chrono::Duration::minutes(1));
        let touched = cached.touch(ids[0], clock.now_utc()).await.unwrap().unwrap();
        assert_eq!(touched.last_used_at, clock.now_utc());

        let after = cached.list_active(user).await.unwrap();
        assert_eq!(after[0].id, ids[0]);
        assert_eq!(after[0].last_used_at, clock.now_utc());
        assert_eq!(cached.get(ids[0]).await.unwrap().unwrap().last_used_at, clock.now_utc());
    }
}
