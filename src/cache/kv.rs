//! Key-value store seam for cache entries and counters.
//!
//! Counters are the only shared mutable numbers in the subsystem, and they
//! live here rather than in process memory of any engine. An increment and
//! the expiry of the key it creates are one atomic operation, so a counter
//! can never be left without a TTL.

use crate::clock::{to_chrono, Clock};
use crate::OfflineError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// A windowed counter value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Counter {
    /// Count in the current window.
    pub value: u64,
    /// When the window (and the key) expires.
    pub expires_at: DateTime<Utc>,
}

/// Shared key-value store with TTLs and atomic counters.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Read a string value.
    async fn get(&self, key: &str) -> Result<Option<String>, OfflineError>;

    /// Write a string value with a TTL.
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), OfflineError>;

    /// Write only if the key is absent; returns whether it was written.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration)
        -> Result<bool, OfflineError>;

    /// Delete keys; missing keys are ignored.
    async fn delete(&self, keys: &[String]) -> Result<(), OfflineError>;

    /// Increment a counter. A key created by this call expires after
    /// `window`; an existing key keeps its expiry.
    async fn incr_with_expiry(&self, key: &str, window: Duration) -> Result<Counter, OfflineError>;

    /// Read a counter without changing it.
    async fn counter(&self, key: &str) -> Result<Option<Counter>, OfflineError>;

    /// Decrement a live counter, stopping at zero. Keeps the expiry; a
    /// missing key is ignored.
    async fn decr(&self, key: &str) -> Result<(), OfflineError>;
}

#[derive(Debug, Clone)]
enum Value {
    Text(String),
    Count(u64),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: DateTime<Utc>,
}

/// In-memory key-value store with clock-driven expiry.
pub struct MemoryKv {
    entries: Mutex<HashMap<String, Entry>>,
    clock: Arc<dyn Clock>,
}

impl MemoryKv {
    /// Create an empty store reading time from `clock`.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("key-value mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Live entry for `key`, dropping it if expired.
    fn live<'a>(
        entries: &'a mut HashMap<String, Entry>,
        key: &str,
        now: DateTime<Utc>,
    ) -> Option<&'a mut Entry> {
        if entries.get(key).is_some_and(|e| e.expires_at <= now) {
            entries.remove(key);
        }
        entries.get_mut(key)
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = self.clock.now_utc();
        self.lock().values().filter(|e| e.expires_at > now).count()
    }

    /// Whether no live keys remain.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl KeyValueStore for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<String>, OfflineError> {
        let now = self.clock.now_utc();
        let mut entries = self.lock();
        Ok(Self::live(&mut entries, key, now).and_then(|e| match &e.value {
            Value::Text(s) => Some(s.clone()),
            Value::Count(n) => Some(n.to_string()),
        }))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), OfflineError> {
        let expires_at = self.clock.now_utc() + to_chrono(ttl);
        self.lock().insert(
            key.to_string(),
            Entry {
                value: Value::Text(value.to_string()),
                expires_at,
            },
        );
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, OfflineError> {
        let now = self.clock.now_utc();
        let mut entries = self.lock();
        if Self::live(&mut entries, key, now).is_some() {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: Value::Text(value.to_string()),
                expires_at: now + to_chrono(ttl),
            },
        );
        Ok(true)
    }

    async fn delete(&self, keys: &[String]) -> Result<(), OfflineError> {
        let mut entries = self.lock();
        for key in keys {
            entries.remove(key);
        }
        Ok(())
    }

    async fn incr_with_expiry(&self, key: &str, window: Duration) -> Result<Counter, OfflineError> {
        let now = self.clock.now_utc();
        let mut entries = self.lock();

        if let Some(entry) = Self::live(&mut entries, key, now) {
            let next = match entry.value {
                Value::Count(n) => n + 1,
                Value::Text(_) => {
                    return Err(OfflineError::CacheIO(format!(
                        "key {} does not hold a counter",
                        key
                    )))
                }
            };
            entry.value = Value::Count(next);
            return Ok(Counter {
                value: next,
                expires_at: entry.expires_at,
            });
        }

        let expires_at = now + to_chrono(window);
        entries.insert(
            key.to_string(),
            Entry {
                value: Value::Count(1),
                expires_at,
            },
        );
        Ok(Counter {
            value: 1,
            expires_at,
        })
    }

    async fn counter(&self, key: &str) -> Result<Option<Counter>, OfflineError> {
        let now = self.clock.now_utc();
        let mut entries = self.lock();
        Ok(Self::live(&mut entries, key, now).and_then(|e| match e.value {
            Value::Count(value) => Some(Counter {
                value,
                expires_at: e.expires_at,
            }),
            Value::Text(_) => None,
        }))
    }

    async fn decr(&self, key: &str) -> Result<(), OfflineError> {
        let now = self.clock.now_utc();
        let mut entries = self.lock();
        if let Some(entry) = Self::live(&mut entries, key, now) {
            match entry.value {
                Value::Count(n) => entry.value = Value::Count(n.saturating_sub(1)),
                Value::Text(_) => {
                    return Err(OfflineError::CacheIO(format!(
                        "key {} does not hold a counter",
                        key
                    )))
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;

    fn kv() -> (Arc<MockClock>, MemoryKv) {
        let clock = Arc::new(MockClock::from_rfc3339("2025-01-15T12:00:00Z").unwrap());
        let kv = MemoryKv::new(clock.clone());
        (clock, kv)
    }

    #[tokio::test]
    async fn test_set_get_expires() {
        let (clock, kv) = kv();
        kv.set("k", "v", Duration::from_secs(60)).await.unwrap();
        assert_eq!(kv.get("k").await.unwrap().as_deref(), Some("v"));
        clock.advance(chrono::Duration::seconds(60));
        assert_eq!(kv.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_set_if_absent() {
        let (clock, kv) = kv();
        assert!(kv.set_if_absent("n", "1", Duration::from_secs(300)).await.unwrap());
        assert!(!kv.set_if_absent("n", "1", Duration::from_secs(300)).await.unwrap());
        clock.advance(chrono::Duration::seconds(301));
        assert!(kv.set_if_absent("n", "1", Duration::from_secs(300)).await.unwrap());
    }

    #[tokio::test]
    async fn test_incr_keeps_first_expiry() {
        let (clock, kv) = kv();
        let first = kv.incr_with_expiry("c", Duration::from_secs(3600)).await.unwrap();
        clock.advance(chrono::Duration::minutes(10));
        let second = kv.incr_with_expiry("c", Duration::from_secs(3600)).await.unwrap();
        assert_eq!(second.value, 2);
        assert_eq!(second.expires_at, first.expires_at);

        clock.advance(chrono::Duration::minutes(50));
        assert_eq!(kv.counter("c").await.unwrap(), None);
        let fresh = kv.incr_with_expiry("c", Duration::from_secs(3600)).await.unwrap();
        assert_eq!(fresh.value, 1);
    }

    #[tokio::test]
    async fn test_decr_keeps_expiry_and_stops_at_zero() {
        let (_clock, kv) = kv();
        kv.decr("absent").await.unwrap();
        assert_eq!(kv.counter("absent").await.unwrap(), None);

        let first = kv.incr_with_expiry("c", Duration::from_secs(3600)).await.unwrap();
        kv.incr_with_expiry("c", Duration::from_secs(3600)).await.unwrap();
        kv.decr("c").await.unwrap();
        let after = kv.counter("c").await.unwrap().unwrap();
        assert_eq!(after.value, 1);
        assert_eq!(after.expires_at, first.expires_at);

        kv.decr("c").await.unwrap();
        kv.decr("c").await.unwrap();
        assert_eq!(kv.counter("c").await.unwrap().unwrap().value, 0);

        kv.set("t", "text", Duration::from_secs(60)).await.unwrap();
        assert!(matches!(kv.decr("t").await, Err(OfflineError::CacheIO(_))));
    }

    #[tokio::test]
    async fn test_concurrent_increments_are_not_lost() {
        let (_clock, kv) = kv();
        let kv = Arc::new(kv);
        let mut handles = Vec::new();
        for _ in 0..50 {
            let kv = kv.clone();
            handles.push(tokio::spawn(async move {
                kv.incr_with_expiry("hits", Duration::from_secs(60)).await.unwrap()
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(kv.counter("hits").await.unwrap().unwrap().value, 50);
    }

    #[tokio::test]
    async fn test_delete() {
        let (_clock, kv) = kv();
        kv.set("a", "1", Duration::from_secs(60)).await.unwrap();
        kv.incr_with_expiry("b", Duration::from_secs(60)).await.unwrap();
        kv.delete(&["a".to_string(), "b".to_string(), "missing".to_string()])
            .await
            .unwrap();
        assert!(kv.is_empty());
    }
}
