//! Cache-aside layer: key-value seam, record format and store decorators.

pub mod format;
pub mod kv;
pub mod layer;

pub use kv::{Counter, KeyValueStore, MemoryKv};
pub use layer::{CacheLayer, CachedDeviceStore, CachedLicenseStore};
