//! Access policy delegated to the content service.

pub mod access;

pub use access::{require_access, MaterialAccessGate, MaterialCatalog, MaterialDirectory};
