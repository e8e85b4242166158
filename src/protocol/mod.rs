//! Offline subsystem records, Range handling and input checks.

pub mod models;
pub mod range;
pub mod validation;
