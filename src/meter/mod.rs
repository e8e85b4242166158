//! Rate limiting and abuse detection.

pub mod limits;

pub use limits::{RateLimitStatus, RateLimiter};
