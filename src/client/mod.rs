//! HTTP client for the content service.

pub mod http;

pub use self::http::ContentServiceClient;
