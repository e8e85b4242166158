//! Signing string construction and signers.
//!
//! Request signing string (HMAC-SHA256, newline-delimited, no trailing newline):
//! ```text
//! POST
//! /licenses/<id>/validate
//! <sha256 hex of body>
//! <unix timestamp>
//! <nonce>
//! <device id>
//! ```
//!
//! Download URL signing string (Ed25519):
//! ```text
//! get /<object key>
//! expires: <unix timestamp>
//! ```

use crate::crypto::digest::sha256_hex;
use crate::OfflineError;
use base64::{
    engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD},
    Engine,
};
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use hmac::{Hmac, Mac};
use sha2::Sha256;

/// HMAC-SHA256.
pub type HmacSha256 = Hmac<Sha256>;

/// Build the signing string for an inbound request.
///
/// # Arguments
/// * `method` - HTTP method (uppercased)
/// * `path` - Request path including query string
/// * `body` - Raw request body
/// * `timestamp` - Unix seconds from the signature header
/// * `nonce` - Nonce from the signature header
/// * `device_id` - Device the request is made from
pub fn build_request_signing_string(
    method: &str,
    path: &str,
    body: &[u8],
    timestamp: i64,
    nonce: &str,
    device_id: &str,
) -> String {
    format!(
        "{}\n{}\n{}\n{}\n{}\n{}",
        method.to_uppercase(),
        path,
        sha256_hex(body),
        timestamp,
        nonce,
        device_id
    )
}

/// HMAC a signing string with `key`, standard base64.
pub fn hmac_b64(key: &[u8], signing_string: &str) -> Result<String, OfflineError> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| OfflineError::Config(format!("invalid HMAC key: {}", e)))?;
    mac.update(signing_string.as_bytes());
    Ok(STANDARD.encode(mac.finalize().into_bytes()))
}

/// Build the `timestamp:nonce:signature` header a client sends.
pub fn sign_request_header(
    key: &[u8],
    method: &str,
    path: &str,
    body: &[u8],
    timestamp: i64,
    nonce: &str,
    device_id: &str,
) -> Result<String, OfflineError> {
    let signing_string =
        build_request_signing_string(method, path, body, timestamp, nonce, device_id);
    let signature = hmac_b64(key, &signing_string)?;
    Ok(format!("{}:{}:{}", timestamp, nonce, signature))
}

/// Build the signing string for a download URL.
pub fn build_url_signing_string(object_key: &str, expires: i64) -> String {
    format!("get /{}\nexpires: {}", object_key, expires)
}

/// A minted download URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedUrl {
    /// Full URL including query.
    pub url: String,
    /// Expiry instant.
    pub expires_at: DateTime<Utc>,
}

/// Mints time-limited download URLs signed with Ed25519.
///
/// The object host only needs the verifying key to check them.
pub struct UrlSigner {
    signing_key: SigningKey,
    base_url: String,
}

impl UrlSigner {
    /// Create a signer from a 32-byte seed.
    pub fn new(seed: &[u8; 32], base_url: impl Into<String>) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(seed),
            base_url: base_url.into(),
        }
    }

    /// Hex-encoded verifying key for the object host.
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.verifying_key().to_bytes())
    }

    /// Verifying key.
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Sign a URL for `object_key` valid until `expires_at`.
    pub fn sign(&self, object_key: &str, expires_at: DateTime<Utc>) -> SignedUrl {
        let expires = expires_at.timestamp();
        let signing_string = build_url_signing_string(object_key, expires);
        let signature = self.signing_key.sign(signing_string.as_bytes());
        let url = format!(
            "{}/{}?expires={}&signature={}",
            self.base_url,
            object_key,
            expires,
            URL_SAFE_NO_PAD.encode(signature.to_bytes())
        );
        SignedUrl { url, expires_at }
    }
}
