//! Signature verification: request HMACs and signed download URLs.

use crate::clock::Clock;
use crate::crypto::signing::{build_url_signing_string, HmacSha256};
use crate::OfflineError;
use base64::{
    engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD},
    Engine,
};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use hmac::Mac;
use once_cell::sync::OnceCell;
use std::collections::HashMap;
use std::sync::RwLock;

/// Longest nonce accepted in a signature header.
pub const MAX_HEADER_NONCE_LEN: usize = 128;

/// Parsed `timestamp:nonce:signature` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedRequestSignature {
    /// Unix seconds.
    pub timestamp: i64,
    /// Single-use request nonce.
    pub nonce: String,
    /// Base64 HMAC.
    pub signature: String,
}

/// Parse a request signature header.
///
/// Format: `<unix seconds>:<nonce>:<base64 signature>`
pub fn parse_signature_header(header: &str) -> Result<ParsedRequestSignature, OfflineError> {
    let mut parts = header.trim().splitn(3, ':');
    let (Some(ts), Some(nonce), Some(signature)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(OfflineError::MalformedSignature(
            "expected timestamp:nonce:signature".to_string(),
        ));
    };

    let timestamp = ts
        .parse::<i64>()
        .map_err(|e| OfflineError::MalformedSignature(format!("bad timestamp {:?}: {}", ts, e)))?;

    if nonce.is_empty() || nonce.len() > MAX_HEADER_NONCE_LEN {
        return Err(OfflineError::MalformedSignature(format!(
            "nonce must be 1..={} characters",
            MAX_HEADER_NONCE_LEN
        )));
    }

    if signature.is_empty() || signature.contains(':') {
        return Err(OfflineError::MalformedSignature(
            "signature segment is malformed".to_string(),
        ));
    }

    Ok(ParsedRequestSignature {
        timestamp,
        nonce: nonce.to_string(),
        signature: signature.to_string(),
    })
}

/// Verify a base64 HMAC-SHA256 over `signing_string` in constant time.
pub fn verify_hmac(key: &[u8], signing_string: &str, signature_b64: &str) -> Result<(), OfflineError> {
    let expected = STANDARD
        .decode(signature_b64)
        .map_err(|_| OfflineError::SignatureInvalid)?;

    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| OfflineError::Config(format!("invalid HMAC key: {}", e)))?;
    mac.update(signing_string.as_bytes());
    mac.verify_slice(&expected)
        .map_err(|_| OfflineError::SignatureInvalid)
}

/// Compare two secrets without early exit.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Cache for decoded verifying keys.
static KEY_CACHE: OnceCell<RwLock<HashMap<String, VerifyingKey>>> = OnceCell::new();

/// Decode a hex-encoded Ed25519 public key.
///
/// The key is cached after first decode; object hosts verify many URLs
/// against the same key.
pub fn decode_public_key(hex_key: &str) -> Result<VerifyingKey, OfflineError> {
    let cache = KEY_CACHE.get_or_init(|| RwLock::new(HashMap::new()));
    if let Ok(guard) = cache.read() {
        if let Some(key) = guard.get(hex_key) {
            return Ok(*key);
        }
    }

    let bytes = hex::decode(hex_key)
        .map_err(|e| OfflineError::Config(format!("Invalid public key hex: {}", e)))?;

    let key_array: [u8; 32] = bytes
        .try_into()
        .map_err(|_| OfflineError::Config("Public key must be 32 bytes".to_string()))?;

    let verifying_key = VerifyingKey::from_bytes(&key_array)
        .map_err(|e| OfflineError::Config(format!("Invalid Ed25519 public key: {}", e)))?;

    if let Ok(mut guard) = cache.write() {
        guard.insert(hex_key.to_string(), verifying_key);
    }

    Ok(verifying_key)
}

/// Verify a signed download URL's parameters.
///
/// # Errors
/// * `SignatureInvalid` - Signature does not match the key and expiry
/// * `StaleRequest` - URL is past its expiry
pub fn verify_signed_url<C: Clock + ?Sized>(
    object_key: &str,
    expires: i64,
    signature_b64url: &str,
    public_key_hex: &str,
    clock: &C,
) -> Result<(), OfflineError> {
    let verifying_key = decode_public_key(public_key_hex)?;

    let sig_bytes = URL_SAFE_NO_PAD
        .decode(signature_b64url)
        .map_err(|_| OfflineError::SignatureInvalid)?;
    let sig_array: [u8; 64] = sig_bytes
        .try_into()
        .map_err(|_| OfflineError::SignatureInvalid)?;
    let signature = Signature::from_bytes(&sig_array);

    let signing_string = build_url_signing_string(object_key, expires);
    verifying_key
        .verify(signing_string.as_bytes(), &signature)
        .map_err(|_| OfflineError::SignatureInvalid)?;

    let now = clock.now_utc().timestamp();
    if now > expires {
        return Err(OfflineError::StaleRequest {
            skew_seconds: now - expires,
        });
    }

    Ok(())
}
