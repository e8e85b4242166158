//! Key delivery to devices via ECIES over secp256k1.
//!
//! A device registers an uncompressed secp256k1 public key. Keys the device
//! needs (its request-signing key, content keys) are wrapped to it and
//! travel base64-encoded. Wire format of a wrapped key:
//! ephemeral_pubkey(65) || nonce(16) || tag(16) || ciphertext.

use crate::OfflineError;
use base64::{engine::general_purpose::STANDARD, Engine};

/// Uncompressed secp256k1 public key size (0x04 prefix + x + y).
pub const PUBLIC_KEY_SIZE: usize = 65;

/// secp256k1 private key size.
pub const PRIVATE_KEY_SIZE: usize = 32;

/// Smallest possible wrapped key: ephemeral public key plus tag.
pub const MIN_WRAPPED_SIZE: usize = PUBLIC_KEY_SIZE + 16;

/// Parse a hex-encoded device public key.
///
/// # Errors
/// `InvalidPublicKey` unless the key is 65 bytes with the 0x04 prefix.
pub fn parse_public_key(hex_key: &str) -> Result<Vec<u8>, OfflineError> {
    let bytes = hex::decode(hex_key.trim())
        .map_err(|_| OfflineError::InvalidPublicKey("not hex".to_string()))?;
    if bytes.len() != PUBLIC_KEY_SIZE {
        return Err(OfflineError::InvalidPublicKey(format!(
            "expected {} bytes, got {}",
            PUBLIC_KEY_SIZE,
            bytes.len()
        )));
    }
    if bytes[0] != 0x04 {
        return Err(OfflineError::InvalidPublicKey(
            "expected an uncompressed point".to_string(),
        ));
    }
    Ok(bytes)
}

/// Wrap `key` to a device public key (hex); returns base64.
pub fn wrap_for_device(key: &[u8], device_public_key: &str) -> Result<String, OfflineError> {
    let public_key = parse_public_key(device_public_key)?;
    let wrapped = ecies::encrypt(&public_key, key)
        .map_err(|_| OfflineError::Encryption("key wrapping failed".to_string()))?;
    Ok(STANDARD.encode(wrapped))
}

/// Unwrap a base64 wrapped key with the device's private key.
///
/// Runs on the device; the service never holds device private keys.
pub fn unwrap_on_device(wrapped_b64: &str, private_key: &[u8]) -> Result<Vec<u8>, OfflineError> {
    if private_key.len() != PRIVATE_KEY_SIZE {
        return Err(OfflineError::Encryption("invalid private key size".to_string()));
    }
    let wrapped = STANDARD
        .decode(wrapped_b64)
        .map_err(|_| OfflineError::Encryption("wrapped key is not base64".to_string()))?;
    if wrapped.len() < MIN_WRAPPED_SIZE {
        return Err(OfflineError::Encryption("wrapped key too short".to_string()));
    }
    ecies::decrypt(private_key, &wrapped)
        .map_err(|_| OfflineError::Encryption("key unwrapping failed".to_string()))
}

/// Hex public key of a secp256k1 private key.
pub fn public_key_hex(private_key: &[u8]) -> Result<String, OfflineError> {
    let secret = ecies::SecretKey::parse_slice(private_key)
        .map_err(|_| OfflineError::InvalidPublicKey("invalid private key".to_string()))?;
    Ok(hex::encode(ecies::PublicKey::from_secret_key(&secret).serialize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEVICE_SECRET: [u8; 32] = [0x21; 32];

    #[test]
    fn test_wrap_then_unwrap_on_device() {
        let public = public_key_hex(&DEVICE_SECRET).unwrap();
        assert_eq!(public.len(), PUBLIC_KEY_SIZE * 2);
        assert!(public.starts_with("04"));

        let content_key = [0x42u8; 32];
        let wrapped = wrap_for_device(&content_key, &public).unwrap();
        assert_eq!(unwrap_on_device(&wrapped, &DEVICE_SECRET).unwrap(), content_key);
    }

    #[test]
    fn test_other_device_cannot_unwrap() {
        let public = public_key_hex(&DEVICE_SECRET).unwrap();
        let wrapped = wrap_for_device(&[7u8; 32], &public).unwrap();
        assert!(matches!(
            unwrap_on_device(&wrapped, &[0x22; 32]),
            Err(OfflineError::Encryption(_))
        ));
    }

    #[test]
    fn test_public_key_shape_checked() {
        assert!(matches!(
            parse_public_key("zz"),
            Err(OfflineError::InvalidPublicKey(_))
        ));
        assert!(matches!(
            parse_public_key(&"04".repeat(33)),
            Err(OfflineError::InvalidPublicKey(_))
        ));
        let compressed_prefix = format!("02{}", "11".repeat(64));
        assert!(matches!(
            parse_public_key(&compressed_prefix),
            Err(OfflineError::InvalidPublicKey(_))
        ));
    }

    #[test]
    fn test_short_wrapped_key_rejected() {
        assert!(unwrap_on_device(&STANDARD.encode([0u8; 20]), &DEVICE_SECRET).is_err());
    }
}
