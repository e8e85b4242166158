//! Key derivation and random token generation.
//!
//! Derivation path:
//!   content master key[version] -> HKDF-SHA256(salt = material id, info = "offline-cek-v1") -> content key
//!   signing root                -> HKDF-SHA256(salt = "offline-warden-v1", info = "offline-request-v1:" + device id) -> request key
//!
//! Content master keys are versioned. New artifacts are sealed under the
//! current version; older versions stay in the keyring until every artifact
//! sealed under them has been re-encrypted.

use crate::OfflineError;
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use std::collections::BTreeMap;
use uuid::Uuid;

/// HKDF info for per-material content keys.
const CONTENT_KEY_INFO: &[u8] = b"offline-cek-v1";

/// HKDF salt for request-signing keys.
const REQUEST_KEY_SALT: &[u8] = b"offline-warden-v1";

/// HKDF info prefix for per-device request-signing keys.
const REQUEST_KEY_INFO_PREFIX: &str = "offline-request-v1:";

/// Bytes of randomness in a license nonce (hex-encoded to twice this length).
pub const NONCE_BYTES: usize = 32;

/// Derive the AES-256 content key of one material.
pub fn derive_content_key(
    master_key: &[u8; 32],
    material_id: Uuid,
) -> Result<[u8; 32], OfflineError> {
    let hk = Hkdf::<Sha256>::new(Some(material_id.as_bytes()), master_key);
    let mut okm = [0u8; 32];
    hk.expand(CONTENT_KEY_INFO, &mut okm)
        .map_err(|e| OfflineError::Encryption(format!("content key derivation failed: {}", e)))?;
    Ok(okm)
}

/// Versioned content master keys.
///
/// Never logged; `Debug` only shows the versions.
#[derive(Clone)]
pub struct ContentKeyring {
    current: u32,
    keys: BTreeMap<u32, [u8; 32]>,
}

impl ContentKeyring {
    /// Keyring whose current master key is `master` at `version`.
    pub fn new(version: u32, master: [u8; 32]) -> Self {
        let mut keys = BTreeMap::new();
        keys.insert(version, master);
        Self {
            current: version,
            keys,
        }
    }

    /// Keep an older master key so artifacts sealed under it stay readable.
    pub fn with_retired(mut self, version: u32, master: [u8; 32]) -> Self {
        if version != self.current {
            self.keys.insert(version, master);
        }
        self
    }

    /// Version new artifacts are sealed under.
    pub fn current_version(&self) -> u32 {
        self.current
    }

    /// Versions held, oldest first.
    pub fn versions(&self) -> Vec<u32> {
        self.keys.keys().copied().collect()
    }

    /// Content key of `material_id` under master key `version`.
    ///
    /// # Errors
    /// `UnknownKeyVersion` if the version is not in the keyring.
    pub fn content_key(&self, version: u32, material_id: Uuid) -> Result<[u8; 32], OfflineError> {
        let master = self
            .keys
            .get(&version)
            .ok_or(OfflineError::UnknownKeyVersion(version))?;
        derive_content_key(master, material_id)
    }

    /// Reject all-zero master keys.
    pub fn validate(&self) -> Result<(), OfflineError> {
        if let Some((version, _)) = self.keys.iter().find(|(_, k)| k.iter().all(|b| *b == 0)) {
            return Err(OfflineError::Config(format!(
                "content master key v{} cannot be all zeros",
                version
            )));
        }
        Ok(())
    }
}

impl std::fmt::Debug for ContentKeyring {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentKeyring")
            .field("current", &self.current)
            .field("versions", &self.versions())
            .finish()
    }
}

/// Derive the HMAC key a device signs its requests with.
pub fn derive_request_key(root: &[u8], device_id: Uuid) -> Result<[u8; 32], OfflineError> {
    let hk = Hkdf::<Sha256>::new(Some(REQUEST_KEY_SALT), root);
    let info = format!("{}{}", REQUEST_KEY_INFO_PREFIX, device_id);
    let mut okm = [0u8; 32];
    hk.expand(info.as_bytes(), &mut okm)
        .map_err(|e| OfflineError::Config(format!("request key derivation failed: {}", e)))?;
    Ok(okm)
}

/// Fresh license nonce: 32 random bytes, lowercase hex.
pub fn generate_nonce() -> String {
    let mut bytes = [0u8; NONCE_BYTES];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Random seed for chunk IVs.
pub fn generate_iv_seed() -> [u8; 8] {
    let mut seed = [0u8; 8];
    OsRng.fill_bytes(&mut seed);
    seed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_key_is_deterministic_per_material() {
        let master = [3u8; 32];
        let material = Uuid::new_v4();
        let a = derive_content_key(&master, material).unwrap();
        let b = derive_content_key(&master, material).unwrap();
        let other = derive_content_key(&master, Uuid::new_v4()).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, other);
    }

    #[test]
    fn test_keyring_versions_derive_distinct_keys() {
        let material = Uuid::new_v4();
        let ring = ContentKeyring::new(2, [9u8; 32]).with_retired(1, [3u8; 32]);
        assert_eq!(ring.current_version(), 2);
        assert_eq!(ring.versions(), vec![1, 2]);
        assert_eq!(
            ring.content_key(1, material).unwrap(),
            derive_content_key(&[3u8; 32], material).unwrap()
        );
        assert_ne!(
            ring.content_key(1, material).unwrap(),
            ring.content_key(2, material).unwrap()
        );
        assert!(matches!(
            ring.content_key(7, material),
            Err(OfflineError::UnknownKeyVersion(7))
        ));
    }

    #[test]
    fn test_keyring_rejects_zero_key_and_redacts() {
        let ring = ContentKeyring::new(1, [0x5c; 32]).with_retired(0, [0u8; 32]);
        assert!(matches!(ring.validate(), Err(OfflineError::Config(_))));
        assert!(!format!("{:?}", ring).contains("92"));
    }

    #[test]
    fn test_request_key_differs_per_device() {
        let root = [5u8; 32];
        let a = derive_request_key(&root, Uuid::new_v4()).unwrap();
        let b = derive_request_key(&root, Uuid::new_v4()).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_nonce_shape() {
        let nonce = generate_nonce();
        assert_eq!(nonce.len(), 64);
        assert!(nonce.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(nonce, generate_nonce());
    }
}
