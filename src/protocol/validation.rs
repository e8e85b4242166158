//! Input checks shared by every endpoint that accepts client values.

use crate::config::{DevicePolicy, LicensePolicy};
use crate::OfflineError;

/// Check fingerprint length against policy.
pub fn validate_fingerprint(fingerprint: &str, policy: &DevicePolicy) -> Result<(), OfflineError> {
    let len = fingerprint.chars().count();
    if len < policy.fingerprint_min_len || len > policy.fingerprint_max_len {
        return Err(OfflineError::InvalidFingerprint {
            len,
            min: policy.fingerprint_min_len,
            max: policy.fingerprint_max_len,
        });
    }
    Ok(())
}

/// Check a presented nonce's length against policy.
pub fn validate_nonce(nonce: &str, policy: &LicensePolicy) -> Result<(), OfflineError> {
    let len = nonce.chars().count();
    if len < policy.nonce_min_len || len > policy.nonce_max_len {
        return Err(OfflineError::InvalidInput(format!(
            "nonce must be between {} and {} characters, got {}",
            policy.nonce_min_len, policy.nonce_max_len, len
        )));
    }
    Ok(())
}

/// Strip NUL and control characters (keeping `\n` and `\t`), then trim.
pub fn sanitize_input(input: &str) -> String {
    input
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect::<String>()
        .trim()
        .to_string()
}

/// Sanitize a device name and check its length.
pub fn validate_device_name(name: &str, policy: &DevicePolicy) -> Result<String, OfflineError> {
    let clean = sanitize_input(name);
    let len = clean.chars().count();
    if len == 0 {
        return Err(OfflineError::InvalidInput("device name is required".to_string()));
    }
    if len > policy.name_max_len {
        return Err(OfflineError::InvalidInput(format!(
            "device name exceeds {} characters",
            policy.name_max_len
        )));
    }
    Ok(clean)
}
