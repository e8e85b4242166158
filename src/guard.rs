//! Request integrity guard for signed client requests.
//!
//! A request may carry `timestamp:nonce:signature`. When it does, the
//! signature must verify under the device's derived key, the timestamp must
//! be inside the replay window, and the nonce must not have been seen. The
//! nonce is recorded only after the signature verifies, with a
//! set-if-absent so check and record cannot race.

use crate::cache::format::replay_key;
use crate::cache::kv::KeyValueStore;
use crate::clock::Clock;
use crate::config::IntegrityPolicy;
use crate::crypto::freshness::{check_freshness, parse_unix_timestamp};
use crate::crypto::keys::derive_request_key;
use crate::crypto::signing::build_request_signing_string;
use crate::crypto::verify::{parse_signature_header, verify_hmac};
use crate::crypto::wrap::wrap_for_device;
use crate::protocol::models::Device;
use crate::OfflineError;
use std::sync::Arc;
use uuid::Uuid;

/// The parts of a request covered by its signature.
#[derive(Debug, Clone, Copy)]
pub struct SignedRequest<'a> {
    /// HTTP method.
    pub method: &'a str,
    /// Path including query string.
    pub path: &'a str,
    /// Raw body.
    pub body: &'a [u8],
    /// Device the request claims to come from.
    pub device_id: Option<Uuid>,
    /// Signature header, if sent.
    pub signature: Option<&'a str>,
}

/// Verifies signed requests and records their nonces.
pub struct RequestGuard {
    kv: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    root_secret: Vec<u8>,
    policy: IntegrityPolicy,
}

impl RequestGuard {
    /// Create a guard.
    pub fn new(
        kv: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        root_secret: Vec<u8>,
        policy: IntegrityPolicy,
    ) -> Self {
        Self {
            kv,
            clock,
            root_secret,
            policy,
        }
    }

    /// The device's request-signing key, wrapped to its public key.
    ///
    /// Handed out at enrollment; only the device can unwrap it.
    pub fn wrapped_request_key(&self, device: &Device) -> Result<String, OfflineError> {
        let key = derive_request_key(&self.root_secret, device.id)?;
        wrap_for_device(&key, &device.public_key)
    }

    /// Check a request. Requests without a signature header pass.
    ///
    /// # Errors
    /// * `MalformedSignature` - Header unparseable, or no device id
    /// * `StaleRequest` - Timestamp outside the replay window
    /// * `SignatureInvalid` - HMAC does not verify
    /// * `Replay` - Nonce already used
    /// * `ReplayStoreUnavailable` - Nonce could not be recorded
    pub async fn verify(&self, request: &SignedRequest<'_>) -> Result<(), OfflineError> {
        let Some(header) = request.signature else {
            return Ok(());
        };
        let device_id = request.device_id.ok_or_else(|| {
            OfflineError::MalformedSignature("signed request without device id".to_string())
        })?;

        let parsed = parse_signature_header(header)?;
        check_freshness(
            parse_unix_timestamp(parsed.timestamp)?,
            &self.policy,
            self.clock.as_ref(),
        )?;

        let key = derive_request_key(&self.root_secret, device_id)?;
        let signing_string = build_request_signing_string(
            request.method,
            request.path,
            request.body,
            parsed.timestamp,
            &parsed.nonce,
            &device_id.to_string(),
        );
        if let Err(e) = verify_hmac(&key, &signing_string, &parsed.signature) {
            tracing::warn!(%device_id, path = request.path, "request signature rejected");
            return Err(e);
        }

        let fresh = self
            .kv
            .set_if_absent(&replay_key(&parsed.nonce), &device_id.to_string(), self.policy.replay_window)
            .await
            .map_err(|e| {
                tracing::error!(%device_id, error = %e, "replay store unavailable");
                OfflineError::ReplayStoreUnavailable(e.to_string())
            })?;
        if !fresh {
            tracing::warn!(%device_id, path = request.path, "replayed request nonce");
            return Err(OfflineError::Replay);
        }
        Ok(())
    }
}
