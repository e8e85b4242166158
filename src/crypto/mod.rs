//! Cryptographic primitives: digests, request and URL signatures, replay
//! windows, content keys, chunk encryption and key wrapping to devices.

pub mod cipher;
pub mod digest;
pub mod freshness;
pub mod keys;
pub mod signing;
pub mod verify;
pub mod wrap;
