//! AES-256-GCM chunked encryption of material payloads.
//!
//! Chunk layout: IV (12 bytes) || Ciphertext || Auth Tag (16 bytes).
//! IV = 8-byte per-artifact seed || big-endian u32 chunk index, so no IV is
//! reused under one content key. The chunk index is also bound as associated
//! data, so a chunk only authenticates at its own position. Chunks are
//! concatenated into one object and addressed through the chunk table.

use crate::protocol::models::ChunkInfo;
use crate::OfflineError;
use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};

/// AES-GCM IV size in bytes.
pub const IV_SIZE: usize = 12;

/// AES-GCM authentication tag size in bytes.
pub const TAG_SIZE: usize = 16;

/// Bytes added to every chunk.
pub const CHUNK_OVERHEAD: usize = IV_SIZE + TAG_SIZE;

/// Encrypted object plus its chunk table.
#[derive(Debug, Clone)]
pub struct EncryptedPayload {
    /// Concatenated sealed chunks.
    pub data: Vec<u8>,
    /// Offsets and sizes of each sealed chunk in `data`.
    pub chunks: Vec<ChunkInfo>,
}

/// Number of chunks a payload of `len` bytes splits into.
///
/// An empty payload still produces one (empty) chunk so the object is
/// never zero-length.
pub fn chunk_count(len: usize, chunk_size: usize) -> usize {
    if len == 0 {
        1
    } else {
        len.div_ceil(chunk_size)
    }
}

/// IV of chunk `index` under `seed`.
pub fn chunk_iv(seed: &[u8; 8], index: u32) -> [u8; IV_SIZE] {
    let mut iv = [0u8; IV_SIZE];
    iv[..8].copy_from_slice(seed);
    iv[8..].copy_from_slice(&index.to_be_bytes());
    iv
}

/// Associated data of chunk `index`.
fn chunk_aad(index: u32) -> [u8; 4] {
    index.to_be_bytes()
}

/// Encrypt `plaintext` into sealed chunks of `chunk_size` plaintext bytes.
pub fn encrypt_chunked(
    plaintext: &[u8],
    key: &[u8; 32],
    chunk_size: usize,
    seed: &[u8; 8],
) -> Result<EncryptedPayload, OfflineError> {
    if chunk_size == 0 {
        return Err(OfflineError::Encryption("chunk size cannot be zero".to_string()));
    }
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| OfflineError::Encryption(format!("invalid content key: {}", e)))?;

    let count = chunk_count(plaintext.len(), chunk_size);
    let mut data = Vec::with_capacity(plaintext.len() + count * CHUNK_OVERHEAD);
    let mut chunks = Vec::with_capacity(count);

    let pieces: Vec<&[u8]> = if plaintext.is_empty() {
        vec![plaintext]
    } else {
        plaintext.chunks(chunk_size).collect()
    };

    for (i, piece) in pieces.into_iter().enumerate() {
        let index = u32::try_from(i)
            .map_err(|_| OfflineError::Encryption("too many chunks".to_string()))?;
        let iv = chunk_iv(seed, index);
        let aad = chunk_aad(index);
        let sealed = cipher
            .encrypt(Nonce::from_slice(&iv), Payload { msg: piece, aad: &aad })
            .map_err(|_| OfflineError::Encryption(format!("chunk {} encryption failed", index)))?;

        let offset = data.len() as u64;
        data.extend_from_slice(&iv);
        data.extend_from_slice(&sealed);
        chunks.push(ChunkInfo {
            index,
            offset,
            size: (IV_SIZE + sealed.len()) as u64,
        });
    }

    Ok(EncryptedPayload { data, chunks })
}

/// Decrypt one sealed chunk expected at position `index`.
pub fn decrypt_chunk(sealed: &[u8], index: u32, key: &[u8; 32]) -> Result<Vec<u8>, OfflineError> {
    if sealed.len() < CHUNK_OVERHEAD {
        return Err(OfflineError::Encryption("sealed chunk too short".to_string()));
    }
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| OfflineError::Encryption(format!("invalid content key: {}", e)))?;
    let (iv, ciphertext) = sealed.split_at(IV_SIZE);
    let aad = chunk_aad(index);
    cipher
        .decrypt(Nonce::from_slice(iv), Payload { msg: ciphertext, aad: &aad })
        .map_err(|_| OfflineError::Encryption(format!("chunk {} authentication failed", index)))
}

/// Decrypt a whole object using its chunk table.
///
/// The table is untrusted input: entries must be in index order and lie
/// inside `data`.
pub fn decrypt_chunked(
    data: &[u8],
    chunks: &[ChunkInfo],
    key: &[u8; 32],
) -> Result<Vec<u8>, OfflineError> {
    let mut plaintext = Vec::with_capacity(data.len());
    for (position, chunk) in chunks.iter().enumerate() {
        if chunk.index as usize != position {
            return Err(OfflineError::Encryption(format!(
                "chunk {} listed at position {}",
                chunk.index, position
            )));
        }
        let out_of_bounds =
            || OfflineError::Encryption(format!("chunk {} out of bounds", chunk.index));
        let start = usize::try_from(chunk.offset).map_err(|_| out_of_bounds())?;
        let size = usize::try_from(chunk.size).map_err(|_| out_of_bounds())?;
        let end = start.checked_add(size).ok_or_else(out_of_bounds)?;
        let sealed = data.get(start..end).ok_or_else(out_of_bounds)?;
        plaintext.extend_from_slice(&decrypt_chunk(sealed, chunk.index, key)?);
    }
    Ok(plaintext)
}
