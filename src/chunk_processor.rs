//! Chunk processor (§4.1 ChunkProcessor, C1): turns one captured segment of
//! plaintext video into an encrypted, hashed, leaf-ready chunk.
//!
//! Encryption is CPU-bound, so like the teacher's pipeline stage that calls
//! `spawn_blocking` around AES-GCM, processing a chunk here runs on the
//! blocking thread pool rather than the async executor.

use tokio::task;

use crate::crypto::{self, NONCE_LEN};
use crate::error::{CoreError, CoreResult};
use crate::merkle::{leaf_hash, Hash};

/// The outcome of processing one captured chunk: everything the session
/// manager needs to persist a [`crate::store::models::DbChunkRecord`],
/// extend the session's Merkle tree, and enqueue an upload.
#[derive(Debug, Clone)]
pub struct ProcessedChunk {
    pub index: u32,
    pub plaintext_hash: [u8; 32],
    pub encrypted_hash: [u8; 32],
    pub encrypted_bytes: Vec<u8>,
    pub iv: [u8; NONCE_LEN],
    pub captured_at_millis: u64,
    pub size_bytes: u64,
}

impl ProcessedChunk {
    pub fn leaf(&self) -> Hash {
        leaf_hash(self.index, &self.plaintext_hash, &self.encrypted_hash, self.captured_at_millis)
    }
}

/// Encrypts and hashes one captured chunk of plaintext bytes under the
/// session key, deriving a per-chunk key from `chunk_index` (§4.1).
pub async fn process_chunk(
    session_key: [u8; crypto::SESSION_KEY_LEN],
    chunk_index: u32,
    plaintext: Vec<u8>,
    captured_at_millis: u64,
) -> CoreResult<ProcessedChunk> {
    task::spawn_blocking(move || {
        if plaintext.is_empty() {
            return Err(CoreError::InvalidArgument("chunk plaintext cannot be empty".into()));
        }
        let plaintext_hash = crypto::sha256(&plaintext);
        let chunk_key = crypto::derive_chunk_key(&session_key, chunk_index)?;
        let iv = crypto::random_nonce();
        let size_bytes = plaintext.len() as u64;
        let encrypted_bytes = crypto::aes_gcm_encrypt(&chunk_key, &iv, &plaintext)?;
        let encrypted_hash = crypto::sha256(&encrypted_bytes);

        Ok(ProcessedChunk {
            index: chunk_index,
            plaintext_hash,
            encrypted_hash,
            encrypted_bytes,
            iv,
            captured_at_millis,
            size_bytes,
        })
    })
    .await
    .map_err(|e| CoreError::CryptoFailure(format!("chunk processing task panicked: {e}")))?
}

/// Decrypts and verifies one chunk against its recorded hashes, as the
/// verification path does for every chunk in a manifest (§4.7 steps 2-3).
pub fn decrypt_and_verify_chunk(
    session_key: &[u8; crypto::SESSION_KEY_LEN],
    chunk_index: u32,
    iv: &[u8; NONCE_LEN],
    encrypted_bytes: &[u8],
    expected_encrypted_hash: &[u8; 32],
    expected_plaintext_hash: &[u8; 32],
) -> CoreResult<Vec<u8>> {
    let actual_encrypted_hash = crypto::sha256(encrypted_bytes);
    if &actual_encrypted_hash != expected_encrypted_hash {
        return Err(CoreError::Integrity(crate::error::IntegrityViolation::CiphertextHashMismatch {
            chunk_index,
        }));
    }

    let chunk_key = crypto::derive_chunk_key(session_key, chunk_index)?;
    let plaintext = crypto::aes_gcm_decrypt(&chunk_key, iv, encrypted_bytes)?;

    let actual_plaintext_hash = crypto::sha256(&plaintext);
    if &actual_plaintext_hash != expected_plaintext_hash {
        return Err(CoreError::Integrity(crate::error::IntegrityViolation::PlaintextHashMismatch {
            chunk_index,
        }));
    }

    Ok(plaintext)
}
