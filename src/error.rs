//! Error taxonomy for the streaming capture & evidence core.
//!
//! Kinds mirror the propagation policy: I/O failures are retried internally by
//! the upload queue and never surface to the capture producer; schema, crypto
//! and integrity failures always propagate.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("storage quota exhausted ({used_bytes}/{quota_bytes} bytes used)")]
    QuotaExhausted { used_bytes: u64, quota_bytes: u64 },

    #[error("object store failure: {0}")]
    ObjectStoreFailure(String),

    #[error("anchor log failure: {0}")]
    AnchorLogFailure(String),

    #[error("permanent failure after {retries} attempts: {source_error}")]
    PermanentFailure { retries: u32, source_error: String },

    #[error("crypto failure: {0}")]
    CryptoFailure(String),

    #[error(transparent)]
    Integrity(#[from] IntegrityViolation),

    #[error("no access: caller holds no group secret present in this manifest's access list")]
    NoAccess,

    #[error("durable store corruption: {0}")]
    Corruption(String),

    #[error("sqlite error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Integrity failures detected on the retrieval/verification path (§7).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IntegrityViolation {
    #[error("ciphertext hash mismatch at chunk {chunk_index}")]
    CiphertextHashMismatch { chunk_index: u32 },

    #[error("merkle root mismatch: manifest={manifest_root} anchor={anchor_root} computed={computed_root}")]
    MerkleRootMismatch {
        manifest_root: String,
        anchor_root: String,
        computed_root: String,
    },

    #[error("plaintext hash mismatch at chunk {chunk_index}")]
    PlaintextHashMismatch { chunk_index: u32 },
}

pub type CoreResult<T> = Result<T, CoreError>;

impl CoreError {
    /// True for errors the upload queue should retry with backoff rather than
    /// escalate immediately (§4.4, §7).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CoreError::ObjectStoreFailure(_) | CoreError::AnchorLogFailure(_)
        )
    }
}
