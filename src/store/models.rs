//! Row types for the durable local store (§3 Session, §3 ChunkRecord).

use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Recording,
    Complete,
    Interrupted,
    Degraded,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Recording => "recording",
            SessionState::Complete => "complete",
            SessionState::Interrupted => "interrupted",
            SessionState::Degraded => "degraded",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "complete" => SessionState::Complete,
            "interrupted" => SessionState::Interrupted,
            "degraded" => SessionState::Degraded,
            _ => SessionState::Recording,
        }
    }
}

/// One recording session's durable, locally-held state (§3). The session key
/// is stored wrapped under the device's local key, never in the clear.
#[derive(Debug, Clone)]
pub struct DbSession {
    pub content_id: String,
    pub creator: String,
    pub session_key_wrapped: Vec<u8>,
    pub quota_bytes: i64,
    pub used_bytes: i64,
    pub state: String,
    pub manifest_locator: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DbSession {
    pub fn new(content_id: String, creator: String, session_key_wrapped: Vec<u8>, quota_bytes: i64) -> Self {
        let now = Utc::now();
        Self {
            content_id,
            creator,
            session_key_wrapped,
            quota_bytes,
            used_bytes: 0,
            state: SessionState::Recording.as_str().to_string(),
            manifest_locator: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[cfg(test)]
    pub fn new_test(content_id: &str) -> Self {
        // An empty JSON object is a valid (if useless) serialized `BTreeMap<String,
        // WrappedKey>` access list, so callers that round-trip through
        // `serde_json` don't need a real wrapped key for store-level tests.
        Self::new(content_id.to_string(), "test-creator".to_string(), b"{}".to_vec(), 1_000_000_000)
    }
}

/// A single captured-and-encrypted chunk's durable record (§3). Mirrors
/// `ChunkDescriptor` in [`crate::manifest`] but is keyed to its owning
/// session and carries the object store's upload confirmation separately
/// from the plaintext/encrypted hashes computed at capture time.
#[derive(Debug, Clone)]
pub struct DbChunkRecord {
    pub content_id: String,
    pub chunk_index: i64,
    pub object_locator: Option<String>,
    pub size_bytes: i64,
    pub duration_ms: i64,
    pub plaintext_hash: String,
    pub encrypted_hash: String,
    pub iv: String,
    pub captured_at: i64,
    pub uploaded_at: Option<i64>,
    /// Ciphertext buffered locally until the upload queue confirms it (C5,
    /// §4.7 step 2). Cleared once `object_locator` is set, so a session that
    /// finished uploading everything before a crash carries no dead weight.
    pub encrypted_bytes: Option<Vec<u8>>,
}

impl DbChunkRecord {
    #[cfg(test)]
    pub fn new_test(content_id: &str, chunk_index: i64) -> Self {
        Self {
            content_id: content_id.to_string(),
            chunk_index,
            object_locator: None,
            size_bytes: 1024,
            duration_ms: 2000,
            plaintext_hash: "0".repeat(64),
            encrypted_hash: "1".repeat(64),
            iv: "2".repeat(24),
            captured_at: 1000,
            uploaded_at: None,
            encrypted_bytes: Some(vec![0u8; 1024]),
        }
    }
}
