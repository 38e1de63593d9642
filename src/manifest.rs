//! Versioned, content-addressed session manifest (§3 Manifest, §4.3).
//!
//! Serialization must be byte-identical across processes for a given logical
//! state so that the object store's content addressing actually deduplicates
//! identical manifest versions. `accessList` is stored as a `BTreeMap` rather
//! than a `HashMap` specifically so key order is canonical — see DESIGN.md for
//! why this resolves the spec's open question on access-list ordering.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::merkle::{self, Hash};
use crate::object_store::ObjectStore;

pub const MANIFEST_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Recording,
    Complete,
    Interrupted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkDescriptor {
    pub index: u32,
    pub object_locator: String,
    pub size_bytes: u64,
    pub duration_ms: u64,
    pub plaintext_hash: String,
    pub encrypted_hash: String,
    pub iv: String,
    pub captured_at: i64,
    pub uploaded_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptionInfo {
    pub algorithm: String,
    pub key_derivation: String,
}

impl Default for EncryptionInfo {
    fn default() -> Self {
        Self {
            algorithm: "aes-256-gcm".to_string(),
            key_derivation: "hkdf-sha256".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WrappedKey {
    pub wrapped_key: String,
    pub iv: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    pub content_id: String,
    pub creator: String,
    pub capture_started: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub chunks: Vec<ChunkDescriptor>,
    pub merkle_root: String,
    pub encryption: EncryptionInfo,
    pub access_list: BTreeMap<String, WrappedKey>,
    pub status: SessionStatus,
}

impl Manifest {
    /// Invariant M1: `chunks[i].index == i` for all `i`.
    pub fn has_contiguous_indices(&self) -> bool {
        self.chunks.iter().enumerate().all(|(i, c)| c.index as usize == i)
    }

    /// Invariant M2: `merkleRoot == root(computeLeaves(chunks))`.
    pub fn recompute_root(&self) -> CoreResult<Hash> {
        compute_root(&self.chunks)
    }
}

/// Recomputes each descriptor's leaf hash in order (§4.2 normative layout).
/// Shared by [`Manifest::recompute_root`] and by callers that only have a
/// chunk list on hand — notably [`crate::recovery`], which rebuilds a
/// session's root from durable records with no in-memory Merkle tree to
/// consult after a restart.
pub fn compute_leaves(chunks: &[ChunkDescriptor]) -> CoreResult<Vec<Hash>> {
    chunks
        .iter()
        .map(|c| {
            let plaintext_hash = crate::crypto::hex_decode_32(&c.plaintext_hash)?;
            let encrypted_hash = crate::crypto::hex_decode_32(&c.encrypted_hash)?;
            Ok(merkle::leaf_hash(c.index, &plaintext_hash, &encrypted_hash, c.captured_at as u64))
        })
        .collect()
}

pub fn compute_root(chunks: &[ChunkDescriptor]) -> CoreResult<Hash> {
    let leaves = compute_leaves(chunks)?;
    merkle::root_of(&leaves).ok_or_else(|| CoreError::InvalidArgument("manifest has no chunks".into()))
}

/// Pure projection `session state -> manifest bytes`, plus the one-upload
/// side effect of pushing those bytes to the object store (§4.3, §9 builder
/// note: manifest construction is a terminal projection, not an accumulator).
#[derive(Clone)]
pub struct ManifestManager {
    object_store: std::sync::Arc<dyn ObjectStore>,
}

impl ManifestManager {
    pub fn new(object_store: std::sync::Arc<dyn ObjectStore>) -> Self {
        Self { object_store }
    }

    /// Serializes a manifest deterministically. Field order in `Manifest` is
    /// fixed by its struct declaration and `serde_json` preserves it, and
    /// `access_list` is a `BTreeMap` so its keys serialize in canonical order.
    pub fn serialize(manifest: &Manifest) -> CoreResult<Vec<u8>> {
        Ok(serde_json::to_vec(manifest)?)
    }

    pub fn deserialize(bytes: &[u8]) -> CoreResult<Manifest> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Uploads a manifest version and returns its locator. Two uploads of
    /// "the same" logical state taken at different wall-clock times are
    /// allowed to produce different locators, because `last_updated` is
    /// inside the addressed payload (§4.3 determinism note).
    pub async fn upload(&self, manifest: &Manifest) -> CoreResult<String> {
        let bytes = Self::serialize(manifest)?;
        self.object_store.put(&bytes).await
    }

    pub async fn fetch(&self, locator: &str) -> CoreResult<Manifest> {
        let bytes = self.object_store.get(locator).await?;
        Self::deserialize(&bytes)
    }
}
