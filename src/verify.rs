//! Retrieval and verification path (§4.7 C7): reconstructs a session's
//! plaintext chunks from object storage and proves they match what was
//! anchored, independent of whether the local durable store still exists.

use std::sync::Arc;

use crate::anchor::AnchorLog;
use crate::chunk_processor;
use crate::crypto::{self, GROUP_SECRET_LEN};
use crate::error::{CoreError, CoreResult, IntegrityViolation};
use crate::group_secret::GroupSecretProvider;
use crate::manifest::{Manifest, ManifestManager, WrappedKey, MANIFEST_VERSION};
use crate::merkle;
use crate::object_store::ObjectStore;

pub struct VerifiedChunk {
    pub index: u32,
    pub plaintext: Vec<u8>,
}

/// Verifies a manifest against its anchored root and a caller-supplied group
/// id, then decrypts and verifies every chunk in order (§4.7 steps 1-6):
/// 1. fetch the manifest and the anchor entry for `content_id`
/// 2. recompute the Merkle root from the manifest's chunk descriptors
/// 3. compare manifest root, anchor root and recomputed root
/// 4. unwrap the session key using the caller's group secret
/// 5. fetch, verify and decrypt every chunk
/// 6. return the ordered plaintext chunks
pub async fn verify_session(
    content_id: &str,
    group_id: &str,
    manifest_manager: &ManifestManager,
    anchor_log: &dyn AnchorLog,
    object_store: &dyn ObjectStore,
    group_secrets: &dyn GroupSecretProvider,
    manifest_locator: &str,
) -> CoreResult<Vec<VerifiedChunk>> {
    let manifest: Manifest = manifest_manager.fetch(manifest_locator).await?;
    if manifest.content_id != content_id {
        return Err(CoreError::InvalidArgument(format!(
            "manifest content_id {} does not match requested {}",
            manifest.content_id, content_id
        )));
    }
    if manifest.version != MANIFEST_VERSION {
        return Err(CoreError::InvalidArgument(format!(
            "manifest version {} is not the supported version {}",
            manifest.version, MANIFEST_VERSION
        )));
    }

    let anchor_entry = anchor_log
        .get(content_id)
        .await?
        .ok_or_else(|| CoreError::InvalidArgument(format!("no anchor entry for {content_id}")))?;

    let computed_root = manifest.recompute_root()?;
    let computed_root_hex = crypto::hex_encode(&computed_root);

    if manifest.merkle_root != anchor_entry.merkle_root || manifest.merkle_root != computed_root_hex {
        return Err(CoreError::Integrity(IntegrityViolation::MerkleRootMismatch {
            manifest_root: manifest.merkle_root.clone(),
            anchor_root: anchor_entry.merkle_root.clone(),
            computed_root: computed_root_hex,
        }));
    }

    let wrapped: &WrappedKey = manifest.access_list.get(group_id).ok_or(CoreError::NoAccess)?;
    let group_secret: [u8; GROUP_SECRET_LEN] = group_secrets.secret_for(group_id).await?;
    let wrapped_key_bytes = hex::decode(&wrapped.wrapped_key).map_err(|e| CoreError::CryptoFailure(e.to_string()))?;
    let wrap_iv_bytes = hex::decode(&wrapped.iv).map_err(|e| CoreError::CryptoFailure(e.to_string()))?;
    let wrap_iv: [u8; crypto::NONCE_LEN] =
        wrap_iv_bytes.try_into().map_err(|_| CoreError::CryptoFailure("wrap iv has wrong length".into()))?;
    let session_key = crypto::unwrap_session_key(&wrapped_key_bytes, &wrap_iv, &group_secret)?;

    let mut verified = Vec::with_capacity(manifest.chunks.len());
    for descriptor in &manifest.chunks {
        let encrypted_bytes = object_store.get(&descriptor.object_locator).await?;
        let iv_bytes = hex::decode(&descriptor.iv).map_err(|e| CoreError::CryptoFailure(e.to_string()))?;
        let iv: [u8; crypto::NONCE_LEN] =
            iv_bytes.try_into().map_err(|_| CoreError::CryptoFailure("chunk iv has wrong length".into()))?;
        let expected_encrypted_hash = crypto::hex_decode_32(&descriptor.encrypted_hash)?;
        let expected_plaintext_hash = crypto::hex_decode_32(&descriptor.plaintext_hash)?;

        let plaintext = chunk_processor::decrypt_and_verify_chunk(
            &session_key,
            descriptor.index,
            &iv,
            &encrypted_bytes,
            &expected_encrypted_hash,
            &expected_plaintext_hash,
        )?;

        verified.push(VerifiedChunk { index: descriptor.index, plaintext });
    }

    Ok(verified)
}

/// Recomputes a root from a manifest's chunk descriptors and checks it
/// against an arbitrary externally-supplied root, without touching the
/// object store or anchor log — used by lightweight audits that only need
/// to confirm manifest/anchor agreement (§8 property 3).
pub fn roots_agree(manifest: &Manifest, anchor_root_hex: &str) -> CoreResult<bool> {
    let computed = manifest.recompute_root()?;
    Ok(crypto::hex_encode(&computed) == manifest.merkle_root && manifest.merkle_root == anchor_root_hex)
}
