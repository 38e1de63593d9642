//! Startup recovery (§4.7): reconciles whatever the durable store remembers
//! from before a crash or restart, before any new session is allowed to
//! start. [`scan`] surfaces a per-session recovery summary; callers decide,
//! per session, whether to [`resume`] or [`discard`] it.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::anchor::{AnchorEntry, AnchorLog};
use crate::config::RetryConfig;
use crate::crypto;
use crate::error::{CoreError, CoreResult};
use crate::manifest::{self, ChunkDescriptor, EncryptionInfo, Manifest, ManifestManager, SessionStatus, WrappedKey};
use crate::object_store::ObjectStore;
use crate::queue::{QueueEvent, QueueItem, UploadQueue};
use crate::store::models::SessionState;
use crate::store::DurableStore;

/// One session's recovery-time standing (§4.7): enough for a caller to decide
/// between resuming and discarding without re-deriving it from raw rows.
#[derive(Debug, Clone)]
pub struct RecoverySummary {
    pub content_id: String,
    pub chunk_count: i64,
    pub pending: i64,
    /// Pending chunks whose locally-buffered ciphertext did not survive the
    /// crash. This store doesn't persist a chunk-level terminal-failure state
    /// distinct from "pending" — a chunk is either uploaded, pending with
    /// bytes, or pending without them — so `failed` counts the last of those.
    pub failed: i64,
    pub created_at: DateTime<Utc>,
}

/// Lists every non-terminal session with a recovery summary (§4.7 step 1).
/// Read-only: takes no action on any session.
pub async fn scan(store: &DurableStore) -> CoreResult<Vec<RecoverySummary>> {
    let incomplete = store.get_incomplete_sessions().await?;
    let mut summaries = Vec::with_capacity(incomplete.len());
    for session in incomplete {
        let chunks = store.get_chunks_for_session(&session.content_id).await?;
        let pending = chunks.iter().filter(|c| c.object_locator.is_none());
        let pending_count = pending.clone().count() as i64;
        let failed = pending.filter(|c| c.encrypted_bytes.is_none()).count() as i64;
        summaries.push(RecoverySummary {
            content_id: session.content_id,
            chunk_count: chunks.len() as i64,
            pending: pending_count,
            failed,
            created_at: session.created_at,
        });
    }
    Ok(summaries)
}

#[derive(Debug, Clone, Default)]
pub struct RecoveryReport {
    pub chunks_resubmitted: usize,
    pub degraded: bool,
    pub manifest_locator: Option<String>,
}

/// Resumes one interrupted session (§4.7 `resume`): re-enqueues every pending
/// chunk whose ciphertext is still buffered locally, then rebuilds and
/// re-anchors the manifest over whatever prefix is now confirmed uploaded —
/// catching the anchored root up to the re-uploaded chunks, the gap the
/// previous reconciliation pass left open. A session with no losses ends in
/// `recording`, ready to keep accepting chunks or to be finalized; a session
/// missing any chunk's bytes ends in `degraded`.
pub async fn resume(
    store: Arc<DurableStore>,
    object_store: Arc<dyn ObjectStore>,
    anchor_log: Arc<dyn AnchorLog>,
    retry: RetryConfig,
    content_id: &str,
) -> CoreResult<RecoveryReport> {
    let pending = store.get_pending_chunks(content_id).await?;
    let mut report = RecoveryReport::default();

    if !pending.is_empty() {
        let (queue, mut events) = UploadQueue::spawn(object_store.clone(), retry);
        let mut expected = 0usize;

        for chunk in &pending {
            match &chunk.encrypted_bytes {
                Some(bytes) => {
                    queue.enqueue(QueueItem { item_id: chunk.chunk_index.to_string(), bytes: bytes.clone() }).await;
                    expected += 1;
                }
                None => {
                    warn!(
                        content_id,
                        chunk_index = chunk.chunk_index,
                        "pending chunk has no buffered ciphertext, cannot resubmit"
                    );
                    report.degraded = true;
                }
            }
        }

        let mut completed = 0usize;
        while completed < expected {
            match events.recv().await {
                Some(QueueEvent::ItemCompleted { item_id, locator }) => {
                    if let Ok(chunk_index) = item_id.parse::<i64>() {
                        let uploaded_at = chrono::Utc::now().timestamp_millis();
                        store.mark_chunk_uploaded(content_id, chunk_index, &locator, uploaded_at).await?;
                        report.chunks_resubmitted += 1;
                    }
                    completed += 1;
                }
                Some(QueueEvent::ItemFailed { .. }) => {
                    report.degraded = true;
                    completed += 1;
                }
                Some(QueueEvent::ItemRetryScheduled { .. }) => continue,
                None => break,
            }
        }
    }

    let chunk_records = store.get_chunks_for_session(content_id).await?;
    let has_uploaded_chunk = chunk_records.iter().any(|c| c.object_locator.is_some());
    report.manifest_locator = if has_uploaded_chunk {
        Some(rebuild_and_anchor(&store, &object_store, &anchor_log, content_id).await?)
    } else {
        None
    };

    let session = store
        .get_session(content_id)
        .await?
        .ok_or_else(|| CoreError::InvalidArgument(format!("unknown session: {content_id}")))?;
    let state = if report.degraded { SessionState::Degraded } else { SessionState::Recording };
    store
        .update_session_progress(
            content_id,
            session.used_bytes,
            state.as_str(),
            report.manifest_locator.as_deref().or(session.manifest_locator.as_deref()),
        )
        .await?;

    info!(content_id, chunks_resubmitted = report.chunks_resubmitted, degraded = report.degraded, "session resumed");
    Ok(report)
}

/// Discards an interrupted session (§4.7 `discard`): purges every chunk row
/// so nothing is left to resubmit or anchor, and marks the session
/// `interrupted` as its terminal state.
pub async fn discard(store: &DurableStore, content_id: &str) -> CoreResult<()> {
    let session = store
        .get_session(content_id)
        .await?
        .ok_or_else(|| CoreError::InvalidArgument(format!("unknown session: {content_id}")))?;
    store.delete_chunks_for_session(content_id).await?;
    store
        .update_session_progress(content_id, 0, SessionState::Interrupted.as_str(), session.manifest_locator.as_deref())
        .await?;
    info!(content_id, "session discarded");
    Ok(())
}

/// Rebuilds a manifest from every currently-uploaded chunk record and
/// anchors it. Used by [`resume`] instead of [`crate::session::SessionManager`]'s
/// own anchoring path because after a restart there is no in-memory Merkle
/// tree to consult — every leaf is recomputed from durable chunk records
/// (§4.2), the same normative computation `Manifest::recompute_root` already
/// performs over a finished manifest's chunk list.
async fn rebuild_and_anchor(
    store: &DurableStore,
    object_store: &Arc<dyn ObjectStore>,
    anchor_log: &Arc<dyn AnchorLog>,
    content_id: &str,
) -> CoreResult<String> {
    let session = store
        .get_session(content_id)
        .await?
        .ok_or_else(|| CoreError::InvalidArgument(format!("unknown session: {content_id}")))?;
    let access_list: BTreeMap<String, WrappedKey> = serde_json::from_slice(&session.session_key_wrapped)?;

    let chunk_records = store.get_chunks_for_session(content_id).await?;
    let chunks: Vec<ChunkDescriptor> = chunk_records
        .iter()
        .filter(|c| c.object_locator.is_some())
        .map(|c| ChunkDescriptor {
            index: c.chunk_index as u32,
            object_locator: c.object_locator.clone().unwrap_or_default(),
            size_bytes: c.size_bytes as u64,
            duration_ms: c.duration_ms as u64,
            plaintext_hash: c.plaintext_hash.clone(),
            encrypted_hash: c.encrypted_hash.clone(),
            iv: c.iv.clone(),
            captured_at: c.captured_at,
            uploaded_at: c.uploaded_at.unwrap_or(0),
        })
        .collect();

    let root = manifest::compute_root(&chunks)?;
    let merkle_root_hex = crypto::hex_encode(&root);
    let chunk_count = chunks.len() as u32;
    let group_set: Vec<String> = access_list.keys().cloned().collect();

    let rebuilt = Manifest {
        version: manifest::MANIFEST_VERSION,
        content_id: content_id.to_string(),
        creator: session.creator.clone(),
        capture_started: session.created_at,
        last_updated: Utc::now(),
        chunks,
        merkle_root: merkle_root_hex.clone(),
        encryption: EncryptionInfo::default(),
        access_list,
        status: SessionStatus::Recording,
    };

    let manifest_manager = ManifestManager::new(object_store.clone());
    let manifest_locator = manifest_manager.upload(&rebuilt).await?;

    anchor_log
        .anchor(AnchorEntry {
            content_id: content_id.to_string(),
            creator: session.creator,
            merkle_root: merkle_root_hex,
            manifest_locator: manifest_locator.clone(),
            chunk_count,
            group_set,
            anchored_at: Utc::now().timestamp_millis(),
        })
        .await?;

    Ok(manifest_locator)
}
