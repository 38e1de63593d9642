//! Session manager (§4.6, C6): the core's public surface. Owns one
//! [`crate::merkle::MerkleTree`] and one [`crate::queue::UploadQueue`] per
//! active recording session, and is the only component allowed to mutate a
//! session's durable row.
//!
//! `SessionManager` is cheaply `Clone` (every field is an `Arc` or plain
//! config data) so the upload queue's completion-forwarding task can hold
//! its own handle back into the manager without a cyclic reference.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::warn;

use crate::anchor::{AnchorEntry, AnchorLog};
use crate::chunk_processor::{self, ProcessedChunk};
use crate::config::Config;
use crate::crypto::{self, GROUP_SECRET_LEN};
use crate::error::{CoreError, CoreResult};
use crate::group_secret::GroupSecretProvider;
use crate::manifest::{ChunkDescriptor, EncryptionInfo, Manifest, ManifestManager, SessionStatus, WrappedKey};
use crate::merkle::{self, MerkleTree};
use crate::object_store::ObjectStore;
use crate::queue::{QueueEvent, QueueItem, UploadQueue};
use crate::store::models::{DbChunkRecord, DbSession, SessionState};
use crate::store::DurableStore;

struct ActiveSession {
    session_key: [u8; crypto::SESSION_KEY_LEN],
    merkle: MerkleTree,
    next_index: u32,
    queue: UploadQueue,
}

/// Orchestrates capture, encryption, Merkle accumulation, durable
/// persistence and upload for every in-flight session.
#[derive(Clone)]
pub struct SessionManager {
    store: Arc<DurableStore>,
    object_store: Arc<dyn ObjectStore>,
    anchor_log: Arc<dyn AnchorLog>,
    group_secrets: Arc<dyn GroupSecretProvider>,
    manifest_manager: ManifestManager,
    config: Config,
    active: Arc<Mutex<HashMap<String, ActiveSession>>>,
}

impl SessionManager {
    /// Generates a fresh content id for a new session, the same way the
    /// teacher generates a library id when none is configured.
    pub fn new_content_id() -> String {
        uuid::Uuid::new_v4().to_string()
    }

    pub fn new(
        store: Arc<DurableStore>,
        object_store: Arc<dyn ObjectStore>,
        anchor_log: Arc<dyn AnchorLog>,
        group_secrets: Arc<dyn GroupSecretProvider>,
        config: Config,
    ) -> Self {
        let manifest_manager = ManifestManager::new(object_store.clone());
        Self {
            store,
            object_store,
            anchor_log,
            group_secrets,
            manifest_manager,
            config,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Starts a new recording session (§4.6 step 1): generates a session
    /// key, wraps it for every group in `group_ids`, and persists the
    /// session row before any chunk is accepted.
    pub async fn start_session(
        &self,
        content_id: &str,
        creator: &str,
        quota_bytes: i64,
        group_ids: &[String],
    ) -> CoreResult<()> {
        if content_id.trim().is_empty() {
            return Err(CoreError::InvalidArgument("content_id cannot be empty".into()));
        }
        if group_ids.is_empty() {
            return Err(CoreError::InvalidArgument(
                "group_ids cannot be empty: a session must grant access to at least one group".into(),
            ));
        }
        let session_key = crypto::random_session_key();

        let mut access_list = BTreeMap::new();
        for group_id in group_ids {
            let secret: [u8; GROUP_SECRET_LEN] = self.group_secrets.secret_for(group_id).await?;
            let (wrapped, iv) = crypto::wrap_session_key(&session_key, &secret)?;
            access_list.insert(
                group_id.clone(),
                WrappedKey { wrapped_key: crypto::hex_encode(&wrapped), iv: crypto::hex_encode(&iv) },
            );
        }

        let session_key_wrapped = serde_json::to_vec(&access_list)?;
        let db_session = DbSession::new(content_id.to_string(), creator.to_string(), session_key_wrapped, quota_bytes);
        self.store.insert_session(&db_session).await?;

        let (queue, mut events) = UploadQueue::spawn(self.object_store.clone(), self.config.retry);

        let manager = self.clone();
        let content_id_owned = content_id.to_string();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if let QueueEvent::ItemCompleted { item_id, locator } = event {
                    let Ok(chunk_index) = item_id.parse::<i64>() else { continue };
                    if let Err(err) = manager.on_chunk_confirmed(&content_id_owned, chunk_index, &locator).await {
                        warn!(content_id = %content_id_owned, chunk_index, error = %err, "failed to anchor after chunk upload");
                    }
                }
            }
        });

        self.active.lock().await.insert(
            content_id.to_string(),
            ActiveSession { session_key, merkle: MerkleTree::new(), next_index: 0, queue },
        );
        Ok(())
    }

    /// Ingests one captured plaintext chunk (§4.1, §4.6 step 2: `processChunk(rawBytes,
    /// durationMs)`): encrypts it, enforces the quota thresholds, persists the durable
    /// record, extends the Merkle tree and enqueues the ciphertext for upload. Empty
    /// blobs are dropped silently without consuming an index (§4.6).
    pub async fn ingest_chunk(
        &self,
        content_id: &str,
        plaintext: Vec<u8>,
        captured_at_millis: u64,
        duration_ms: u64,
    ) -> CoreResult<Option<u32>> {
        if plaintext.is_empty() {
            return Ok(None);
        }

        let mut guard = self.active.lock().await;
        let active = guard
            .get_mut(content_id)
            .ok_or_else(|| CoreError::InvalidArgument(format!("no active session: {content_id}")))?;

        let session = self
            .store
            .get_session(content_id)
            .await?
            .ok_or_else(|| CoreError::InvalidArgument(format!("unknown session: {content_id}")))?;

        // `used_bytes` gauges locally-buffered, not-yet-durably-offloaded data, so the
        // gate looks at the store's *current* footprint, not a hypothetical footprint
        // after this chunk lands (§4.5/§5/§7, S6): a chunk that would overshoot the
        // reject fraction is still accepted as long as the store wasn't already over
        // it, and `used_bytes` shrinks back down as earlier chunks are confirmed
        // uploaded and their local buffers freed (see `on_chunk_confirmed`).
        let reject_threshold = (session.quota_bytes as f64 * self.config.quota_reject_fraction) as u64;
        if session.used_bytes as u64 >= reject_threshold {
            return Err(CoreError::QuotaExhausted { used_bytes: session.used_bytes as u64, quota_bytes: session.quota_bytes as u64 });
        }

        let index = active.next_index;
        let processed: ProcessedChunk =
            chunk_processor::process_chunk(active.session_key, index, plaintext, captured_at_millis).await?;

        let record = DbChunkRecord {
            content_id: content_id.to_string(),
            chunk_index: index as i64,
            object_locator: None,
            size_bytes: processed.size_bytes as i64,
            duration_ms: duration_ms as i64,
            plaintext_hash: crypto::hex_encode(&processed.plaintext_hash),
            encrypted_hash: crypto::hex_encode(&processed.encrypted_hash),
            iv: crypto::hex_encode(&processed.iv),
            captured_at: processed.captured_at_millis as i64,
            uploaded_at: None,
            encrypted_bytes: Some(processed.encrypted_bytes.clone()),
        };
        self.store.insert_chunk_record(&record).await?;

        active.merkle.insert(processed.leaf());
        active.next_index += 1;

        let incoming_size = processed.size_bytes;
        let projected_used = session.used_bytes as u64 + incoming_size;
        self.store
            .update_session_progress(
                content_id,
                projected_used as i64,
                SessionState::Recording.as_str(),
                session.manifest_locator.as_deref(),
            )
            .await?;

        let warn_threshold = (session.quota_bytes as f64 * self.config.quota_warn_fraction) as u64;
        if projected_used >= warn_threshold {
            warn!(
                content_id,
                used_bytes = projected_used,
                quota_bytes = session.quota_bytes,
                "storageLow: session crossed quota_warn_fraction"
            );
        }

        active
            .queue
            .enqueue(QueueItem { item_id: index.to_string(), bytes: processed.encrypted_bytes })
            .await;

        Ok(Some(index))
    }

    /// Rebuilds, uploads and anchors the manifest over every chunk confirmed
    /// so far (§4.6: "after each successful upload+manifest+anchor triple").
    /// Chunks complete in ascending index order because the upload queue is
    /// single-in-flight FIFO, so the confirmed prefix is always contiguous.
    async fn on_chunk_confirmed(&self, content_id: &str, chunk_index: i64, locator: &str) -> CoreResult<()> {
        let uploaded_at = chrono::Utc::now().timestamp_millis();
        self.store.mark_chunk_uploaded(content_id, chunk_index, locator, uploaded_at).await?;
        self.release_confirmed_bytes(content_id, chunk_index).await?;
        self.anchor_current_state(content_id, chunk_index, SessionStatus::Recording).await?;
        Ok(())
    }

    /// Frees a confirmed chunk's share of `used_bytes` (C2: its raw/encrypted
    /// bytes survive locally only until upload confirms, at which point the
    /// object store is the durable copy and the quota gate no longer needs
    /// to account for it).
    async fn release_confirmed_bytes(&self, content_id: &str, chunk_index: i64) -> CoreResult<()> {
        let records = self.store.get_chunks_for_session(content_id).await?;
        let Some(record) = records.iter().find(|c| c.chunk_index == chunk_index) else {
            return Ok(());
        };
        let session = self
            .store
            .get_session(content_id)
            .await?
            .ok_or_else(|| CoreError::InvalidArgument(format!("unknown session: {content_id}")))?;
        let remaining = (session.used_bytes - record.size_bytes).max(0);
        self.store
            .update_session_progress(content_id, remaining, &session.state, session.manifest_locator.as_deref())
            .await?;
        Ok(())
    }

    async fn anchor_current_state(&self, content_id: &str, up_to_index: i64, status: SessionStatus) -> CoreResult<String> {
        let session = self
            .store
            .get_session(content_id)
            .await?
            .ok_or_else(|| CoreError::InvalidArgument(format!("unknown session: {content_id}")))?;
        let access_list: BTreeMap<String, WrappedKey> = serde_json::from_slice(&session.session_key_wrapped)?;

        let chunk_records = self.store.get_chunks_for_session(content_id).await?;
        let chunks: Vec<ChunkDescriptor> = chunk_records
            .iter()
            .filter(|c| c.chunk_index <= up_to_index && c.object_locator.is_some())
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

        let merkle_root_hex = {
            let guard = self.active.lock().await;
            let leaves = guard.get(content_id).map(|s| s.merkle.leaves().to_vec()).unwrap_or_default();
            let prefix_len = (up_to_index as usize + 1).min(leaves.len());
            merkle::root_of(&leaves[..prefix_len])
                .map(|root| crypto::hex_encode(&root))
                .ok_or_else(|| CoreError::InvalidArgument("cannot anchor a session with no confirmed chunks".into()))?
        };

        let chunk_count = chunks.len() as u32;
        let group_set: Vec<String> = access_list.keys().cloned().collect();

        let manifest = Manifest {
            version: self.config.manifest_version,
            content_id: content_id.to_string(),
            creator: session.creator.clone(),
            capture_started: session.created_at,
            last_updated: chrono::Utc::now(),
            chunks,
            merkle_root: merkle_root_hex.clone(),
            encryption: EncryptionInfo::default(),
            access_list,
            status,
        };

        let manifest_locator = self.manifest_manager.upload(&manifest).await?;

        self.anchor_log
            .anchor(AnchorEntry {
                content_id: content_id.to_string(),
                creator: session.creator,
                merkle_root: merkle_root_hex,
                manifest_locator: manifest_locator.clone(),
                chunk_count,
                group_set,
                anchored_at: chrono::Utc::now().timestamp_millis(),
            })
            .await?;

        let state = match status {
            SessionStatus::Complete => SessionState::Complete,
            SessionStatus::Interrupted => SessionState::Interrupted,
            SessionStatus::Recording => SessionState::Recording,
        };
        self.store
            .update_session_progress(content_id, session.used_bytes, state.as_str(), Some(&manifest_locator))
            .await?;

        Ok(manifest_locator)
    }

    /// Finalizes a session (§4.6 step 3): waits for every outstanding upload
    /// to confirm, then forces one terminal manifest upload and anchor whose
    /// `chunks[]` is complete.
    pub async fn finalize_session(&self, content_id: &str) -> CoreResult<String> {
        let chunk_records = self.store.get_chunks_for_session(content_id).await?;
        if chunk_records.is_empty() {
            return Err(CoreError::InvalidArgument(format!("session {content_id} has no chunks to finalize")));
        }
        if chunk_records.iter().any(|c| c.object_locator.is_none()) {
            return Err(CoreError::InvalidArgument(format!(
                "session {content_id} has chunks still pending upload"
            )));
        }

        let last_index = chunk_records.iter().map(|c| c.chunk_index).max().unwrap();
        let manifest_locator = self.anchor_current_state(content_id, last_index, SessionStatus::Complete).await?;
        self.active.lock().await.remove(content_id);
        Ok(manifest_locator)
    }

    /// Marks a session `interrupted` without forcing a drain (§4.6); durable
    /// state is left intact for [`crate::recovery::scan`] and
    /// [`crate::recovery::resume`]/[`crate::recovery::discard`] to reconcile.
    pub async fn mark_interrupted(&self, content_id: &str) -> CoreResult<()> {
        let session = self
            .store
            .get_session(content_id)
            .await?
            .ok_or_else(|| CoreError::InvalidArgument(format!("unknown session: {content_id}")))?;
        self.store
            .update_session_progress(content_id, session.used_bytes, SessionState::Interrupted.as_str(), session.manifest_locator.as_deref())
            .await?;
        self.active.lock().await.remove(content_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anchor::InMemoryAnchorLog;
    use crate::group_secret::InMemoryGroupSecretProvider;
    use crate::object_store::InMemoryObjectStore;

    async fn test_manager() -> (SessionManager, Arc<InMemoryObjectStore>, Arc<InMemoryAnchorLog>) {
        let store = Arc::new(DurableStore::in_memory().await.unwrap());
        let object_store = Arc::new(InMemoryObjectStore::new());
        let anchor_log = Arc::new(InMemoryAnchorLog::new());
        let group_secrets = Arc::new(InMemoryGroupSecretProvider::new());
        group_secrets.insert("group-a", [7u8; GROUP_SECRET_LEN]);
        let manager = SessionManager::new(store, object_store.clone(), anchor_log.clone(), group_secrets, Config::default());
        (manager, object_store, anchor_log)
    }

    fn groups() -> Vec<String> {
        vec!["group-a".to_string()]
    }

    async fn wait_for_chunk_count(store: &DurableStore, content_id: &str, expected: usize) {
        for _ in 0..50 {
            let chunks = store.get_chunks_for_session(content_id).await.unwrap();
            if chunks.iter().filter(|c| c.object_locator.is_some()).count() >= expected {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {expected} confirmed chunks");
    }

    #[tokio::test]
    async fn three_chunk_happy_path_finalizes_and_anchors() {
        let (manager, object_store, anchor_log) = test_manager().await;
        manager.start_session("session-1", "alice", 1_000_000, &groups()).await.unwrap();

        for i in 0..3u32 {
            let index = manager
                .ingest_chunk("session-1", format!("chunk-{i}").into_bytes(), 1000 * i as u64, 2000)
                .await
                .unwrap();
            assert_eq!(index, Some(i));
        }

        let store = manager.store.clone();
        wait_for_chunk_count(&store, "session-1", 3).await;
        assert_eq!(object_store.len(), 3);

        let locator = manager.finalize_session("session-1").await.unwrap();
        assert!(!locator.is_empty());

        let anchored = anchor_log.get("session-1").await.unwrap().unwrap();
        assert_eq!(anchored.creator, "alice");
        assert_eq!(anchored.chunk_count, 3);
        assert_eq!(anchored.group_set, groups());
    }

    #[tokio::test]
    async fn empty_chunk_is_dropped_without_consuming_an_index() {
        let (manager, _object_store, _anchor_log) = test_manager().await;
        manager.start_session("session-empty", "alice", 1_000_000, &groups()).await.unwrap();
        let result = manager.ingest_chunk("session-empty", Vec::new(), 0, 2000).await.unwrap();
        assert_eq!(result, None);
        let next = manager.ingest_chunk("session-empty", vec![1, 2, 3], 0, 2000).await.unwrap();
        assert_eq!(next, Some(0));
    }

    #[tokio::test]
    async fn start_session_rejects_empty_group_set() {
        let (manager, _object_store, _anchor_log) = test_manager().await;
        let result = manager.start_session("session-no-groups", "alice", 1_000_000, &[]).await;
        assert!(matches!(result, Err(CoreError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn ingest_beyond_quota_is_rejected() {
        let (manager, _object_store, _anchor_log) = test_manager().await;
        manager.start_session("session-quota", "alice", 10, &groups()).await.unwrap();

        // The gate looks at current usage, so a single chunk that overshoots
        // the reject fraction is still accepted...
        let first = manager.ingest_chunk("session-quota", vec![0u8; 20], 0, 0).await.unwrap();
        assert_eq!(first, Some(0));

        // ...but the next one is rejected now that the store is already over
        // the reject fraction.
        let result = manager.ingest_chunk("session-quota", vec![0u8; 1], 0, 0).await;
        assert!(matches!(result, Err(CoreError::QuotaExhausted { .. })));
    }

    #[tokio::test]
    async fn ingest_on_unknown_session_fails() {
        let (manager, _object_store, _anchor_log) = test_manager().await;
        let result = manager.ingest_chunk("missing", vec![1, 2, 3], 0, 0).await;
        assert!(matches!(result, Err(CoreError::InvalidArgument(_))));
    }
}
