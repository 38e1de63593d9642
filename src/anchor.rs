//! Anchor log collaborator (§6): an external authenticated append-only log
//! that binds one content id to the creator that first anchored it.
//!
//! This module only defines the contract and an in-memory double for tests —
//! there is no production implementation bundled here because the spec
//! treats the anchor log as pluggable external infrastructure (a transparency
//! log, a blockchain, a notarization service), the same way the teacher treats
//! `CloudStorage` as an injected collaborator behind a trait object.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnchorEntry {
    pub content_id: String,
    pub creator: String,
    pub merkle_root: String,
    pub manifest_locator: String,
    /// Number of chunks committed by `merkle_root` (§3, §8 property 10:
    /// `anchor.chunkCount == |manifest.chunks|`).
    pub chunk_count: u32,
    /// Group ids that can unwrap the session key as of this anchor (§4.6
    /// `updateSession(..., chunkCount, groupSet)`).
    pub group_set: Vec<String>,
    pub anchored_at: i64,
}

#[async_trait::async_trait]
pub trait AnchorLog: Send + Sync {
    /// Anchors `entry`. Idempotent when called again with identical fields
    /// for a `content_id` already anchored by the same creator (§4.6 single-
    /// writer invariant); returns [`CoreError::NoAccess`] if a different
    /// creator attempts to anchor the same `content_id`.
    async fn anchor(&self, entry: AnchorEntry) -> CoreResult<()>;

    /// Fetches the most recently anchored entry for a content id, if any.
    async fn get(&self, content_id: &str) -> CoreResult<Option<AnchorEntry>>;
}

/// Test double enforcing the single-writer invariant in memory. Anchoring the
/// same `content_id` with the same `creator` again overwrites the stored
/// entry (e.g. a later chunk advances `merkle_root`); anchoring it with a
/// different `creator` is rejected.
#[derive(Clone, Default)]
pub struct InMemoryAnchorLog {
    entries: Arc<Mutex<HashMap<String, AnchorEntry>>>,
    failing: Arc<Mutex<bool>>,
}

impl InMemoryAnchorLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock().unwrap() = failing;
    }
}

#[async_trait::async_trait]
impl AnchorLog for InMemoryAnchorLog {
    async fn anchor(&self, entry: AnchorEntry) -> CoreResult<()> {
        if *self.failing.lock().unwrap() {
            return Err(CoreError::AnchorLogFailure("simulated anchor log outage".into()));
        }
        let mut entries = self.entries.lock().unwrap();
        if let Some(existing) = entries.get(&entry.content_id) {
            if existing.creator != entry.creator {
                return Err(CoreError::NoAccess);
            }
        }
        entries.insert(entry.content_id.clone(), entry);
        Ok(())
    }

    async fn get(&self, content_id: &str) -> CoreResult<Option<AnchorEntry>> {
        if *self.failing.lock().unwrap() {
            return Err(CoreError::AnchorLogFailure("simulated anchor log outage".into()));
        }
        Ok(self.entries.lock().unwrap().get(content_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(content_id: &str, creator: &str, root: &str) -> AnchorEntry {
        AnchorEntry {
            content_id: content_id.to_string(),
            creator: creator.to_string(),
            merkle_root: root.to_string(),
            manifest_locator: format!("locator-{root}"),
            chunk_count: 1,
            group_set: vec!["group-a".to_string()],
            anchored_at: 1000,
        }
    }

    #[tokio::test]
    async fn re_anchoring_same_creator_overwrites() {
        let log = InMemoryAnchorLog::new();
        log.anchor(entry("session-1", "alice", "root-a")).await.unwrap();
        log.anchor(entry("session-1", "alice", "root-b")).await.unwrap();
        let latest = log.get("session-1").await.unwrap().unwrap();
        assert_eq!(latest.merkle_root, "root-b");
    }

    #[tokio::test]
    async fn different_creator_is_rejected() {
        let log = InMemoryAnchorLog::new();
        log.anchor(entry("session-1", "alice", "root-a")).await.unwrap();
        let result = log.anchor(entry("session-1", "mallory", "root-evil")).await;
        assert!(matches!(result, Err(CoreError::NoAccess)));
    }

    #[tokio::test]
    async fn unknown_content_id_returns_none() {
        let log = InMemoryAnchorLog::new();
        assert!(log.get("nonexistent").await.unwrap().is_none());
    }
}
