//! Group secret resolution (§6): an injected collaborator that maps a group
//! id to the shared secret used to wrap/unwrap session keys for that group's
//! members (§3 access list).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::crypto::GROUP_SECRET_LEN;
use crate::error::{CoreError, CoreResult};

#[async_trait::async_trait]
pub trait GroupSecretProvider: Send + Sync {
    async fn secret_for(&self, group_id: &str) -> CoreResult<[u8; GROUP_SECRET_LEN]>;
}

#[derive(Clone, Default)]
pub struct InMemoryGroupSecretProvider {
    secrets: Arc<Mutex<HashMap<String, [u8; GROUP_SECRET_LEN]>>>,
}

impl InMemoryGroupSecretProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, group_id: impl Into<String>, secret: [u8; GROUP_SECRET_LEN]) {
        self.secrets.lock().unwrap().insert(group_id.into(), secret);
    }
}

#[async_trait::async_trait]
impl GroupSecretProvider for InMemoryGroupSecretProvider {
    async fn secret_for(&self, group_id: &str) -> CoreResult<[u8; GROUP_SECRET_LEN]> {
        self.secrets
            .lock()
            .unwrap()
            .get(group_id)
            .copied()
            .ok_or(CoreError::NoAccess)
    }
}
