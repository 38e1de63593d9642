//! Content-addressed object store collaborator (§6).
//!
//! `put`/`get` are assumed idempotent on content address: identical bytes
//! always yield identical locators. The production implementation targets S3
//! (or an S3-compatible endpoint such as MinIO); tests use an in-memory
//! double keyed the same way.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use aws_config::{BehaviorVersion, Region};
use aws_credential_types::Credentials;
use aws_sdk_s3::Client;
use serde::{Deserialize, Serialize};

use crate::crypto::sha256;
use crate::error::{CoreError, CoreResult};

#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, bytes: &[u8]) -> CoreResult<String>;
    async fn get(&self, locator: &str) -> CoreResult<Vec<u8>>;
}

/// S3 configuration for cloud storage (§6 configuration surface extends here
/// for the object store endpoint).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Config {
    pub bucket_name: String,
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub endpoint_url: Option<String>,
}

impl S3Config {
    pub fn validate(&self) -> CoreResult<()> {
        if self.bucket_name.trim().is_empty() {
            return Err(CoreError::InvalidArgument("S3 bucket name cannot be empty".into()));
        }
        if self.region.trim().is_empty() {
            return Err(CoreError::InvalidArgument("S3 region cannot be empty".into()));
        }
        Ok(())
    }
}

/// Content address derived purely from the ciphertext bytes: `sha256(bytes)`,
/// hex-encoded. This is what makes `put` idempotent and dedup-friendly.
fn content_address(bytes: &[u8]) -> String {
    hex::encode(sha256(bytes))
}

fn object_key(address: &str) -> String {
    let prefix = &address[..2.min(address.len())];
    let subprefix = &address[2.min(address.len())..4.min(address.len())];
    format!("witness/{prefix}/{subprefix}/{address}.bin")
}

pub struct S3ObjectStore {
    client: Client,
    bucket_name: String,
}

impl S3ObjectStore {
    pub async fn new(config: S3Config) -> CoreResult<Self> {
        config.validate()?;
        let credentials = Credentials::new(
            config.access_key_id,
            config.secret_access_key,
            None,
            None,
            "witness-protocol-object-store",
        );

        let mut builder = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region))
            .credentials_provider(credentials);
        if let Some(endpoint) = config.endpoint_url {
            builder = builder.endpoint_url(endpoint);
        }
        let aws_config = builder.load().await;

        Ok(Self {
            client: Client::new(&aws_config),
            bucket_name: config.bucket_name,
        })
    }
}

#[async_trait::async_trait]
impl ObjectStore for S3ObjectStore {
    async fn put(&self, bytes: &[u8]) -> CoreResult<String> {
        let address = content_address(bytes);
        let key = object_key(&address);

        self.client
            .put_object()
            .bucket(&self.bucket_name)
            .key(&key)
            .body(bytes.to_vec().into())
            .content_type("application/octet-stream")
            .send()
            .await
            .map_err(|e| CoreError::ObjectStoreFailure(format!("put_object failed: {e}")))?;

        Ok(format!("s3://{}/{}", self.bucket_name, key))
    }

    async fn get(&self, locator: &str) -> CoreResult<Vec<u8>> {
        let key = locator
            .strip_prefix(&format!("s3://{}/", self.bucket_name))
            .ok_or_else(|| CoreError::ObjectStoreFailure(format!("locator not in this bucket: {locator}")))?;

        let response = self
            .client
            .get_object()
            .bucket(&self.bucket_name)
            .key(key)
            .send()
            .await
            .map_err(|e| CoreError::ObjectStoreFailure(format!("get_object failed: {e}")))?;

        let bytes = response
            .body
            .collect()
            .await
            .map_err(|e| CoreError::ObjectStoreFailure(format!("failed to read body: {e}")))?
            .into_bytes()
            .to_vec();
        Ok(bytes)
    }
}

/// In-memory object store used by the test suite and by the recovery tests
/// that simulate transient network loss.
#[derive(Clone, Default)]
pub struct InMemoryObjectStore {
    objects: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    /// When set, `put`/`get` fail with a transient error — used to simulate
    /// S2's network-loss scenario.
    failing: Arc<Mutex<bool>>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock().unwrap() = failing;
    }

    pub fn len(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait::async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn put(&self, bytes: &[u8]) -> CoreResult<String> {
        if *self.failing.lock().unwrap() {
            return Err(CoreError::ObjectStoreFailure("simulated network loss".into()));
        }
        let locator = content_address(bytes);
        self.objects.lock().unwrap().insert(locator.clone(), bytes.to_vec());
        Ok(locator)
    }

    async fn get(&self, locator: &str) -> CoreResult<Vec<u8>> {
        if *self.failing.lock().unwrap() {
            return Err(CoreError::ObjectStoreFailure("simulated network loss".into()));
        }
        self.objects
            .lock()
            .unwrap()
            .get(locator)
            .cloned()
            .ok_or_else(|| CoreError::ObjectStoreFailure(format!("no such object: {locator}")))
    }
}
