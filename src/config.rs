//! Runtime configuration surface (§6).
//!
//! Dev builds load overrides from a `.env` file the same way the teacher's
//! config loader does; every value still has a spec-mandated default so the
//! core runs unconfigured in tests and in `InMemoryObjectStore`-backed
//! integration scenarios.

use thiserror::Error;

use crate::object_store::S3Config;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Retry parameters consumed by [`crate::queue::UploadQueue`] (§4.4).
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { max_retries: 5, base_delay_ms: 1000, max_delay_ms: 30_000 }
    }
}

/// Full configuration surface (§6): chunking cadence, retry policy, quota
/// thresholds, manifest/crypto constants and the object store endpoint.
#[derive(Debug, Clone)]
pub struct Config {
    pub chunk_interval_ms: u64,
    pub retry: RetryConfig,
    pub quota_warn_fraction: f64,
    pub quota_reject_fraction: f64,
    pub manifest_version: u32,
    pub aead_nonce_bytes: usize,
    pub hkdf_salt: &'static [u8],
    pub group_wrap_hkdf_salt: &'static [u8],
    pub group_wrap_hkdf_info: &'static [u8],
    pub database_path: String,
    pub s3_config: S3Config,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            chunk_interval_ms: 10_000,
            retry: RetryConfig::default(),
            quota_warn_fraction: 0.8,
            quota_reject_fraction: 0.95,
            manifest_version: crate::manifest::MANIFEST_VERSION,
            aead_nonce_bytes: crate::crypto::NONCE_LEN,
            hkdf_salt: b"witness-chunk",
            group_wrap_hkdf_salt: b"witness-protocol:group-key",
            group_wrap_hkdf_info: b"AES-256-GCM-group-wrapping",
            database_path: "witness.db".to_string(),
            s3_config: S3Config {
                bucket_name: String::new(),
                region: "us-east-1".to_string(),
                access_key_id: String::new(),
                secret_access_key: String::new(),
                endpoint_url: None,
            },
        }
    }
}

impl Config {
    /// Loads configuration, overriding spec defaults from `.env`/process
    /// environment where present (`WITNESS_*` variables).
    pub fn load() -> Self {
        if dotenvy::dotenv().is_ok() {
            tracing::info!("config: loaded .env overrides");
        } else {
            tracing::debug!("config: no .env file found, using defaults and process environment");
        }

        let mut config = Self::default();

        if let Ok(value) = std::env::var("WITNESS_CHUNK_INTERVAL_MS") {
            if let Ok(parsed) = value.parse() {
                config.chunk_interval_ms = parsed;
            }
        }
        if let Ok(value) = std::env::var("WITNESS_MAX_RETRIES") {
            if let Ok(parsed) = value.parse() {
                config.retry.max_retries = parsed;
            }
        }
        if let Ok(value) = std::env::var("WITNESS_DATABASE_PATH") {
            config.database_path = value;
        } else if let Some(home) = dirs::home_dir() {
            config.database_path = home.join(".witness-protocol").join("witness.db").to_string_lossy().into_owned();
        }
        if let Ok(value) = std::env::var("WITNESS_S3_BUCKET") {
            config.s3_config.bucket_name = value;
        }
        if let Ok(value) = std::env::var("WITNESS_S3_REGION") {
            config.s3_config.region = value;
        }
        if let Ok(value) = std::env::var("WITNESS_S3_ACCESS_KEY") {
            config.s3_config.access_key_id = value;
        }
        if let Ok(value) = std::env::var("WITNESS_S3_SECRET_KEY") {
            config.s3_config.secret_access_key = value;
        }
        if let Ok(value) = std::env::var("WITNESS_S3_ENDPOINT") {
            config.s3_config.endpoint_url = Some(value);
        }

        config
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.quota_warn_fraction <= 0.0 || self.quota_warn_fraction >= 1.0 {
            return Err(ConfigError::Invalid("quota_warn_fraction must be in (0, 1)".into()));
        }
        if self.quota_reject_fraction <= self.quota_warn_fraction || self.quota_reject_fraction > 1.0 {
            return Err(ConfigError::Invalid(
                "quota_reject_fraction must exceed quota_warn_fraction and be at most 1".into(),
            ));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(ConfigError::Invalid("base_delay_ms cannot exceed max_delay_ms".into()));
        }
        Ok(())
    }
}
