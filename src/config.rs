/// Storage client configuration.
///
/// Loaded once with layered precedence: defaults < TOML file < environment.
/// Environment variables use the `FILEBASE_` prefix (`FILEBASE_API_KEY`,
/// `FILEBASE_SECRET_KEY`, `FILEBASE_BUCKET`, `FILEBASE_GATEWAY_URL`, ...).
///
/// Having neither key nor secret is not a misconfiguration: it selects the
/// offline mode, where every upload goes to the fallback generator.
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::Deserialize;

use crate::error::{Result, StoreError};
use crate::secret::{lenient_string, Secret};

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "FILEBASE_";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Upload API base URL.
    #[serde(deserialize_with = "lenient_string")]
    pub api_url: String,
    /// Gateway prefix; the CID is appended directly.
    #[serde(deserialize_with = "lenient_string")]
    pub gateway_url: String,
    pub api_key: Option<Secret>,
    pub secret_key: Option<Secret>,
    /// Bucket / namespace uploads are placed in.
    #[serde(deserialize_with = "lenient_string")]
    pub bucket: String,
    pub upload_timeout_secs: u64,
    pub download_timeout_secs: u64,
    /// Emulate network latency on the fallback path.
    pub simulate_latency: bool,
    /// Where the fallback CID -> kind index is persisted, if anywhere.
    pub index_path: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.filebase.io".to_string(),
            gateway_url: "https://ipfs.filebase.io/ipfs/".to_string(),
            api_key: None,
            secret_key: None,
            bucket: "envelope-data-bucket".to_string(),
            upload_timeout_secs: 30,
            download_timeout_secs: 10,
            simulate_latency: true,
            index_path: None,
        }
    }
}

impl StorageConfig {
    /// Load configuration from an optional TOML file and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        figment
            .merge(Env::prefixed(ENV_PREFIX))
            .extract()
            .map_err(|e| StoreError::Config(e.to_string()))
    }

    /// Offline configuration: no credentials, no simulated latency.
    pub fn offline() -> Self {
        Self {
            simulate_latency: false,
            ..Self::default()
        }
    }

    /// True only when both the API key and the secret are present.
    pub fn has_credentials(&self) -> bool {
        let present = |s: &Option<Secret>| s.as_ref().is_some_and(|s| !s.is_empty());
        present(&self.api_key) && present(&self.secret_key)
    }

    /// True when exactly one of key and secret is set.
    pub fn has_partial_credentials(&self) -> bool {
        let present = |s: &Option<Secret>| s.as_ref().is_some_and(|s| !s.is_empty());
        present(&self.api_key) != present(&self.secret_key)
    }

    pub fn upload_timeout(&self) -> Duration {
        Duration::from_secs(self.upload_timeout_secs)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }
}
