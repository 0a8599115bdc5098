/// Filebase-style IPFS backend over HTTP.
///
/// Upload is a multipart POST of the serialized envelope to
/// `{api_url}/v1/ipfs` with a bearer token; the JSON response carries the
/// CID in its `Hash` field. Download is a plain GET of
/// `{gateway_url}{cid}`.
///
/// Every request is bounded by a timeout and performed exactly once.
/// Timeouts, transport errors, non-2xx statuses and malformed responses
/// all surface as `StoreError::BackendUnavailable`; the storage client
/// decides what to do about them.
///
/// Note: the service does not guarantee persistence. Pinning and
/// replication are the service's business, not this client's.
use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart;
use reqwest::Client;
use serde::Deserialize;

use super::StorageBackend;
use crate::cid::ContentId;
use crate::config::StorageConfig;
use crate::error::{Result, StoreError};
use crate::secret::Secret;

/// Connection settings for the live backend.
#[derive(Debug, Clone)]
pub struct FilebaseConfig {
    /// API endpoint (e.g., "https://api.filebase.io").
    pub api_url: String,
    /// Gateway prefix for downloads (e.g., "https://ipfs.filebase.io/ipfs/").
    pub gateway_url: String,
    pub api_key: Secret,
    pub bucket: String,
    pub upload_timeout: Duration,
    pub download_timeout: Duration,
}

impl FilebaseConfig {
    /// Build from client configuration. `None` when credentials are missing.
    pub fn from_storage_config(config: &StorageConfig) -> Option<Self> {
        if !config.has_credentials() {
            return None;
        }
        Some(Self {
            api_url: config.api_url.trim_end_matches('/').to_string(),
            gateway_url: config.gateway_url.clone(),
            api_key: config.api_key.clone()?,
            bucket: config.bucket.clone(),
            upload_timeout: config.upload_timeout(),
            download_timeout: config.download_timeout(),
        })
    }
}

/// Live content-addressing backend.
pub struct FilebaseBackend {
    client: Client,
    config: FilebaseConfig,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AddResponse {
    hash: String,
}

impl FilebaseBackend {
    pub fn new(config: FilebaseConfig) -> Result<Self> {
        let client = Client::builder()
            .build()
            .map_err(|e| StoreError::Config(format!("HTTP client: {e}")))?;
        Ok(Self { client, config })
    }

    pub fn gateway_url(&self, cid: &ContentId) -> String {
        format!("{}{cid}", self.config.gateway_url)
    }
}

fn unavailable(context: &str, e: impl std::fmt::Display) -> StoreError {
    StoreError::BackendUnavailable(format!("{context}: {e}"))
}

#[async_trait]
impl StorageBackend for FilebaseBackend {
    fn name(&self) -> &str {
        "Filebase"
    }

    async fn upload(&self, filename: &str, data: &[u8]) -> Result<ContentId> {
        let part = multipart::Part::bytes(data.to_vec())
            .file_name(filename.to_string())
            .mime_str("application/json")
            .map_err(|e| unavailable("upload", e))?;
        let form = multipart::Form::new()
            .text("bucket", self.config.bucket.clone())
            .part("file", part);

        let resp = self
            .client
            .post(format!("{}/v1/ipfs", self.config.api_url))
            .bearer_auth(self.config.api_key.expose())
            .timeout(self.config.upload_timeout)
            .multipart(form)
            .send()
            .await
            .map_err(|e| unavailable("upload", e))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(StoreError::BackendUnavailable(format!(
                "upload failed with {status}: {body}"
            )));
        }

        let add_resp: AddResponse = resp
            .json()
            .await
            .map_err(|e| unavailable("upload response", e))?;

        ContentId::parse(&add_resp.hash)
            .map_err(|_| unavailable("upload response", format!("malformed CID {:?}", add_resp.hash)))
    }

    async fn download(&self, cid: &ContentId) -> Result<Vec<u8>> {
        let resp = self
            .client
            .get(self.gateway_url(cid))
            .timeout(self.config.download_timeout)
            .send()
            .await
            .map_err(|e| unavailable("download", e))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(StoreError::BackendUnavailable(format!(
                "download of {cid} failed with {status}"
            )));
        }

        let bytes = resp
            .bytes()
            .await
            .map_err(|e| unavailable("download", e))?;

        Ok(bytes.to_vec())
    }
}
