/// Storage backends for content-addressed envelopes.
///
/// Two placements exist for every upload:
/// - Real: a live content-addressing service (Filebase-style IPFS API)
/// - Fallback: the deterministic offline generator, used when no
///   credentials are configured or the live service is unavailable
///
/// The live service sits behind [`StorageBackend`] so the client can be
/// driven by a stub in tests. The fallback generator is not a backend: it
/// never fails an upload and it never stores bytes.
pub mod fallback;
pub mod filebase;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::cid::ContentId;
use crate::envelope::DataEnvelope;
use crate::error::Result;

/// Trait for live content-addressing services.
///
/// Implementations perform exactly one round trip per call and never
/// retry. Every failure is reported as `StoreError::BackendUnavailable`.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Human-readable name of this backend (e.g., "Filebase").
    fn name(&self) -> &str;

    /// Upload serialized envelope bytes under `filename`. Returns the CID
    /// assigned by the service.
    async fn upload(&self, filename: &str, data: &[u8]) -> Result<ContentId>;

    /// Download raw bytes by CID.
    async fn download(&self, cid: &ContentId) -> Result<Vec<u8>>;
}

/// Which path produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Real,
    Fallback,
}

/// Why the fallback path was taken.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum FallbackReason {
    /// No credentials configured; the supported offline mode.
    Offline,
    /// The live backend failed; the message is the backend error.
    BackendUnavailable(String),
}

/// Metadata returned after a successful upload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadResult {
    /// Content identifier, from the live backend or the fallback generator.
    pub cid: ContentId,
    /// Size in bytes of the serialized envelope.
    pub size_bytes: u64,
    /// BLAKE3 digest of the serialized envelope.
    pub content_hash: [u8; 32],
    /// Truthful record of which path stored (or synthesized) the content.
    pub used_backend: BackendKind,
    /// Set whenever `used_backend` is `Fallback`.
    pub fallback_reason: Option<FallbackReason>,
}

impl UploadResult {
    pub fn is_real(&self) -> bool {
        self.used_backend == BackendKind::Real
    }

    pub fn content_hash_hex(&self) -> String {
        hex::encode(self.content_hash)
    }
}

/// Content returned by a download.
#[derive(Debug, Clone, PartialEq)]
pub enum DownloadedContent {
    /// The bytes parsed as an envelope.
    Envelope(DataEnvelope),
    /// The bytes were not an envelope (content uploaded by another tool).
    Raw(Vec<u8>),
}

/// Result of a download.
#[derive(Debug, Clone)]
pub struct DownloadResult {
    pub cid: ContentId,
    pub content: DownloadedContent,
    pub used_backend: BackendKind,
    pub fallback_reason: Option<FallbackReason>,
}

impl DownloadResult {
    /// True when the content was synthesized offline rather than retrieved.
    pub fn is_synthesized(&self) -> bool {
        self.used_backend == BackendKind::Fallback
    }

    pub fn envelope(&self) -> Option<&DataEnvelope> {
        match &self.content {
            DownloadedContent::Envelope(env) => Some(env),
            DownloadedContent::Raw(_) => None,
        }
    }
}
