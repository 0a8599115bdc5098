/// Storage client facade.
///
/// Every upload follows the same two-step decision:
///
/// ```text
/// encode envelope ──▶ credentials? ──no──────────────────────▶ Fallback(cid, Offline)
///                          │yes
///                          ▼
///                     live backend ──ok──▶ Real(cid)
///                          │BackendUnavailable (logged)
///                          ▼
///                     Fallback(cid, BackendUnavailable)
/// ```
///
/// Backend failures are absorbed and recorded in `UploadResult.used_backend`
/// and `fallback_reason`, which are always truthful. Bad input, unencodable
/// payloads, malformed CIDs and cancellation propagate as typed errors.
///
/// The client holds only configuration fixed at construction plus the
/// fallback tag index and upload counters; nothing is process-global.
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::batch::{self, BatchItem, BatchUploadResult};
use crate::cid::ContentId;
use crate::config::StorageConfig;
use crate::envelope::{
    DataEnvelope, EnvelopeBuilder, Metadata, KIND_ANALYSIS, KIND_MEASUREMENT,
};
use crate::error::{Result, StoreError};
use crate::storage::fallback::{FallbackGenerator, Latency, TagIndex};
use crate::storage::filebase::{FilebaseBackend, FilebaseConfig};
use crate::storage::{
    BackendKind, DownloadResult, DownloadedContent, FallbackReason, StorageBackend, UploadResult,
};

/// Outcome of the placement decision for one upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placement {
    Real(ContentId),
    Fallback(ContentId, FallbackReason),
}

/// A single measurement, uploaded as a `measurement-record` envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeasurementRecord {
    pub value: f64,
    pub unit: String,
    pub measured_at: DateTime<Utc>,
    #[serde(default)]
    pub notes: String,
    /// Observation code (e.g. LOINC "2345-7").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// Declared processing method; recorded in metadata only.
    #[serde(skip)]
    pub encryption_method: Option<String>,
}

/// An aggregate analysis, uploaded as an `analysis-result` envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResult {
    pub analysis_type: String,
    pub results: Value,
    /// Declared processing method; recorded in metadata only.
    #[serde(skip)]
    pub encryption_method: Option<String>,
}

/// Per-client upload counters. Informational only.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UploadStats {
    pub total_uploads: u64,
    pub total_bytes: u64,
    pub real_uploads: u64,
    pub fallback_uploads: u64,
    pub last_upload: Option<DateTime<Utc>>,
}

pub struct StorageClient {
    backend: Option<Arc<dyn StorageBackend>>,
    fallback: FallbackGenerator,
    gateway_url: String,
    index_path: Option<PathBuf>,
    stats: Mutex<UploadStats>,
}

impl StorageClient {
    /// Build a client from configuration.
    ///
    /// Without both API key and secret the client runs in offline mode and
    /// never touches the network. A persisted tag index is loaded if
    /// `index_path` is set.
    pub async fn from_config(config: &StorageConfig) -> Result<Self> {
        if config.has_partial_credentials() {
            warn!("Only one of API key / secret configured, running offline");
        }

        let backend: Option<Arc<dyn StorageBackend>> =
            match FilebaseConfig::from_storage_config(config) {
                Some(fb) => Some(Arc::new(FilebaseBackend::new(fb)?)),
                None => None,
            };

        let index = match &config.index_path {
            Some(path) => TagIndex::load(path).await?,
            None => TagIndex::new(),
        };

        let (upload_latency, download_latency) = if config.simulate_latency {
            (Latency::upload(), Latency::download())
        } else {
            (Latency::none(), Latency::none())
        };

        info!(
            offline = backend.is_none(),
            indexed = index.len(),
            "Storage client ready"
        );

        let mut client = Self::with_parts(
            backend,
            FallbackGenerator::new(index, upload_latency, download_latency),
            &config.gateway_url,
        );
        client.index_path = config.index_path.clone();
        Ok(client)
    }

    /// Assemble a client from explicit parts (custom backends, tests).
    pub fn with_parts(
        backend: Option<Arc<dyn StorageBackend>>,
        fallback: FallbackGenerator,
        gateway_url: &str,
    ) -> Self {
        Self {
            backend,
            fallback,
            gateway_url: gateway_url.to_string(),
            index_path: None,
            stats: Mutex::new(UploadStats::default()),
        }
    }

    pub fn is_offline(&self) -> bool {
        self.backend.is_none()
    }

    pub fn fallback(&self) -> &FallbackGenerator {
        &self.fallback
    }

    /// Full gateway URL for a CID.
    pub fn gateway_url(&self, cid: &ContentId) -> String {
        format!("{}{cid}", self.gateway_url)
    }

    pub fn stats(&self) -> UploadStats {
        self.stats.lock().clone()
    }

    /// Write the fallback tag index to `index_path`, if configured.
    pub async fn persist_index(&self) -> Result<()> {
        if let Some(path) = &self.index_path {
            self.fallback.index().save(path).await?;
        }
        Ok(())
    }

    /// Wrap `payload` in a `kind` envelope and store it.
    pub async fn upload<T: Serialize + ?Sized>(
        &self,
        payload: &T,
        kind: &str,
        metadata: Metadata,
    ) -> Result<UploadResult> {
        self.upload_cancellable(payload, kind, metadata, &CancellationToken::new())
            .await
    }

    pub async fn upload_cancellable<T: Serialize + ?Sized>(
        &self,
        payload: &T,
        kind: &str,
        metadata: Metadata,
        cancel: &CancellationToken,
    ) -> Result<UploadResult> {
        let filename = format!("envelope-{}.json", Utc::now().timestamp_millis());
        self.upload_as(&filename, payload, kind, metadata, cancel)
            .await
    }

    /// Upload with an explicit filename for the multipart body.
    pub async fn upload_as<T: Serialize + ?Sized>(
        &self,
        filename: &str,
        payload: &T,
        kind: &str,
        metadata: Metadata,
        cancel: &CancellationToken,
    ) -> Result<UploadResult> {
        let envelope = EnvelopeBuilder::new(kind)
            .payload(payload)?
            .extend_metadata(metadata)
            .build()?;
        self.upload_envelope(&envelope, filename, cancel).await
    }

    /// Store an already built envelope.
    pub async fn upload_envelope(
        &self,
        envelope: &DataEnvelope,
        filename: &str,
        cancel: &CancellationToken,
    ) -> Result<UploadResult> {
        let bytes = envelope.to_bytes()?;
        let content = envelope.content_bytes()?;

        let placement = self
            .place(&bytes, &content, &envelope.kind, filename, cancel)
            .await?;

        let (cid, used_backend, fallback_reason) = match placement {
            Placement::Real(cid) => (cid, BackendKind::Real, None),
            Placement::Fallback(cid, reason) => (cid, BackendKind::Fallback, Some(reason)),
        };

        let size_bytes = bytes.len() as u64;
        self.record(size_bytes, used_backend);

        Ok(UploadResult {
            cid,
            size_bytes,
            content_hash: blake3::hash(&bytes).into(),
            used_backend,
            fallback_reason,
        })
    }

    /// Decide where the bytes go. Only `BackendUnavailable` is absorbed.
    async fn place(
        &self,
        bytes: &[u8],
        content: &[u8],
        kind: &str,
        filename: &str,
        cancel: &CancellationToken,
    ) -> Result<Placement> {
        let reason = match &self.backend {
            None => FallbackReason::Offline,
            Some(backend) => match cancellable(cancel, backend.upload(filename, bytes)).await {
                Ok(cid) => {
                    info!(
                        cid = %cid,
                        backend = backend.name(),
                        size = bytes.len(),
                        "Uploaded envelope"
                    );
                    return Ok(Placement::Real(cid));
                }
                Err(StoreError::BackendUnavailable(msg)) => {
                    warn!(
                        backend = backend.name(),
                        filename,
                        error = %msg,
                        "Backend upload failed, falling back"
                    );
                    FallbackReason::BackendUnavailable(msg)
                }
                Err(e) => return Err(e),
            },
        };

        let cid = cancellable(cancel, async {
            Ok(self.fallback.synthesize(content, kind).await)
        })
        .await?;

        Ok(Placement::Fallback(cid, reason))
    }

    fn record(&self, size: u64, used_backend: BackendKind) {
        let mut stats = self.stats.lock();
        stats.total_uploads += 1;
        stats.total_bytes += size;
        match used_backend {
            BackendKind::Real => stats.real_uploads += 1,
            BackendKind::Fallback => stats.fallback_uploads += 1,
        }
        stats.last_upload = Some(Utc::now());
    }

    /// Fetch content by CID.
    pub async fn download(&self, cid: &str) -> Result<DownloadResult> {
        self.download_cancellable(cid, &CancellationToken::new())
            .await
    }

    /// Fetch content by CID, from the backend when possible and otherwise
    /// by reconstructing a previously synthesized envelope.
    pub async fn download_cancellable(
        &self,
        cid: &str,
        cancel: &CancellationToken,
    ) -> Result<DownloadResult> {
        let cid = ContentId::parse(cid)?;

        let reason = match &self.backend {
            None => FallbackReason::Offline,
            Some(backend) => match cancellable(cancel, backend.download(&cid)).await {
                Ok(bytes) => {
                    info!(cid = %cid, backend = backend.name(), size = bytes.len(), "Downloaded content");
                    let content = match DataEnvelope::from_bytes(&bytes) {
                        Ok(envelope) => DownloadedContent::Envelope(envelope),
                        Err(_) => DownloadedContent::Raw(bytes),
                    };
                    return Ok(DownloadResult {
                        cid,
                        content,
                        used_backend: BackendKind::Real,
                        fallback_reason: None,
                    });
                }
                Err(StoreError::BackendUnavailable(msg)) => {
                    warn!(
                        cid = %cid,
                        backend = backend.name(),
                        error = %msg,
                        "Backend download failed, falling back"
                    );
                    FallbackReason::BackendUnavailable(msg)
                }
                Err(e) => return Err(e),
            },
        };

        let envelope = cancellable(cancel, self.fallback.reconstruct(&cid)).await?;

        Ok(DownloadResult {
            cid,
            content: DownloadedContent::Envelope(envelope),
            used_backend: BackendKind::Fallback,
            fallback_reason: Some(reason),
        })
    }

    /// Upload a measurement on behalf of `uploader`.
    pub async fn upload_measurement(
        &self,
        record: &MeasurementRecord,
        uploader: &str,
    ) -> Result<UploadResult> {
        let envelope = declared(
            EnvelopeBuilder::new(KIND_MEASUREMENT)
                .payload(record)?
                .metadata("uploader", uploader),
            record.encryption_method.as_deref(),
        )
        .build()?;

        let filename = format!(
            "measurement-{}-{}.json",
            filename_component(uploader),
            Utc::now().timestamp_millis()
        );
        self.upload_envelope(&envelope, &filename, &CancellationToken::new())
            .await
    }

    /// Upload an analysis result.
    pub async fn upload_analysis(&self, result: &AnalysisResult) -> Result<UploadResult> {
        let envelope = declared(
            EnvelopeBuilder::new(KIND_ANALYSIS)
                .payload(result)?
                .metadata("analysisType", result.analysis_type.as_str()),
            result.encryption_method.as_deref(),
        )
        .build()?;

        let filename = format!(
            "analysis-{}-{}.json",
            filename_component(&result.analysis_type),
            Utc::now().timestamp_millis()
        );
        self.upload_envelope(&envelope, &filename, &CancellationToken::new())
            .await
    }

    /// Upload several payloads concurrently. See [`batch::upload_many`].
    pub async fn upload_many(&self, items: &[BatchItem]) -> BatchUploadResult {
        batch::upload_many(self, items).await
    }
}

fn declared(builder: EnvelopeBuilder, encryption_method: Option<&str>) -> EnvelopeBuilder {
    match encryption_method {
        Some(method) => builder
            .metadata("encrypted", true)
            .metadata("encryptionMethod", method),
        None => builder.metadata("encrypted", false),
    }
}

fn filename_component(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '-' })
        .collect()
}

async fn cancellable<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(StoreError::Cancelled),
        res = fut => res,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cid::is_valid;
    use crate::storage::testing::{FailingBackend, HangingBackend, MemoryBackend};
    use serde_json::json;

    const GATEWAY: &str = "https://gw.example/ipfs/";

    fn offline() -> StorageClient {
        StorageClient::with_parts(None, FallbackGenerator::instant(), GATEWAY)
    }

    fn with_backend(backend: Arc<dyn StorageBackend>) -> StorageClient {
        StorageClient::with_parts(Some(backend), FallbackGenerator::instant(), GATEWAY)
    }

    #[tokio::test]
    async fn test_offline_upload_uses_fallback() {
        let client = offline();
        let result = client
            .upload(&json!({"value": 120}), KIND_MEASUREMENT, Metadata::new())
            .await
            .unwrap();

        assert_eq!(result.used_backend, BackendKind::Fallback);
        assert_eq!(result.fallback_reason, Some(FallbackReason::Offline));
        assert!(is_valid(result.cid.as_str()));
        assert!(result.size_bytes > 0);
        assert!(client.is_offline());
    }

    #[tokio::test]
    async fn test_offline_same_content_same_cid() {
        let client = offline();
        let a = client
            .upload(&json!({"value": 120}), KIND_MEASUREMENT, Metadata::new())
            .await
            .unwrap();
        let b = client
            .upload(&json!({"value": 120}), KIND_MEASUREMENT, Metadata::new())
            .await
            .unwrap();
        assert_eq!(a.cid, b.cid);

        let c = client
            .upload(&json!({"value": 121}), KIND_MEASUREMENT, Metadata::new())
            .await
            .unwrap();
        assert_ne!(a.cid, c.cid);
    }

    #[tokio::test]
    async fn test_offline_download_reconstructs_by_kind() {
        let client = offline();
        let uploaded = client
            .upload(&json!({"mean": 1.0}), KIND_ANALYSIS, Metadata::new())
            .await
            .unwrap();

        let downloaded = client.download(uploaded.cid.as_str()).await.unwrap();
        assert!(downloaded.is_synthesized());
        assert_eq!(downloaded.fallback_reason, Some(FallbackReason::Offline));
        assert_eq!(downloaded.envelope().unwrap().kind, KIND_ANALYSIS);
    }

    #[tokio::test]
    async fn test_offline_download_unknown_cid() {
        let client = offline();
        let err = client
            .download("QmYwAPJzv5CZsnA625s3Xf2nemtYgPpHdWEz79ojWnPbdG")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ReconstructionMiss(_)));
    }

    #[tokio::test]
    async fn test_download_rejects_malformed_cid() {
        let client = with_backend(Arc::new(MemoryBackend::default()));
        let err = client.download("Qm123").await.unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));
    }

    #[tokio::test]
    async fn test_backend_failure_falls_back() {
        let client = with_backend(Arc::new(FailingBackend));
        let result = client
            .upload(&json!({"value": 99}), KIND_MEASUREMENT, Metadata::new())
            .await
            .unwrap();

        assert_eq!(result.used_backend, BackendKind::Fallback);
        assert!(matches!(
            result.fallback_reason,
            Some(FallbackReason::BackendUnavailable(ref msg)) if msg.contains("connection refused")
        ));

        let downloaded = client.download(result.cid.as_str()).await.unwrap();
        assert!(downloaded.is_synthesized());
        assert_eq!(downloaded.envelope().unwrap().kind, KIND_MEASUREMENT);
    }

    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl CapturedLogs {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock()).into_owned()
        }
    }

    #[tokio::test]
    async fn test_backend_failure_is_logged() {
        let logs = CapturedLogs::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::WARN)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let client = with_backend(Arc::new(FailingBackend));
        let result = client
            .upload(&json!({"value": 7}), KIND_MEASUREMENT, Metadata::new())
            .await
            .unwrap();
        client.download(result.cid.as_str()).await.unwrap();

        let text = logs.text();
        assert!(text.contains("Backend upload failed, falling back"), "{text}");
        assert!(text.contains("Backend download failed, falling back"), "{text}");
        assert!(text.contains("connection refused"), "{text}");
        assert!(text.contains("WARN"), "{text}");
    }

    #[tokio::test]
    async fn test_offline_upload_tags_index() {
        let client = offline();
        assert!(client.fallback().index().is_empty());

        let result = client
            .upload(&json!({"mean": 2.5}), KIND_ANALYSIS, Metadata::new())
            .await
            .unwrap();

        let index = client.fallback().index();
        assert_eq!(index.len(), 1);
        assert_eq!(index.kind_of(&result.cid).as_deref(), Some(KIND_ANALYSIS));
    }

    #[tokio::test]
    async fn test_real_round_trip() {
        let backend = Arc::new(MemoryBackend::default());
        let client = with_backend(backend.clone());

        let payload = json!({"value": 120, "tags": ["fasting"]});
        let mut meta = Metadata::new();
        meta.insert("uploader".into(), "0xabc".into());

        let uploaded = client
            .upload(&payload, KIND_MEASUREMENT, meta)
            .await
            .unwrap();
        assert!(uploaded.is_real());
        assert!(uploaded.fallback_reason.is_none());
        assert_eq!(uploaded.content_hash_hex().len(), 64);

        let downloaded = client.download(uploaded.cid.as_str()).await.unwrap();
        assert!(!downloaded.is_synthesized());
        let env = downloaded.envelope().unwrap();
        assert_eq!(env.payload, payload);
        assert_eq!(env.metadata_str("uploader"), Some("0xabc"));
    }

    #[tokio::test]
    async fn test_real_download_raw_bytes() {
        let backend = Arc::new(MemoryBackend::default());
        let cid = backend.upload("plain.txt", b"not an envelope").await.unwrap();
        let client = with_backend(backend);

        let downloaded = client.download(cid.as_str()).await.unwrap();
        assert_eq!(
            downloaded.content,
            DownloadedContent::Raw(b"not an envelope".to_vec())
        );
    }

    #[tokio::test]
    async fn test_encoding_error_propagates() {
        let client = offline();
        let err = client
            .upload(&json!(1), "", Metadata::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Encoding(_)));
        assert_eq!(client.stats().total_uploads, 0);
    }

    #[tokio::test]
    async fn test_cancellation_not_absorbed() {
        let client = with_backend(Arc::new(HangingBackend));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = client
            .upload_cancellable(&json!(1), "k", Metadata::new(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Cancelled));

        let err = client
            .download_cancellable("QmYwAPJzv5CZsnA625s3Xf2nemtYgPpHdWEz79ojWnPbdG", &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Cancelled));
    }

    #[tokio::test]
    async fn test_typed_helpers() {
        let backend = Arc::new(MemoryBackend::default());
        let client = with_backend(backend.clone());

        let record = MeasurementRecord {
            value: 132.0,
            unit: "mg/dL".into(),
            measured_at: Utc::now(),
            notes: "fasting".into(),
            code: Some("2345-7".into()),
            encryption_method: Some("FHEVM".into()),
        };
        let uploaded = client.upload_measurement(&record, "0xAbC").await.unwrap();
        let env = client
            .download(uploaded.cid.as_str())
            .await
            .unwrap()
            .envelope()
            .cloned()
            .unwrap();
        assert_eq!(env.kind, KIND_MEASUREMENT);
        assert_eq!(env.payload["value"], 132.0);
        assert!(env.payload.get("encryptionMethod").is_none());
        assert_eq!(env.metadata_str("encryptionMethod"), Some("FHEVM"));
        assert_eq!(env.metadata_str("uploader"), Some("0xAbC"));

        let analysis = AnalysisResult {
            analysis_type: "average glucose".into(),
            results: json!({"average": 142.5}),
            encryption_method: None,
        };
        client.upload_analysis(&analysis).await.unwrap();

        let names = backend.filenames.lock().clone();
        assert!(names[0].starts_with("measurement-0xAbC-"));
        assert!(names[1].starts_with("analysis-average-glucose-"));
        assert!(names.iter().all(|n| n.ends_with(".json")));
    }

    #[tokio::test]
    async fn test_stats() {
        let client = with_backend(Arc::new(MemoryBackend::default()));
        client.upload(&json!(1), "k", Metadata::new()).await.unwrap();
        client.upload(&json!(2), "k", Metadata::new()).await.unwrap();

        let stats = client.stats();
        assert_eq!(stats.total_uploads, 2);
        assert_eq!(stats.real_uploads, 2);
        assert_eq!(stats.fallback_uploads, 0);
        assert!(stats.total_bytes > 0);
        assert!(stats.last_upload.is_some());
    }

    #[test]
    fn test_gateway_url() {
        let client = offline();
        let cid = ContentId::parse("QmYwAPJzv5CZsnA625s3Xf2nemtYgPpHdWEz79ojWnPbdG").unwrap();
        assert_eq!(
            client.gateway_url(&cid),
            "https://gw.example/ipfs/QmYwAPJzv5CZsnA625s3Xf2nemtYgPpHdWEz79ojWnPbdG"
        );
    }

    #[tokio::test]
    async fn test_from_config_offline_persists_index() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = StorageConfig::offline();
        config.index_path = Some(dir.path().join("tags.json"));

        let client = StorageClient::from_config(&config).await.unwrap();
        let uploaded = client
            .upload(&json!({"v": 1}), KIND_ANALYSIS, Metadata::new())
            .await
            .unwrap();
        client.persist_index().await.unwrap();

        let reopened = StorageClient::from_config(&config).await.unwrap();
        let downloaded = reopened.download(uploaded.cid.as_str()).await.unwrap();
        assert_eq!(downloaded.envelope().unwrap().kind, KIND_ANALYSIS);
    }

    #[tokio::test]
    async fn test_from_config_live_backend() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/ipfs"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&server)
            .await;

        let mut config = StorageConfig::offline();
        config.api_url = server.uri();
        config.gateway_url = format!("{}/ipfs/", server.uri());
        config.api_key = Some("k".into());
        config.secret_key = Some("s".into());

        let client = StorageClient::from_config(&config).await.unwrap();
        assert!(!client.is_offline());

        let result = client
            .upload(&json!({"value": 5}), KIND_MEASUREMENT, Metadata::new())
            .await
            .unwrap();
        assert_eq!(result.used_backend, BackendKind::Fallback);
        assert!(matches!(
            result.fallback_reason,
            Some(FallbackReason::BackendUnavailable(_))
        ));
    }
}
