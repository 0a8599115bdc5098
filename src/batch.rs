/// Batch uploads.
///
/// Every member upload runs concurrently through the storage client. The
/// result has one entry per input, in input order, whatever order the
/// uploads finish in.
///
/// Partial success is the contract: a failing item never sinks the batch.
/// Failures are logged and returned with their index and error kind so the
/// caller can retry just that subset. No concurrency cap is applied here.
use chrono::Utc;
use futures::future::join_all;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::client::StorageClient;
use crate::envelope::Metadata;
use crate::error::ErrorKind;
use crate::storage::UploadResult;

/// One payload to upload.
#[derive(Debug, Clone)]
pub struct BatchItem {
    pub kind: String,
    pub payload: Value,
    pub metadata: Metadata,
}

impl BatchItem {
    pub fn new(kind: &str, payload: Value) -> Self {
        Self {
            kind: kind.to_string(),
            payload,
            metadata: Metadata::new(),
        }
    }
}

/// Why a single batch member failed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorDetail {
    /// Position of the item in the input.
    pub index: usize,
    pub kind: ErrorKind,
    pub message: String,
}

/// Per-item outcomes, aligned with the input.
#[derive(Debug)]
pub struct BatchUploadResult {
    pub results: Vec<Result<UploadResult, ErrorDetail>>,
}

impl BatchUploadResult {
    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// True when every item succeeded.
    pub fn is_complete(&self) -> bool {
        self.results.iter().all(Result::is_ok)
    }

    pub fn succeeded(&self) -> impl Iterator<Item = &UploadResult> {
        self.results.iter().filter_map(|r| r.as_ref().ok())
    }

    pub fn failures(&self) -> impl Iterator<Item = &ErrorDetail> {
        self.results.iter().filter_map(|r| r.as_ref().err())
    }

    pub fn failed_indices(&self) -> Vec<usize> {
        self.failures().map(|f| f.index).collect()
    }
}

/// Upload all `items` concurrently.
pub async fn upload_many(client: &StorageClient, items: &[BatchItem]) -> BatchUploadResult {
    upload_many_cancellable(client, items, &CancellationToken::new()).await
}

pub async fn upload_many_cancellable(
    client: &StorageClient,
    items: &[BatchItem],
    cancel: &CancellationToken,
) -> BatchUploadResult {
    let started = Utc::now().timestamp_millis();
    info!(items = items.len(), "Starting batch upload");

    let uploads = items.iter().enumerate().map(|(index, item)| async move {
        let filename = format!("batch-{index}-{started}.json");
        client
            .upload_as(
                &filename,
                &item.payload,
                &item.kind,
                item.metadata.clone(),
                cancel,
            )
            .await
            .map_err(|e| {
                error!(index, kind = %item.kind, error = %e, "Batch item failed");
                ErrorDetail {
                    index,
                    kind: e.kind(),
                    message: e.to_string(),
                }
            })
    });

    let results = join_all(uploads).await;
    let batch = BatchUploadResult { results };

    info!(
        items = batch.len(),
        failed = batch.failures().count(),
        "Batch upload complete"
    );

    batch
}
