pub mod batch;
pub mod cid;
pub mod client;
pub mod config;
pub mod envelope;
pub mod error;
pub mod secret;
pub mod storage;

pub use cid::{is_valid, ContentId};
pub use client::StorageClient;
pub use config::StorageConfig;
pub use envelope::{encode, DataEnvelope, Metadata, MetadataValue};
pub use error::{Result, StoreError};
pub use storage::{BackendKind, DownloadResult, UploadResult};
