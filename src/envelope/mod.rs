/// Data envelopes: the unit that is ever persisted.
///
/// Every payload is wrapped in a versioned, typed, timestamped record
/// before it leaves the client:
///
/// ```text
/// { kind, version, createdAt, payload, metadata }
/// ```
///
/// Serialization is canonical. Struct fields are emitted in declaration
/// order and every map (payload objects, metadata, unknown extra fields)
/// is key-sorted, so byte-identical envelopes always produce byte-identical
/// output. The fallback identifier is derived from these bytes.
///
/// Envelopes are never updated. A correction is a new upload with a new CID.
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, StoreError};

/// Current envelope schema version.
pub const ENVELOPE_VERSION: &str = "1.0";

/// Envelope kind used by measurement uploads.
pub const KIND_MEASUREMENT: &str = "measurement-record";

/// Envelope kind used by analysis uploads.
pub const KIND_ANALYSIS: &str = "analysis-result";

/// Envelope metadata: string keys to scalar values.
pub type Metadata = BTreeMap<String, MetadataValue>;

/// A scalar metadata value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl MetadataValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetadataValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            MetadataValue::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl From<bool> for MetadataValue {
    fn from(v: bool) -> Self {
        MetadataValue::Bool(v)
    }
}

impl From<i64> for MetadataValue {
    fn from(v: i64) -> Self {
        MetadataValue::Int(v)
    }
}

impl From<i32> for MetadataValue {
    fn from(v: i32) -> Self {
        MetadataValue::Int(v.into())
    }
}

impl From<u32> for MetadataValue {
    fn from(v: u32) -> Self {
        MetadataValue::Int(v.into())
    }
}

impl From<f64> for MetadataValue {
    fn from(v: f64) -> Self {
        MetadataValue::Float(v)
    }
}

impl From<&str> for MetadataValue {
    fn from(v: &str) -> Self {
        MetadataValue::Text(v.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(v: String) -> Self {
        MetadataValue::Text(v)
    }
}

/// A versioned, typed wrapper around an arbitrary payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataEnvelope {
    /// Caller-chosen discriminator (e.g. "measurement-record").
    pub kind: String,
    /// Schema version of this envelope.
    pub version: String,
    /// Set once at encode time.
    pub created_at: DateTime<Utc>,
    /// Opaque caller payload.
    pub payload: Value,
    /// Scalar annotations (uploader, declared processing method, flags).
    #[serde(default)]
    pub metadata: Metadata,
    /// Fields written by newer schema versions, preserved verbatim.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// The hashed region of an envelope: everything except `createdAt`.
#[derive(Serialize)]
struct ContentView<'a> {
    kind: &'a str,
    version: &'a str,
    payload: &'a Value,
    metadata: &'a Metadata,
    #[serde(flatten)]
    extra: &'a BTreeMap<String, Value>,
}

impl DataEnvelope {
    /// Canonical serialization of the whole envelope.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| StoreError::Encoding(e.to_string()))
    }

    /// Canonical serialization with `createdAt` left out.
    ///
    /// Two envelopes carrying the same kind, payload and metadata produce
    /// the same content bytes no matter when they were encoded.
    pub fn content_bytes(&self) -> Result<Vec<u8>> {
        let view = ContentView {
            kind: &self.kind,
            version: &self.version,
            payload: &self.payload,
            metadata: &self.metadata,
            extra: &self.extra,
        };
        serde_json::to_vec(&view).map_err(|e| StoreError::Encoding(e.to_string()))
    }

    /// Parse an envelope, keeping any fields this version does not know.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(|e| StoreError::Encoding(e.to_string()))
    }

    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(MetadataValue::as_str)
    }
}

/// Builder for envelopes. Metadata is additive only.
pub struct EnvelopeBuilder {
    kind: String,
    payload: Value,
    metadata: Metadata,
    created_at: Option<DateTime<Utc>>,
}

impl EnvelopeBuilder {
    pub fn new(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
            payload: Value::Null,
            metadata: Metadata::new(),
            created_at: None,
        }
    }

    /// Set the payload. Fails if the value has no structured representation.
    ///
    /// Non-finite floats (`NaN`, `inf`) anywhere in the payload are stored
    /// as `null`, the JSON rendering of a value with no number form.
    /// Metadata is stricter: [`build`](Self::build) rejects them there.
    pub fn payload<T: Serialize + ?Sized>(mut self, payload: &T) -> Result<Self> {
        self.payload =
            serde_json::to_value(payload).map_err(|e| StoreError::Encoding(e.to_string()))?;
        Ok(self)
    }

    /// Add a metadata entry. Existing keys are kept.
    pub fn metadata(mut self, key: &str, value: impl Into<MetadataValue>) -> Self {
        self.metadata
            .entry(key.to_string())
            .or_insert_with(|| value.into());
        self
    }

    /// Merge a metadata map. Existing keys are kept.
    pub fn extend_metadata(mut self, metadata: Metadata) -> Self {
        for (key, value) in metadata {
            self.metadata.entry(key).or_insert(value);
        }
        self
    }

    /// Pin the creation timestamp instead of using the current time.
    pub fn created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = Some(created_at);
        self
    }

    pub fn build(self) -> Result<DataEnvelope> {
        if self.kind.trim().is_empty() {
            return Err(StoreError::Encoding("envelope kind must not be empty".into()));
        }

        if let Some((key, _)) = self
            .metadata
            .iter()
            .find(|(_, v)| matches!(v, MetadataValue::Float(f) if !f.is_finite()))
        {
            return Err(StoreError::Encoding(format!(
                "metadata value for {key:?} is not a finite number"
            )));
        }

        Ok(DataEnvelope {
            kind: self.kind,
            version: ENVELOPE_VERSION.to_string(),
            created_at: self.created_at.unwrap_or_else(Utc::now),
            payload: self.payload,
            metadata: self.metadata,
            extra: BTreeMap::new(),
        })
    }
}

/// Wrap `payload` in an envelope and serialize it.
///
/// Returns the canonical bytes together with the envelope they encode.
/// Non-finite payload floats become `null`; see [`EnvelopeBuilder::payload`].
pub fn encode<T: Serialize + ?Sized>(
    kind: &str,
    payload: &T,
    metadata: Metadata,
) -> Result<(Vec<u8>, DataEnvelope)> {
    let envelope = EnvelopeBuilder::new(kind)
        .payload(payload)?
        .extend_metadata(metadata)
        .build()?;
    let bytes = envelope.to_bytes()?;
    Ok((bytes, envelope))
}

/// Like [`encode`], with a fixed creation time.
pub fn encode_at<T: Serialize + ?Sized>(
    kind: &str,
    payload: &T,
    metadata: Metadata,
    created_at: DateTime<Utc>,
) -> Result<(Vec<u8>, DataEnvelope)> {
    let envelope = EnvelopeBuilder::new(kind)
        .payload(payload)?
        .extend_metadata(metadata)
        .created_at(created_at)
        .build()?;
    let bytes = envelope.to_bytes()?;
    Ok((bytes, envelope))
}
