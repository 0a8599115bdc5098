/// Deterministic offline fallback.
///
/// Used when no live backend is configured or the backend is unavailable.
/// Two jobs:
/// - Synthesis: map content bytes to a CID-shaped identifier
/// - Reconstruction: turn a previously synthesized CID back into a canned
///   envelope of the kind it was synthesized for
///
/// The fingerprint is a 31-multiplier rolling hash over a wrapping 64-bit
/// word. It is a checksum, NOT a cryptographic hash: it has no collision
/// resistance and provides no confidentiality. Identical bytes always give
/// the same identifier; different bytes usually, but not always, differ.
///
/// Reconstruction is driven by an explicit CID -> kind index written at
/// synthesis time. The characters of a CID carry no meaning and are never
/// inspected.
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use rand::Rng;
use serde_json::json;
use tracing::debug;

use crate::cid::{ContentId, ALPHABET, CID_BODY_LEN, CID_LEN, CID_PREFIX};
use crate::envelope::{DataEnvelope, EnvelopeBuilder, KIND_ANALYSIS, KIND_MEASUREMENT};
use crate::error::{Result, StoreError};

/// Rolling fingerprint: `h' = h * 31 + byte`, wrapping.
pub fn fingerprint(data: &[u8]) -> u64 {
    data.iter()
        .fold(0u64, |h, &b| h.wrapping_mul(31).wrapping_add(u64::from(b)))
}

/// Expand the fingerprint of `data` into a CID.
///
/// Each position advances the state with the same rolling step and indexes
/// the alphabet with the state offset by the position.
pub fn synthesize_cid(data: &[u8]) -> ContentId {
    let mut state = fingerprint(data);
    let mut cid = String::with_capacity(CID_LEN);
    cid.push_str(CID_PREFIX);

    for i in 0..CID_BODY_LEN as u64 {
        state = state.wrapping_mul(31).wrapping_add(i);
        let idx = state.wrapping_add(i) % ALPHABET.len() as u64;
        cid.push(ALPHABET[idx as usize] as char);
    }

    ContentId::from_trusted(cid)
}

/// Simulated network latency: a fixed base plus uniform jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Latency {
    pub base: Duration,
    pub jitter: Duration,
}

impl Latency {
    /// No delay at all.
    pub const fn none() -> Self {
        Self {
            base: Duration::ZERO,
            jitter: Duration::ZERO,
        }
    }

    /// 1-3 seconds, the profile used for uploads.
    pub const fn upload() -> Self {
        Self {
            base: Duration::from_millis(1000),
            jitter: Duration::from_millis(2000),
        }
    }

    /// 0.5-1.5 seconds, the profile used for downloads.
    pub const fn download() -> Self {
        Self {
            base: Duration::from_millis(500),
            jitter: Duration::from_millis(1000),
        }
    }

    fn sample(&self) -> Duration {
        if self.jitter.is_zero() {
            return self.base;
        }
        let jitter_ms = self.jitter.as_millis() as u64;
        self.base + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }

    pub async fn wait(&self) {
        let delay = self.sample();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

/// CID -> envelope kind, recorded for every synthesized identifier.
#[derive(Debug, Default)]
pub struct TagIndex {
    entries: RwLock<HashMap<ContentId, String>>,
}

impl TagIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, cid: ContentId, kind: &str) {
        self.entries.write().insert(cid, kind.to_string());
    }

    pub fn kind_of(&self, cid: &ContentId) -> Option<String> {
        self.entries.read().get(cid).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Load an index previously written by [`TagIndex::save`].
    /// A missing file yields an empty index.
    pub async fn load(path: &Path) -> Result<Self> {
        let data = match tokio::fs::read(path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::new()),
            Err(e) => return Err(StoreError::Io(e)),
        };

        let entries: BTreeMap<ContentId, String> = serde_json::from_slice(&data)
            .map_err(|e| StoreError::Config(format!("tag index {}: {e}", path.display())))?;

        Ok(Self {
            entries: RwLock::new(entries.into_iter().collect()),
        })
    }

    /// Write the index as a key-sorted JSON object.
    ///
    /// The data goes to a sibling `.tmp` file that is then renamed over
    /// `path`, so a crash mid-write leaves the previous index intact.
    pub async fn save(&self, path: &Path) -> Result<()> {
        let snapshot: BTreeMap<ContentId, String> = self
            .entries
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let data = serde_json::to_vec_pretty(&snapshot)?;
        let tmp = temp_path(path);
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Offline generator used by the storage client.
pub struct FallbackGenerator {
    index: TagIndex,
    upload_latency: Latency,
    download_latency: Latency,
}

impl FallbackGenerator {
    pub fn new(index: TagIndex, upload_latency: Latency, download_latency: Latency) -> Self {
        Self {
            index,
            upload_latency,
            download_latency,
        }
    }

    /// A generator with an empty index and no simulated latency.
    pub fn instant() -> Self {
        Self::new(TagIndex::new(), Latency::none(), Latency::none())
    }

    pub fn index(&self) -> &TagIndex {
        &self.index
    }

    /// Synthesize a CID for `content` and remember that it holds `kind`.
    pub async fn synthesize(&self, content: &[u8], kind: &str) -> ContentId {
        self.upload_latency.wait().await;

        let cid = synthesize_cid(content);
        self.index.insert(cid.clone(), kind);
        debug!(cid = %cid, kind, size = content.len(), "Synthesized fallback CID");
        cid
    }

    /// Produce a canned envelope for a CID synthesized earlier.
    ///
    /// Unknown CIDs are a `ReconstructionMiss`; no payload shape is guessed.
    pub async fn reconstruct(&self, cid: &ContentId) -> Result<DataEnvelope> {
        self.download_latency.wait().await;

        let kind = self
            .index
            .kind_of(cid)
            .ok_or_else(|| StoreError::ReconstructionMiss(cid.to_string()))?;

        canned_envelope(cid, &kind)
    }
}

fn canned_envelope(cid: &ContentId, kind: &str) -> Result<DataEnvelope> {
    let now = Utc::now();
    let payload = match kind {
        KIND_MEASUREMENT => {
            // Stable per CID so repeated reads agree.
            let value = 120.0 + (fingerprint(cid.as_str().as_bytes()) % 800) as f64 / 10.0;
            json!({
                "value": value,
                "unit": "mg/dL",
                "measuredAt": now.to_rfc3339(),
                "notes": "2h post-meal",
                "loincCode": "2345-7",
            })
        }
        KIND_ANALYSIS => json!({
            "analysisType": 0,
            "results": {
                "average": 142.5,
                "standardDeviation": 28.3,
                "sampleSize": 268,
                "distribution": { "low": 23, "normal": 156, "high": 89 },
            },
        }),
        _ => serde_json::Value::Null,
    };

    EnvelopeBuilder::new(kind)
        .payload(&payload)?
        .metadata("synthetic", true)
        .created_at(now)
        .build()
}
