//! Collected records and deferred resolution
//!
//! `collect` never decodes data. It yields [`CollectedRecord`]s whose values
//! are datum IDs (`filled = false`); a consumer later hands those IDs to a
//! [`RecordResolver`] to get the decoded [`RecordTable`].
//!
//! ```rust,ignore
//! let output = run_fly_scan(&orchestrator).await?;
//! let resolver = CachingResolver::new(FileResolver::from_documents(&output.asset_docs));
//! for record in &output.records {
//!     for r in record.refs() {
//!         let run = resolver.resolve(&r.datum_id).await?;
//!         println!("{}: {:?}", r.field, run.table.shape());
//!     }
//! }
//! ```

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::decoder::{self, DecodedRun};
use crate::error::{AppResult, DaqError};
use crate::ledger::{AssetDocument, ResourceDoc};

/// Current wall-clock time as float seconds since the Unix epoch.
pub fn now_secs() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1e6
}

/// One collected event: field name to datum ID, not yet filled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectedRecord {
    /// Field name to datum ID.
    pub data: BTreeMap<String, String>,
    /// Field name to collection time.
    pub timestamps: BTreeMap<String, f64>,
    /// Collection time.
    pub time: f64,
    /// Field name to whether `data` holds the real value.
    pub filled: BTreeMap<String, bool>,
}

impl CollectedRecord {
    /// Unfilled record referencing one datum.
    pub fn reference(field: &str, datum_id: &str, time: f64) -> Self {
        Self {
            data: BTreeMap::from([(field.to_string(), datum_id.to_string())]),
            timestamps: BTreeMap::from([(field.to_string(), time)]),
            time,
            filled: BTreeMap::from([(field.to_string(), false)]),
        }
    }

    /// References still to be resolved.
    pub fn refs(&self) -> Vec<RecordRef> {
        self.data
            .iter()
            .filter(|(field, _)| !self.filled.get(*field).copied().unwrap_or(false))
            .map(|(field, datum_id)| RecordRef {
                field: field.clone(),
                datum_id: datum_id.clone(),
            })
            .collect()
    }
}

/// Unresolved field of a collected record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordRef {
    /// Field (device) name.
    pub field: String,
    /// Datum ID to resolve.
    pub datum_id: String,
}

/// Description of one externally stored field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataKey {
    /// Data source (`APB`).
    pub source: String,
    /// Data type (`array`).
    pub dtype: String,
    /// Shape, `-1` for unknown dimensions.
    pub shape: Vec<i64>,
    /// Local samples file.
    pub filename_bin: String,
    /// Local settings file.
    pub filename_txt: String,
    /// External storage marker.
    pub external: String,
}

impl DataKey {
    /// Key for a streamed APB file pair.
    pub fn apb(filename_bin: String, filename_txt: String) -> Self {
        Self {
            source: "APB".to_string(),
            dtype: "array".to_string(),
            shape: vec![-1, -1],
            filename_bin,
            filename_txt,
            external: "FILESTORE:".to_string(),
        }
    }
}

/// Resource UID part of a datum ID.
pub fn resource_of(datum_id: &str) -> Option<&str> {
    datum_id.rsplit_once('/').map(|(resource, _)| resource)
}

/// Turns a datum ID into decoded data.
#[async_trait]
pub trait RecordResolver: Send + Sync {
    /// Decode the data behind `datum_id`.
    async fn resolve(&self, datum_id: &str) -> AppResult<Arc<DecodedRun>>;
}

/// Resolver that decodes files named by registered Resource documents.
#[derive(Debug, Default)]
pub struct FileResolver {
    resources: RwLock<HashMap<String, ResourceDoc>>,
}

impl FileResolver {
    /// Resolver with no known resources.
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolver knowing every resource in `docs`.
    pub fn from_documents(docs: &[AssetDocument]) -> Self {
        let resolver = Self::new();
        resolver.register(docs);
        resolver
    }

    /// Learn the resources in `docs`. Datum documents are ignored.
    pub fn register(&self, docs: &[AssetDocument]) {
        let mut resources = self.resources.write();
        for doc in docs {
            if let AssetDocument::Resource(resource) = doc {
                resources.insert(resource.uid.clone(), resource.clone());
            }
        }
    }

    fn file_for(&self, datum_id: &str) -> AppResult<PathBuf> {
        let uid = resource_of(datum_id).ok_or_else(|| {
            DaqError::Configuration(format!("malformed datum id '{}'", datum_id))
        })?;
        let resources = self.resources.read();
        let resource = resources.get(uid).ok_or_else(|| {
            DaqError::Configuration(format!(
                "datum '{}' references unknown resource '{}'",
                datum_id, uid
            ))
        })?;
        let path = PathBuf::from(&resource.resource_path);
        Ok(if path.is_absolute() {
            path
        } else {
            PathBuf::from(&resource.root).join(path)
        })
    }
}

#[async_trait]
impl RecordResolver for FileResolver {
    async fn resolve(&self, datum_id: &str) -> AppResult<Arc<DecodedRun>> {
        let path = self.file_for(datum_id)?;
        debug!(datum = datum_id, path = %path.display(), "resolving datum");
        let run = tokio::task::spawn_blocking(move || decoder::decode(&path))
            .await
            .map_err(|e| DaqError::Instrument(format!("decoder task failed: {}", e)))??;
        Ok(Arc::new(run))
    }
}

/// Resolver that decodes each datum once.
pub struct CachingResolver<R> {
    inner: R,
    cache: Mutex<HashMap<String, Arc<DecodedRun>>>,
}

impl<R: RecordResolver> CachingResolver<R> {
    /// Cache in front of `inner`.
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Wrapped resolver.
    pub fn inner(&self) -> &R {
        &self.inner
    }

    /// Number of cached datums.
    pub fn cached(&self) -> usize {
        self.cache.lock().len()
    }
}

#[async_trait]
impl<R: RecordResolver> RecordResolver for CachingResolver<R> {
    async fn resolve(&self, datum_id: &str) -> AppResult<Arc<DecodedRun>> {
        if let Some(run) = self.cache.lock().get(datum_id).cloned() {
            return Ok(run);
        }
        let run = self.inner.resolve(datum_id).await?;
        self.cache
            .lock()
            .entry(datum_id.to_string())
            .or_insert_with(|| run.clone());
        Ok(run)
    }
}
