//! Asset ledger: Resource and Datum documents
//!
//! Externally stored data (the streamed `.bin` files) is referenced through
//! two document kinds, following the Bluesky asset-registry model:
//!
//! - **Resource**: one external file plus how to read it (`spec`)
//! - **Datum**: one addressable slice of a resource, identified by
//!   `"{resource_uid}/{sequence_number}"`
//!
//! ```text
//! Resource (uid = R)
//!    │
//!    ├── Datum (R/0)
//!    ├── Datum (R/1)
//!    └── ...
//! ```
//!
//! Documents are queued in emission order until drained. Every Datum
//! references a Resource opened earlier in the same ledger.

use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::error::{AppResult, DaqError};

/// Resource spec for APB streaming files.
pub const APB_SPEC: &str = "APB";

/// Generate a new unique document ID
pub fn new_uid() -> String {
    Uuid::new_v4().to_string()
}

/// Datum identifier for the `sequence`-th datum of a resource.
pub fn datum_id(resource_uid: &str, sequence: u64) -> String {
    format!("{}/{}", resource_uid, sequence)
}

/// Path semantics of the host OS family (`posix` or `windows`).
pub fn path_semantics() -> &'static str {
    if cfg!(windows) {
        "windows"
    } else {
        "posix"
    }
}

/// External file reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDoc {
    /// Handler spec used to read the file.
    pub spec: String,
    /// Root directory the file lives under.
    pub root: String,
    /// Path of the file.
    pub resource_path: String,
    /// Extra handler arguments.
    #[serde(default)]
    pub resource_kwargs: BTreeMap<String, serde_json::Value>,
    /// `posix` or `windows`.
    pub path_semantics: String,
    /// Resource UID.
    pub uid: String,
}

/// One addressable slice of a resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatumDoc {
    /// UID of the owning resource.
    pub resource: String,
    /// Extra handler arguments for this slice.
    #[serde(default)]
    pub datum_kwargs: BTreeMap<String, serde_json::Value>,
    /// `"{resource}/{sequence_number}"`.
    pub datum_id: String,
}

/// Asset document as emitted by the ledger.
///
/// Serializes externally tagged: `{"resource": {...}}` / `{"datum": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetDocument {
    /// External file reference.
    Resource(ResourceDoc),
    /// Slice of a resource.
    Datum(DatumDoc),
}

impl AssetDocument {
    /// Resource UID this document belongs to.
    pub fn resource_uid(&self) -> &str {
        match self {
            AssetDocument::Resource(doc) => &doc.uid,
            AssetDocument::Datum(doc) => &doc.resource,
        }
    }
}

#[derive(Debug)]
struct ResourceEntry {
    doc: ResourceDoc,
    next_sequence: u64,
}

#[derive(Debug, Default)]
struct LedgerInner {
    resources: HashMap<String, ResourceEntry>,
    pending: Vec<AssetDocument>,
}

/// Append-only queue of asset documents for one device.
#[derive(Debug, Default)]
pub struct AssetLedger {
    inner: Mutex<LedgerInner>,
}

impl AssetLedger {
    /// Empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new resource and queue its document.
    ///
    /// Not idempotent: every call creates an independent resource.
    pub fn open_resource(&self, spec: &str, root: &str, resource_path: &str) -> String {
        let uid = new_uid();
        let doc = ResourceDoc {
            spec: spec.to_string(),
            root: root.to_string(),
            resource_path: resource_path.to_string(),
            resource_kwargs: BTreeMap::new(),
            path_semantics: path_semantics().to_string(),
            uid: uid.clone(),
        };

        let mut inner = self.inner.lock();
        inner.pending.push(AssetDocument::Resource(doc.clone()));
        inner.resources.insert(
            uid.clone(),
            ResourceEntry {
                doc,
                next_sequence: 0,
            },
        );
        debug!(resource = %uid, path = resource_path, "resource opened");
        uid
    }

    /// Record the next datum of a resource and queue its document.
    pub fn record_datum(&self, resource_uid: &str) -> AppResult<String> {
        let mut inner = self.inner.lock();
        let entry = inner.resources.get_mut(resource_uid).ok_or_else(|| {
            DaqError::Configuration(format!("unknown resource '{}'", resource_uid))
        })?;

        let id = datum_id(resource_uid, entry.next_sequence);
        entry.next_sequence += 1;
        inner.pending.push(AssetDocument::Datum(DatumDoc {
            resource: resource_uid.to_string(),
            datum_kwargs: BTreeMap::new(),
            datum_id: id.clone(),
        }));
        debug!(datum = %id, "datum recorded");
        Ok(id)
    }

    /// Take every queued document, oldest first.
    pub fn drain_documents(&self) -> Vec<AssetDocument> {
        std::mem::take(&mut self.inner.lock().pending)
    }

    /// Forget every resource and discard undrained documents.
    ///
    /// Returns the number of documents discarded.
    pub fn clear(&self) -> usize {
        let mut inner = self.inner.lock();
        inner.resources.clear();
        let discarded = std::mem::take(&mut inner.pending).len();
        if discarded > 0 {
            debug!(discarded, "stale asset documents dropped");
        }
        discarded
    }

    /// Number of resources currently known.
    pub fn resource_count(&self) -> usize {
        self.inner.lock().resources.len()
    }

    /// Resource document by UID.
    pub fn resource(&self, uid: &str) -> Option<ResourceDoc> {
        self.inner.lock().resources.get(uid).map(|e| e.doc.clone())
    }

    /// Number of datums recorded against a resource (0 if unknown).
    pub fn datum_count(&self, uid: &str) -> u64 {
        self.inner
            .lock()
            .resources
            .get(uid)
            .map(|e| e.next_sequence)
            .unwrap_or(0)
    }
}
