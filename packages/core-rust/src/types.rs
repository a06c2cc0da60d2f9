use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single stored record: an arbitrary JSON value, normally an object.
///
/// The engine enforces no identity. Callers use an `id` field by convention
/// for point lookups, and inserts assign one when it is missing.
pub type Record = Value;

/// Identifier of a partition as recorded in the manifest.
pub type PartitionId = String;

/// Conventional identity field on records.
pub const ID_FIELD: &str = "id";

/// A named, addressable unit of storage (one file for the file adapter).
///
/// The engine treats a partition as an opaque handle: only `location` is
/// handed to the storage port, everything else is manifest bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Partition {
    /// Unique identifier within the manifest.
    pub id: PartitionId,
    /// Storage-port specific address (a relative file path for file storage).
    pub location: String,
    /// Optional partition type tag.
    #[serde(rename = "type", skip_serializing_if = "Option::is_none", default)]
    pub partition_type: Option<String>,
    /// Optional schema document describing the records.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub schema: Option<Value>,
    /// Free-form metadata.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub metadata: Option<Value>,
}

impl Partition {
    /// Creates a partition with only an id and a location.
    #[must_use]
    pub fn new(id: impl Into<PartitionId>, location: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            location: location.into(),
            partition_type: None,
            schema: None,
            metadata: None,
        }
    }
}

/// Resolves a dotted field path (`"address.city"`) against a record.
///
/// Returns `None` when any segment is missing or traverses a non-object.
/// A path without dots is a plain top-level lookup.
#[must_use]
pub fn field_value<'a>(record: &'a Record, path: &str) -> Option<&'a Value> {
    if let Some(direct) = record.get(path) {
        return Some(direct);
    }
    if !path.contains('.') {
        return None;
    }
    path.split('.')
        .try_fold(record, |current, segment| current.get(segment))
}

/// Rough serialized size of a value in bytes.
///
/// Used for memory accounting by the cache and the stream processor.
/// Values that fail to serialize count as `fallback` bytes.
#[must_use]
pub fn estimate_size<T: Serialize + ?Sized>(value: &T, fallback: usize) -> usize {
    serde_json::to_vec(value).map_or(fallback, |bytes| bytes.len())
}
