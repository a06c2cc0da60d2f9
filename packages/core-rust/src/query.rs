//! Query descriptions and the in-memory post-processing steps applied to
//! query results: stable sorting, offset/limit slicing, and cache-key
//! normalization.

use serde::{Deserialize, Serialize};

use crate::predicate::{sort_order, Predicate};
use crate::types::{field_value, PartitionId, Record};

/// Sort direction for query ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

/// Single-field ordering applied after filtering.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SortSpec {
    /// Field path to sort by (dotted paths address nested fields).
    pub field: String,
    #[serde(default)]
    pub direction: SortDirection,
}

/// A read request against a collection of partitions.
///
/// Immutable once issued; the pipeline derives its cache key from the
/// normalized shape returned by [`Query::cache_key`].
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Query {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub filters: Option<Predicate>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub sort: Option<SortSpec>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub limit: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub offset: Option<usize>,
    /// Restricts the query to these partitions. `None` means all partitions.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub partitions: Option<Vec<PartitionId>>,
}

impl Query {
    /// A query matching every record of every partition.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.filters = Some(predicate);
        self
    }

    #[must_use]
    pub fn sort_by(mut self, field: impl Into<String>, direction: SortDirection) -> Self {
        self.sort = Some(SortSpec {
            field: field.into(),
            direction,
        });
        self
    }

    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    #[must_use]
    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    #[must_use]
    pub fn in_partitions(mut self, partitions: Vec<PartitionId>) -> Self {
        self.partitions = Some(partitions);
        self
    }

    /// Whether `record` passes the query's filter (no filter passes all).
    #[must_use]
    pub fn accepts(&self, record: &Record) -> bool {
        self.filters.as_ref().map_or(true, |p| p.matches(record))
    }

    /// Deterministic cache key for this query's normalized shape.
    ///
    /// Partition lists are sorted and deduplicated so that equivalent
    /// queries share a key; predicates render canonically via
    /// [`Predicate::to_json`].
    #[must_use]
    pub fn cache_key(&self) -> String {
        let mut normalized = self.clone();
        if let Some(partitions) = normalized.partitions.as_mut() {
            partitions.sort_unstable();
            partitions.dedup();
        }
        let body = serde_json::to_string(&normalized).unwrap_or_else(|_| format!("{normalized:?}"));
        format!("query:{body}")
    }

    /// Applies sort (if any) and then offset/limit to a filtered result set.
    #[must_use]
    pub fn finish(&self, mut records: Vec<Record>) -> Vec<Record> {
        if let Some(sort) = &self.sort {
            sort_records(&mut records, sort);
        }
        paginate(records, self.offset, self.limit)
    }
}

/// Stable in-place sort by a single field.
///
/// Records with equal sort values keep their relative order in both
/// directions.
pub fn sort_records(records: &mut [Record], sort: &SortSpec) {
    records.sort_by(|a, b| {
        let (a, b) = (field_value(a, &sort.field), field_value(b, &sort.field));
        match sort.direction {
            SortDirection::Asc => sort_order(a, b),
            SortDirection::Desc => sort_order(b, a),
        }
    });
}

/// Skips `offset` records and keeps at most `limit`.
#[must_use]
pub fn paginate(records: Vec<Record>, offset: Option<usize>, limit: Option<usize>) -> Vec<Record> {
    records
        .into_iter()
        .skip(offset.unwrap_or(0))
        .take(limit.unwrap_or(usize::MAX))
        .collect()
}
