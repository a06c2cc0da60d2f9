//! `flatshard` core - records, partitions, predicate trees, and queries.
//!
//! Everything here is pure data and pure functions; the concurrent engine
//! that reads partitions and evaluates queries lives in `flatshard-engine`.

pub mod predicate;
pub mod query;
pub mod types;

pub use predicate::{CustomPredicate, FieldOp, Pattern, Predicate, PredicateError};
pub use query::{paginate, sort_records, Query, SortDirection, SortSpec};
pub use types::{estimate_size, field_value, Partition, PartitionId, Record, ID_FIELD};
