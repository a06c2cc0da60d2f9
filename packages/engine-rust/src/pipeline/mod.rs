//! Query and write orchestration over the manifest's partitions.
//!
//! Queries: cache lookup, then retry-wrapped map-reduce with a filtering map
//! and an identity reduce, then stable sort, offset and limit. The
//! paginated result is cached under the query's canonical key.
//!
//! Writes: insert appends, update and delete rewrite a partition only when
//! something matched. Any write clears the query cache.

mod state;
mod read;
mod write;

pub use self::state::{QueryPipeline, QueryResult};
