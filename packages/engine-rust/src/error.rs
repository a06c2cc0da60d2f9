//! Error taxonomy for the engine.
//!
//! Storage adapters raise [`StorageError`] (wrapped in `anyhow::Error` at the
//! port boundary); the engine surfaces [`EngineError`]. Every error maps to an
//! [`ErrorKind`], which drives retry classification.

use flatshard_core::PredicateError;

/// Broad classification of an [`EngineError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Storage port failure. Retryable by default.
    Io,
    /// Rejected input. Never retried.
    Validation,
    /// Missing partition or location. Never retried.
    NotFound,
    /// Storage used before `connect()` or after `disconnect()`. Never retried.
    NotConnected,
    /// Map function failure, isolated to one partition.
    Map,
    /// Reduce function failure. Fatal to the whole map-reduce call.
    Reduce,
    /// Circuit breaker rejected the call without invoking it.
    CircuitOpen,
    /// An attempt exceeded its time budget.
    Timeout,
    /// Anything else, including user operation failures.
    Internal,
}

impl ErrorKind {
    /// Stable lowercase name, matched against `retryable_errors` allow-lists.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Io => "io",
            Self::Validation => "validation",
            Self::NotFound => "not_found",
            Self::NotConnected => "not_connected",
            Self::Map => "map",
            Self::Reduce => "reduce",
            Self::CircuitOpen => "circuit_open",
            Self::Timeout => "timeout",
            Self::Internal => "internal",
        }
    }

    /// Kinds that are rejected immediately regardless of retry policy.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Validation | Self::NotFound | Self::NotConnected | Self::Reduce | Self::CircuitOpen
        )
    }
}

/// Errors raised by the bundled storage adapters.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage is not connected")]
    NotConnected,
    #[error("partition location not found: {location}")]
    NotFound { location: String },
    #[error("storage unavailable for {location}")]
    Unavailable { location: String },
    #[error("i/o failure on {location}: {source}")]
    Io {
        location: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed data in {location} (line {line}): {source}")]
    Decode {
        location: String,
        line: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("cannot encode records for {location}: {source}")]
    Encode {
        location: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Errors surfaced by the engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("storage error: {0:#}")]
    Storage(anyhow::Error),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("{what} not found: {id}")]
    NotFound { what: &'static str, id: String },
    #[error("map failed for partition {partition_id}: {message}")]
    Map { partition_id: String, message: String },
    #[error("reduce failed for key {key}: {message}")]
    Reduce { key: String, message: String },
    #[error("circuit breaker is open, retry after {retry_after_ms}ms")]
    CircuitOpen { retry_after_ms: u64 },
    #[error("operation '{operation}' timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },
    #[error(transparent)]
    Filter(#[from] PredicateError),
    #[error("{0:#}")]
    Internal(#[from] anyhow::Error),
}

impl EngineError {
    /// Wraps an error returned by a storage or manifest port.
    #[must_use]
    pub fn storage(err: anyhow::Error) -> Self {
        Self::Storage(err)
    }

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Storage(err) => match err.downcast_ref::<StorageError>() {
                Some(StorageError::NotConnected) => ErrorKind::NotConnected,
                Some(StorageError::NotFound { .. }) => ErrorKind::NotFound,
                _ => ErrorKind::Io,
            },
            Self::Validation(_) | Self::Filter(_) => ErrorKind::Validation,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Map { .. } => ErrorKind::Map,
            Self::Reduce { .. } => ErrorKind::Reduce,
            Self::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_errors_classify_by_downcast() {
        let not_connected = EngineError::storage(StorageError::NotConnected.into());
        assert_eq!(not_connected.kind(), ErrorKind::NotConnected);

        let missing = EngineError::storage(
            StorageError::NotFound {
                location: "a.json".to_string(),
            }
            .into(),
        );
        assert_eq!(missing.kind(), ErrorKind::NotFound);
        assert!(missing.to_string().contains("not found"));

        let flaky = EngineError::storage(anyhow::anyhow!("connection reset"));
        assert_eq!(flaky.kind(), ErrorKind::Io);
        assert!(!flaky.kind().is_terminal());
    }

    #[test]
    fn context_chain_is_rendered() {
        let err = EngineError::storage(
            anyhow::Error::from(StorageError::Unavailable {
                location: "p1".to_string(),
            })
            .context("reading partition p1"),
        );
        let rendered = err.to_string();
        assert!(rendered.contains("reading partition p1"));
        assert!(rendered.contains("storage unavailable for p1"));
        // Context wrapping must not hide the adapter error from classification.
        assert_eq!(err.kind(), ErrorKind::Io);
    }

    #[test]
    fn terminal_kinds() {
        assert!(ErrorKind::Validation.is_terminal());
        assert!(ErrorKind::Reduce.is_terminal());
        assert!(ErrorKind::CircuitOpen.is_terminal());
        assert!(!ErrorKind::Timeout.is_terminal());
        assert!(!ErrorKind::Map.is_terminal());
        assert_eq!(ErrorKind::NotConnected.as_str(), "not_connected");
    }

    #[test]
    fn timeout_message_names_operation() {
        let err = EngineError::Timeout {
            operation: "read p1".to_string(),
            timeout_ms: 250,
        };
        assert_eq!(err.to_string(), "operation 'read p1' timed out after 250ms");
    }
}
