//! Error types for cinch-context.
//!
//! Only failures a caller can act on are errors. Budget overruns and cache
//! pressure are handled inside the engines and surface as
//! [`ContextEvent`](crate::events::ContextEvent)s instead.

use thiserror::Error;

/// Failure to load content through the [`IncrementalLoader`](crate::loader::IncrementalLoader).
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("not found: {uri}")]
    NotFound { uri: String },

    #[error("read failed for {uri}: {source}")]
    Io {
        uri: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid range {start}..{end} for {uri} ({size} bytes)")]
    InvalidRange {
        uri: String,
        start: u64,
        end: u64,
        size: u64,
    },

    #[error("chunk {index} out of bounds for {uri} ({total_chunks} chunks)")]
    ChunkOutOfBounds {
        uri: String,
        index: usize,
        total_chunks: usize,
    },

    #[error("load task for {uri} did not complete: {reason}")]
    Interrupted { uri: String, reason: String },
}

impl LoadError {
    /// Classify an I/O error from a [`ContentSource`](crate::loader::ContentSource).
    pub fn from_io(uri: impl Into<String>, source: std::io::Error) -> Self {
        let uri = uri.into();
        if source.kind() == std::io::ErrorKind::NotFound {
            Self::NotFound { uri }
        } else {
            Self::Io { uri, source }
        }
    }

    /// The URI the failed load was for.
    pub fn uri(&self) -> &str {
        match self {
            Self::NotFound { uri }
            | Self::Io { uri, .. }
            | Self::InvalidRange { uri, .. }
            | Self::ChunkOutOfBounds { uri, .. }
            | Self::Interrupted { uri, .. } => uri,
        }
    }
}

/// Failure to run a compaction pass.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompactionError {
    /// Another compaction pass is in flight. The caller decides whether to
    /// wait and retry or skip.
    #[error("compaction already in progress")]
    AlreadyRunning,
}

/// Failure to read a [`ContextConfig`](crate::config::ContextConfig).
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Failure to encode or decode a [`SessionSnapshot`](crate::session::SessionSnapshot).
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("session json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unsupported session format version {found} (expected {expected})")]
    Version { found: u32, expected: u32 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_io_errors_are_classified() {
        let err = LoadError::from_io(
            "src/missing.rs",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        assert!(matches!(err, LoadError::NotFound { .. }));
        assert_eq!(err.uri(), "src/missing.rs");
    }

    #[test]
    fn other_io_errors_keep_their_source() {
        let err = LoadError::from_io(
            "src/locked.rs",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        assert!(matches!(err, LoadError::Io { .. }));
        assert!(err.to_string().contains("src/locked.rs"));
        assert!(err.to_string().contains("denied"));
    }

    #[test]
    fn compaction_error_message() {
        assert_eq!(
            CompactionError::AlreadyRunning.to_string(),
            "compaction already in progress"
        );
    }
}
