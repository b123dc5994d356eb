//! Error types for index persistence.
//!
//! A missing or unparseable index file is not an error: the store logs it and
//! starts from an empty index. What remains here are the conditions callers
//! must decide about (the disk refusing reads/writes, or a file written by a
//! newer release that must not be overwritten).

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while loading or saving an index.
#[derive(Debug, Error)]
pub enum IndexError {
    /// File system error reading or writing the index file.
    #[error("IO error on index file {path}: {source}")]
    Io {
        /// The index file (or its temporary sibling).
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The index could not be encoded.
    #[error("could not encode index '{id}': {source}")]
    Serialize {
        /// Id of the index being written.
        id: String,
        /// The underlying encoder error.
        #[source]
        source: serde_json::Error,
    },

    /// The file was written by an incompatible release.
    #[error(
        "index file {path} uses format version {found}, this build reads up to {supported}\n  Suggestion: Upgrade harvester or move the file aside"
    )]
    UnsupportedVersion {
        /// The index file.
        path: PathBuf,
        /// Version found in the file.
        found: u32,
        /// Highest version this build understands.
        supported: u32,
    },
}

impl IndexError {
    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_error_unsupported_version_message() {
        let err = IndexError::UnsupportedVersion {
            path: PathBuf::from("/tmp/idx.json"),
            found: 9,
            supported: 1,
        };
        let msg = err.to_string();
        assert!(msg.contains("/tmp/idx.json"));
        assert!(msg.contains('9'));
        assert!(msg.contains("Suggestion"));
    }

    #[test]
    fn test_index_error_io_message() {
        let err = IndexError::io(
            "/tmp/idx.json",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        assert!(err.to_string().contains("denied"));
    }
}
