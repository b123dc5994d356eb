//! Error types for schema, rule and bundle validation.
//!
//! Validation failures are caller errors: they are never retried and always
//! carry enough context to fix the offending input.

use thiserror::Error;

/// Errors raised when a schema, rule or rule bundle is malformed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// The query string is empty or whitespace.
    #[error("schema for processor '{processor_id}' has an empty query\n  Suggestion: Provide a non-empty search query")]
    EmptyQuery {
        /// Processor the schema was aimed at (may itself be empty).
        processor_id: String,
    },

    /// The processor identifier is empty or whitespace.
    #[error("schema for query '{query}' has no processor id\n  Suggestion: Pick one of the ids listed by `harvester processors`")]
    EmptyProcessorId {
        /// Query of the offending schema.
        query: String,
    },

    /// A rule lists no processors at all.
    #[error("rule for query '{query}' lists no processors\n  Suggestion: Add at least one processor id to the rule")]
    NoProcessors {
        /// Query of the offending rule.
        query: String,
    },

    /// A schema was handed to a processor it does not name.
    #[error("schema names processor '{expected}' but was handed to '{actual}'")]
    ProcessorMismatch {
        /// Processor id stored in the schema.
        expected: String,
        /// Processor that received the schema.
        actual: String,
    },

    /// An imported bundle was written by an incompatible version.
    #[error("bundle version '{found}' is not compatible with supported version '{supported}'\n  Suggestion: Re-export the bundle with a matching release")]
    UnsupportedBundleVersion {
        /// Version tag found in the bundle.
        found: String,
        /// Version tag this build reads and writes.
        supported: String,
    },

    /// An imported bundle could not be decoded.
    #[error("rule bundle could not be read: {reason}")]
    MalformedBundle {
        /// Decoder message.
        reason: String,
    },
}

impl ValidationError {
    /// Creates an `EmptyQuery` error.
    #[must_use]
    pub fn empty_query(processor_id: &str) -> Self {
        Self::EmptyQuery {
            processor_id: processor_id.to_string(),
        }
    }

    /// Creates an `EmptyProcessorId` error.
    #[must_use]
    pub fn empty_processor_id(query: &str) -> Self {
        Self::EmptyProcessorId {
            query: query.to_string(),
        }
    }

    /// Creates a `NoProcessors` error.
    #[must_use]
    pub fn no_processors(query: &str) -> Self {
        Self::NoProcessors {
            query: query.to_string(),
        }
    }

    /// Creates a `ProcessorMismatch` error.
    #[must_use]
    pub fn processor_mismatch(expected: &str, actual: &str) -> Self {
        Self::ProcessorMismatch {
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }
}
