//! Retrieval requests: schemas, rules and exported rule bundles.
//!
//! A [`Schema`] is the unit of one retrieval invocation: one query, one
//! processor, and an opaque metadata bag the processor may read knobs from.
//! A [`Rule`] is a multi-processor template that expands into one schema per
//! processor, sharing the query and metadata.
//!
//! # Example
//!
//! ```
//! use harvester_core::schema::{Rule, Schema};
//!
//! let rule = Rule::new("cats", ["danbooru", "gelbooru"]);
//! let schemas = rule.schemas();
//! assert_eq!(schemas.len(), 2);
//! assert!(schemas.iter().all(Schema::is_valid));
//! ```

mod bundle;
mod error;
mod rule;

pub use bundle::{RULE_BUNDLE_VERSION, RuleBundle};
pub(crate) use bundle::check_bundle_version;
pub use error::ValidationError;
pub use rule::Rule;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Opaque metadata carried by schemas and rules.
pub type Metadata = BTreeMap<String, Value>;

/// Metadata key: stop after this many successful pages.
pub const MAX_PAGES_KEY: &str = "max_pages";

/// Metadata key: start the page cursor at this value instead of the processor default.
pub const START_PAGE_KEY: &str = "start_page";

/// Metadata key: request this many items per page.
pub const PAGE_SIZE_KEY: &str = "page_size";

/// One query aimed at one processor.
///
/// Schemas are immutable once built. The metadata bag is reference counted so
/// that schemas generated from the same [`Rule`] share one copy.
///
/// The query and processor id are stored trimmed, whether built in code or
/// deserialized, so `"cats "` and `"cats"` key the same index and route to the
/// same processor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    #[serde(deserialize_with = "deserialize_trimmed")]
    query: String,
    #[serde(deserialize_with = "deserialize_trimmed")]
    processor_id: String,
    #[serde(default)]
    metadata: Arc<Metadata>,
}

impl Schema {
    /// Creates a schema with empty metadata.
    #[must_use]
    pub fn new(query: impl Into<String>, processor_id: impl Into<String>) -> Self {
        Self::with_metadata(query, processor_id, Arc::new(Metadata::new()))
    }

    /// Creates a schema sharing an existing metadata bag.
    #[must_use]
    pub fn with_metadata(
        query: impl Into<String>,
        processor_id: impl Into<String>,
        metadata: Arc<Metadata>,
    ) -> Self {
        Self {
            query: trimmed(query.into()),
            processor_id: trimmed(processor_id.into()),
            metadata,
        }
    }

    /// Returns the search query.
    #[must_use]
    pub fn query(&self) -> &str {
        &self.query
    }

    /// Returns the id of the processor this schema targets.
    #[must_use]
    pub fn processor_id(&self) -> &str {
        &self.processor_id
    }

    /// Returns the shared metadata bag.
    #[must_use]
    pub fn metadata(&self) -> &Arc<Metadata> {
        &self.metadata
    }

    /// Returns true if both the query and the processor id are non-empty.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }

    /// Validates the schema.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::EmptyQuery`] or [`ValidationError::EmptyProcessorId`].
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.query.trim().is_empty() {
            return Err(ValidationError::empty_query(&self.processor_id));
        }
        if self.processor_id.trim().is_empty() {
            return Err(ValidationError::empty_processor_id(&self.query));
        }
        Ok(())
    }

    /// Reads an unsigned integer knob from metadata.
    ///
    /// Accepts JSON numbers and numeric strings; anything else reads as absent.
    #[must_use]
    pub fn metadata_u32(&self, key: &str) -> Option<u32> {
        match self.metadata.get(key)? {
            Value::Number(number) => number.as_u64().and_then(|n| u32::try_from(n).ok()),
            Value::String(text) => text.trim().parse().ok(),
            _ => None,
        }
    }

    /// Reads a string value from metadata.
    #[must_use]
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }
}

/// Strips surrounding whitespace, reusing the allocation when there is none.
pub(crate) fn trimmed(value: String) -> String {
    let trimmed = value.trim();
    if trimmed.len() == value.len() {
        value
    } else {
        trimmed.to_string()
    }
}

fn deserialize_trimmed<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    String::deserialize(deserializer).map(trimmed)
}
