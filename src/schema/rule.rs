//! Multi-processor retrieval rules.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{Metadata, Schema, ValidationError, trimmed};

/// A query fanned out to several processors.
///
/// Schemas are generated on demand by [`Rule::schemas`] and never cached, so
/// metadata edits made between calls show up in the next generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    #[serde(deserialize_with = "super::deserialize_trimmed")]
    query: String,
    processor_ids: Vec<String>,
    #[serde(default)]
    metadata: Arc<Metadata>,
}

impl Rule {
    /// Creates a rule with empty metadata.
    #[must_use]
    pub fn new<I, S>(query: impl Into<String>, processor_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            query: trimmed(query.into()),
            processor_ids: processor_ids
                .into_iter()
                .map(|id| trimmed(id.into()))
                .collect(),
            metadata: Arc::new(Metadata::new()),
        }
    }

    /// Replaces the rule metadata.
    #[must_use]
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = Arc::new(metadata);
        self
    }

    /// Returns the shared query.
    #[must_use]
    pub fn query(&self) -> &str {
        &self.query
    }

    /// Returns the processor ids in declaration order.
    #[must_use]
    pub fn processor_ids(&self) -> &[String] {
        &self.processor_ids
    }

    /// Returns the shared metadata bag.
    #[must_use]
    pub fn metadata(&self) -> &Arc<Metadata> {
        &self.metadata
    }

    /// Returns mutable access to the metadata.
    ///
    /// Schemas generated earlier keep the previous copy; the next call to
    /// [`Rule::schemas`] sees the edit.
    pub fn metadata_mut(&mut self) -> &mut Metadata {
        Arc::make_mut(&mut self.metadata)
    }

    /// Generates one schema per processor id, in order.
    ///
    /// All generated schemas share the same metadata allocation.
    #[must_use]
    pub fn schemas(&self) -> Vec<Schema> {
        self.processor_ids
            .iter()
            .map(|processor_id| {
                Schema::with_metadata(
                    self.query.clone(),
                    processor_id.clone(),
                    Arc::clone(&self.metadata),
                )
            })
            .collect()
    }

    /// Returns true if the rule generates at least one schema and all of them validate.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }

    /// Validates the rule.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::NoProcessors`] for an empty processor list,
    /// otherwise the first failing schema's error.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let schemas = self.schemas();
        if schemas.is_empty() {
            return Err(ValidationError::no_processors(&self.query));
        }
        schemas.iter().try_for_each(Schema::validate)
    }
}
