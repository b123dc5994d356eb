//! The orchestrator: validate, resolve, load, process, tag, persist.
//!
//! [`Harvester::retrieve`] is the one entry point callers need for a single
//! schema; [`Harvester::write_images_to_file`] is the post-processing step that
//! puts accepted images on disk using each owning processor's filename rule.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::config::HarvesterConfig;
use crate::download::{
    DownloadError, HttpImageFetcher, ImageFetcher, filename_from_url, sanitize_filename,
};
use crate::index::{Image, Index, IndexError, IndexStore};
use crate::processor::{
    ProcessError, ProcessorRegistry, RegistryError, RetrievalContext, RetrievalProcessor,
};
use crate::schema::{Rule, Schema, ValidationError};

/// Errors surfaced by the orchestrator.
#[derive(Debug, Error)]
pub enum HarvestError {
    /// The schema or rule is malformed.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// No processor is registered under the schema's id.
    #[error("unknown processor '{id}'{}\n  Suggestion: Run `harvester processors` to list available ids",
        suggestion.as_ref().map(|s| format!(" (did you mean '{s}'?)")).unwrap_or_default())]
    ProcessorNotFound {
        /// The requested id.
        id: String,
        /// Closest registered id, if any is close.
        suggestion: Option<String>,
    },

    /// The stored index belongs to another processor.
    #[error("index for '{query}' is owned by '{owner}', not '{processor}'\n  Suggestion: Move the index file aside or use processor '{owner}'")]
    ForeignIndex {
        /// Query of the index.
        query: String,
        /// Processor that was asked to use it.
        processor: String,
        /// Owner recorded in the index, or a description of the foreign entries.
        owner: String,
    },

    /// Index persistence failed.
    #[error(transparent)]
    Index(#[from] IndexError),

    /// The processor failed; a fatal failure still carries partial results.
    #[error(transparent)]
    Process(#[from] ProcessError),

    /// A plugin bundle could not be registered.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// The image destination is unusable.
    #[error("destination {path} is unusable: {reason}\n  Suggestion: Create the directory or pass --mkdirs")]
    Destination {
        /// The destination directory.
        path: PathBuf,
        /// Human-readable cause.
        reason: String,
    },

    /// The image fetcher could not be set up.
    #[error(transparent)]
    Download(#[from] DownloadError),
}

impl HarvestError {
    /// Returns partial results carried by a fatal retrieval failure.
    #[must_use]
    pub fn partial_images(&self) -> &[Image] {
        match self {
            Self::Process(error) => error.partial_images(),
            _ => &[],
        }
    }
}

/// Options for [`Harvester::write_images_to_file`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteOptions {
    /// Replace files that already exist.
    pub overwrite: bool,
    /// Create the destination directory if missing.
    pub mkdirs: bool,
}

/// One image that could not be written.
#[derive(Debug)]
pub struct WriteFailure {
    /// Where the image was fetched from.
    pub source: Url,
    /// Where it should have been written.
    pub destination: PathBuf,
    /// What went wrong.
    pub error: DownloadError,
}

/// Outcome of a batch write.
#[derive(Debug, Default)]
pub struct WriteReport {
    /// Images written.
    pub written: usize,
    /// Images skipped because the file already existed.
    pub skipped: usize,
    /// Images that failed; the batch continued past them.
    pub failures: Vec<WriteFailure>,
}

/// Result of one schema generated from a rule.
#[derive(Debug)]
pub struct RuleOutcome {
    /// The schema that ran.
    pub schema: Schema,
    /// Its new images, or why it failed.
    pub result: Result<Vec<Image>, HarvestError>,
}

/// Ties the registry, index store and image fetcher together.
pub struct Harvester {
    registry: Arc<ProcessorRegistry>,
    store: IndexStore,
    fetcher: Arc<dyn ImageFetcher>,
}

impl Harvester {
    /// Creates an orchestrator from explicit collaborators.
    #[must_use]
    pub fn new(
        registry: Arc<ProcessorRegistry>,
        store: IndexStore,
        fetcher: Arc<dyn ImageFetcher>,
    ) -> Self {
        Self {
            registry,
            store,
            fetcher,
        }
    }

    /// Builds the orchestrator a config file describes: built-ins, configured
    /// plugin bundles, the index directory and an HTTP image fetcher.
    ///
    /// # Errors
    ///
    /// Returns [`HarvestError::Registry`] if a plugin manifest cannot be read
    /// and [`HarvestError::Download`] if the HTTP fetcher cannot be built.
    pub fn from_config(config: &HarvesterConfig) -> Result<Self, HarvestError> {
        let registry = ProcessorRegistry::with_builtins(config);
        for plugin in &config.plugins {
            let report = registry.load_plugin(&plugin.manifest)?;
            debug!(
                manifest = %plugin.manifest.display(),
                accepted = report.accepted.len(),
                "Plugin bundle loaded"
            );
        }
        let fetcher = HttpImageFetcher::with_timeouts(
            config.retrieval.connect_timeout_secs,
            config.retrieval.read_timeout_secs,
        )?;
        Ok(Self::new(
            Arc::new(registry),
            IndexStore::new(config.index_dir()),
            Arc::new(fetcher),
        ))
    }

    /// Returns the processor registry.
    #[must_use]
    pub fn registry(&self) -> &ProcessorRegistry {
        &self.registry
    }

    /// Returns the index store.
    #[must_use]
    pub fn store(&self) -> &IndexStore {
        &self.store
    }

    fn resolve(&self, id: &str) -> Result<Arc<dyn RetrievalProcessor>, HarvestError> {
        self.registry
            .resolve(id)
            .ok_or_else(|| HarvestError::ProcessorNotFound {
                id: id.to_string(),
                suggestion: self.registry.closest_id(id),
            })
    }

    /// Retrieves one schema and returns only images not seen before.
    ///
    /// The index is saved when new images were found or existing entries
    /// changed (moved URLs, dropped broken entries); an unchanged run writes
    /// nothing. A fatal processor failure still saves what was gathered.
    ///
    /// # Errors
    ///
    /// Returns [`HarvestError::Validation`], [`HarvestError::ProcessorNotFound`],
    /// [`HarvestError::ForeignIndex`], [`HarvestError::Index`] or
    /// [`HarvestError::Process`].
    #[instrument(skip(self, ctx), fields(processor = schema.processor_id(), query = schema.query()))]
    pub async fn retrieve(
        &self,
        schema: &Schema,
        ctx: &RetrievalContext,
    ) -> Result<Vec<Image>, HarvestError> {
        schema.validate()?;
        let processor = self.resolve(schema.processor_id())?;
        let processor_id = processor.id().to_string();

        let mut index = self.store.load(&processor_id, schema.query()).await?;
        if !processor.validate_index(&mut index)? {
            return Err(HarvestError::ForeignIndex {
                query: schema.query().to_string(),
                processor: processor_id,
                owner: index
                    .owner()
                    .map_or_else(|| "entries from another source".to_string(), str::to_string),
            });
        }

        let outcome = processor.process(&mut index, schema, ctx).await;
        let found_new = match &outcome {
            Ok(fresh) => !fresh.is_empty(),
            Err(error) => !error.partial_images().is_empty(),
        };
        if outcome.is_err() && !found_new && !index.has_unsaved_changes() {
            return outcome.map_err(HarvestError::from);
        }

        index.tag_owner(&processor_id);
        if found_new || index.has_unsaved_changes() {
            match self.store.save(&processor_id, &mut index).await {
                Ok(path) => debug!(path = %path.display(), entries = index.len(), "Index saved"),
                Err(error) if outcome.is_err() => {
                    warn!(error = %error, "Could not save partial results of failed retrieval");
                }
                Err(error) => return Err(error.into()),
            }
        } else {
            debug!("Nothing changed; index left untouched");
        }

        let fresh = outcome?;
        info!(new = fresh.len(), total = index.len(), "Retrieval complete");
        Ok(fresh)
    }

    /// Retrieves every schema a rule generates, in order.
    ///
    /// One failing schema does not stop the others; a tripped cancel token
    /// does.
    ///
    /// # Errors
    ///
    /// Returns [`HarvestError::Validation`] if the rule itself is invalid.
    #[instrument(skip(self, ctx), fields(query = rule.query()))]
    pub async fn retrieve_rule(
        &self,
        rule: &Rule,
        ctx: &RetrievalContext,
    ) -> Result<Vec<RuleOutcome>, HarvestError> {
        rule.validate()?;
        let mut outcomes = Vec::new();
        for schema in rule.schemas() {
            if ctx.is_cancelled() {
                info!(processor = schema.processor_id(), "Skipping remaining schemas after cancel");
                break;
            }
            let result = self.retrieve(&schema, ctx).await;
            if let Err(error) = &result {
                warn!(processor = schema.processor_id(), error = %error, "Schema failed");
            }
            outcomes.push(RuleOutcome { schema, result });
        }
        Ok(outcomes)
    }

    /// Loads the stored index for a processor and query.
    ///
    /// # Errors
    ///
    /// Returns [`HarvestError::Index`] for unreadable storage.
    pub async fn load_index(&self, processor_id: &str, query: &str) -> Result<Index, HarvestError> {
        Ok(self.store.load(processor_id.trim(), query.trim()).await?)
    }

    /// Writes images into `destination`, naming each through its processor.
    ///
    /// Existing files are skipped unless `options.overwrite` is set. Individual
    /// failures are collected in the report and do not stop the batch.
    ///
    /// # Errors
    ///
    /// Returns [`HarvestError::Destination`] if the directory is missing (and
    /// `options.mkdirs` is off) or is not a directory.
    #[instrument(skip(self, images), fields(count = images.len(), destination = %destination.display()))]
    pub async fn write_images_to_file(
        &self,
        images: &[Image],
        destination: &Path,
        options: WriteOptions,
    ) -> Result<WriteReport, HarvestError> {
        prepare_destination(destination, options.mkdirs).await?;

        let mut report = WriteReport::default();
        for image in images {
            let filename = match self.registry.resolve(&image.processor_id) {
                Some(processor) => processor.derive_filename(&image.source),
                None => filename_from_url(&image.source),
            };
            let target = destination.join(sanitize_filename(&filename));

            if !options.overwrite && tokio::fs::try_exists(&target).await.unwrap_or(false) {
                debug!(path = %target.display(), "File exists, skipping");
                report.skipped += 1;
                continue;
            }

            match self.fetcher.fetch_to_file(&image.source, &target).await {
                Ok(bytes) => {
                    debug!(path = %target.display(), bytes, "Image written");
                    report.written += 1;
                }
                Err(error) => {
                    warn!(source = %image.source, error = %error, "Image write failed");
                    report.failures.push(WriteFailure {
                        source: image.source.clone(),
                        destination: target,
                        error,
                    });
                }
            }
        }

        info!(
            written = report.written,
            skipped = report.skipped,
            failed = report.failures.len(),
            "Image batch finished"
        );
        Ok(report)
    }
}

impl std::fmt::Debug for Harvester {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Harvester")
            .field("registry", &self.registry)
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

async fn prepare_destination(destination: &Path, mkdirs: bool) -> Result<(), HarvestError> {
    let unusable = |reason: String| HarvestError::Destination {
        path: destination.to_path_buf(),
        reason,
    };
    match tokio::fs::metadata(destination).await {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => Err(unusable("not a directory".to_string())),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
            if !mkdirs {
                return Err(unusable("directory does not exist".to_string()));
            }
            tokio::fs::create_dir_all(destination)
                .await
                .map_err(|e| unusable(format!("cannot create directory: {e}")))
        }
        Err(error) => Err(unusable(error.to_string())),
    }
}
