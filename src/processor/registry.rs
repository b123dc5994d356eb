//! Processor registry: built-in constructor table plus external plugins.
//!
//! Built-ins come from a fixed id → constructor table. External processors
//! arrive in plugin bundles; a bundle entry whose id is already taken is
//! rejected while the rest of the bundle is accepted. The sorted id list is
//! cached after first use and dropped whenever the set changes.

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use super::danbooru::{DANBOORU_ID, DanbooruProcessor};
use super::error::ProcessError;
use super::gelbooru::{GELBOORU_ID, GelbooruProcessor};
use super::plugin::{PluginBundle, SubprocessProcessor};
use super::sankaku::{SANKAKU_ID, SankakuProcessor};
use super::{PaginationPolicy, RetrievalProcessor};
use crate::config::{HarvesterConfig, ProcessorSettings, RetrievalSettings};

/// Ids of the processors compiled into this build.
pub const BUILTIN_PROCESSOR_IDS: [&str; 3] = [DANBOORU_ID, GELBOORU_ID, SANKAKU_ID];

type Constructor =
    fn(&ProcessorSettings, &RetrievalSettings) -> Result<Arc<dyn RetrievalProcessor>, ProcessError>;

const BUILTINS: [(&str, Constructor); 3] = [
    (DANBOORU_ID, build_danbooru),
    (GELBOORU_ID, build_gelbooru),
    (SANKAKU_ID, build_sankaku),
];

fn build_danbooru(
    settings: &ProcessorSettings,
    retrieval: &RetrievalSettings,
) -> Result<Arc<dyn RetrievalProcessor>, ProcessError> {
    Ok(Arc::new(DanbooruProcessor::new(settings, retrieval)?))
}

fn build_gelbooru(
    settings: &ProcessorSettings,
    retrieval: &RetrievalSettings,
) -> Result<Arc<dyn RetrievalProcessor>, ProcessError> {
    Ok(Arc::new(GelbooruProcessor::new(settings, retrieval)?))
}

fn build_sankaku(
    settings: &ProcessorSettings,
    retrieval: &RetrievalSettings,
) -> Result<Arc<dyn RetrievalProcessor>, ProcessError> {
    Ok(Arc::new(SankakuProcessor::new(settings, retrieval)?))
}

/// Most edits allowed between an unknown id and a suggestion.
const MAX_SUGGESTION_DISTANCE: usize = 3;

/// Errors raised while registering or removing processors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// The id is already taken.
    #[error("processor id '{id}' is already registered\n  Suggestion: Rename the plugin processor or unregister the existing one first")]
    Collision {
        /// The contested id.
        id: String,
    },

    /// Built-in processors cannot be removed.
    #[error("processor '{id}' is built in and cannot be unregistered")]
    BuiltinRemoval {
        /// The built-in id.
        id: String,
    },

    /// The id is empty or contains whitespace.
    #[error("processor id '{id}' is not usable; ids must be non-empty and contain no whitespace")]
    InvalidId {
        /// The rejected id.
        id: String,
    },

    /// Nothing is registered under the id.
    #[error("no processor registered as '{id}'")]
    NotRegistered {
        /// The unknown id.
        id: String,
    },

    /// A plugin manifest could not be read or is malformed.
    #[error("plugin manifest '{path}' is invalid: {reason}")]
    Manifest {
        /// Manifest file.
        path: PathBuf,
        /// Human-readable cause.
        reason: String,
    },

    /// A plugin manifest was written for an incompatible version.
    #[error("plugin manifest '{path}' has version '{found}', expected major version '{supported}'\n  Suggestion: Update the plugin to a release matching this harvester")]
    UnsupportedVersion {
        /// Manifest file.
        path: PathBuf,
        /// Version found in the manifest.
        found: String,
        /// Version this build reads.
        supported: &'static str,
    },
}

impl RegistryError {
    /// Creates a manifest error.
    pub fn manifest(path: &Path, reason: impl Into<String>) -> Self {
        Self::Manifest {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }
}

/// Where a registered processor came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessorOrigin {
    /// Compiled into this build.
    BuiltIn,
    /// Registered at runtime, from a manifest file when known.
    External {
        /// Manifest the processor was declared in.
        manifest: Option<PathBuf>,
    },
}

/// Outcome of registering a plugin bundle.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RegistrationReport {
    /// Ids that were registered.
    pub accepted: Vec<String>,
    /// Entries that were refused, with the reason.
    pub rejected: Vec<RegistryError>,
}

struct Registered {
    processor: Arc<dyn RetrievalProcessor>,
    origin: ProcessorOrigin,
}

/// Maps processor ids to live processor instances.
pub struct ProcessorRegistry {
    entries: DashMap<String, Registered>,
    retrieval: RetrievalSettings,
    available: RwLock<Option<Arc<[String]>>>,
}

impl ProcessorRegistry {
    /// Creates an empty registry; plugins get the given retrieval tuning.
    #[must_use]
    pub fn new(retrieval: RetrievalSettings) -> Self {
        Self {
            entries: DashMap::new(),
            retrieval,
            available: RwLock::new(None),
        }
    }

    /// Creates a registry holding every built-in processor.
    ///
    /// A built-in that fails to construct is logged and left out.
    #[must_use]
    pub fn with_builtins(config: &HarvesterConfig) -> Self {
        let registry = Self::new(config.retrieval.clone());
        for (id, construct) in BUILTINS {
            match construct(&config.processor(id), &config.retrieval) {
                Ok(processor) => {
                    registry.entries.insert(
                        id.to_string(),
                        Registered {
                            processor,
                            origin: ProcessorOrigin::BuiltIn,
                        },
                    );
                }
                Err(error) => warn!(
                    processor = id,
                    error = %error,
                    "Built-in processor unavailable; continuing with remaining processors"
                ),
            }
        }
        registry
    }

    /// Registers a processor instance at runtime.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Collision`] if the id is taken.
    pub fn register(&self, processor: Arc<dyn RetrievalProcessor>) -> Result<(), RegistryError> {
        self.insert(processor, ProcessorOrigin::External { manifest: None })
    }

    fn insert(
        &self,
        processor: Arc<dyn RetrievalProcessor>,
        origin: ProcessorOrigin,
    ) -> Result<(), RegistryError> {
        let id = processor.id().to_string();
        if id.is_empty() || id.chars().any(char::is_whitespace) {
            return Err(RegistryError::InvalidId { id });
        }
        match self.entries.entry(id.clone()) {
            Entry::Occupied(_) => Err(RegistryError::Collision { id }),
            Entry::Vacant(slot) => {
                slot.insert(Registered { processor, origin });
                self.invalidate();
                debug!(processor = %id, "Processor registered");
                Ok(())
            }
        }
    }

    /// Registers every processor in a plugin bundle.
    ///
    /// Colliding ids are rejected individually; the rest are accepted.
    #[instrument(skip_all, fields(manifest = ?bundle.path))]
    pub fn register_external(&self, bundle: &PluginBundle) -> RegistrationReport {
        let mut report = RegistrationReport::default();
        let policy: PaginationPolicy = self.retrieval.pagination_policy();
        for manifest in &bundle.processors {
            let processor = SubprocessProcessor::new(manifest.clone(), policy.clone());
            let origin = ProcessorOrigin::External {
                manifest: bundle.path.clone(),
            };
            match self.insert(Arc::new(processor), origin) {
                Ok(()) => report.accepted.push(manifest.id.clone()),
                Err(error) => {
                    warn!(processor = %manifest.id, error = %error, "Plugin processor rejected");
                    report.rejected.push(error);
                }
            }
        }
        info!(
            accepted = report.accepted.len(),
            rejected = report.rejected.len(),
            "Plugin bundle registered"
        );
        report
    }

    /// Loads a manifest file and registers its processors.
    ///
    /// # Errors
    ///
    /// Returns the manifest errors of [`PluginBundle::load`]; per-processor
    /// collisions are reported in the [`RegistrationReport`] instead.
    pub fn load_plugin(&self, path: &Path) -> Result<RegistrationReport, RegistryError> {
        let bundle = PluginBundle::load(path)?;
        Ok(self.register_external(&bundle))
    }

    /// Removes an externally registered processor.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::BuiltinRemoval`] for built-ins and
    /// [`RegistryError::NotRegistered`] for unknown ids.
    pub fn unregister(&self, id: &str) -> Result<Arc<dyn RetrievalProcessor>, RegistryError> {
        let removed = self
            .entries
            .remove_if(id, |_, entry| entry.origin != ProcessorOrigin::BuiltIn);
        match removed {
            Some((_, entry)) => {
                self.invalidate();
                debug!(processor = id, "Processor unregistered");
                Ok(entry.processor)
            }
            None if self.entries.contains_key(id) => Err(RegistryError::BuiltinRemoval {
                id: id.to_string(),
            }),
            None => Err(RegistryError::NotRegistered { id: id.to_string() }),
        }
    }

    /// Looks up a processor by id.
    #[must_use]
    pub fn resolve(&self, id: &str) -> Option<Arc<dyn RetrievalProcessor>> {
        self.entries
            .get(id.trim())
            .map(|entry| Arc::clone(&entry.processor))
    }

    /// Returns where a processor came from.
    #[must_use]
    pub fn origin(&self, id: &str) -> Option<ProcessorOrigin> {
        self.entries.get(id.trim()).map(|entry| entry.origin.clone())
    }

    /// Returns every registered id, sorted.
    ///
    /// Computed once and reused until the registered set changes.
    #[must_use]
    pub fn available(&self) -> Arc<[String]> {
        if let Ok(cache) = self.available.read()
            && let Some(ids) = cache.as_ref()
        {
            return Arc::clone(ids);
        }
        let mut ids: Vec<String> = self.entries.iter().map(|entry| entry.key().clone()).collect();
        ids.sort();
        let ids: Arc<[String]> = ids.into();
        if let Ok(mut cache) = self.available.write() {
            *cache = Some(Arc::clone(&ids));
        }
        ids
    }

    /// Drops the cached id list.
    pub fn invalidate(&self) {
        if let Ok(mut cache) = self.available.write() {
            *cache = None;
        }
    }

    /// Suggests the registered id closest to a misspelled one.
    #[must_use]
    pub fn closest_id(&self, id: &str) -> Option<String> {
        let wanted = id.trim().to_ascii_lowercase();
        self.available()
            .iter()
            .map(|candidate| (strsim::levenshtein(&wanted, candidate), candidate))
            .filter(|(distance, _)| *distance <= MAX_SUGGESTION_DISTANCE)
            .min_by_key(|(distance, _)| *distance)
            .map(|(_, candidate)| candidate.clone())
    }
}

impl std::fmt::Debug for ProcessorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessorRegistry")
            .field("processors", &self.available())
            .finish_non_exhaustive()
    }
}
