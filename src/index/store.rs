//! On-disk persistence for indexes: one JSON file per (processor, query).
//!
//! Layout: `<root>/<processor_id>/<query-slug>-<sha256 prefix>.json`. The slug
//! keeps files recognizable; the hash prefix keeps distinct queries that
//! sanitize to the same slug apart.
//!
//! Writes go to a temporary sibling first and are renamed over the target, so
//! a crash mid-write leaves the previous copy intact.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument, warn};

use super::{Image, Index, IndexError};
use crate::download::sanitize_filename_component;

/// Format version written into index files.
pub const INDEX_FORMAT_VERSION: u32 = 1;

const MAX_SLUG_CHARS: usize = 48;
const HASH_PREFIX_CHARS: usize = 12;

#[derive(Serialize)]
struct IndexFileRef<'a> {
    format_version: u32,
    id: &'a str,
    entries: &'a [Image],
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    metadata: &'a BTreeMap<String, String>,
}

#[derive(Deserialize)]
struct IndexFile {
    #[serde(default = "default_format_version")]
    format_version: u32,
    id: String,
    #[serde(default)]
    entries: Vec<Image>,
    #[serde(default)]
    metadata: BTreeMap<String, String>,
}

fn default_format_version() -> u32 {
    INDEX_FORMAT_VERSION
}

/// Directory-backed index persistence.
#[derive(Debug, Clone)]
pub struct IndexStore {
    root: PathBuf,
}

impl IndexStore {
    /// Creates a store rooted at `root`. The directory is created on first save.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns the store root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the file an index for `(processor_id, query)` lives in.
    #[must_use]
    pub fn path_for(&self, processor_id: &str, query: &str) -> PathBuf {
        let processor_dir = non_empty_or(sanitize_filename_component(processor_id), "unknown");
        self.root
            .join(processor_dir)
            .join(format!("{}.json", file_stem_for(query)))
    }

    /// Loads the index for `(processor_id, query)`.
    ///
    /// A missing file, or one that fails to parse, yields a fresh empty index.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::Io`] when the file exists but cannot be read and
    /// [`IndexError::UnsupportedVersion`] when it was written by a newer format.
    #[instrument(skip(self), fields(root = %self.root.display()))]
    pub async fn load(&self, processor_id: &str, query: &str) -> Result<Index, IndexError> {
        let path = self.path_for(processor_id, query);
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No stored index; starting empty");
                return Ok(Index::new(query));
            }
            Err(error) => return Err(IndexError::io(path, error)),
        };

        let file: IndexFile = match serde_json::from_str(&raw) {
            Ok(file) => file,
            Err(error) => {
                warn!(
                    path = %path.display(),
                    error = %error,
                    "Stored index is corrupt; starting empty"
                );
                return Ok(Index::new(query));
            }
        };

        if file.format_version > INDEX_FORMAT_VERSION {
            return Err(IndexError::UnsupportedVersion {
                path,
                found: file.format_version,
                supported: INDEX_FORMAT_VERSION,
            });
        }
        if file.id != query {
            warn!(
                path = %path.display(),
                stored = %file.id,
                requested = %query,
                "Stored index belongs to a different query; starting empty"
            );
            return Ok(Index::new(query));
        }

        let index = Index::from_parts(file.id, file.entries, file.metadata);
        debug!(path = %path.display(), entries = index.len(), "Loaded index");
        Ok(index)
    }

    /// Persists the index, atomically replacing any previous copy.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::Io`] or [`IndexError::Serialize`].
    #[instrument(skip(self, index), fields(index = %index.id(), entries = index.len()))]
    pub async fn save(&self, processor_id: &str, index: &mut Index) -> Result<PathBuf, IndexError> {
        let path = self.path_for(processor_id, index.id());
        let encoded = serde_json::to_vec_pretty(&IndexFileRef {
            format_version: INDEX_FORMAT_VERSION,
            id: index.id(),
            entries: index.entries(),
            metadata: index.metadata(),
        })
        .map_err(|source| IndexError::Serialize {
            id: index.id().to_string(),
            source,
        })?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| IndexError::io(parent, e))?;
        }

        let tmp_path = path.with_extension("json.tmp");
        write_synced(&tmp_path, &encoded).await?;
        if let Err(error) = tokio::fs::rename(&tmp_path, &path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(IndexError::io(&path, error));
        }

        index.mark_saved();
        info!(path = %path.display(), "Saved index");
        Ok(path)
    }
}

async fn write_synced(path: &Path, bytes: &[u8]) -> Result<(), IndexError> {
    let mut file = tokio::fs::File::create(path)
        .await
        .map_err(|e| IndexError::io(path, e))?;
    file.write_all(bytes)
        .await
        .map_err(|e| IndexError::io(path, e))?;
    file.sync_all().await.map_err(|e| IndexError::io(path, e))
}

fn file_stem_for(query: &str) -> String {
    let slug: String = sanitize_filename_component(query)
        .chars()
        .take(MAX_SLUG_CHARS)
        .collect();
    let digest = hex::encode(Sha256::digest(query.as_bytes()));
    format!(
        "{}-{}",
        non_empty_or(slug, "query"),
        &digest[..HASH_PREFIX_CHARS]
    )
}

fn non_empty_or(value: String, fallback: &str) -> String {
    if value.is_empty() {
        fallback.to_string()
    } else {
        value
    }
}
