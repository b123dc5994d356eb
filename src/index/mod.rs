//! Hash-deduplicated collections of previously seen images.
//!
//! An [`Index`] remembers every image retrieved for one query by one
//! processor. The merge policy guarantees at most one entry per content hash
//! no matter how often retrieval runs:
//!
//! - a candidate whose hash is already indexed only refreshes the stored
//!   source URL (the content moved, it is not new);
//! - any other candidate is appended and reported as new.
//!
//! Persistence lives in [`IndexStore`].

mod error;
mod image;
mod store;

pub use error::IndexError;
pub use image::{ContentHash, Image};
pub use store::{INDEX_FORMAT_VERSION, IndexStore};

use std::collections::{BTreeMap, HashMap};

use tracing::{debug, warn};

/// Metadata key naming the processor that owns an index.
pub const OWNER_METADATA_KEY: &str = "processor_id";

/// Images discovered for one query, in discovery order.
#[derive(Debug, Clone, Default)]
pub struct Index {
    id: String,
    entries: Vec<Image>,
    metadata: BTreeMap<String, String>,
    positions: HashMap<ContentHash, usize>,
    dirty: bool,
}

impl Index {
    /// Creates an empty index.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    /// Rebuilds an index from stored parts.
    ///
    /// Entries repeating an earlier hash are dropped so the invariant holds
    /// even for hand-edited files.
    #[must_use]
    pub fn from_parts(
        id: impl Into<String>,
        entries: Vec<Image>,
        metadata: BTreeMap<String, String>,
    ) -> Self {
        let mut index = Self {
            id: id.into(),
            metadata,
            ..Self::default()
        };
        let total = entries.len();
        for image in entries {
            if index.positions.contains_key(&image.hash) {
                continue;
            }
            index.positions.insert(image.hash.clone(), index.entries.len());
            index.entries.push(image);
        }
        if index.entries.len() != total {
            warn!(
                index = %index.id,
                dropped = total - index.entries.len(),
                "Dropped duplicate hashes while loading index"
            );
        }
        index
    }

    /// Returns the index id (usually the query string).
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns entries in discovery order.
    #[must_use]
    pub fn entries(&self) -> &[Image] {
        &self.entries
    }

    /// Returns the number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing has been indexed yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the index metadata.
    #[must_use]
    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    /// Sets one metadata value.
    pub fn set_metadata(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.metadata.insert(key.into(), value.into());
    }

    /// Returns the owning processor id, if the index has been tagged.
    #[must_use]
    pub fn owner(&self) -> Option<&str> {
        self.metadata
            .get(OWNER_METADATA_KEY)
            .map(String::as_str)
            .filter(|owner| !owner.is_empty())
    }

    /// Tags the index with its owning processor unless already tagged.
    ///
    /// Returns true if the tag was added.
    pub fn tag_owner(&mut self, processor_id: &str) -> bool {
        if self.owner().is_some() {
            return false;
        }
        self.metadata
            .insert(OWNER_METADATA_KEY.to_string(), processor_id.to_string());
        true
    }

    /// Looks up an entry by content hash.
    #[must_use]
    pub fn find_by_hash(&self, hash: &ContentHash) -> Option<&Image> {
        self.positions.get(hash).map(|&at| &self.entries[at])
    }

    /// Returns true if an entry with this hash exists.
    #[must_use]
    pub fn contains_hash(&self, hash: &ContentHash) -> bool {
        self.positions.contains_key(hash)
    }

    /// Merges candidates and returns the ones not seen before.
    ///
    /// Known hashes get their source URL refreshed in place. Candidates
    /// repeating a hash within the same batch count once.
    pub fn merge<I>(&mut self, candidates: I) -> Vec<Image>
    where
        I: IntoIterator<Item = Image>,
    {
        let mut fresh = Vec::new();
        let mut relocated = 0_usize;

        for candidate in candidates {
            if let Some(&at) = self.positions.get(&candidate.hash) {
                let existing = &mut self.entries[at];
                if existing.source != candidate.source {
                    debug!(
                        hash = %candidate.hash,
                        from = %existing.source,
                        to = %candidate.source,
                        "Indexed image moved"
                    );
                    existing.source = candidate.source;
                    relocated += 1;
                }
                continue;
            }
            self.positions
                .insert(candidate.hash.clone(), self.entries.len());
            self.entries.push(candidate.clone());
            fresh.push(candidate);
        }

        if !fresh.is_empty() || relocated > 0 {
            self.dirty = true;
        }
        debug!(
            index = %self.id,
            new = fresh.len(),
            relocated,
            total = self.entries.len(),
            "Merged candidates into index"
        );
        fresh
    }

    /// Keeps only entries matching the predicate and returns how many were removed.
    pub fn retain<F>(&mut self, mut keep: F) -> usize
    where
        F: FnMut(&Image) -> bool,
    {
        let before = self.entries.len();
        self.entries.retain(|image| keep(image));
        let removed = before - self.entries.len();
        if removed > 0 {
            self.positions = self
                .entries
                .iter()
                .enumerate()
                .map(|(at, image)| (image.hash.clone(), at))
                .collect();
            self.dirty = true;
        }
        removed
    }

    /// Returns true if entries changed since the index was loaded or last saved.
    ///
    /// Owner tagging alone does not count as a change.
    #[must_use]
    pub fn has_unsaved_changes(&self) -> bool {
        self.dirty
    }

    pub(crate) fn mark_saved(&mut self) {
        self.dirty = false;
    }
}

impl PartialEq for Index {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.entries == other.entries && self.metadata == other.metadata
    }
}

impl Eq for Index {}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::HashSet;

    use url::Url;

    use super::*;

    fn image(url: &str, digest: &str) -> Image {
        Image::new(
            Url::parse(url).unwrap(),
            "cats",
            ContentHash::from_hex(digest).unwrap(),
            "danbooru",
        )
    }

    fn assert_unique_hashes(index: &Index) {
        let unique: HashSet<_> = index.entries().iter().map(|e| &e.hash).collect();
        assert_eq!(unique.len(), index.len(), "index holds duplicate hashes");
    }

    #[test]
    fn test_index_merge_appends_new_in_order() {
        let mut index = Index::new("cats");
        let fresh = index.merge([
            image("https://example.com/1.jpg", "01"),
            image("https://example.com/2.jpg", "02"),
        ]);

        assert_eq!(fresh.len(), 2);
        assert_eq!(index.len(), 2);
        assert_eq!(index.entries()[0].hash.to_hex(), "01");
        assert_eq!(index.entries()[1].hash.to_hex(), "02");
        assert!(index.has_unsaved_changes());
    }

    #[test]
    fn test_index_merge_known_hash_updates_source_only() {
        let mut index = Index::new("cats");
        index.merge([image("https://old.example.com/1.jpg", "01")]);
        index.mark_saved();

        let fresh = index.merge([image("https://new.example.com/1.jpg", "01")]);

        assert!(fresh.is_empty());
        assert_eq!(index.len(), 1);
        assert_eq!(
            index.entries()[0].source.as_str(),
            "https://new.example.com/1.jpg"
        );
        assert!(index.has_unsaved_changes());
    }

    #[test]
    fn test_index_merge_unchanged_candidates_leave_index_clean() {
        let mut index = Index::new("cats");
        index.merge([image("https://example.com/1.jpg", "01")]);
        index.mark_saved();

        let fresh = index.merge([image("https://example.com/1.jpg", "01")]);

        assert!(fresh.is_empty());
        assert!(!index.has_unsaved_changes());
    }

    #[test]
    fn test_index_merge_dedups_within_batch() {
        let mut index = Index::new("cats");
        let fresh = index.merge([
            image("https://example.com/1.jpg", "01"),
            image("https://mirror.example.com/1.jpg", "01"),
            image("https://example.com/2.jpg", "02"),
        ]);

        assert_eq!(fresh.len(), 2);
        assert_eq!(index.len(), 2);
        assert_unique_hashes(&index);
    }

    #[test]
    fn test_index_find_by_hash() {
        let mut index = Index::new("cats");
        index.merge([image("https://example.com/1.jpg", "0a0b")]);

        let hash = ContentHash::from_hex("0a0b").unwrap();
        assert_eq!(
            index.find_by_hash(&hash).unwrap().source.as_str(),
            "https://example.com/1.jpg"
        );
        assert!(
            index
                .find_by_hash(&ContentHash::from_hex("ffff").unwrap())
                .is_none()
        );
    }

    #[test]
    fn test_index_from_parts_drops_duplicate_hashes() {
        let index = Index::from_parts(
            "cats",
            vec![
                image("https://example.com/1.jpg", "01"),
                image("https://example.com/dup.jpg", "01"),
                image("https://example.com/2.jpg", "02"),
            ],
            BTreeMap::new(),
        );

        assert_eq!(index.len(), 2);
        assert_eq!(
            index.entries()[0].source.as_str(),
            "https://example.com/1.jpg"
        );
        assert!(!index.has_unsaved_changes());
        assert_unique_hashes(&index);
    }

    #[test]
    fn test_index_retain_rebuilds_lookup() {
        let mut index = Index::new("cats");
        index.merge([
            image("https://example.com/1.jpg", "01"),
            image("https://example.com/2.jpg", "02"),
            image("https://example.com/3.jpg", "03"),
        ]);

        let removed = index.retain(|e| e.hash.to_hex() != "02");

        assert_eq!(removed, 1);
        let three = ContentHash::from_hex("03").unwrap();
        assert_eq!(
            index.find_by_hash(&three).unwrap().source.as_str(),
            "https://example.com/3.jpg"
        );
        assert!(!index.contains_hash(&ContentHash::from_hex("02").unwrap()));
    }

    #[test]
    fn test_index_tag_owner_only_once() {
        let mut index = Index::new("cats");
        assert!(index.owner().is_none());
        assert!(index.tag_owner("danbooru"));
        assert!(!index.tag_owner("gelbooru"));
        assert_eq!(index.owner(), Some("danbooru"));
        assert!(!index.has_unsaved_changes());
    }

    #[test]
    fn test_index_equality_ignores_dirty_flag() {
        let mut a = Index::new("cats");
        a.merge([image("https://example.com/1.jpg", "01")]);
        let b = Index::from_parts("cats", a.entries().to_vec(), BTreeMap::new());
        assert_eq!(a, b);
    }
}
