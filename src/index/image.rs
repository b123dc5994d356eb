//! Retrieved item descriptors keyed by content hash.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use url::Url;

/// Content fingerprint of an image as reported by its source.
///
/// Stored as raw bytes and written to disk as lowercase hex.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ContentHash(Vec<u8>);

impl ContentHash {
    /// Wraps raw hash bytes.
    #[must_use]
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Parses a hex digest (case-insensitive, surrounding whitespace ignored).
    ///
    /// Returns `None` for empty or non-hex input.
    #[must_use]
    pub fn from_hex(digest: &str) -> Option<Self> {
        let digest = digest.trim();
        if digest.is_empty() {
            return None;
        }
        hex::decode(digest).ok().map(Self)
    }

    /// Returns the raw bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Returns true if no bytes are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the lowercase hex form.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for ContentHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        hex::decode(raw.trim())
            .map(Self)
            .map_err(serde::de::Error::custom)
    }
}

/// An image found by a processor.
///
/// Two images describe the same content when their hashes match, even if the
/// source URLs differ (CDN paths rotate while the bytes stay the same).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    /// Where the image can currently be fetched from.
    pub source: Url,
    /// The query that discovered the image.
    pub tag: String,
    /// Content fingerprint; the deduplication key.
    pub hash: ContentHash,
    /// Id of the processor that produced the image.
    pub processor_id: String,
    /// Source-specific details (post id, rating, ...).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl Image {
    /// Creates an image with empty metadata.
    #[must_use]
    pub fn new(
        source: Url,
        tag: impl Into<String>,
        hash: ContentHash,
        processor_id: impl Into<String>,
    ) -> Self {
        Self {
            source,
            tag: tag.into(),
            hash,
            processor_id: processor_id.into(),
            metadata: BTreeMap::new(),
        }
    }

    /// Adds one metadata entry.
    #[must_use]
    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Returns true if both images describe the same content.
    #[must_use]
    pub fn same_content(&self, other: &Self) -> bool {
        self.hash == other.hash
    }

    /// Returns true if the entry is usable: a hash, an owner, and an http(s) source.
    #[must_use]
    pub fn is_intact(&self) -> bool {
        !self.hash.is_empty()
            && !self.processor_id.trim().is_empty()
            && matches!(self.source.scheme(), "http" | "https")
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn image(url: &str, digest: &str) -> Image {
        Image::new(
            Url::parse(url).unwrap(),
            "cats",
            ContentHash::from_hex(digest).unwrap(),
            "danbooru",
        )
    }

    #[test]
    fn test_content_hash_from_hex_normalizes_case() {
        let upper = ContentHash::from_hex("ABCDEF01").unwrap();
        let lower = ContentHash::from_hex(" abcdef01 ").unwrap();
        assert_eq!(upper, lower);
        assert_eq!(upper.to_hex(), "abcdef01");
        assert_eq!(upper.as_bytes(), &[0xab, 0xcd, 0xef, 0x01]);
    }

    #[test]
    fn test_content_hash_from_hex_rejects_empty_and_garbage() {
        assert!(ContentHash::from_hex("").is_none());
        assert!(ContentHash::from_hex("xyz").is_none());
        assert!(ContentHash::from_hex("abc").is_none());
    }

    #[test]
    fn test_image_same_content_ignores_source() {
        let a = image("https://cdn-a.example.com/a.jpg", "00ff");
        let b = image("https://cdn-b.example.com/moved.jpg", "00ff");
        let c = image("https://cdn-a.example.com/a.jpg", "ff00");
        assert!(a.same_content(&b));
        assert!(!a.same_content(&c));
    }

    #[test]
    fn test_image_is_intact_requires_http_source_and_hash() {
        assert!(image("https://example.com/a.jpg", "00ff").is_intact());

        let mut no_hash = image("https://example.com/a.jpg", "00ff");
        no_hash.hash = ContentHash::default();
        assert!(!no_hash.is_intact());

        assert!(!image("file:///tmp/a.jpg", "00ff").is_intact());

        let mut no_owner = image("https://example.com/a.jpg", "00ff");
        no_owner.processor_id = String::new();
        assert!(!no_owner.is_intact());
    }

    #[test]
    fn test_image_serde_omits_empty_metadata() {
        let plain = image("https://example.com/a.jpg", "00ff");
        let json = serde_json::to_string(&plain).unwrap();
        assert!(!json.contains("metadata"));
        assert!(json.contains("\"hash\":\"00ff\""));
        let back: Image = serde_json::from_str(&json).unwrap();
        assert_eq!(back, plain);

        let tagged = plain.with_meta("post_id", "42");
        let back: Image = serde_json::from_str(&serde_json::to_string(&tagged).unwrap()).unwrap();
        assert_eq!(back.metadata.get("post_id").unwrap(), "42");
    }
}
