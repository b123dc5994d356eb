//! Retrieval processors: the plugin contract and everything shared by implementations.
//!
//! A processor turns a [`Schema`] into images from one remote source. Every
//! implementation runs the same pagination skeleton ([`run_retrieval`]) over
//! its own [`PageSource`], so retry, re-authentication, rate-limit cool-down
//! and the failure threshold behave identically across sources.
//!
//! # Architecture
//!
//! - [`RetrievalProcessor`] - Async trait every processor implements
//! - [`ProcessorRegistry`] - Built-in constructor table plus external plugins
//! - [`PageSource`] - Per-source page fetch, extractor and re-authentication
//! - [`PaginationPolicy`] - Failure threshold, attempt caps, cool-downs
//! - [`RetrievalContext`] - Cancellation token and progress channel for one run
//! - [`DanbooruProcessor`], [`GelbooruProcessor`], [`SankakuProcessor`] - Built-ins
//! - [`SubprocessProcessor`] - External plugin speaking JSON over stdout
//!
//! # Example
//!
//! ```no_run
//! use harvester_core::HarvesterConfig;
//! use harvester_core::index::Index;
//! use harvester_core::processor::{ProcessorRegistry, RetrievalContext};
//! use harvester_core::schema::Schema;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = ProcessorRegistry::with_builtins(&HarvesterConfig::default());
//! let processor = registry.resolve("danbooru").ok_or("missing")?;
//! let mut index = Index::new("cats");
//! let schema = Schema::new("cats", "danbooru");
//! let fresh = processor
//!     .process(&mut index, &schema, &RetrievalContext::new())
//!     .await?;
//! println!("{} new images", fresh.len());
//! # Ok(())
//! # }
//! ```

mod danbooru;
mod error;
mod extract;
mod fetch;
mod gelbooru;
mod pagination;
mod plugin;
mod registry;
mod sankaku;

pub use danbooru::DanbooruProcessor;
pub use error::{FetchError, ProcessError};
pub use extract::{all_between, first_between, records, unescape_json, unescape_xml};
pub use fetch::{build_http_client, fetch_page_with_retry, get_page};
pub use gelbooru::GelbooruProcessor;
pub use pagination::{
    PageRequest, PageSource, Pagination, PaginationEnd, PaginationPolicy, paginate,
    run_retrieval,
};
pub use plugin::{PLUGIN_BUNDLE_VERSION, PluginBundle, PluginManifest, SubprocessProcessor};
pub use registry::{
    BUILTIN_PROCESSOR_IDS, ProcessorOrigin, ProcessorRegistry, RegistrationReport, RegistryError,
};
pub use sankaku::SankakuProcessor;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};
use url::Url;

use crate::download::filename_from_url;
use crate::index::{Image, Index};
use crate::schema::Schema;

/// Cooperative cancellation flag shared between a caller and running retrievals.
///
/// Clones observe the same flag. The pagination loop polls it once per page.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Creates an untripped token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Returns true once cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Progress notifications emitted while a retrieval runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    /// A page was fetched and yielded candidates.
    PageFetched {
        /// Page cursor.
        page: u32,
        /// Candidates extracted from the page.
        items: usize,
    },
    /// The source throttled us; the loop is cooling down.
    RateLimited {
        /// Page cursor.
        page: u32,
        /// Cool-down before the page is retried.
        cooldown: Duration,
    },
    /// Credentials were refreshed and the page will be retried.
    Reauthenticated {
        /// Page cursor.
        page: u32,
    },
    /// A page failed after all attempts.
    PageFailed {
        /// Page cursor.
        page: u32,
        /// Failure counter after this page.
        consecutive_failures: u32,
        /// Description of the failure.
        reason: String,
    },
    /// The first page was empty; the query matches nothing.
    InvalidQuery {
        /// The query.
        query: String,
    },
    /// The run stopped because the cancel token was tripped.
    Cancelled {
        /// Pages fetched before stopping.
        pages: u32,
    },
    /// The failure threshold was hit.
    Fatal {
        /// Failure counter when the loop stopped.
        consecutive_failures: u32,
    },
    /// The run finished and candidates were merged.
    Finished {
        /// Newly-discovered images.
        new_images: usize,
        /// Pages fetched.
        pages: u32,
    },
}

/// Per-run collaborators handed to [`RetrievalProcessor::process`].
#[derive(Debug, Clone, Default)]
pub struct RetrievalContext {
    cancel: CancelToken,
    progress: Option<UnboundedSender<ProgressEvent>>,
}

impl RetrievalContext {
    /// Creates a context with a fresh token and no progress listener.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses a caller-owned cancel token.
    #[must_use]
    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Sends progress events to `progress`.
    #[must_use]
    pub fn with_progress(mut self, progress: UnboundedSender<ProgressEvent>) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Returns the cancel token.
    #[must_use]
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Returns true once cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Emits a progress event; a dropped receiver is ignored.
    pub fn report(&self, event: ProgressEvent) {
        if let Some(progress) = &self.progress {
            let _ = progress.send(event);
        }
    }
}

/// Trait that all retrieval processors must implement.
///
/// # Object Safety
///
/// This trait uses `async_trait` so the registry can hold
/// `Arc<dyn RetrievalProcessor>` values.
#[async_trait]
pub trait RetrievalProcessor: Send + Sync {
    /// Returns the unique processor id (e.g., "danbooru").
    fn id(&self) -> &str;

    /// Returns a human-readable name.
    fn informal_name(&self) -> &str;

    /// Returns true if `source` looks like a URL this processor produces.
    ///
    /// Used to attribute index entries that carry no owner tag.
    fn recognizes_source(&self, source: &Url) -> bool;

    /// Derives the on-disk filename for an image served from `source`.
    fn derive_filename(&self, source: &Url) -> String {
        filename_from_url(source)
    }

    /// Runs the full paginated retrieval and returns only images new to `index`.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessError::Validation`] for a malformed schema and
    /// [`ProcessError::Fatal`] (with partial results) when too many pages fail.
    async fn process(
        &self,
        index: &mut Index,
        schema: &Schema,
        ctx: &RetrievalContext,
    ) -> Result<Vec<Image>, ProcessError>;

    /// Checks that `index` belongs to this processor and drops broken entries.
    ///
    /// Returns `Ok(false)` when the index is owned by another processor or holds
    /// entries this processor cannot account for.
    ///
    /// # Errors
    ///
    /// The default implementation never fails; implementations that need I/O
    /// to validate may.
    fn validate_index(&self, index: &mut Index) -> Result<bool, ProcessError> {
        if let Some(owner) = index.owner() {
            if owner != self.id() {
                debug!(owner, processor = self.id(), "Index owned by another processor");
                return Ok(false);
            }
        } else if let Some(foreign) = index
            .entries()
            .iter()
            .find(|image| image.processor_id != self.id() && !self.recognizes_source(&image.source))
        {
            debug!(
                processor = self.id(),
                source = %foreign.source,
                "Untagged index holds a foreign entry"
            );
            return Ok(false);
        }

        let dropped = index.retain(Image::is_intact);
        if dropped > 0 {
            warn!(
                index = index.id(),
                processor = self.id(),
                dropped,
                "Dropped index entries failing integrity checks"
            );
        }
        Ok(true)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::index::ContentHash;

    struct HostOnly;

    #[async_trait]
    impl RetrievalProcessor for HostOnly {
        fn id(&self) -> &str {
            "host-only"
        }

        fn informal_name(&self) -> &str {
            "Host Only"
        }

        fn recognizes_source(&self, source: &Url) -> bool {
            source.host_str() == Some("cdn.example.com")
        }

        async fn process(
            &self,
            _index: &mut Index,
            _schema: &Schema,
            _ctx: &RetrievalContext,
        ) -> Result<Vec<Image>, ProcessError> {
            Ok(Vec::new())
        }
    }

    fn entry(url: &str, digest: &str, owner: &str) -> Image {
        Image::new(
            Url::parse(url).unwrap(),
            "cats",
            ContentHash::from_hex(digest).unwrap(),
            owner,
        )
    }

    #[test]
    fn test_cancel_token_clones_share_flag() {
        let token = CancelToken::new();
        let ctx = RetrievalContext::new().with_cancel_token(token.clone());
        assert!(!ctx.is_cancelled());
        token.cancel();
        assert!(ctx.is_cancelled());
    }

    #[tokio::test]
    async fn test_context_report_reaches_listener() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let ctx = RetrievalContext::new().with_progress(tx);
        ctx.report(ProgressEvent::PageFetched { page: 1, items: 5 });
        assert_eq!(
            rx.recv().await,
            Some(ProgressEvent::PageFetched { page: 1, items: 5 })
        );
    }

    #[test]
    fn test_context_report_without_listener_is_noop() {
        RetrievalContext::new().report(ProgressEvent::Cancelled { pages: 0 });
    }

    #[test]
    fn test_validate_index_rejects_foreign_owner() {
        let mut index = Index::new("cats");
        index.tag_owner("danbooru");
        assert!(!HostOnly.validate_index(&mut index).unwrap());
    }

    #[test]
    fn test_validate_index_untagged_falls_back_to_source_host() {
        let mut index = Index::new("cats");
        index.merge([entry("https://cdn.example.com/a.jpg", "aa", "legacy")]);
        assert!(HostOnly.validate_index(&mut index).unwrap());

        index.merge([entry("https://elsewhere.org/b.jpg", "bb", "legacy")]);
        assert!(!HostOnly.validate_index(&mut index).unwrap());
    }

    #[test]
    fn test_validate_index_drops_broken_entries() {
        let mut index = Index::new("cats");
        index.tag_owner("host-only");
        index.merge([
            entry("https://cdn.example.com/a.jpg", "aa", "host-only"),
            entry("ftp://cdn.example.com/b.jpg", "bb", "host-only"),
        ]);
        assert!(HostOnly.validate_index(&mut index).unwrap());
        assert_eq!(index.len(), 1);
        assert_eq!(index.entries()[0].source.scheme(), "https");
    }

    #[test]
    fn test_default_derive_filename_uses_last_segment() {
        let url = Url::parse("https://cdn.example.com/data/ab/cd/abcd.png?x=1").unwrap();
        assert_eq!(HostOnly.derive_filename(&url), "abcd.png");
    }
}
