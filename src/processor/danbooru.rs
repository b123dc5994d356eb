//! Danbooru processor - walks the JSON posts listing page by page.
//!
//! Pages are numbered from 1. Credentials, when configured, travel as
//! `login`/`api_key` query parameters; the API has no token to refresh.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde::de::IgnoredAny;
use tracing::debug;
use url::Url;

use super::error::{FetchError, ProcessError};
use super::fetch::{build_http_client, get_page};
use super::pagination::{PageRequest, PageSource, PaginationPolicy, run_retrieval};
use super::{RetrievalContext, RetrievalProcessor};
use crate::config::{ProcessorSettings, RetrievalSettings};
use crate::index::{ContentHash, Image, Index};
use crate::schema::Schema;

/// Processor id.
pub const DANBOORU_ID: &str = "danbooru";

const DEFAULT_BASE_URL: &str = "https://danbooru.donmai.us";
const DEFAULT_PAGE_SIZE: u32 = 100;

/// One post from `posts.json`. Restricted posts omit `md5` and `file_url`.
#[derive(Debug, Deserialize)]
struct DanbooruPost {
    id: Option<u64>,
    md5: Option<String>,
    file_url: Option<String>,
    rating: Option<String>,
}

/// Retrieves posts from a Danbooru instance.
pub struct DanbooruProcessor {
    client: Client,
    base_url: String,
    login: Option<String>,
    api_key: Option<String>,
    page_size: u32,
    policy: PaginationPolicy,
}

impl DanbooruProcessor {
    /// Creates a processor from configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessError::Setup`] if the HTTP client cannot be built.
    #[tracing::instrument(skip_all, fields(processor = DANBOORU_ID))]
    pub fn new(
        settings: &ProcessorSettings,
        retrieval: &RetrievalSettings,
    ) -> Result<Self, ProcessError> {
        let client = build_http_client(
            DANBOORU_ID,
            retrieval.connect_timeout(),
            retrieval.read_timeout(),
        )?;
        Ok(Self {
            client,
            base_url: settings
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            login: settings.login.clone(),
            api_key: settings.api_key.clone(),
            page_size: settings.page_size.unwrap_or(DEFAULT_PAGE_SIZE),
            policy: retrieval.pagination_policy().with_cursor(1, 1),
        })
    }

    /// Creates a processor against a custom base URL (for testing with wiremock).
    ///
    /// # Errors
    ///
    /// Returns [`ProcessError::Setup`] if the HTTP client cannot be built.
    pub fn with_base_url(
        base_url: impl Into<String>,
        policy: PaginationPolicy,
    ) -> Result<Self, ProcessError> {
        let settings = ProcessorSettings {
            base_url: Some(base_url.into()),
            ..ProcessorSettings::default()
        };
        let mut processor = Self::new(&settings, &RetrievalSettings::default())?;
        processor.policy = policy.with_cursor(1, 1);
        Ok(processor)
    }

    /// Adds `login`/`api_key` credentials.
    #[must_use]
    pub fn with_credentials(mut self, login: impl Into<String>, api_key: impl Into<String>) -> Self {
        self.login = Some(login.into());
        self.api_key = Some(api_key.into());
        self
    }

    fn listing_url(&self, request: &PageRequest) -> String {
        let mut url = format!(
            "{}/posts.json?tags={}&page={}&limit={}",
            self.base_url.trim_end_matches('/'),
            urlencoding::encode(&request.query),
            request.cursor,
            request.page_size.unwrap_or(self.page_size),
        );
        if let (Some(login), Some(api_key)) = (&self.login, &self.api_key) {
            url.push_str("&login=");
            url.push_str(&urlencoding::encode(login));
            url.push_str("&api_key=");
            url.push_str(&urlencoding::encode(api_key));
        }
        url
    }
}

impl std::fmt::Debug for DanbooruProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DanbooruProcessor")
            .field("base_url", &self.base_url)
            .field("login", &self.login)
            .field("page_size", &self.page_size)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl PageSource for DanbooruProcessor {
    async fn fetch_page(&self, request: &PageRequest) -> Result<String, FetchError> {
        let url = self.listing_url(request);
        get_page(&self.client, &url, None).await
    }

    fn extract(&self, body: &str, query: &str) -> Result<Vec<Image>, FetchError> {
        let posts: Vec<DanbooruPost> = serde_json::from_str(body).map_err(|e| {
            FetchError::transient(&self.base_url, format!("unreadable posts listing: {e}"))
        })?;
        let total = posts.len();
        let images: Vec<Image> = posts
            .into_iter()
            .filter_map(|post| {
                let hash = ContentHash::from_hex(post.md5.as_deref()?)?;
                let source = Url::parse(post.file_url.as_deref()?).ok()?;
                let mut image = Image::new(source, query, hash, DANBOORU_ID);
                if let Some(id) = post.id {
                    image = image.with_meta("post_id", id.to_string());
                }
                if let Some(rating) = post.rating {
                    image = image.with_meta("rating", rating);
                }
                Some(image)
            })
            .collect();
        if images.len() < total {
            debug!(
                skipped = total - images.len(),
                "Skipped posts without a file URL or hash"
            );
        }
        Ok(images)
    }

    fn listed_entries(&self, body: &str) -> usize {
        serde_json::from_str::<Vec<IgnoredAny>>(body).map_or(0, |posts| posts.len())
    }
}

#[async_trait]
impl RetrievalProcessor for DanbooruProcessor {
    fn id(&self) -> &str {
        DANBOORU_ID
    }

    fn informal_name(&self) -> &str {
        "Danbooru"
    }

    fn recognizes_source(&self, source: &Url) -> bool {
        source
            .host_str()
            .is_some_and(|host| host == "donmai.us" || host.ends_with(".donmai.us"))
    }

    async fn process(
        &self,
        index: &mut Index,
        schema: &Schema,
        ctx: &RetrievalContext,
    ) -> Result<Vec<Image>, ProcessError> {
        run_retrieval(DANBOORU_ID, self, index, schema, ctx, &self.policy).await
    }
}
