//! Gelbooru processor - scans the XML DAPI listing with text markers.
//!
//! The listing is addressed by a zero-based page index (`pid`). Older
//! deployments put post fields in attributes (`<post md5="..."/>`), newer
//! ones in child elements (`<post><md5>...</md5></post>`); both are read.
//! A failing page is skipped rather than retried forever, since the DAPI
//! occasionally errors on one page while its neighbours are fine.

use async_trait::async_trait;
use reqwest::Client;
use url::Url;

use super::error::{FetchError, ProcessError};
use super::extract::{first_between, records, unescape_xml};
use super::fetch::{build_http_client, get_page};
use super::pagination::{PageRequest, PageSource, PaginationPolicy, run_retrieval};
use super::{RetrievalContext, RetrievalProcessor};
use crate::config::{ProcessorSettings, RetrievalSettings};
use crate::index::{ContentHash, Image, Index};
use crate::schema::Schema;

/// Processor id.
pub const GELBOORU_ID: &str = "gelbooru";

const DEFAULT_BASE_URL: &str = "https://gelbooru.com";
const DEFAULT_PAGE_SIZE: u32 = 100;

const LISTING_ROOT: &str = "<posts";
const RECORD_MARKERS: [&str; 2] = ["<post ", "<post>"];

/// Retrieves posts from a Gelbooru-compatible DAPI.
pub struct GelbooruProcessor {
    client: Client,
    base_url: String,
    user_id: Option<String>,
    api_key: Option<String>,
    page_size: u32,
    policy: PaginationPolicy,
}

impl GelbooruProcessor {
    /// Creates a processor from configuration.
    ///
    /// `login` is sent as the DAPI `user_id`.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessError::Setup`] if the HTTP client cannot be built.
    #[tracing::instrument(skip_all, fields(processor = GELBOORU_ID))]
    pub fn new(
        settings: &ProcessorSettings,
        retrieval: &RetrievalSettings,
    ) -> Result<Self, ProcessError> {
        let client = build_http_client(
            GELBOORU_ID,
            retrieval.connect_timeout(),
            retrieval.read_timeout(),
        )?;
        Ok(Self {
            client,
            base_url: settings
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            user_id: settings.login.clone(),
            api_key: settings.api_key.clone(),
            page_size: settings.page_size.unwrap_or(DEFAULT_PAGE_SIZE),
            policy: Self::layout(retrieval.pagination_policy()),
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
        processor.policy = Self::layout(policy);
        Ok(processor)
    }

    fn layout(policy: PaginationPolicy) -> PaginationPolicy {
        policy.with_cursor(0, 1).advance_on_failure(true)
    }

    fn listing_url(&self, request: &PageRequest) -> String {
        let mut url = format!(
            "{}/index.php?page=dapi&s=post&q=index&tags={}&pid={}&limit={}",
            self.base_url.trim_end_matches('/'),
            urlencoding::encode(&request.query),
            request.cursor,
            request.page_size.unwrap_or(self.page_size),
        );
        if let (Some(user_id), Some(api_key)) = (&self.user_id, &self.api_key) {
            url.push_str("&user_id=");
            url.push_str(&urlencoding::encode(user_id));
            url.push_str("&api_key=");
            url.push_str(&urlencoding::encode(api_key));
        }
        url
    }
}

impl std::fmt::Debug for GelbooruProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GelbooruProcessor")
            .field("base_url", &self.base_url)
            .field("user_id", &self.user_id)
            .field("page_size", &self.page_size)
            .finish_non_exhaustive()
    }
}

/// Reads one post field from either the attribute or the element form.
fn post_field(record: &str, name: &str) -> Option<String> {
    let attribute = format!(" {name}=\"");
    let open = format!("<{name}>");
    let close = format!("</{name}>");
    first_between(record, &attribute, "\"")
        .or_else(|| first_between(record, &open, &close))
        .map(|raw| unescape_xml(raw.trim()))
        .filter(|value| !value.is_empty())
}

fn absolutize(raw: &str) -> Option<Url> {
    if raw.starts_with("//") {
        Url::parse(&format!("https:{raw}")).ok()
    } else {
        Url::parse(raw).ok()
    }
}

#[async_trait]
impl PageSource for GelbooruProcessor {
    async fn fetch_page(&self, request: &PageRequest) -> Result<String, FetchError> {
        let url = self.listing_url(request);
        get_page(&self.client, &url, None).await
    }

    fn extract(&self, body: &str, query: &str) -> Result<Vec<Image>, FetchError> {
        if !body.contains(LISTING_ROOT) {
            return Err(FetchError::transient(
                &self.base_url,
                "response is not a DAPI posts listing",
            ));
        }
        Ok(records(body, &RECORD_MARKERS)
            .into_iter()
            .filter_map(|record| {
                let hash = ContentHash::from_hex(&post_field(record, "md5")?)?;
                let source = absolutize(&post_field(record, "file_url")?)?;
                let mut image = Image::new(source, query, hash, GELBOORU_ID);
                if let Some(id) = post_field(record, "id") {
                    image = image.with_meta("post_id", id);
                }
                if let Some(rating) = post_field(record, "rating") {
                    image = image.with_meta("rating", rating);
                }
                Some(image)
            })
            .collect())
    }

    fn listed_entries(&self, body: &str) -> usize {
        records(body, &RECORD_MARKERS).len()
    }
}

#[async_trait]
impl RetrievalProcessor for GelbooruProcessor {
    fn id(&self) -> &str {
        GELBOORU_ID
    }

    fn informal_name(&self) -> &str {
        "Gelbooru"
    }

    fn recognizes_source(&self, source: &Url) -> bool {
        source
            .host_str()
            .is_some_and(|host| host == "gelbooru.com" || host.ends_with(".gelbooru.com"))
    }

    async fn process(
        &self,
        index: &mut Index,
        schema: &Schema,
        ctx: &RetrievalContext,
    ) -> Result<Vec<Image>, ProcessError> {
        run_retrieval(GELBOORU_ID, self, index, schema, ctx, &self.policy).await
    }
}
