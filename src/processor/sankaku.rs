//! Sankaku processor - JSON listing behind a bearer token.
//!
//! With credentials configured, the first page request logs in and caches
//! the access token. A 401 makes the pagination loop call
//! [`PageSource::reauthenticate`], which logs in again once per page.
//! Without credentials the listing is read anonymously.

use async_trait::async_trait;
use reqwest::Client;
use serde::de::IgnoredAny;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, instrument};
use url::Url;

use super::error::{FetchError, ProcessError};
use super::fetch::{build_http_client, get_page};
use super::pagination::{PageRequest, PageSource, PaginationPolicy, run_retrieval};
use super::{RetrievalContext, RetrievalProcessor};
use crate::config::{ProcessorSettings, RetrievalSettings};
use crate::index::{ContentHash, Image, Index};
use crate::schema::Schema;

/// Processor id.
pub const SANKAKU_ID: &str = "sankaku";

const DEFAULT_BASE_URL: &str = "https://capi-v2.sankakucomplex.com";
const DEFAULT_PAGE_SIZE: u32 = 40;

#[derive(Debug, Deserialize)]
struct SankakuPost {
    id: Option<u64>,
    md5: Option<String>,
    file_url: Option<String>,
    rating: Option<String>,
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    login: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
struct LoginResponse {
    access_token: Option<String>,
}

#[derive(Debug, Clone)]
struct Credentials {
    login: String,
    password: String,
}

/// Cached bearer token plus what is needed to get a new one.
#[derive(Debug)]
struct TokenSession {
    credentials: Option<Credentials>,
    auth_url: String,
    token: RwLock<Option<String>>,
}

impl TokenSession {
    async fn current(&self) -> Option<String> {
        self.token.read().await.clone()
    }

    #[instrument(skip(self, client), fields(auth_url = %self.auth_url))]
    async fn login(&self, client: &Client) -> Result<String, FetchError> {
        let Some(credentials) = &self.credentials else {
            return Err(FetchError::ReauthUnsupported);
        };
        let response = client
            .post(&self.auth_url)
            .json(&LoginRequest {
                login: &credentials.login,
                password: &credentials.password,
            })
            .send()
            .await
            .map_err(|e| FetchError::AuthFailed {
                reason: format!("cannot reach login endpoint: {e}"),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::AuthFailed {
                reason: format!("login endpoint returned HTTP {}", status.as_u16()),
            });
        }
        let token = response
            .json::<LoginResponse>()
            .await
            .ok()
            .and_then(|body| body.access_token)
            .filter(|token| !token.is_empty())
            .ok_or_else(|| FetchError::AuthFailed {
                reason: "login response carried no access token".to_string(),
            })?;

        *self.token.write().await = Some(token.clone());
        debug!("Access token refreshed");
        Ok(token)
    }
}

/// Retrieves posts from the Sankaku API.
pub struct SankakuProcessor {
    client: Client,
    base_url: String,
    session: TokenSession,
    page_size: u32,
    policy: PaginationPolicy,
}

impl SankakuProcessor {
    /// Creates a processor from configuration.
    ///
    /// Credentials are `login` plus `password`; the token endpoint defaults to
    /// `<base_url>/auth/token`.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessError::Setup`] if the HTTP client cannot be built or
    /// only half of the credentials are configured.
    #[tracing::instrument(skip_all, fields(processor = SANKAKU_ID))]
    pub fn new(
        settings: &ProcessorSettings,
        retrieval: &RetrievalSettings,
    ) -> Result<Self, ProcessError> {
        let client = build_http_client(
            SANKAKU_ID,
            retrieval.connect_timeout(),
            retrieval.read_timeout(),
        )?;
        let base_url = settings
            .base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let credentials = match (&settings.login, &settings.password) {
            (Some(login), Some(password)) => Some(Credentials {
                login: login.clone(),
                password: password.clone(),
            }),
            (None, None) => None,
            _ => {
                return Err(ProcessError::setup(
                    SANKAKU_ID,
                    "both `login` and `password` must be set to authenticate",
                ));
            }
        };
        let auth_url = settings
            .auth_url
            .clone()
            .unwrap_or_else(|| format!("{}/auth/token", base_url.trim_end_matches('/')));

        Ok(Self {
            client,
            base_url,
            session: TokenSession {
                credentials,
                auth_url,
                token: RwLock::new(None),
            },
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
        credentials: Option<(&str, &str)>,
        policy: PaginationPolicy,
    ) -> Result<Self, ProcessError> {
        let settings = ProcessorSettings {
            base_url: Some(base_url.into()),
            login: credentials.map(|(login, _)| login.to_string()),
            password: credentials.map(|(_, password)| password.to_string()),
            ..ProcessorSettings::default()
        };
        let mut processor = Self::new(&settings, &RetrievalSettings::default())?;
        processor.policy = policy.with_cursor(1, 1);
        Ok(processor)
    }

    fn listing_url(&self, request: &PageRequest) -> String {
        format!(
            "{}/posts?tags={}&page={}&limit={}",
            self.base_url.trim_end_matches('/'),
            urlencoding::encode(&request.query),
            request.cursor,
            request.page_size.unwrap_or(self.page_size),
        )
    }
}

impl std::fmt::Debug for SankakuProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SankakuProcessor")
            .field("base_url", &self.base_url)
            .field("auth_url", &self.session.auth_url)
            .field("authenticated", &self.session.credentials.is_some())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl PageSource for SankakuProcessor {
    async fn fetch_page(&self, request: &PageRequest) -> Result<String, FetchError> {
        let mut token = self.session.current().await;
        if token.is_none() && self.session.credentials.is_some() {
            token = Some(self.session.login(&self.client).await?);
        }
        let url = self.listing_url(request);
        get_page(&self.client, &url, token.as_deref()).await
    }

    fn extract(&self, body: &str, query: &str) -> Result<Vec<Image>, FetchError> {
        let posts: Vec<SankakuPost> = serde_json::from_str(body).map_err(|e| {
            FetchError::transient(&self.base_url, format!("unreadable posts listing: {e}"))
        })?;
        Ok(posts
            .into_iter()
            .filter_map(|post| {
                let hash = ContentHash::from_hex(post.md5.as_deref()?)?;
                let source = Url::parse(post.file_url.as_deref()?).ok()?;
                let mut image = Image::new(source, query, hash, SANKAKU_ID);
                if let Some(id) = post.id {
                    image = image.with_meta("post_id", id.to_string());
                }
                if let Some(rating) = post.rating {
                    image = image.with_meta("rating", rating);
                }
                Some(image)
            })
            .collect())
    }

    fn listed_entries(&self, body: &str) -> usize {
        serde_json::from_str::<Vec<IgnoredAny>>(body).map_or(0, |posts| posts.len())
    }

    async fn reauthenticate(&self) -> Result<(), FetchError> {
        self.session.login(&self.client).await?;
        info!(processor = SANKAKU_ID, "Session re-authenticated");
        Ok(())
    }
}

#[async_trait]
impl RetrievalProcessor for SankakuProcessor {
    fn id(&self) -> &str {
        SANKAKU_ID
    }

    fn informal_name(&self) -> &str {
        "Sankaku Channel"
    }

    fn recognizes_source(&self, source: &Url) -> bool {
        source.host_str().is_some_and(|host| {
            host == "sankakucomplex.com" || host.ends_with(".sankakucomplex.com")
        })
    }

    async fn process(
        &self,
        index: &mut Index,
        schema: &Schema,
        ctx: &RetrievalContext,
    ) -> Result<Vec<Image>, ProcessError> {
        run_retrieval(SANKAKU_ID, self, index, schema, ctx, &self.policy).await
    }
}
