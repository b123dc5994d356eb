//! Shared HTTP client policy and page fetch-with-retry.
//!
//! Built-in processors all build their client here so they agree on timeouts,
//! User-Agent, compression and proxy handling.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::Duration;

use reqwest::{Client, ClientBuilder, Proxy};
use tracing::{debug, instrument, warn};

use super::error::{FetchError, ProcessError};
use super::pagination::{PageRequest, PageSource};
use crate::user_agent;

/// Builds a processor HTTP client using shared project policy.
///
/// `processor_id` is used only for error messages and logging.
///
/// # Errors
///
/// Returns [`ProcessError::Setup`] when client construction fails.
pub fn build_http_client(
    processor_id: &str,
    connect_timeout: Duration,
    read_timeout: Duration,
) -> Result<Client, ProcessError> {
    match try_build_client(connect_timeout, read_timeout, false) {
        Ok(client) => Ok(client),
        Err(BuildClientFailure::Panic) => {
            // Some sandboxed environments panic when querying system proxy
            // settings; retry with env-proxy lookup only.
            warn!(
                processor = processor_id,
                "Processor client hit system proxy panic; using env-proxy fallback builder"
            );
            match try_build_client(connect_timeout, read_timeout, true) {
                Ok(client) => Ok(client),
                Err(BuildClientFailure::Panic) => Err(ProcessError::setup(
                    processor_id,
                    "HTTP client construction panicked while initializing networking",
                )),
                Err(BuildClientFailure::Build(error)) => Err(ProcessError::setup(
                    processor_id,
                    format!("HTTP client construction failed: {error}"),
                )),
            }
        }
        Err(BuildClientFailure::Build(error)) => Err(ProcessError::setup(
            processor_id,
            format!("HTTP client construction failed: {error}"),
        )),
    }
}

enum BuildClientFailure {
    Panic,
    Build(reqwest::Error),
}

fn try_build_client(
    connect_timeout: Duration,
    read_timeout: Duration,
    disable_system_proxy_lookup: bool,
) -> Result<Client, BuildClientFailure> {
    catch_unwind(AssertUnwindSafe(move || {
        let mut builder = Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(read_timeout)
            .user_agent(user_agent::default_user_agent())
            .gzip(true);
        if disable_system_proxy_lookup {
            builder = apply_env_proxy_fallback(builder.no_proxy());
        }
        builder.build().map_err(BuildClientFailure::Build)
    }))
    .map_err(|_| BuildClientFailure::Panic)?
}

fn apply_env_proxy_fallback(mut builder: ClientBuilder) -> ClientBuilder {
    if let Some(proxy) = env_proxy_for_scheme("https")
        && let Ok(resolved) = Proxy::https(&proxy)
    {
        builder = builder.proxy(resolved);
    }
    if let Some(proxy) = env_proxy_for_scheme("http")
        && let Ok(resolved) = Proxy::http(&proxy)
    {
        builder = builder.proxy(resolved);
    }
    builder
}

fn env_proxy_for_scheme(scheme: &str) -> Option<String> {
    match scheme {
        "https" => find_first_proxy_var(&["HTTPS_PROXY", "https_proxy", "ALL_PROXY", "all_proxy"]),
        "http" => find_first_proxy_var(&["HTTP_PROXY", "http_proxy", "ALL_PROXY", "all_proxy"]),
        _ => None,
    }
}

fn find_first_proxy_var(names: &[&str]) -> Option<String> {
    names.iter().find_map(|name| {
        std::env::var(name)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    })
}

/// Fetches one listing page as text, classifying failures.
///
/// # Errors
///
/// Returns a [`FetchError`] classified by [`FetchError::from_status`], or
/// [`FetchError::Transient`] for network and body-read failures.
#[instrument(skip(client, bearer), fields(url = %url))]
pub async fn get_page(client: &Client, url: &str, bearer: Option<&str>) -> Result<String, FetchError> {
    let mut request = client.get(url);
    if let Some(token) = bearer {
        request = request.bearer_auth(token);
    }

    let response = request
        .send()
        .await
        .map_err(|e| FetchError::transient(url, e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        debug!(status = status.as_u16(), "Listing request rejected");
        return Err(FetchError::from_status(url, status.as_u16()));
    }

    response
        .text()
        .await
        .map_err(|e| FetchError::transient(url, format!("failed to read body: {e}")))
}

/// Fetches a page, retrying transient failures up to `attempts` times.
///
/// Auth-expired and rate-limited outcomes return immediately so the
/// pagination loop can re-authenticate or cool down.
///
/// # Errors
///
/// Returns the last [`FetchError`] once attempts are exhausted.
pub async fn fetch_page_with_retry<S>(
    source: &S,
    request: &PageRequest,
    attempts: u32,
    delay: Duration,
) -> Result<String, FetchError>
where
    S: PageSource + ?Sized,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match source.fetch_page(request).await {
            Ok(body) => return Ok(body),
            Err(error @ (FetchError::AuthExpired { .. } | FetchError::RateLimited { .. })) => {
                return Err(error);
            }
            Err(error) if attempt >= attempts => return Err(error),
            Err(error) => {
                debug!(
                    page = request.cursor,
                    attempt,
                    max = attempts,
                    error = %error,
                    "Page attempt failed, retrying"
                );
                attempt += 1;
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::index::Image;

    struct Scripted {
        outcomes: Mutex<Vec<Result<String, FetchError>>>,
        calls: Mutex<u32>,
    }

    impl Scripted {
        fn new(mut outcomes: Vec<Result<String, FetchError>>) -> Self {
            outcomes.reverse();
            Self {
                outcomes: Mutex::new(outcomes),
                calls: Mutex::new(0),
            }
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl PageSource for Scripted {
        async fn fetch_page(&self, _request: &PageRequest) -> Result<String, FetchError> {
            *self.calls.lock().unwrap() += 1;
            self.outcomes
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Err(FetchError::transient("mock", "script exhausted")))
        }

        fn extract(&self, _body: &str, _query: &str) -> Result<Vec<Image>, FetchError> {
            Ok(Vec::new())
        }
    }

    fn request() -> PageRequest {
        PageRequest {
            query: "cats".to_string(),
            cursor: 1,
            page_size: None,
        }
    }

    #[tokio::test]
    async fn test_fetch_page_with_retry_recovers_from_transient() {
        let source = Scripted::new(vec![
            Err(FetchError::transient("u", "reset")),
            Err(FetchError::from_status("u", 503)),
            Ok("body".to_string()),
        ]);
        let body = fetch_page_with_retry(&source, &request(), 4, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(body, "body");
        assert_eq!(source.calls(), 3);
    }

    #[tokio::test]
    async fn test_fetch_page_with_retry_caps_attempts() {
        let source = Scripted::new(Vec::new());
        let err = fetch_page_with_retry(&source, &request(), 4, Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Transient { .. }));
        assert_eq!(source.calls(), 4);
    }

    #[tokio::test]
    async fn test_fetch_page_with_retry_returns_rate_limit_immediately() {
        let source = Scripted::new(vec![Err(FetchError::from_status("u", 429))]);
        let err = fetch_page_with_retry(&source, &request(), 4, Duration::ZERO)
            .await
            .unwrap_err();
        assert!(err.is_rate_limited());
        assert_eq!(source.calls(), 1);
    }

    #[test]
    fn test_build_http_client_succeeds() {
        assert!(
            build_http_client("danbooru", Duration::from_secs(5), Duration::from_secs(5)).is_ok()
        );
    }
}
