//! The pagination/retry/backoff skeleton shared by every processor.
//!
//! One loop iteration handles one page:
//!
//! 1. stop if the cancel token was tripped (partial results, not an error);
//! 2. stop with a fatal outcome once the consecutive-failure threshold is hit;
//! 3. fetch the page (with a per-page attempt cap) and classify the outcome:
//!    - items: keep them, reset the failure counter, advance the cursor;
//!    - listed entries but none usable: skip the page and advance;
//!    - empty first page: the query matches nothing;
//!    - empty later page: end of results;
//!    - auth expired: re-authenticate once per page and retry it;
//!    - rate limited: cool down and retry the page; a second consecutive
//!      rate limit counts as a failure;
//!    - anything else: count a failure, then advance or retry per policy.
//!
//! Candidates are merged into the index only after the loop ends.

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tracing::{debug, info, instrument, warn};

use super::error::{FetchError, ProcessError};
use super::fetch::fetch_page_with_retry;
use super::{ProgressEvent, RetrievalContext};
use crate::index::{Image, Index};
use crate::schema::{MAX_PAGES_KEY, PAGE_SIZE_KEY, START_PAGE_KEY, Schema, ValidationError};

/// Consecutive failed pages before a retrieval is abandoned.
pub const DEFAULT_MAX_CONSECUTIVE_FAILURES: u32 = 10;

/// Attempts per page before it counts as one failure.
pub const DEFAULT_PAGE_ATTEMPTS: u32 = 4;

/// Cool-down after a rate-limit response.
const DEFAULT_RATE_LIMIT_COOLDOWN: Duration = Duration::from_secs(8);

/// Pause between attempts at the same page.
const DEFAULT_ATTEMPT_DELAY: Duration = Duration::from_secs(1);

/// Pause between successful pages.
const DEFAULT_PAGE_DELAY: Duration = Duration::from_millis(750);

/// Maximum jitter added to the page delay.
const DEFAULT_PAGE_JITTER: Duration = Duration::from_millis(250);

/// One page to fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    /// The query being retrieved.
    pub query: String,
    /// Page number or offset, depending on the source.
    pub cursor: u32,
    /// Requested items per page; `None` lets the source pick.
    pub page_size: Option<u32>,
}

/// A remote listing the pagination loop can walk.
#[async_trait]
pub trait PageSource: Send + Sync {
    /// Fetches the raw listing for one page.
    async fn fetch_page(&self, request: &PageRequest) -> Result<String, FetchError>;

    /// Extracts image candidates from a fetched listing.
    ///
    /// An unreadable listing is a transient failure; an empty one is not.
    fn extract(&self, body: &str, query: &str) -> Result<Vec<Image>, FetchError>;

    /// Counts the entries a listing names, usable or not.
    ///
    /// Only consulted when [`PageSource::extract`] finds no candidates. A
    /// non-zero count means the page was full of entries without a usable
    /// source or hash, so the loop moves past it instead of stopping.
    fn listed_entries(&self, _body: &str) -> usize {
        0
    }

    /// Refreshes credentials after an auth-expired response.
    ///
    /// Sources without credentials keep the default.
    async fn reauthenticate(&self) -> Result<(), FetchError> {
        Err(FetchError::ReauthUnsupported)
    }
}

/// Tuning for the pagination loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaginationPolicy {
    /// Consecutive failed pages before the run is abandoned.
    pub max_consecutive_failures: u32,
    /// Attempts per page before the page counts as failed.
    pub page_attempts: u32,
    /// Pause between attempts at the same page.
    pub attempt_delay: Duration,
    /// Fixed cool-down after a rate-limit response.
    pub rate_limit_cooldown: Duration,
    /// Pause between successful pages.
    pub page_delay: Duration,
    /// Upper bound of random jitter added to `page_delay`.
    pub page_jitter: Duration,
    /// Move past a failed page instead of retrying it.
    pub advance_on_failure: bool,
    /// First cursor value.
    pub start: u32,
    /// Cursor increment per page.
    pub step: u32,
}

impl Default for PaginationPolicy {
    fn default() -> Self {
        Self {
            max_consecutive_failures: DEFAULT_MAX_CONSECUTIVE_FAILURES,
            page_attempts: DEFAULT_PAGE_ATTEMPTS,
            attempt_delay: DEFAULT_ATTEMPT_DELAY,
            rate_limit_cooldown: DEFAULT_RATE_LIMIT_COOLDOWN,
            page_delay: DEFAULT_PAGE_DELAY,
            page_jitter: DEFAULT_PAGE_JITTER,
            advance_on_failure: false,
            start: 1,
            step: 1,
        }
    }
}

impl PaginationPolicy {
    /// Sets the cursor layout.
    #[must_use]
    pub fn with_cursor(mut self, start: u32, step: u32) -> Self {
        self.start = start;
        self.step = step.max(1);
        self
    }

    /// Sets whether a failed page is skipped.
    #[must_use]
    pub fn advance_on_failure(mut self, advance: bool) -> Self {
        self.advance_on_failure = advance;
        self
    }

    /// Removes every sleep from the loop.
    #[must_use]
    pub fn without_delays(mut self) -> Self {
        self.attempt_delay = Duration::ZERO;
        self.rate_limit_cooldown = Duration::ZERO;
        self.page_delay = Duration::ZERO;
        self.page_jitter = Duration::ZERO;
        self
    }

    fn between_pages_delay(&self) -> Duration {
        if self.page_delay.is_zero() {
            return Duration::ZERO;
        }
        let jitter_max = u64::try_from(self.page_jitter.as_millis()).unwrap_or(u64::MAX);
        let jitter = if jitter_max == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_max)
        };
        self.page_delay + Duration::from_millis(jitter)
    }
}

/// Why the pagination loop stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaginationEnd {
    /// A later page came back empty.
    Exhausted,
    /// The first page came back empty.
    InvalidQuery,
    /// The cancel token was tripped.
    Cancelled,
    /// The `max_pages` schema knob was reached.
    PageLimit,
    /// The consecutive-failure threshold was hit.
    Fatal {
        /// Failure counter when the loop stopped.
        consecutive_failures: u32,
        /// Description of the last failure.
        last_error: String,
    },
}

/// Everything the loop gathered.
#[derive(Debug, Clone)]
pub struct Pagination {
    /// Extracted candidates in page order, not yet merged.
    pub candidates: Vec<Image>,
    /// Why the loop stopped.
    pub end: PaginationEnd,
    /// Pages that yielded candidates.
    pub pages: u32,
}

struct LoopState {
    cursor: u32,
    pages: u32,
    failures: u32,
    rate_limit_streak: u32,
    reauthenticated: bool,
    listed_any: bool,
    last_error: String,
}

impl LoopState {
    fn advance(&mut self, step: u32) {
        self.cursor = self.cursor.saturating_add(step);
        self.reauthenticated = false;
        self.rate_limit_streak = 0;
    }

    fn fail(&mut self, ctx: &RetrievalContext, policy: &PaginationPolicy, error: &FetchError) {
        self.failures += 1;
        self.last_error = error.to_string();
        warn!(
            page = self.cursor,
            consecutive_failures = self.failures,
            error = %error,
            "Page failed"
        );
        ctx.report(ProgressEvent::PageFailed {
            page: self.cursor,
            consecutive_failures: self.failures,
            reason: self.last_error.clone(),
        });
        if policy.advance_on_failure {
            self.advance(policy.step.max(1));
        }
    }
}

async fn pause_between_pages(policy: &PaginationPolicy) {
    let pause = policy.between_pages_delay();
    if !pause.is_zero() {
        tokio::time::sleep(pause).await;
    }
}

/// Walks `source` page by page until the results end or the loop must stop.
#[instrument(skip_all, fields(query = schema.query()))]
pub async fn paginate<S>(
    source: &S,
    schema: &Schema,
    ctx: &RetrievalContext,
    policy: &PaginationPolicy,
) -> Pagination
where
    S: PageSource + ?Sized,
{
    let query = schema.query().to_string();
    let max_pages = schema.metadata_u32(MAX_PAGES_KEY);
    let page_size = schema.metadata_u32(PAGE_SIZE_KEY);
    let step = policy.step.max(1);

    let mut state = LoopState {
        cursor: schema.metadata_u32(START_PAGE_KEY).unwrap_or(policy.start),
        pages: 0,
        failures: 0,
        rate_limit_streak: 0,
        reauthenticated: false,
        listed_any: false,
        last_error: String::new(),
    };
    let mut candidates = Vec::new();

    let end = loop {
        if ctx.is_cancelled() {
            info!(pages = state.pages, "Retrieval cancelled");
            ctx.report(ProgressEvent::Cancelled { pages: state.pages });
            break PaginationEnd::Cancelled;
        }
        if state.failures >= policy.max_consecutive_failures {
            warn!(
                consecutive_failures = state.failures,
                last_error = %state.last_error,
                "Failure threshold reached, abandoning retrieval"
            );
            ctx.report(ProgressEvent::Fatal {
                consecutive_failures: state.failures,
            });
            break PaginationEnd::Fatal {
                consecutive_failures: state.failures,
                last_error: std::mem::take(&mut state.last_error),
            };
        }
        if let Some(limit) = max_pages
            && state.pages >= limit
        {
            debug!(limit, "Page limit reached");
            break PaginationEnd::PageLimit;
        }

        let request = PageRequest {
            query: query.clone(),
            cursor: state.cursor,
            page_size,
        };
        let outcome =
            fetch_page_with_retry(source, &request, policy.page_attempts, policy.attempt_delay)
                .await
                .and_then(|body| source.extract(&body, &query).map(|items| (items, body)));
        match outcome {
            Ok((items, body)) => {
                if items.is_empty() {
                    let listed = source.listed_entries(&body);
                    if listed > 0 {
                        debug!(page = state.cursor, listed, "No usable entries on page, skipping");
                        ctx.report(ProgressEvent::PageFetched {
                            page: state.cursor,
                            items: 0,
                        });
                        state.listed_any = true;
                        state.failures = 0;
                        state.advance(step);
                        pause_between_pages(policy).await;
                        continue;
                    }
                    if !state.listed_any {
                        warn!(query = %query, "First page is empty; query matches nothing");
                        ctx.report(ProgressEvent::InvalidQuery {
                            query: query.clone(),
                        });
                        break PaginationEnd::InvalidQuery;
                    }
                    debug!(page = state.cursor, "Empty page, end of results");
                    break PaginationEnd::Exhausted;
                }

                debug!(page = state.cursor, items = items.len(), "Page fetched");
                ctx.report(ProgressEvent::PageFetched {
                    page: state.cursor,
                    items: items.len(),
                });
                candidates.extend(items);
                state.pages += 1;
                state.listed_any = true;
                state.failures = 0;
                state.advance(step);
                pause_between_pages(policy).await;
            }
            Err(error @ FetchError::AuthExpired { .. }) => {
                if state.reauthenticated {
                    state.fail(ctx, policy, &error);
                    continue;
                }
                state.reauthenticated = true;
                match source.reauthenticate().await {
                    Ok(()) => {
                        info!(page = state.cursor, "Re-authenticated, retrying page");
                        ctx.report(ProgressEvent::Reauthenticated { page: state.cursor });
                    }
                    Err(FetchError::ReauthUnsupported) => state.fail(ctx, policy, &error),
                    Err(reauth_error) => state.fail(ctx, policy, &reauth_error),
                }
            }
            Err(error @ FetchError::RateLimited { .. }) => {
                state.rate_limit_streak += 1;
                info!(
                    page = state.cursor,
                    streak = state.rate_limit_streak,
                    cooldown_ms = u64::try_from(policy.rate_limit_cooldown.as_millis()).unwrap_or(u64::MAX),
                    "Rate limited, cooling down"
                );
                ctx.report(ProgressEvent::RateLimited {
                    page: state.cursor,
                    cooldown: policy.rate_limit_cooldown,
                });
                if !policy.rate_limit_cooldown.is_zero() {
                    tokio::time::sleep(policy.rate_limit_cooldown).await;
                }
                if state.rate_limit_streak >= 2 {
                    state.fail(ctx, policy, &error);
                }
            }
            Err(error) => {
                state.rate_limit_streak = 0;
                state.fail(ctx, policy, &error);
            }
        }
    };

    Pagination {
        candidates,
        end,
        pages: state.pages,
    }
}

/// Runs a full retrieval: validate, paginate, merge, report.
///
/// Returns only candidates new to `index`. Every candidate is stamped with
/// `processor_id` before merging.
///
/// # Errors
///
/// Returns [`ProcessError::Validation`] for a malformed or mismatched schema
/// and [`ProcessError::Fatal`] carrying the merged new images when the
/// failure threshold is hit.
#[instrument(skip_all, fields(processor = processor_id, query = schema.query()))]
pub async fn run_retrieval<S>(
    processor_id: &str,
    source: &S,
    index: &mut Index,
    schema: &Schema,
    ctx: &RetrievalContext,
    policy: &PaginationPolicy,
) -> Result<Vec<Image>, ProcessError>
where
    S: PageSource + ?Sized,
{
    schema.validate()?;
    if schema.processor_id() != processor_id {
        return Err(ValidationError::processor_mismatch(schema.processor_id(), processor_id).into());
    }

    let pagination = paginate(source, schema, ctx, policy).await;
    let candidates = pagination.candidates.into_iter().map(|mut image| {
        image.processor_id = processor_id.to_string();
        image
    });
    let fresh = index.merge(candidates);

    info!(
        pages = pagination.pages,
        new = fresh.len(),
        total = index.len(),
        "Retrieval finished"
    );
    ctx.report(ProgressEvent::Finished {
        new_images: fresh.len(),
        pages: pagination.pages,
    });

    match pagination.end {
        PaginationEnd::Fatal {
            consecutive_failures,
            last_error,
        } => Err(ProcessError::Fatal {
            processor: processor_id.to_string(),
            query: schema.query().to_string(),
            consecutive_failures,
            last_error,
            new_images: fresh,
        }),
        _ => Ok(fresh),
    }
}
