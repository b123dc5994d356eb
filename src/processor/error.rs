//! Error types for page fetches and processor runs.

use thiserror::Error;

use crate::index::Image;
use crate::schema::ValidationError;

/// Outcome classification of one failed page fetch.
///
/// These never leave the pagination loop; the loop decides whether to retry,
/// re-authenticate, cool down or count a failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    /// Network failure or unexpected status; may succeed on retry.
    #[error("transient failure fetching {url}: {reason}")]
    Transient {
        /// The listing URL (or plugin command) that failed.
        url: String,
        /// Human-readable cause.
        reason: String,
        /// HTTP status, when one was received.
        status: Option<u16>,
    },

    /// The remote rejected our credentials (401/400-class).
    #[error("authentication expired for {url} (HTTP {status})")]
    AuthExpired {
        /// The listing URL.
        url: String,
        /// HTTP status received.
        status: u16,
    },

    /// The remote is throttling us (403/429-class).
    #[error("rate limited by {url} (HTTP {status})")]
    RateLimited {
        /// The listing URL.
        url: String,
        /// HTTP status received.
        status: u16,
    },

    /// The source has no way to refresh credentials.
    #[error("source does not support re-authentication")]
    ReauthUnsupported,

    /// Re-authentication was attempted and failed.
    #[error("re-authentication failed: {reason}")]
    AuthFailed {
        /// Human-readable cause.
        reason: String,
    },
}

impl FetchError {
    /// Creates a transient error without a status code.
    pub fn transient(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Transient {
            url: url.into(),
            reason: reason.into(),
            status: None,
        }
    }

    /// Classifies a non-success HTTP status.
    ///
    /// | Status | Outcome |
    /// |--------|---------|
    /// | 400, 401 | `AuthExpired` |
    /// | 403, 429 | `RateLimited` |
    /// | other | `Transient` |
    #[allow(clippy::match_same_arms)]
    pub fn from_status(url: impl Into<String>, status: u16) -> Self {
        let url = url.into();
        match status {
            400 | 401 => Self::AuthExpired { url, status },
            403 | 429 => Self::RateLimited { url, status },
            _ => Self::Transient {
                url,
                reason: format!("unexpected HTTP status {status}"),
                status: Some(status),
            },
        }
    }

    /// Returns true for the rate-limit class.
    #[must_use]
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    /// Returns true for the auth-expired class.
    #[must_use]
    pub fn is_auth_expired(&self) -> bool {
        matches!(self, Self::AuthExpired { .. })
    }
}

/// Errors surfaced by a processor run.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The schema handed to the processor is malformed.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Too many consecutive pages failed; carries what was gathered before.
    #[error(
        "retrieval for '{query}' on {processor} abandoned after {consecutive_failures} consecutive failed pages\n  Last error: {last_error}\n  Suggestion: Check network access and the processor's base URL, then re-run; {} new image(s) were kept",
        new_images.len()
    )]
    Fatal {
        /// Processor id.
        processor: String,
        /// Query being retrieved.
        query: String,
        /// Failure counter when the loop stopped.
        consecutive_failures: u32,
        /// Description of the last page failure.
        last_error: String,
        /// Newly-discovered images merged before the abort.
        new_images: Vec<Image>,
    },

    /// The processor could not be set up (HTTP client, credentials).
    #[error("processor {processor} could not start: {reason}")]
    Setup {
        /// Processor id.
        processor: String,
        /// Human-readable cause.
        reason: String,
    },

    /// An external plugin misbehaved (spawn failure, bad output).
    #[error("plugin processor {processor} failed: {reason}")]
    Plugin {
        /// Processor id.
        processor: String,
        /// Human-readable cause.
        reason: String,
    },
}

impl ProcessError {
    /// Creates a setup error.
    pub fn setup(processor: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Setup {
            processor: processor.into(),
            reason: reason.into(),
        }
    }

    /// Creates a plugin error.
    pub fn plugin(processor: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Plugin {
            processor: processor.into(),
            reason: reason.into(),
        }
    }

    /// Returns partial results attached to a fatal error, if any.
    #[must_use]
    pub fn partial_images(&self) -> &[Image] {
        match self {
            Self::Fatal { new_images, .. } => new_images,
            _ => &[],
        }
    }

    /// Consumes the error and returns partial results attached to it.
    #[must_use]
    pub fn into_partial_images(self) -> Vec<Image> {
        match self {
            Self::Fatal { new_images, .. } => new_images,
            _ => Vec::new(),
        }
    }

    /// Returns true when the failure-threshold abort fired.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal { .. })
    }
}
