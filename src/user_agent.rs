//! Shared User-Agent string for processor and image HTTP clients.
//!
//! Single source so listing and image traffic identify the tool the same way.

/// Default User-Agent for all outgoing requests.
#[must_use]
pub(crate) fn default_user_agent() -> String {
    let version = env!("CARGO_PKG_VERSION");
    format!("harvester/{version} (image-index-tool)")
}
