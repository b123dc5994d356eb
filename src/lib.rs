//! Harvester Core Library
//!
//! Retrieves image listings from pluggable remote sources and keeps a
//! deduplicated, persistent index per (processor, query) so that repeated
//! runs only surface images not seen before.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`schema`] - Queries bound to processors (`Schema`) and multi-processor `Rule`s
//! - [`index`] - Image identity, the deduplicating `Index`, and its on-disk store
//! - [`processor`] - The processor contract, paginated retrieval, built-ins, plugins, registry
//! - [`harvester`] - The orchestrator tying registry, index store and image writing together
//! - [`download`] - Streaming image writes used after retrieval
//! - [`config`] - TOML configuration

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod download;
pub mod harvester;
pub mod index;
pub mod processor;
pub mod schema;
mod user_agent;

// Re-export commonly used types
pub use config::{ConfigError, HarvesterConfig, ProcessorSettings, RetrievalSettings};
pub use download::{DownloadError, HttpImageFetcher, ImageFetcher};
pub use harvester::{HarvestError, Harvester, RuleOutcome, WriteFailure, WriteOptions, WriteReport};
pub use index::{ContentHash, Image, Index, IndexError, IndexStore};
pub use processor::{
    CancelToken, FetchError, PaginationPolicy, ProcessError, ProcessorOrigin, ProcessorRegistry,
    ProgressEvent, RegistryError, RetrievalContext, RetrievalProcessor,
};
pub use schema::{Metadata, Rule, RuleBundle, Schema, ValidationError};
