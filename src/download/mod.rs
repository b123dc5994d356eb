//! Image writing: the I/O utility the orchestrator uses to put accepted images on disk.
//!
//! # Example
//!
//! ```no_run
//! use harvester_core::download::{HttpImageFetcher, ImageFetcher};
//! use std::path::Path;
//! use url::Url;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let fetcher = HttpImageFetcher::new()?;
//! let source = Url::parse("https://example.com/abc.jpg")?;
//! let bytes = fetcher.fetch_to_file(&source, Path::new("./abc.jpg")).await?;
//! println!("wrote {bytes} bytes");
//! # Ok(())
//! # }
//! ```

mod client;
mod error;
mod filename;

pub use client::{CONNECT_TIMEOUT_SECS, HttpImageFetcher, ImageFetcher, READ_TIMEOUT_SECS};
pub use error::DownloadError;
pub use filename::{filename_from_url, sanitize_filename, sanitize_filename_component};
