//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::{Args as ClapArgs, Parser, Subcommand};

/// Retrieve and deduplicate images from pluggable remote sources.
///
/// Each (processor, query) pair keeps its own index; repeated runs only
/// report and write images that were not seen before.
#[derive(Parser, Debug)]
#[command(name = "harvester")]
#[command(author, version, about)]
pub struct Args {
    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Configuration file (defaults to the per-user config location)
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run one query against one processor
    Retrieve {
        /// Search query passed to the processor
        query: String,

        /// Processor id (see `harvester processors`)
        #[arg(short, long)]
        processor: String,

        #[command(flatten)]
        paging: PagingArgs,

        #[command(flatten)]
        output: OutputArgs,
    },

    /// Run one query against several processors
    Rule {
        /// Search query shared by every processor
        query: String,

        /// Processor ids, repeatable
        #[arg(short, long = "processor", required = true)]
        processors: Vec<String>,

        #[command(flatten)]
        paging: PagingArgs,

        #[command(flatten)]
        output: OutputArgs,
    },

    /// Run every rule in an exported rule bundle (JSON)
    Bundle {
        /// Bundle file
        file: PathBuf,

        #[command(flatten)]
        output: OutputArgs,
    },

    /// List registered processors
    Processors,

    /// Show the stored index for a processor and query
    Index {
        /// Search query the index was built for
        query: String,

        /// Processor id
        #[arg(short, long)]
        processor: String,

        /// Print every entry's source URL
        #[arg(long)]
        entries: bool,
    },
}

/// Pagination knobs forwarded as schema metadata.
#[derive(ClapArgs, Debug, Clone, Default)]
pub struct PagingArgs {
    /// Stop after this many pages
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
    pub max_pages: Option<u32>,

    /// First page cursor (processor default if omitted)
    #[arg(long)]
    pub start_page: Option<u32>,

    /// Items requested per page (1-1000)
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..=1000))]
    pub page_size: Option<u32>,
}

/// Where and how to write new images.
#[derive(ClapArgs, Debug, Clone, Default)]
pub struct OutputArgs {
    /// Write new images into this directory (list only if omitted)
    #[arg(short, long, value_name = "DIR")]
    pub output: Option<PathBuf>,

    /// Replace files that already exist
    #[arg(long)]
    pub overwrite: bool,

    /// Create the output directory if missing
    #[arg(long)]
    pub mkdirs: bool,
}
