//! CLI entry point for the harvester tool.

use std::io::{self, IsTerminal};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use harvester_core::schema::{MAX_PAGES_KEY, PAGE_SIZE_KEY, START_PAGE_KEY};
use harvester_core::{
    CancelToken, Harvester, HarvesterConfig, Image, Metadata, ProcessorOrigin,
    RetrievalContext, Rule, RuleBundle, Schema, WriteOptions,
};
use tracing::{debug, error, info, warn};

mod cli;
mod progress;

use cli::{Args, Command, OutputArgs, PagingArgs};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(filter)
        .init();

    debug!(?args, "CLI arguments parsed");

    let config = match &args.config {
        Some(path) => HarvesterConfig::load(path)?,
        None => HarvesterConfig::load_default()?,
    };
    let harvester = Harvester::from_config(&config)?;

    let cancel = CancelToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; finishing the current page and saving");
            interrupt.cancel();
        }
    });

    let runner = Runner {
        harvester,
        cancel,
        quiet: args.quiet,
        default_output: config.output_dir.clone(),
    };

    match args.command {
        Command::Retrieve {
            query,
            processor,
            paging,
            output,
        } => {
            let schema = Schema::with_metadata(query, processor, Arc::new(paging_metadata(&paging)));
            runner.retrieve(&schema, &output).await
        }
        Command::Rule {
            query,
            processors,
            paging,
            output,
        } => {
            let rule = Rule::new(query, processors).with_metadata(paging_metadata(&paging));
            runner.rules(&[rule], &output).await
        }
        Command::Bundle { file, output } => {
            let raw = std::fs::read_to_string(&file)
                .with_context(|| format!("cannot read rule bundle {}", file.display()))?;
            let bundle = RuleBundle::from_json(&raw)?;
            info!(rules = bundle.rules.len(), "Rule bundle loaded");
            runner.rules(&bundle.rules, &output).await
        }
        Command::Processors => {
            runner.list_processors();
            Ok(())
        }
        Command::Index {
            query,
            processor,
            entries,
        } => runner.show_index(&processor, &query, entries).await,
    }
}

fn paging_metadata(paging: &PagingArgs) -> Metadata {
    let mut metadata = Metadata::new();
    for (key, value) in [
        (MAX_PAGES_KEY, paging.max_pages),
        (START_PAGE_KEY, paging.start_page),
        (PAGE_SIZE_KEY, paging.page_size),
    ] {
        if let Some(value) = value {
            metadata.insert(key.to_string(), serde_json::Value::from(value));
        }
    }
    metadata
}

struct Runner {
    harvester: Harvester,
    cancel: CancelToken,
    quiet: bool,
    default_output: Option<PathBuf>,
}

impl Runner {
    /// Builds a context, plus the spinner task fed by it when one is shown.
    fn context(&self, label: String) -> (RetrievalContext, Option<tokio::task::JoinHandle<()>>) {
        let ctx = RetrievalContext::new().with_cancel_token(self.cancel.clone());
        let use_spinner = progress::should_use_spinner(
            io::stderr().is_terminal(),
            self.quiet,
            progress::is_dumb_terminal(),
        );
        match progress::spawn_progress_ui(use_spinner, label) {
            Some((sender, handle)) => (ctx.with_progress(sender), Some(handle)),
            None => (ctx, None),
        }
    }

    async fn finish_progress(ctx: RetrievalContext, handle: Option<tokio::task::JoinHandle<()>>) {
        drop(ctx);
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    async fn retrieve(&self, schema: &Schema, output: &OutputArgs) -> Result<()> {
        let (ctx, spinner) = self.context(schema.processor_id().to_string());
        let result = self.harvester.retrieve(schema, &ctx).await;
        Self::finish_progress(ctx, spinner).await;

        match result {
            Ok(images) => {
                emit(&images);
                self.report_interrupt();
                self.write(&images, output).await
            }
            Err(err) => {
                let partial = err.partial_images();
                if !partial.is_empty() {
                    emit(partial);
                    self.write(partial, output).await?;
                }
                Err(err.into())
            }
        }
    }

    async fn rules(&self, rules: &[Rule], output: &OutputArgs) -> Result<()> {
        let mut gathered: Vec<Image> = Vec::new();
        let mut attempted = 0_usize;
        let mut failed = 0_usize;

        for rule in rules {
            let (ctx, spinner) = self.context(rule.query().to_string());
            let outcomes = self.harvester.retrieve_rule(rule, &ctx).await;
            Self::finish_progress(ctx, spinner).await;

            for outcome in outcomes? {
                attempted += 1;
                match outcome.result {
                    Ok(images) => {
                        info!(
                            processor = outcome.schema.processor_id(),
                            query = outcome.schema.query(),
                            new = images.len(),
                            "Schema finished"
                        );
                        gathered.extend(images);
                    }
                    Err(err) => {
                        error!(
                            processor = outcome.schema.processor_id(),
                            query = outcome.schema.query(),
                            "{err}"
                        );
                        gathered.extend_from_slice(err.partial_images());
                        failed += 1;
                    }
                }
            }
            if self.cancel.is_cancelled() {
                break;
            }
        }

        emit(&gathered);
        self.report_interrupt();
        self.write(&gathered, output).await?;
        if failed > 0 {
            bail!("{failed} of {attempted} retrievals failed");
        }
        Ok(())
    }

    async fn write(&self, images: &[Image], output: &OutputArgs) -> Result<()> {
        let Some(destination) = output.output.clone().or_else(|| self.default_output.clone())
        else {
            return Ok(());
        };
        if images.is_empty() {
            debug!("No new images to write");
            return Ok(());
        }
        let options = WriteOptions {
            overwrite: output.overwrite,
            mkdirs: output.mkdirs,
        };
        let report = self
            .harvester
            .write_images_to_file(images, &destination, options)
            .await?;
        for failure in &report.failures {
            warn!(
                source = %failure.source,
                path = %failure.destination.display(),
                "{}",
                failure.error
            );
        }
        info!(
            written = report.written,
            skipped = report.skipped,
            failed = report.failures.len(),
            destination = %destination.display(),
            "Images written"
        );
        if !report.failures.is_empty() {
            bail!("{} of {} images could not be written", report.failures.len(), images.len());
        }
        Ok(())
    }

    fn report_interrupt(&self) {
        if self.cancel.is_cancelled() {
            info!("Interrupted; partial results were saved to the index");
        }
    }

    fn list_processors(&self) {
        let registry = self.harvester.registry();
        for id in registry.available().iter() {
            let Some(processor) = registry.resolve(id) else {
                continue;
            };
            let origin = match registry.origin(id) {
                Some(ProcessorOrigin::BuiltIn) => "built-in".to_string(),
                Some(ProcessorOrigin::External {
                    manifest: Some(path),
                }) => format!("plugin ({})", path.display()),
                Some(ProcessorOrigin::External { manifest: None }) | None => "plugin".to_string(),
            };
            println!("{id}\t{}\t{origin}", processor.informal_name());
        }
    }

    async fn show_index(&self, processor: &str, query: &str, entries: bool) -> Result<()> {
        let index = self
            .harvester
            .load_index(processor, query)
            .await?;
        let path = self.harvester.store().path_for(processor, query);
        println!("path = {}", path.display());
        println!("stored = {}", path.exists());
        println!("owner = {}", index.owner().unwrap_or("<untagged>"));
        println!("entries = {}", index.len());
        if entries {
            for image in index.entries() {
                println!("{}\t{}", image.hash, image.source);
            }
        }
        Ok(())
    }
}

fn emit(images: &[Image]) {
    for image in images {
        println!("{}", image.source);
    }
}
