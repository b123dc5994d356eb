//! Progress UI (spinner) for retrieval runs.

use std::time::Duration;

use harvester_core::ProgressEvent;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

pub(crate) fn is_dumb_terminal() -> bool {
    std::env::var("TERM")
        .map(|value| value.eq_ignore_ascii_case("dumb"))
        .unwrap_or(false)
}

pub(crate) fn should_use_spinner(
    stderr_is_terminal: bool,
    quiet: bool,
    dumb_terminal: bool,
) -> bool {
    stderr_is_terminal && !quiet && !dumb_terminal
}

/// Spawns the spinner when requested.
///
/// The spinner stops once every clone of the returned sender is dropped, so
/// callers drop their `RetrievalContext` and then await the handle.
pub(crate) fn spawn_progress_ui(
    use_spinner: bool,
    label: String,
) -> Option<(UnboundedSender<ProgressEvent>, tokio::task::JoinHandle<()>)> {
    if !use_spinner {
        return None;
    }
    let (sender, receiver) = unbounded_channel();
    let handle = tokio::spawn(run_spinner(receiver, label));
    Some((sender, handle))
}

async fn run_spinner(mut events: UnboundedReceiver<ProgressEvent>, label: String) {
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::with_template("{spinner} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    spinner.enable_steady_tick(Duration::from_millis(100));
    spinner.set_message(format!("{label}: starting..."));

    let mut candidates = 0_usize;
    while let Some(event) = events.recv().await {
        if let ProgressEvent::PageFetched { items, .. } = &event {
            candidates += items;
        }
        spinner.set_message(format!("{label}: {}", describe(&event, candidates)));
    }

    spinner.finish_and_clear();
}

fn describe(event: &ProgressEvent, candidates: usize) -> String {
    match event {
        ProgressEvent::PageFetched { page, .. } => {
            format!("page {page} fetched ({candidates} candidates so far)")
        }
        ProgressEvent::RateLimited { page, cooldown } => {
            format!("rate limited on page {page}, cooling down {}s", cooldown.as_secs())
        }
        ProgressEvent::Reauthenticated { page } => format!("re-authenticated at page {page}"),
        ProgressEvent::PageFailed {
            page,
            consecutive_failures,
            ..
        } => format!("page {page} failed ({consecutive_failures} in a row)"),
        ProgressEvent::InvalidQuery { query } => format!("no results for '{query}'"),
        ProgressEvent::Cancelled { pages } => format!("cancelled after {pages} pages"),
        ProgressEvent::Fatal {
            consecutive_failures,
        } => format!("giving up after {consecutive_failures} failed pages"),
        ProgressEvent::Finished { new_images, pages } => {
            format!("{new_images} new images from {pages} pages")
        }
    }
}
