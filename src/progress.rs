//! Progress bar fed by the crawler's snapshot channel.

use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use tilecrawler_core::{CrawlPhase, ProgressSnapshot};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Spawns the progress bar when enabled.
///
/// The task ends once every sender of `updates` is dropped.
pub(crate) fn spawn_progress_ui(
    enabled: bool,
    mut updates: watch::Receiver<ProgressSnapshot>,
) -> Option<JoinHandle<()>> {
    if !enabled {
        return None;
    }
    Some(tokio::spawn(async move {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::with_template(
                "{spinner} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        bar.enable_steady_tick(Duration::from_millis(120));

        while updates.changed().await.is_ok() {
            let snapshot = updates.borrow_and_update().clone();
            bar.set_length(snapshot.total);
            bar.set_position(snapshot.done.min(snapshot.total));
            bar.set_message(status_line(&snapshot));
            if matches!(snapshot.phase, CrawlPhase::Done | CrawlPhase::ShuttingDown) {
                break;
            }
        }
        bar.finish_and_clear();
    }))
}

fn status_line(snapshot: &ProgressSnapshot) -> String {
    let mut line = format!(
        "{} | {:.1}/s | fail {:.1}% | skip {:.1}% | delay {}ms",
        snapshot.phase,
        snapshot.speed,
        snapshot.fail_rate,
        snapshot.skip_rate,
        snapshot.delay.as_millis()
    );
    if snapshot.retry_pending > 0 || snapshot.permanent_failures > 0 {
        line.push_str(&format!(
            " | retry {} | failed {}",
            snapshot.retry_pending, snapshot.permanent_failures
        ));
    }
    if let Some(eta) = snapshot.eta() {
        line.push_str(&format!(" | eta {}s", eta.as_secs()));
    }
    line
}
