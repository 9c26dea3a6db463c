//! Terminal progress bar for the fetch pipeline.

use std::sync::Mutex;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use tokio::task::JoinHandle;
use toolgate_release::{Progress, ProgressError};
use tracing::debug;

/// How long a completed bar stays visible.
pub const CLEAR_DELAY: Duration = Duration::from_millis(800);

/// Percent bar on stderr. After [`finish`](Progress::finish) the bar is
/// cleared by a tracked task; [`settle`](Self::settle) waits for it and
/// dropping the bar cancels it.
pub struct TerminalProgress {
    bar: ProgressBar,
    clear_delay: Duration,
    clear_task: Mutex<Option<JoinHandle<()>>>,
}

impl TerminalProgress {
    pub fn new() -> Self {
        let bar = ProgressBar::new(100);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} {msg:20} [{bar:30.cyan/blue}] {percent:>3}%")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );
        bar.enable_steady_tick(Duration::from_millis(100));
        Self::with_bar(bar)
    }

    /// A bar that draws nothing, for non-interactive runs.
    pub fn hidden() -> Self {
        Self::with_bar(ProgressBar::hidden())
    }

    fn with_bar(bar: ProgressBar) -> Self {
        Self {
            bar,
            clear_delay: CLEAR_DELAY,
            clear_task: Mutex::new(None),
        }
    }

    pub fn with_clear_delay(mut self, delay: Duration) -> Self {
        self.clear_delay = delay;
        self
    }

    /// Wait until a scheduled clear has run.
    pub async fn settle(&self) {
        let task = self.lock_task().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                debug!(error = %e, "progress clear task did not complete");
            }
        }
    }

    pub fn is_cleared(&self) -> bool {
        self.bar.is_finished()
    }

    fn lock_task(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.clear_task
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Default for TerminalProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl Progress for TerminalProgress {
    fn set_title(&self, title: &str) {
        self.bar.set_message(title.to_string());
    }

    fn update(&self, fraction: f64) -> Result<(), ProgressError> {
        if !fraction.is_finite() {
            return Err(ProgressError(format!("invalid progress fraction {}", fraction)));
        }
        self.bar.set_position((fraction.clamp(0.0, 1.0) * 100.0).round() as u64);
        Ok(())
    }

    fn finish(&self) -> Result<(), ProgressError> {
        self.bar.set_position(100);
        let bar = self.bar.clone();
        let delay = self.clear_delay;
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            bar.finish_and_clear();
            return Ok(());
        };
        let task = handle.spawn(async move {
            tokio::time::sleep(delay).await;
            bar.finish_and_clear();
        });
        if let Some(previous) = self.lock_task().replace(task) {
            previous.abort();
        }
        Ok(())
    }
}

impl Drop for TerminalProgress {
    fn drop(&mut self) {
        if let Some(task) = self.lock_task().take() {
            task.abort();
            self.bar.finish_and_clear();
        }
    }
}
