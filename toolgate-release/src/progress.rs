//! Progress reporting contract for the cache pipeline.
//!
//! Progress is cosmetic: failures are logged and never abort the operation.

use tracing::debug;

/// Error reported by a progress sink.
#[derive(Debug, thiserror::Error)]
#[error("progress update failed: {0}")]
pub struct ProgressError(pub String);

/// Sink for pipeline milestones (fractions in `0.0..=1.0`).
pub trait Progress: Send + Sync {
    fn set_title(&self, title: &str);

    fn update(&self, fraction: f64) -> Result<(), ProgressError>;

    /// Called once the pipeline finished successfully.
    fn finish(&self) -> Result<(), ProgressError> {
        Ok(())
    }
}

/// Progress sink that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl Progress for NoProgress {
    fn set_title(&self, _title: &str) {}

    fn update(&self, _fraction: f64) -> Result<(), ProgressError> {
        Ok(())
    }
}

/// Report a milestone, swallowing any failure of the sink.
pub(crate) fn milestone(progress: &dyn Progress, fraction: f64, title: &str) {
    progress.set_title(title);
    if let Err(e) = progress.update(fraction) {
        debug!(error = %e, fraction, "failed to update progress");
    }
}

pub(crate) fn finish(progress: &dyn Progress) {
    if let Err(e) = progress.finish() {
        debug!(error = %e, "failed to finish progress");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Failing {
        titles: Mutex<Vec<String>>,
    }

    impl Progress for Failing {
        fn set_title(&self, title: &str) {
            self.titles.lock().unwrap().push(title.to_string());
        }

        fn update(&self, _fraction: f64) -> Result<(), ProgressError> {
            Err(ProgressError("terminal gone".into()))
        }

        fn finish(&self) -> Result<(), ProgressError> {
            Err(ProgressError("terminal gone".into()))
        }
    }

    #[test]
    fn failing_sink_does_not_propagate() {
        let sink = Failing {
            titles: Mutex::new(Vec::new()),
        };
        milestone(&sink, 0.5, "Downloading");
        finish(&sink);
        assert_eq!(sink.titles.lock().unwrap().as_slice(), ["Downloading"]);
    }
}
