//! Progress reporting
//!
//! One record per committed batch. [`StdoutProgress`] prints it as a single
//! line on standard output, which external tooling greps for source
//! locations; diagnostics go through tracing on stderr instead.

use chrono::{DateTime, SecondsFormat, Utc};
use std::io::Write;
use std::sync::{Mutex, MutexGuard};

/// A committed batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchProgress {
    /// 1-based source index
    pub source: usize,
    pub location: String,
    /// 0-based batch index within the source
    pub batch: usize,
    pub rows: usize,
    pub at: DateTime<Utc>,
}

/// Observer of run progress
pub trait ProgressReporter: Send + Sync {
    fn batch_written(&self, progress: &BatchProgress);

    /// The source was excluded by `skipFile`
    fn source_skipped(&self, _source: usize, _location: &str) {}

    fn source_finished(&self, _source: usize, _location: &str, _rows: usize) {}
}

/// Prints `<location> <batch> <timestamp> rows=<n>` per batch
#[derive(Debug, Default)]
pub struct StdoutProgress;

impl StdoutProgress {
    pub fn format_line(progress: &BatchProgress) -> String {
        format!(
            "{} {} {} rows={}",
            progress.location,
            progress.batch,
            progress.at.to_rfc3339_opts(SecondsFormat::Millis, true),
            progress.rows
        )
    }
}

impl ProgressReporter for StdoutProgress {
    fn batch_written(&self, progress: &BatchProgress) {
        let mut out = std::io::stdout().lock();
        // a closed stdout must not fail the run
        let _ = writeln!(out, "{}", Self::format_line(progress));
        let _ = out.flush();
    }
}

/// Event kinds collected by [`MemoryProgress`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    Batch(BatchProgress),
    Skipped { source: usize, location: String },
    Finished { source: usize, location: String, rows: usize },
}

/// Keeps every event in memory
#[derive(Debug, Default)]
pub struct MemoryProgress {
    events: Mutex<Vec<ProgressEvent>>,
}

impl MemoryProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ProgressEvent> {
        self.lock().clone()
    }

    pub fn batches(&self) -> Vec<BatchProgress> {
        self.lock()
            .iter()
            .filter_map(|e| match e {
                ProgressEvent::Batch(b) => Some(b.clone()),
                _ => None,
            })
            .collect()
    }

    /// Progress lines as [`StdoutProgress`] would print them
    pub fn lines(&self) -> Vec<String> {
        self.batches().iter().map(StdoutProgress::format_line).collect()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<ProgressEvent>> {
        self.events.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl ProgressReporter for MemoryProgress {
    fn batch_written(&self, progress: &BatchProgress) {
        self.lock().push(ProgressEvent::Batch(progress.clone()));
    }

    fn source_skipped(&self, source: usize, location: &str) {
        self.lock().push(ProgressEvent::Skipped {
            source,
            location: location.to_string(),
        });
    }

    fn source_finished(&self, source: usize, location: &str, rows: usize) {
        self.lock().push(ProgressEvent::Finished {
            source,
            location: location.to_string(),
            rows,
        });
    }
}
