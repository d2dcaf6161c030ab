//! Error types for graphload runs

use std::fmt;

use thiserror::Error;

/// Result type alias for ingestion operations
pub type Result<T> = std::result::Result<T, IngestError>;

/// Pipeline stage in which a failure occurred
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Configuration,
    PreScripts,
    Resolve,
    Read,
    Map,
    Write,
    PostScripts,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Configuration => "configuration",
            Stage::PreScripts => "pre-scripts",
            Stage::Resolve => "resolve",
            Stage::Read => "read",
            Stage::Map => "map",
            Stage::Write => "write",
            Stage::PostScripts => "post-scripts",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Every failure a run can surface.
///
/// Source-level variants carry the 1-based source index and its configured
/// location so the report points at the offending entry of the plan.
#[derive(Error, Debug)]
pub enum IngestError {
    /// The plan is malformed or incomplete; nothing has been read or written.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A source could not be opened or its byte stream failed mid-read.
    #[error("Source #{index} ({location}) unavailable during {stage}: {reason}")]
    SourceUnavailable {
        index: usize,
        location: String,
        stage: Stage,
        reason: String,
    },

    /// A record could not be parsed or mapped onto its field specs.
    #[error("Bad record {record} in source #{index} ({location}) during {stage}: {reason}")]
    RecordFormat {
        index: usize,
        location: String,
        record: u64,
        stage: Stage,
        reason: String,
    },

    /// The store rejected a batch.
    #[error("Write of batch {batch} for source #{index} ({location}) failed: {reason}")]
    Write {
        index: usize,
        location: String,
        batch: usize,
        reason: String,
    },

    /// The store rejected a pre/post script statement.
    #[error("Statement {statement} failed during {stage}: {reason}")]
    Script {
        stage: Stage,
        statement: usize,
        reason: String,
    },

    /// The stop signal fired at a chunk boundary.
    #[error("Run cancelled during source #{index} ({location}) after {batches} batch(es)")]
    Cancelled {
        index: usize,
        location: String,
        batches: usize,
    },
}

impl IngestError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Stage of the pipeline the error was raised in
    pub fn stage(&self) -> Stage {
        match self {
            IngestError::Configuration(_) => Stage::Configuration,
            IngestError::SourceUnavailable { stage, .. } => *stage,
            IngestError::RecordFormat { stage, .. } => *stage,
            IngestError::Write { .. } => Stage::Write,
            IngestError::Script { stage, .. } => *stage,
            IngestError::Cancelled { .. } => Stage::Read,
        }
    }

    /// Index of the source the error belongs to, if any
    pub fn source_index(&self) -> Option<usize> {
        match self {
            IngestError::SourceUnavailable { index, .. }
            | IngestError::RecordFormat { index, .. }
            | IngestError::Write { index, .. }
            | IngestError::Cancelled { index, .. } => Some(*index),
            IngestError::Configuration(_) | IngestError::Script { .. } => None,
        }
    }

    /// Whether `continueOnSourceError` may absorb this failure.
    ///
    /// Configuration, script and cancellation failures always end the run.
    pub fn is_source_level(&self) -> bool {
        matches!(
            self,
            IngestError::SourceUnavailable { .. }
                | IngestError::RecordFormat { .. }
                | IngestError::Write { .. }
        )
    }
}
