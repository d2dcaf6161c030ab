//! In-memory sink
//!
//! Records every call instead of writing anywhere. Backs `--dry-run` and the
//! pipeline tests.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

use super::{GraphSink, SinkError, WriteAck};
use crate::mapper::PropertyMap;

/// One statement received by a [`RecordingSink`]
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub database: Option<String>,
    pub statement: String,
    /// `None` for parameterless statements
    pub rows: Option<Vec<PropertyMap>>,
}

impl RecordedCall {
    pub fn is_batch(&self) -> bool {
        self.rows.is_some()
    }

    pub fn row_count(&self) -> usize {
        self.rows.as_ref().map_or(0, Vec::len)
    }
}

#[derive(Default)]
pub struct RecordingSink {
    calls: Mutex<Vec<RecordedCall>>,
    reject_marker: Option<String>,
    closed: AtomicBool,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// A sink that refuses every statement containing `marker`
    pub fn rejecting(marker: impl Into<String>) -> Self {
        Self {
            reject_marker: Some(marker.into()),
            ..Self::default()
        }
    }

    /// Every accepted call, in arrival order
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.lock().clone()
    }

    pub fn batch_calls(&self) -> Vec<RecordedCall> {
        self.lock().iter().filter(|c| c.is_batch()).cloned().collect()
    }

    /// Rows written across all batches
    pub fn rows_written(&self) -> usize {
        self.lock().iter().map(RecordedCall::row_count).sum()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn lock(&self) -> MutexGuard<'_, Vec<RecordedCall>> {
        self.calls.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn record(
        &self,
        database: Option<&str>,
        statement: &str,
        rows: Option<Vec<PropertyMap>>,
    ) -> Result<WriteAck, SinkError> {
        if let Some(marker) = &self.reject_marker {
            if statement.contains(marker.as_str()) {
                return Err(SinkError::Rejected {
                    code: "Recording.Rejected".to_string(),
                    message: format!("statement contains '{}'", marker),
                });
            }
        }

        let nodes_created = rows.as_ref().map_or(0, |r| r.len() as u64);
        debug!(?database, nodes_created, "Recorded statement");
        self.lock().push(RecordedCall {
            database: database.map(str::to_string),
            statement: statement.to_string(),
            rows,
        });
        Ok(WriteAck { nodes_created })
    }
}

#[async_trait]
impl GraphSink for RecordingSink {
    async fn run_statement(
        &self,
        database: Option<&str>,
        statement: &str,
    ) -> Result<WriteAck, SinkError> {
        self.record(database, statement, None)
    }

    async fn write_batch(
        &self,
        database: Option<&str>,
        statement: &str,
        rows: Vec<PropertyMap>,
    ) -> Result<WriteAck, SinkError> {
        self.record(database, statement, Some(rows))
    }

    async fn close(&self) -> Result<(), SinkError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn name(&self) -> &str {
        "recording"
    }
}
