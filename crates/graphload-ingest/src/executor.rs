//! Write executor
//!
//! Runs pre/post scripts and writes batches through the configured sink,
//! always against the plan's database (or the store default when unset).

use chrono::Utc;
use graphload_common::{IngestError, Stage};
use std::sync::Arc;
use tracing::{debug, info, instrument};

use crate::chunk::Batch;
use crate::config::FieldSpec;
use crate::mapper::{map_record, PropertyMap};
use crate::progress::{BatchProgress, ProgressReporter};
use crate::sink::{GraphSink, WriteAck};

/// Identifies the source a batch belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRef {
    /// 1-based position in the plan
    pub index: usize,
    /// Location as configured
    pub location: String,
}

pub struct WriteExecutor {
    sink: Arc<dyn GraphSink>,
    progress: Arc<dyn ProgressReporter>,
    database: Option<String>,
}

impl WriteExecutor {
    pub fn new(
        sink: Arc<dyn GraphSink>,
        progress: Arc<dyn ProgressReporter>,
        database: Option<String>,
    ) -> Self {
        Self {
            sink,
            progress,
            database,
        }
    }

    pub fn database(&self) -> Option<&str> {
        self.database.as_deref()
    }

    pub fn progress(&self) -> &dyn ProgressReporter {
        self.progress.as_ref()
    }

    /// Run each statement once, in order, without parameters
    #[instrument(skip(self, scripts), fields(count = scripts.len()))]
    pub async fn run_auxiliary(&self, scripts: &[String], stage: Stage) -> Result<(), IngestError> {
        for (i, statement) in scripts.iter().enumerate() {
            debug!(statement = i + 1, "Running script statement");
            self.sink
                .run_statement(self.database(), statement)
                .await
                .map_err(|e| IngestError::Script {
                    stage,
                    statement: i + 1,
                    reason: e.to_string(),
                })?;
        }
        if !scripts.is_empty() {
            info!(%stage, count = scripts.len(), "Scripts completed");
        }
        Ok(())
    }

    /// Map `batch`, write it in one call and report it
    pub async fn write_batch(
        &self,
        source: &SourceRef,
        statement: &str,
        batch: &Batch,
        fields: &[FieldSpec],
    ) -> Result<WriteAck, IngestError> {
        let rows = batch
            .records
            .iter()
            .map(|record| {
                map_record(record, fields).map_err(|e| IngestError::RecordFormat {
                    index: source.index,
                    location: source.location.clone(),
                    record: record.ordinal,
                    stage: Stage::Map,
                    reason: e.to_string(),
                })
            })
            .collect::<Result<Vec<PropertyMap>, _>>()?;
        let count = rows.len();

        let ack = self
            .sink
            .write_batch(self.database(), statement, rows)
            .await
            .map_err(|e| IngestError::Write {
                index: source.index,
                location: source.location.clone(),
                batch: batch.index,
                reason: e.to_string(),
            })?;

        debug!(
            source = source.index,
            batch = batch.index,
            rows = count,
            nodes_created = ack.nodes_created,
            "Batch committed"
        );
        self.progress.batch_written(&BatchProgress {
            source: source.index,
            location: source.location.clone(),
            batch: batch.index,
            rows: count,
            at: Utc::now(),
        });
        Ok(ack)
    }
}
