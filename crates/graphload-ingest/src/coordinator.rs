//! Run coordinator
//!
//! Drives one run through `Init → PreScripts → Sourcing → PostScripts →
//! Done`, or into `Failed` from any stage. Within a source every chunk is
//! read on the blocking pool, then mapped and written, and only then is the
//! next chunk read. Sources run one at a time unless the plan raises
//! `parallelSources`; a fatal failure cancels the rest and skips the post
//! scripts.

use futures::stream::{self, StreamExt};
use graphload_common::{IngestError, Stage};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::chunk::{chunk, ChunkPolicy};
use crate::config::{IngestPlan, SourceSpec};
use crate::executor::{SourceRef, WriteExecutor};
use crate::progress::{ProgressReporter, StdoutProgress};
use crate::reader::{self, KeyOrder, RecordError};
use crate::sink::GraphSink;
use crate::source::{OpenError, RemoteFetcher, SourceResolver};

/// Stage of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Init,
    PreScripts,
    /// Working on the 1-based source
    Sourcing { source: usize },
    PostScripts,
    Done,
    Failed,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Done | RunState::Failed)
    }
}

/// How a source ended
#[derive(Debug)]
pub enum SourceStatus {
    Completed,
    /// Excluded by `skipFile`; never opened
    SkippedByFlag,
    Failed(IngestError),
    /// Not reached because the run stopped first
    NotStarted,
}

#[derive(Debug)]
pub struct SourceReport {
    pub index: usize,
    pub location: String,
    pub status: SourceStatus,
    pub rows_written: usize,
    /// Rows discarded by `skipLines`
    pub rows_skipped: usize,
    pub batches: usize,
    pub nodes_created: u64,
}

impl SourceReport {
    fn new(index: usize, location: &str) -> Self {
        Self {
            index,
            location: location.to_string(),
            status: SourceStatus::NotStarted,
            rows_written: 0,
            rows_skipped: 0,
            batches: 0,
            nodes_created: 0,
        }
    }

    pub fn error(&self) -> Option<&IngestError> {
        match &self.status {
            SourceStatus::Failed(e) => Some(e),
            _ => None,
        }
    }
}

/// Outcome of a whole run
#[derive(Debug)]
pub struct RunReport {
    pub run_id: Uuid,
    pub state: RunState,
    /// One entry per configured source, in plan order
    pub sources: Vec<SourceReport>,
    /// Failure outside any source (configuration, scripts, cancellation)
    pub error: Option<IngestError>,
}

impl RunReport {
    /// Done with no failed source
    pub fn is_success(&self) -> bool {
        self.state == RunState::Done && self.error.is_none() && self.failed_sources().next().is_none()
    }

    pub fn failed_sources(&self) -> impl Iterator<Item = &SourceReport> {
        self.sources.iter().filter(|s| s.error().is_some())
    }

    /// Run-level error, else the first source failure that was not a
    /// knock-on cancellation
    pub fn first_error(&self) -> Option<&IngestError> {
        let mut source_errors = self.sources.iter().filter_map(SourceReport::error);
        self.error.as_ref().or_else(|| {
            source_errors
                .clone()
                .find(|e| !matches!(e, IngestError::Cancelled { .. }))
                .or_else(|| source_errors.next())
        })
    }

    pub fn rows_written(&self) -> usize {
        self.sources.iter().map(|s| s.rows_written).sum()
    }

    pub fn batches(&self) -> usize {
        self.sources.iter().map(|s| s.batches).sum()
    }
}

/// Everything a run needs besides the plan
pub struct RunContext {
    pub run_id: Uuid,
    sink: Arc<dyn GraphSink>,
    progress: Arc<dyn ProgressReporter>,
    remote: Arc<RemoteFetcher>,
    cancel: CancellationToken,
}

impl RunContext {
    /// Context printing progress to stdout and reading object-store settings
    /// from the environment
    pub fn new(sink: Arc<dyn GraphSink>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            sink,
            progress: Arc::new(StdoutProgress),
            remote: Arc::new(RemoteFetcher::from_env()),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_remote(mut self, remote: Arc<RemoteFetcher>) -> Self {
        self.remote = remote;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Cancelling this token stops the run at the next chunk boundary
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

pub struct Coordinator {
    plan: Arc<IngestPlan>,
    context: RunContext,
    history: Mutex<Vec<RunState>>,
}

impl Coordinator {
    pub fn new(plan: Arc<IngestPlan>, context: RunContext) -> Self {
        Self {
            plan,
            context,
            history: Mutex::new(vec![RunState::Init]),
        }
    }

    /// Every state entered so far, in order
    pub fn history(&self) -> Vec<RunState> {
        self.lock_history().clone()
    }

    fn lock_history(&self) -> MutexGuard<'_, Vec<RunState>> {
        self.history.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn transition(&self, state: RunState) {
        debug!(?state, "Run state changed");
        self.lock_history().push(state);
    }

    /// Execute the plan once
    pub async fn run(&self) -> RunReport {
        let span = info_span!("run", run_id = %self.context.run_id);
        async {
            let report = self.execute().await;
            if let Err(e) = self.context.sink.close().await {
                warn!(sink = self.context.sink.name(), error = %e, "Closing sink failed");
            }
            report
        }
        .instrument(span)
        .await
    }

    async fn execute(&self) -> RunReport {
        let mut report = RunReport {
            run_id: self.context.run_id,
            state: RunState::Init,
            sources: Vec::new(),
            error: None,
        };

        if let Err(e) = self.plan.validate() {
            return self.fail(report, e);
        }

        info!(
            sources = self.plan.sources.len(),
            database = self.plan.database.as_deref().unwrap_or("<default>"),
            sink = self.context.sink.name(),
            "Starting ingestion run"
        );

        let executor = WriteExecutor::new(
            self.context.sink.clone(),
            self.context.progress.clone(),
            self.plan.database.clone(),
        );

        self.transition(RunState::PreScripts);
        if let Err(e) = executor
            .run_auxiliary(&self.plan.pre_ingest_scripts, Stage::PreScripts)
            .await
        {
            return self.fail(report, e);
        }

        let (sources, fatal) = self.run_sources(&executor).await;
        report.sources = sources;
        if fatal {
            report.state = RunState::Failed;
            self.transition(RunState::Failed);
            return report;
        }

        if self.context.cancel.is_cancelled() {
            let (index, location) = report
                .sources
                .iter()
                .find(|s| matches!(s.status, SourceStatus::NotStarted))
                .or(report.sources.last())
                .map(|s| (s.index, s.location.clone()))
                .unwrap_or_default();
            let e = IngestError::Cancelled {
                index,
                location,
                batches: report.batches(),
            };
            return self.fail(report, e);
        }

        self.transition(RunState::PostScripts);
        if let Err(e) = executor
            .run_auxiliary(&self.plan.post_ingest_scripts, Stage::PostScripts)
            .await
        {
            return self.fail(report, e);
        }

        self.transition(RunState::Done);
        report.state = RunState::Done;

        let failed = report.failed_sources().count();
        if failed > 0 {
            warn!(failed, "Run finished with failed sources");
        } else {
            info!(
                rows = report.rows_written(),
                batches = report.batches(),
                "Ingestion run completed"
            );
        }
        report
    }

    fn fail(&self, mut report: RunReport, e: IngestError) -> RunReport {
        error!(stage = %e.stage(), error = %e, "Run failed");
        self.transition(RunState::Failed);
        report.state = RunState::Failed;
        report.error = Some(e);
        report
    }

    /// Process every source; the flag is true when one failed fatally
    async fn run_sources(&self, executor: &WriteExecutor) -> (Vec<SourceReport>, bool) {
        let resolver = SourceResolver::new(self.plan.base_path.clone(), self.context.remote.clone());
        let cancel = self.context.cancel.child_token();

        let resolver = &resolver;
        let cancel_ref = &cancel;
        let mut outcomes = stream::iter(self.plan.sources.iter().enumerate())
            .map(move |(i, spec)| self.run_source(i + 1, spec, resolver, executor, cancel_ref))
            .buffer_unordered(self.plan.parallel_sources.max(1));

        let mut reports = Vec::with_capacity(self.plan.sources.len());
        let mut fatal = false;
        while let Some(report) = outcomes.next().await {
            if let Some(e) = report.error() {
                let absorbed = self.plan.continue_on_source_error && e.is_source_level();
                if absorbed {
                    warn!(source = report.index, error = %e, "Source failed, continuing");
                } else if !fatal {
                    error!(source = report.index, error = %e, "Source failed");
                    fatal = true;
                    cancel.cancel();
                }
            }
            reports.push(report);
        }

        reports.sort_by_key(|r| r.index);
        (reports, fatal)
    }

    async fn run_source(
        &self,
        index: usize,
        spec: &SourceSpec,
        resolver: &SourceResolver,
        executor: &WriteExecutor,
        cancel: &CancellationToken,
    ) -> SourceReport {
        let mut report = SourceReport::new(index, &spec.location);
        if cancel.is_cancelled() {
            return report;
        }

        self.transition(RunState::Sourcing { source: index });
        if spec.skip_file {
            info!(source = index, location = %spec.location, "Source excluded by skipFile");
            executor.progress().source_skipped(index, &spec.location);
            report.status = SourceStatus::SkippedByFlag;
            return report;
        }

        let span = info_span!("source", index, location = %spec.location);
        let outcome = ingest_source(&mut report, spec, resolver, executor, cancel)
            .instrument(span)
            .await;

        report.status = match outcome {
            Ok(()) => {
                info!(
                    source = index,
                    rows = report.rows_written,
                    skipped = report.rows_skipped,
                    batches = report.batches,
                    "Source completed"
                );
                executor
                    .progress()
                    .source_finished(index, &spec.location, report.rows_written);
                SourceStatus::Completed
            },
            Err(e) => SourceStatus::Failed(e),
        };
        report
    }
}

async fn ingest_source(
    report: &mut SourceReport,
    spec: &SourceSpec,
    resolver: &SourceResolver,
    executor: &WriteExecutor,
    cancel: &CancellationToken,
) -> Result<(), IngestError> {
    let source = SourceRef {
        index: report.index,
        location: spec.location.clone(),
    };

    let stream = resolver
        .open(spec)
        .await
        .map_err(|e| open_failure(&source, e))?;
    let records = reader::read(stream, spec.resolved_format(), spec.separator(), spec.header);
    let mut chunks = chunk(records, ChunkPolicy::from(spec));
    let mut key_order = KeyOrder::for_fields(&spec.fields);
    let statement = spec.statement().into_owned();

    loop {
        if cancel.is_cancelled() {
            return Err(IngestError::Cancelled {
                index: source.index,
                location: source.location.clone(),
                batches: report.batches,
            });
        }

        let (next, rest) = tokio::task::spawn_blocking(move || {
            let next = chunks.next();
            (next, chunks)
        })
        .await
        .map_err(|e| IngestError::SourceUnavailable {
            index: source.index,
            location: source.location.clone(),
            stage: Stage::Read,
            reason: format!("reader task failed: {}", e),
        })?;
        chunks = rest;
        report.rows_skipped = chunks.skipped();

        let batch = match next {
            None => break,
            Some(Ok(batch)) => batch,
            Some(Err(e)) => return Err(record_failure(&source, e)),
        };
        batch
            .records
            .iter()
            .try_for_each(|record| key_order.check(record))
            .map_err(|e| record_failure(&source, e))?;

        let ack = executor
            .write_batch(&source, &statement, &batch, &spec.fields)
            .await?;
        report.batches += 1;
        report.rows_written += batch.len();
        report.nodes_created += ack.nodes_created;
    }

    Ok(())
}

fn open_failure(source: &SourceRef, e: OpenError) -> IngestError {
    if e.is_configuration() {
        return IngestError::configuration(format!("source #{}: {}", source.index, e));
    }
    IngestError::SourceUnavailable {
        index: source.index,
        location: source.location.clone(),
        stage: Stage::Resolve,
        reason: e.to_string(),
    }
}

fn record_failure(source: &SourceRef, e: RecordError) -> IngestError {
    match e {
        RecordError::Malformed { ordinal, reason } => IngestError::RecordFormat {
            index: source.index,
            location: source.location.clone(),
            record: ordinal,
            stage: Stage::Read,
            reason,
        },
        RecordError::Io { source: io, .. } => IngestError::SourceUnavailable {
            index: source.index,
            location: source.location.clone(),
            stage: Stage::Read,
            reason: io.to_string(),
        },
    }
}
