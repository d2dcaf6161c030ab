//! graphload ingest library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Declarative bulk loading of delimited and JSON files into a property
//! graph. A YAML plan names the sources; each source is opened, decompressed,
//! parsed, chunked, mapped onto node properties and written one batch per
//! round trip.
//!
//! # Pipeline
//!
//! - **Config**: [`config::IngestPlan`] parsed from YAML and validated before any I/O
//! - **Source resolver**: local files, `s3://` objects and `http(s)://` URLs,
//!   with gzip or zip compression ([`source`])
//! - **Record reader**: lazy CSV and JSON readers ([`reader`])
//! - **Chunk pipeline**: `skipFile`, `skipLines`, `chunkSize` ([`chunk`])
//! - **Field mapper**: exact text by default, explicit types on request ([`mapper`])
//! - **Write executor**: scripts and batches through a [`sink::GraphSink`] ([`executor`])
//! - **Run coordinator**: the run state machine ([`coordinator`])
//!
//! # Example
//!
//! ```no_run
//! use graphload_ingest::{Coordinator, IngestPlan, RunContext};
//! use graphload_ingest::sink::RecordingSink;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let plan = IngestPlan::load("plan.yaml")?;
//!     let sink = Arc::new(RecordingSink::new());
//!     let report = Coordinator::new(Arc::new(plan), RunContext::new(sink)).run().await;
//!     println!("{} rows in {} batches", report.rows_written(), report.batches());
//!     Ok(())
//! }
//! ```

pub mod chunk;
pub mod config;
pub mod coordinator;
pub mod executor;
pub mod mapper;
pub mod progress;
pub mod reader;
pub mod sink;
pub mod source;

pub use config::{FieldSpec, FieldType, IngestPlan, SourceSpec};
pub use coordinator::{Coordinator, RunContext, RunReport, RunState, SourceReport, SourceStatus};
pub use graphload_common::{IngestError, Result, Stage};
