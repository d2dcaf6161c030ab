//! graphload common library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared error taxonomy and logging setup for the graphload workspace.
//!
//! - **Error Handling**: [`IngestError`] classifies every failure a run can
//!   surface and records the pipeline [`Stage`] it happened in
//! - **Logging**: [`logging::init_logging`] installs the tracing subscriber
//!
//! # Example
//!
//! ```no_run
//! use graphload_common::{IngestError, Result};
//!
//! fn check(chunk_size: usize) -> Result<()> {
//!     if chunk_size == 0 {
//!         return Err(IngestError::configuration("chunkSize must be positive"));
//!     }
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod logging;

pub use error::{IngestError, Result, Stage};
