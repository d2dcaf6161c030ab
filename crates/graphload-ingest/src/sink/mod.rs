//! Graph store sinks
//!
//! The coordinator only talks to the store through [`GraphSink`]. A sink
//! receives either a parameterless statement (pre/post scripts) or one
//! statement with a single list parameter holding a whole batch.

pub mod memory;
pub mod neo4j;

use async_trait::async_trait;
use thiserror::Error;

use crate::mapper::PropertyMap;

pub use memory::{RecordedCall, RecordingSink};
pub use neo4j::{Neo4jConfig, Neo4jHttpSink};

/// Store acknowledgement of one statement
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteAck {
    pub nodes_created: u64,
}

#[derive(Error, Debug)]
pub enum SinkError {
    /// The store refused the statement
    #[error("{code}: {message}")]
    Rejected { code: String, message: String },

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("unexpected store response: {0}")]
    Protocol(String),
}

impl From<reqwest::Error> for SinkError {
    fn from(err: reqwest::Error) -> Self {
        SinkError::Transport(err.to_string())
    }
}

/// Write side of a graph store.
///
/// `database = None` targets the store default. A successful `write_batch`
/// means every row of the batch was committed in one transaction.
#[async_trait]
pub trait GraphSink: Send + Sync {
    /// Run a statement without parameters
    async fn run_statement(
        &self,
        database: Option<&str>,
        statement: &str,
    ) -> Result<WriteAck, SinkError>;

    /// Run `statement` once with `rows` bound to the batch parameter
    async fn write_batch(
        &self,
        database: Option<&str>,
        statement: &str,
        rows: Vec<PropertyMap>,
    ) -> Result<WriteAck, SinkError>;

    /// Release connections; called once at the end of every run
    async fn close(&self) -> Result<(), SinkError> {
        Ok(())
    }

    /// Short name for logs
    fn name(&self) -> &str;
}
