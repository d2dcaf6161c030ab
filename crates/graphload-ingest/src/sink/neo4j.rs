//! Neo4j sink over the HTTP transactional API
//!
//! Every call is a single auto-committed transaction:
//! `POST {uri}/db/{database}/tx/commit` with one statement. Batches bind
//! their rows to the `rows` parameter, so a batch is one round trip and
//! commits atomically.

use async_trait::async_trait;
use graphload_common::{IngestError, Result};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;
use tracing::{debug, instrument};

use super::{GraphSink, SinkError, WriteAck};
use crate::config::{IngestPlan, BATCH_PARAMETER};
use crate::mapper::PropertyMap;

pub const DEFAULT_URI: &str = "http://localhost:7474";
pub const DEFAULT_USER: &str = "neo4j";
pub const DEFAULT_DATABASE: &str = "neo4j";

/// Per-request timeout; a large batch can take a while to commit
pub const DEFAULT_TIMEOUT_SECS: u64 = 600;

/// Connection settings for [`Neo4jHttpSink`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Neo4jConfig {
    pub uri: String,
    pub user: String,
    pub password: Option<String>,
    /// Used when the plan names no database
    pub default_database: String,
    pub timeout_secs: u64,
}

impl Default for Neo4jConfig {
    fn default() -> Self {
        Self {
            uri: DEFAULT_URI.to_string(),
            user: DEFAULT_USER.to_string(),
            password: None,
            default_database: DEFAULT_DATABASE.to_string(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }
}

impl Neo4jConfig {
    /// Settings from the plan, overridden by `GRAPHLOAD_*` environment variables
    pub fn from_plan(plan: &IngestPlan) -> Result<Self> {
        Self::with_lookup(plan, |key| std::env::var(key).ok())
    }

    fn with_lookup(plan: &IngestPlan, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let config = Self {
            uri: lookup("GRAPHLOAD_URI")
                .or_else(|| plan.server_uri.clone())
                .unwrap_or(defaults.uri),
            user: lookup("GRAPHLOAD_USER")
                .or_else(|| plan.admin_user.clone())
                .unwrap_or(defaults.user),
            password: lookup("GRAPHLOAD_PASSWORD").or_else(|| plan.admin_pass.clone()),
            default_database: lookup("GRAPHLOAD_DEFAULT_DATABASE")
                .unwrap_or(defaults.default_database),
            timeout_secs: lookup("GRAPHLOAD_TIMEOUT_SECS")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.timeout_secs),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let url = url::Url::parse(&self.uri).map_err(|e| {
            IngestError::configuration(format!("invalid server URI '{}': {}", self.uri, e))
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(IngestError::configuration(format!(
                "server URI '{}' must use http or https",
                self.uri
            )));
        }
        if self.default_database.trim().is_empty() {
            return Err(IngestError::configuration("default database cannot be empty"));
        }
        Ok(())
    }

    fn commit_url(&self, database: &str) -> String {
        format!("{}/db/{}/tx/commit", self.uri.trim_end_matches('/'), database)
    }
}

#[derive(Serialize)]
struct TxRequest<'a> {
    statements: [TxStatement<'a>; 1],
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TxStatement<'a> {
    statement: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    parameters: Option<Map<String, Value>>,
    include_stats: bool,
}

#[derive(Deserialize, Default)]
struct TxResponse {
    #[serde(default)]
    results: Vec<TxResult>,
    #[serde(default)]
    errors: Vec<TxError>,
}

#[derive(Deserialize)]
struct TxResult {
    #[serde(default)]
    stats: Option<TxStats>,
}

#[derive(Deserialize)]
struct TxStats {
    #[serde(default)]
    nodes_created: u64,
}

#[derive(Deserialize)]
struct TxError {
    code: String,
    message: String,
}

/// Sink writing to a Neo4j server
pub struct Neo4jHttpSink {
    client: Client,
    config: Neo4jConfig,
}

impl Neo4jHttpSink {
    pub fn new(config: Neo4jConfig) -> std::result::Result<Self, SinkError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self { client, config })
    }

    async fn commit(
        &self,
        database: Option<&str>,
        statement: &str,
        parameters: Option<Map<String, Value>>,
    ) -> std::result::Result<WriteAck, SinkError> {
        let database = database.unwrap_or(self.config.default_database.as_str());
        let body = TxRequest {
            statements: [TxStatement {
                statement,
                parameters,
                include_stats: true,
            }],
        };

        let mut request = self.client.post(self.config.commit_url(database)).json(&body);
        if let Some(password) = &self.config.password {
            request = request.basic_auth(&self.config.user, Some(password));
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            let parsed: TxResponse = serde_json::from_str(&text).unwrap_or_default();
            return Err(match parsed.errors.into_iter().next() {
                Some(error) => SinkError::Rejected {
                    code: error.code,
                    message: error.message,
                },
                None => status_error(status, &text),
            });
        }

        let parsed: TxResponse = serde_json::from_str(&text)
            .map_err(|e| SinkError::Protocol(format!("cannot decode response: {}", e)))?;

        if let Some(error) = parsed.errors.into_iter().next() {
            return Err(SinkError::Rejected {
                code: error.code,
                message: error.message,
            });
        }

        let nodes_created = parsed
            .results
            .iter()
            .filter_map(|r| r.stats.as_ref())
            .map(|s| s.nodes_created)
            .sum();
        debug!(database, nodes_created, "Statement committed");
        Ok(WriteAck { nodes_created })
    }
}

fn status_error(status: StatusCode, body: &str) -> SinkError {
    let snippet: String = body.chars().take(200).collect();
    SinkError::Rejected {
        code: format!("HTTP {}", status.as_u16()),
        message: if snippet.is_empty() {
            status.canonical_reason().unwrap_or("request failed").to_string()
        } else {
            snippet
        },
    }
}

#[async_trait]
impl GraphSink for Neo4jHttpSink {
    #[instrument(skip(self, statement))]
    async fn run_statement(
        &self,
        database: Option<&str>,
        statement: &str,
    ) -> std::result::Result<WriteAck, SinkError> {
        self.commit(database, statement, None).await
    }

    #[instrument(skip(self, statement, rows), fields(rows = rows.len()))]
    async fn write_batch(
        &self,
        database: Option<&str>,
        statement: &str,
        rows: Vec<PropertyMap>,
    ) -> std::result::Result<WriteAck, SinkError> {
        let mut parameters = Map::new();
        parameters.insert(
            BATCH_PARAMETER.to_string(),
            Value::Array(rows.into_iter().map(Value::Object).collect()),
        );
        self.commit(database, statement, Some(parameters)).await
    }

    fn name(&self) -> &str {
        "neo4j-http"
    }
}
