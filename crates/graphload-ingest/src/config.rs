//! Ingestion plan (YAML) model and validation
//!
//! The plan is deserialised once at startup, validated before any I/O, and
//! shared read-only (`Arc<IngestPlan>`) for the rest of the run.
//!
//! Keys are camelCase. The snake_case keys of older loader configs (`files`,
//! `url`, `cql`, `skip_records`, ...) are accepted as aliases.

use graphload_common::{IngestError, Result};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashSet;
use std::path::Path;

use crate::source::Location;

/// Name of the list parameter every batch statement receives.
pub const BATCH_PARAMETER: &str = "rows";

/// Default CSV field separator.
pub const DEFAULT_FIELD_SEPARATOR: &str = ",";

fn default_field_separator() -> String {
    DEFAULT_FIELD_SEPARATOR.to_string()
}

fn default_parallel_sources() -> usize {
    1
}

/// The whole ingestion plan
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IngestPlan {
    /// Root for relative source locations (local path or remote prefix)
    #[serde(default, alias = "base_path")]
    pub base_path: Option<String>,

    /// Target database; `None` writes to the store default
    #[serde(default)]
    pub database: Option<String>,

    #[serde(default, alias = "pre_ingest")]
    pub pre_ingest_scripts: Vec<String>,

    #[serde(default, alias = "post_ingest")]
    pub post_ingest_scripts: Vec<String>,

    #[serde(default, alias = "files")]
    pub sources: Vec<SourceSpec>,

    /// Keep going after a source fails; the run still ends as failed
    #[serde(default, alias = "continue_on_source_error")]
    pub continue_on_source_error: bool,

    /// Upper bound on sources processed at the same time
    #[serde(default = "default_parallel_sources", alias = "parallel_sources")]
    pub parallel_sources: usize,

    #[serde(default, alias = "server_uri")]
    pub server_uri: Option<String>,

    #[serde(default, alias = "admin_user")]
    pub admin_user: Option<String>,

    #[serde(default, alias = "admin_pass")]
    pub admin_pass: Option<String>,
}

/// One configured origin of records
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SourceSpec {
    #[serde(default, alias = "url")]
    pub location: String,

    /// Inferred from the location suffix when absent
    #[serde(default, alias = "type")]
    pub format: Option<Format>,

    /// Inferred from the location suffix when absent
    #[serde(default)]
    pub compression: Option<Compression>,

    #[serde(default = "default_field_separator", alias = "field_separator")]
    pub field_separator: String,

    /// `None` makes the whole source a single chunk
    #[serde(default, alias = "chunk_size")]
    pub chunk_size: Option<usize>,

    #[serde(default, alias = "skip_records", alias = "skip_lines")]
    pub skip_lines: usize,

    #[serde(default, alias = "skip_file")]
    pub skip_file: bool,

    /// CSV only: the first record is a header and is never ingested
    #[serde(default)]
    pub header: bool,

    /// Zip only: name of the entry to read
    #[serde(default, alias = "archive_entry")]
    pub archive_entry: Option<String>,

    /// Node label used to generate a statement when `write_template` is absent
    #[serde(default)]
    pub label: Option<String>,

    #[serde(default)]
    pub fields: Vec<FieldSpec>,

    #[serde(default, alias = "cql")]
    pub write_template: Option<String>,
}

/// Maps one raw field onto one node property
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FieldSpec {
    pub position: usize,

    /// JSON object records only: take the value stored under this key
    /// instead of the one at `position`
    #[serde(default)]
    pub key: Option<String>,

    #[serde(alias = "property_name", alias = "name")]
    pub property_name: String,

    #[serde(default, rename = "type", alias = "explicitType")]
    pub explicit_type: Option<FieldType>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    Csv,
    #[serde(alias = "jsonl", alias = "ndjson")]
    Json,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    None,
    #[serde(alias = "gz")]
    Gzip,
    Zip,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    #[serde(alias = "int", alias = "long")]
    Integer,
    #[serde(alias = "double")]
    Float,
    #[serde(alias = "bool")]
    Boolean,
}

impl IngestPlan {
    /// Read, parse and validate a plan file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            IngestError::configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&content)
    }

    /// Parse and validate a plan from YAML text
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let plan: IngestPlan = serde_yaml::from_str(content)
            .map_err(|e| IngestError::configuration(format!("invalid plan document: {}", e)))?;
        plan.validate()?;
        Ok(plan)
    }

    /// Structural checks that must pass before any source is opened
    pub fn validate(&self) -> Result<()> {
        if self.parallel_sources == 0 {
            return Err(IngestError::configuration(
                "parallelSources must be greater than 0",
            ));
        }

        if let Some(db) = &self.database {
            if db.trim().is_empty() {
                return Err(IngestError::configuration("database cannot be empty"));
            }
        }

        for (i, statement) in self
            .pre_ingest_scripts
            .iter()
            .chain(&self.post_ingest_scripts)
            .enumerate()
        {
            if statement.trim().is_empty() {
                return Err(IngestError::configuration(format!(
                    "script statement {} is empty",
                    i + 1
                )));
            }
        }

        for (i, source) in self.sources.iter().enumerate() {
            source.validate(i + 1, self.base_path.as_deref())?;
        }

        Ok(())
    }
}

impl SourceSpec {
    fn validate(&self, index: usize, base_path: Option<&str>) -> Result<()> {
        let fail = |message: String| {
            Err(IngestError::configuration(format!("source #{}: {}", index, message)))
        };

        if self.location.trim().is_empty() {
            return fail("location is missing".to_string());
        }

        if let Err(e) = Location::resolve(&self.location, base_path) {
            return fail(e.to_string());
        }

        if self.fields.is_empty() {
            return fail("fields list is empty".to_string());
        }

        match (&self.write_template, &self.label) {
            (Some(template), _) if template.trim().is_empty() => {
                return fail("writeTemplate is empty".to_string());
            },
            (None, None) => return fail("needs a writeTemplate or a label".to_string()),
            (None, Some(label)) if !is_plain_identifier(label) => {
                return fail(format!("label '{}' is not a plain identifier", label));
            },
            _ => {},
        }

        if self.chunk_size == Some(0) {
            return fail("chunkSize must be greater than 0".to_string());
        }

        if self.field_separator.len() != 1 || !self.field_separator.is_ascii() {
            return fail(format!(
                "fieldSeparator must be a single ASCII character, got {:?}",
                self.field_separator
            ));
        }

        let mut seen = HashSet::new();
        for (j, field) in self.fields.iter().enumerate() {
            if field.property_name.trim().is_empty() {
                return fail(format!("field {} has an empty propertyName", j + 1));
            }
            if field.key.as_deref().is_some_and(|k| k.is_empty()) {
                return fail(format!("field {} has an empty key", j + 1));
            }
            if !seen.insert(field.property_name.as_str()) {
                return fail(format!(
                    "field {} repeats propertyName '{}'",
                    j + 1,
                    field.property_name
                ));
            }
        }

        Ok(())
    }

    /// Configured format, or the one implied by the location suffix
    pub fn resolved_format(&self) -> Format {
        self.format.unwrap_or_else(|| {
            let suffixes = suffixes(&self.location);
            if suffixes
                .iter()
                .any(|s| matches!(s.as_str(), "json" | "jsonl" | "ndjson"))
            {
                Format::Json
            } else {
                Format::Csv
            }
        })
    }

    /// Configured compression, or the one implied by the location suffix
    pub fn resolved_compression(&self) -> Compression {
        self.compression.unwrap_or_else(|| {
            match suffixes(&self.location).last().map(String::as_str) {
                Some("gz") | Some("gzip") => Compression::Gzip,
                Some("zip") => Compression::Zip,
                _ => Compression::None,
            }
        })
    }

    /// Separator byte; validation guarantees a single ASCII character
    pub fn separator(&self) -> u8 {
        self.field_separator.bytes().next().unwrap_or(b',')
    }

    /// The parameterised batch statement for this source
    pub fn statement(&self) -> Cow<'_, str> {
        match (&self.write_template, &self.label) {
            (Some(template), _) => Cow::Borrowed(template.as_str()),
            (None, Some(label)) => Cow::Owned(format!(
                "UNWIND ${} AS row CREATE (n:`{}`) SET n = row",
                BATCH_PARAMETER, label
            )),
            (None, None) => Cow::Borrowed(""),
        }
    }
}

/// Lowercased dot-suffixes of the last path segment ("a.csv.gz" -> ["csv", "gz"])
fn suffixes(location: &str) -> Vec<String> {
    let name = location
        .trim_end_matches('/')
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(location);
    let name = name.split(['?', '#']).next().unwrap_or(name);
    name.split('.')
        .skip(1)
        .map(|s| s.to_ascii_lowercase())
        .collect()
}

fn is_plain_identifier(value: &str) -> bool {
    let mut chars = value.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {},
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
