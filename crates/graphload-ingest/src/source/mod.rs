//! Source resolution
//!
//! Locates each configured source (local path, `file://`, `s3://`,
//! `http(s)://`), opens it and undoes its compression, handing back one
//! blocking byte stream per source. The stream is consumed lazily by the
//! record reader; nothing is buffered whole.

pub mod decompression;
pub mod remote;

use std::fmt;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, instrument};
use url::Url;

use crate::config::SourceSpec;
use decompression::{EntrySelector, RawSource};
pub use remote::{ObjectStoreConfig, RemoteFetcher};

/// Decompressed bytes of one source
pub type ByteStream = Box<dyn Read + Send>;

/// Failure to open a source
#[derive(Error, Debug)]
pub enum OpenError {
    #[error("source not found: {0}")]
    NotFound(String),

    #[error("I/O error on {location}: {source}")]
    Io {
        location: String,
        #[source]
        source: io::Error,
    },

    #[error("fetching {location} failed: {reason}")]
    Remote { location: String, reason: String },

    #[error("{location} is unreadable: {reason}")]
    Corrupt { location: String, reason: String },

    #[error("invalid location '{location}': {reason}")]
    InvalidLocation { location: String, reason: String },

    #[error("cannot choose a zip entry in {location}: {reason}")]
    EntrySelection { location: String, reason: String },
}

impl OpenError {
    pub(crate) fn io(location: &str, source: io::Error) -> Self {
        OpenError::Io {
            location: location.to_string(),
            source,
        }
    }

    /// True when the plan itself is at fault rather than the data or network
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            OpenError::InvalidLocation { .. } | OpenError::EntrySelection { .. }
        )
    }
}

/// Where a source lives once resolved against `basePath`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    Local(PathBuf),
    S3 { bucket: String, key: String },
    Http(Url),
}

impl Location {
    /// Resolve a configured location, joining relative ones onto `base`
    pub fn resolve(raw: &str, base: Option<&str>) -> Result<Self, OpenError> {
        let raw = raw.trim();
        if has_scheme(raw) {
            return Self::parse_absolute(raw);
        }

        let relative = Path::new(raw);
        if relative.is_absolute() {
            return Ok(Location::Local(relative.to_path_buf()));
        }

        match base.map(str::trim).filter(|b| !b.is_empty()) {
            None => Ok(Location::Local(relative.to_path_buf())),
            Some(base) if has_scheme(base) => match Self::parse_absolute(base)? {
                Location::Local(dir) => Ok(Location::Local(dir.join(relative))),
                Location::S3 { bucket, key } => {
                    let prefix = key.trim_end_matches('/');
                    let key = if prefix.is_empty() {
                        raw.to_string()
                    } else {
                        format!("{}/{}", prefix, raw)
                    };
                    Ok(Location::S3 { bucket, key })
                },
                Location::Http(mut url) => {
                    if !url.path().ends_with('/') {
                        let path = format!("{}/", url.path());
                        url.set_path(&path);
                    }
                    url.join(raw)
                        .map(Location::Http)
                        .map_err(|e| invalid(raw, e.to_string()))
                },
            },
            Some(base) => Ok(Location::Local(Path::new(base).join(relative))),
        }
    }

    fn parse_absolute(raw: &str) -> Result<Self, OpenError> {
        if let Some(rest) = raw.strip_prefix("s3://") {
            let (bucket, key) = rest
                .split_once('/')
                .ok_or_else(|| invalid(raw, "expected s3://bucket/key"))?;
            if bucket.is_empty() {
                return Err(invalid(raw, "bucket name is empty"));
            }
            return Ok(Location::S3 {
                bucket: bucket.to_string(),
                key: key.to_string(),
            });
        }

        let url = Url::parse(raw).map_err(|e| invalid(raw, e.to_string()))?;
        match url.scheme() {
            "http" | "https" => Ok(Location::Http(url)),
            "file" => url
                .to_file_path()
                .map(Location::Local)
                .map_err(|_| invalid(raw, "not a usable file URL")),
            other => Err(invalid(raw, format!("unsupported scheme '{}'", other))),
        }
    }

    /// Last path segment, used to pick a zip entry by logical name
    pub fn file_name(&self) -> Option<String> {
        let name = match self {
            Location::Local(path) => path.file_name()?.to_string_lossy().to_string(),
            Location::S3 { key, .. } => key.rsplit('/').next()?.to_string(),
            Location::Http(url) => url.path_segments()?.next_back()?.to_string(),
        };
        (!name.is_empty()).then_some(name)
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Local(path) => write!(f, "{}", path.display()),
            Location::S3 { bucket, key } => write!(f, "s3://{}/{}", bucket, key),
            Location::Http(url) => write!(f, "{}", url),
        }
    }
}

fn has_scheme(raw: &str) -> bool {
    match raw.split_once("://") {
        // a single letter is a Windows drive, not a scheme
        Some((scheme, _)) => {
            scheme.len() > 1 && scheme.chars().all(|c| c.is_ascii_alphanumeric() || c == '+')
        },
        None => false,
    }
}

fn invalid(location: &str, reason: impl Into<String>) -> OpenError {
    OpenError::InvalidLocation {
        location: location.to_string(),
        reason: reason.into(),
    }
}

/// Opens sources for one plan
pub struct SourceResolver {
    base_path: Option<String>,
    remote: Arc<RemoteFetcher>,
}

impl SourceResolver {
    pub fn new(base_path: Option<String>, remote: Arc<RemoteFetcher>) -> Self {
        Self { base_path, remote }
    }

    pub fn locate(&self, spec: &SourceSpec) -> Result<Location, OpenError> {
        Location::resolve(&spec.location, self.base_path.as_deref())
    }

    /// Open `spec` as a single decompressed byte stream
    #[instrument(skip(self, spec), fields(location = %spec.location))]
    pub async fn open(&self, spec: &SourceSpec) -> Result<ByteStream, OpenError> {
        let location = self.locate(spec)?;
        let resolved = location.to_string();
        let compression = spec.resolved_compression();
        debug!(%resolved, ?compression, "Opening source");

        let raw = match &location {
            Location::Local(path) => RawSource::Path(path.clone()),
            Location::S3 { bucket, key } => RawSource::Reader(self.remote.open_s3(bucket, key).await?),
            Location::Http(url) => RawSource::Reader(self.remote.open_http(url).await?),
        };

        let selector = EntrySelector {
            configured: spec.archive_entry.clone(),
            logical_name: location
                .file_name()
                .and_then(|name| name.strip_suffix(".zip").map(str::to_string)),
        };

        tokio::task::spawn_blocking(move || {
            decompression::decode(raw, compression, &selector, &resolved)
        })
        .await
        .map_err(|e| OpenError::Io {
            location: spec.location.clone(),
            source: io::Error::new(io::ErrorKind::Other, e),
        })?
    }
}
