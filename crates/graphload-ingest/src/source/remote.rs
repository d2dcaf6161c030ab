//! Remote object access (S3-compatible stores and plain HTTP)
//!
//! Bodies are never collected: the async body stream is bridged into a
//! blocking `Read` with `SyncIoBridge`, so the record reader pulls bytes from
//! the network only as fast as it parses them. The bridge must be read from
//! the blocking pool, never from an async task.

use aws_config::BehaviorVersion;
use aws_credential_types::Credentials;
use aws_sdk_s3::{config::Region, Client};
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use std::env;
use std::io;
use tokio::sync::OnceCell;
use tokio_util::io::{StreamReader, SyncIoBridge};
use tracing::{debug, info, instrument};
use url::Url;

use super::{ByteStream, OpenError};

/// Default region when none is configured
pub const DEFAULT_S3_REGION: &str = "us-east-1";

/// S3 client settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ObjectStoreConfig {
    /// Custom endpoint (MinIO, LocalStack); `None` means AWS
    pub endpoint: Option<String>,
    pub region: String,
    /// Static credentials; when absent the default AWS provider chain is used
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub path_style: bool,
}

impl Default for ObjectStoreConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            region: DEFAULT_S3_REGION.to_string(),
            access_key: None,
            secret_key: None,
            path_style: false,
        }
    }
}

impl ObjectStoreConfig {
    /// Read `S3_ENDPOINT`, `S3_REGION`, `S3_ACCESS_KEY`/`AWS_ACCESS_KEY_ID`,
    /// `S3_SECRET_KEY`/`AWS_SECRET_ACCESS_KEY` and `S3_PATH_STYLE`
    pub fn from_env() -> Self {
        Self {
            endpoint: env::var("S3_ENDPOINT").ok(),
            region: env::var("S3_REGION")
                .or_else(|_| env::var("AWS_REGION"))
                .unwrap_or_else(|_| DEFAULT_S3_REGION.to_string()),
            access_key: env::var("S3_ACCESS_KEY")
                .or_else(|_| env::var("AWS_ACCESS_KEY_ID"))
                .ok(),
            secret_key: env::var("S3_SECRET_KEY")
                .or_else(|_| env::var("AWS_SECRET_ACCESS_KEY"))
                .ok(),
            path_style: env::var("S3_PATH_STYLE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(false),
        }
    }
}

/// Opens remote objects as blocking readers.
///
/// The S3 client is built on first use so plans without S3 sources never
/// touch AWS configuration.
pub struct RemoteFetcher {
    config: ObjectStoreConfig,
    s3: OnceCell<Client>,
    http: reqwest::Client,
}

impl RemoteFetcher {
    pub fn new(config: ObjectStoreConfig) -> Self {
        Self {
            config,
            s3: OnceCell::new(),
            http: reqwest::Client::new(),
        }
    }

    pub fn from_env() -> Self {
        Self::new(ObjectStoreConfig::from_env())
    }

    async fn s3_client(&self) -> &Client {
        self.s3
            .get_or_init(|| async {
                let mut loader = aws_config::defaults(BehaviorVersion::latest())
                    .region(Region::new(self.config.region.clone()));

                if let (Some(access_key), Some(secret_key)) =
                    (&self.config.access_key, &self.config.secret_key)
                {
                    loader = loader.credentials_provider(Credentials::new(
                        access_key,
                        secret_key,
                        None,
                        None,
                        "graphload",
                    ));
                }

                let shared = loader.load().await;
                let mut builder =
                    aws_sdk_s3::config::Builder::from(&shared).force_path_style(self.config.path_style);
                if let Some(endpoint) = &self.config.endpoint {
                    builder = builder.endpoint_url(endpoint);
                }

                info!(
                    region = %self.config.region,
                    endpoint = ?self.config.endpoint,
                    "S3 client initialized"
                );
                Client::from_conf(builder.build())
            })
            .await
    }

    /// Stream `s3://bucket/key`
    #[instrument(skip(self))]
    pub async fn open_s3(&self, bucket: &str, key: &str) -> Result<ByteStream, OpenError> {
        let location = format!("s3://{}/{}", bucket, key);
        debug!("Getting stream from {}", location);

        let response = self
            .s3_client()
            .await
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                let missing = e
                    .as_service_error()
                    .map(|service| service.is_no_such_key())
                    .unwrap_or(false);
                if missing {
                    OpenError::NotFound(location.clone())
                } else {
                    OpenError::Remote {
                        location: location.clone(),
                        reason: aws_sdk_s3::error::DisplayErrorContext(&e).to_string(),
                    }
                }
            })?;

        let reader = Box::pin(response.body.into_async_read());
        Ok(Box::new(SyncIoBridge::new(reader)))
    }

    /// Stream an http(s) URL
    #[instrument(skip(self), fields(url = %url))]
    pub async fn open_http(&self, url: &Url) -> Result<ByteStream, OpenError> {
        let location = url.to_string();
        let response = self
            .http
            .get(url.clone())
            .send()
            .await
            .map_err(|e| OpenError::Remote {
                location: location.clone(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(OpenError::NotFound(location));
        }
        if !status.is_success() {
            return Err(OpenError::Remote {
                location,
                reason: format!("HTTP {}", status),
            });
        }

        let body = response
            .bytes_stream()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e));
        let reader = Box::pin(StreamReader::new(body));
        Ok(Box::new(SyncIoBridge::new(reader)))
    }
}
