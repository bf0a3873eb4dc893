use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::operation::get_object::GetObjectError;
use aws_sdk_s3::primitives::ByteStream;
use object_store::gcp::{GoogleCloudStorage, GoogleCloudStorageBuilder};
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutPayload};
use reqwest::StatusCode;
use reqwest::header::CONTENT_TYPE;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{Instrument, debug};

use crate::config::BlobConfig;

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("Blob provider misconfigured: {0}")]
    Config(String),

    #[error("Blob request failed: {0}")]
    Request(String),

    #[error("Blob service rejected request with status {0}")]
    Status(u16),

    #[error("Local database file error: {0}")]
    Io(#[from] std::io::Error),
}

/// Remote object store holding the embedded database file.
#[rocket::async_trait]
pub trait BlobProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// The key the database file lives under.
    fn key(&self) -> &str;

    /// Returns `None` when the object does not exist.
    async fn fetch(&self) -> Result<Option<Vec<u8>>, BlobError>;

    async fn store(&self, bytes: Vec<u8>) -> Result<(), BlobError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BlobProviderKind {
    S3,
    Gcs,
    HttpBlob,
}

impl BlobProviderKind {
    /// S3 wins over GCS, which wins over the HTTP blob service.
    pub fn detect(config: &BlobConfig) -> Option<Self> {
        if config.has_s3_credentials() {
            Some(BlobProviderKind::S3)
        } else if config.has_gcs_credentials() {
            Some(BlobProviderKind::Gcs)
        } else if config.has_http_blob_credentials() {
            Some(BlobProviderKind::HttpBlob)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BlobProviderKind::S3 => "s3",
            BlobProviderKind::Gcs => "gcs",
            BlobProviderKind::HttpBlob => "http-blob",
        }
    }
}

pub fn provider_from_config(config: &BlobConfig) -> Option<Box<dyn BlobProvider>> {
    let provider: Box<dyn BlobProvider> = match BlobProviderKind::detect(config)? {
        BlobProviderKind::S3 => Box::new(S3Provider::new(&config.s3_bucket, &config.s3_key)),
        BlobProviderKind::Gcs => Box::new(GcsProvider::new(
            &config.gcs_bucket,
            &config.gcs_blob,
            config.google_credentials.as_deref(),
        )),
        BlobProviderKind::HttpBlob => Box::new(HttpBlobProvider::new(config)),
    };
    Some(provider)
}

pub struct S3Provider {
    bucket: String,
    key: String,
    client: OnceCell<aws_sdk_s3::Client>,
}

impl S3Provider {
    pub fn new(bucket: &str, key: &str) -> Self {
        Self {
            bucket: bucket.to_string(),
            key: key.to_string(),
            client: OnceCell::new(),
        }
    }

    async fn client(&self) -> &aws_sdk_s3::Client {
        self.client
            .get_or_init(|| async {
                let config = aws_config::load_from_env().await;
                aws_sdk_s3::Client::new(&config)
            })
            .await
    }
}

#[rocket::async_trait]
impl BlobProvider for S3Provider {
    fn name(&self) -> &'static str {
        "s3"
    }

    fn key(&self) -> &str {
        &self.key
    }

    async fn fetch(&self) -> Result<Option<Vec<u8>>, BlobError> {
        let res = self
            .client()
            .await
            .get_object()
            .bucket(&self.bucket)
            .key(&self.key)
            .send()
            .instrument(tracing::trace_span!("s3 get"))
            .await;

        match res {
            Ok(output) => {
                let data = output
                    .body
                    .collect()
                    .await
                    .map_err(|e| BlobError::Request(e.to_string()))?;
                Ok(Some(data.into_bytes().to_vec()))
            }
            Err(SdkError::ServiceError(err)) => match err.into_err() {
                GetObjectError::NoSuchKey(_) => Ok(None),
                other => Err(BlobError::Request(other.to_string())),
            },
            Err(e) => Err(BlobError::Request(e.to_string())),
        }
    }

    async fn store(&self, bytes: Vec<u8>) -> Result<(), BlobError> {
        self.client()
            .await
            .put_object()
            .bucket(&self.bucket)
            .key(&self.key)
            .body(ByteStream::from(bytes))
            .send()
            .instrument(tracing::trace_span!("s3 put"))
            .await
            .map_err(|e| BlobError::Request(e.to_string()))?;
        Ok(())
    }
}

pub struct GcsProvider {
    key: String,
    bucket: Result<GoogleCloudStorage, String>,
}

impl GcsProvider {
    pub fn new(bucket: &str, key: &str, credentials: Option<&str>) -> Self {
        let mut builder = GoogleCloudStorageBuilder::from_env().with_bucket_name(bucket);
        if let Some(path) = credentials {
            builder = builder.with_application_credentials(path);
        }

        Self {
            key: key.to_string(),
            bucket: builder.build().map_err(|e| e.to_string()),
        }
    }

    fn bucket(&self) -> Result<&GoogleCloudStorage, BlobError> {
        self.bucket
            .as_ref()
            .map_err(|e| BlobError::Config(e.clone()))
    }
}

#[rocket::async_trait]
impl BlobProvider for GcsProvider {
    fn name(&self) -> &'static str {
        "gcs"
    }

    fn key(&self) -> &str {
        &self.key
    }

    async fn fetch(&self) -> Result<Option<Vec<u8>>, BlobError> {
        let path = ObjectPath::from(self.key.as_str());
        match self.bucket()?.get(&path).await {
            Ok(result) => {
                let bytes = result
                    .bytes()
                    .await
                    .map_err(|e| BlobError::Request(e.to_string()))?;
                Ok(Some(bytes.to_vec()))
            }
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(BlobError::Request(e.to_string())),
        }
    }

    async fn store(&self, bytes: Vec<u8>) -> Result<(), BlobError> {
        let path = ObjectPath::from(self.key.as_str());
        self.bucket()?
            .put(&path, PutPayload::from(bytes))
            .await
            .map_err(|e| BlobError::Request(e.to_string()))?;
        Ok(())
    }
}

/// Bearer-token HTTP blob service: GET to read, PUT to replace.
pub struct HttpBlobProvider {
    client: reqwest::Client,
    token: String,
    name: String,
    read_url: String,
    write_url: String,
}

impl HttpBlobProvider {
    pub fn new(config: &BlobConfig) -> Self {
        let base = config.blob_api_url.trim_end_matches('/');
        let write_url = format!("{}/{}", base, config.blob_name);

        Self {
            client: reqwest::Client::new(),
            token: config.blob_token.clone().unwrap_or_default(),
            name: config.blob_name.clone(),
            read_url: config.blob_url.clone().unwrap_or_else(|| write_url.clone()),
            write_url,
        }
    }
}

#[rocket::async_trait]
impl BlobProvider for HttpBlobProvider {
    fn name(&self) -> &'static str {
        "http-blob"
    }

    fn key(&self) -> &str {
        &self.name
    }

    async fn fetch(&self) -> Result<Option<Vec<u8>>, BlobError> {
        let response = self
            .client
            .get(&self.read_url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| BlobError::Request(e.to_string()))?;

        match response.status() {
            StatusCode::OK => {
                let bytes = response
                    .bytes()
                    .await
                    .map_err(|e| BlobError::Request(e.to_string()))?;
                Ok(Some(bytes.to_vec()))
            }
            StatusCode::NOT_FOUND => Ok(None),
            status => Err(BlobError::Status(status.as_u16())),
        }
    }

    async fn store(&self, bytes: Vec<u8>) -> Result<(), BlobError> {
        let response = self
            .client
            .put(&self.write_url)
            .bearer_auth(&self.token)
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(bytes)
            .send()
            .await
            .map_err(|e| BlobError::Request(e.to_string()))?;

        match response.status() {
            StatusCode::OK | StatusCode::CREATED => {
                debug!(url = %self.write_url, "Uploaded database blob");
                Ok(())
            }
            status => Err(BlobError::Status(status.as_u16())),
        }
    }
}
