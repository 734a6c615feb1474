use async_trait::async_trait;
use aws_config::timeout::TimeoutConfig;
use aws_config::{BehaviorVersion, Region};
use aws_credential_types::Credentials;
use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream as AwsByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart as AwsCompletedPart};
use aws_sdk_s3::Client;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::config::parse_flag;
use crate::{
    ByteRange, ByteStream, CompletedPart, FsError, FsResult, ObjectClient, ObjectHead, UploadId,
};

/// S3 rejects non-final parts smaller than 5 MiB
pub const S3_MIN_PART_SIZE: usize = 5 * 1024 * 1024;

/// Connection settings for an S3-compatible store.
///
/// Credentials are optional; without them the SDK's ambient provider chain
/// (environment, profile, instance metadata) is used.
#[derive(Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct S3Config {
    pub bucket: String,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub endpoint_url: Option<String>,
    /// Required by most self-hosted S3-compatible servers
    #[serde(default)]
    pub force_path_style: bool,
    #[serde(default)]
    pub access_key_id: Option<String>,
    #[serde(default, skip_serializing)]
    pub secret_access_key: Option<String>,
    /// Upper bound for a single API call, retries included
    #[serde(default)]
    pub operation_timeout_secs: Option<u64>,
    #[serde(default)]
    pub connect_timeout_secs: Option<u64>,
}

impl std::fmt::Debug for S3Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Config")
            .field("bucket", &self.bucket)
            .field("region", &self.region)
            .field("endpoint_url", &self.endpoint_url)
            .field("force_path_style", &self.force_path_style)
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &self.secret_access_key.as_ref().map(|_| "***"))
            .field("operation_timeout_secs", &self.operation_timeout_secs)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .finish()
    }
}

impl S3Config {
    pub fn new<S: Into<String>>(bucket: S) -> Self {
        Self {
            bucket: bucket.into(),
            ..Self::default()
        }
    }

    pub fn with_region<S: Into<String>>(mut self, region: S) -> Self {
        self.region = Some(region.into());
        self
    }

    /// Point at an S3-compatible server and switch to path-style addressing
    pub fn with_endpoint<S: Into<String>>(mut self, endpoint_url: S) -> Self {
        self.endpoint_url = Some(endpoint_url.into());
        self.force_path_style = true;
        self
    }

    pub fn with_credentials<A: Into<String>, S: Into<String>>(mut self, access_key_id: A, secret: S) -> Self {
        self.access_key_id = Some(access_key_id.into());
        self.secret_access_key = Some(secret.into());
        self
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout_secs = Some(timeout.as_secs());
        self
    }

    /// Load from `DOG_FS_S3_*` environment variables
    pub fn from_env() -> FsResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> FsResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let bucket = lookup("DOG_FS_S3_BUCKET")
            .ok_or_else(|| FsError::config("DOG_FS_S3_BUCKET environment variable required"))?;

        let mut config = Self::new(bucket);
        config.region = lookup("DOG_FS_S3_REGION");
        config.endpoint_url = lookup("DOG_FS_S3_ENDPOINT_URL");
        config.force_path_style = match lookup("DOG_FS_S3_FORCE_PATH_STYLE") {
            Some(flag) => parse_flag("DOG_FS_S3_FORCE_PATH_STYLE", &flag)?,
            None => config.endpoint_url.is_some(),
        };
        config.access_key_id = lookup("DOG_FS_S3_ACCESS_KEY_ID");
        config.secret_access_key = lookup("DOG_FS_S3_SECRET_ACCESS_KEY");
        if let Some(secs) = lookup("DOG_FS_S3_TIMEOUT_SECS") {
            config.operation_timeout_secs =
                Some(crate::config::parse_number("DOG_FS_S3_TIMEOUT_SECS", &secs)?);
        }

        if config.access_key_id.is_some() != config.secret_access_key.is_some() {
            return Err(FsError::config(
                "DOG_FS_S3_ACCESS_KEY_ID and DOG_FS_S3_SECRET_ACCESS_KEY must be set together",
            ));
        }
        Ok(config)
    }
}

/// `ObjectClient` over the AWS SDK, for S3 and S3-compatible servers
#[derive(Clone, Debug)]
pub struct S3Client {
    client: Client,
    bucket: String,
}

impl S3Client {
    pub async fn new(config: &S3Config) -> FsResult<Self> {
        if config.bucket.is_empty() {
            return Err(FsError::config("S3 bucket name is empty"));
        }

        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = &config.region {
            loader = loader.region(Region::new(region.clone()));
        }
        if let Some(endpoint) = &config.endpoint_url {
            loader = loader.endpoint_url(endpoint.clone());
        }
        if let (Some(key), Some(secret)) = (&config.access_key_id, &config.secret_access_key) {
            loader = loader.credentials_provider(Credentials::new(
                key.clone(),
                secret.clone(),
                None,
                None,
                "dog-fs",
            ));
        }

        let mut timeouts = TimeoutConfig::builder();
        if let Some(secs) = config.operation_timeout_secs {
            timeouts = timeouts.operation_timeout(Duration::from_secs(secs));
        }
        if let Some(secs) = config.connect_timeout_secs {
            timeouts = timeouts.connect_timeout(Duration::from_secs(secs));
        }
        loader = loader.timeout_config(timeouts.build());

        let sdk_config = loader.load().await;
        let client = Client::from_conf(
            aws_sdk_s3::config::Builder::from(&sdk_config)
                .force_path_style(config.force_path_style)
                .build(),
        );

        Ok(Self::from_client(client, config.bucket.clone()))
    }

    /// Wrap an already configured SDK client
    pub fn from_client<S: Into<String>>(client: Client, bucket: S) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

fn map_sdk_error<E, R>(err: SdkError<E, R>) -> FsError
where
    E: std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug + Send + Sync + 'static,
{
    FsError::backend(err)
}

#[async_trait]
impl ObjectClient for S3Client {
    async fn create_multipart(&self, key: &str) -> FsResult<UploadId> {
        let output = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(map_sdk_error)?;

        let upload_id = output
            .upload_id()
            .ok_or_else(|| FsError::backend(std::io::Error::other("store returned no upload id")))?;
        debug!(key, upload_id, "started multipart upload");
        Ok(UploadId::from_string(upload_id.to_string()))
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &UploadId,
        part_number: u32,
        body: Bytes,
    ) -> FsResult<CompletedPart> {
        let output = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id.as_str())
            .part_number(part_number as i32)
            .content_length(body.len() as i64)
            .body(AwsByteStream::from(body))
            .send()
            .await
            .map_err(map_sdk_error)?;

        let etag = output
            .e_tag()
            .ok_or_else(|| FsError::backend(std::io::Error::other("store returned no part etag")))?;
        Ok(CompletedPart {
            part_number,
            etag: etag.to_string(),
        })
    }

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &UploadId,
        parts: Vec<CompletedPart>,
    ) -> FsResult<()> {
        let parts = parts
            .into_iter()
            .map(|part| {
                AwsCompletedPart::builder()
                    .part_number(part.part_number as i32)
                    .e_tag(part.etag)
                    .build()
            })
            .collect::<Vec<_>>();

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id.as_str())
            .multipart_upload(CompletedMultipartUpload::builder().set_parts(Some(parts)).build())
            .send()
            .await
            .map_err(map_sdk_error)?;
        Ok(())
    }

    async fn abort_multipart(&self, key: &str, upload_id: &UploadId) -> FsResult<()> {
        let result = self
            .client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id.as_str())
            .send()
            .await;

        match result {
            Ok(_) => Ok(()),
            // Already completed or already aborted
            Err(err) if err.as_service_error().map_or(false, |e| e.is_no_such_upload()) => Ok(()),
            Err(err) => Err(map_sdk_error(err)),
        }
    }

    async fn get_object(&self, key: &str, range: Option<ByteRange>) -> FsResult<ByteStream> {
        let mut request = self.client.get_object().bucket(&self.bucket).key(key);
        if let Some(range) = &range {
            request = request.range(range.to_http_header());
        }

        let output = match request.send().await {
            Ok(output) => output,
            Err(err) => {
                if let Some(service) = err.as_service_error() {
                    if service.is_no_such_key() {
                        return Err(FsError::not_found(key));
                    }
                    if service.code() == Some("InvalidRange") {
                        let header = range.map(|r| r.to_http_header()).unwrap_or_default();
                        return Err(FsError::invalid_range(key, format!("{} not satisfiable", header)));
                    }
                }
                if err.raw_response().map(|r| r.status().as_u16()) == Some(404) {
                    return Err(FsError::not_found(key));
                }
                return Err(map_sdk_error(err));
            }
        };

        let mut body = output.body;
        let stream = async_stream::stream! {
            loop {
                match body.try_next().await {
                    Ok(Some(chunk)) => yield Ok(chunk),
                    Ok(None) => break,
                    Err(e) => {
                        yield Err(std::io::Error::other(e));
                        break;
                    }
                }
            }
        };
        Ok(Box::pin(stream))
    }

    async fn head_object(&self, key: &str) -> FsResult<Option<ObjectHead>> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(output) => Ok(Some(ObjectHead {
                size_bytes: output.content_length().unwrap_or(0).max(0) as u64,
                etag: output.e_tag().map(str::to_string),
                last_modified: output.last_modified().map(|dt| dt.secs()),
            })),
            Err(err) if err.as_service_error().map_or(false, |e| e.is_not_found()) => Ok(None),
            Err(err) if err.raw_response().map(|r| r.status().as_u16()) == Some(404) => Ok(None),
            Err(err) => Err(map_sdk_error(err)),
        }
    }

    async fn delete_object(&self, key: &str) -> FsResult<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(map_sdk_error)?;
        Ok(())
    }

    fn min_part_size(&self) -> usize {
        S3_MIN_PART_SIZE
    }
}
