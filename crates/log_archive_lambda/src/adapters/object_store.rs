use std::collections::BTreeMap;

use async_trait::async_trait;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use tempfile::NamedTempFile;

use super::AdapterError;

/// Object content, either held in memory or spooled to a temporary file.
#[derive(Debug)]
pub enum ObjectBody {
    Bytes(Vec<u8>),
    TempFile(NamedTempFile),
}

#[derive(Debug)]
pub struct PutObjectRequest {
    pub bucket: String,
    pub key: String,
    pub body: ObjectBody,
    pub content_length: u64,
    pub content_type: String,
    pub content_encoding: String,
    pub metadata: BTreeMap<String, String>,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Writes the object, replacing any existing object under the same key.
    async fn put_object(&self, request: PutObjectRequest) -> Result<(), AdapterError>;

    async fn object_exists(&self, bucket: &str, key: &str) -> Result<bool, AdapterError>;
}

pub struct S3ObjectStore {
    client: aws_sdk_s3::Client,
}

impl S3ObjectStore {
    pub fn new(client: aws_sdk_s3::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn put_object(&self, request: PutObjectRequest) -> Result<(), AdapterError> {
        let PutObjectRequest {
            bucket,
            key,
            body,
            content_length,
            content_type,
            content_encoding,
            metadata,
        } = request;

        // The spool file is deleted on drop, so it is held until the put completes.
        let (stream, _spool) = match body {
            ObjectBody::Bytes(bytes) => (ByteStream::from(bytes), None),
            ObjectBody::TempFile(file) => {
                let stream = ByteStream::from_path(file.path())
                    .await
                    .map_err(|error| AdapterError::request_failed("PutObject", error))?;
                (stream, Some(file))
            }
        };

        let content_length = i64::try_from(content_length).map_err(|_| {
            AdapterError::request_failed("PutObject", "content length exceeds i64")
        })?;

        let mut put = self
            .client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(stream)
            .content_length(content_length)
            .content_type(content_type)
            .content_encoding(content_encoding);
        for (name, value) in metadata {
            put = put.metadata(name, value);
        }

        put.send()
            .await
            .map(|_| ())
            .map_err(|error| AdapterError::request_failed("PutObject", DisplayErrorContext(&error)))
    }

    async fn object_exists(&self, bucket: &str, key: &str) -> Result<bool, AdapterError> {
        match self.client.head_object().bucket(bucket).key(key).send().await {
            Ok(_) => Ok(true),
            Err(error)
                if error
                    .as_service_error()
                    .map(|service_error| service_error.is_not_found())
                    .unwrap_or(false) =>
            {
                Ok(false)
            }
            Err(error) => Err(AdapterError::request_failed(
                "HeadObject",
                DisplayErrorContext(&error),
            )),
        }
    }
}
