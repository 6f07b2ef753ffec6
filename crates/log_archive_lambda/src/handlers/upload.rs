use std::collections::BTreeMap;
use std::io::{self, BufWriter, Write};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use log_archive_core::contract::{FailureReason, ItemOutcome, LogFileDescriptor, WorkItem};
use log_archive_core::storage_keys::COMPRESSED_SUFFIX;
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::{info, warn};

use crate::adapters::log_source::LogSource;
use crate::adapters::object_store::{ObjectBody, ObjectStore, PutObjectRequest};
use crate::adapters::AdapterError;

pub const GZIP_LEVEL: u32 = 6;

pub const METADATA_LAST_WRITTEN: &str = "LastWritten";
pub const METADATA_INSTANCE: &str = "DbInstanceIdentifier";
pub const METADATA_COMPRESSED: &str = "Compressed";
pub const METADATA_CONTENT_SHA256: &str = "ContentSha256";

/// Moves one work item from the log source to the object store.
///
/// Implementations never fail: every error becomes a `Failed` outcome.
#[async_trait]
pub trait UploadStage: Send + Sync {
    async fn upload(&self, item: WorkItem) -> ItemOutcome;
}

pub struct Uploader {
    source: Arc<dyn LogSource>,
    store: Arc<dyn ObjectStore>,
    spool_threshold_bytes: u64,
}

impl Uploader {
    pub fn new(
        source: Arc<dyn LogSource>,
        store: Arc<dyn ObjectStore>,
        spool_threshold_bytes: u64,
    ) -> Self {
        Self {
            source,
            store,
            spool_threshold_bytes,
        }
    }

    async fn transfer(&self, item: &WorkItem) -> Result<(u64, String), AdapterError> {
        let descriptor = &item.descriptor;
        // Items planned with compression carry the `.gz` key suffix.
        let compressed = item.object_key.ends_with(COMPRESSED_SUFFIX);

        let mut reader = self
            .source
            .open_log_file(&descriptor.instance_identifier, &descriptor.file_name)
            .await?;
        let mut sink = ContentSink::new(compressed, self.spool_threshold_bytes);
        while let Some(chunk) = reader.next_chunk().await? {
            sink = on_blocking_pool(move || {
                sink.write_all(&chunk)?;
                Ok(sink)
            })
            .await?;
        }
        let SpooledContent {
            body,
            bytes,
            sha256,
        } = on_blocking_pool(move || sink.finish()).await?;

        let (content_type, content_encoding) = if compressed {
            ("application/gzip", "gzip")
        } else {
            ("text/plain", "identity")
        };

        self.store
            .put_object(PutObjectRequest {
                bucket: item.destination_bucket.clone(),
                key: item.object_key.clone(),
                body,
                content_length: bytes,
                content_type: content_type.to_string(),
                content_encoding: content_encoding.to_string(),
                metadata: object_metadata(descriptor, compressed, &sha256),
            })
            .await?;

        Ok((bytes, sha256))
    }
}

#[async_trait]
impl UploadStage for Uploader {
    async fn upload(&self, item: WorkItem) -> ItemOutcome {
        let started_at = Instant::now();

        match self.transfer(&item).await {
            Ok((bytes_transferred, content_sha256)) => {
                info!(
                    instance = %item.descriptor.instance_identifier,
                    file = %item.descriptor.file_name,
                    bucket = %item.destination_bucket,
                    object_key = %item.object_key,
                    source_bytes = item.descriptor.size_bytes,
                    bytes_transferred,
                    duration_ms = started_at.elapsed().as_millis() as u64,
                    "log file archived"
                );
                ItemOutcome::succeeded(item, bytes_transferred, content_sha256)
            }
            Err(error) => {
                warn!(
                    instance = %item.descriptor.instance_identifier,
                    file = %item.descriptor.file_name,
                    object_key = %item.object_key,
                    error_class = error.class(),
                    error = %error,
                    "log file upload failed"
                );
                ItemOutcome::failed(item, FailureReason::new(error.class(), error.to_string()))
            }
        }
    }
}

pub fn object_metadata(
    descriptor: &LogFileDescriptor,
    compressed: bool,
    content_sha256: &str,
) -> BTreeMap<String, String> {
    BTreeMap::from([
        (
            METADATA_LAST_WRITTEN.to_string(),
            descriptor.last_written.timestamp_millis().to_string(),
        ),
        (
            METADATA_INSTANCE.to_string(),
            descriptor.instance_identifier.clone(),
        ),
        (METADATA_COMPRESSED.to_string(), compressed.to_string()),
        (
            METADATA_CONTENT_SHA256.to_string(),
            content_sha256.to_string(),
        ),
    ])
}

/// Runs sink work (compression, spilled spool writes) on the blocking pool.
async fn on_blocking_pool<T, F>(work: F) -> io::Result<T>
where
    F: FnOnce() -> io::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(io::Error::other)?
}

struct SpooledContent {
    body: ObjectBody,
    bytes: u64,
    sha256: String,
}

enum ContentSink {
    Plain(SpoolWriter),
    Gzip(GzEncoder<SpoolWriter>),
}

impl ContentSink {
    fn new(compressed: bool, spool_threshold_bytes: u64) -> Self {
        let spool = SpoolWriter::new(spool_threshold_bytes);
        if compressed {
            Self::Gzip(GzEncoder::new(spool, Compression::new(GZIP_LEVEL)))
        } else {
            Self::Plain(spool)
        }
    }

    fn write_all(&mut self, chunk: &[u8]) -> io::Result<()> {
        match self {
            Self::Plain(spool) => spool.write_all(chunk),
            Self::Gzip(encoder) => encoder.write_all(chunk),
        }
    }

    fn finish(self) -> io::Result<SpooledContent> {
        match self {
            Self::Plain(spool) => spool.finish(),
            Self::Gzip(encoder) => encoder.finish()?.finish(),
        }
    }
}

/// Buffers written content in memory until it exceeds the threshold, then
/// spills everything to a temporary file. Hashes and counts what it stores.
struct SpoolWriter {
    threshold: u64,
    written: u64,
    hasher: Sha256,
    buffer: Vec<u8>,
    file: Option<BufWriter<NamedTempFile>>,
}

impl SpoolWriter {
    fn new(threshold: u64) -> Self {
        Self {
            threshold,
            written: 0,
            hasher: Sha256::new(),
            buffer: Vec::new(),
            file: None,
        }
    }

    fn finish(self) -> io::Result<SpooledContent> {
        let body = match self.file {
            Some(file) => {
                let file = file.into_inner().map_err(|error| error.into_error())?;
                ObjectBody::TempFile(file)
            }
            None => ObjectBody::Bytes(self.buffer),
        };

        Ok(SpooledContent {
            body,
            bytes: self.written,
            sha256: format!("{:x}", self.hasher.finalize()),
        })
    }
}

impl Write for SpoolWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.file.is_none() && self.written + buf.len() as u64 > self.threshold {
            let mut file = BufWriter::new(NamedTempFile::new()?);
            file.write_all(&self.buffer)?;
            self.buffer = Vec::new();
            self.file = Some(file);
        }

        match self.file.as_mut() {
            Some(file) => file.write_all(buf)?,
            None => self.buffer.extend_from_slice(buf),
        }
        self.hasher.update(buf);
        self.written += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}
