//! In-memory collaborators for tests and local runs.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log_archive_core::contract::{LogFileEntry, RunRequest};

use crate::adapters::invoke::RunDispatcher;
use crate::adapters::log_source::{LogFileReader, LogSource};
use crate::adapters::object_store::{ObjectBody, ObjectStore, PutObjectRequest};
use crate::adapters::AdapterError;

const DEFAULT_CHUNK_SIZE: usize = 16;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Clone)]
struct StoredLogFile {
    entry: LogFileEntry,
    content: Vec<u8>,
}

#[derive(Debug, Default)]
struct SourceState {
    clusters: BTreeMap<String, Vec<String>>,
    files: BTreeMap<String, Vec<StoredLogFile>>,
    unreachable_instances: BTreeSet<String>,
    failing_fetches: BTreeSet<(String, String)>,
}

/// Log registry backed by in-memory files, streamed in fixed-size chunks.
#[derive(Debug)]
pub struct InMemoryLogSource {
    state: Mutex<SourceState>,
    chunk_size: usize,
}

impl Default for InMemoryLogSource {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryLogSource {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SourceState::default()),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn add_cluster(&self, cluster_identifier: &str, instance_identifiers: &[&str]) {
        lock(&self.state).clusters.insert(
            cluster_identifier.to_string(),
            instance_identifiers
                .iter()
                .map(|instance| instance.to_string())
                .collect(),
        );
    }

    /// Adds or replaces a log file on `instance_identifier`.
    pub fn add_log_file(
        &self,
        instance_identifier: &str,
        file_name: &str,
        last_written: DateTime<Utc>,
        content: impl Into<Vec<u8>>,
    ) {
        let content = content.into();
        let file = StoredLogFile {
            entry: LogFileEntry {
                file_name: file_name.to_string(),
                last_written,
                size_bytes: content.len() as u64,
            },
            content,
        };

        let mut state = lock(&self.state);
        let files = state
            .files
            .entry(instance_identifier.to_string())
            .or_default();
        files.retain(|existing| existing.entry.file_name != file_name);
        files.push(file);
    }

    pub fn make_unreachable(&self, instance_identifier: &str) {
        lock(&self.state)
            .unreachable_instances
            .insert(instance_identifier.to_string());
    }

    /// Makes reads of `file_name` fail after it has been opened.
    pub fn fail_fetch(&self, instance_identifier: &str, file_name: &str) {
        lock(&self.state)
            .failing_fetches
            .insert((instance_identifier.to_string(), file_name.to_string()));
    }
}

#[async_trait]
impl LogSource for InMemoryLogSource {
    async fn list_instances(&self, cluster_identifier: &str) -> Result<Vec<String>, AdapterError> {
        lock(&self.state)
            .clusters
            .get(cluster_identifier)
            .cloned()
            .ok_or_else(|| AdapterError::NotFound(format!("cluster {cluster_identifier}")))
    }

    async fn list_log_files(
        &self,
        instance_identifier: &str,
    ) -> Result<Vec<LogFileEntry>, AdapterError> {
        let state = lock(&self.state);
        if state.unreachable_instances.contains(instance_identifier) {
            return Err(AdapterError::request_failed(
                "DescribeDBLogFiles",
                format!("instance {instance_identifier} is unreachable"),
            ));
        }

        Ok(state
            .files
            .get(instance_identifier)
            .map(|files| files.iter().map(|file| file.entry.clone()).collect())
            .unwrap_or_default())
    }

    async fn open_log_file(
        &self,
        instance_identifier: &str,
        file_name: &str,
    ) -> Result<Box<dyn LogFileReader>, AdapterError> {
        let state = lock(&self.state);
        let file = state
            .files
            .get(instance_identifier)
            .and_then(|files| files.iter().find(|file| file.entry.file_name == file_name))
            .ok_or_else(|| {
                AdapterError::NotFound(format!("log file {file_name} on {instance_identifier}"))
            })?;

        let fails = state
            .failing_fetches
            .contains(&(instance_identifier.to_string(), file_name.to_string()));

        Ok(Box::new(InMemoryLogFileReader {
            chunks: file
                .content
                .chunks(self.chunk_size)
                .map(<[u8]>::to_vec)
                .collect(),
            fails,
        }))
    }
}

struct InMemoryLogFileReader {
    chunks: VecDeque<Vec<u8>>,
    fails: bool,
}

#[async_trait]
impl LogFileReader for InMemoryLogFileReader {
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, AdapterError> {
        if self.fails {
            return Err(AdapterError::request_failed(
                "DownloadDBLogFilePortion",
                "connection reset",
            ));
        }
        Ok(self.chunks.pop_front())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub body: Vec<u8>,
    pub content_type: String,
    pub content_encoding: String,
    pub metadata: BTreeMap<String, String>,
    pub spooled: bool,
}

#[derive(Debug, Default)]
struct StoreState {
    objects: BTreeMap<(String, String), StoredObject>,
    put_count: usize,
    failing_keys: BTreeSet<String>,
}

/// Object store that records every write and tracks peak write concurrency.
#[derive(Debug, Default)]
pub struct RecordingObjectStore {
    state: Mutex<StoreState>,
    put_delay: Option<Duration>,
    head_delay: Option<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    heads_in_flight: AtomicUsize,
    max_heads_in_flight: AtomicUsize,
}

impl RecordingObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Holds every put open for `delay`, so concurrent writers overlap.
    pub fn with_put_delay(mut self, delay: Duration) -> Self {
        self.put_delay = Some(delay);
        self
    }

    /// Holds every existence check open for `delay`.
    pub fn with_head_delay(mut self, delay: Duration) -> Self {
        self.head_delay = Some(delay);
        self
    }

    pub fn fail_key(&self, key: &str) {
        lock(&self.state).failing_keys.insert(key.to_string());
    }

    pub fn insert_existing(&self, bucket: &str, key: &str) {
        lock(&self.state).objects.insert(
            (bucket.to_string(), key.to_string()),
            StoredObject {
                body: Vec::new(),
                content_type: String::new(),
                content_encoding: String::new(),
                metadata: BTreeMap::new(),
                spooled: false,
            },
        );
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<StoredObject> {
        lock(&self.state)
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        lock(&self.state)
            .objects
            .keys()
            .map(|(_, key)| key.clone())
            .collect()
    }

    pub fn put_count(&self) -> usize {
        lock(&self.state).put_count
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn max_heads_in_flight(&self) -> usize {
        self.max_heads_in_flight.load(Ordering::SeqCst)
    }
}

struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ObjectStore for RecordingObjectStore {
    async fn put_object(&self, request: PutObjectRequest) -> Result<(), AdapterError> {
        let active = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = InFlightGuard(&self.in_flight);
        self.max_in_flight.fetch_max(active, Ordering::SeqCst);

        if let Some(delay) = self.put_delay {
            tokio::time::sleep(delay).await;
        }

        let (body, spooled) = match &request.body {
            ObjectBody::Bytes(bytes) => (bytes.clone(), false),
            ObjectBody::TempFile(file) => (std::fs::read(file.path())?, true),
        };

        let mut state = lock(&self.state);
        state.put_count += 1;
        if state.failing_keys.contains(&request.key) {
            return Err(AdapterError::request_failed("PutObject", "access denied"));
        }
        state.objects.insert(
            (request.bucket, request.key),
            StoredObject {
                body,
                content_type: request.content_type,
                content_encoding: request.content_encoding,
                metadata: request.metadata,
                spooled,
            },
        );
        Ok(())
    }

    async fn object_exists(&self, bucket: &str, key: &str) -> Result<bool, AdapterError> {
        let active = self.heads_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = InFlightGuard(&self.heads_in_flight);
        self.max_heads_in_flight.fetch_max(active, Ordering::SeqCst);

        if let Some(delay) = self.head_delay {
            tokio::time::sleep(delay).await;
        }

        Ok(lock(&self.state)
            .objects
            .contains_key(&(bucket.to_string(), key.to_string())))
    }
}

/// Dispatcher that records requests and fails the first `failures` attempts.
#[derive(Debug, Default)]
pub struct RecordingDispatcher {
    requests: Mutex<Vec<RunRequest>>,
    attempts: AtomicUsize,
    failures: usize,
}

impl RecordingDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_first(failures: usize) -> Self {
        Self {
            failures,
            ..Self::default()
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn delivered(&self) -> Vec<RunRequest> {
        lock(&self.requests).clone()
    }
}

#[async_trait]
impl RunDispatcher for RecordingDispatcher {
    async fn dispatch(&self, request: &RunRequest) -> Result<(), AdapterError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.failures {
            return Err(AdapterError::request_failed(
                "Invoke",
                "pipeline entry point unreachable",
            ));
        }
        lock(&self.requests).push(request.clone());
        Ok(())
    }
}
