use async_trait::async_trait;
use aws_sdk_rds::error::DisplayErrorContext;
use chrono::{DateTime, Utc};
use log_archive_core::contract::LogFileEntry;

use super::AdapterError;

/// Read-only access to the database engine's log-file registry.
#[async_trait]
pub trait LogSource: Send + Sync {
    /// Instance identifiers belonging to `cluster_identifier`.
    async fn list_instances(&self, cluster_identifier: &str) -> Result<Vec<String>, AdapterError>;

    async fn list_log_files(
        &self,
        instance_identifier: &str,
    ) -> Result<Vec<LogFileEntry>, AdapterError>;

    async fn open_log_file(
        &self,
        instance_identifier: &str,
        file_name: &str,
    ) -> Result<Box<dyn LogFileReader>, AdapterError>;
}

/// Sequential reader over one log file's content.
#[async_trait]
pub trait LogFileReader: Send {
    /// Next chunk of content, or `None` once the file is exhausted.
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, AdapterError>;
}

pub struct RdsLogSource {
    client: aws_sdk_rds::Client,
}

impl RdsLogSource {
    pub fn new(client: aws_sdk_rds::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl LogSource for RdsLogSource {
    async fn list_instances(&self, cluster_identifier: &str) -> Result<Vec<String>, AdapterError> {
        let output = self
            .client
            .describe_db_clusters()
            .db_cluster_identifier(cluster_identifier)
            .send()
            .await
            .map_err(|error| {
                let not_found = error
                    .as_service_error()
                    .map(|service_error| service_error.is_db_cluster_not_found_fault())
                    .unwrap_or(false);
                if not_found {
                    AdapterError::NotFound(format!("cluster {cluster_identifier}"))
                } else {
                    AdapterError::request_failed("DescribeDBClusters", DisplayErrorContext(&error))
                }
            })?;

        Ok(output
            .db_clusters()
            .iter()
            .flat_map(|cluster| cluster.db_cluster_members())
            .filter_map(|member| member.db_instance_identifier())
            .map(str::to_string)
            .collect())
    }

    async fn list_log_files(
        &self,
        instance_identifier: &str,
    ) -> Result<Vec<LogFileEntry>, AdapterError> {
        let mut entries = Vec::new();
        let mut marker: Option<String> = None;

        loop {
            let output = self
                .client
                .describe_db_log_files()
                .db_instance_identifier(instance_identifier)
                .set_marker(marker.take())
                .send()
                .await
                .map_err(|error| {
                    let not_found = error
                        .as_service_error()
                        .map(|service_error| service_error.is_db_instance_not_found_fault())
                        .unwrap_or(false);
                    if not_found {
                        AdapterError::NotFound(format!("instance {instance_identifier}"))
                    } else {
                        AdapterError::request_failed(
                            "DescribeDBLogFiles",
                            DisplayErrorContext(&error),
                        )
                    }
                })?;

            for details in output.describe_db_log_files() {
                let (Some(file_name), Some(last_written)) =
                    (details.log_file_name(), details.last_written())
                else {
                    continue;
                };
                let last_written = DateTime::<Utc>::from_timestamp_millis(last_written)
                    .ok_or_else(|| {
                        AdapterError::invalid_response(
                            "DescribeDBLogFiles",
                            format!("LastWritten {last_written} is out of range for {file_name}"),
                        )
                    })?;

                entries.push(LogFileEntry {
                    file_name: file_name.to_string(),
                    last_written,
                    size_bytes: details.size().unwrap_or(0).max(0) as u64,
                });
            }

            match output.marker() {
                Some(next) if !next.is_empty() => marker = Some(next.to_string()),
                _ => break,
            }
        }

        Ok(entries)
    }

    async fn open_log_file(
        &self,
        instance_identifier: &str,
        file_name: &str,
    ) -> Result<Box<dyn LogFileReader>, AdapterError> {
        Ok(Box::new(RdsLogFileReader {
            client: self.client.clone(),
            instance_identifier: instance_identifier.to_string(),
            file_name: file_name.to_string(),
            marker: Some(INITIAL_PORTION_MARKER.to_string()),
        }))
    }
}

const INITIAL_PORTION_MARKER: &str = "0";

/// Pages through `DownloadDBLogFilePortion` until no data is pending.
struct RdsLogFileReader {
    client: aws_sdk_rds::Client,
    instance_identifier: String,
    file_name: String,
    marker: Option<String>,
}

#[async_trait]
impl LogFileReader for RdsLogFileReader {
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, AdapterError> {
        let Some(marker) = self.marker.take() else {
            return Ok(None);
        };

        let output = self
            .client
            .download_db_log_file_portion()
            .db_instance_identifier(&self.instance_identifier)
            .log_file_name(&self.file_name)
            .marker(marker)
            .send()
            .await
            .map_err(|error| {
                let not_found = error
                    .as_service_error()
                    .map(|service_error| service_error.is_db_log_file_not_found_fault())
                    .unwrap_or(false);
                if not_found {
                    AdapterError::NotFound(format!(
                        "log file {} on {}",
                        self.file_name, self.instance_identifier
                    ))
                } else {
                    AdapterError::request_failed(
                        "DownloadDBLogFilePortion",
                        DisplayErrorContext(&error),
                    )
                }
            })?;

        if output.additional_data_pending().unwrap_or(false) {
            let next = output.marker().filter(|next| !next.is_empty()).ok_or_else(|| {
                AdapterError::invalid_response(
                    "DownloadDBLogFilePortion",
                    "additional data pending without a marker",
                )
            })?;
            self.marker = Some(next.to_string());
        }

        Ok(Some(
            output
                .log_file_data()
                .map(|data| data.as_bytes().to_vec())
                .unwrap_or_default(),
        ))
    }
}
