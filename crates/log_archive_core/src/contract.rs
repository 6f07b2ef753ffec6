use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const DEFAULT_LOG_RANGE_MINUTES: u32 = 180;

pub const FAILURE_CLASS_TIMEOUT: &str = "timeout";
pub const FAILURE_CLASS_PANIC: &str = "panic";

/// Boundary payload delivered by the schedule (or an ad hoc invocation).
///
/// Every field is optional here so that a missing value surfaces as a
/// [`ValidationError`] naming the field instead of a serde error.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TriggerPayload {
    #[serde(rename = "DbClusterIdentifier", default)]
    pub db_cluster_identifier: Option<String>,
    #[serde(rename = "LogDestinationBucket", default)]
    pub log_destination_bucket: Option<String>,
    #[serde(
        rename = "LogRangeMinutes",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub log_range_minutes: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(try_from = "TriggerPayload")]
pub struct RunRequest {
    #[serde(rename = "DbClusterIdentifier")]
    cluster_identifier: String,
    #[serde(rename = "LogDestinationBucket")]
    destination_bucket: String,
    #[serde(rename = "LogRangeMinutes")]
    log_range_minutes: u32,
}

impl RunRequest {
    pub fn new(
        cluster_identifier: impl Into<String>,
        destination_bucket: impl Into<String>,
        log_range_minutes: u32,
    ) -> Result<Self, ValidationError> {
        let cluster_identifier = cluster_identifier.into().trim().to_string();
        if cluster_identifier.is_empty() {
            return Err(ValidationError::new("DbClusterIdentifier is required"));
        }

        let destination_bucket = destination_bucket.into().trim().to_string();
        if destination_bucket.is_empty() {
            return Err(ValidationError::new("LogDestinationBucket is required"));
        }

        if log_range_minutes == 0 {
            return Err(ValidationError::new(
                "LogRangeMinutes must be greater than 0",
            ));
        }

        Ok(Self {
            cluster_identifier,
            destination_bucket,
            log_range_minutes,
        })
    }

    pub fn cluster_identifier(&self) -> &str {
        &self.cluster_identifier
    }

    pub fn destination_bucket(&self) -> &str {
        &self.destination_bucket
    }

    pub fn log_range_minutes(&self) -> u32 {
        self.log_range_minutes
    }

    pub fn to_payload(&self) -> TriggerPayload {
        TriggerPayload {
            db_cluster_identifier: Some(self.cluster_identifier.clone()),
            log_destination_bucket: Some(self.destination_bucket.clone()),
            log_range_minutes: Some(Value::from(self.log_range_minutes)),
        }
    }
}

impl TryFrom<TriggerPayload> for RunRequest {
    type Error = ValidationError;

    fn try_from(payload: TriggerPayload) -> Result<Self, Self::Error> {
        normalize_request(payload)
    }
}

/// A log file as reported by the engine's registry for one instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogFileEntry {
    pub file_name: String,
    pub last_written: DateTime<Utc>,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogFileDescriptor {
    pub instance_identifier: String,
    pub file_name: String,
    pub last_written: DateTime<Utc>,
    pub size_bytes: u64,
}

impl LogFileDescriptor {
    pub fn from_entry(instance_identifier: impl Into<String>, entry: LogFileEntry) -> Self {
        Self {
            instance_identifier: instance_identifier.into(),
            file_name: entry.file_name,
            last_written: entry.last_written,
            size_bytes: entry.size_bytes,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkItem {
    pub descriptor: LogFileDescriptor,
    pub destination_bucket: String,
    pub object_key: String,
}

/// Per-item message passed from Discovery to Upload when the stages run as
/// separate functions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkItemPayload {
    #[serde(rename = "DbInstanceIdentifier")]
    pub db_instance_identifier: String,
    #[serde(rename = "LogDestinationBucket")]
    pub log_destination_bucket: String,
    /// Milliseconds since the Unix epoch.
    #[serde(rename = "LastWritten")]
    pub last_written: i64,
    #[serde(rename = "LogFileName")]
    pub log_file_name: String,
    #[serde(rename = "ObjectKey")]
    pub object_key: String,
    #[serde(rename = "Size", default)]
    pub size_bytes: u64,
}

impl From<&WorkItem> for WorkItemPayload {
    fn from(item: &WorkItem) -> Self {
        Self {
            db_instance_identifier: item.descriptor.instance_identifier.clone(),
            log_destination_bucket: item.destination_bucket.clone(),
            last_written: item.descriptor.last_written.timestamp_millis(),
            log_file_name: item.descriptor.file_name.clone(),
            object_key: item.object_key.clone(),
            size_bytes: item.descriptor.size_bytes,
        }
    }
}

impl TryFrom<WorkItemPayload> for WorkItem {
    type Error = ValidationError;

    fn try_from(payload: WorkItemPayload) -> Result<Self, Self::Error> {
        if payload.db_instance_identifier.trim().is_empty() {
            return Err(ValidationError::new("DbInstanceIdentifier is required"));
        }
        if payload.log_destination_bucket.trim().is_empty() {
            return Err(ValidationError::new("LogDestinationBucket is required"));
        }
        if payload.log_file_name.trim().is_empty() {
            return Err(ValidationError::new("LogFileName is required"));
        }
        if payload.object_key.trim().is_empty() {
            return Err(ValidationError::new("ObjectKey is required"));
        }
        if payload.last_written <= 0 {
            return Err(ValidationError::new("LastWritten is required"));
        }
        let last_written = DateTime::<Utc>::from_timestamp_millis(payload.last_written)
            .ok_or_else(|| ValidationError::new("LastWritten is out of range"))?;

        Ok(Self {
            descriptor: LogFileDescriptor {
                instance_identifier: payload.db_instance_identifier,
                file_name: payload.log_file_name,
                last_written,
                size_bytes: payload.size_bytes,
            },
            destination_bucket: payload.log_destination_bucket,
            object_key: payload.object_key,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FailureReason {
    pub class: String,
    pub message: String,
}

impl FailureReason {
    pub fn new(class: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            message: message.into(),
        }
    }

    pub fn timeout() -> Self {
        Self::new(
            FAILURE_CLASS_TIMEOUT,
            "run deadline elapsed before the upload reached a terminal outcome",
        )
    }

    pub fn is_timeout(&self) -> bool {
        self.class == FAILURE_CLASS_TIMEOUT
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.class, self.message)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ItemStatus {
    Succeeded,
    Failed { reason: FailureReason },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ItemOutcome {
    pub work_item: WorkItem,
    #[serde(flatten)]
    pub status: ItemStatus,
    /// Size of the content written to storage, after compression.
    pub bytes_transferred: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_sha256: Option<String>,
}

impl ItemOutcome {
    pub fn succeeded(work_item: WorkItem, bytes_transferred: u64, content_sha256: String) -> Self {
        Self {
            work_item,
            status: ItemStatus::Succeeded,
            bytes_transferred,
            content_sha256: Some(content_sha256),
        }
    }

    pub fn failed(work_item: WorkItem, reason: FailureReason) -> Self {
        Self {
            work_item,
            status: ItemStatus::Failed { reason },
            bytes_transferred: 0,
            content_sha256: None,
        }
    }

    pub fn is_succeeded(&self) -> bool {
        matches!(self.status, ItemStatus::Succeeded)
    }

    pub fn failure(&self) -> Option<&FailureReason> {
        match &self.status {
            ItemStatus::Succeeded => None,
            ItemStatus::Failed { reason } => Some(reason),
        }
    }
}

/// Discovery degraded for one instance (or for the whole cluster when
/// `instance_identifier` is `None`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiscoveryWarning {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_identifier: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ValidationError {
    message: String,
}

impl ValidationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

pub fn normalize_request(payload: TriggerPayload) -> Result<RunRequest, ValidationError> {
    let log_range_minutes = match payload.log_range_minutes {
        None | Some(Value::Null) => DEFAULT_LOG_RANGE_MINUTES,
        Some(value) => parse_log_range_minutes(&value)?,
    };

    RunRequest::new(
        payload.db_cluster_identifier.unwrap_or_default(),
        payload.log_destination_bucket.unwrap_or_default(),
        log_range_minutes,
    )
}

fn parse_log_range_minutes(value: &Value) -> Result<u32, ValidationError> {
    let minutes = match value {
        Value::Number(number) => number
            .as_i64()
            .ok_or_else(|| ValidationError::new("LogRangeMinutes must be an integer"))?,
        Value::String(text) => text
            .trim()
            .parse::<i64>()
            .map_err(|_| ValidationError::new("LogRangeMinutes must be an integer"))?,
        _ => return Err(ValidationError::new("LogRangeMinutes must be an integer")),
    };

    if minutes <= 0 {
        return Err(ValidationError::new(
            "LogRangeMinutes must be greater than 0",
        ));
    }

    u32::try_from(minutes).map_err(|_| ValidationError::new("LogRangeMinutes is too large"))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn sample_item() -> WorkItem {
        WorkItem {
            descriptor: LogFileDescriptor {
                instance_identifier: "database-1-instance-1".to_string(),
                file_name: "error/postgresql.log.2026-10-19-0900".to_string(),
                last_written: DateTime::<Utc>::from_timestamp_millis(1_792_400_000_000)
                    .expect("timestamp should be valid"),
                size_bytes: 2048,
            },
            destination_bucket: "archive-bucket".to_string(),
            object_key: "database-1/database-1-instance-1/raw/2026/10/19/09/postgresql.log.2026-10-19-0900"
                .to_string(),
        }
    }

    #[test]
    fn parses_trigger_payload_with_exact_field_names() {
        let request: RunRequest = serde_json::from_value(json!({
            "DbClusterIdentifier": "database-1",
            "LogDestinationBucket": "archive-bucket",
            "LogRangeMinutes": 30
        }))
        .expect("payload should parse");

        assert_eq!(request.cluster_identifier(), "database-1");
        assert_eq!(request.destination_bucket(), "archive-bucket");
        assert_eq!(request.log_range_minutes(), 30);
    }

    #[test]
    fn accepts_log_range_as_numeric_string() {
        let payload = TriggerPayload {
            db_cluster_identifier: Some("database-1".to_string()),
            log_destination_bucket: Some("archive-bucket".to_string()),
            log_range_minutes: Some(json!(" 45 ")),
        };

        let request = normalize_request(payload).expect("request should pass");
        assert_eq!(request.log_range_minutes(), 45);
    }

    #[test]
    fn defaults_missing_log_range() {
        let payload = TriggerPayload {
            db_cluster_identifier: Some("database-1".to_string()),
            log_destination_bucket: Some("archive-bucket".to_string()),
            log_range_minutes: None,
        };

        let request = normalize_request(payload).expect("request should pass");
        assert_eq!(request.log_range_minutes(), DEFAULT_LOG_RANGE_MINUTES);
    }

    #[test]
    fn rejects_non_positive_log_range() {
        for value in [json!(0), json!(-5), json!("0")] {
            let payload = TriggerPayload {
                db_cluster_identifier: Some("database-1".to_string()),
                log_destination_bucket: Some("archive-bucket".to_string()),
                log_range_minutes: Some(value),
            };
            let error = normalize_request(payload).expect_err("request should fail");
            assert_eq!(error.message(), "LogRangeMinutes must be greater than 0");
        }
    }

    #[test]
    fn rejects_fractional_log_range() {
        let payload = TriggerPayload {
            db_cluster_identifier: Some("database-1".to_string()),
            log_destination_bucket: Some("archive-bucket".to_string()),
            log_range_minutes: Some(json!(1.5)),
        };
        let error = normalize_request(payload).expect_err("request should fail");
        assert_eq!(error.message(), "LogRangeMinutes must be an integer");
    }

    #[test]
    fn rejects_blank_cluster_identifier() {
        let error = serde_json::from_value::<RunRequest>(json!({
            "DbClusterIdentifier": "  ",
            "LogDestinationBucket": "archive-bucket",
        }))
        .expect_err("request should fail");

        assert!(error.to_string().contains("DbClusterIdentifier is required"));
    }

    #[test]
    fn request_serializes_back_to_trigger_shape() {
        let request = RunRequest::new("database-1", "archive-bucket", 30).expect("valid request");
        let value = serde_json::to_value(&request).expect("request should serialize");

        assert_eq!(
            value,
            json!({
                "DbClusterIdentifier": "database-1",
                "LogDestinationBucket": "archive-bucket",
                "LogRangeMinutes": 30
            })
        );
        assert_eq!(
            serde_json::to_value(request.to_payload()).expect("payload should serialize"),
            value
        );
    }

    #[test]
    fn work_item_payload_uses_wire_field_names() {
        let item = sample_item();
        let value =
            serde_json::to_value(WorkItemPayload::from(&item)).expect("payload should serialize");

        assert_eq!(value["DbInstanceIdentifier"], "database-1-instance-1");
        assert_eq!(value["LogDestinationBucket"], "archive-bucket");
        assert_eq!(value["LastWritten"], 1_792_400_000_000i64);
        assert_eq!(value["LogFileName"], "error/postgresql.log.2026-10-19-0900");
        assert_eq!(value["ObjectKey"], item.object_key.as_str());
    }

    #[test]
    fn work_item_payload_without_size_converts_back() {
        let payload: WorkItemPayload = serde_json::from_value(json!({
            "DbInstanceIdentifier": "database-1-instance-1",
            "LogDestinationBucket": "archive-bucket",
            "LastWritten": 1_792_400_000_000i64,
            "LogFileName": "error/postgresql.log.2026-10-19-0900",
            "ObjectKey": "database-1/database-1-instance-1/raw/2026/10/19/09/postgresql.log.2026-10-19-0900"
        }))
        .expect("payload should parse");

        let item = WorkItem::try_from(payload).expect("payload should convert");
        let expected = WorkItem {
            descriptor: LogFileDescriptor {
                size_bytes: 0,
                ..sample_item().descriptor
            },
            ..sample_item()
        };
        assert_eq!(item, expected);
    }

    #[test]
    fn work_item_payload_requires_object_key() {
        let mut payload = WorkItemPayload::from(&sample_item());
        payload.object_key = String::new();

        let error = WorkItem::try_from(payload).expect_err("payload should fail");
        assert_eq!(error.message(), "ObjectKey is required");
    }

    #[test]
    fn failed_outcome_serializes_class_and_message() {
        let outcome = ItemOutcome::failed(
            sample_item(),
            FailureReason::new("request_failed", "connection reset"),
        );
        let value = serde_json::to_value(&outcome).expect("outcome should serialize");

        assert_eq!(value["status"], "failed");
        assert_eq!(value["reason"]["class"], "request_failed");
        assert_eq!(value["bytes_transferred"], 0);
        assert!(value.get("content_sha256").is_none());
    }
}
