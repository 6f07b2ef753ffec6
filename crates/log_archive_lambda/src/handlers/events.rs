use log_archive_core::contract::{ValidationError, WorkItem, WorkItemPayload};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EventError {
    #[error("SQS event must include Records array")]
    MissingRecords,
    #[error("SQS record body must be a string")]
    NonStringBody,
    #[error("invalid work item payload: {0}")]
    MalformedPayload(#[from] serde_json::Error),
    #[error("invalid work item: {0}")]
    InvalidItem(#[from] ValidationError),
}

/// Input accepted by the standalone upload function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadEvent {
    /// One work item payload, as sent by a workflow map step.
    Single(WorkItem),
    /// A JSON array of payloads or an SQS batch.
    Batch(Vec<WorkItem>),
}

pub fn decode_upload_event(event: Value) -> Result<UploadEvent, EventError> {
    if is_sqs_event(&event) {
        return decode_sqs_work_items(&event).map(UploadEvent::Batch);
    }

    match event {
        Value::Array(values) => values
            .into_iter()
            .map(decode_work_item)
            .collect::<Result<Vec<_>, _>>()
            .map(UploadEvent::Batch),
        value => decode_work_item(value).map(UploadEvent::Single),
    }
}

pub fn is_sqs_event(event: &Value) -> bool {
    event
        .get("Records")
        .and_then(Value::as_array)
        .map(|records| {
            !records.is_empty()
                && records.iter().all(|record| {
                    record
                        .get("eventSource")
                        .and_then(Value::as_str)
                        .map(|source| source == "aws:sqs")
                        .unwrap_or(false)
                })
        })
        .unwrap_or(false)
}

fn decode_sqs_work_items(event: &Value) -> Result<Vec<WorkItem>, EventError> {
    let records = event
        .get("Records")
        .and_then(Value::as_array)
        .ok_or(EventError::MissingRecords)?;

    records
        .iter()
        .map(|record| {
            let body = record
                .get("body")
                .and_then(Value::as_str)
                .ok_or(EventError::NonStringBody)?;
            let payload: WorkItemPayload = serde_json::from_str(body)?;
            Ok(WorkItem::try_from(payload)?)
        })
        .collect()
}

fn decode_work_item(value: Value) -> Result<WorkItem, EventError> {
    let payload: WorkItemPayload = serde_json::from_value(value)?;
    Ok(WorkItem::try_from(payload)?)
}
