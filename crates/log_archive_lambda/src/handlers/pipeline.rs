use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log_archive_core::aggregate::{aggregate, RunResult};
use log_archive_core::clock::Clock;
use log_archive_core::contract::{
    normalize_request, DiscoveryWarning, RunRequest, TriggerPayload, ValidationError, WorkItem,
    WorkItemPayload,
};
use log_archive_core::planning::{plan_work_items, WorkPlan};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::time::{timeout_at, Instant};
use tracing::{info, warn};

use super::discovery::{discover, DiscoveryResponse};
use super::fan_out::FanOutExecutor;
use super::upload::{UploadStage, Uploader};
use crate::adapters::log_source::LogSource;
use crate::adapters::object_store::ObjectStore;
use crate::config::ArchiveConfig;

/// Fatal errors: the run is rejected before discovery starts.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("malformed trigger payload: {0}")]
    MalformedPayload(#[from] serde_json::Error),
    #[error("invalid run request: {0}")]
    InvalidRequest(#[from] ValidationError),
    #[error("invalid pipeline configuration: {0}")]
    InvalidConfiguration(#[source] ValidationError),
}

#[derive(Clone)]
pub struct PipelineDependencies {
    pub log_source: Arc<dyn LogSource>,
    pub object_store: Arc<dyn ObjectStore>,
    pub clock: Arc<dyn Clock>,
}

/// Discovery and planning output, ready for fan-out.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreparedRun {
    pub plan: WorkPlan,
    pub warnings: Vec<DiscoveryWarning>,
}

impl From<PreparedRun> for DiscoveryResponse {
    fn from(prepared: PreparedRun) -> Self {
        Self {
            work_items: prepared
                .plan
                .items
                .iter()
                .map(WorkItemPayload::from)
                .collect(),
            skipped: prepared.plan.skipped,
            warnings: prepared.warnings,
        }
    }
}

pub fn parse_trigger_event(event: Value) -> Result<RunRequest, PipelineError> {
    let payload: TriggerPayload = serde_json::from_value(event)?;
    Ok(normalize_request(payload)?)
}

/// Discovers candidate files in the window ending at `now` and plans one
/// work item per file.
///
/// Existence checks, when enabled, run under the same concurrency bound as
/// uploads and stop at `deadline`; unchecked items stay planned.
pub async fn prepare_run(
    request: &RunRequest,
    deps: &PipelineDependencies,
    config: &ArchiveConfig,
    now: DateTime<Utc>,
    deadline: Option<Instant>,
) -> PreparedRun {
    let report = discover(request, Arc::clone(&deps.log_source), now).await;
    let mut plan = plan_work_items(request, report.descriptors, &config.plan_options());

    if config.skip_existing_objects {
        let existing = existing_keys(
            &plan.items,
            Arc::clone(&deps.object_store),
            config.max_concurrency,
            deadline,
        )
        .await;
        plan.skip_archived(&existing);
    }

    info!(
        cluster = request.cluster_identifier(),
        planned = plan.items.len(),
        skipped = plan.skipped.len(),
        "run planned"
    );
    PreparedRun {
        plan,
        warnings: report.warnings,
    }
}

async fn existing_keys(
    items: &[WorkItem],
    store: Arc<dyn ObjectStore>,
    max_concurrency: usize,
    deadline: Option<Instant>,
) -> HashSet<String> {
    let semaphore = Arc::new(Semaphore::new(max_concurrency.max(1)));
    let checks = items
        .iter()
        .map(|item| {
            let store = Arc::clone(&store);
            let semaphore = Arc::clone(&semaphore);
            let bucket = item.destination_bucket.clone();
            let key = item.object_key.clone();
            tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let exists = store.object_exists(&bucket, &key).await;
                (key, exists)
            })
        })
        .collect::<Vec<_>>();

    let mut existing = HashSet::new();
    let mut expired = false;
    for mut check in checks {
        let joined = match deadline {
            Some(deadline) if !expired => match timeout_at(deadline, &mut check).await {
                Ok(joined) => Some(joined),
                Err(_) => {
                    expired = true;
                    None
                }
            },
            _ if expired && !check.is_finished() => None,
            _ => Some((&mut check).await),
        };

        match joined {
            Some(Ok((key, Ok(true)))) => {
                existing.insert(key);
            }
            Some(Ok((_, Ok(false)))) => {}
            // Uploading again only overwrites the same key.
            Some(Ok((key, Err(error)))) => warn!(
                object_key = %key,
                error = %error,
                "existence check failed; uploading anyway"
            ),
            Some(Err(join_error)) => warn!(
                error = %join_error,
                "existence check task failed; uploading anyway"
            ),
            None => check.abort(),
        }
    }

    if expired {
        warn!(
            checked = existing.len(),
            "run deadline exceeded during existence checks"
        );
    }
    existing
}

/// Runs discovery, planning, fan-out and aggregation for one request.
pub async fn run_pipeline(
    request: RunRequest,
    deps: &PipelineDependencies,
    config: &ArchiveConfig,
) -> Result<RunResult, PipelineError> {
    let executor =
        FanOutExecutor::new(config.max_concurrency).map_err(PipelineError::InvalidConfiguration)?;
    let deadline = Instant::now() + config.run_deadline;
    let started_at = deps.clock.now();

    info!(
        cluster = request.cluster_identifier(),
        bucket = request.destination_bucket(),
        log_range_minutes = request.log_range_minutes(),
        "run started"
    );

    let prepared = prepare_run(&request, deps, config, started_at, Some(deadline)).await;
    let stage: Arc<dyn UploadStage> = Arc::new(Uploader::new(
        Arc::clone(&deps.log_source),
        Arc::clone(&deps.object_store),
        config.spool_threshold_bytes,
    ));
    let outcomes = executor
        .run(prepared.plan.items, stage, Some(deadline))
        .await;
    let finished_at = deps.clock.now();

    let result = aggregate(request, outcomes, started_at, finished_at)
        .with_discovery_report(prepared.warnings, prepared.plan.skipped);
    log_run_summary(&result);
    Ok(result)
}

pub async fn handle_trigger_event(
    event: Value,
    deps: &PipelineDependencies,
    config: &ArchiveConfig,
) -> Result<RunResult, PipelineError> {
    let request = parse_trigger_event(event)?;
    run_pipeline(request, deps, config).await
}

fn log_run_summary(result: &RunResult) {
    let summary = result.summary();
    let duration_ms = (result.finished_at - result.started_at).num_milliseconds();

    if result.is_clean() {
        info!(
            cluster = result.request.cluster_identifier(),
            total = summary.total,
            succeeded = summary.succeeded,
            skipped = summary.skipped,
            bytes_transferred = summary.bytes_transferred,
            duration_ms,
            "run finished"
        );
        return;
    }

    for (outcome, reason) in result.failures() {
        warn!(
            instance = %outcome.work_item.descriptor.instance_identifier,
            file = %outcome.work_item.descriptor.file_name,
            error_class = %reason.class,
            error = %reason.message,
            "item failed"
        );
    }
    warn!(
        cluster = result.request.cluster_identifier(),
        total = summary.total,
        succeeded = summary.succeeded,
        failed = summary.failed,
        timed_out = summary.timed_out,
        skipped = summary.skipped,
        discovery_warnings = result.discovery_warnings.len(),
        bytes_transferred = summary.bytes_transferred,
        duration_ms,
        "run finished with failures"
    );
}
