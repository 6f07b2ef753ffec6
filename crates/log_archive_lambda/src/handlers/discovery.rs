use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use log_archive_core::contract::{
    DiscoveryWarning, LogFileDescriptor, RunRequest, WorkItemPayload,
};
use log_archive_core::planning::SkippedFile;
use log_archive_core::window::{select_recent, TrailingWindow};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::adapters::log_source::LogSource;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryReport {
    pub descriptors: Vec<LogFileDescriptor>,
    pub warnings: Vec<DiscoveryWarning>,
}

/// Response of the standalone discovery function: one payload per planned
/// upload plus what was left out and why.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiscoveryResponse {
    #[serde(rename = "WorkItems")]
    pub work_items: Vec<WorkItemPayload>,
    #[serde(rename = "Skipped", default)]
    pub skipped: Vec<SkippedFile>,
    #[serde(rename = "Warnings", default)]
    pub warnings: Vec<DiscoveryWarning>,
}

/// Lists the log files each cluster instance wrote inside the trailing window
/// ending at `now`.
///
/// Instances are listed concurrently. A cluster or instance that cannot be
/// read becomes a warning; the files of every other instance are still
/// returned.
pub async fn discover(
    request: &RunRequest,
    source: Arc<dyn LogSource>,
    now: DateTime<Utc>,
) -> DiscoveryReport {
    let started_at = Instant::now();
    let cluster = request.cluster_identifier();
    let window = TrailingWindow::ending_at(now, request.log_range_minutes());

    let instances = match source.list_instances(cluster).await {
        Ok(instances) => instances,
        Err(error) => {
            warn!(cluster, error = %error, "failed to resolve cluster instances");
            return DiscoveryReport {
                descriptors: Vec::new(),
                warnings: vec![DiscoveryWarning {
                    instance_identifier: None,
                    message: format!("failed to resolve instances of {cluster}: {error}"),
                }],
            };
        }
    };

    let handles = instances
        .into_iter()
        .map(|instance| {
            let source = Arc::clone(&source);
            let task_instance = instance.clone();
            let handle =
                tokio::spawn(async move { source.list_log_files(&task_instance).await });
            (instance, handle)
        })
        .collect::<Vec<_>>();
    let instance_count = handles.len();

    let mut report = DiscoveryReport::default();
    for (instance, handle) in handles {
        let message = match handle.await {
            Ok(Ok(entries)) => {
                let listed = entries.len();
                let selected = select_recent(&instance, entries, &window);
                debug!(
                    cluster,
                    instance = %instance,
                    listed,
                    selected = selected.len(),
                    "listed instance log files"
                );
                report.descriptors.extend(selected);
                continue;
            }
            Ok(Err(error)) => error.to_string(),
            Err(join_error) => format!("discovery task failed: {join_error}"),
        };

        warn!(cluster, instance = %instance, error = %message, "instance discovery failed");
        report.warnings.push(DiscoveryWarning {
            instance_identifier: Some(instance),
            message,
        });
    }

    info!(
        cluster,
        instances = instance_count,
        descriptors = report.descriptors.len(),
        warnings = report.warnings.len(),
        window_start = %window.start(),
        window_end = %window.end(),
        duration_ms = started_at.elapsed().as_millis() as u64,
        "discovery finished"
    );
    report
}
