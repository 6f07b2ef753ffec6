use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::contract::{LogFileDescriptor, RunRequest, WorkItem};
use crate::storage_keys::log_object_key;

pub const DEFAULT_FILE_NAME_FILTER: &str = "postgresql.log";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanOptions {
    /// Only plan files whose name contains this fragment.
    pub file_name_contains: Option<String>,
    /// Skip the most recently written file of each instance.
    pub exclude_active_file: bool,
    pub compression_enabled: bool,
}

impl Default for PlanOptions {
    fn default() -> Self {
        Self {
            file_name_contains: Some(DEFAULT_FILE_NAME_FILTER.to_string()),
            exclude_active_file: true,
            compression_enabled: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    NameFilter,
    ActiveFile,
    NoRotationStamp,
    DuplicateKey,
    AlreadyArchived,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SkippedFile {
    pub descriptor: LogFileDescriptor,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkPlan {
    pub items: Vec<WorkItem>,
    pub skipped: Vec<SkippedFile>,
}

impl WorkPlan {
    /// Moves every item whose key is in `existing_keys` to the skipped list.
    pub fn skip_archived(&mut self, existing_keys: &HashSet<String>) {
        if existing_keys.is_empty() {
            return;
        }

        let (archived, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.items)
            .into_iter()
            .partition(|item| existing_keys.contains(&item.object_key));

        self.items = pending;
        self.skipped
            .extend(archived.into_iter().map(|item| SkippedFile {
                descriptor: item.descriptor,
                reason: SkipReason::AlreadyArchived,
            }));
    }
}

/// Turns discovered descriptors into work items with deterministic keys.
///
/// Descriptors are de-duplicated by `(instance, file name)`; two files that
/// would land on the same key keep the first one seen.
pub fn plan_work_items(
    request: &RunRequest,
    descriptors: Vec<LogFileDescriptor>,
    options: &PlanOptions,
) -> WorkPlan {
    let mut plan = WorkPlan::default();
    let mut seen_files = HashSet::new();

    let candidates = descriptors
        .into_iter()
        .filter(|descriptor| {
            seen_files.insert((
                descriptor.instance_identifier.clone(),
                descriptor.file_name.clone(),
            ))
        })
        .filter_map(|descriptor| {
            let name_matches = match options.file_name_contains.as_deref() {
                Some(fragment) if !fragment.is_empty() => descriptor.file_name.contains(fragment),
                _ => true,
            };
            if name_matches {
                Some(descriptor)
            } else {
                plan.skipped.push(SkippedFile {
                    descriptor,
                    reason: SkipReason::NameFilter,
                });
                None
            }
        })
        .collect::<Vec<_>>();

    let latest_by_instance = if options.exclude_active_file {
        latest_written_by_instance(&candidates)
    } else {
        BTreeMap::new()
    };

    let mut seen_keys = HashSet::new();
    for descriptor in candidates {
        if latest_by_instance.get(descriptor.instance_identifier.as_str())
            == Some(&descriptor.last_written)
        {
            plan.skipped.push(SkippedFile {
                descriptor,
                reason: SkipReason::ActiveFile,
            });
            continue;
        }

        let Some(object_key) = log_object_key(
            request.cluster_identifier(),
            &descriptor.instance_identifier,
            &descriptor.file_name,
            options.compression_enabled,
        ) else {
            plan.skipped.push(SkippedFile {
                descriptor,
                reason: SkipReason::NoRotationStamp,
            });
            continue;
        };

        if !seen_keys.insert(object_key.clone()) {
            plan.skipped.push(SkippedFile {
                descriptor,
                reason: SkipReason::DuplicateKey,
            });
            continue;
        }

        plan.items.push(WorkItem {
            descriptor,
            destination_bucket: request.destination_bucket().to_string(),
            object_key,
        });
    }

    plan
}

fn latest_written_by_instance(
    descriptors: &[LogFileDescriptor],
) -> BTreeMap<String, DateTime<Utc>> {
    let mut latest = BTreeMap::new();
    for descriptor in descriptors {
        latest
            .entry(descriptor.instance_identifier.clone())
            .and_modify(|current: &mut DateTime<Utc>| {
                if descriptor.last_written > *current {
                    *current = descriptor.last_written;
                }
            })
            .or_insert(descriptor.last_written);
    }
    latest
}
