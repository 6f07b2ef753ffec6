use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::contract::{DiscoveryWarning, FailureReason, ItemOutcome, RunRequest};
use crate::planning::SkippedFile;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunResult {
    pub request: RunRequest,
    pub outcomes: Vec<ItemOutcome>,
    #[serde(default)]
    pub skipped: Vec<SkippedFile>,
    #[serde(default)]
    pub discovery_warnings: Vec<DiscoveryWarning>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub skipped: usize,
    pub bytes_transferred: u64,
}

/// Combines per-item outcomes into a run result. Never fails: a run where
/// every item failed is still a well-formed result.
pub fn aggregate(
    request: RunRequest,
    outcomes: Vec<ItemOutcome>,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
) -> RunResult {
    RunResult {
        request,
        outcomes,
        skipped: Vec::new(),
        discovery_warnings: Vec::new(),
        started_at,
        finished_at,
    }
}

impl RunResult {
    pub fn with_discovery_report(
        mut self,
        discovery_warnings: Vec<DiscoveryWarning>,
        skipped: Vec<SkippedFile>,
    ) -> Self {
        self.discovery_warnings = discovery_warnings;
        self.skipped = skipped;
        self
    }

    pub fn summary(&self) -> RunSummary {
        self.outcomes.iter().fold(
            RunSummary {
                total: self.outcomes.len(),
                skipped: self.skipped.len(),
                ..RunSummary::default()
            },
            |mut summary, outcome| {
                match outcome.failure() {
                    None => summary.succeeded += 1,
                    Some(reason) => {
                        summary.failed += 1;
                        if reason.is_timeout() {
                            summary.timed_out += 1;
                        }
                    }
                }
                summary.bytes_transferred += outcome.bytes_transferred;
                summary
            },
        )
    }

    pub fn failures(&self) -> impl Iterator<Item = (&ItemOutcome, &FailureReason)> {
        self.outcomes
            .iter()
            .filter_map(|outcome| outcome.failure().map(|reason| (outcome, reason)))
    }

    /// True when every item succeeded and discovery saw every instance.
    pub fn is_clean(&self) -> bool {
        self.discovery_warnings.is_empty() && self.failures().next().is_none()
    }
}
