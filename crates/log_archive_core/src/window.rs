use chrono::{DateTime, Duration, Utc};

use crate::contract::{LogFileDescriptor, LogFileEntry};

/// `[end - range, end]`, both bounds inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrailingWindow {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl TrailingWindow {
    pub fn ending_at(end: DateTime<Utc>, range_minutes: u32) -> Self {
        Self {
            start: end - Duration::minutes(i64::from(range_minutes)),
            end,
        }
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }

    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        instant >= self.start && instant <= self.end
    }
}

/// Keeps the entries last written inside `window` and tags them with their
/// owning instance.
pub fn select_recent(
    instance_identifier: &str,
    entries: Vec<LogFileEntry>,
    window: &TrailingWindow,
) -> Vec<LogFileDescriptor> {
    entries
        .into_iter()
        .filter(|entry| window.contains(entry.last_written))
        .map(|entry| LogFileDescriptor::from_entry(instance_identifier, entry))
        .collect()
}
