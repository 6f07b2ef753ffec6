//! Deployment-time configuration read from environment variables.

use std::str::FromStr;
use std::time::Duration;

use log_archive_core::contract::{RunRequest, ValidationError};
use log_archive_core::planning::{PlanOptions, DEFAULT_FILE_NAME_FILTER};
use log_archive_core::schedule::{
    parse_utc_offset, DispatchPolicy, Schedule, ScheduleExpression, Trigger,
    DEFAULT_RETRY_DELAY, DEFAULT_SCHEDULE_EXPRESSION, DEFAULT_UTC_OFFSET,
};
use thiserror::Error;

pub const DEFAULT_MAX_CONCURRENCY: usize = 30;
pub const DEFAULT_SPOOL_THRESHOLD_BYTES: u64 = 8 * 1024 * 1024;
pub const DEFAULT_RUN_DEADLINE: Duration = Duration::from_secs(840);
pub const DEFAULT_SCHEDULED_LOG_RANGE_MINUTES: u32 = 30;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{name} must be configured")]
    Missing { name: &'static str },
    #[error("{name} has invalid value '{value}': {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

impl ConfigError {
    fn invalid(name: &'static str, value: &str, reason: impl std::fmt::Display) -> Self {
        Self::Invalid {
            name,
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Settings shared by every stage of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveConfig {
    pub max_concurrency: usize,
    pub compression_enabled: bool,
    pub spool_threshold_bytes: u64,
    pub run_deadline: Duration,
    pub file_name_contains: Option<String>,
    pub exclude_active_file: bool,
    pub skip_existing_objects: bool,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            compression_enabled: false,
            spool_threshold_bytes: DEFAULT_SPOOL_THRESHOLD_BYTES,
            run_deadline: DEFAULT_RUN_DEADLINE,
            file_name_contains: Some(DEFAULT_FILE_NAME_FILTER.to_string()),
            exclude_active_file: true,
            skip_existing_objects: false,
        }
    }
}

impl ArchiveConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let max_concurrency = parse_or("MAX_CONCURRENCY", &lookup, defaults.max_concurrency)?;
        if max_concurrency == 0 {
            return Err(ConfigError::invalid(
                "MAX_CONCURRENCY",
                "0",
                "must be greater than 0",
            ));
        }

        let run_deadline_seconds = parse_or(
            "RUN_DEADLINE_SECONDS",
            &lookup,
            defaults.run_deadline.as_secs(),
        )?;
        if run_deadline_seconds == 0 {
            return Err(ConfigError::invalid(
                "RUN_DEADLINE_SECONDS",
                "0",
                "must be greater than 0",
            ));
        }

        // An explicitly empty filter disables name filtering.
        let file_name_contains = match lookup("LOG_FILE_NAME_CONTAINS") {
            Some(value) if value.trim().is_empty() => None,
            Some(value) => Some(value.trim().to_string()),
            None => defaults.file_name_contains,
        };

        Ok(Self {
            max_concurrency,
            compression_enabled: parse_flag(
                "ENABLE_COMPRESSION",
                &lookup,
                defaults.compression_enabled,
            )?,
            spool_threshold_bytes: parse_or(
                "SPOOL_THRESHOLD_BYTES",
                &lookup,
                defaults.spool_threshold_bytes,
            )?,
            run_deadline: Duration::from_secs(run_deadline_seconds),
            file_name_contains,
            exclude_active_file: parse_flag(
                "EXCLUDE_ACTIVE_LOG_FILE",
                &lookup,
                defaults.exclude_active_file,
            )?,
            skip_existing_objects: parse_flag(
                "SKIP_EXISTING_OBJECTS",
                &lookup,
                defaults.skip_existing_objects,
            )?,
        })
    }

    pub fn plan_options(&self) -> PlanOptions {
        PlanOptions {
            file_name_contains: self.file_name_contains.clone(),
            exclude_active_file: self.exclude_active_file,
            compression_enabled: self.compression_enabled,
        }
    }
}

/// Settings for the schedule daemon.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub schedule: Schedule,
    pub trigger: Trigger,
    pub dispatch_policy: DispatchPolicy,
    pub pipeline_function_arn: Option<String>,
}

impl SchedulerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let expression_text = lookup("SCHEDULE_EXPRESSION")
            .unwrap_or_else(|| DEFAULT_SCHEDULE_EXPRESSION.to_string());
        let expression = expression_text
            .parse::<ScheduleExpression>()
            .map_err(|error| ConfigError::invalid("SCHEDULE_EXPRESSION", &expression_text, error))?;

        let offset_text =
            lookup("SCHEDULE_UTC_OFFSET").unwrap_or_else(|| DEFAULT_UTC_OFFSET.to_string());
        let offset = parse_utc_offset(&offset_text)
            .map_err(|error| ConfigError::invalid("SCHEDULE_UTC_OFFSET", &offset_text, error))?;

        let cluster = require("DB_CLUSTER_IDENTIFIER", &lookup)?;
        let bucket = require("LOG_DESTINATION_BUCKET", &lookup)?;
        let log_range_minutes = parse_or(
            "LOG_RANGE_MINUTES",
            &lookup,
            DEFAULT_SCHEDULED_LOG_RANGE_MINUTES,
        )?;
        let template = RunRequest::new(cluster, bucket, log_range_minutes)
            .map_err(|error| request_error(&lookup, error))?;

        let max_retry_attempts = parse_or("DISPATCH_MAX_RETRY_ATTEMPTS", &lookup, 0u8)?;
        let max_event_age_seconds = parse_or(
            "DISPATCH_MAX_EVENT_AGE_SECONDS",
            &lookup,
            DispatchPolicy::default().max_event_age().as_secs(),
        )?;
        let dispatch_policy = DispatchPolicy::new(
            max_retry_attempts,
            Duration::from_secs(max_event_age_seconds),
            DEFAULT_RETRY_DELAY,
        )
        .map_err(|error| {
            ConfigError::invalid(
                "DISPATCH_MAX_RETRY_ATTEMPTS",
                &max_retry_attempts.to_string(),
                error,
            )
        })?;

        Ok(Self {
            schedule: Schedule::new(expression, offset),
            trigger: Trigger::new(template),
            dispatch_policy,
            pipeline_function_arn: lookup("PIPELINE_FUNCTION_ARN")
                .filter(|value| !value.trim().is_empty()),
        })
    }
}

fn request_error(lookup: &impl Fn(&str) -> Option<String>, error: ValidationError) -> ConfigError {
    let value = lookup("LOG_RANGE_MINUTES").unwrap_or_default();
    ConfigError::invalid("LOG_RANGE_MINUTES", &value, error)
}

fn require(
    name: &'static str,
    lookup: &impl Fn(&str) -> Option<String>,
) -> Result<String, ConfigError> {
    lookup(name)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .ok_or(ConfigError::Missing { name })
}

fn parse_or<T>(
    name: &'static str,
    lookup: &impl Fn(&str) -> Option<String>,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        None => Ok(default),
        Some(value) if value.trim().is_empty() => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|error| ConfigError::invalid(name, &value, error)),
    }
}

fn parse_flag(
    name: &'static str,
    lookup: &impl Fn(&str) -> Option<String>,
    default: bool,
) -> Result<bool, ConfigError> {
    let Some(value) = lookup(name) else {
        return Ok(default);
    };
    match value.trim().to_ascii_lowercase().as_str() {
        "" => Ok(default),
        "false" | "0" | "no" | "off" => Ok(false),
        "true" | "1" | "yes" | "on" => Ok(true),
        _ => Err(ConfigError::invalid(name, &value, "expected true or false")),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let values = pairs
            .iter()
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect::<HashMap<_, _>>();
        move |name| values.get(name).cloned()
    }

    #[test]
    fn archive_defaults_apply_when_unset() {
        let config = ArchiveConfig::from_lookup(lookup_from(&[])).expect("defaults are valid");
        assert_eq!(config, ArchiveConfig::default());
        assert_eq!(config.max_concurrency, 30);
        assert!(config.exclude_active_file);
        assert_eq!(config.plan_options(), PlanOptions::default());
    }

    #[test]
    fn archive_reads_overrides() {
        let config = ArchiveConfig::from_lookup(lookup_from(&[
            ("MAX_CONCURRENCY", "4"),
            ("ENABLE_COMPRESSION", "TRUE"),
            ("SPOOL_THRESHOLD_BYTES", "1024"),
            ("RUN_DEADLINE_SECONDS", "60"),
            ("LOG_FILE_NAME_CONTAINS", ""),
            ("EXCLUDE_ACTIVE_LOG_FILE", "off"),
        ]))
        .expect("overrides are valid");

        assert_eq!(config.max_concurrency, 4);
        assert!(config.compression_enabled);
        assert_eq!(config.spool_threshold_bytes, 1024);
        assert_eq!(config.run_deadline, Duration::from_secs(60));
        assert_eq!(config.file_name_contains, None);
        assert!(!config.exclude_active_file);
        assert!(!config.skip_existing_objects);
    }

    #[test]
    fn archive_rejects_zero_concurrency_and_bad_flags() {
        let error = ArchiveConfig::from_lookup(lookup_from(&[("MAX_CONCURRENCY", "0")]))
            .expect_err("zero concurrency should fail");
        assert!(error.to_string().contains("MAX_CONCURRENCY"));

        let error = ArchiveConfig::from_lookup(lookup_from(&[("ENABLE_COMPRESSION", "maybe")]))
            .expect_err("unknown flag should fail");
        assert!(error.to_string().contains("ENABLE_COMPRESSION"));
    }

    #[test]
    fn scheduler_requires_request_fields() {
        let error = SchedulerConfig::from_lookup(lookup_from(&[(
            "LOG_DESTINATION_BUCKET",
            "archive-bucket",
        )]))
        .expect_err("cluster is required");

        assert!(matches!(
            error,
            ConfigError::Missing {
                name: "DB_CLUSTER_IDENTIFIER"
            }
        ));
    }

    #[test]
    fn scheduler_builds_trigger_and_policy() {
        let config = SchedulerConfig::from_lookup(lookup_from(&[
            ("DB_CLUSTER_IDENTIFIER", "database-1"),
            ("LOG_DESTINATION_BUCKET", "archive-bucket"),
            ("DISPATCH_MAX_RETRY_ATTEMPTS", "1"),
        ]))
        .expect("scheduler config is valid");

        let request = config.trigger.fire();
        assert_eq!(request.cluster_identifier(), "database-1");
        assert_eq!(request.log_range_minutes(), 30);
        assert_eq!(config.schedule.expression().as_str(), DEFAULT_SCHEDULE_EXPRESSION);
        assert_eq!(config.schedule.offset().local_minus_utc(), 9 * 3600);
        assert_eq!(config.dispatch_policy.max_attempts(), 2);
        assert_eq!(config.pipeline_function_arn, None);
    }

    #[test]
    fn scheduler_rejects_invalid_schedule_and_range() {
        let base = [
            ("DB_CLUSTER_IDENTIFIER", "database-1"),
            ("LOG_DESTINATION_BUCKET", "archive-bucket"),
        ];

        let mut bad_schedule = base.to_vec();
        bad_schedule.push(("SCHEDULE_EXPRESSION", "hourly"));
        assert!(SchedulerConfig::from_lookup(lookup_from(&bad_schedule)).is_err());

        let mut huge_rate = base.to_vec();
        huge_rate.push(("SCHEDULE_EXPRESSION", "rate(9999999999999 days)"));
        let error = SchedulerConfig::from_lookup(lookup_from(&huge_rate))
            .expect_err("oversized rate should fail");
        assert!(error.to_string().contains("SCHEDULE_EXPRESSION"));

        let mut bad_range = base.to_vec();
        bad_range.push(("LOG_RANGE_MINUTES", "0"));
        let error = SchedulerConfig::from_lookup(lookup_from(&bad_range))
            .expect_err("zero range should fail");
        assert!(error.to_string().contains("LOG_RANGE_MINUTES"));

        let mut bad_retries = base.to_vec();
        bad_retries.push(("DISPATCH_MAX_RETRY_ATTEMPTS", "3"));
        assert!(SchedulerConfig::from_lookup(lookup_from(&bad_retries)).is_err());
    }
}
