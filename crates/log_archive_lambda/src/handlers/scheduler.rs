use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log_archive_core::clock::Clock;
use log_archive_core::contract::RunRequest;
use log_archive_core::schedule::{DispatchPolicy, Schedule, Trigger};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::pipeline::{run_pipeline, PipelineDependencies};
use crate::adapters::invoke::RunDispatcher;
use crate::adapters::AdapterError;
use crate::config::{ArchiveConfig, SchedulerConfig};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Delivered { attempts: u32 },
    Dropped { attempts: u32, reason: String },
}

/// Delivers `request` at most once: failed attempts are retried only while
/// the policy allows, after which the event is dropped.
pub async fn dispatch_with_policy(
    dispatcher: &dyn RunDispatcher,
    request: &RunRequest,
    policy: &DispatchPolicy,
) -> DispatchOutcome {
    let fired_at = Instant::now();
    let mut attempts = 0;

    loop {
        attempts += 1;
        let error = match dispatcher.dispatch(request).await {
            Ok(()) => return DispatchOutcome::Delivered { attempts },
            Err(error) => error,
        };

        let event_age = fired_at.elapsed();
        if !policy.allows_retry(attempts, event_age) {
            warn!(
                cluster = request.cluster_identifier(),
                attempts,
                event_age_ms = event_age.as_millis() as u64,
                error = %error,
                "dispatch failed; dropping run request"
            );
            return DispatchOutcome::Dropped {
                attempts,
                reason: error.to_string(),
            };
        }

        warn!(
            cluster = request.cluster_identifier(),
            attempts,
            error = %error,
            "dispatch failed; retrying"
        );
        tokio::time::sleep(policy.retry_delay()).await;
    }
}

/// Runs the pipeline inside the scheduler process. The dispatch completes
/// when the run does, so runs never overlap.
pub struct InProcessDispatcher {
    deps: PipelineDependencies,
    config: ArchiveConfig,
}

impl InProcessDispatcher {
    pub fn new(deps: PipelineDependencies, config: ArchiveConfig) -> Self {
        Self { deps, config }
    }
}

#[async_trait]
impl RunDispatcher for InProcessDispatcher {
    async fn dispatch(&self, request: &RunRequest) -> Result<(), AdapterError> {
        run_pipeline(request.clone(), &self.deps, &self.config)
            .await
            .map(|_| ())
            .map_err(|error| AdapterError::request_failed("RunPipeline", error))
    }
}

pub struct Scheduler {
    schedule: Schedule,
    trigger: Trigger,
    policy: DispatchPolicy,
    dispatcher: Arc<dyn RunDispatcher>,
    clock: Arc<dyn Clock>,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        dispatcher: Arc<dyn RunDispatcher>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            schedule: config.schedule,
            trigger: config.trigger,
            policy: config.dispatch_policy,
            dispatcher,
            clock,
        }
    }

    /// Fires the trigger once and dispatches the request.
    pub async fn fire_once(&self) -> DispatchOutcome {
        let request = self.trigger.fire();
        info!(
            cluster = request.cluster_identifier(),
            bucket = request.destination_bucket(),
            log_range_minutes = request.log_range_minutes(),
            "trigger fired"
        );
        dispatch_with_policy(self.dispatcher.as_ref(), &request, &self.policy).await
    }

    /// Fires at every scheduled instant until `shutdown` resolves or the
    /// schedule has no future instants. Returns the number of firings.
    ///
    /// The next instant is always computed from the clock, so instants that
    /// pass while a dispatch is running are skipped.
    pub async fn run(&self, shutdown: impl Future<Output = ()>) -> usize {
        tokio::pin!(shutdown);
        let mut last_fire: Option<DateTime<Utc>> = None;
        let mut fired = 0;

        loop {
            let now = self.clock.now();
            let reference = last_fire.map_or(now, |last| last.max(now));
            let Some(next_fire) = self.schedule.next_after(reference) else {
                info!(schedule = %self.schedule.expression(), "schedule has no future fire times");
                return fired;
            };
            let wait = (next_fire - now).to_std().unwrap_or_default();
            debug!(
                next_fire = %next_fire,
                wait_ms = wait.as_millis() as u64,
                "waiting for next fire"
            );

            tokio::select! {
                _ = &mut shutdown => {
                    info!(fired, "scheduler stopping");
                    return fired;
                }
                _ = tokio::time::sleep(wait) => {}
            }

            last_fire = Some(next_fire);
            fired += 1;
            if let DispatchOutcome::Dropped { attempts, .. } = self.fire_once().await {
                warn!(scheduled_at = %next_fire, attempts, "scheduled run dropped");
            }
        }
    }
}
