use std::any::Any;
use std::sync::Arc;

use log_archive_core::contract::{
    FailureReason, ItemOutcome, ValidationError, WorkItem, FAILURE_CLASS_PANIC,
};
use tokio::sync::Semaphore;
use tokio::task::JoinError;
use tokio::time::{timeout_at, Instant};
use tracing::{error, info, warn};

use super::upload::UploadStage;

/// Runs the upload stage once per work item with at most `max_concurrency`
/// uploads active at a time, and waits for every item to reach an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FanOutExecutor {
    max_concurrency: usize,
}

impl FanOutExecutor {
    pub fn new(max_concurrency: usize) -> Result<Self, ValidationError> {
        if max_concurrency == 0 {
            return Err(ValidationError::new(
                "max concurrency must be greater than 0",
            ));
        }
        Ok(Self { max_concurrency })
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Returns one outcome per item, in submission order.
    ///
    /// A panicking upload becomes a `panic` failure for its item only. Items
    /// without an outcome when `deadline` passes are aborted and recorded as
    /// `timeout` failures.
    pub async fn run(
        &self,
        items: Vec<WorkItem>,
        stage: Arc<dyn UploadStage>,
        deadline: Option<Instant>,
    ) -> Vec<ItemOutcome> {
        if items.is_empty() {
            return Vec::new();
        }

        let item_count = items.len();
        info!(
            items = item_count,
            max_concurrency = self.max_concurrency,
            "fan-out started"
        );

        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
        let pending = items
            .into_iter()
            .map(|item| {
                let stage = Arc::clone(&stage);
                let semaphore = Arc::clone(&semaphore);
                let task_item = item.clone();
                let handle = tokio::spawn(async move {
                    let _permit = semaphore.acquire_owned().await;
                    stage.upload(task_item).await
                });
                (item, handle)
            })
            .collect::<Vec<_>>();

        let mut outcomes = Vec::with_capacity(item_count);
        let mut expired = false;
        for (item, mut handle) in pending {
            let joined = match deadline {
                Some(deadline) if !expired => match timeout_at(deadline, &mut handle).await {
                    Ok(joined) => Some(joined),
                    Err(_) => {
                        expired = true;
                        None
                    }
                },
                _ if expired && !handle.is_finished() => None,
                _ => Some((&mut handle).await),
            };

            let outcome = match joined {
                Some(Ok(outcome)) => outcome,
                Some(Err(join_error)) => failed_task_outcome(item, join_error),
                None => {
                    handle.abort();
                    warn!(
                        instance = %item.descriptor.instance_identifier,
                        file = %item.descriptor.file_name,
                        "run deadline exceeded; upload cancelled"
                    );
                    ItemOutcome::failed(item, FailureReason::timeout())
                }
            };
            outcomes.push(outcome);
        }

        let failed = outcomes.iter().filter(|outcome| !outcome.is_succeeded()).count();
        info!(
            items = item_count,
            succeeded = item_count - failed,
            failed,
            deadline_exceeded = expired,
            "fan-out finished"
        );
        outcomes
    }
}

fn failed_task_outcome(item: WorkItem, join_error: JoinError) -> ItemOutcome {
    let message = if join_error.is_panic() {
        panic_message(join_error.into_panic())
    } else {
        join_error.to_string()
    };
    error!(
        instance = %item.descriptor.instance_identifier,
        file = %item.descriptor.file_name,
        error = %message,
        "upload task panicked"
    );
    ItemOutcome::failed(item, FailureReason::new(FAILURE_CLASS_PANIC, message))
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(message) => *message,
        Err(payload) => payload
            .downcast_ref::<&str>()
            .map(|message| message.to_string())
            .unwrap_or_else(|| "upload panicked".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::Utc;
    use log_archive_core::contract::LogFileDescriptor;
    use proptest::prelude::*;

    use super::*;

    #[derive(Default)]
    struct GaugedStage {
        active: AtomicUsize,
        peak: AtomicUsize,
        calls: AtomicUsize,
        delay: Duration,
        failing: HashSet<String>,
        panicking: HashSet<String>,
        hanging: HashSet<String>,
    }

    impl GaugedStage {
        fn with_delay(delay: Duration) -> Self {
            Self {
                delay,
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl UploadStage for GaugedStage {
        async fn upload(&self, item: WorkItem) -> ItemOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(active, Ordering::SeqCst);

            let name = item.descriptor.file_name.clone();
            if self.hanging.contains(&name) {
                tokio::time::sleep(Duration::from_secs(3_600)).await;
            }
            tokio::time::sleep(self.delay).await;
            self.active.fetch_sub(1, Ordering::SeqCst);

            if self.panicking.contains(&name) {
                panic!("corrupt log portion");
            }
            if self.failing.contains(&name) {
                return ItemOutcome::failed(item, FailureReason::new("request_failed", "boom"));
            }
            ItemOutcome::succeeded(item, 10, "sha".to_string())
        }
    }

    fn items(count: usize) -> Vec<WorkItem> {
        (0..count)
            .map(|idx| WorkItem {
                descriptor: LogFileDescriptor {
                    instance_identifier: "instance-1".to_string(),
                    file_name: format!("file-{idx}"),
                    last_written: Utc::now(),
                    size_bytes: 10,
                },
                destination_bucket: "archive-bucket".to_string(),
                object_key: format!("key-{idx}"),
            })
            .collect()
    }

    #[test]
    fn rejects_zero_concurrency() {
        assert!(FanOutExecutor::new(0).is_err());
        assert_eq!(
            FanOutExecutor::new(30).expect("valid bound").max_concurrency(),
            30
        );
    }

    #[tokio::test]
    async fn empty_input_returns_immediately() {
        let stage = Arc::new(GaugedStage::default());
        let executor = FanOutExecutor::new(4).expect("valid bound");

        let outcomes = executor.run(Vec::new(), stage.clone(), None).await;

        assert!(outcomes.is_empty());
        assert_eq!(stage.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn bounds_active_uploads_and_keeps_order() {
        let stage = Arc::new(GaugedStage::with_delay(Duration::from_millis(100)));
        let executor = FanOutExecutor::new(3).expect("valid bound");

        let outcomes = executor.run(items(20), stage.clone(), None).await;

        assert_eq!(outcomes.len(), 20);
        assert!(outcomes.iter().all(ItemOutcome::is_succeeded));
        assert_eq!(stage.peak.load(Ordering::SeqCst), 3);
        let keys = outcomes
            .iter()
            .map(|outcome| outcome.work_item.object_key.clone())
            .collect::<Vec<_>>();
        let expected = (0..20).map(|idx| format!("key-{idx}")).collect::<Vec<_>>();
        assert_eq!(keys, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_and_panics_stay_isolated() {
        let mut stage = GaugedStage::with_delay(Duration::from_millis(10));
        stage.failing.insert("file-1".to_string());
        stage.panicking.insert("file-3".to_string());
        let executor = FanOutExecutor::new(2).expect("valid bound");

        let outcomes = executor.run(items(6), Arc::new(stage), None).await;

        assert_eq!(outcomes.len(), 6);
        assert_eq!(outcomes.iter().filter(|o| o.is_succeeded()).count(), 4);
        let panic = outcomes[3].failure().expect("panicked item fails");
        assert_eq!(panic.class, FAILURE_CLASS_PANIC);
        assert_eq!(panic.message, "corrupt log portion");
        assert_eq!(outcomes[1].failure().map(|r| r.class.as_str()), Some("request_failed"));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_times_out_unfinished_items_and_keeps_the_rest() {
        let mut stage = GaugedStage::with_delay(Duration::from_millis(10));
        stage.hanging.insert("file-2".to_string());
        let executor = FanOutExecutor::new(2).expect("valid bound");
        let deadline = Instant::now() + Duration::from_secs(5);

        let outcomes = executor.run(items(5), Arc::new(stage), Some(deadline)).await;

        assert_eq!(outcomes.len(), 5);
        let timed_out = outcomes
            .iter()
            .filter(|outcome| outcome.failure().is_some_and(FailureReason::is_timeout))
            .map(|outcome| outcome.work_item.descriptor.file_name.as_str())
            .collect::<Vec<_>>();
        assert_eq!(timed_out, vec!["file-2"]);
        assert_eq!(outcomes.iter().filter(|o| o.is_succeeded()).count(), 4);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn never_exceeds_max_concurrency(count in 0usize..40, max_concurrency in 1usize..8) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .start_paused(true)
                .build()
                .expect("runtime should build");
            let stage = Arc::new(GaugedStage::with_delay(Duration::from_millis(5)));
            let executor = FanOutExecutor::new(max_concurrency).expect("valid bound");

            let outcomes = runtime.block_on(executor.run(items(count), stage.clone(), None));

            prop_assert_eq!(outcomes.len(), count);
            prop_assert!(stage.peak.load(Ordering::SeqCst) <= max_concurrency);
            prop_assert_eq!(stage.calls.load(Ordering::SeqCst), count);
        }
    }
}
