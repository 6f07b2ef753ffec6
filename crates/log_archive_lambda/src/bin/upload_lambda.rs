use std::sync::Arc;

use lambda_runtime::{service_fn, Error, LambdaEvent};
use log_archive_lambda::adapters::log_source::RdsLogSource;
use log_archive_lambda::adapters::object_store::S3ObjectStore;
use log_archive_lambda::config::ArchiveConfig;
use log_archive_lambda::handlers::events::{decode_upload_event, UploadEvent};
use log_archive_lambda::handlers::fan_out::FanOutExecutor;
use log_archive_lambda::handlers::upload::{UploadStage, Uploader};
use log_archive_lambda::telemetry::init_tracing;
use serde_json::Value;
use tokio::time::Instant;

struct UploadRuntime {
    stage: Arc<dyn UploadStage>,
    executor: FanOutExecutor,
    config: ArchiveConfig,
}

async fn handle_request(
    event: LambdaEvent<Value>,
    runtime: &UploadRuntime,
) -> Result<Value, Error> {
    let upload_event =
        decode_upload_event(event.payload).map_err(|error| Error::from(error.to_string()))?;

    let response = match upload_event {
        UploadEvent::Single(item) => serde_json::to_value(runtime.stage.upload(item).await),
        UploadEvent::Batch(items) => {
            let deadline = Instant::now() + runtime.config.run_deadline;
            let outcomes = runtime
                .executor
                .run(items, Arc::clone(&runtime.stage), Some(deadline))
                .await;
            serde_json::to_value(outcomes)
        }
    };

    response.map_err(|error| Error::from(format!("failed to serialize item outcome: {error}")))
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    init_tracing();

    let config = ArchiveConfig::from_env()
        .map_err(|error| Error::from(format!("invalid configuration: {error}")))?;
    let executor = FanOutExecutor::new(config.max_concurrency)
        .map_err(|error| Error::from(format!("invalid configuration: {error}")))?;
    let aws_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
    let stage: Arc<dyn UploadStage> = Arc::new(Uploader::new(
        Arc::new(RdsLogSource::new(aws_sdk_rds::Client::new(&aws_config))),
        Arc::new(S3ObjectStore::new(aws_sdk_s3::Client::new(&aws_config))),
        config.spool_threshold_bytes,
    ));
    let runtime = UploadRuntime {
        stage,
        executor,
        config,
    };

    let runtime = &runtime;
    lambda_runtime::run(service_fn(move |event| async move {
        handle_request(event, runtime).await
    }))
    .await
}
