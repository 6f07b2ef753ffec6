use std::sync::Arc;

use lambda_runtime::{service_fn, Error, LambdaEvent};
use log_archive_core::clock::SystemClock;
use log_archive_lambda::adapters::log_source::RdsLogSource;
use log_archive_lambda::adapters::object_store::S3ObjectStore;
use log_archive_lambda::config::ArchiveConfig;
use log_archive_lambda::handlers::pipeline::{handle_trigger_event, PipelineDependencies};
use log_archive_lambda::telemetry::init_tracing;
use serde_json::Value;

async fn handle_request(
    event: LambdaEvent<Value>,
    deps: &PipelineDependencies,
    config: &ArchiveConfig,
) -> Result<Value, Error> {
    let result = handle_trigger_event(event.payload, deps, config)
        .await
        .map_err(|error| Error::from(error.to_string()))?;

    serde_json::to_value(&result)
        .map_err(|error| Error::from(format!("failed to serialize run result: {error}")))
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    init_tracing();

    let config = ArchiveConfig::from_env()
        .map_err(|error| Error::from(format!("invalid configuration: {error}")))?;
    let aws_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
    let deps = PipelineDependencies {
        log_source: Arc::new(RdsLogSource::new(aws_sdk_rds::Client::new(&aws_config))),
        object_store: Arc::new(S3ObjectStore::new(aws_sdk_s3::Client::new(&aws_config))),
        clock: Arc::new(SystemClock),
    };

    let deps = &deps;
    let config = &config;
    lambda_runtime::run(service_fn(move |event| async move {
        handle_request(event, deps, config).await
    }))
    .await
}
