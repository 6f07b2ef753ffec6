use std::sync::Arc;

use lambda_runtime::{service_fn, Error, LambdaEvent};
use log_archive_core::clock::{Clock, SystemClock};
use log_archive_lambda::adapters::log_source::RdsLogSource;
use log_archive_lambda::adapters::object_store::S3ObjectStore;
use log_archive_lambda::config::ArchiveConfig;
use log_archive_lambda::handlers::discovery::DiscoveryResponse;
use log_archive_lambda::handlers::pipeline::{
    parse_trigger_event, prepare_run, PipelineDependencies,
};
use log_archive_lambda::telemetry::init_tracing;
use serde_json::Value;
use tokio::time::Instant;

async fn handle_request(
    event: LambdaEvent<Value>,
    deps: &PipelineDependencies,
    config: &ArchiveConfig,
) -> Result<DiscoveryResponse, Error> {
    let request =
        parse_trigger_event(event.payload).map_err(|error| Error::from(error.to_string()))?;

    let deadline = Instant::now() + config.run_deadline;
    let prepared = prepare_run(&request, deps, config, deps.clock.now(), Some(deadline)).await;
    Ok(DiscoveryResponse::from(prepared))
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
