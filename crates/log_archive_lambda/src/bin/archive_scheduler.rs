use std::sync::Arc;

use clap::Parser;
use log_archive_core::clock::SystemClock;
use log_archive_lambda::adapters::invoke::{LambdaRunDispatcher, RunDispatcher};
use log_archive_lambda::adapters::log_source::RdsLogSource;
use log_archive_lambda::adapters::object_store::S3ObjectStore;
use log_archive_lambda::config::{ArchiveConfig, SchedulerConfig};
use log_archive_lambda::handlers::pipeline::PipelineDependencies;
use log_archive_lambda::handlers::scheduler::{DispatchOutcome, InProcessDispatcher, Scheduler};
use log_archive_lambda::telemetry::init_tracing;
use tracing::info;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Parser)]
#[command(
    name = "archive_scheduler",
    about = "Fires log archive runs on a recurring schedule",
    long_about = "Evaluates SCHEDULE_EXPRESSION in SCHEDULE_UTC_OFFSET and dispatches one run\n\
                  per fire time, either to PIPELINE_FUNCTION_ARN or in-process."
)]
struct Cli {
    /// Fire a single run immediately and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    init_tracing();
    let cli = Cli::parse();

    let config = SchedulerConfig::from_env()?;
    let aws_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;

    let dispatcher: Arc<dyn RunDispatcher> = match config.pipeline_function_arn.as_deref() {
        Some(function_arn) => {
            info!(function_arn, "dispatching runs to pipeline function");
            Arc::new(LambdaRunDispatcher::new(
                aws_sdk_lambda::Client::new(&aws_config),
                function_arn,
            ))
        }
        None => {
            info!("dispatching runs in-process");
            let deps = PipelineDependencies {
                log_source: Arc::new(RdsLogSource::new(aws_sdk_rds::Client::new(&aws_config))),
                object_store: Arc::new(S3ObjectStore::new(aws_sdk_s3::Client::new(&aws_config))),
                clock: Arc::new(SystemClock),
            };
            Arc::new(InProcessDispatcher::new(deps, ArchiveConfig::from_env()?))
        }
    };

    let scheduler = Scheduler::new(config, dispatcher, Arc::new(SystemClock));

    if cli.once {
        return match scheduler.fire_once().await {
            DispatchOutcome::Delivered { .. } => Ok(()),
            DispatchOutcome::Dropped { reason, .. } => {
                Err(format!("run request dropped: {reason}").into())
            }
        };
    }

    scheduler
        .run(async {
            if let Err(error) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %error, "failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
        })
        .await;
    Ok(())
}
