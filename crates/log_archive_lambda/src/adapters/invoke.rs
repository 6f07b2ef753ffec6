use async_trait::async_trait;
use aws_sdk_lambda::error::DisplayErrorContext;
use aws_sdk_lambda::types::InvocationType;
use log_archive_core::contract::RunRequest;

use super::AdapterError;

/// Hands a fired run request to the pipeline entry point.
#[async_trait]
pub trait RunDispatcher: Send + Sync {
    async fn dispatch(&self, request: &RunRequest) -> Result<(), AdapterError>;
}

/// Dispatches by invoking the pipeline function asynchronously.
pub struct LambdaRunDispatcher {
    lambda_client: aws_sdk_lambda::Client,
    function_name: String,
}

impl LambdaRunDispatcher {
    pub fn new(lambda_client: aws_sdk_lambda::Client, function_name: impl Into<String>) -> Self {
        Self {
            lambda_client,
            function_name: function_name.into(),
        }
    }
}

#[async_trait]
impl RunDispatcher for LambdaRunDispatcher {
    async fn dispatch(&self, request: &RunRequest) -> Result<(), AdapterError> {
        let request_payload = serde_json::to_vec(request)
            .map_err(|error| AdapterError::request_failed("Invoke", error))?;

        self.lambda_client
            .invoke()
            .function_name(&self.function_name)
            .invocation_type(InvocationType::Event)
            .set_payload(Some(request_payload.into()))
            .send()
            .await
            .map(|_| ())
            .map_err(|error| AdapterError::request_failed("Invoke", DisplayErrorContext(&error)))
    }
}
