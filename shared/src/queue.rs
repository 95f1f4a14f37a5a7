//! Hand-off from the API to the research executor.

use async_trait::async_trait;
use aws_sdk_lambda::primitives::Blob;
use aws_sdk_lambda::types::InvocationType;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::{Error, Result};

/// Event delivered to the executor Lambda.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteSessionEvent {
    pub session_id: Uuid,
}

/// Schedules asynchronous execution of a session. Delivery is at-least-once.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn enqueue(&self, session_id: Uuid) -> Result<()>;
}

/// Queue backed by asynchronous (`Event`) Lambda invocations.
pub struct LambdaTaskQueue {
    lambda_client: aws_sdk_lambda::Client,
    executor_function: String,
}

impl LambdaTaskQueue {
    pub fn new(lambda_client: aws_sdk_lambda::Client, executor_function: String) -> Self {
        Self {
            lambda_client,
            executor_function,
        }
    }
}

#[async_trait]
impl TaskQueue for LambdaTaskQueue {
    async fn enqueue(&self, session_id: Uuid) -> Result<()> {
        let payload = serde_json::to_vec(&ExecuteSessionEvent { session_id })?;

        self.lambda_client
            .invoke()
            .function_name(&self.executor_function)
            .invocation_type(InvocationType::Event)
            .payload(Blob::new(payload))
            .send()
            .await
            .map_err(|e| Error::TransientInfra(format!("Failed to enqueue research session: {}", e)))?;

        info!(%session_id, function = %self.executor_function, "Research session enqueued");
        Ok(())
    }
}
