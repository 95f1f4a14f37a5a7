//! Research Executor Lambda - Runs queued research sessions.
//!
//! Invoked asynchronously with `{"session_id": "..."}` for every session the
//! API creates and every session the sweeper re-enqueues. Deliveries can
//! repeat; only the one that claims the session runs it.

use std::sync::Arc;

use lambda_runtime::{run, service_fn, Error, LambdaEvent};
use serde::Serialize;
use shared::queue::ExecuteSessionEvent;
use shared::{
    db, tracer_from_config, AgentClient, Config, ExecutionOutcome, ExecutionTask, PgSessionStore,
    ResearchStatus, SecretsCache,
};
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Debug, Serialize)]
struct ExecutorResponse {
    session_id: Uuid,
    outcome: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<ResearchStatus>,
}

impl ExecutorResponse {
    fn new(session_id: Uuid, outcome: &ExecutionOutcome) -> Self {
        let (outcome, status) = match outcome {
            ExecutionOutcome::Completed(session) => ("completed", Some(session.status)),
            ExecutionOutcome::Failed(session) => ("failed", Some(session.status)),
            ExecutionOutcome::Skipped(status) => ("skipped", Some(*status)),
            ExecutionOutcome::Discarded => ("discarded", None),
        };
        Self {
            session_id,
            outcome,
            status,
        }
    }
}

/// Application state
struct AppState {
    task: ExecutionTask,
}

impl AppState {
    async fn new() -> Result<Self, Error> {
        let config = Config::from_env()?;
        let aws_config = config.load_aws_config().await;
        let secrets = SecretsCache::new(aws_sdk_secretsmanager::Client::new(&aws_config));

        let pool = db::connect(&config, &secrets).await?;
        let tracer = tracer_from_config(&config, &secrets).await?;
        let runner = AgentClient::new(
            aws_sdk_lambda::Client::new(&aws_config),
            config.research_agent_function.clone(),
        );

        Ok(Self {
            task: ExecutionTask::new(
                Arc::new(PgSessionStore::new(pool)),
                Arc::new(runner),
                tracer,
                config.execution.clone(),
            ),
        })
    }
}

async fn handler(
    state: Arc<AppState>,
    event: LambdaEvent<ExecuteSessionEvent>,
) -> Result<ExecutorResponse, Error> {
    let session_id = event.payload.session_id;
    info!(%session_id, request_id = %event.context.request_id, "Executing research session");

    // Err only when the session could not even be marked FAILED; the
    // redelivery that follows is absorbed by the claim.
    let outcome = state.task.run(session_id).await?;

    let response = ExecutorResponse::new(session_id, &outcome);
    info!(%session_id, outcome = response.outcome, "Research execution finished");
    Ok(response)
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    let state = Arc::new(AppState::new().await?);

    run(service_fn(move |event| {
        let state = Arc::clone(&state);
        async move { handler(state, event).await }
    }))
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_shape() {
        let id = Uuid::new_v4();
        let event: ExecuteSessionEvent =
            serde_json::from_value(serde_json::json!({ "session_id": id })).unwrap();
        assert_eq!(event.session_id, id);
    }

    #[test]
    fn test_response_for_skipped_delivery() {
        let id = Uuid::new_v4();
        let response = ExecutorResponse::new(id, &ExecutionOutcome::Skipped(ResearchStatus::Completed));
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["outcome"], "skipped");
        assert_eq!(json["status"], "COMPLETED");

        let json = serde_json::to_value(ExecutorResponse::new(id, &ExecutionOutcome::Discarded)).unwrap();
        assert_eq!(json["outcome"], "discarded");
        assert!(json.get("status").is_none());
    }
}
