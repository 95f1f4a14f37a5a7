//! Session Sweeper Lambda - Recovers research sessions left behind.
//!
//! This Lambda runs every few minutes via EventBridge and:
//! 1. Fails sessions stuck in PROCESSING past the stuck threshold
//! 2. Re-enqueues PENDING sessions whose executor invocation was lost
//!
//! It also applies pending schema migrations on cold start.

use std::sync::Arc;

use chrono::Utc;
use lambda_runtime::{run, service_fn, Error, LambdaEvent};
use serde::{Deserialize, Serialize};
use shared::{db, Config, LambdaTaskQueue, PgSessionStore, SecretsCache, SessionSweeper};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Deserialize)]
struct ScheduledEvent {
    #[serde(default, rename = "detail-type")]
    detail_type: String,
}

#[derive(Debug, Serialize)]
struct SweeperResponse {
    sessions_failed: usize,
    sessions_requeued: usize,
}

/// Application state
struct AppState {
    sweeper: SessionSweeper,
}

impl AppState {
    async fn new() -> Result<Self, Error> {
        let config = Config::from_env()?;
        let aws_config = config.load_aws_config().await;
        let secrets = SecretsCache::new(aws_sdk_secretsmanager::Client::new(&aws_config));

        let pool = db::connect(&config, &secrets).await?;
        db::run_migrations(&pool).await?;
        info!("Database migrations applied");

        let queue = LambdaTaskQueue::new(
            aws_sdk_lambda::Client::new(&aws_config),
            config.executor_function.clone(),
        );

        Ok(Self {
            sweeper: SessionSweeper::new(
                Arc::new(PgSessionStore::new(pool)),
                Arc::new(queue),
                config.stuck_after,
                config.requeue_after,
            ),
        })
    }
}

async fn handler(state: Arc<AppState>, event: LambdaEvent<ScheduledEvent>) -> Result<SweeperResponse, Error> {
    info!(detail_type = %event.payload.detail_type, "Starting session sweep");

    let report = state.sweeper.sweep(Utc::now()).await?;

    let response = SweeperResponse {
        sessions_failed: report.failed.len(),
        sessions_requeued: report.requeued.len(),
    };

    info!(
        sessions_failed = response.sessions_failed,
        sessions_requeued = response.sessions_requeued,
        "Session sweep complete"
    );

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
