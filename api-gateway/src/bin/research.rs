//! Research Session Lambda - Starts, lists and follows research sessions.
//!
//! Endpoints:
//! - POST /research - Start a research session
//! - GET /research - List the caller's sessions
//! - GET /research/{id} - Session details with cost and files
//! - GET /research/{id}/status - Poll status
//! - POST /research/{id}/cancel - Cancel a processing session
//! - POST /research/{id}/continue - Start a continuation of a completed session
//! - GET /research/{id}/lineage - Ancestors and continuations

use std::sync::Arc;

use lambda_http::{run, service_fn, Body, Error, Request, RequestExt, Response};
use serde::Serialize;
use shared::http::{error_response, ok_response, request_path};
use shared::lineage::LineageManager;
use shared::polling::StatusPoller;
use shared::sessions::start_research;
use shared::validation::{parse_id, ContinueResearchRequest, ListParams, StartResearchRequest};
use shared::{
    authenticate, db, parse_body, try_api, Config, LambdaTaskQueue, PgSessionStore, ResearchCost,
    ResearchFile, ResearchSession, SecretsCache, SessionStore, TaskQueue,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route<'a> {
    Create,
    List,
    Detail(&'a str),
    Status(&'a str),
    Cancel(&'a str),
    Continue(&'a str),
    Lineage(&'a str),
}

impl<'a> Route<'a> {
    fn parse(method: &str, path: &'a str) -> Option<Self> {
        match (method, path) {
            ("POST", "/research") => return Some(Self::Create),
            ("GET", "/research") => return Some(Self::List),
            _ => {}
        }

        let rest = path.strip_prefix("/research/")?;
        let parts: Vec<&str> = rest.split('/').collect();
        match (method, parts.as_slice()) {
            ("GET", &[id]) => Some(Self::Detail(id)),
            ("GET", &[id, "status"]) => Some(Self::Status(id)),
            ("POST", &[id, "cancel"]) => Some(Self::Cancel(id)),
            ("POST", &[id, "continue"]) => Some(Self::Continue(id)),
            ("GET", &[id, "lineage"]) => Some(Self::Lineage(id)),
            _ => None,
        }
    }
}

/// Session with its cost and attached files
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionDetail {
    #[serde(flatten)]
    session: ResearchSession,
    is_continuation: bool,
    duration_seconds: Option<i64>,
    cost: Option<ResearchCost>,
    files: Vec<ResearchFile>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionList {
    sessions: Vec<ResearchSession>,
    count: usize,
}

/// Application state
struct AppState {
    store: Arc<dyn SessionStore>,
    queue: Arc<dyn TaskQueue>,
    lineage: LineageManager,
    poller: StatusPoller,
}

impl AppState {
    async fn new() -> Result<Self, Error> {
        let config = Config::from_env()?;
        let aws_config = config.load_aws_config().await;
        let secrets = SecretsCache::new(aws_sdk_secretsmanager::Client::new(&aws_config));

        let pool = db::connect(&config, &secrets).await?;
        let store: Arc<dyn SessionStore> = Arc::new(PgSessionStore::new(pool));
        let queue: Arc<dyn TaskQueue> = Arc::new(LambdaTaskQueue::new(
            aws_sdk_lambda::Client::new(&aws_config),
            config.executor_function.clone(),
        ));

        Ok(Self {
            lineage: LineageManager::new(Arc::clone(&store), Arc::clone(&queue)),
            poller: StatusPoller::new(Arc::clone(&store), config.poll_interval),
            store,
            queue,
        })
    }
}

async fn handler(state: Arc<AppState>, event: Request) -> Result<Response<Body>, Error> {
    let path = request_path(&event);
    let method = event.method().as_str();

    info!("Received request: method={}, path={}", method, path);

    let user = try_api!(authenticate(&event));
    let user_id = user.user_id.as_str();

    let Some(route) = Route::parse(method, path) else {
        return error_response(404, "Not found");
    };

    match route {
        Route::Create => {
            let request: StartResearchRequest = parse_body!(event.body());
            let session = try_api!(
                start_research(
                    state.store.as_ref(),
                    state.queue.as_ref(),
                    user_id,
                    &request.query,
                    request.parent_session_id,
                )
                .await
            );
            ok_response(201, session)
        }

        Route::List => {
            let params = event.query_string_parameters();
            let filters = try_api!(ListParams {
                status: params.first("status"),
                q: params.first("q"),
                created_after: params.first("createdAfter"),
                created_before: params.first("createdBefore"),
                limit: params.first("limit"),
                offset: params.first("offset"),
            }
            .into_filters());

            let sessions = try_api!(state.store.list(user_id, &filters).await);
            ok_response(
                200,
                SessionList {
                    count: sessions.len(),
                    sessions,
                },
            )
        }

        Route::Detail(id) => {
            let session_id = try_api!(parse_id(id, "researchId"));
            let session = try_api!(state.store.get(session_id, user_id).await);
            let cost = try_api!(state.store.get_cost(session_id, user_id).await);
            let files = try_api!(state.store.list_files(session_id, user_id).await);

            ok_response(
                200,
                SessionDetail {
                    is_continuation: session.is_continuation(),
                    duration_seconds: session.duration().map(|d| d.num_seconds()),
                    session,
                    cost,
                    files,
                },
            )
        }

        Route::Status(id) => {
            let session_id = try_api!(parse_id(id, "researchId"));
            let snapshot = try_api!(state.poller.status(session_id, user_id).await);
            ok_response(200, snapshot)
        }

        Route::Cancel(id) => {
            let session_id = try_api!(parse_id(id, "researchId"));
            let snapshot = try_api!(state.poller.cancel(session_id, user_id).await);
            ok_response(200, snapshot)
        }

        Route::Continue(id) => {
            let parent_id = try_api!(parse_id(id, "researchId"));
            let request: ContinueResearchRequest = parse_body!(event.body());
            let child = try_api!(
                state
                    .lineage
                    .continue_session(parent_id, user_id, &request.query)
                    .await
            );
            ok_response(201, child)
        }

        Route::Lineage(id) => {
            let session_id = try_api!(parse_id(id, "researchId"));
            let lineage = try_api!(state.lineage.lineage(session_id, user_id).await);
            ok_response(200, lineage)
        }
    }
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
    fn test_collection_routes() {
        assert_eq!(Route::parse("POST", "/research"), Some(Route::Create));
        assert_eq!(Route::parse("GET", "/research"), Some(Route::List));
        assert_eq!(Route::parse("DELETE", "/research"), None);
    }

    #[test]
    fn test_session_routes() {
        let id = "3f0c6f0e-8a51-4c1e-9d43-2f1b1b0e6a10";
        assert_eq!(Route::parse("GET", &format!("/research/{}", id)), Some(Route::Detail(id)));
        assert_eq!(
            Route::parse("GET", &format!("/research/{}/status", id)),
            Some(Route::Status(id))
        );
        assert_eq!(
            Route::parse("POST", &format!("/research/{}/cancel", id)),
            Some(Route::Cancel(id))
        );
        assert_eq!(
            Route::parse("POST", &format!("/research/{}/continue", id)),
            Some(Route::Continue(id))
        );
        assert_eq!(
            Route::parse("GET", &format!("/research/{}/lineage", id)),
            Some(Route::Lineage(id))
        );
    }

    #[test]
    fn test_unknown_routes() {
        assert_eq!(Route::parse("GET", "/research/abc/report"), None);
        assert_eq!(Route::parse("POST", "/research/abc/status"), None);
        assert_eq!(Route::parse("GET", "/sessions"), None);
    }
}
