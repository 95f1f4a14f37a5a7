//! Research Costs Lambda - Token usage and spend.
//!
//! Endpoints:
//! - GET /research/{id}/cost - Cost breakdown for one session
//! - POST /research/{id}/cost/recompute - Re-price a completed session
//! - GET /costs/summary?period=day|week|month|year|all - Spend over a period

use std::sync::Arc;

use lambda_http::{run, service_fn, Body, Error, Request, RequestExt, Response};
use serde::Serialize;
use shared::costs::{self, CostPeriod, PriceTable};
use shared::http::{error_response, ok_response, request_path};
use shared::validation::parse_id;
use shared::{
    authenticate, db, tracer_from_config, try_api, Config, PgSessionStore, ResearchCost, SecretsCache,
    SessionStore, Tracer,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route<'a> {
    Get(&'a str),
    Recompute(&'a str),
    Summary,
}

impl<'a> Route<'a> {
    fn parse(method: &str, path: &'a str) -> Option<Self> {
        if (method, path) == ("GET", "/costs/summary") {
            return Some(Self::Summary);
        }

        let rest = path.strip_prefix("/research/")?;
        let parts: Vec<&str> = rest.split('/').collect();
        match (method, parts.as_slice()) {
            ("GET", &[id, "cost"]) => Some(Self::Get(id)),
            ("POST", &[id, "cost", "recompute"]) => Some(Self::Recompute(id)),
            _ => None,
        }
    }
}

/// Cost row with the derived per-token rate
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CostResponse {
    #[serde(flatten)]
    cost: ResearchCost,
    cost_per_token: f64,
}

impl From<ResearchCost> for CostResponse {
    fn from(cost: ResearchCost) -> Self {
        Self {
            cost_per_token: cost.cost_per_token(),
            cost,
        }
    }
}

/// Application state
struct AppState {
    store: Arc<dyn SessionStore>,
    tracer: Arc<dyn Tracer>,
    prices: PriceTable,
}

impl AppState {
    async fn new() -> Result<Self, Error> {
        let config = Config::from_env()?;
        let aws_config = config.load_aws_config().await;
        let secrets = SecretsCache::new(aws_sdk_secretsmanager::Client::new(&aws_config));

        let pool = db::connect(&config, &secrets).await?;
        let tracer = tracer_from_config(&config, &secrets).await?;

        Ok(Self {
            store: Arc::new(PgSessionStore::new(pool)),
            tracer,
            prices: PriceTable::default(),
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
        Route::Get(id) => {
            let session_id = try_api!(parse_id(id, "researchId"));
            match try_api!(state.store.get_cost(session_id, user_id).await) {
                Some(cost) => ok_response(200, CostResponse::from(cost)),
                None => error_response(404, "Cost data not available for this session"),
            }
        }

        Route::Recompute(id) => {
            let session_id = try_api!(parse_id(id, "researchId"));
            let cost = try_api!(
                costs::recompute(
                    state.store.as_ref(),
                    state.tracer.as_ref(),
                    &state.prices,
                    session_id,
                    user_id,
                )
                .await
            );
            ok_response(200, CostResponse::from(cost))
        }

        Route::Summary => {
            let params = event.query_string_parameters();
            let period = try_api!(params.first("period").unwrap_or_default().parse::<CostPeriod>());
            let summary = try_api!(costs::totals(state.store.as_ref(), user_id, period).await);
            ok_response(200, summary)
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
