//! Research Files Lambda - Context documents attached to research sessions.
//!
//! Endpoints:
//! - POST /research/{id}/files - Upload a file (base64 JSON body)
//! - GET /research/{id}/files - List a session's files
//! - GET /research/{id}/files/{fileId} - File metadata and summary
//! - DELETE /research/{id}/files/{fileId} - Remove a file

use std::sync::Arc;

use lambda_http::{run, service_fn, Body, Error, Request, Response};
use serde::Serialize;
use shared::http::{error_response, ok_response, request_path};
use shared::ingestion::{FileIngestion, RawUpload};
use shared::validation::{parse_id, UploadFileRequest};
use shared::{authenticate, db, parse_body, try_api, Config, PgSessionStore, ResearchFile, SecretsCache};
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route<'a> {
    Upload(&'a str),
    List(&'a str),
    Get(&'a str, &'a str),
    Delete(&'a str, &'a str),
}

impl<'a> Route<'a> {
    fn parse(method: &str, path: &'a str) -> Option<Self> {
        let rest = path.strip_prefix("/research/")?;
        let parts: Vec<&str> = rest.split('/').collect();
        match (method, parts.as_slice()) {
            ("POST", &[id, "files"]) => Some(Self::Upload(id)),
            ("GET", &[id, "files"]) => Some(Self::List(id)),
            ("GET", &[id, "files", file_id]) => Some(Self::Get(id, file_id)),
            ("DELETE", &[id, "files", file_id]) => Some(Self::Delete(id, file_id)),
            _ => None,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FileList {
    files: Vec<ResearchFile>,
    count: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DeletedFile {
    id: Uuid,
    deleted: bool,
}

/// Application state
struct AppState {
    ingestion: FileIngestion,
}

impl AppState {
    async fn new() -> Result<Self, Error> {
        let config = Config::from_env()?;
        let aws_config = config.load_aws_config().await;
        let secrets = SecretsCache::new(aws_sdk_secretsmanager::Client::new(&aws_config));

        let pool = db::connect(&config, &secrets).await?;
        let store = Arc::new(PgSessionStore::new(pool));

        Ok(Self {
            ingestion: FileIngestion::new(store, config.max_file_size),
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
        Route::Upload(id) => {
            let session_id = try_api!(parse_id(id, "researchId"));
            let request: UploadFileRequest = parse_body!(event.body());
            let upload = try_api!(RawUpload::try_from(request));

            let file = try_api!(state.ingestion.upload(session_id, user_id, upload).await);
            ok_response(201, file)
        }

        Route::List(id) => {
            let session_id = try_api!(parse_id(id, "researchId"));
            let files = try_api!(state.ingestion.list(session_id, user_id).await);
            ok_response(
                200,
                FileList {
                    count: files.len(),
                    files,
                },
            )
        }

        Route::Get(id, file_id) => {
            let session_id = try_api!(parse_id(id, "researchId"));
            let file_id = try_api!(parse_id(file_id, "fileId"));
            let file = try_api!(state.ingestion.get(session_id, file_id, user_id).await);
            ok_response(200, file)
        }

        Route::Delete(id, file_id) => {
            let session_id = try_api!(parse_id(id, "researchId"));
            let file_id = try_api!(parse_id(file_id, "fileId"));
            try_api!(state.ingestion.delete(session_id, file_id, user_id).await);
            ok_response(
                200,
                DeletedFile {
                    id: file_id,
                    deleted: true,
                },
            )
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
