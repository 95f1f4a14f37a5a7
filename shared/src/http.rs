//! HTTP helpers for Lambda functions.

use lambda_http::{Body, Request, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::error;
use validator::Validate;

use crate::Error;

/// Standard API response wrapper.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            field: None,
        }
    }

    pub fn error(message: impl Into<String>) -> ApiResponse<()> {
        ApiResponse {
            success: false,
            data: None,
            error: Some(message.into()),
            field: None,
        }
    }
}

/// Create a JSON response with the given status code and data.
pub fn json_response<T: Serialize>(status: u16, data: &T) -> Result<Response<Body>, lambda_http::Error> {
    Ok(Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .header("Access-Control-Allow-Origin", "*")
        .body(Body::from(serde_json::to_string(data)?))?)
}

/// Wrap `data` in a success envelope.
pub fn ok_response<T: Serialize>(status: u16, data: T) -> Result<Response<Body>, lambda_http::Error> {
    json_response(status, &ApiResponse::success(data))
}

/// Create an error response with the given status code and message.
pub fn error_response(status: u16, message: impl Into<String>) -> Result<Response<Body>, lambda_http::Error> {
    json_response(status, &ApiResponse::<()>::error(message))
}

/// Map a library error onto the response envelope.
///
/// Server-side failures are logged in full and answered with a generic message.
pub fn error_to_response(err: &Error) -> Result<Response<Body>, lambda_http::Error> {
    let status = err.status_code();
    if status >= 500 {
        error!(error = %err, "Request failed");
    }
    if let Error::InvalidTransition { .. } = err {
        error!(error = %err, "Illegal status transition attempted");
    }

    let mut body = ApiResponse::<()>::error(err.user_message());
    if let Error::Validation { field, .. } = err {
        body.field = Some(field.clone());
    }
    json_response(status, &body)
}

/// Parse request body as JSON, returning a 400 response on failure.
///
/// Returns `Ok(Ok(T))` on successful parse, `Ok(Err(Response))` on parse error (400),
/// or `Err(lambda_http::Error)` on serialization failure.
pub fn parse_json_body<T: DeserializeOwned>(body: &Body) -> Result<Result<T, Response<Body>>, lambda_http::Error> {
    match serde_json::from_slice(body.as_ref()) {
        Ok(parsed) => Ok(Ok(parsed)),
        Err(e) => {
            let response = error_response(400, format!("Invalid request body: {}", e))?;
            Ok(Err(response))
        }
    }
}

/// Parse and validate a request body in one step.
pub fn parse_valid_body<T: DeserializeOwned + Validate>(
    body: &Body,
) -> Result<Result<T, Response<Body>>, lambda_http::Error> {
    match parse_json_body::<T>(body)? {
        Ok(parsed) => match parsed.validate() {
            Ok(()) => Ok(Ok(parsed)),
            Err(errors) => Ok(Err(error_to_response(&Error::from(errors))?)),
        },
        Err(response) => Ok(Err(response)),
    }
}

/// Request path without the API Gateway stage prefix.
pub fn request_path(event: &Request) -> &str {
    let raw_path = event.uri().path();
    let path = raw_path.strip_prefix("/api").unwrap_or(raw_path);
    path.trim_end_matches('/')
}

/// Macro to parse and validate a request body, returning early with 400 on failure.
///
/// Usage:
/// ```ignore
/// let request: MyRequest = parse_body!(event.body());
/// ```
#[macro_export]
macro_rules! parse_body {
    ($body:expr) => {
        match shared::http::parse_valid_body($body)? {
            Ok(parsed) => parsed,
            Err(response) => return Ok(response),
        }
    };
}

/// Unwrap a library result, returning early with the mapped error response.
#[macro_export]
macro_rules! try_api {
    ($result:expr) => {
        match $result {
            Ok(value) => value,
            Err(err) => return shared::http::error_to_response(&err),
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body_json(response: Response<Body>) -> serde_json::Value {
        serde_json::from_slice(response.body().as_ref()).unwrap()
    }

    #[test]
    fn test_validation_error_carries_field() {
        let response = error_to_response(&Error::validation("query", "Research query is required")).unwrap();
        assert_eq!(response.status(), 400);
        let json = body_json(response);
        assert_eq!(json["success"], false);
        assert_eq!(json["field"], "query");
    }

    #[test]
    fn test_internal_error_is_generic() {
        let response = error_to_response(&Error::Internal("pool exhausted at db-1".into())).unwrap();
        assert_eq!(response.status(), 500);
        let json = body_json(response);
        assert_eq!(json["error"], "An internal error occurred");
    }

    #[test]
    fn test_parse_valid_body_rejects_blank_query() {
        let body = Body::from(r#"{"query": ""}"#);
        let parsed = parse_valid_body::<crate::validation::StartResearchRequest>(&body).unwrap();
        let response = parsed.unwrap_err();
        assert_eq!(response.status(), 400);
    }

    #[test]
    fn test_parse_valid_body_accepts_camel_case() {
        let parent = uuid::Uuid::new_v4();
        let body = Body::from(format!(
            r#"{{"query": "Follow up", "parentSessionId": "{}"}}"#,
            parent
        ));
        let parsed = parse_valid_body::<crate::validation::StartResearchRequest>(&body)
            .unwrap()
            .unwrap();
        assert_eq!(parsed.parent_session_id, Some(parent));
    }
}
