//! Caller identity from the API Gateway Cognito authorizer.

use lambda_http::{Request, RequestExt};

use crate::validation::MAX_USER_ID_LENGTH;
use crate::{Error, Result};

/// Caller resolved from the authorizer claims.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthenticatedUser {
    /// Owner id every session is scoped to
    pub user_id: String,
    /// User's email
    pub email: Option<String>,
}

fn checked_user_id(sub: &str) -> Result<String> {
    let sub = sub.trim();
    if sub.is_empty() {
        return Err(Error::Auth("Empty sub claim".to_string()));
    }
    if sub.len() > MAX_USER_ID_LENGTH {
        return Err(Error::Auth("Subject claim too long".to_string()));
    }
    Ok(sub.to_string())
}

/// Extract user from API Gateway request context.
///
/// When using Cognito authorizer, user info is in requestContext.authorizer.claims
pub fn extract_user_from_context(claims: &serde_json::Value) -> Result<AuthenticatedUser> {
    let sub = claims
        .get("sub")
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::Auth("Missing sub claim".to_string()))?;

    let email = claims.get("email").and_then(|v| v.as_str()).map(String::from);

    Ok(AuthenticatedUser {
        user_id: checked_user_id(sub)?,
        email,
    })
}

/// Resolve the caller from the Cognito authorizer context.
///
/// Requests without authorizer claims are rejected; headers are never trusted.
pub fn authenticate(event: &Request) -> Result<AuthenticatedUser> {
    let claims = event
        .request_context_ref()
        .and_then(|ctx| ctx.authorizer().and_then(|a| a.fields.get("claims").cloned()))
        .ok_or_else(|| Error::Auth("Authentication required".to_string()))?;

    extract_user_from_context(&claims)
}
