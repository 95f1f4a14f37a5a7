//! Request payloads and input validation.

use serde::Deserialize;
use uuid::Uuid;
use validator::{Validate, ValidationError};

use crate::models::{ResearchStatus, SessionFilters};
use crate::{Error, Result};

pub const MAX_QUERY_LENGTH: usize = 5000;
pub const MAX_USER_ID_LENGTH: usize = 255;
pub const MAX_FILENAME_LENGTH: usize = 255;

/// Body of `POST /research`.
#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct StartResearchRequest {
    #[validate(
        length(max = 5000, message = "Research query must not exceed 5000 characters"),
        custom(function = "not_blank", message = "Research query is required")
    )]
    pub query: String,
    pub parent_session_id: Option<Uuid>,
}

/// Body of `POST /research/{id}/continue`.
#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ContinueResearchRequest {
    #[validate(
        length(max = 5000, message = "Research query must not exceed 5000 characters"),
        custom(function = "not_blank", message = "New research query is required for continuation")
    )]
    pub query: String,
}

/// Body of `POST /research/{id}/files`.
#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct UploadFileRequest {
    #[validate(
        length(max = 255, message = "Filename must not exceed 255 characters"),
        custom(function = "not_blank", message = "Filename is required")
    )]
    pub filename: String,
    #[validate(custom(function = "not_blank", message = "File content is required"))]
    pub content_base64: String,
    pub content_type: Option<String>,
}

fn not_blank(value: &str) -> std::result::Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::new("blank"));
    }
    Ok(())
}

/// Trim and check a research query outside of request parsing.
pub fn validate_query(query: &str) -> Result<String> {
    let query = query.trim();
    if query.is_empty() {
        return Err(Error::validation("query", "Research query is required"));
    }
    if query.chars().count() > MAX_QUERY_LENGTH {
        return Err(Error::validation(
            "query",
            format!("Research query must not exceed {} characters", MAX_QUERY_LENGTH),
        ));
    }
    Ok(query.to_string())
}

/// Parse a path segment as a session or file id.
pub fn parse_id(raw: &str, field: &str) -> Result<Uuid> {
    Uuid::parse_str(raw.trim()).map_err(|_| Error::validation(field, format!("Invalid {} format", field)))
}

/// Query-string parameters of `GET /research`.
#[derive(Debug, Default)]
pub struct ListParams<'a> {
    pub status: Option<&'a str>,
    pub q: Option<&'a str>,
    pub created_after: Option<&'a str>,
    pub created_before: Option<&'a str>,
    pub limit: Option<&'a str>,
    pub offset: Option<&'a str>,
}

impl ListParams<'_> {
    /// Validate and convert into store filters.
    pub fn into_filters(self) -> Result<SessionFilters> {
        let status = self
            .status
            .filter(|s| !s.trim().is_empty())
            .map(str::parse::<ResearchStatus>)
            .transpose()?;

        let query_contains = self
            .q
            .map(str::trim)
            .filter(|q| !q.is_empty())
            .map(String::from);

        let created_after = self.created_after.map(|s| parse_timestamp(s, "createdAfter")).transpose()?;
        let created_before = self
            .created_before
            .map(|s| parse_timestamp(s, "createdBefore"))
            .transpose()?;

        if let (Some(after), Some(before)) = (created_after, created_before) {
            if after > before {
                return Err(Error::validation(
                    "createdAfter",
                    "createdAfter must not be later than createdBefore",
                ));
            }
        }

        let limit = self.limit.map(|l| parse_bounded(l, "limit", 1)).transpose()?;
        if let Some(limit) = limit {
            if limit > SessionFilters::MAX_PAGE_SIZE {
                return Err(Error::validation(
                    "limit",
                    format!("limit must not exceed {}", SessionFilters::MAX_PAGE_SIZE),
                ));
            }
        }
        let offset = self.offset.map(|o| parse_bounded(o, "offset", 0)).transpose()?;

        Ok(SessionFilters {
            status,
            query_contains,
            created_after,
            created_before,
            limit,
            offset,
        })
    }
}

fn parse_timestamp(raw: &str, field: &str) -> Result<chrono::DateTime<chrono::Utc>> {
    chrono::DateTime::parse_from_rfc3339(raw.trim())
        .map(|dt| dt.with_timezone(&chrono::Utc))
        .map_err(|_| Error::validation(field, format!("{} must be an RFC 3339 timestamp", field)))
}

fn parse_bounded(raw: &str, field: &str, min: i64) -> Result<i64> {
    let value: i64 = raw
        .trim()
        .parse()
        .map_err(|_| Error::validation(field, format!("{} must be a valid integer", field)))?;
    if value < min {
        return Err(Error::validation(field, format!("{} must be {} or greater", field, min)));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blank_query_rejected() {
        let request = StartResearchRequest {
            query: "   ".to_string(),
            parent_session_id: None,
        };
        let err: Error = request.validate().unwrap_err().into();
        match err {
            Error::Validation { field, message } => {
                assert_eq!(field, "query");
                assert!(!message.is_empty());
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_validate_query_trims() {
        assert_eq!(validate_query("  What is climate change? ").unwrap(), "What is climate change?");
        assert!(validate_query("").is_err());
        assert!(validate_query(&"x".repeat(MAX_QUERY_LENGTH + 1)).is_err());
    }

    #[test]
    fn test_list_params() {
        let filters = ListParams {
            status: Some("completed"),
            q: Some(" climate "),
            created_after: Some("2024-01-01T00:00:00Z"),
            limit: Some("20"),
            ..Default::default()
        }
        .into_filters()
        .unwrap();

        assert_eq!(filters.status, Some(ResearchStatus::Completed));
        assert_eq!(filters.query_contains.as_deref(), Some("climate"));
        assert!(filters.created_after.is_some());
        assert_eq!(filters.limit, Some(20));
    }

    #[test]
    fn test_list_params_rejects_bad_input() {
        let too_big = ListParams {
            limit: Some("500"),
            ..Default::default()
        };
        assert!(too_big.into_filters().is_err());

        let inverted = ListParams {
            created_after: Some("2024-02-01T00:00:00Z"),
            created_before: Some("2024-01-01T00:00:00Z"),
            ..Default::default()
        };
        assert!(inverted.into_filters().is_err());

        let bad_status = ListParams {
            status: Some("CANCELLED"),
            ..Default::default()
        };
        assert!(bad_status.into_filters().is_err());
    }

    #[test]
    fn test_parse_id() {
        assert!(parse_id("not-a-uuid", "research_id").is_err());
        let id = Uuid::new_v4();
        assert_eq!(parse_id(&id.to_string(), "research_id").unwrap(), id);
    }
}
