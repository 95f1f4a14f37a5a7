//! Shared data models.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Error, Result};

/// Lifecycle status of a research session.
///
/// ```text
/// PENDING → PROCESSING → COMPLETED
///                      → FAILED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResearchStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl ResearchStatus {
    /// States reachable from `self` in one step.
    pub const fn allowed_next_states(self) -> &'static [Self] {
        match self {
            Self::Pending => &[Self::Processing],
            Self::Processing => &[Self::Completed, Self::Failed],
            Self::Completed | Self::Failed => &[],
        }
    }

    /// Check whether transitioning to `next` is allowed.
    pub fn can_transition_to(self, next: Self) -> bool {
        self.allowed_next_states().contains(&next)
    }

    /// Reject a transition that leaves the forward-only path.
    pub fn check_transition(self, next: Self) -> Result<()> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(Error::InvalidTransition {
                from: self,
                to: next,
            })
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// String representation used in SQL storage and query strings.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Processing => "PROCESSING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for ResearchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResearchStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PENDING" => Ok(Self::Pending),
            "PROCESSING" => Ok(Self::Processing),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            other => Err(Error::validation(
                "status",
                format!(
                    "Invalid status '{}'. Must be one of: PENDING, PROCESSING, COMPLETED, FAILED",
                    other
                ),
            )),
        }
    }
}

/// One research request and its full lifecycle record.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResearchSession {
    pub id: Uuid,
    pub user_id: String,
    pub query: String,
    pub status: ResearchStatus,
    pub report: Option<serde_json::Value>,
    pub summary: Option<String>,
    pub reasoning: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub parent_session_id: Option<Uuid>,
    pub trace_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl ResearchSession {
    /// A fresh PENDING session.
    pub fn new(user_id: &str, query: &str, parent_session_id: Option<Uuid>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            query: query.to_string(),
            status: ResearchStatus::Pending,
            report: None,
            summary: None,
            reasoning: None,
            error_message: None,
            parent_session_id,
            trace_id: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
        }
    }

    pub fn is_continuation(&self) -> bool {
        self.parent_session_id.is_some()
    }

    /// Wall-clock time from creation to the terminal transition.
    pub fn duration(&self) -> Option<Duration> {
        self.completed_at.map(|done| done - self.created_at)
    }

    /// Apply a transition in memory, enforcing the state machine and the
    /// field invariants that go with it.
    pub fn apply_transition(
        &mut self,
        next: ResearchStatus,
        payload: TransitionPayload,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.status.check_transition(next)?;
        payload.check_for(next)?;

        match next {
            ResearchStatus::Processing => {
                self.started_at = Some(now);
            }
            ResearchStatus::Completed => {
                self.report = payload.report;
                self.summary = payload.summary;
                self.reasoning = payload.reasoning;
                self.completed_at = Some(now);
            }
            ResearchStatus::Failed => {
                self.error_message = payload.error_message;
                self.completed_at = Some(now);
            }
            ResearchStatus::Pending => {}
        }

        self.status = next;
        self.updated_at = now;
        Ok(())
    }
}

/// Data written together with a status change.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransitionPayload {
    pub report: Option<serde_json::Value>,
    pub summary: Option<String>,
    pub reasoning: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub cost: Option<NewResearchCost>,
}

impl TransitionPayload {
    pub fn completed(
        report: serde_json::Value,
        summary: String,
        reasoning: serde_json::Value,
        cost: NewResearchCost,
    ) -> Self {
        Self {
            report: Some(report),
            summary: Some(summary),
            reasoning: Some(reasoning),
            error_message: None,
            cost: Some(cost),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            error_message: Some(message.into()),
            ..Self::default()
        }
    }

    /// The payload must carry exactly what the target status requires.
    fn check_for(&self, next: ResearchStatus) -> Result<()> {
        match next {
            ResearchStatus::Completed if self.report.is_none() || self.summary.is_none() => {
                Err(Error::Internal(
                    "completed transition requires report and summary".to_string(),
                ))
            }
            ResearchStatus::Failed if self.error_message.is_none() => Err(Error::Internal(
                "failed transition requires an error message".to_string(),
            )),
            ResearchStatus::Completed => Ok(()),
            _ if self.cost.is_some() => Err(Error::Internal(
                "cost can only be recorded on completion".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

/// Result of trying to take ownership of a PENDING session.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    /// This caller performed the PENDING → PROCESSING write.
    Claimed(ResearchSession),
    /// Someone else already moved the session on.
    NotClaimable(ResearchStatus),
}

/// Filters for listing sessions. All set filters must match.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionFilters {
    pub status: Option<ResearchStatus>,
    pub query_contains: Option<String>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl SessionFilters {
    pub const MAX_PAGE_SIZE: i64 = 100;

    /// In-memory equivalent of the SQL WHERE clause.
    pub fn matches(&self, session: &ResearchSession) -> bool {
        if let Some(status) = self.status {
            if session.status != status {
                return false;
            }
        }
        if let Some(needle) = &self.query_contains {
            if !session
                .query
                .to_lowercase()
                .contains(&needle.to_lowercase())
            {
                return false;
            }
        }
        if let Some(after) = self.created_after {
            if session.created_at < after {
                return false;
            }
        }
        if let Some(before) = self.created_before {
            if session.created_at > before {
                return false;
            }
        }
        true
    }
}

/// Allowed context document types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FileType {
    Pdf,
    Txt,
    Doc,
    Docx,
}

impl FileType {
    pub const ALL: [FileType; 4] = [FileType::Pdf, FileType::Txt, FileType::Doc, FileType::Docx];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pdf => "PDF",
            Self::Txt => "TXT",
            Self::Doc => "DOC",
            Self::Docx => "DOCX",
        }
    }

    pub const fn extension(self) -> &'static str {
        match self {
            Self::Pdf => "pdf",
            Self::Txt => "txt",
            Self::Doc => "doc",
            Self::Docx => "docx",
        }
    }

    pub fn from_mime(mime: &str) -> Option<Self> {
        match mime {
            "application/pdf" => Some(Self::Pdf),
            "text/plain" => Some(Self::Txt),
            "application/msword" => Some(Self::Doc),
            "application/vnd.openxmlformats-officedocument.wordprocessingml.document" => {
                Some(Self::Docx)
            }
            _ => None,
        }
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FileType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "PDF" => Ok(Self::Pdf),
            "TXT" => Ok(Self::Txt),
            "DOC" => Ok(Self::Doc),
            "DOCX" => Ok(Self::Docx),
            other => Err(Error::validation(
                "file_type",
                format!("Unsupported file type '{}'", other),
            )),
        }
    }
}

/// Context document attached to a session.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResearchFile {
    pub id: Uuid,
    pub session_id: Uuid,
    pub filename: String,
    pub file_type: FileType,
    pub file_size: i64,
    pub content_summary: Option<String>,
    pub is_processed: bool,
    pub processing_error: Option<String>,
    pub uploaded_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl ResearchFile {
    /// Processed files with a summary are the only ones injected as context.
    pub fn is_usable_context(&self) -> bool {
        self.is_processed && self.content_summary.is_some()
    }
}

/// Validated metadata for a file about to be stored.
#[derive(Debug, Clone, PartialEq)]
pub struct NewResearchFile {
    pub filename: String,
    pub file_type: FileType,
    pub file_size: i64,
}

/// Token counts for one model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelUsage {
    pub input: i64,
    pub output: i64,
}

/// Token usage reported by the research workflow or the tracer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub input_tokens: i64,
    #[serde(default)]
    pub output_tokens: i64,
    /// Per-model breakdown, keyed by `provider:model` or bare model name.
    #[serde(default)]
    pub model_usage: BTreeMap<String, ModelUsage>,
}

impl TokenUsage {
    pub fn is_empty(&self) -> bool {
        self.input_tokens == 0 && self.output_tokens == 0
    }
}

/// Cost row to be written. `total_tokens` is derived, never supplied.
#[derive(Debug, Clone, PartialEq)]
pub struct NewResearchCost {
    input_tokens: i64,
    output_tokens: i64,
    total_tokens: i64,
    estimated_cost: f64,
    provider_costs: BTreeMap<String, f64>,
}

impl NewResearchCost {
    pub fn new(
        input_tokens: i64,
        output_tokens: i64,
        estimated_cost: f64,
        provider_costs: BTreeMap<String, f64>,
    ) -> Result<Self> {
        if input_tokens < 0 || output_tokens < 0 {
            return Err(Error::Internal("token counts must be non-negative".to_string()));
        }
        if !estimated_cost.is_finite() || estimated_cost < 0.0 {
            return Err(Error::Internal("estimated cost must be non-negative".to_string()));
        }
        let total_tokens = input_tokens
            .checked_add(output_tokens)
            .ok_or_else(|| Error::Execution("Reported token usage is out of range".to_string()))?;
        Ok(Self {
            input_tokens,
            output_tokens,
            total_tokens,
            estimated_cost,
            provider_costs,
        })
    }

    pub fn input_tokens(&self) -> i64 {
        self.input_tokens
    }

    pub fn output_tokens(&self) -> i64 {
        self.output_tokens
    }

    pub fn total_tokens(&self) -> i64 {
        self.total_tokens
    }

    pub fn estimated_cost(&self) -> f64 {
        self.estimated_cost
    }

    pub fn provider_costs(&self) -> &BTreeMap<String, f64> {
        &self.provider_costs
    }

    /// Materialize as a stored row.
    pub fn into_cost(self, session_id: Uuid, now: DateTime<Utc>) -> ResearchCost {
        ResearchCost {
            session_id,
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
            total_tokens: self.total_tokens,
            estimated_cost: self.estimated_cost,
            provider_costs: self.provider_costs,
            currency: ResearchCost::CURRENCY.to_string(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Token usage and cost for one session.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResearchCost {
    pub session_id: Uuid,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub total_tokens: i64,
    pub estimated_cost: f64,
    pub provider_costs: BTreeMap<String, f64>,
    pub currency: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ResearchCost {
    pub const CURRENCY: &'static str = "USD";

    pub fn cost_per_token(&self) -> f64 {
        if self.total_tokens > 0 {
            self.estimated_cost / self.total_tokens as f64
        } else {
            0.0
        }
    }
}

/// Aggregated spend for one user.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CostTotals {
    pub total_cost: f64,
    pub total_tokens: i64,
    pub session_count: i64,
}
