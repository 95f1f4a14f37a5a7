//! Client for the external research agent.

use async_trait::async_trait;
use aws_sdk_lambda::primitives::Blob;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::models::TokenUsage;
use crate::{Error, Result};

/// Characters of the final report used as a summary when the agent sends no brief.
const SUMMARY_FALLBACK_CHARS: usize = 500;

/// One call into the research workflow.
#[derive(Debug, Clone, Serialize)]
pub struct RunRequest {
    pub session_id: Uuid,
    pub user_id: String,
    pub query: String,
    /// Continuation and file context, prepended by the agent to its prompt
    pub context: Option<String>,
    /// Trace the agent should report its runs under
    pub trace_id: Option<String>,
}

/// What a successful run hands back.
#[derive(Debug, Clone, PartialEq)]
pub struct RunResult {
    pub report: serde_json::Value,
    pub summary: String,
    /// Unfiltered; sanitize before storing
    pub reasoning: serde_json::Value,
    pub usage: Option<TokenUsage>,
}

/// Executes a research query end to end.
#[async_trait]
pub trait ResearchRunner: Send + Sync {
    /// Run the workflow once.
    ///
    /// Errors must be classified: `TransientInfra` or `Timeout` for failures
    /// worth retrying, `Execution` for permanent ones.
    async fn execute(&self, request: RunRequest) -> Result<RunResult>;
}

/// Response payload from the agent Lambda.
#[derive(Debug, Deserialize)]
pub struct AgentResponse {
    /// "success" or "error"
    pub status: String,
    #[serde(default)]
    pub final_report: Option<String>,
    #[serde(default)]
    pub research_brief: Option<String>,
    #[serde(default)]
    pub notes: Vec<String>,
    /// Free-form reasoning data, may include internals
    #[serde(default)]
    pub reasoning: Option<serde_json::Value>,
    #[serde(default)]
    pub usage: Option<TokenUsage>,
    #[serde(default)]
    pub error: Option<String>,
}

impl AgentResponse {
    /// Convert into a run result, rejecting error or empty responses.
    pub fn into_result(self) -> Result<RunResult> {
        if self.status == "error" {
            return Err(Error::Execution(
                self.error.unwrap_or_else(|| "agent reported an error".to_string()),
            ));
        }

        let final_report = self
            .final_report
            .filter(|r| !r.trim().is_empty())
            .ok_or_else(|| Error::Execution("agent returned no final report".to_string()))?;

        let brief = self.research_brief.filter(|b| !b.trim().is_empty());
        let summary = match &brief {
            Some(brief) => brief.clone(),
            None => final_report.chars().take(SUMMARY_FALLBACK_CHARS).collect(),
        };

        let mut reasoning = match self.reasoning {
            Some(serde_json::Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        };
        reasoning
            .entry("research_brief")
            .or_insert_with(|| serde_json::Value::String(brief.unwrap_or_default()));
        reasoning
            .entry("methodology")
            .or_insert_with(|| serde_json::Value::String("Multi-step AI research workflow".to_string()));

        Ok(RunResult {
            report: serde_json::json!({
                "final_report": final_report,
                "notes": self.notes,
                "sources": [],
            }),
            summary,
            reasoning: serde_json::Value::Object(reasoning),
            usage: self.usage.filter(|u| !u.is_empty()),
        })
    }
}

/// Runner backed by the research agent Lambda.
pub struct AgentClient {
    /// Lambda client for invoking agent Lambda
    lambda_client: aws_sdk_lambda::Client,
    /// Agent Lambda function name/ARN
    agent_function_name: String,
}

impl AgentClient {
    /// Create a new agent client.
    pub fn new(lambda_client: aws_sdk_lambda::Client, agent_function_name: String) -> Self {
        Self {
            lambda_client,
            agent_function_name,
        }
    }
}

#[async_trait]
impl ResearchRunner for AgentClient {
    async fn execute(&self, request: RunRequest) -> Result<RunResult> {
        let payload = serde_json::to_vec(&request)?;

        info!(
            session_id = %request.session_id,
            function = %self.agent_function_name,
            "Invoking research agent"
        );

        let response = self
            .lambda_client
            .invoke()
            .function_name(&self.agent_function_name)
            .payload(Blob::new(payload))
            .send()
            .await
            .map_err(|e| {
                let permanent = e.as_service_error().map_or(false, |se| {
                    se.is_resource_not_found_exception() || se.is_invalid_request_content_exception()
                });
                if permanent {
                    Error::Execution(format!("Failed to invoke agent: {}", e))
                } else {
                    Error::TransientInfra(format!("Failed to invoke agent: {}", e))
                }
            })?;

        if let Some(function_error) = response.function_error() {
            warn!(session_id = %request.session_id, function_error, "Research agent raised an error");
            return Err(Error::Execution(format!("agent function error: {}", function_error)));
        }

        let response_payload = response
            .payload()
            .ok_or_else(|| Error::Execution("No response payload from agent".to_string()))?;

        let agent_response: AgentResponse = serde_json::from_slice(response_payload.as_ref())
            .map_err(|e| Error::Execution(format!("Failed to parse agent response: {}", e)))?;

        agent_response.into_result()
    }
}
