//! Tracing of research runs in LangSmith.
//!
//! Traces are optional. A session can complete without one, so callers treat
//! every tracer error as recoverable.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::debug;
use uuid::Uuid;

use crate::config::{Config, LangSmithConfig};
use crate::models::{ModelUsage, ResearchSession, TokenUsage};
use crate::secrets::SecretsCache;
use crate::{Error, Result};

/// An open trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceHandle {
    pub trace_id: String,
}

/// How a traced run ended.
#[derive(Debug, Clone, Copy)]
pub enum TraceOutcome<'a> {
    Completed { summary: &'a str },
    Failed { error: &'a str },
}

#[async_trait]
pub trait Tracer: Send + Sync {
    /// Start a root run for the session.
    async fn open_trace(&self, session: &ResearchSession) -> Result<TraceHandle>;

    /// Close a run opened by `open_trace`.
    async fn finish_trace(&self, trace_id: &str, outcome: TraceOutcome<'_>) -> Result<()>;

    /// Token usage recorded under the trace, if the service has any.
    async fn usage(&self, trace_id: &str) -> Result<Option<TokenUsage>>;
}

/// Tracer used when no LangSmith key is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledTracer;

#[async_trait]
impl Tracer for DisabledTracer {
    async fn open_trace(&self, _session: &ResearchSession) -> Result<TraceHandle> {
        Err(Error::Config("tracing is disabled".to_string()))
    }

    async fn finish_trace(&self, _trace_id: &str, _outcome: TraceOutcome<'_>) -> Result<()> {
        Ok(())
    }

    async fn usage(&self, _trace_id: &str) -> Result<Option<TokenUsage>> {
        Ok(None)
    }
}

/// Run as returned by `GET /runs/{id}`.
#[derive(Debug, Deserialize)]
struct RunRecord {
    #[serde(default)]
    prompt_tokens: Option<i64>,
    #[serde(default)]
    completion_tokens: Option<i64>,
    #[serde(default)]
    extra: Option<serde_json::Value>,
}

impl RunRecord {
    fn into_usage(self) -> Option<TokenUsage> {
        let input_tokens = self.prompt_tokens.unwrap_or(0).max(0);
        let output_tokens = self.completion_tokens.unwrap_or(0).max(0);
        if input_tokens == 0 && output_tokens == 0 {
            return None;
        }

        let model = self.extra.as_ref().and_then(|extra| {
            let metadata = extra.get("metadata")?;
            let name = metadata.get("ls_model_name")?.as_str()?;
            Some(match metadata.get("ls_provider").and_then(|p| p.as_str()) {
                Some(provider) => format!("{}:{}", provider, name),
                None => name.to_string(),
            })
        });

        let mut model_usage = BTreeMap::new();
        if let Some(model) = model {
            model_usage.insert(
                model,
                ModelUsage {
                    input: input_tokens,
                    output: output_tokens,
                },
            );
        }

        Some(TokenUsage {
            input_tokens,
            output_tokens,
            model_usage,
        })
    }
}

/// LangSmith when a key is configured, otherwise the disabled tracer.
pub async fn tracer_from_config(config: &Config, secrets: &SecretsCache) -> Result<Arc<dyn Tracer>> {
    match &config.langsmith {
        Some(langsmith) => {
            let api_key = secrets.get_secret(&langsmith.api_key_secret_arn).await?;
            Ok(Arc::new(LangSmithTracer::new(langsmith, api_key.trim().to_string())?))
        }
        None => {
            debug!("LangSmith not configured, tracing disabled");
            Ok(Arc::new(DisabledTracer))
        }
    }
}

/// LangSmith REST client.
pub struct LangSmithTracer {
    http_client: reqwest::Client,
    endpoint: String,
    project: String,
    api_key: String,
}

impl LangSmithTracer {
    pub fn new(config: &LangSmithConfig, api_key: String) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            project: config.project.clone(),
            api_key,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.endpoint, path)
    }

    async fn check(response: reqwest::Response, action: &str) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let error_text = response.text().await.unwrap_or_default();
        let message = format!("LangSmith {} failed ({}): {}", action, status, error_text);
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            Err(Error::TransientInfra(message))
        } else {
            Err(Error::Internal(message))
        }
    }
}

fn request_error(action: &str, e: reqwest::Error) -> Error {
    Error::TransientInfra(format!("LangSmith {} request failed: {}", action, e))
}

#[async_trait]
impl Tracer for LangSmithTracer {
    async fn open_trace(&self, session: &ResearchSession) -> Result<TraceHandle> {
        let run_id = Uuid::new_v4();
        let body = serde_json::json!({
            "id": run_id,
            "name": "research_session",
            "run_type": "chain",
            "session_name": self.project,
            "start_time": Utc::now().to_rfc3339(),
            "inputs": { "query": session.query },
            "extra": {
                "metadata": {
                    "session_id": session.id,
                    "user_id": session.user_id,
                    "parent_session_id": session.parent_session_id,
                }
            },
        });

        let response = self
            .http_client
            .post(self.url("/runs"))
            .header("x-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| request_error("create run", e))?;
        Self::check(response, "create run").await?;

        debug!(session_id = %session.id, trace_id = %run_id, "Opened LangSmith trace");
        Ok(TraceHandle {
            trace_id: run_id.to_string(),
        })
    }

    async fn finish_trace(&self, trace_id: &str, outcome: TraceOutcome<'_>) -> Result<()> {
        let mut body = serde_json::json!({ "end_time": Utc::now().to_rfc3339() });
        match outcome {
            TraceOutcome::Completed { summary } => {
                body["outputs"] = serde_json::json!({ "summary": summary });
            }
            TraceOutcome::Failed { error } => {
                body["error"] = serde_json::Value::String(error.to_string());
            }
        }

        let response = self
            .http_client
            .patch(self.url(&format!("/runs/{}", trace_id)))
            .header("x-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| request_error("update run", e))?;
        Self::check(response, "update run").await?;
        Ok(())
    }

    async fn usage(&self, trace_id: &str) -> Result<Option<TokenUsage>> {
        let response = self
            .http_client
            .get(self.url(&format!("/runs/{}", trace_id)))
            .header("x-api-key", &self.api_key)
            .send()
            .await
            .map_err(|e| request_error("read run", e))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let record: RunRecord = Self::check(response, "read run")
            .await?
            .json()
            .await
            .map_err(|e| Error::Internal(format!("Failed to parse LangSmith run: {}", e)))?;

        Ok(record.into_usage())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_record_usage_with_model() {
        let record: RunRecord = serde_json::from_value(serde_json::json!({
            "prompt_tokens": 1000,
            "completion_tokens": 250,
            "extra": {"metadata": {"ls_model_name": "gpt-4o", "ls_provider": "openai"}}
        }))
        .unwrap();

        let usage = record.into_usage().unwrap();
        assert_eq!(usage.input_tokens, 1000);
        assert_eq!(usage.model_usage["openai:gpt-4o"].output, 250);
    }

    #[test]
    fn test_run_record_without_tokens() {
        let record: RunRecord = serde_json::from_value(serde_json::json!({"name": "root"})).unwrap();
        assert!(record.into_usage().is_none());
    }

    #[tokio::test]
    async fn test_disabled_tracer_never_opens() {
        let session = ResearchSession::new("user-1", "query", None);
        assert!(DisabledTracer.open_trace(&session).await.is_err());
        assert!(DisabledTracer.usage("abc").await.unwrap().is_none());
    }
}
