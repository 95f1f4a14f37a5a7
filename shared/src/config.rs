//! Configuration management for Lambda functions.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::{Error, Result};

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Database host
    pub db_host: String,
    /// Database name
    pub db_name: String,
    /// ARN of the secret containing database credentials
    pub db_secret_arn: String,
    /// AWS region
    pub aws_region: String,
    /// Lambda running the external research agent
    pub research_agent_function: String,
    /// Lambda consuming queued research sessions
    pub executor_function: String,
    /// LangSmith settings, absent when tracing is disabled
    pub langsmith: Option<LangSmithConfig>,
    /// Execution timeouts and retry policy
    pub execution: ExecutionSettings,
    /// Upload limit in bytes
    pub max_file_size: u64,
    /// Interval suggested to pollers while a session is in flight
    pub poll_interval: Duration,
    /// PROCESSING sessions older than this are failed by the sweeper
    pub stuck_after: Duration,
    /// PENDING sessions older than this are re-enqueued by the sweeper
    pub requeue_after: Duration,
}

/// LangSmith tracing settings.
#[derive(Debug, Clone)]
pub struct LangSmithConfig {
    pub api_key_secret_arn: String,
    pub endpoint: String,
    pub project: String,
}

/// Timeout and retry knobs for the Execution Task.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionSettings {
    /// Wall-clock limit for one call into the research workflow
    pub run_timeout: Duration,
    /// Attempts including the first one
    pub max_attempts: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Backoff ceiling
    pub max_delay: Duration,
    /// Wall-clock limit for a whole run, measured from the claim. Attempts
    /// are cut short and retries stop once it is spent.
    pub run_budget: Duration,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            run_timeout: Duration::from_secs(300),
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
            run_budget: Duration::from_secs(DEFAULT_RUN_BUDGET_SECS),
        }
    }
}

impl ExecutionSettings {
    /// Backoff before retry number `attempt` (1-based): `base * 2^(attempt-1)`, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

pub const DEFAULT_MAX_FILE_SIZE: u64 = 10 * 1024 * 1024;

/// Lambda's hard ceiling on one invocation.
pub const LAMBDA_MAX_RUNTIME: Duration = Duration::from_secs(900);

/// Leaves room under the Lambda ceiling to record the outcome.
pub const DEFAULT_RUN_BUDGET_SECS: u64 = 780;

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let langsmith = env::var("LANGSMITH_API_KEY_SECRET_ARN")
            .ok()
            .filter(|arn| !arn.is_empty())
            .map(|api_key_secret_arn| LangSmithConfig {
                api_key_secret_arn,
                endpoint: env::var("LANGSMITH_ENDPOINT")
                    .unwrap_or_else(|_| "https://api.smith.langchain.com".to_string()),
                project: env::var("LANGSMITH_PROJECT")
                    .unwrap_or_else(|_| "research-sessions".to_string()),
            });

        let execution = ExecutionSettings {
            run_timeout: Duration::from_secs(parse_env("RESEARCH_TIMEOUT_SECS", 300)?),
            max_attempts: parse_env("RESEARCH_MAX_ATTEMPTS", 3)?,
            base_delay: Duration::from_millis(parse_env("RESEARCH_RETRY_BASE_MS", 2_000)?),
            max_delay: Duration::from_millis(parse_env("RESEARCH_RETRY_MAX_MS", 30_000)?),
            run_budget: Duration::from_secs(parse_env(
                "RESEARCH_RUN_BUDGET_SECS",
                DEFAULT_RUN_BUDGET_SECS,
            )?),
        };
        if execution.max_attempts == 0 {
            return Err(Error::Config("RESEARCH_MAX_ATTEMPTS must be at least 1".to_string()));
        }
        if execution.run_budget.is_zero() || execution.run_budget >= LAMBDA_MAX_RUNTIME {
            return Err(Error::Config(format!(
                "RESEARCH_RUN_BUDGET_SECS must be between 1 and {}",
                LAMBDA_MAX_RUNTIME.as_secs() - 1
            )));
        }

        Ok(Self {
            db_host: required("DATABASE_HOST")?,
            db_name: env::var("DATABASE_NAME").unwrap_or_else(|_| "research".to_string()),
            db_secret_arn: required("DATABASE_SECRET_ARN")?,
            aws_region: env::var("AWS_REGION").unwrap_or_else(|_| "us-east-1".to_string()),
            research_agent_function: env::var("RESEARCH_AGENT_FUNCTION_NAME")
                .unwrap_or_else(|_| "research-agent".to_string()),
            executor_function: env::var("RESEARCH_EXECUTOR_FUNCTION_NAME")
                .unwrap_or_else(|_| "research-executor".to_string()),
            langsmith,
            execution,
            max_file_size: parse_env("MAX_UPLOAD_BYTES", DEFAULT_MAX_FILE_SIZE)?,
            poll_interval: Duration::from_millis(parse_env("POLL_INTERVAL_MS", 3_000)?),
            stuck_after: Duration::from_secs(parse_env("STUCK_SESSION_SECS", 3_600)?),
            requeue_after: Duration::from_secs(parse_env("REQUEUE_PENDING_SECS", 300)?),
        })
    }
}

impl Config {
    /// AWS SDK configuration pinned to the configured region.
    pub async fn load_aws_config(&self) -> aws_config::SdkConfig {
        aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(self.aws_region.clone()))
            .load()
            .await
    }
}

fn required(name: &str) -> Result<String> {
    env::var(name).map_err(|_| Error::Config(format!("{} not set", name)))
}

fn parse_env<T: FromStr>(name: &str, default: T) -> Result<T> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| Error::Config(format!("{} has an invalid value: {}", name, raw))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let settings = ExecutionSettings {
            run_timeout: Duration::from_secs(1),
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            run_budget: Duration::from_secs(10),
        };
        assert_eq!(settings.backoff(1), Duration::from_millis(100));
        assert_eq!(settings.backoff(2), Duration::from_millis(200));
        assert_eq!(settings.backoff(3), Duration::from_millis(350));
        assert_eq!(settings.backoff(40), Duration::from_millis(350));
    }

    #[test]
    fn test_default_budget_fits_lambda_limit() {
        let settings = ExecutionSettings::default();
        assert!(settings.run_budget < LAMBDA_MAX_RUNTIME);
        // Unbounded, the default retry schedule would not fit.
        let worst_case = settings.run_timeout * settings.max_attempts
            + settings.backoff(1)
            + settings.backoff(2);
        assert!(worst_case > LAMBDA_MAX_RUNTIME);
    }

    #[test]
    fn test_parse_env_default() {
        let value: u64 = parse_env("RESEARCH_TEST_UNSET_VARIABLE", 42).unwrap();
        assert_eq!(value, 42);
    }
}
