//! Shared library for the research session Lambda functions.
//!
//! Holds the session lifecycle (store, execution, lineage, polling), file
//! ingestion, cost accounting and the clients for external services.

pub mod agents;
pub mod auth;
pub mod config;
pub mod costs;
pub mod db;
pub mod error;
pub mod execution;
pub mod http;
pub mod ingestion;
pub mod lineage;
pub mod models;
pub mod observability;
pub mod polling;
pub mod queue;
pub mod reasoning;
pub mod secrets;
pub mod sessions;
pub mod store;
pub mod validation;

#[cfg(test)]
pub(crate) mod testing;

pub use agents::{AgentClient, ResearchRunner, RunRequest, RunResult};
pub use auth::{authenticate, extract_user_from_context, AuthenticatedUser};
pub use config::{Config, ExecutionSettings};
pub use error::{Error, Result};
pub use execution::{ExecutionOutcome, ExecutionTask, SessionSweeper};
pub use models::{ResearchCost, ResearchFile, ResearchSession, ResearchStatus};
pub use observability::{tracer_from_config, DisabledTracer, LangSmithTracer, Tracer};
pub use queue::{LambdaTaskQueue, TaskQueue};
pub use secrets::{DatabaseCredentials, SecretsCache};
pub use store::{MemorySessionStore, PgSessionStore, SessionStore};
