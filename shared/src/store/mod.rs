//! Session Store: the only component that reads or writes research rows.
//!
//! Every lookup that takes a `user_id` is scoped to it. A row owned by someone
//! else is reported exactly like a missing row so callers cannot test for
//! other users' sessions.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{
    ClaimOutcome, CostTotals, NewResearchCost, NewResearchFile, ResearchCost, ResearchFile,
    ResearchSession, ResearchStatus, SessionFilters, TransitionPayload,
};
use crate::Result;

mod memory;
mod postgres;

pub use memory::MemorySessionStore;
pub use postgres::PgSessionStore;

pub(crate) const SESSION_NOT_FOUND: &str = "Research session";
pub(crate) const FILE_NOT_FOUND: &str = "Research file";
pub(crate) const PARENT_REJECTED: &str =
    "Parent session must be one of your completed research sessions";

/// Persistence for sessions, their files and their cost rows.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Insert a PENDING session with the trimmed query.
    ///
    /// Fails with `Validation` when the query is blank or too long, or when
    /// `parent_id` is not a COMPLETED session owned by `user_id`.
    async fn create(
        &self,
        user_id: &str,
        query: &str,
        parent_id: Option<Uuid>,
    ) -> Result<ResearchSession>;

    /// Fetch a session owned by `user_id`.
    async fn get(&self, session_id: Uuid, user_id: &str) -> Result<ResearchSession>;

    /// List the user's sessions, most recent first.
    async fn list(&self, user_id: &str, filters: &SessionFilters) -> Result<Vec<ResearchSession>>;

    /// Direct continuations of a session, oldest first.
    async fn children(&self, session_id: Uuid, user_id: &str) -> Result<Vec<ResearchSession>>;

    /// Atomically move PENDING → PROCESSING. Only one caller can win.
    async fn claim(&self, session_id: Uuid) -> Result<ClaimOutcome>;

    /// Record the trace id on a PROCESSING session.
    async fn attach_trace(&self, session_id: Uuid, trace_id: &str) -> Result<()>;

    /// Apply a status change with its payload in one write.
    ///
    /// Fails with `InvalidTransition` if the move leaves the forward-only path,
    /// including when another writer reached a terminal state first.
    async fn transition(
        &self,
        session_id: Uuid,
        next: ResearchStatus,
        payload: TransitionPayload,
    ) -> Result<ResearchSession>;

    /// Sessions in `status` whose last relevant timestamp is before `older_than`.
    /// PENDING uses `created_at`, PROCESSING uses `started_at`.
    async fn stale(
        &self,
        status: ResearchStatus,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<ResearchSession>>;

    /// Insert an unprocessed file record on a session owned by `user_id`.
    async fn insert_file(
        &self,
        session_id: Uuid,
        user_id: &str,
        file: NewResearchFile,
    ) -> Result<ResearchFile>;

    /// Store the summary and flag the file usable.
    async fn mark_file_processed(&self, file_id: Uuid, summary: &str) -> Result<ResearchFile>;

    /// Keep the file unprocessed and record why.
    async fn mark_file_failed(&self, file_id: Uuid, error: &str) -> Result<ResearchFile>;

    async fn list_files(&self, session_id: Uuid, user_id: &str) -> Result<Vec<ResearchFile>>;

    async fn get_file(&self, session_id: Uuid, file_id: Uuid, user_id: &str) -> Result<ResearchFile>;

    async fn delete_file(&self, session_id: Uuid, file_id: Uuid, user_id: &str) -> Result<()>;

    /// Processed files uploaded no later than `uploaded_before`, oldest first.
    async fn context_files(
        &self,
        session_id: Uuid,
        uploaded_before: DateTime<Utc>,
    ) -> Result<Vec<ResearchFile>>;

    async fn get_cost(&self, session_id: Uuid, user_id: &str) -> Result<Option<ResearchCost>>;

    /// Overwrite the cost row of a COMPLETED session (explicit recompute).
    async fn replace_cost(&self, session_id: Uuid, cost: NewResearchCost) -> Result<ResearchCost>;

    /// Spend across the user's sessions, optionally since a point in time.
    async fn cost_totals(&self, user_id: &str, since: Option<DateTime<Utc>>) -> Result<CostTotals>;
}
