//! Postgres-backed session store.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use super::{SessionStore, FILE_NOT_FOUND, PARENT_REJECTED, SESSION_NOT_FOUND};
use crate::models::{
    ClaimOutcome, CostTotals, FileType, NewResearchCost, NewResearchFile, ResearchCost,
    ResearchFile, ResearchSession, ResearchStatus, SessionFilters, TransitionPayload,
};
use crate::validation::validate_query;
use crate::{Error, Result};

const SESSION_COLUMNS: &str = "id, user_id, query, status, report, summary, reasoning, \
     error_message, parent_session_id, trace_id, created_at, started_at, completed_at, updated_at";

const FILE_COLUMNS: &str = "id, session_id, filename, file_type, file_size, content_summary, \
     is_processed, processing_error, uploaded_at, processed_at";

const COST_COLUMNS: &str = "session_id, input_tokens, output_tokens, total_tokens, \
     estimated_cost::float8 AS estimated_cost, provider_costs, currency, created_at, updated_at";

#[derive(Debug, sqlx::FromRow)]
struct SessionRow {
    id: Uuid,
    user_id: String,
    query: String,
    status: String,
    report: Option<serde_json::Value>,
    summary: Option<String>,
    reasoning: Option<serde_json::Value>,
    error_message: Option<String>,
    parent_session_id: Option<Uuid>,
    trace_id: Option<String>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<SessionRow> for ResearchSession {
    type Error = Error;

    fn try_from(row: SessionRow) -> Result<Self> {
        let status = row
            .status
            .parse()
            .map_err(|_| Error::Internal(format!("unknown stored status '{}'", row.status)))?;
        Ok(Self {
            id: row.id,
            user_id: row.user_id,
            query: row.query,
            status,
            report: row.report,
            summary: row.summary,
            reasoning: row.reasoning,
            error_message: row.error_message,
            parent_session_id: row.parent_session_id,
            trace_id: row.trace_id,
            created_at: row.created_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct FileRow {
    id: Uuid,
    session_id: Uuid,
    filename: String,
    file_type: String,
    file_size: i64,
    content_summary: Option<String>,
    is_processed: bool,
    processing_error: Option<String>,
    uploaded_at: DateTime<Utc>,
    processed_at: Option<DateTime<Utc>>,
}

impl TryFrom<FileRow> for ResearchFile {
    type Error = Error;

    fn try_from(row: FileRow) -> Result<Self> {
        let file_type: FileType = row
            .file_type
            .parse()
            .map_err(|_| Error::Internal(format!("unknown stored file type '{}'", row.file_type)))?;
        Ok(Self {
            id: row.id,
            session_id: row.session_id,
            filename: row.filename,
            file_type,
            file_size: row.file_size,
            content_summary: row.content_summary,
            is_processed: row.is_processed,
            processing_error: row.processing_error,
            uploaded_at: row.uploaded_at,
            processed_at: row.processed_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct CostRow {
    session_id: Uuid,
    input_tokens: i64,
    output_tokens: i64,
    total_tokens: i64,
    estimated_cost: f64,
    provider_costs: Json<BTreeMap<String, f64>>,
    currency: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<CostRow> for ResearchCost {
    fn from(row: CostRow) -> Self {
        Self {
            session_id: row.session_id,
            input_tokens: row.input_tokens,
            output_tokens: row.output_tokens,
            total_tokens: row.total_tokens,
            estimated_cost: row.estimated_cost,
            provider_costs: row.provider_costs.0,
            currency: row.currency,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

fn sessions_from(rows: Vec<SessionRow>) -> Result<Vec<ResearchSession>> {
    rows.into_iter().map(ResearchSession::try_from).collect()
}

fn files_from(rows: Vec<FileRow>) -> Result<Vec<ResearchFile>> {
    rows.into_iter().map(ResearchFile::try_from).collect()
}

/// Escape LIKE wildcards so a search term matches literally.
fn like_pattern(term: &str) -> String {
    let escaped = term
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{}%", escaped)
}

/// Session store over the research tables in Postgres.
#[derive(Clone)]
pub struct PgSessionStore {
    pool: PgPool,
}

impl PgSessionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn lock_session(
        tx: &mut Transaction<'_, Postgres>,
        session_id: Uuid,
    ) -> Result<ResearchSession> {
        let row: Option<SessionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM research_sessions WHERE id = $1 FOR UPDATE",
            SESSION_COLUMNS
        ))
        .bind(session_id)
        .fetch_optional(&mut **tx)
        .await?;

        row.ok_or_else(|| Error::NotFound(SESSION_NOT_FOUND.to_string()))?
            .try_into()
    }

    async fn upsert_cost(
        tx: &mut Transaction<'_, Postgres>,
        session_id: Uuid,
        cost: &NewResearchCost,
        now: DateTime<Utc>,
    ) -> Result<ResearchCost> {
        let row: CostRow = sqlx::query_as(&format!(
            r#"
            INSERT INTO research_costs
                (session_id, input_tokens, output_tokens, total_tokens, estimated_cost,
                 provider_costs, currency, created_at, updated_at)
            VALUES ($1, $2, $3, $4, ROUND($5::numeric, 4), $6, $7, $8, $8)
            ON CONFLICT (session_id) DO UPDATE SET
                input_tokens = EXCLUDED.input_tokens,
                output_tokens = EXCLUDED.output_tokens,
                total_tokens = EXCLUDED.total_tokens,
                estimated_cost = EXCLUDED.estimated_cost,
                provider_costs = EXCLUDED.provider_costs,
                updated_at = EXCLUDED.updated_at
            RETURNING {}
            "#,
            COST_COLUMNS
        ))
        .bind(session_id)
        .bind(cost.input_tokens())
        .bind(cost.output_tokens())
        .bind(cost.total_tokens())
        .bind(cost.estimated_cost())
        .bind(Json(cost.provider_costs()))
        .bind(ResearchCost::CURRENCY)
        .bind(now)
        .fetch_one(&mut **tx)
        .await?;

        Ok(row.into())
    }
}

#[async_trait]
impl SessionStore for PgSessionStore {
    async fn create(
        &self,
        user_id: &str,
        query: &str,
        parent_id: Option<Uuid>,
    ) -> Result<ResearchSession> {
        let query = validate_query(query)?;

        if let Some(parent_id) = parent_id {
            // Terminal statuses never change, so a check-then-insert cannot race.
            let usable: Option<bool> = sqlx::query_scalar(
                "SELECT status = 'COMPLETED' FROM research_sessions WHERE id = $1 AND user_id = $2",
            )
            .bind(parent_id)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;

            if usable != Some(true) {
                return Err(Error::validation("parent_session_id", PARENT_REJECTED));
            }
        }

        let session = ResearchSession::new(user_id, &query, parent_id);
        let row: SessionRow = sqlx::query_as(&format!(
            r#"
            INSERT INTO research_sessions
                (id, user_id, query, status, parent_session_id, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $6)
            RETURNING {}
            "#,
            SESSION_COLUMNS
        ))
        .bind(session.id)
        .bind(&session.user_id)
        .bind(&session.query)
        .bind(session.status.as_str())
        .bind(session.parent_session_id)
        .bind(session.created_at)
        .fetch_one(&self.pool)
        .await?;

        row.try_into()
    }

    async fn get(&self, session_id: Uuid, user_id: &str) -> Result<ResearchSession> {
        let row: Option<SessionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM research_sessions WHERE id = $1 AND user_id = $2",
            SESSION_COLUMNS
        ))
        .bind(session_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        row.ok_or_else(|| Error::NotFound(SESSION_NOT_FOUND.to_string()))?
            .try_into()
    }

    async fn list(&self, user_id: &str, filters: &SessionFilters) -> Result<Vec<ResearchSession>> {
        let rows: Vec<SessionRow> = sqlx::query_as(&format!(
            r#"
            SELECT {}
            FROM research_sessions
            WHERE user_id = $1
              AND ($2::text IS NULL OR status = $2)
              AND ($3::text IS NULL OR query ILIKE $3)
              AND ($4::timestamptz IS NULL OR created_at >= $4)
              AND ($5::timestamptz IS NULL OR created_at <= $5)
            ORDER BY created_at DESC
            LIMIT $6 OFFSET $7
            "#,
            SESSION_COLUMNS
        ))
        .bind(user_id)
        .bind(filters.status.map(ResearchStatus::as_str))
        .bind(filters.query_contains.as_deref().map(like_pattern))
        .bind(filters.created_after)
        .bind(filters.created_before)
        .bind(filters.limit)
        .bind(filters.offset.unwrap_or(0))
        .fetch_all(&self.pool)
        .await?;

        sessions_from(rows)
    }

    async fn children(&self, session_id: Uuid, user_id: &str) -> Result<Vec<ResearchSession>> {
        self.get(session_id, user_id).await?;

        let rows: Vec<SessionRow> = sqlx::query_as(&format!(
            r#"
            SELECT {}
            FROM research_sessions
            WHERE parent_session_id = $1 AND user_id = $2
            ORDER BY created_at ASC
            "#,
            SESSION_COLUMNS
        ))
        .bind(session_id)
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        sessions_from(rows)
    }

    async fn claim(&self, session_id: Uuid) -> Result<ClaimOutcome> {
        let now = Utc::now();
        let claimed: Option<SessionRow> = sqlx::query_as(&format!(
            r#"
            UPDATE research_sessions
            SET status = 'PROCESSING', started_at = $2, updated_at = $2
            WHERE id = $1 AND status = 'PENDING'
            RETURNING {}
            "#,
            SESSION_COLUMNS
        ))
        .bind(session_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = claimed {
            return Ok(ClaimOutcome::Claimed(row.try_into()?));
        }

        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM research_sessions WHERE id = $1")
                .bind(session_id)
                .fetch_optional(&self.pool)
                .await?;

        match status {
            Some(status) => Ok(ClaimOutcome::NotClaimable(status.parse().map_err(|_| {
                Error::Internal(format!("unknown stored status '{}'", status))
            })?)),
            None => Err(Error::NotFound(SESSION_NOT_FOUND.to_string())),
        }
    }

    async fn attach_trace(&self, session_id: Uuid, trace_id: &str) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE research_sessions
            SET trace_id = $2, updated_at = now()
            WHERE id = $1 AND status = 'PROCESSING'
            "#,
        )
        .bind(session_id)
        .bind(trace_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::InvalidState(
                "trace can only be attached while PROCESSING".to_string(),
            ));
        }
        Ok(())
    }

    async fn transition(
        &self,
        session_id: Uuid,
        next: ResearchStatus,
        payload: TransitionPayload,
    ) -> Result<ResearchSession> {
        let now = Utc::now();
        let cost = payload.cost.clone();

        let mut tx = self.pool.begin().await?;
        let mut session = Self::lock_session(&mut tx, session_id).await?;
        session.apply_transition(next, payload, now)?;

        sqlx::query(
            r#"
            UPDATE research_sessions
            SET status = $2, report = $3, summary = $4, reasoning = $5,
                error_message = $6, started_at = $7, completed_at = $8, updated_at = $9
            WHERE id = $1
            "#,
        )
        .bind(session.id)
        .bind(session.status.as_str())
        .bind(&session.report)
        .bind(&session.summary)
        .bind(&session.reasoning)
        .bind(&session.error_message)
        .bind(session.started_at)
        .bind(session.completed_at)
        .bind(session.updated_at)
        .execute(&mut *tx)
        .await?;

        if let Some(cost) = cost {
            Self::upsert_cost(&mut tx, session_id, &cost, now).await?;
        }

        tx.commit().await?;
        Ok(session)
    }

    async fn stale(
        &self,
        status: ResearchStatus,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<ResearchSession>> {
        let rows: Vec<SessionRow> = sqlx::query_as(&format!(
            r#"
            SELECT {}
            FROM research_sessions
            WHERE status = $1
              AND (CASE WHEN status = 'PROCESSING'
                        THEN COALESCE(started_at, created_at)
                        ELSE created_at END) < $2
            ORDER BY created_at ASC
            LIMIT $3
            "#,
            SESSION_COLUMNS
        ))
        .bind(status.as_str())
        .bind(older_than)
        .bind(limit.max(0))
        .fetch_all(&self.pool)
        .await?;

        sessions_from(rows)
    }

    async fn insert_file(
        &self,
        session_id: Uuid,
        user_id: &str,
        file: NewResearchFile,
    ) -> Result<ResearchFile> {
        self.get(session_id, user_id).await?;

        let row: FileRow = sqlx::query_as(&format!(
            r#"
            INSERT INTO research_files (id, session_id, filename, file_type, file_size, uploaded_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING {}
            "#,
            FILE_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(session_id)
        .bind(&file.filename)
        .bind(file.file_type.as_str())
        .bind(file.file_size)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;

        row.try_into()
    }

    async fn mark_file_processed(&self, file_id: Uuid, summary: &str) -> Result<ResearchFile> {
        let row: Option<FileRow> = sqlx::query_as(&format!(
            r#"
            UPDATE research_files
            SET is_processed = TRUE, content_summary = $2, processing_error = NULL, processed_at = $3
            WHERE id = $1
            RETURNING {}
            "#,
            FILE_COLUMNS
        ))
        .bind(file_id)
        .bind(summary)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await?;

        row.ok_or_else(|| Error::NotFound(FILE_NOT_FOUND.to_string()))?
            .try_into()
    }

    async fn mark_file_failed(&self, file_id: Uuid, error: &str) -> Result<ResearchFile> {
        let row: Option<FileRow> = sqlx::query_as(&format!(
            r#"
            UPDATE research_files
            SET is_processed = FALSE, processing_error = $2
            WHERE id = $1
            RETURNING {}
            "#,
            FILE_COLUMNS
        ))
        .bind(file_id)
        .bind(error)
        .fetch_optional(&self.pool)
        .await?;

        row.ok_or_else(|| Error::NotFound(FILE_NOT_FOUND.to_string()))?
            .try_into()
    }

    async fn list_files(&self, session_id: Uuid, user_id: &str) -> Result<Vec<ResearchFile>> {
        self.get(session_id, user_id).await?;

        let rows: Vec<FileRow> = sqlx::query_as(&format!(
            "SELECT {} FROM research_files WHERE session_id = $1 ORDER BY uploaded_at DESC",
            FILE_COLUMNS
        ))
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        files_from(rows)
    }

    async fn get_file(&self, session_id: Uuid, file_id: Uuid, user_id: &str) -> Result<ResearchFile> {
        self.get(session_id, user_id).await?;

        let row: Option<FileRow> = sqlx::query_as(&format!(
            "SELECT {} FROM research_files WHERE id = $1 AND session_id = $2",
            FILE_COLUMNS
        ))
        .bind(file_id)
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;

        row.ok_or_else(|| Error::NotFound(FILE_NOT_FOUND.to_string()))?
            .try_into()
    }

    async fn delete_file(&self, session_id: Uuid, file_id: Uuid, user_id: &str) -> Result<()> {
        self.get(session_id, user_id).await?;

        let result = sqlx::query("DELETE FROM research_files WHERE id = $1 AND session_id = $2")
            .bind(file_id)
            .bind(session_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(FILE_NOT_FOUND.to_string()));
        }
        Ok(())
    }

    async fn context_files(
        &self,
        session_id: Uuid,
        uploaded_before: DateTime<Utc>,
    ) -> Result<Vec<ResearchFile>> {
        let rows: Vec<FileRow> = sqlx::query_as(&format!(
            r#"
            SELECT {}
            FROM research_files
            WHERE session_id = $1
              AND is_processed
              AND content_summary IS NOT NULL
              AND uploaded_at <= $2
            ORDER BY uploaded_at ASC
            "#,
            FILE_COLUMNS
        ))
        .bind(session_id)
        .bind(uploaded_before)
        .fetch_all(&self.pool)
        .await?;

        files_from(rows)
    }

    async fn get_cost(&self, session_id: Uuid, user_id: &str) -> Result<Option<ResearchCost>> {
        self.get(session_id, user_id).await?;

        let row: Option<CostRow> = sqlx::query_as(&format!(
            "SELECT {} FROM research_costs WHERE session_id = $1",
            COST_COLUMNS
        ))
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Into::into))
    }

    async fn replace_cost(&self, session_id: Uuid, cost: NewResearchCost) -> Result<ResearchCost> {
        let mut tx = self.pool.begin().await?;
        let session = Self::lock_session(&mut tx, session_id).await?;
        if session.status != ResearchStatus::Completed {
            return Err(Error::InvalidState(format!(
                "Cost can only be recorded for completed sessions. Current status: {}",
                session.status
            )));
        }

        let row = Self::upsert_cost(&mut tx, session_id, &cost, Utc::now()).await?;
        tx.commit().await?;
        Ok(row)
    }

    async fn cost_totals(&self, user_id: &str, since: Option<DateTime<Utc>>) -> Result<CostTotals> {
        let (total_cost, total_tokens, session_count): (f64, i64, i64) = sqlx::query_as(
            r#"
            SELECT COALESCE(SUM(c.estimated_cost), 0)::float8,
                   COALESCE(SUM(c.total_tokens), 0)::int8,
                   COUNT(c.session_id)
            FROM research_costs c
            JOIN research_sessions s ON s.id = c.session_id
            WHERE s.user_id = $1
              AND ($2::timestamptz IS NULL OR c.created_at >= $2)
            "#,
        )
        .bind(user_id)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;

        Ok(CostTotals {
            total_cost,
            total_tokens,
            session_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_like_pattern_escapes_wildcards() {
        assert_eq!(like_pattern("climate"), "%climate%");
        assert_eq!(like_pattern("100%_done"), "%100\\%\\_done%");
    }

    #[test]
    fn test_unknown_status_is_internal() {
        let now = Utc::now();
        let row = SessionRow {
            id: Uuid::new_v4(),
            user_id: "user-1".to_string(),
            query: "q".to_string(),
            status: "ARCHIVED".to_string(),
            report: None,
            summary: None,
            reasoning: None,
            error_message: None,
            parent_session_id: None,
            trace_id: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
        };
        assert!(matches!(ResearchSession::try_from(row), Err(Error::Internal(_))));
    }
}
