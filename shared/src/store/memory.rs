//! In-process store used by tests and local runs.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{SessionStore, FILE_NOT_FOUND, PARENT_REJECTED, SESSION_NOT_FOUND};
use crate::models::{
    ClaimOutcome, CostTotals, NewResearchCost, NewResearchFile, ResearchCost, ResearchFile,
    ResearchSession, ResearchStatus, SessionFilters, TransitionPayload,
};
use crate::validation::validate_query;
use crate::{Error, Result};

#[derive(Default)]
struct State {
    sessions: HashMap<Uuid, ResearchSession>,
    files: HashMap<Uuid, ResearchFile>,
    costs: HashMap<Uuid, ResearchCost>,
}

impl State {
    fn owned(&self, session_id: Uuid, user_id: &str) -> Result<&ResearchSession> {
        self.sessions
            .get(&session_id)
            .filter(|s| s.user_id == user_id)
            .ok_or_else(|| Error::NotFound(SESSION_NOT_FOUND.to_string()))
    }

    fn session_mut(&mut self, session_id: Uuid) -> Result<&mut ResearchSession> {
        self.sessions
            .get_mut(&session_id)
            .ok_or_else(|| Error::NotFound(SESSION_NOT_FOUND.to_string()))
    }

    fn file_mut(&mut self, file_id: Uuid) -> Result<&mut ResearchFile> {
        self.files
            .get_mut(&file_id)
            .ok_or_else(|| Error::NotFound(FILE_NOT_FOUND.to_string()))
    }
}

/// Every operation runs under one mutex, so each is atomic.
#[derive(Default)]
pub struct MemorySessionStore {
    state: Mutex<State>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite a stored session. Lets tests build lineages that the normal
    /// API would refuse.
    #[cfg(test)]
    pub(crate) async fn put_raw(&self, session: ResearchSession) {
        self.state.lock().await.sessions.insert(session.id, session);
    }

    #[cfg(test)]
    pub(crate) async fn session_count(&self) -> usize {
        self.state.lock().await.sessions.len()
    }

    #[cfg(test)]
    pub(crate) async fn file_count(&self) -> usize {
        self.state.lock().await.files.len()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn create(
        &self,
        user_id: &str,
        query: &str,
        parent_id: Option<Uuid>,
    ) -> Result<ResearchSession> {
        let query = validate_query(query)?;
        let mut state = self.state.lock().await;

        if let Some(parent_id) = parent_id {
            let parent_ok = state
                .sessions
                .get(&parent_id)
                .map(|p| p.user_id == user_id && p.status == ResearchStatus::Completed)
                .unwrap_or(false);
            if !parent_ok {
                return Err(Error::validation("parent_session_id", PARENT_REJECTED));
            }
        }

        let mut session = ResearchSession::new(user_id, &query, parent_id);
        // Keep ordering strict even when two creates land in the same tick.
        if let Some(latest) = state.sessions.values().map(|s| s.created_at).max() {
            if session.created_at <= latest {
                session.created_at = latest + chrono::Duration::microseconds(1);
                session.updated_at = session.created_at;
            }
        }
        state.sessions.insert(session.id, session.clone());
        Ok(session)
    }

    async fn get(&self, session_id: Uuid, user_id: &str) -> Result<ResearchSession> {
        let state = self.state.lock().await;
        state.owned(session_id, user_id).cloned()
    }

    async fn list(&self, user_id: &str, filters: &SessionFilters) -> Result<Vec<ResearchSession>> {
        let state = self.state.lock().await;
        let mut sessions: Vec<ResearchSession> = state
            .sessions
            .values()
            .filter(|s| s.user_id == user_id && filters.matches(s))
            .cloned()
            .collect();
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let offset = filters.offset.unwrap_or(0).max(0) as usize;
        let limit = filters.limit.unwrap_or(i64::MAX).max(0) as usize;
        Ok(sessions.into_iter().skip(offset).take(limit).collect())
    }

    async fn children(&self, session_id: Uuid, user_id: &str) -> Result<Vec<ResearchSession>> {
        let state = self.state.lock().await;
        state.owned(session_id, user_id)?;
        let mut children: Vec<ResearchSession> = state
            .sessions
            .values()
            .filter(|s| s.parent_session_id == Some(session_id) && s.user_id == user_id)
            .cloned()
            .collect();
        children.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(children)
    }

    async fn claim(&self, session_id: Uuid) -> Result<ClaimOutcome> {
        let mut state = self.state.lock().await;
        let session = state.session_mut(session_id)?;
        if session.status != ResearchStatus::Pending {
            return Ok(ClaimOutcome::NotClaimable(session.status));
        }
        session.apply_transition(
            ResearchStatus::Processing,
            TransitionPayload::default(),
            Utc::now(),
        )?;
        Ok(ClaimOutcome::Claimed(session.clone()))
    }

    async fn attach_trace(&self, session_id: Uuid, trace_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let session = state.session_mut(session_id)?;
        if session.status != ResearchStatus::Processing {
            return Err(Error::InvalidState(format!(
                "trace can only be attached while PROCESSING, session is {}",
                session.status
            )));
        }
        session.trace_id = Some(trace_id.to_string());
        session.updated_at = Utc::now();
        Ok(())
    }

    async fn transition(
        &self,
        session_id: Uuid,
        next: ResearchStatus,
        payload: TransitionPayload,
    ) -> Result<ResearchSession> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let cost = payload.cost.clone();

        // Work on a copy so a rejected payload leaves the row untouched.
        let mut updated = state.session_mut(session_id)?.clone();
        updated.apply_transition(next, payload, now)?;

        if let Some(cost) = cost {
            state.costs.insert(session_id, cost.into_cost(session_id, now));
        }
        state.sessions.insert(session_id, updated.clone());
        Ok(updated)
    }

    async fn stale(
        &self,
        status: ResearchStatus,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<ResearchSession>> {
        let state = self.state.lock().await;
        let mut sessions: Vec<ResearchSession> = state
            .sessions
            .values()
            .filter(|s| s.status == status)
            .filter(|s| {
                let since = match status {
                    ResearchStatus::Processing => s.started_at.unwrap_or(s.created_at),
                    _ => s.created_at,
                };
                since < older_than
            })
            .cloned()
            .collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        sessions.truncate(limit.max(0) as usize);
        Ok(sessions)
    }

    async fn insert_file(
        &self,
        session_id: Uuid,
        user_id: &str,
        file: NewResearchFile,
    ) -> Result<ResearchFile> {
        let mut state = self.state.lock().await;
        state.owned(session_id, user_id)?;

        let record = ResearchFile {
            id: Uuid::new_v4(),
            session_id,
            filename: file.filename,
            file_type: file.file_type,
            file_size: file.file_size,
            content_summary: None,
            is_processed: false,
            processing_error: None,
            uploaded_at: Utc::now(),
            processed_at: None,
        };
        state.files.insert(record.id, record.clone());
        Ok(record)
    }

    async fn mark_file_processed(&self, file_id: Uuid, summary: &str) -> Result<ResearchFile> {
        let mut state = self.state.lock().await;
        let file = state.file_mut(file_id)?;
        file.is_processed = true;
        file.content_summary = Some(summary.to_string());
        file.processing_error = None;
        file.processed_at = Some(Utc::now());
        Ok(file.clone())
    }

    async fn mark_file_failed(&self, file_id: Uuid, error: &str) -> Result<ResearchFile> {
        let mut state = self.state.lock().await;
        let file = state.file_mut(file_id)?;
        file.is_processed = false;
        file.processing_error = Some(error.to_string());
        Ok(file.clone())
    }

    async fn list_files(&self, session_id: Uuid, user_id: &str) -> Result<Vec<ResearchFile>> {
        let state = self.state.lock().await;
        state.owned(session_id, user_id)?;
        let mut files: Vec<ResearchFile> = state
            .files
            .values()
            .filter(|f| f.session_id == session_id)
            .cloned()
            .collect();
        files.sort_by(|a, b| b.uploaded_at.cmp(&a.uploaded_at));
        Ok(files)
    }

    async fn get_file(&self, session_id: Uuid, file_id: Uuid, user_id: &str) -> Result<ResearchFile> {
        let state = self.state.lock().await;
        state.owned(session_id, user_id)?;
        state
            .files
            .get(&file_id)
            .filter(|f| f.session_id == session_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(FILE_NOT_FOUND.to_string()))
    }

    async fn delete_file(&self, session_id: Uuid, file_id: Uuid, user_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.owned(session_id, user_id)?;
        let belongs = state
            .files
            .get(&file_id)
            .map(|f| f.session_id == session_id)
            .unwrap_or(false);
        if !belongs {
            return Err(Error::NotFound(FILE_NOT_FOUND.to_string()));
        }
        state.files.remove(&file_id);
        Ok(())
    }

    async fn context_files(
        &self,
        session_id: Uuid,
        uploaded_before: DateTime<Utc>,
    ) -> Result<Vec<ResearchFile>> {
        let state = self.state.lock().await;
        let mut files: Vec<ResearchFile> = state
            .files
            .values()
            .filter(|f| {
                f.session_id == session_id && f.is_usable_context() && f.uploaded_at <= uploaded_before
            })
            .cloned()
            .collect();
        files.sort_by(|a, b| a.uploaded_at.cmp(&b.uploaded_at));
        Ok(files)
    }

    async fn get_cost(&self, session_id: Uuid, user_id: &str) -> Result<Option<ResearchCost>> {
        let state = self.state.lock().await;
        state.owned(session_id, user_id)?;
        Ok(state.costs.get(&session_id).cloned())
    }

    async fn replace_cost(&self, session_id: Uuid, cost: NewResearchCost) -> Result<ResearchCost> {
        let mut state = self.state.lock().await;
        let status = state.session_mut(session_id)?.status;
        if status != ResearchStatus::Completed {
            return Err(Error::InvalidState(format!(
                "Cost can only be recorded for completed sessions. Current status: {}",
                status
            )));
        }

        let now = Utc::now();
        let mut row = cost.into_cost(session_id, now);
        if let Some(existing) = state.costs.get(&session_id) {
            row.created_at = existing.created_at;
        }
        state.costs.insert(session_id, row.clone());
        Ok(row)
    }

    async fn cost_totals(&self, user_id: &str, since: Option<DateTime<Utc>>) -> Result<CostTotals> {
        let state = self.state.lock().await;
        let mut totals = CostTotals::default();
        for cost in state.costs.values() {
            let owned = state
                .sessions
                .get(&cost.session_id)
                .map(|s| s.user_id == user_id)
                .unwrap_or(false);
            let in_range = since.map(|since| cost.created_at >= since).unwrap_or(true);
            if owned && in_range {
                totals.total_cost += cost.estimated_cost;
                totals.total_tokens += cost.total_tokens;
                totals.session_count += 1;
            }
        }
        Ok(totals)
    }
}
