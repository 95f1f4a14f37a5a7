//! Continuations and session lineage.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::models::{ResearchSession, ResearchStatus};
use crate::queue::TaskQueue;
use crate::sessions::dispatch;
use crate::store::SessionStore;
use crate::validation::validate_query;
use crate::{Error, Result};

/// Longest parent chain followed before giving up.
pub const MAX_LINEAGE_DEPTH: usize = 1000;

/// Characters of the parent's final report carried into a continuation.
pub const REPORT_EXCERPT_CHARS: usize = 1000;

/// A session with everything it descends from and its direct continuations.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Lineage {
    /// Origin first, immediate parent last
    pub ancestors: Vec<ResearchSession>,
    pub session: ResearchSession,
    pub children: Vec<ResearchSession>,
}

/// Context text for a child run built from its parent's results.
pub fn continuation_context(parent: &ResearchSession) -> Option<String> {
    let mut parts = Vec::new();

    if let Some(summary) = parent.summary.as_deref().filter(|s| !s.trim().is_empty()) {
        parts.push(format!("Previous research summary: {}", summary));
    }

    let brief = parent
        .reasoning
        .as_ref()
        .and_then(|r| r.get("research_brief"))
        .and_then(|b| b.as_str())
        .filter(|b| !b.trim().is_empty());
    if let Some(brief) = brief {
        parts.push(format!("Previous research brief: {}", brief));
    }

    let report = parent
        .report
        .as_ref()
        .and_then(|r| r.get("final_report"))
        .and_then(|r| r.as_str())
        .filter(|r| !r.trim().is_empty());
    if let Some(report) = report {
        let mut excerpt: String = report.chars().take(REPORT_EXCERPT_CHARS).collect();
        if report.chars().count() > REPORT_EXCERPT_CHARS {
            excerpt.push_str("...");
        }
        parts.push(format!("Previous research findings: {}", excerpt));
    }

    if parts.is_empty() {
        None
    } else {
        Some(parts.join("\n\n"))
    }
}

/// Creates continuations and walks parent pointers.
pub struct LineageManager {
    store: Arc<dyn SessionStore>,
    queue: Arc<dyn TaskQueue>,
}

impl LineageManager {
    pub fn new(store: Arc<dyn SessionStore>, queue: Arc<dyn TaskQueue>) -> Self {
        Self { store, queue }
    }

    /// Start a child session that builds on a completed parent.
    pub async fn continue_session(
        &self,
        parent_id: Uuid,
        user_id: &str,
        new_query: &str,
    ) -> Result<ResearchSession> {
        let query = validate_query(new_query)?;

        let parent = self.store.get(parent_id, user_id).await?;
        if parent.status != ResearchStatus::Completed {
            return Err(Error::InvalidState(format!(
                "Can only continue from completed research sessions. Current status: {}",
                parent.status
            )));
        }

        let child = self.store.create(user_id, &query, Some(parent.id)).await?;
        info!(session_id = %child.id, parent_session_id = %parent.id, "Research continuation created");

        dispatch(self.queue.as_ref(), child.id).await;
        Ok(child)
    }

    /// Parent chain of a session, origin first. The session itself is excluded.
    pub async fn ancestors(&self, session_id: Uuid, user_id: &str) -> Result<Vec<ResearchSession>> {
        let session = self.store.get(session_id, user_id).await?;
        self.ancestors_of(&session, user_id).await
    }

    async fn ancestors_of(&self, session: &ResearchSession, user_id: &str) -> Result<Vec<ResearchSession>> {
        let mut visited = HashSet::from([session.id]);
        let mut chain = Vec::new();
        let mut next = session.parent_session_id;

        while let Some(parent_id) = next {
            if !visited.insert(parent_id) {
                return Err(Error::InvalidState(
                    "Session lineage contains a cycle".to_string(),
                ));
            }
            if chain.len() >= MAX_LINEAGE_DEPTH {
                return Err(Error::InvalidState(format!(
                    "Session lineage exceeds {} levels",
                    MAX_LINEAGE_DEPTH
                )));
            }

            let parent = self.store.get(parent_id, user_id).await?;
            next = parent.parent_session_id;
            chain.push(parent);
        }

        chain.reverse();
        Ok(chain)
    }

    pub async fn lineage(&self, session_id: Uuid, user_id: &str) -> Result<Lineage> {
        let session = self.store.get(session_id, user_id).await?;
        let ancestors = self.ancestors_of(&session, user_id).await?;
        let children = self.store.children(session_id, user_id).await?;
        Ok(Lineage {
            ancestors,
            session,
            children,
        })
    }
}
