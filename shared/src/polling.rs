//! Status polling and cancellation.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::models::{ResearchSession, ResearchStatus, TransitionPayload};
use crate::store::SessionStore;
use crate::{Error, Result};

pub const CANCELLED_MESSAGE: &str = "Research was cancelled";

/// What a polling client needs to decide whether to keep polling.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub id: Uuid,
    pub status: ResearchStatus,
    pub is_terminal: bool,
    pub trace_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    /// Suggested delay before the next poll; null once polling should stop
    pub poll_after_ms: Option<u64>,
}

impl StatusSnapshot {
    pub fn from_session(session: &ResearchSession, poll_interval: Duration) -> Self {
        let is_terminal = session.status.is_terminal();
        Self {
            id: session.id,
            status: session.status,
            is_terminal,
            trace_id: session.trace_id.clone(),
            created_at: session.created_at,
            started_at: session.started_at,
            completed_at: session.completed_at,
            error_message: session.error_message.clone(),
            poll_after_ms: (!is_terminal).then(|| poll_interval.as_millis() as u64),
        }
    }
}

pub struct StatusPoller {
    store: Arc<dyn SessionStore>,
    poll_interval: Duration,
}

impl StatusPoller {
    pub fn new(store: Arc<dyn SessionStore>, poll_interval: Duration) -> Self {
        Self {
            store,
            poll_interval,
        }
    }

    /// Current status. Reads only.
    pub async fn status(&self, session_id: Uuid, user_id: &str) -> Result<StatusSnapshot> {
        let session = self.store.get(session_id, user_id).await?;
        Ok(StatusSnapshot::from_session(&session, self.poll_interval))
    }

    /// Stop a running session by failing it. The executor discards its result.
    pub async fn cancel(&self, session_id: Uuid, user_id: &str) -> Result<StatusSnapshot> {
        let session = self.store.get(session_id, user_id).await?;
        if session.status != ResearchStatus::Processing {
            return Err(Error::InvalidState(format!(
                "Only processing research can be cancelled. Current status: {}",
                session.status
            )));
        }

        let session = match self
            .store
            .transition(
                session_id,
                ResearchStatus::Failed,
                TransitionPayload::failed(CANCELLED_MESSAGE),
            )
            .await
        {
            Ok(session) => session,
            // Finished between the read and the write.
            Err(Error::InvalidTransition { from, .. }) => {
                return Err(Error::InvalidState(format!(
                    "Only processing research can be cancelled. Current status: {}",
                    from
                )))
            }
            Err(e) => return Err(e),
        };

        info!(%session_id, "Research session cancelled");
        Ok(StatusSnapshot::from_session(&session, self.poll_interval))
    }
}
