//! Session creation and hand-off to the executor.

use tracing::{info, warn};
use uuid::Uuid;

use crate::models::ResearchSession;
use crate::queue::TaskQueue;
use crate::store::SessionStore;
use crate::validation::validate_query;
use crate::Result;

/// Enqueue execution without failing the caller.
///
/// The session is already stored as PENDING; if the enqueue is lost the
/// sweeper picks it up again.
pub async fn dispatch(queue: &dyn TaskQueue, session_id: Uuid) {
    if let Err(e) = queue.enqueue(session_id).await {
        warn!(%session_id, error = %e, "Failed to enqueue research session, leaving it for the sweeper");
    }
}

/// Create a PENDING session and schedule it.
pub async fn start_research(
    store: &dyn SessionStore,
    queue: &dyn TaskQueue,
    user_id: &str,
    query: &str,
    parent_id: Option<Uuid>,
) -> Result<ResearchSession> {
    let query = validate_query(query)?;
    let session = store.create(user_id, &query, parent_id).await?;
    info!(session_id = %session.id, %user_id, continuation = session.is_continuation(), "Research session created");

    dispatch(queue, session.id).await;
    Ok(session)
}
