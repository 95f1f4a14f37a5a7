//! Asynchronous execution of research sessions.
//!
//! A run owns a session only after winning the PENDING → PROCESSING claim.
//! From then on every path ends in COMPLETED or FAILED, unless another
//! writer (cancel, sweeper) reached a terminal state first, in which case the
//! run's result is dropped.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::agents::{ResearchRunner, RunRequest, RunResult};
use crate::config::ExecutionSettings;
use crate::costs::{self, PriceTable};
use crate::lineage::continuation_context;
use crate::models::{
    ClaimOutcome, NewResearchCost, ResearchSession, ResearchStatus, TransitionPayload,
};
use crate::observability::{TraceOutcome, Tracer};
use crate::queue::TaskQueue;
use crate::reasoning;
use crate::store::SessionStore;
use crate::{Error, Result};

/// Failure message for sessions the sweeper finds stuck in PROCESSING.
pub const STUCK_MESSAGE: &str = "Research timed out before completing";

/// Sessions handled per sweeper pass and status.
const SWEEP_BATCH: i64 = 100;

/// How one delivery of a session was handled.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Completed(ResearchSession),
    Failed(ResearchSession),
    /// Another delivery already claimed the session
    Skipped(ResearchStatus),
    /// The session reached a terminal state elsewhere while running
    Discarded,
}

/// Runs a claimed session against the research workflow.
pub struct ExecutionTask {
    store: Arc<dyn SessionStore>,
    runner: Arc<dyn ResearchRunner>,
    tracer: Arc<dyn Tracer>,
    settings: ExecutionSettings,
    prices: PriceTable,
}

impl ExecutionTask {
    pub fn new(
        store: Arc<dyn SessionStore>,
        runner: Arc<dyn ResearchRunner>,
        tracer: Arc<dyn Tracer>,
        settings: ExecutionSettings,
    ) -> Self {
        Self {
            store,
            runner,
            tracer,
            settings,
            prices: PriceTable::default(),
        }
    }

    /// Handle one delivery of `session_id`.
    ///
    /// Only returns `Err` when even the FAILED write could not be made.
    pub async fn run(&self, session_id: Uuid) -> Result<ExecutionOutcome> {
        let session = match self.store.claim(session_id).await? {
            ClaimOutcome::Claimed(session) => session,
            ClaimOutcome::NotClaimable(status) => {
                info!(%session_id, %status, "Session already claimed, skipping");
                return Ok(ExecutionOutcome::Skipped(status));
            }
        };
        info!(%session_id, user_id = %session.user_id, "Research execution started");
        let deadline = Instant::now() + self.settings.run_budget;

        let session = self.open_trace(session, deadline).await;

        let result = async {
            let context = self.build_context(&session).await?;
            self.execute_with_retry(&session, context, deadline).await
        }
        .await;

        match result {
            Ok(run) => self.complete(session, run).await,
            Err(e) => self.fail(session, &e).await,
        }
    }

    /// Retry `op` on transient errors with exponential backoff, never
    /// starting a retry that would begin after `deadline`.
    async fn with_retry<T, F, Fut>(
        &self,
        what: &str,
        session_id: Uuid,
        deadline: Instant,
        mut op: F,
    ) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e)
                    if e.is_transient()
                        && attempt < self.settings.max_attempts
                        && Instant::now() + self.settings.backoff(attempt) < deadline =>
                {
                    let delay = self.settings.backoff(attempt);
                    warn!(
                        %session_id,
                        attempt,
                        max_attempts = self.settings.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "{} failed, retrying",
                        what
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Open a trace and record its id. Never fails the run.
    async fn open_trace(&self, mut session: ResearchSession, deadline: Instant) -> ResearchSession {
        let opened = self
            .with_retry("Trace open", session.id, deadline, |_| self.tracer.open_trace(&session))
            .await;

        match opened {
            Ok(handle) => match self.store.attach_trace(session.id, &handle.trace_id).await {
                Ok(()) => session.trace_id = Some(handle.trace_id),
                Err(e) => warn!(session_id = %session.id, error = %e, "Failed to store trace id"),
            },
            Err(e) => {
                warn!(session_id = %session.id, error = %e, "Continuing without a trace");
            }
        }
        session
    }

    /// Parent context plus summaries of files uploaded before the run started.
    async fn build_context(&self, session: &ResearchSession) -> Result<Option<String>> {
        let mut parts = Vec::new();

        if let Some(parent_id) = session.parent_session_id {
            let parent = self.store.get(parent_id, &session.user_id).await?;
            if let Some(context) = continuation_context(&parent) {
                parts.push(context);
            }
        }

        let cutoff = session.started_at.unwrap_or(session.created_at);
        let files = self.store.context_files(session.id, cutoff).await?;
        if !files.is_empty() {
            let mut section = String::from("Context from uploaded files:");
            for file in &files {
                if let Some(summary) = &file.content_summary {
                    section.push_str(&format!("\n\n--- {} ---\n{}", file.filename, summary));
                }
            }
            parts.push(section);
        }

        Ok((!parts.is_empty()).then(|| parts.join("\n\n")))
    }

    async fn execute_with_retry(
        &self,
        session: &ResearchSession,
        context: Option<String>,
        deadline: Instant,
    ) -> Result<RunResult> {
        self.with_retry("Research run", session.id, deadline, |attempt| {
            let request = RunRequest {
                session_id: session.id,
                user_id: session.user_id.clone(),
                query: session.query.clone(),
                context: context.clone(),
                trace_id: session.trace_id.clone(),
            };
            async move {
                if attempt > 1 {
                    self.ensure_still_processing(session).await?;
                }
                let timeout = self
                    .settings
                    .run_timeout
                    .min(deadline.saturating_duration_since(Instant::now()));
                match tokio::time::timeout(timeout, self.runner.execute(request)).await {
                    Ok(result) => result,
                    Err(_) => Err(Error::Timeout {
                        seconds: timeout.as_secs(),
                    }),
                }
            }
        })
        .await
    }

    /// Stop retrying once someone else has finished the session.
    async fn ensure_still_processing(&self, session: &ResearchSession) -> Result<()> {
        let current = self.store.get(session.id, &session.user_id).await?;
        if current.status != ResearchStatus::Processing {
            return Err(Error::InvalidState(format!(
                "session is {} and no longer running",
                current.status
            )));
        }
        Ok(())
    }

    async fn complete(&self, session: ResearchSession, run: RunResult) -> Result<ExecutionOutcome> {
        let reasoning = reasoning::sanitize(&run.reasoning);
        let usage =
            costs::resolve_usage(self.tracer.as_ref(), &session, run.usage, Some(&run.report)).await;
        let cost = match NewResearchCost::from_usage(&usage, &self.prices) {
            Ok(cost) => cost,
            Err(e) => return self.fail(session, &e).await,
        };
        let estimated_cost = cost.estimated_cost();

        let payload = TransitionPayload::completed(run.report, run.summary, reasoning, cost);
        match self
            .store
            .transition(session.id, ResearchStatus::Completed, payload)
            .await
        {
            Ok(completed) => {
                self.finish_trace(
                    &completed,
                    TraceOutcome::Completed {
                        summary: completed.summary.as_deref().unwrap_or_default(),
                    },
                )
                .await;
                info!(
                    session_id = %completed.id,
                    input_tokens = usage.input_tokens,
                    output_tokens = usage.output_tokens,
                    estimated_cost,
                    "Research execution completed"
                );
                Ok(ExecutionOutcome::Completed(completed))
            }
            Err(Error::InvalidTransition { from, .. }) => {
                warn!(session_id = %session.id, status = %from, "Session finished elsewhere, discarding result");
                self.finish_trace(&session, TraceOutcome::Failed { error: "result discarded" })
                    .await;
                Ok(ExecutionOutcome::Discarded)
            }
            Err(e) => {
                error!(session_id = %session.id, error = %e, "Failed to store research result");
                self.fail(session, &e).await
            }
        }
    }

    async fn fail(&self, session: ResearchSession, cause: &Error) -> Result<ExecutionOutcome> {
        let message = cause.user_message();
        error!(session_id = %session.id, error = %cause, "Research execution failed");

        match self
            .store
            .transition(session.id, ResearchStatus::Failed, TransitionPayload::failed(&message))
            .await
        {
            Ok(failed) => {
                self.finish_trace(&failed, TraceOutcome::Failed { error: &message })
                    .await;
                Ok(ExecutionOutcome::Failed(failed))
            }
            Err(Error::InvalidTransition { from, .. }) => {
                info!(session_id = %session.id, status = %from, "Session finished elsewhere");
                Ok(ExecutionOutcome::Discarded)
            }
            Err(e) => {
                error!(session_id = %session.id, error = %e, "Failed to mark session FAILED, leaving it for the sweeper");
                Err(e)
            }
        }
    }

    async fn finish_trace(&self, session: &ResearchSession, outcome: TraceOutcome<'_>) {
        if let Some(trace_id) = session.trace_id.as_deref() {
            if let Err(e) = self.tracer.finish_trace(trace_id, outcome).await {
                warn!(session_id = %session.id, %trace_id, error = %e, "Failed to close trace");
            }
        }
    }
}

/// Result of one sweeper pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SweepReport {
    pub failed: Vec<Uuid>,
    pub requeued: Vec<Uuid>,
}

/// Recovers sessions whose executor died or whose enqueue was lost.
pub struct SessionSweeper {
    store: Arc<dyn SessionStore>,
    queue: Arc<dyn TaskQueue>,
    stuck_after: Duration,
    requeue_after: Duration,
}

impl SessionSweeper {
    pub fn new(
        store: Arc<dyn SessionStore>,
        queue: Arc<dyn TaskQueue>,
        stuck_after: Duration,
        requeue_after: Duration,
    ) -> Self {
        Self {
            store,
            queue,
            stuck_after,
            requeue_after,
        }
    }

    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let mut report = SweepReport::default();

        let stuck_before = now - to_chrono(self.stuck_after)?;
        for session in self
            .store
            .stale(ResearchStatus::Processing, stuck_before, SWEEP_BATCH)
            .await?
        {
            match self
                .store
                .transition(session.id, ResearchStatus::Failed, TransitionPayload::failed(STUCK_MESSAGE))
                .await
            {
                Ok(_) => {
                    warn!(session_id = %session.id, "Failed stuck research session");
                    report.failed.push(session.id);
                }
                Err(Error::InvalidTransition { .. }) => {}
                Err(e) => warn!(session_id = %session.id, error = %e, "Failed to fail stuck session"),
            }
        }

        let requeue_before = now - to_chrono(self.requeue_after)?;
        for session in self
            .store
            .stale(ResearchStatus::Pending, requeue_before, SWEEP_BATCH)
            .await?
        {
            match self.queue.enqueue(session.id).await {
                Ok(()) => report.requeued.push(session.id),
                Err(e) => warn!(session_id = %session.id, error = %e, "Failed to re-enqueue session"),
            }
        }

        info!(
            failed = report.failed.len(),
            requeued = report.requeued.len(),
            "Session sweep finished"
        );
        Ok(report)
    }
}

fn to_chrono(duration: Duration) -> Result<chrono::Duration> {
    chrono::Duration::from_std(duration)
        .map_err(|e| Error::Config(format!("Invalid sweeper threshold: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingestion::{FileIngestion, RawUpload};
    use crate::store::MemorySessionStore;
    use crate::testing::{sample_result, MockQueue, MockRunner, MockTracer, Step};

    fn fast_settings() -> ExecutionSettings {
        ExecutionSettings {
            run_timeout: Duration::from_millis(50),
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            run_budget: Duration::from_secs(5),
        }
    }

    struct Harness {
        store: Arc<MemorySessionStore>,
        runner: Arc<MockRunner>,
        tracer: Arc<MockTracer>,
        task: ExecutionTask,
    }

    fn harness(runner: MockRunner, tracer: MockTracer) -> Harness {
        let store = Arc::new(MemorySessionStore::new());
        let runner = Arc::new(runner);
        let tracer = Arc::new(tracer);
        let task = ExecutionTask::new(store.clone(), runner.clone(), tracer.clone(), fast_settings());
        Harness {
            store,
            runner,
            tracer,
            task,
        }
    }

    #[tokio::test]
    async fn test_happy_path_completes() {
        let h = harness(MockRunner::succeeding(), MockTracer::default());
        let session = h.store.create("alice", "What is climate change?", None).await.unwrap();

        let outcome = h.task.run(session.id).await.unwrap();
        let ExecutionOutcome::Completed(done) = outcome else {
            panic!("expected completion, got {outcome:?}");
        };

        assert_eq!(done.status, ResearchStatus::Completed);
        assert!(done.completed_at.is_some());
        assert!(done.error_message.is_none());
        assert_eq!(done.trace_id.as_deref(), Some(format!("trace-{}", session.id).as_str()));

        let reasoning = done.reasoning.unwrap();
        assert_eq!(reasoning["research_brief"], "Overview of climate change");
        assert!(reasoning.get("raw_chain_of_thought").is_none());
        assert!(reasoning.get("tool_calls").is_none());

        let cost = h.store.get_cost(session.id, "alice").await.unwrap().unwrap();
        assert_eq!(cost.input_tokens, 1200);
        assert_eq!(cost.total_tokens, 1500);

        assert_eq!(h.tracer.finished(), vec![(format!("trace-{}", session.id), true)]);
    }

    #[tokio::test]
    async fn test_overflowing_usage_fails_session() {
        let mut result = sample_result();
        result.usage = Some(crate::models::TokenUsage {
            input_tokens: i64::MAX,
            output_tokens: 1,
            model_usage: Default::default(),
        });
        let h = harness(MockRunner::new(vec![Step::Succeed(result)]), MockTracer::default());
        let session = h.store.create("alice", "What is climate change?", None).await.unwrap();

        let outcome = h.task.run(session.id).await.unwrap();
        let ExecutionOutcome::Failed(failed) = outcome else {
            panic!("expected failure, got {outcome:?}");
        };

        assert!(failed.completed_at.is_some());
        assert_eq!(
            failed.error_message.as_deref(),
            Some("The research workflow failed to produce a result")
        );
        assert!(h.store.get_cost(session.id, "alice").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_second_delivery_is_skipped() {
        let h = harness(MockRunner::succeeding(), MockTracer::default());
        let session = h.store.create("alice", "query", None).await.unwrap();

        h.task.run(session.id).await.unwrap();
        let outcome = h.task.run(session.id).await.unwrap();

        assert_eq!(outcome, ExecutionOutcome::Skipped(ResearchStatus::Completed));
        assert_eq!(h.runner.calls(), 1);
    }

    #[tokio::test]
    async fn test_timeout_fails_after_capped_attempts() {
        let h = harness(MockRunner::new(vec![Step::Hang]), MockTracer::default());
        let session = h.store.create("alice", "What is climate change?", None).await.unwrap();

        let outcome = h.task.run(session.id).await.unwrap();
        let ExecutionOutcome::Failed(failed) = outcome else {
            panic!("expected failure, got {outcome:?}");
        };

        assert_eq!(h.runner.calls(), 3);
        assert!(failed.completed_at.is_some());
        assert!(failed.report.is_none());
        assert!(failed.reasoning.is_none());
        assert!(failed.error_message.unwrap().starts_with("Research timed out"));
        assert!(h.store.get_cost(session.id, "alice").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_run_budget_cuts_retries_short() {
        let settings = ExecutionSettings {
            run_timeout: Duration::from_millis(50),
            max_attempts: 10,
            run_budget: Duration::from_millis(120),
            ..fast_settings()
        };
        let store = Arc::new(MemorySessionStore::new());
        let runner = Arc::new(MockRunner::new(vec![Step::Hang]));
        let task = ExecutionTask::new(store.clone(), runner.clone(), Arc::new(MockTracer::default()), settings);
        let session = store.create("alice", "What is climate change?", None).await.unwrap();

        let started = std::time::Instant::now();
        let outcome = task.run(session.id).await.unwrap();

        assert!(matches!(outcome, ExecutionOutcome::Failed(_)));
        assert!(runner.calls() >= 2);
        assert!(runner.calls() < 10);
        assert!(started.elapsed() < Duration::from_millis(600));
    }

    #[tokio::test]
    async fn test_permanent_error_is_not_retried_and_sanitized() {
        let h = harness(MockRunner::new(vec![Step::Permanent]), MockTracer::default());
        let session = h.store.create("alice", "query", None).await.unwrap();

        let outcome = h.task.run(session.id).await.unwrap();
        let ExecutionOutcome::Failed(failed) = outcome else {
            panic!("expected failure, got {outcome:?}");
        };

        assert_eq!(h.runner.calls(), 1);
        let message = failed.error_message.unwrap();
        assert!(!message.contains("Traceback"));
        assert!(!message.contains("secret_prompt"));
        assert_eq!(h.tracer.finished().len(), 1);
        assert!(!h.tracer.finished()[0].1);
    }

    #[tokio::test]
    async fn test_transient_error_then_success() {
        let h = harness(
            MockRunner::new(vec![Step::Transient, Step::Succeed(sample_result())]),
            MockTracer::default(),
        );
        let session = h.store.create("alice", "query", None).await.unwrap();

        let outcome = h.task.run(session.id).await.unwrap();
        assert!(matches!(outcome, ExecutionOutcome::Completed(_)));
        assert_eq!(h.runner.calls(), 2);
    }

    #[tokio::test]
    async fn test_tracing_outage_does_not_fail_run() {
        let h = harness(MockRunner::succeeding(), MockTracer::failing_opens(10));
        let session = h.store.create("alice", "query", None).await.unwrap();

        let outcome = h.task.run(session.id).await.unwrap();
        let ExecutionOutcome::Completed(done) = outcome else {
            panic!("expected completion, got {outcome:?}");
        };
        assert!(done.trace_id.is_none());
        assert_eq!(h.tracer.opens(), 3);
        assert!(h.tracer.finished().is_empty());
    }

    #[tokio::test]
    async fn test_context_includes_parent_and_files() {
        let h = harness(MockRunner::succeeding(), MockTracer::default());
        let parent = h.store.create("alice", "What is climate change?", None).await.unwrap();
        h.task.run(parent.id).await.unwrap();

        let child = h
            .store
            .create("alice", "How does it affect oceans?", Some(parent.id))
            .await
            .unwrap();
        let ingestion = FileIngestion::new(h.store.clone(), 1024);
        ingestion
            .upload(
                child.id,
                "alice",
                RawUpload {
                    filename: "ocean-notes.txt".to_string(),
                    content: b"Ocean heat content is at a record high.".to_vec(),
                    content_type: None,
                },
            )
            .await
            .unwrap();

        h.task.run(child.id).await.unwrap();

        let requests = h.runner.requests();
        assert!(requests[0].context.is_none());
        let context = requests[1].context.as_deref().unwrap();
        assert!(context.contains("Previous research summary: Overview of the causes"));
        assert!(context.contains("--- ocean-notes.txt ---"));
        assert!(context.contains("Ocean heat content is at a record high."));
        assert_eq!(requests[1].query, "How does it affect oceans?");
    }

    #[tokio::test]
    async fn test_cancelled_run_is_discarded() {
        let store = Arc::new(MemorySessionStore::new());
        let settings = ExecutionSettings {
            run_timeout: Duration::from_millis(300),
            max_attempts: 1,
            ..fast_settings()
        };
        let task = Arc::new(ExecutionTask::new(
            store.clone(),
            Arc::new(MockRunner::new(vec![Step::Hang])),
            Arc::new(MockTracer::default()),
            settings,
        ));
        let session = store.create("alice", "query", None).await.unwrap();

        let handle = {
            let task = Arc::clone(&task);
            tokio::spawn(async move { task.run(session.id).await })
        };

        while store.get(session.id, "alice").await.unwrap().status != ResearchStatus::Processing {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        store
            .transition(session.id, ResearchStatus::Failed, TransitionPayload::failed("Research was cancelled"))
            .await
            .unwrap();

        let outcome = handle.await.unwrap().unwrap();
        assert_eq!(outcome, ExecutionOutcome::Discarded);
        let stored = store.get(session.id, "alice").await.unwrap();
        assert_eq!(stored.error_message.as_deref(), Some("Research was cancelled"));
    }

    #[tokio::test]
    async fn test_sweeper_fails_stuck_and_requeues_pending() {
        let store = Arc::new(MemorySessionStore::new());
        let queue = Arc::new(MockQueue::default());
        let sweeper = SessionSweeper::new(store.clone(), queue.clone(), Duration::ZERO, Duration::ZERO);

        let stuck = store.create("alice", "stuck", None).await.unwrap();
        store.claim(stuck.id).await.unwrap();
        let lost = store.create("alice", "lost", None).await.unwrap();

        let report = sweeper
            .sweep(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();

        assert_eq!(report.failed, vec![stuck.id]);
        assert_eq!(report.requeued, vec![lost.id]);
        assert_eq!(queue.enqueued(), vec![lost.id]);

        let failed = store.get(stuck.id, "alice").await.unwrap();
        assert_eq!(failed.status, ResearchStatus::Failed);
        assert_eq!(failed.error_message.as_deref(), Some(STUCK_MESSAGE));
    }
}
