//! Test doubles for the runner, tracer and queue capabilities.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::agents::{ResearchRunner, RunRequest, RunResult};
use crate::models::{ResearchSession, TokenUsage};
use crate::observability::{TraceHandle, TraceOutcome, Tracer};
use crate::queue::TaskQueue;
use crate::{Error, Result};

pub fn sample_result() -> RunResult {
    RunResult {
        report: serde_json::json!({
            "final_report": "Climate change refers to long-term shifts in temperatures and weather patterns.",
            "notes": ["IPCC AR6 synthesis"],
            "sources": [],
        }),
        summary: "Overview of the causes and effects of climate change".to_string(),
        reasoning: serde_json::json!({
            "research_brief": "Overview of climate change",
            "methodology": "Multi-step AI research workflow",
            "raw_chain_of_thought": "I should search for IPCC...",
            "tool_calls": [{"name": "web_search"}],
        }),
        usage: Some(TokenUsage {
            input_tokens: 1200,
            output_tokens: 300,
            ..Default::default()
        }),
    }
}

/// What the mock runner does on one call.
#[derive(Debug, Clone)]
pub enum Step {
    Succeed(RunResult),
    Transient,
    Permanent,
    /// Sleep past any sensible timeout
    Hang,
}

/// Runner that plays back scripted steps, repeating the last one.
pub struct MockRunner {
    steps: Mutex<VecDeque<Step>>,
    last: Mutex<Step>,
    calls: AtomicU32,
    requests: Mutex<Vec<RunRequest>>,
}

impl MockRunner {
    pub fn new(steps: Vec<Step>) -> Self {
        let last = steps.last().cloned().unwrap_or(Step::Permanent);
        Self {
            steps: Mutex::new(steps.into()),
            last: Mutex::new(last),
            calls: AtomicU32::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn succeeding() -> Self {
        Self::new(vec![Step::Succeed(sample_result())])
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<RunRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn next_step(&self) -> Step {
        let mut steps = self.steps.lock().unwrap();
        match steps.pop_front() {
            Some(step) => {
                *self.last.lock().unwrap() = step.clone();
                step
            }
            None => self.last.lock().unwrap().clone(),
        }
    }
}

#[async_trait]
impl ResearchRunner for MockRunner {
    async fn execute(&self, request: RunRequest) -> Result<RunResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request);

        match self.next_step() {
            Step::Succeed(result) => Ok(result),
            Step::Transient => Err(Error::TransientInfra("throttled".to_string())),
            Step::Permanent => Err(Error::Execution(
                "Traceback (most recent call last): KeyError 'secret_prompt'".to_string(),
            )),
            Step::Hang => {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Err(Error::Internal("hang step woke up".to_string()))
            }
        }
    }
}

/// Tracer that records closes and can fail its first opens.
#[derive(Default)]
pub struct MockTracer {
    open_failures: AtomicU32,
    opens: AtomicU32,
    usage: Option<TokenUsage>,
    finished: Mutex<Vec<(String, bool)>>,
}

impl MockTracer {
    pub fn with_usage(usage: TokenUsage) -> Self {
        Self {
            usage: Some(usage),
            ..Self::default()
        }
    }

    /// Fail the first `n` open attempts with a transient error.
    pub fn failing_opens(n: u32) -> Self {
        Self {
            open_failures: AtomicU32::new(n),
            ..Self::default()
        }
    }

    pub fn opens(&self) -> u32 {
        self.opens.load(Ordering::SeqCst)
    }

    /// `(trace_id, succeeded)` per finished trace.
    pub fn finished(&self) -> Vec<(String, bool)> {
        self.finished.lock().unwrap().clone()
    }
}

#[async_trait]
impl Tracer for MockTracer {
    async fn open_trace(&self, session: &ResearchSession) -> Result<TraceHandle> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let remaining = self.open_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.open_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(Error::TransientInfra("tracing unavailable".to_string()));
        }
        Ok(TraceHandle {
            trace_id: format!("trace-{}", session.id),
        })
    }

    async fn finish_trace(&self, trace_id: &str, outcome: TraceOutcome<'_>) -> Result<()> {
        let ok = matches!(outcome, TraceOutcome::Completed { .. });
        self.finished.lock().unwrap().push((trace_id.to_string(), ok));
        Ok(())
    }

    async fn usage(&self, _trace_id: &str) -> Result<Option<TokenUsage>> {
        Ok(self.usage.clone())
    }
}

/// Queue that records enqueued ids.
#[derive(Default)]
pub struct MockQueue {
    enqueued: Mutex<Vec<Uuid>>,
    fail: bool,
}

impl MockQueue {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn enqueued(&self) -> Vec<Uuid> {
        self.enqueued.lock().unwrap().clone()
    }
}

#[async_trait]
impl TaskQueue for MockQueue {
    async fn enqueue(&self, session_id: Uuid) -> Result<()> {
        if self.fail {
            return Err(Error::TransientInfra("queue unavailable".to_string()));
        }
        self.enqueued.lock().unwrap().push(session_id);
        Ok(())
    }
}
