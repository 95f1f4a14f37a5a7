//! Token pricing and cost accounting.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::models::{
    CostTotals, ModelUsage, NewResearchCost, ResearchCost, ResearchSession, ResearchStatus,
    TokenUsage,
};
use crate::observability::Tracer;
use crate::store::SessionStore;
use crate::{Error, Result};

/// Model priced when usage names nothing we know.
pub const DEFAULT_MODEL: (&str, &str) = ("openai", "gpt-4o");

/// Characters assumed for system prompts when estimating input tokens.
const PROMPT_OVERHEAD_CHARS: i64 = 2000;
const CHARS_PER_TOKEN: i64 = 4;

/// USD per token.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelRates {
    pub input: f64,
    pub output: f64,
}

impl ModelRates {
    fn cost(&self, input_tokens: i64, output_tokens: i64) -> f64 {
        input_tokens as f64 * self.input + output_tokens as f64 * self.output
    }
}

/// Per-provider, per-model rates.
#[derive(Debug, Clone)]
pub struct PriceTable {
    rates: BTreeMap<&'static str, BTreeMap<&'static str, ModelRates>>,
}

impl Default for PriceTable {
    fn default() -> Self {
        let mut rates = BTreeMap::new();
        rates.insert(
            "openai",
            BTreeMap::from([
                ("gpt-4o", ModelRates { input: 0.000005, output: 0.000015 }),
                ("gpt-4o-mini", ModelRates { input: 0.00000015, output: 0.0000006 }),
                ("gpt-4-turbo", ModelRates { input: 0.00001, output: 0.00003 }),
                ("gpt-4", ModelRates { input: 0.00003, output: 0.00006 }),
            ]),
        );
        rates.insert(
            "anthropic",
            BTreeMap::from([
                (
                    "claude-3-5-sonnet-20241022",
                    ModelRates { input: 0.000003, output: 0.000015 },
                ),
                (
                    "claude-3-5-haiku-20241022",
                    ModelRates { input: 0.00000025, output: 0.00000125 },
                ),
                ("claude-3-opus", ModelRates { input: 0.000015, output: 0.000075 }),
            ]),
        );
        rates.insert(
            "google",
            BTreeMap::from([
                ("gemini-pro", ModelRates { input: 0.0000005, output: 0.0000015 }),
                ("gemini-pro-vision", ModelRates { input: 0.00000025, output: 0.00000075 }),
            ]),
        );
        Self { rates }
    }
}

impl PriceTable {
    fn default_rates(&self) -> ModelRates {
        self.rates
            .get(DEFAULT_MODEL.0)
            .and_then(|models| models.get(DEFAULT_MODEL.1))
            .copied()
            .unwrap_or(ModelRates { input: 0.000005, output: 0.000015 })
    }

    /// Split `provider:model`, or infer the provider from a bare model name.
    pub fn resolve(model_name: &str) -> (String, String) {
        if let Some((provider, model)) = model_name.split_once(':') {
            return (provider.to_string(), model.to_string());
        }

        let lower = model_name.to_lowercase();
        let provider = if lower.contains("gpt") {
            "openai"
        } else if lower.contains("claude") {
            "anthropic"
        } else if lower.contains("gemini") {
            "google"
        } else {
            return (DEFAULT_MODEL.0.to_string(), DEFAULT_MODEL.1.to_string());
        };
        (provider.to_string(), model_name.to_string())
    }

    /// Provider and unrounded cost for one model's usage.
    pub fn model_cost(&self, model_name: &str, usage: ModelUsage) -> (String, f64) {
        let (provider, model) = Self::resolve(model_name);
        let rates = match self
            .rates
            .get(provider.as_str())
            .and_then(|models| models.get(model.as_str()))
        {
            Some(rates) => *rates,
            None => {
                warn!(%provider, %model, "No rates for model, pricing as openai:gpt-4o");
                self.default_rates()
            }
        };
        (provider, rates.cost(usage.input, usage.output))
    }

    /// Unrounded cost per provider.
    pub fn provider_costs(&self, usage: &TokenUsage) -> BTreeMap<String, f64> {
        let mut costs = BTreeMap::new();

        if usage.model_usage.is_empty() {
            if !usage.is_empty() {
                let cost = self
                    .default_rates()
                    .cost(usage.input_tokens, usage.output_tokens);
                costs.insert(DEFAULT_MODEL.0.to_string(), cost);
            }
            return costs;
        }

        for (model_name, model_usage) in &usage.model_usage {
            let (provider, cost) = self.model_cost(model_name, *model_usage);
            *costs.entry(provider).or_insert(0.0) += cost;
        }
        costs
    }
}

/// Round a USD amount to the stored precision.
pub fn round_usd(amount: f64) -> f64 {
    (amount * 10_000.0).round() / 10_000.0
}

impl NewResearchCost {
    /// Price the usage. Totals come from the usage counts; the model
    /// breakdown only decides the rates.
    pub fn from_usage(usage: &TokenUsage, prices: &PriceTable) -> Result<Self> {
        let raw = prices.provider_costs(usage);
        let total: f64 = raw.values().sum();
        let provider_costs = raw
            .into_iter()
            .map(|(provider, cost)| (provider, round_usd(cost)))
            .collect();

        NewResearchCost::new(
            usage.input_tokens,
            usage.output_tokens,
            round_usd(total),
            provider_costs,
        )
    }
}

/// Length-based usage estimate when neither the runner nor the tracer reports any.
pub fn estimate_usage(query: &str, report: Option<&serde_json::Value>) -> TokenUsage {
    let query_chars = query.chars().count() as i64;
    let report_chars = report
        .and_then(|r| r.get("final_report"))
        .and_then(|r| r.as_str())
        .map(|r| r.chars().count() as i64)
        .unwrap_or(0);

    TokenUsage {
        input_tokens: ((query_chars + PROMPT_OVERHEAD_CHARS) / CHARS_PER_TOKEN).max(1),
        output_tokens: (report_chars / CHARS_PER_TOKEN).max(1),
        model_usage: BTreeMap::new(),
    }
}

/// Pick the best available usage: runner, then tracer, then estimate.
pub async fn resolve_usage(
    tracer: &dyn Tracer,
    session: &ResearchSession,
    runner_usage: Option<TokenUsage>,
    report: Option<&serde_json::Value>,
) -> TokenUsage {
    if let Some(usage) = runner_usage.filter(|u| !u.is_empty()) {
        return usage;
    }

    if let Some(trace_id) = session.trace_id.as_deref() {
        match tracer.usage(trace_id).await {
            Ok(Some(usage)) if !usage.is_empty() => return usage,
            Ok(_) => {}
            Err(e) => warn!(session_id = %session.id, error = %e, "Failed to read usage from trace"),
        }
    }

    let usage = estimate_usage(&session.query, report);
    info!(
        session_id = %session.id,
        input_tokens = usage.input_tokens,
        output_tokens = usage.output_tokens,
        "Estimated token usage"
    );
    usage
}

/// Re-price a completed session and overwrite its cost row.
pub async fn recompute(
    store: &dyn SessionStore,
    tracer: &dyn Tracer,
    prices: &PriceTable,
    session_id: Uuid,
    user_id: &str,
) -> Result<ResearchCost> {
    let session = store.get(session_id, user_id).await?;
    if session.status != ResearchStatus::Completed {
        return Err(Error::InvalidState(format!(
            "Cost can only be recomputed for completed sessions. Current status: {}",
            session.status
        )));
    }

    let usage = resolve_usage(tracer, &session, None, session.report.as_ref()).await;
    let cost = store
        .replace_cost(session_id, NewResearchCost::from_usage(&usage, prices)?)
        .await?;

    info!(%session_id, estimated_cost = cost.estimated_cost, "Recomputed research cost");
    Ok(cost)
}

/// Window for cost summaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CostPeriod {
    Day,
    Week,
    Month,
    Year,
    #[default]
    All,
}

impl CostPeriod {
    pub fn since(self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Day => Some(now - Duration::days(1)),
            Self::Week => Some(now - Duration::weeks(1)),
            Self::Month => Some(now - Duration::days(30)),
            Self::Year => Some(now - Duration::days(365)),
            Self::All => None,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Day => "day",
            Self::Week => "week",
            Self::Month => "month",
            Self::Year => "year",
            Self::All => "all",
        }
    }
}

impl fmt::Display for CostPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CostPeriod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "day" => Ok(Self::Day),
            "week" => Ok(Self::Week),
            "month" => Ok(Self::Month),
            "year" => Ok(Self::Year),
            "all" | "" => Ok(Self::All),
            other => Err(Error::validation(
                "period",
                format!("Invalid period '{}'. Must be one of: day, week, month, year, all", other),
            )),
        }
    }
}

/// Spend for a user over a period.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CostSummary {
    pub period: CostPeriod,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: DateTime<Utc>,
    pub total_cost: f64,
    pub total_tokens: i64,
    pub session_count: i64,
    pub average_cost_per_session: f64,
    pub currency: &'static str,
}

impl CostSummary {
    fn new(period: CostPeriod, now: DateTime<Utc>, totals: CostTotals) -> Self {
        let average = if totals.session_count > 0 {
            round_usd(totals.total_cost / totals.session_count as f64)
        } else {
            0.0
        };
        Self {
            period,
            start_date: period.since(now),
            end_date: now,
            total_cost: round_usd(totals.total_cost),
            total_tokens: totals.total_tokens,
            session_count: totals.session_count,
            average_cost_per_session: average,
            currency: ResearchCost::CURRENCY,
        }
    }
}

pub async fn totals(store: &dyn SessionStore, user_id: &str, period: CostPeriod) -> Result<CostSummary> {
    let now = Utc::now();
    let totals = store.cost_totals(user_id, period.since(now)).await?;
    Ok(CostSummary::new(period, now, totals))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TransitionPayload;
    use crate::store::MemorySessionStore;
    use crate::testing::MockTracer;

    fn usage(input: i64, output: i64, models: &[(&str, i64, i64)]) -> TokenUsage {
        TokenUsage {
            input_tokens: input,
            output_tokens: output,
            model_usage: models
                .iter()
                .map(|(name, i, o)| (name.to_string(), ModelUsage { input: *i, output: *o }))
                .collect(),
        }
    }

    #[test]
    fn test_resolve_provider() {
        assert_eq!(
            PriceTable::resolve("anthropic:claude-3-opus"),
            ("anthropic".to_string(), "claude-3-opus".to_string())
        );
        assert_eq!(PriceTable::resolve("gemini-pro").0, "google");
        assert_eq!(
            PriceTable::resolve("mystery-model"),
            ("openai".to_string(), "gpt-4o".to_string())
        );
    }

    #[test]
    fn test_cost_without_breakdown_uses_default_rates() {
        let cost = NewResearchCost::from_usage(&usage(1000, 1000, &[]), &PriceTable::default()).unwrap();
        // 1000 * 0.000005 + 1000 * 0.000015
        assert_eq!(cost.estimated_cost(), 0.02);
        assert_eq!(cost.total_tokens(), 2000);
        assert_eq!(cost.provider_costs()["openai"], 0.02);
    }

    #[test]
    fn test_cost_by_provider() {
        let usage = usage(
            3000,
            1000,
            &[("openai:gpt-4o", 2000, 500), ("claude-3-opus", 1000, 500)],
        );
        let cost = NewResearchCost::from_usage(&usage, &PriceTable::default()).unwrap();

        let openai = cost.provider_costs()["openai"];
        let anthropic = cost.provider_costs()["anthropic"];
        assert_eq!(openai, round_usd(2000.0 * 0.000005 + 500.0 * 0.000015));
        assert_eq!(anthropic, round_usd(1000.0 * 0.000015 + 500.0 * 0.000075));
        assert!(openai + anthropic <= cost.estimated_cost() + 0.0001);
    }

    #[test]
    fn test_estimate_usage() {
        let report = serde_json::json!({"final_report": "x".repeat(400)});
        let usage = estimate_usage("What is climate change?", Some(&report));
        assert_eq!(usage.input_tokens, (23 + 2000) / 4);
        assert_eq!(usage.output_tokens, 100);

        let empty = estimate_usage("", None);
        assert_eq!(empty.output_tokens, 1);
    }

    #[test]
    fn test_period_parse() {
        assert_eq!("Week".parse::<CostPeriod>().unwrap(), CostPeriod::Week);
        assert_eq!("".parse::<CostPeriod>().unwrap(), CostPeriod::All);
        assert!("decade".parse::<CostPeriod>().is_err());
        assert!(CostPeriod::All.since(Utc::now()).is_none());
    }

    #[tokio::test]
    async fn test_resolve_usage_prefers_runner_then_tracer() {
        let tracer = MockTracer::with_usage(usage(10, 20, &[]));
        let mut session = ResearchSession::new("user-1", "query", None);
        session.trace_id = Some("trace-1".to_string());

        let runner = usage(1, 2, &[]);
        let picked = resolve_usage(&tracer, &session, Some(runner.clone()), None).await;
        assert_eq!(picked, runner);

        let picked = resolve_usage(&tracer, &session, None, None).await;
        assert_eq!(picked.input_tokens, 10);

        session.trace_id = None;
        let picked = resolve_usage(&tracer, &session, None, None).await;
        assert_eq!(picked.input_tokens, (5 + 2000) / 4);
    }

    #[tokio::test]
    async fn test_recompute_requires_completed_session() {
        let store = MemorySessionStore::new();
        let tracer = MockTracer::default();
        let session = store.create("alice", "query", None).await.unwrap();

        let err = recompute(&store, &tracer, &PriceTable::default(), session.id, "alice")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));

        store.claim(session.id).await.unwrap();
        store
            .transition(
                session.id,
                ResearchStatus::Completed,
                TransitionPayload::completed(
                    serde_json::json!({"final_report": "report"}),
                    "summary".to_string(),
                    serde_json::json!({}),
                    NewResearchCost::new(1, 1, 0.0, BTreeMap::new()).unwrap(),
                ),
            )
            .await
            .unwrap();

        let cost = recompute(&store, &tracer, &PriceTable::default(), session.id, "alice")
            .await
            .unwrap();
        assert_eq!(cost.input_tokens, (5 + 2000) / 4);
        assert_eq!(cost.total_tokens, cost.input_tokens + cost.output_tokens);

        let summary = totals(&store, "alice", CostPeriod::All).await.unwrap();
        assert_eq!(summary.session_count, 1);
        assert_eq!(summary.total_tokens, cost.total_tokens);
        assert_eq!(totals(&store, "bob", CostPeriod::Day).await.unwrap().session_count, 0);
    }
}
