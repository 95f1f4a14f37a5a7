//! Filtering of agent reasoning before it is stored.
//!
//! Only keys on the allow-list survive, at every level of nesting. Arrays are
//! filtered element-wise and scalars pass through.

use serde_json::{Map, Value};

/// Keys a user may see.
pub const ALLOWED_KEYS: [&str; 7] = [
    "research_brief",
    "methodology",
    "approach",
    "summary",
    "key_findings",
    "sources_consulted",
    "research_steps",
];

/// Chain-of-thought and tool internals. Never stored even if allow-listed later.
pub const BLOCKED_KEYS: [&str; 13] = [
    "raw_chain_of_thought",
    "internal_agent_communications",
    "debug_info",
    "tool_execution_logs",
    "raw_agent_thoughts",
    "sensitive_internal_data",
    "internal_structure",
    "agent_communications",
    "execution_trace",
    "nested_debug",
    "raw_thoughts",
    "planning_steps",
    "tool_calls",
];

fn is_allowed(key: &str) -> bool {
    ALLOWED_KEYS.contains(&key) && !BLOCKED_KEYS.contains(&key)
}

fn filter_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(filter_map(map)),
        Value::Array(items) => Value::Array(items.iter().map(filter_value).collect()),
        other => other.clone(),
    }
}

fn filter_map(map: &Map<String, Value>) -> Map<String, Value> {
    map.iter()
        .filter(|(key, _)| is_allowed(key))
        .map(|(key, value)| (key.clone(), filter_value(value)))
        .collect()
}

/// Strip everything but user-facing reasoning. Non-object input becomes `{}`.
pub fn sanitize(reasoning: &Value) -> Value {
    match reasoning {
        Value::Object(map) => Value::Object(filter_map(map)),
        _ => Value::Object(Map::new()),
    }
}
