//! The three reasoning roles and their decision contracts.

pub mod auditor;
pub mod executor;
pub mod strategist;

use std::sync::Arc;

use serde_json::{json, Value};

use crate::dispatch::ToolDispatcher;

/// Tools whose successful-but-empty output is suspicious ("empty proof").
const DATA_INTENSIVE_TOOLS: &[&str] = &[
    "read_file",
    "list_directory",
    "web_search",
    "news_search",
    "search",
    "search_nodes",
    "search_golden_fund",
    "search_repositories",
    "recall_task",
    "fetch_url",
    "maps_geocode",
    "maps_directions",
    "get_file_info",
    "analyze_dataset",
    "generate_statistics",
];

pub fn is_data_intensive(tool: &str) -> bool {
    DATA_INTENSIVE_TOOLS.contains(&tool)
}

/// Tools safe to run without reasoning when the planned call is already
/// schema-complete (the executor's fast path).
const READ_ONLY_TOOLS: &[&str] = &[
    "read_file",
    "list_directory",
    "get_file_info",
    "get_time",
    "web_search",
    "screenshot",
    "clipboard_read",
];

pub fn is_read_only(tool: &str) -> bool {
    READ_ONLY_TOOLS.contains(&tool)
}

/// One deliberation round through the sequential-thinking server. Failures
/// degrade to an empty analysis; callers fall back to their own heuristics.
pub async fn sequential_thinking(
    dispatcher: &Arc<ToolDispatcher>,
    prompt: &str,
    total_thoughts: u32,
) -> String {
    let result = dispatcher
        .resolve_and_dispatch(
            Some("sequentialthinking"),
            json!({
                "thought": prompt,
                "thought_number": 1,
                "total_thoughts": total_thoughts,
                "next_thought_needed": false,
            }),
            Some("sequential-thinking"),
        )
        .await;
    if result.success {
        result.output
    } else {
        tracing::debug!(error = ?result.error, "sequential-thinking unavailable");
        String::new()
    }
}

/// Over 50% duplicated lines means the reasoning engine is looping.
pub fn is_repetitive_thinking(analysis: &str) -> bool {
    if analysis.len() < 100 {
        return false;
    }
    let lines: Vec<&str> = analysis
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();
    if lines.len() < 4 {
        return false;
    }
    let unique: std::collections::HashSet<&str> = lines.iter().copied().collect();
    let duplicated = lines.len() - unique.len();
    duplicated * 2 > lines.len()
}

pub fn truncate_output(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max_chars).collect();
        format!("{cut}\n... (truncated)")
    }
}

/// Pull a float out of loosely structured LLM JSON, tolerating strings.
pub fn value_as_f64(value: &Value) -> Option<f64> {
    value
        .as_f64()
        .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
}
