//! Per-tool execution statistics kept by the router.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

/// Number of recent errors remembered per tool.
pub const RECENT_ERRORS: usize = 10;

/// A failed attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorRecord {
    pub at: DateTime<Utc>,
    pub error: String,
}

/// Counters for one tool.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolStat {
    pub total: u64,
    pub success: u64,
    pub failed: u64,
    /// Sum of latencies of successful attempts, in milliseconds.
    pub total_time_ms: u64,
    /// Average latency of successful attempts, in milliseconds.
    pub avg_time_ms: f64,
    pub recent_errors: VecDeque<ErrorRecord>,
}

impl ToolStat {
    /// Successful attempts as a percentage of all attempts.
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.success as f64 / self.total as f64 * 100.0
    }
}

/// Execution bookkeeping for every tool the router has called.
#[derive(Debug, Default)]
pub struct ToolStats {
    tools: BTreeMap<String, ToolStat>,
}

impl ToolStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&mut self, tool: &str, elapsed: Duration) {
        let stat = self.tools.entry(tool.to_string()).or_default();
        stat.total += 1;
        stat.success += 1;
        stat.total_time_ms += elapsed.as_millis() as u64;
        stat.avg_time_ms = stat.total_time_ms as f64 / stat.success as f64;
    }

    pub fn record_failure(&mut self, tool: &str, error: impl Into<String>) {
        let stat = self.tools.entry(tool.to_string()).or_default();
        stat.total += 1;
        stat.failed += 1;
        stat.recent_errors.push_back(ErrorRecord {
            at: Utc::now(),
            error: error.into(),
        });
        while stat.recent_errors.len() > RECENT_ERRORS {
            stat.recent_errors.pop_front();
        }
    }

    pub fn get(&self, tool: &str) -> Option<&ToolStat> {
        self.tools.get(tool)
    }

    /// Copy of every tool's counters, keyed by tool name.
    pub fn snapshot(&self) -> BTreeMap<String, ToolStat> {
        self.tools.clone()
    }
}
