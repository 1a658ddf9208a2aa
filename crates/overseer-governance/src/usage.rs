use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use uuid::Uuid;

/// How a governed tool call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageStatus {
    Success,
    Error,
    Denied,
    RateLimited,
    PendingApproval,
    Rejected,
}

/// Immutable audit entry for one tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolUsageRecord {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub agent_id: String,
    pub user_id: Option<String>,
    pub tool_name: String,
    pub parameters: Value,
    pub duration_ms: u64,
    pub status: UsageStatus,
    pub output_size: usize,
}

impl ToolUsageRecord {
    pub fn new(
        agent_id: impl Into<String>,
        user_id: Option<String>,
        tool_name: impl Into<String>,
        parameters: Value,
        status: UsageStatus,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            agent_id: agent_id.into(),
            user_id,
            tool_name: tool_name.into(),
            parameters,
            duration_ms: 0,
            status,
            output_size: 0,
        }
    }

    pub fn with_timing(mut self, duration_ms: u64, output_size: usize) -> Self {
        self.duration_ms = duration_ms;
        self.output_size = output_size;
        self
    }
}

/// Aggregated counts for one tool or one agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UsageSummary {
    pub calls: u64,
    pub by_status: BTreeMap<UsageStatus, u64>,
    pub total_duration_ms: u64,
    pub total_output_bytes: u64,
}

impl UsageSummary {
    fn add(&mut self, record: &ToolUsageRecord) {
        self.calls += 1;
        *self.by_status.entry(record.status).or_insert(0) += 1;
        self.total_duration_ms += record.duration_ms;
        self.total_output_bytes += record.output_size as u64;
    }

    pub fn count(&self, status: UsageStatus) -> u64 {
        self.by_status.get(&status).copied().unwrap_or(0)
    }

    /// Mean duration of the calls that actually ran.
    pub fn average_duration_ms(&self) -> f64 {
        let ran = self.count(UsageStatus::Success) + self.count(UsageStatus::Error);
        if ran == 0 {
            0.0
        } else {
            self.total_duration_ms as f64 / ran as f64
        }
    }
}

/// Tool usage aggregated over a time window.
#[derive(Debug, Clone, Serialize)]
pub struct UsageReport {
    pub generated_at: DateTime<Utc>,
    /// Look-back window; `None` covers every record.
    pub window_secs: Option<u64>,
    pub total: UsageSummary,
    pub by_tool: BTreeMap<String, UsageSummary>,
    pub by_agent: BTreeMap<String, UsageSummary>,
}

impl UsageReport {
    fn build<'a>(
        records: impl Iterator<Item = &'a ToolUsageRecord>,
        window: Option<Duration>,
    ) -> Self {
        let mut report = UsageReport {
            generated_at: Utc::now(),
            window_secs: window.map(|w| w.as_secs()),
            total: UsageSummary::default(),
            by_tool: BTreeMap::new(),
            by_agent: BTreeMap::new(),
        };
        for record in records {
            report.total.add(record);
            report
                .by_tool
                .entry(record.tool_name.clone())
                .or_default()
                .add(record);
            report
                .by_agent
                .entry(record.agent_id.clone())
                .or_default()
                .add(record);
        }
        report
    }
}

/// Append-only in-memory store of usage records.
#[derive(Default)]
pub struct UsageLedger {
    records: RwLock<Vec<ToolUsageRecord>>,
}

impl UsageLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, record: ToolUsageRecord) {
        self.records.write().push(record);
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    pub fn records(&self) -> Vec<ToolUsageRecord> {
        self.records.read().clone()
    }

    /// Aggregate records newer than `window`, or all records when `None`.
    pub fn report(&self, window: Option<Duration>) -> UsageReport {
        let records = self.records.read();
        let cutoff = window
            .and_then(|w| ChronoDuration::from_std(w).ok())
            .map(|w| Utc::now() - w);
        UsageReport::build(
            records
                .iter()
                .filter(|r| cutoff.map_or(true, |c| r.timestamp >= c)),
            window,
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(agent: &str, tool: &str, status: UsageStatus, ms: u64) -> ToolUsageRecord {
        ToolUsageRecord::new(agent, None, tool, json!({}), status).with_timing(ms, 10)
    }

    #[test]
    fn test_report_groups_by_tool_and_agent() {
        let ledger = UsageLedger::new();
        ledger.append(record("a1", "search", UsageStatus::Success, 100));
        ledger.append(record("a1", "search", UsageStatus::Error, 300));
        ledger.append(record("a2", "shell", UsageStatus::Denied, 0));

        let report = ledger.report(None);
        assert_eq!(report.total.calls, 3);
        let search = &report.by_tool["search"];
        assert_eq!(search.calls, 2);
        assert_eq!(search.count(UsageStatus::Error), 1);
        assert!((search.average_duration_ms() - 200.0).abs() < f64::EPSILON);
        assert_eq!(report.by_agent["a2"].count(UsageStatus::Denied), 1);
    }

    #[test]
    fn test_report_window_excludes_old_records() {
        let ledger = UsageLedger::new();
        let mut old = record("a1", "search", UsageStatus::Success, 5);
        old.timestamp = Utc::now() - ChronoDuration::hours(2);
        ledger.append(old);
        ledger.append(record("a1", "search", UsageStatus::Success, 5));

        let report = ledger.report(Some(Duration::from_secs(3600)));
        assert_eq!(report.total.calls, 1);
        assert_eq!(report.window_secs, Some(3600));
        assert_eq!(ledger.report(None).total.calls, 2);
    }
}
