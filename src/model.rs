//! Rows owned by the dispatch core and the audit records it persists for the dashboard.

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    pub fn new() -> Self {
        JobId(Uuid::new_v4().to_string())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Waiting,
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "waiting" => Some(JobState::Waiting),
            "active" => Some(JobState::Active),
            "completed" => Some(JobState::Completed),
            "failed" => Some(JobState::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackoffPolicy {
    /// `base_ms * 2^(attempt - 1)`
    Exponential { base_ms: u64 },
    Fixed { delay_ms: u64 },
}

impl BackoffPolicy {
    /// Delay before the next attempt, given how many attempts have already run.
    pub fn delay_after(&self, attempts_made: u32) -> Duration {
        match *self {
            BackoffPolicy::Exponential { base_ms } => {
                let exponent = attempts_made.saturating_sub(1).min(20);
                Duration::from_millis(base_ms.saturating_mul(1u64 << exponent))
            }
            BackoffPolicy::Fixed { delay_ms } => Duration::from_millis(delay_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Agent name; one queue per agent
    pub queue: String,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
    pub state: JobState,
    /// Reaction depth inherited from the event that caused this job
    pub depth: u32,
    /// Earliest time a waiting job may be claimed
    pub run_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn has_attempts_left(&self) -> bool {
        !self.is_exhausted()
    }

    /// True once the final configured attempt has run.
    pub fn is_exhausted(&self) -> bool {
        self.attempts_made >= self.max_attempts
    }
}

/// Calendar-month key, e.g. `2026-10`.
pub fn period_key(at: DateTime<Utc>) -> String {
    format!("{:04}-{:02}", at.year(), at.month())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpendPeriod {
    pub period: String,
    pub budget_limit: f64,
    pub spent_amount: f64,
    pub alert_80_sent: bool,
    pub alert_100_sent: bool,
}

impl SpendPeriod {
    pub fn new(period: impl Into<String>, budget_limit: f64) -> Self {
        Self {
            period: period.into(),
            budget_limit,
            spent_amount: 0.0,
            alert_80_sent: false,
            alert_100_sent: false,
        }
    }

    pub fn ratio(&self) -> f64 {
        if self.budget_limit <= 0.0 {
            return f64::INFINITY;
        }
        self.spent_amount / self.budget_limit
    }

    pub fn is_exhausted(&self) -> bool {
        self.ratio() >= 1.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BudgetThreshold {
    EightyPercent,
    HundredPercent,
}

impl BudgetThreshold {
    pub fn ratio(self) -> f64 {
        match self {
            BudgetThreshold::EightyPercent => 0.8,
            BudgetThreshold::HundredPercent => 1.0,
        }
    }

    pub fn is_flagged(self, period: &SpendPeriod) -> bool {
        match self {
            BudgetThreshold::EightyPercent => period.alert_80_sent,
            BudgetThreshold::HundredPercent => period.alert_100_sent,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub input_units: u64,
    pub output_units: u64,
    pub cost_usd: f64,
}

impl Usage {
    pub fn add(&mut self, other: &Usage) {
        self.input_units += other.input_units;
        self.output_units += other.output_units;
        self.cost_usd += other.cost_usd;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Completed,
    Failed,
}

/// One row per finished attempt, read by the dashboard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub job_id: JobId,
    pub agent: String,
    pub job_type: String,
    pub status: RunStatus,
    pub attempt: u32,
    pub usage: Usage,
    pub duration_ms: u64,
    pub error: Option<String>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    DeadLetter,
    FailureAlert,
    BudgetAlert,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub kind: NotificationKind,
    pub agent: Option<String>,
    pub title: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub job_id: JobId,
    pub agent: String,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub attempts_made: u32,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

/// Audit trail entry written best-effort for every emitted domain event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub name: String,
    pub payload: serde_json::Value,
    pub depth: u32,
    pub emitted_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    #[test]
    fn exponential_backoff_doubles_from_base() {
        let policy = BackoffPolicy::Exponential { base_ms: 5_000 };
        assert_eq!(policy.delay_after(1), Duration::from_secs(5));
        assert_eq!(policy.delay_after(2), Duration::from_secs(10));
        assert_eq!(policy.delay_after(3), Duration::from_secs(20));
    }

    #[test]
    fn period_key_is_calendar_month() {
        let at = Utc.with_ymd_and_hms(2026, 3, 31, 23, 59, 59).unwrap();
        assert_eq!(period_key(at), "2026-03");
    }

    #[test]
    fn spend_ratio() {
        let mut period = SpendPeriod::new("2026-10", 500.0);
        period.spent_amount = 401.0;
        assert!((period.ratio() - 0.802).abs() < 1e-9);
        assert!(!period.is_exhausted());
        period.spent_amount = 500.0;
        assert!(period.is_exhausted());
    }

    proptest! {
        #[test]
        fn backoff_never_shrinks(base in 1u64..10_000, attempt in 1u32..30) {
            let policy = BackoffPolicy::Exponential { base_ms: base };
            prop_assert!(policy.delay_after(attempt + 1) >= policy.delay_after(attempt));
        }
    }
}
