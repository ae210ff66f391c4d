use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

/// Consecutive failures of one agent since its last success.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FailureStreak {
    pub count: u32,
    pub last_error: Option<String>,
    pub last_alert_at: Option<DateTime<Utc>>,
}

/// Per-process failure streaks with alert throttling.
///
/// An alert is due once the streak reaches `threshold` and no alert was
/// sent for the agent during the last `cooldown`.
#[derive(Debug)]
pub struct FailureTracker {
    streaks: Mutex<HashMap<String, FailureStreak>>,
    threshold: u32,
    cooldown: Duration,
}

impl FailureTracker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            streaks: Mutex::new(HashMap::new()),
            threshold,
            cooldown,
        }
    }

    pub fn record_success(&self, agent: &str) {
        let mut streaks = self.streaks.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(streak) = streaks.get_mut(agent) {
            // The alert timestamp survives so the cool-down still applies
            streak.count = 0;
            streak.last_error = None;
        }
    }

    /// Count a failure. Returns the streak length when an alert should fire.
    pub fn record_failure(&self, agent: &str, error: &str, now: DateTime<Utc>) -> Option<u32> {
        let mut streaks = self.streaks.lock().unwrap_or_else(|e| e.into_inner());
        let streak = streaks.entry(agent.to_string()).or_default();
        streak.count += 1;
        streak.last_error = Some(error.to_string());

        if streak.count < self.threshold {
            return None;
        }
        let cooled_down = streak
            .last_alert_at
            .map_or(true, |last| now - last >= self.cooldown);
        if !cooled_down {
            return None;
        }
        streak.last_alert_at = Some(now);
        Some(streak.count)
    }

    pub fn streak(&self, agent: &str) -> FailureStreak {
        let streaks = self.streaks.lock().unwrap_or_else(|e| e.into_inner());
        streaks.get(agent).cloned().unwrap_or_default()
    }

    pub fn reset(&self) {
        self.streaks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn tracker() -> FailureTracker {
        FailureTracker::new(3, Duration::hours(1))
    }

    #[test]
    fn alert_fires_at_threshold_then_throttles() {
        let tracker = tracker();
        let start = Utc.with_ymd_and_hms(2026, 10, 18, 9, 0, 0).unwrap();
        let agent = "seo_demand_capture";

        assert_eq!(tracker.record_failure(agent, "e1", start), None);
        assert_eq!(tracker.record_failure(agent, "e2", start + Duration::minutes(4)), None);
        let first_alert = start + Duration::minutes(9);
        assert_eq!(tracker.record_failure(agent, "e3", first_alert), Some(3));

        assert_eq!(
            tracker.record_failure(agent, "e4", first_alert + Duration::minutes(5)),
            None
        );
        assert_eq!(
            tracker.record_failure(agent, "e5", first_alert + Duration::minutes(61)),
            Some(5)
        );
    }

    #[test]
    fn success_resets_streak_immediately() {
        let tracker = tracker();
        let now = Utc::now();
        for i in 0..5 {
            tracker.record_failure("a", &format!("e{i}"), now);
        }
        assert_eq!(tracker.streak("a").count, 5);
        tracker.record_success("a");
        assert_eq!(tracker.streak("a").count, 0);
        assert_eq!(tracker.record_failure("a", "again", now), None);
    }

    #[test]
    fn streaks_are_per_agent() {
        let tracker = tracker();
        let now = Utc::now();
        tracker.record_failure("a", "x", now);
        tracker.record_failure("a", "x", now);
        assert_eq!(tracker.record_failure("b", "x", now), None);
        assert_eq!(tracker.record_failure("a", "x", now), Some(3));
    }
}
