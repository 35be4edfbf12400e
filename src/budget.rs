use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;

/// Error-budget level below which a response counts as running low.
pub const LOW_ERROR_BUDGET: i64 = 20;
/// Token fallback threshold when the limit string cannot be parsed.
pub const LOW_TOKENS_FALLBACK: i64 = 10;

/// Rate-limit and error-limit counters reported on a single response.
///
/// Created per response and never persisted.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct BudgetSnapshot {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    /// Window allowance such as `150/15m`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub used: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_budget_remaining: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_budget_reset_seconds: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct BudgetHealth {
    pub low_on_tokens: bool,
    pub low_on_error_budget: bool,
}

impl BudgetHealth {
    pub fn is_healthy(&self) -> bool {
        !self.low_on_tokens && !self.low_on_error_budget
    }
}

impl BudgetSnapshot {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Leading integer of the limit string (`"150/15m"` -> `150`).
    pub fn limit_tokens(&self) -> Option<i64> {
        let limit = self.limit.as_deref()?;
        let head = limit.split('/').next()?.trim();
        head.parse::<i64>().ok().filter(|n| *n > 0)
    }

    /// True when fewer than 10% of the window's tokens remain. Falls back to
    /// `remaining < 10` when the limit is absent or unparseable.
    pub fn is_low_on_tokens(&self) -> bool {
        let Some(remaining) = self.remaining else {
            return false;
        };
        match self.limit_tokens() {
            Some(limit) => remaining.saturating_mul(10) < limit,
            None => remaining < LOW_TOKENS_FALLBACK,
        }
    }

    pub fn is_low_on_error_budget(&self) -> bool {
        self.error_budget_remaining
            .map(|r| r < LOW_ERROR_BUDGET)
            .unwrap_or(false)
    }

    pub fn health(&self) -> BudgetHealth {
        BudgetHealth {
            low_on_tokens: self.is_low_on_tokens(),
            low_on_error_budget: self.is_low_on_error_budget(),
        }
    }
}

fn opt<T: fmt::Display>(v: &Option<T>) -> String {
    v.as_ref().map(|x| x.to_string()).unwrap_or_else(|| "-".into())
}

impl fmt::Display for BudgetSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "group={} limit={} remaining={} used={} retry_after={} error_remain={} error_reset={}",
            opt(&self.group),
            opt(&self.limit),
            opt(&self.remaining),
            opt(&self.used),
            opt(&self.retry_after_seconds),
            opt(&self.error_budget_remaining),
            opt(&self.error_budget_reset_seconds),
        )
    }
}

/// Latest budget snapshot seen per rate-limit group.
///
/// Responses without a group header are filed under the empty string.
#[derive(Debug, Default)]
pub struct BudgetTracker {
    latest: RwLock<HashMap<String, BudgetSnapshot>>,
}

impl BudgetTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&self, snapshot: &BudgetSnapshot) {
        if snapshot.is_empty() {
            return;
        }
        let group = snapshot.group.clone().unwrap_or_default();
        let mut latest = self.latest.write().unwrap_or_else(|e| e.into_inner());
        latest.insert(group, snapshot.clone());
    }

    pub fn latest(&self, group: &str) -> Option<BudgetSnapshot> {
        let latest = self.latest.read().unwrap_or_else(|e| e.into_inner());
        latest.get(group).cloned()
    }

    pub fn snapshots(&self) -> Vec<BudgetSnapshot> {
        let latest = self.latest.read().unwrap_or_else(|e| e.into_inner());
        let mut all: Vec<_> = latest.values().cloned().collect();
        all.sort_by(|a, b| a.group.cmp(&b.group));
        all
    }

    /// True if any tracked group is currently low on tokens or error budget.
    pub fn any_low(&self) -> bool {
        let latest = self.latest.read().unwrap_or_else(|e| e.into_inner());
        latest.values().any(|s| !s.health().is_healthy())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_limit(limit: Option<&str>, remaining: i64) -> BudgetSnapshot {
        BudgetSnapshot {
            limit: limit.map(str::to_string),
            remaining: Some(remaining),
            ..Default::default()
        }
    }

    #[test]
    fn low_tokens_uses_ten_percent_of_limit() {
        assert!(with_limit(Some("150/15m"), 10).is_low_on_tokens());
        assert!(with_limit(Some("150/15m"), 14).is_low_on_tokens());
        assert!(!with_limit(Some("150/15m"), 15).is_low_on_tokens());
        assert!(!with_limit(Some("150/15m"), 20).is_low_on_tokens());
    }

    #[test]
    fn low_tokens_fallback_when_limit_unparseable() {
        assert!(with_limit(Some("lots"), 9).is_low_on_tokens());
        assert!(!with_limit(Some("lots"), 10).is_low_on_tokens());
        assert!(with_limit(None, 3).is_low_on_tokens());
    }

    #[test]
    fn missing_counters_are_healthy() {
        let s = BudgetSnapshot::default();
        assert!(!s.is_low_on_tokens());
        assert!(!s.is_low_on_error_budget());
        assert!(s.health().is_healthy());
    }

    #[test]
    fn error_budget_threshold() {
        let mut s = BudgetSnapshot {
            error_budget_remaining: Some(19),
            ..Default::default()
        };
        assert!(s.is_low_on_error_budget());
        s.error_budget_remaining = Some(20);
        assert!(!s.is_low_on_error_budget());
    }

    #[test]
    fn tracker_keeps_latest_per_group() {
        let tracker = BudgetTracker::new();
        let mut s = BudgetSnapshot {
            group: Some("market".into()),
            limit: Some("150/15m".into()),
            remaining: Some(100),
            ..Default::default()
        };
        tracker.observe(&s);
        s.remaining = Some(5);
        tracker.observe(&s);
        tracker.observe(&BudgetSnapshot::default());

        assert_eq!(tracker.latest("market").unwrap().remaining, Some(5));
        assert_eq!(tracker.snapshots().len(), 1);
        assert!(tracker.any_low());
    }

    #[test]
    fn display_marks_missing_fields() {
        let s = BudgetSnapshot {
            remaining: Some(7),
            ..Default::default()
        };
        let text = s.to_string();
        assert!(text.contains("remaining=7"));
        assert!(text.contains("group=-"));
    }
}
