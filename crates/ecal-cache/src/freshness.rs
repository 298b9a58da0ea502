//! Staleness classes and retention horizons.

use chrono::{DateTime, TimeDelta, Utc};
use ecal_core::{AnalystSnapshot, EarningsRecord};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    /// Estimate-only earnings, including past-dated events still awaiting actuals.
    EarningsFuture,
    /// Earnings with actuals set.
    EarningsPast,
    AnalystSnapshot,
}

impl RecordKind {
    pub fn of_earnings(record: &EarningsRecord) -> Self {
        if record.is_reported() {
            RecordKind::EarningsPast
        } else {
            RecordKind::EarningsFuture
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FreshnessPolicy {
    pub earnings_future: TimeDelta,
    /// `None` means reported earnings never go stale.
    pub earnings_past: Option<TimeDelta>,
    pub analyst_snapshot: TimeDelta,
    /// Earnings older than this (by earnings date) are swept.
    pub earnings_retention: TimeDelta,
    /// Analyst snapshots not refreshed within this window are swept.
    pub analyst_retention: TimeDelta,
}

impl Default for FreshnessPolicy {
    fn default() -> Self {
        Self {
            earnings_future: TimeDelta::days(7),
            earnings_past: None,
            analyst_snapshot: TimeDelta::hours(6),
            earnings_retention: TimeDelta::days(365),
            analyst_retention: TimeDelta::days(7),
        }
    }
}

impl FreshnessPolicy {
    pub fn horizon(&self, kind: RecordKind) -> Option<TimeDelta> {
        match kind {
            RecordKind::EarningsFuture => Some(self.earnings_future),
            RecordKind::EarningsPast => self.earnings_past,
            RecordKind::AnalystSnapshot => Some(self.analyst_snapshot),
        }
    }

    /// Stale once the age strictly exceeds the class horizon. Timestamps in
    /// the future count as fresh.
    pub fn is_stale(&self, kind: RecordKind, last_updated: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        match self.horizon(kind) {
            Some(horizon) => now.signed_duration_since(last_updated) > horizon,
            None => false,
        }
    }

    pub fn earnings_is_stale(&self, record: &EarningsRecord, now: DateTime<Utc>) -> bool {
        self.is_stale(RecordKind::of_earnings(record), record.last_updated, now)
    }

    pub fn analyst_is_stale(&self, snapshot: &AnalystSnapshot, now: DateTime<Utc>) -> bool {
        self.is_stale(RecordKind::AnalystSnapshot, snapshot.last_updated, now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 2, 10, 12, 0, 0).single().unwrap()
    }

    #[test]
    fn analyst_snapshot_goes_stale_after_six_hours() {
        let policy = FreshnessPolicy::default();
        assert!(policy.is_stale(RecordKind::AnalystSnapshot, now() - TimeDelta::hours(7), now()));
        assert!(!policy.is_stale(RecordKind::AnalystSnapshot, now() - TimeDelta::hours(1), now()));
        assert!(!policy.is_stale(RecordKind::AnalystSnapshot, now() - TimeDelta::hours(6), now()));
    }

    #[test]
    fn reported_earnings_never_go_stale() {
        let policy = FreshnessPolicy::default();
        let ancient = now() - TimeDelta::days(3650);
        assert!(!policy.is_stale(RecordKind::EarningsPast, ancient, now()));
        assert!(policy.is_stale(RecordKind::EarningsFuture, ancient, now()));
    }

    #[test]
    fn future_dated_timestamps_are_fresh() {
        let policy = FreshnessPolicy::default();
        assert!(!policy.is_stale(RecordKind::EarningsFuture, now() + TimeDelta::days(30), now()));
    }

    #[test]
    fn finite_past_horizon_is_honored() {
        let policy = FreshnessPolicy {
            earnings_past: Some(TimeDelta::days(90)),
            ..FreshnessPolicy::default()
        };
        assert!(policy.is_stale(RecordKind::EarningsPast, now() - TimeDelta::days(91), now()));
    }
}
