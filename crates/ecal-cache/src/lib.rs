//! Cache reconciliation layer: freshness policy, source merge engine and the
//! cache service that ties them to the record store.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{NaiveDate, TimeDelta};
use ecal_storage::StoreError;
use thiserror::Error;
use tracing::warn;

mod freshness;
mod merge;
mod registry;
mod scheduler;
mod service;

pub use freshness::{FreshnessPolicy, RecordKind};
pub use merge::{
    relative_spread, AnalystGroup, Disagreement, EarningsCluster, MergeConfig, MergeEngine,
    MergePlan, MergedEarnings,
};
pub use registry::{SourceEntry, SourceRegistry, REGISTRY_FILE};
pub use scheduler::maybe_build_sweep_scheduler;
pub use service::{month_bounds, CacheService, SubmitReport, SweepReport};

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("invalid range: end {end} is before start {start}")]
    InvalidRange { start: NaiveDate, end: NaiveDate },
    #[error("invalid calendar month {year}-{month:02}")]
    InvalidMonth { year: i32, month: u32 },
    #[error("snapshot schema version {found} is not supported (expected {expected})")]
    SchemaMismatch { found: String, expected: u32 },
    #[error("malformed snapshot: {0}")]
    MalformedSnapshot(#[from] serde_json::Error),
    #[error("snapshot archive: {0:#}")]
    Archive(#[source] anyhow::Error),
    #[error("store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreLocation {
    InMemory,
    File(PathBuf),
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub database_url: String,
    pub workspace_root: PathBuf,
    pub export_dir: PathBuf,
    pub earnings_ttl_days: i64,
    pub analyst_ttl_hours: i64,
    pub retention_days: i64,
    pub analyst_retention_days: i64,
    pub date_window_days: i64,
    pub eps_disagreement: f64,
    pub revenue_disagreement: f64,
    pub scheduler_enabled: bool,
    pub sweep_cron: String,
    pub web_port: u16,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://./data/earnings_cache.db".to_string(),
            workspace_root: PathBuf::from("."),
            export_dir: PathBuf::from("./exports"),
            earnings_ttl_days: 7,
            analyst_ttl_hours: 6,
            retention_days: 365,
            analyst_retention_days: 7,
            date_window_days: 7,
            eps_disagreement: 0.15,
            revenue_disagreement: 0.30,
            scheduler_enabled: false,
            sweep_cron: "0 15 3 * * *".to_string(),
            web_port: 5002,
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Like [`env_or`], but only strictly positive values are accepted.
fn env_positive<T>(key: &str, default: T) -> T
where
    T: FromStr + PartialOrd + Default + Copy + fmt::Display,
{
    let Ok(raw) = std::env::var(key) else {
        return default;
    };
    match raw.trim().parse::<T>() {
        Ok(value) if value > T::default() => value,
        _ => {
            warn!(key, value = %raw, %default, "ignoring non-positive or malformed setting");
            default
        }
    }
}

fn positive_span(span: Option<TimeDelta>, fallback: TimeDelta, setting: &str) -> TimeDelta {
    match span {
        Some(span) if span > TimeDelta::zero() => span,
        _ => {
            warn!(setting, %fallback, "out-of-range duration replaced by default");
            fallback
        }
    }
}

impl CacheConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: std::env::var("DATABASE_URL").unwrap_or(defaults.database_url),
            workspace_root: std::env::var("ECAL_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.workspace_root),
            export_dir: std::env::var("ECAL_EXPORT_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.export_dir),
            earnings_ttl_days: env_positive("ECAL_EARNINGS_TTL_DAYS", defaults.earnings_ttl_days),
            analyst_ttl_hours: env_positive("ECAL_ANALYST_TTL_HOURS", defaults.analyst_ttl_hours),
            retention_days: env_positive("ECAL_RETENTION_DAYS", defaults.retention_days),
            analyst_retention_days: env_positive(
                "ECAL_ANALYST_RETENTION_DAYS",
                defaults.analyst_retention_days,
            ),
            date_window_days: env_positive("ECAL_DATE_WINDOW_DAYS", defaults.date_window_days),
            eps_disagreement: env_positive("ECAL_EPS_DISAGREEMENT", defaults.eps_disagreement),
            revenue_disagreement: env_positive(
                "ECAL_REVENUE_DISAGREEMENT",
                defaults.revenue_disagreement,
            ),
            scheduler_enabled: std::env::var("ECAL_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(defaults.scheduler_enabled),
            sweep_cron: std::env::var("ECAL_SWEEP_CRON").unwrap_or(defaults.sweep_cron),
            web_port: env_or("ECAL_WEB_PORT", defaults.web_port),
        }
    }

    /// Accepts `sqlite://path`, `sqlite:path`, a bare path, or `:memory:`.
    pub fn store_location(&self) -> StoreLocation {
        let raw = self.database_url.trim();
        let path = raw
            .strip_prefix("sqlite://")
            .or_else(|| raw.strip_prefix("sqlite:"))
            .unwrap_or(raw);
        let path = path.split('?').next().unwrap_or(path);
        if path.is_empty() || path == ":memory:" {
            StoreLocation::InMemory
        } else {
            StoreLocation::File(PathBuf::from(path))
        }
    }

    /// Horizons that overflow `TimeDelta` or are not positive fall back to
    /// the defaults.
    pub fn freshness_policy(&self) -> FreshnessPolicy {
        let defaults = FreshnessPolicy::default();
        FreshnessPolicy {
            earnings_future: positive_span(
                TimeDelta::try_days(self.earnings_ttl_days),
                defaults.earnings_future,
                "earnings_ttl_days",
            ),
            earnings_past: None,
            analyst_snapshot: positive_span(
                TimeDelta::try_hours(self.analyst_ttl_hours),
                defaults.analyst_snapshot,
                "analyst_ttl_hours",
            ),
            earnings_retention: positive_span(
                TimeDelta::try_days(self.retention_days),
                defaults.earnings_retention,
                "retention_days",
            ),
            analyst_retention: positive_span(
                TimeDelta::try_days(self.analyst_retention_days),
                defaults.analyst_retention,
                "analyst_retention_days",
            ),
        }
    }

    pub fn merge_config(&self) -> MergeConfig {
        let defaults = MergeConfig::default();
        let threshold = |value: f64, fallback: f64, setting: &str| {
            if value.is_finite() && value > 0.0 {
                value
            } else {
                warn!(setting, value, fallback, "invalid disagreement threshold replaced by default");
                fallback
            }
        };
        MergeConfig {
            eps_disagreement: threshold(
                self.eps_disagreement,
                defaults.eps_disagreement,
                "eps_disagreement",
            ),
            revenue_disagreement: threshold(
                self.revenue_disagreement,
                defaults.revenue_disagreement,
                "revenue_disagreement",
            ),
            date_window: positive_span(
                TimeDelta::try_days(self.date_window_days),
                defaults.date_window,
                "date_window_days",
            ),
            ..defaults
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn database_url_forms_resolve_to_locations() {
        let mut config = CacheConfig::default();
        assert_eq!(
            config.store_location(),
            StoreLocation::File(PathBuf::from("./data/earnings_cache.db"))
        );

        config.database_url = "sqlite:cache.db?mode=rwc".into();
        assert_eq!(config.store_location(), StoreLocation::File(PathBuf::from("cache.db")));

        config.database_url = "sqlite::memory:".into();
        assert_eq!(config.store_location(), StoreLocation::InMemory);
    }

    #[test]
    fn out_of_range_durations_fall_back_to_defaults() {
        let config = CacheConfig {
            retention_days: 1e15 as i64,
            analyst_ttl_hours: i64::MAX,
            earnings_ttl_days: 0,
            date_window_days: -3,
            eps_disagreement: f64::NAN,
            revenue_disagreement: -0.5,
            ..CacheConfig::default()
        };
        assert_eq!(config.freshness_policy(), FreshnessPolicy::default());
        assert_eq!(config.merge_config(), MergeConfig::default());
    }

    #[test]
    fn env_positive_rejects_non_positive_values() {
        std::env::set_var("ECAL_TEST_WINDOW_NEGATIVE", "-4");
        std::env::set_var("ECAL_TEST_WINDOW_GARBAGE", "soon");
        std::env::set_var("ECAL_TEST_WINDOW_OK", " 3 ");
        assert_eq!(env_positive("ECAL_TEST_WINDOW_NEGATIVE", 7_i64), 7);
        assert_eq!(env_positive("ECAL_TEST_WINDOW_GARBAGE", 7_i64), 7);
        assert_eq!(env_positive("ECAL_TEST_WINDOW_OK", 7_i64), 3);
        assert_eq!(env_positive("ECAL_TEST_WINDOW_UNSET", 0.15_f64), 0.15);
    }

    #[test]
    fn defaults_match_policy_and_merge_defaults() {
        let config = CacheConfig::default();
        assert_eq!(config.freshness_policy(), FreshnessPolicy::default());
        assert_eq!(config.merge_config(), MergeConfig::default());
    }
}
