//! The cache service: freshness-annotated reads, merge-then-upsert writes,
//! sweeps and snapshot maintenance.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet};

use anyhow::Context;
use chrono::{DateTime, Months, NaiveDate, Utc};
use ecal_core::{
    AnalystSnapshot, Annotated, EarningsKey, EarningsRecord, KeyOutcome, SourceCandidate,
    SubmitStatus,
};
use ecal_storage::{
    ArchivedSnapshot, ImportSummary, RecordStore, SnapshotArchive, StoreSnapshot, StoreStats,
    UpsertOutcome, SCHEMA_VERSION,
};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, info_span, warn, Instrument};

use crate::{
    CacheConfig, CacheError, EarningsCluster, FreshnessPolicy, MergeEngine, SourceRegistry,
    StoreLocation,
};

/// Per-key outcomes of one `submit` call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubmitReport {
    pub outcomes: Vec<KeyOutcome>,
    /// Keys whose stored record carries `needs_review` after this call.
    pub review_keys: Vec<String>,
}

impl SubmitReport {
    fn count(&self, matches: impl Fn(&SubmitStatus) -> bool) -> usize {
        self.outcomes.iter().filter(|o| matches(&o.status)).count()
    }

    pub fn created(&self) -> usize {
        self.count(|s| matches!(s, SubmitStatus::Created))
    }

    pub fn updated(&self) -> usize {
        self.count(|s| matches!(s, SubmitStatus::Updated))
    }

    pub fn rejected(&self) -> usize {
        self.count(|s| matches!(s, SubmitStatus::Rejected { .. }))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub as_of: DateTime<Utc>,
    pub earnings_removed: u64,
    pub analysts_removed: u64,
}

/// Owns the record store for the life of the process. Build once, share
/// behind an `Arc`, call [`CacheService::close`] on shutdown.
pub struct CacheService {
    store: RecordStore,
    policy: FreshnessPolicy,
    engine: MergeEngine,
    // Held across read-merge-write so two submits never interleave on a key.
    submit_gate: Mutex<()>,
}

impl CacheService {
    pub fn new(store: RecordStore, policy: FreshnessPolicy, engine: MergeEngine) -> Self {
        Self {
            store,
            policy,
            engine,
            submit_gate: Mutex::new(()),
        }
    }

    pub async fn from_config(config: &CacheConfig) -> anyhow::Result<Self> {
        let store = match config.store_location() {
            StoreLocation::InMemory => RecordStore::in_memory().await,
            StoreLocation::File(path) => RecordStore::open(&path).await,
        }
        .with_context(|| format!("opening record store {}", config.database_url))?;

        let mut merge = config.merge_config();
        if let Some(registry) = SourceRegistry::load_from_workspace(&config.workspace_root)? {
            merge.tier_overrides = registry.tier_overrides();
        }
        Ok(Self::new(store, config.freshness_policy(), MergeEngine::new(merge)))
    }

    pub fn policy(&self) -> &FreshnessPolicy {
        &self.policy
    }

    pub fn engine(&self) -> &MergeEngine {
        &self.engine
    }

    pub async fn get_calendar(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<Annotated<EarningsRecord>>, CacheError> {
        self.get_calendar_at(start, end, Utc::now()).await
    }

    pub async fn get_calendar_at(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        now: DateTime<Utc>,
    ) -> Result<Vec<Annotated<EarningsRecord>>, CacheError> {
        if end < start {
            return Err(CacheError::InvalidRange { start, end });
        }
        let records = self.store.list_range(start, end).await?;
        Ok(records
            .into_iter()
            .map(|record| self.annotate_earnings(record, now))
            .collect())
    }

    /// Every event of one calendar month.
    pub async fn get_calendar_month(
        &self,
        year: i32,
        month: u32,
    ) -> Result<Vec<Annotated<EarningsRecord>>, CacheError> {
        let (start, end) = month_bounds(year, month)?;
        self.get_calendar(start, end).await
    }

    pub async fn get_earnings(
        &self,
        symbol: &str,
        earnings_date: NaiveDate,
    ) -> Result<Option<Annotated<EarningsRecord>>, CacheError> {
        let now = Utc::now();
        let record = self.store.get(&EarningsKey::new(symbol, earnings_date)).await?;
        Ok(record.map(|record| self.annotate_earnings(record, now)))
    }

    pub async fn get_analyst(
        &self,
        symbol: &str,
    ) -> Result<Option<Annotated<AnalystSnapshot>>, CacheError> {
        self.get_analyst_at(symbol, Utc::now()).await
    }

    pub async fn get_analyst_at(
        &self,
        symbol: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Annotated<AnalystSnapshot>>, CacheError> {
        let snapshot = self.store.get_analyst(symbol).await?;
        Ok(snapshot.map(|snapshot| Annotated {
            is_stale: self.policy.analyst_is_stale(&snapshot, now),
            record: snapshot,
        }))
    }

    fn annotate_earnings(&self, record: EarningsRecord, now: DateTime<Utc>) -> Annotated<EarningsRecord> {
        Annotated {
            is_stale: self.policy.earnings_is_stale(&record, now),
            record,
        }
    }

    /// Merge and persist candidates. Every logical key gets an outcome;
    /// rejected keys leave the store untouched.
    pub async fn submit(&self, candidates: Vec<SourceCandidate>) -> Result<SubmitReport, CacheError> {
        let span = info_span!("submit", candidates = candidates.len());
        async move {
            let _gate = self.submit_gate.lock().await;
            let plan = self.engine.plan(candidates);
            let mut report = SubmitReport::default();

            let mut siblings: BTreeMap<&str, Vec<NaiveDate>> = BTreeMap::new();
            for cluster in &plan.earnings {
                siblings
                    .entry(cluster.symbol.as_str())
                    .or_default()
                    .push(cluster.earnings_date);
            }
            let mut claimed: BTreeSet<EarningsKey> = BTreeSet::new();

            for cluster in &plan.earnings {
                let others = siblings
                    .get(cluster.symbol.as_str())
                    .map(Vec::as_slice)
                    .unwrap_or_default();
                let (key, landing) = self.resolve_event(cluster, others, &claimed).await?;
                let stored = match &landing {
                    Landing::Exact(record) | Landing::Folded(record) | Landing::Moved(record) => {
                        Some(record)
                    }
                    Landing::Fresh => None,
                };
                let merged = self.engine.merge_earnings(&key, stored, &cluster.members);
                if merged.withheld_partial_actuals {
                    warn!(key = %key, "partial actuals withheld");
                }
                if merged.record.needs_review {
                    report.review_keys.push(key.to_string());
                }
                let outcome = match &landing {
                    Landing::Moved(previous) => {
                        claimed.insert(previous.key());
                        self.store.rekey(&previous.key(), &merged.record).await?
                    }
                    _ => self.store.upsert(&merged.record).await?,
                };
                claimed.insert(key.clone());
                report.outcomes.push(KeyOutcome {
                    key: key.to_string(),
                    status: status_of(outcome),
                });
            }

            for group in &plan.analysts {
                let status = match self.engine.merge_analyst(&group.symbol, &group.members) {
                    Ok(snapshot) => status_of(self.store.upsert_analyst(&snapshot).await?),
                    Err(reason) => SubmitStatus::Rejected { reason },
                };
                report.outcomes.push(KeyOutcome {
                    key: group.symbol.clone(),
                    status,
                });
            }

            report.outcomes.extend(plan.rejected);
            info!(
                created = report.created(),
                updated = report.updated(),
                rejected = report.rejected(),
                review = report.review_keys.len(),
                "submit complete"
            );
            Ok::<_, CacheError>(report)
        }
        .instrument(span)
        .await
    }

    /// The stored event a cluster lands on. An exact key match wins.
    /// Otherwise the nearest unclaimed event of the symbol within the date
    /// window is used, provided no other cluster of this submit is nearer to
    /// it. A more trusted cluster moves that event to its own date; a less
    /// trusted one folds into the stored date.
    async fn resolve_event(
        &self,
        cluster: &EarningsCluster,
        siblings: &[NaiveDate],
        claimed: &BTreeSet<EarningsKey>,
    ) -> Result<(EarningsKey, Landing), CacheError> {
        let key = cluster.key();
        if let Some(existing) = self.store.get(&key).await? {
            return Ok((key, Landing::Exact(existing)));
        }
        let window = self.engine.config().date_window;
        let proposed = key.earnings_date;
        let start = proposed.checked_sub_signed(window).unwrap_or(NaiveDate::MIN);
        let end = proposed.checked_add_signed(window).unwrap_or(NaiveDate::MAX);
        let nearest = self
            .store
            .list_range(start, end)
            .await?
            .into_iter()
            .filter(|record| record.symbol == key.symbol && !claimed.contains(&record.key()))
            .filter(|record| {
                let own = days_apart(record.earnings_date, proposed);
                siblings
                    .iter()
                    .filter(|date| **date != proposed)
                    .all(|date| days_apart(record.earnings_date, *date) >= own)
            })
            .min_by_key(|record| {
                (
                    days_apart(record.earnings_date, proposed),
                    Reverse(record.source_tier),
                    record.earnings_date,
                )
            });

        Ok(match nearest {
            Some(existing) if cluster.best_tier() > existing.source_tier => {
                info!(from = %existing.key(), to = %key, "stored event moved to more trusted date");
                (key, Landing::Moved(existing))
            }
            Some(existing) => {
                info!(proposed = %key, stored = %existing.key(), "candidate date folded into stored event");
                (existing.key(), Landing::Folded(existing))
            }
            None => (key, Landing::Fresh),
        })
    }

    /// Every stored event for one symbol, oldest first.
    pub async fn get_symbol_earnings(
        &self,
        symbol: &str,
    ) -> Result<Vec<Annotated<EarningsRecord>>, CacheError> {
        let now = Utc::now();
        Ok(self
            .store
            .list_symbol(symbol)
            .await?
            .into_iter()
            .map(|record| self.annotate_earnings(record, now))
            .collect())
    }

    pub async fn stats(&self) -> Result<StoreStats, CacheError> {
        Ok(self.store.stats().await?)
    }

    /// Drop earnings past the retention horizon (by date) and analyst
    /// snapshots not refreshed within theirs.
    pub async fn sweep_expired(&self, as_of: DateTime<Utc>) -> Result<SweepReport, CacheError> {
        let _gate = self.submit_gate.lock().await;
        let earnings_removed = self
            .store
            .delete_expired(as_of.date_naive(), self.policy.earnings_retention)
            .await?;
        let analyst_cutoff = as_of
            .checked_sub_signed(self.policy.analyst_retention)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let analysts_removed = self.store.delete_analyst_older_than(analyst_cutoff).await?;
        let report = SweepReport {
            as_of,
            earnings_removed,
            analysts_removed,
        };
        info!(?report, "sweep complete");
        Ok(report)
    }

    pub async fn export(&self) -> Result<StoreSnapshot, CacheError> {
        Ok(self.store.export_all().await?)
    }

    pub async fn export_to_archive(
        &self,
        archive: &SnapshotArchive,
    ) -> Result<ArchivedSnapshot, CacheError> {
        let snapshot = self.export().await?;
        archive
            .store_snapshot(&snapshot)
            .await
            .map_err(CacheError::Archive)
    }

    pub async fn import(&self, snapshot: &StoreSnapshot) -> Result<ImportSummary, CacheError> {
        if snapshot.schema_version != SCHEMA_VERSION {
            return Err(CacheError::SchemaMismatch {
                found: snapshot.schema_version.to_string(),
                expected: SCHEMA_VERSION,
            });
        }
        let _gate = self.submit_gate.lock().await;
        Ok(self.store.import_all(snapshot).await?)
    }

    /// Checks the version tag before decoding records, so a snapshot from an
    /// incompatible layout is refused without being interpreted.
    pub async fn import_json(&self, bytes: &[u8]) -> Result<ImportSummary, CacheError> {
        #[derive(Deserialize)]
        struct VersionHeader {
            schema_version: Option<serde_json::Value>,
        }

        let header: VersionHeader = serde_json::from_slice(bytes)?;
        match header.schema_version {
            Some(serde_json::Value::Number(n)) if n.as_u64() == Some(u64::from(SCHEMA_VERSION)) => {}
            other => {
                return Err(CacheError::SchemaMismatch {
                    found: other.map_or_else(|| "none".to_string(), |v| v.to_string()),
                    expected: SCHEMA_VERSION,
                })
            }
        }
        let snapshot: StoreSnapshot = serde_json::from_slice(bytes)?;
        self.import(&snapshot).await
    }

    pub async fn close(&self) {
        self.store.close().await;
        info!("cache service closed");
    }
}

/// Where a cluster's merged record is written.
enum Landing {
    Exact(EarningsRecord),
    Folded(EarningsRecord),
    /// The stored record is re-keyed to the cluster's date.
    Moved(EarningsRecord),
    Fresh,
}

fn days_apart(a: NaiveDate, b: NaiveDate) -> u64 {
    a.signed_duration_since(b).num_days().unsigned_abs()
}

fn status_of(outcome: UpsertOutcome) -> SubmitStatus {
    match outcome {
        UpsertOutcome::Created => SubmitStatus::Created,
        UpsertOutcome::Updated => SubmitStatus::Updated,
    }
}

/// First and last day of a calendar month.
pub fn month_bounds(year: i32, month: u32) -> Result<(NaiveDate, NaiveDate), CacheError> {
    let invalid = || CacheError::InvalidMonth { year, month };
    let start = NaiveDate::from_ymd_opt(year, month, 1).ok_or_else(invalid)?;
    let end = start
        .checked_add_months(Months::new(1))
        .and_then(|next| next.pred_opt())
        .ok_or_else(invalid)?;
    Ok((start, end))
}
