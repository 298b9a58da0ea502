//! Durable SQLite record store + snapshot archive for the earnings cache.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, SecondsFormat, TimeDelta, Utc};
use ecal_core::{
    AnalystSnapshot, EarningsKey, EarningsRecord, EarningsTime, Field, Provenance, Recommendation,
    ReportedActuals, TrustTier,
};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
    SqliteRow, SqliteSynchronous,
};
use sqlx::{Executor, Row, Sqlite};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, info_span, Instrument};

mod archive;

pub use archive::{ArchivedSnapshot, SnapshotArchive};

/// Version tag of both the database layout and the exported snapshot format.
pub const SCHEMA_VERSION: u32 = 1;

const SCHEMA: [&str; 6] = [
    "CREATE TABLE IF NOT EXISTS store_meta (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS earnings_events (
        symbol TEXT NOT NULL,
        earnings_date TEXT NOT NULL,
        company_name TEXT,
        earnings_time TEXT,
        fiscal_quarter TEXT,
        fiscal_year INTEGER,
        eps_estimate REAL,
        revenue_estimate REAL,
        eps_actual REAL,
        revenue_actual REAL,
        beat_estimate INTEGER,
        source TEXT NOT NULL,
        source_tier TEXT NOT NULL,
        needs_review INTEGER NOT NULL DEFAULT 0,
        provenance TEXT NOT NULL,
        last_updated TEXT NOT NULL,
        PRIMARY KEY (symbol, earnings_date),
        CHECK ((eps_actual IS NULL) = (revenue_actual IS NULL))
    )",
    "CREATE INDEX IF NOT EXISTS idx_earnings_date_symbol
        ON earnings_events (earnings_date, symbol)",
    "CREATE TABLE IF NOT EXISTS analyst_snapshots (
        symbol TEXT PRIMARY KEY,
        current_price REAL NOT NULL,
        target_mean REAL,
        target_high REAL,
        target_low REAL,
        recommendation TEXT NOT NULL,
        analyst_count INTEGER,
        source TEXT NOT NULL,
        source_tier TEXT NOT NULL,
        last_updated TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_analyst_last_updated
        ON analyst_snapshots (last_updated)",
    "INSERT OR IGNORE INTO store_meta (key, value) VALUES ('schema_version', '1')",
];

const EARNINGS_COLUMNS: &str = "symbol, earnings_date, company_name, earnings_time, fiscal_quarter, \
     fiscal_year, eps_estimate, revenue_estimate, eps_actual, revenue_actual, beat_estimate, \
     source, source_tier, needs_review, provenance, last_updated";

const ANALYST_COLUMNS: &str = "symbol, current_price, target_mean, target_high, target_low, \
     recommendation, analyst_count, source, source_tier, last_updated";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(#[from] sqlx::Error),
    #[error("store io: {0}")]
    Io(#[from] std::io::Error),
    #[error("encoding provenance: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("corrupt row {key}: {reason}")]
    CorruptRow { key: String, reason: String },
    #[error("database schema version {found} is not supported (expected {expected})")]
    IncompatibleDatabase { found: String, expected: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    Created,
    Updated,
}

/// Self-describing bulk export of the full store content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub schema_version: u32,
    pub exported_at: DateTime<Utc>,
    pub earnings: Vec<EarningsRecord>,
    pub analysts: Vec<AnalystSnapshot>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreStats {
    pub earnings_count: u64,
    pub analyst_count: u64,
    pub last_earnings_update: Option<DateTime<Utc>>,
    pub last_analyst_update: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportSummary {
    pub earnings_created: usize,
    pub earnings_updated: usize,
    pub analysts_created: usize,
    pub analysts_updated: usize,
}

/// Per-field provenance persisted next to the value columns.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
struct EarningsProvenance {
    #[serde(skip_serializing_if = "Option::is_none")]
    company_name: Option<Provenance>,
    #[serde(skip_serializing_if = "Option::is_none")]
    earnings_time: Option<Provenance>,
    #[serde(skip_serializing_if = "Option::is_none")]
    fiscal_quarter: Option<Provenance>,
    #[serde(skip_serializing_if = "Option::is_none")]
    fiscal_year: Option<Provenance>,
    #[serde(skip_serializing_if = "Option::is_none")]
    eps_estimate: Option<Provenance>,
    #[serde(skip_serializing_if = "Option::is_none")]
    revenue_estimate: Option<Provenance>,
    #[serde(skip_serializing_if = "Option::is_none")]
    actuals: Option<Provenance>,
}

impl EarningsProvenance {
    fn of(record: &EarningsRecord) -> Self {
        Self {
            company_name: record.company_name.provenance.clone(),
            earnings_time: record.earnings_time.provenance.clone(),
            fiscal_quarter: record.fiscal_quarter.provenance.clone(),
            fiscal_year: record.fiscal_year.provenance.clone(),
            eps_estimate: record.eps_estimate.provenance.clone(),
            revenue_estimate: record.revenue_estimate.provenance.clone(),
            actuals: record.actuals.as_ref().map(|a| a.provenance.clone()),
        }
    }
}

/// Keyed store for earnings events and analyst snapshots.
///
/// Reads go straight to the pool. Every mutation takes the write gate and
/// commits its own transaction before returning, so concurrent submissions
/// never interleave inside one logical upsert.
#[derive(Debug)]
pub struct RecordStore {
    pool: SqlitePool,
    write_gate: Mutex<()>,
}

impl RecordStore {
    /// Open (creating if needed) a file-backed store.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        info!(path = %path.display(), "opened record store");
        Self::with_pool(pool).await
    }

    /// Private in-memory store. One pinned connection keeps the database alive.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Self::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }
        let found: String =
            sqlx::query_scalar("SELECT value FROM store_meta WHERE key = 'schema_version'")
                .fetch_one(&pool)
                .await?;
        if found != SCHEMA_VERSION.to_string() {
            return Err(StoreError::IncompatibleDatabase {
                found,
                expected: SCHEMA_VERSION,
            });
        }
        Ok(Self {
            pool,
            write_gate: Mutex::new(()),
        })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Insert if absent; otherwise overwrite only the fields the incoming
    /// record specifies.
    pub async fn upsert(&self, record: &EarningsRecord) -> Result<UpsertOutcome, StoreError> {
        let span = info_span!("store_upsert", key = %record.key());
        async {
            let _gate = self.write_gate.lock().await;
            let mut tx = self.pool.begin().await?;
            let outcome = upsert_earnings_in(&mut tx, record).await?;
            tx.commit().await?;
            debug!(?outcome, "earnings row written");
            Ok::<_, StoreError>(outcome)
        }
        .instrument(span)
        .await
    }

    /// Move an event to the key of `record`: the row under `from` is removed
    /// and `record` upserted in one transaction.
    pub async fn rekey(
        &self,
        from: &EarningsKey,
        record: &EarningsRecord,
    ) -> Result<UpsertOutcome, StoreError> {
        let span = info_span!("store_rekey", from = %from, to = %record.key());
        async {
            let _gate = self.write_gate.lock().await;
            let mut tx = self.pool.begin().await?;
            let removed = sqlx::query(
                "DELETE FROM earnings_events WHERE symbol = ? AND earnings_date = ?",
            )
            .bind(from.symbol.as_str())
            .bind(date_text(from.earnings_date))
            .execute(&mut *tx)
            .await?
            .rows_affected();
            let written = upsert_earnings_in(&mut tx, record).await?;
            tx.commit().await?;
            let outcome = if removed > 0 {
                UpsertOutcome::Updated
            } else {
                written
            };
            debug!(?outcome, removed, "earnings row re-keyed");
            Ok::<_, StoreError>(outcome)
        }
        .instrument(span)
        .await
    }

    pub async fn get(&self, key: &EarningsKey) -> Result<Option<EarningsRecord>, StoreError> {
        fetch_earnings(&self.pool, key).await
    }

    /// Inclusive date range ordered by date, then symbol.
    pub async fn list_range(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<EarningsRecord>, StoreError> {
        let sql = format!(
            "SELECT {EARNINGS_COLUMNS} FROM earnings_events \
             WHERE earnings_date >= ? AND earnings_date <= ? \
             ORDER BY earnings_date, symbol"
        );
        let rows = sqlx::query(&sql)
            .bind(date_text(start))
            .bind(date_text(end))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(earnings_from_row).collect()
    }

    /// Every record for one symbol, oldest first.
    pub async fn list_symbol(&self, symbol: &str) -> Result<Vec<EarningsRecord>, StoreError> {
        let sql = format!(
            "SELECT {EARNINGS_COLUMNS} FROM earnings_events WHERE symbol = ? ORDER BY earnings_date"
        );
        let rows = sqlx::query(&sql)
            .bind(ecal_core::normalize_symbol(symbol))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(earnings_from_row).collect()
    }

    /// Remove earnings whose date is before `as_of - horizon`.
    pub async fn delete_expired(
        &self,
        as_of: NaiveDate,
        horizon: TimeDelta,
    ) -> Result<u64, StoreError> {
        let cutoff = as_of.checked_sub_signed(horizon).unwrap_or(NaiveDate::MIN);
        let _gate = self.write_gate.lock().await;
        let removed = sqlx::query("DELETE FROM earnings_events WHERE earnings_date < ?")
            .bind(date_text(cutoff))
            .execute(&self.pool)
            .await?
            .rows_affected();
        info!(%cutoff, removed, "expired earnings removed");
        Ok(removed)
    }

    /// Replace the stored snapshot for the symbol wholesale.
    pub async fn upsert_analyst(
        &self,
        snapshot: &AnalystSnapshot,
    ) -> Result<UpsertOutcome, StoreError> {
        let _gate = self.write_gate.lock().await;
        let mut tx = self.pool.begin().await?;
        let outcome = write_analyst(&mut tx, snapshot).await?;
        tx.commit().await?;
        debug!(symbol = %snapshot.symbol, ?outcome, "analyst row written");
        Ok(outcome)
    }

    pub async fn get_analyst(&self, symbol: &str) -> Result<Option<AnalystSnapshot>, StoreError> {
        fetch_analyst(&self.pool, &ecal_core::normalize_symbol(symbol)).await
    }

    pub async fn delete_analyst_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let _gate = self.write_gate.lock().await;
        let removed = sqlx::query("DELETE FROM analyst_snapshots WHERE last_updated < ?")
            .bind(timestamp_text(cutoff))
            .execute(&self.pool)
            .await?
            .rows_affected();
        info!(%cutoff, removed, "expired analyst snapshots removed");
        Ok(removed)
    }

    pub async fn stats(&self) -> Result<StoreStats, StoreError> {
        let (earnings_count, last_earnings_update) =
            table_stats(&self.pool, "earnings_events").await?;
        let (analyst_count, last_analyst_update) =
            table_stats(&self.pool, "analyst_snapshots").await?;
        Ok(StoreStats {
            earnings_count,
            analyst_count,
            last_earnings_update,
            last_analyst_update,
        })
    }

    pub async fn export_all(&self) -> Result<StoreSnapshot, StoreError> {
        let earnings_sql = format!(
            "SELECT {EARNINGS_COLUMNS} FROM earnings_events ORDER BY earnings_date, symbol"
        );
        let earnings = sqlx::query(&earnings_sql)
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(earnings_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        let analyst_sql = format!("SELECT {ANALYST_COLUMNS} FROM analyst_snapshots ORDER BY symbol");
        let analysts = sqlx::query(&analyst_sql)
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(analyst_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(StoreSnapshot {
            schema_version: SCHEMA_VERSION,
            exported_at: Utc::now(),
            earnings,
            analysts,
        })
    }

    /// Upsert every record of the snapshot inside one transaction.
    pub async fn import_all(&self, snapshot: &StoreSnapshot) -> Result<ImportSummary, StoreError> {
        let _gate = self.write_gate.lock().await;
        let mut tx = self.pool.begin().await?;
        let mut summary = ImportSummary::default();
        for record in &snapshot.earnings {
            match upsert_earnings_in(&mut tx, record).await? {
                UpsertOutcome::Created => summary.earnings_created += 1,
                UpsertOutcome::Updated => summary.earnings_updated += 1,
            }
        }
        for analyst in &snapshot.analysts {
            match write_analyst(&mut tx, analyst).await? {
                UpsertOutcome::Created => summary.analysts_created += 1,
                UpsertOutcome::Updated => summary.analysts_updated += 1,
            }
        }
        tx.commit().await?;
        info!(?summary, "snapshot imported");
        Ok(summary)
    }
}

/// Incoming fields that carry a value replace the stored ones; the rest are kept.
fn overlay(existing: EarningsRecord, incoming: &EarningsRecord) -> EarningsRecord {
    fn pick<T: Clone>(stored: Field<T>, incoming: &Field<T>) -> Field<T> {
        if incoming.is_set() {
            incoming.clone()
        } else {
            stored
        }
    }

    EarningsRecord {
        symbol: existing.symbol,
        earnings_date: existing.earnings_date,
        company_name: pick(existing.company_name, &incoming.company_name),
        earnings_time: pick(existing.earnings_time, &incoming.earnings_time),
        fiscal_quarter: pick(existing.fiscal_quarter, &incoming.fiscal_quarter),
        fiscal_year: pick(existing.fiscal_year, &incoming.fiscal_year),
        eps_estimate: pick(existing.eps_estimate, &incoming.eps_estimate),
        revenue_estimate: pick(existing.revenue_estimate, &incoming.revenue_estimate),
        actuals: incoming.actuals.clone().or(existing.actuals),
        source: incoming.source.clone(),
        source_tier: incoming.source_tier,
        needs_review: incoming.needs_review,
        last_updated: incoming.last_updated,
    }
}

async fn upsert_earnings_in(
    conn: &mut SqliteConnection,
    incoming: &EarningsRecord,
) -> Result<UpsertOutcome, StoreError> {
    let key = incoming.key();
    let (row, outcome) = match fetch_earnings(&mut *conn, &key).await? {
        Some(existing) => (overlay(existing, incoming), UpsertOutcome::Updated),
        None => {
            let mut fresh = incoming.clone();
            fresh.symbol = key.symbol.clone();
            (fresh, UpsertOutcome::Created)
        }
    };
    write_earnings(&mut *conn, &row).await?;
    Ok(outcome)
}

async fn write_earnings(
    conn: &mut SqliteConnection,
    record: &EarningsRecord,
) -> Result<(), StoreError> {
    let provenance = serde_json::to_string(&EarningsProvenance::of(record))?;
    let sql = format!(
        "INSERT INTO earnings_events ({EARNINGS_COLUMNS}) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT (symbol, earnings_date) DO UPDATE SET \
           company_name = excluded.company_name, \
           earnings_time = excluded.earnings_time, \
           fiscal_quarter = excluded.fiscal_quarter, \
           fiscal_year = excluded.fiscal_year, \
           eps_estimate = excluded.eps_estimate, \
           revenue_estimate = excluded.revenue_estimate, \
           eps_actual = excluded.eps_actual, \
           revenue_actual = excluded.revenue_actual, \
           beat_estimate = excluded.beat_estimate, \
           source = excluded.source, \
           source_tier = excluded.source_tier, \
           needs_review = excluded.needs_review, \
           provenance = excluded.provenance, \
           last_updated = excluded.last_updated"
    );
    sqlx::query(&sql)
        .bind(record.symbol.as_str())
        .bind(date_text(record.earnings_date))
        .bind(record.company_name.value.as_deref())
        .bind(record.earnings_time.value.map(|t| t.as_str()))
        .bind(record.fiscal_quarter.value.as_deref())
        .bind(record.fiscal_year.value.map(i64::from))
        .bind(record.eps_estimate.value)
        .bind(record.revenue_estimate.value)
        .bind(record.eps_actual())
        .bind(record.revenue_actual())
        .bind(record.beat_estimate())
        .bind(record.source.as_str())
        .bind(record.source_tier.as_str())
        .bind(record.needs_review)
        .bind(provenance)
        .bind(timestamp_text(record.last_updated))
        .execute(&mut *conn)
        .await?;
    Ok(())
}

async fn write_analyst(
    conn: &mut SqliteConnection,
    snapshot: &AnalystSnapshot,
) -> Result<UpsertOutcome, StoreError> {
    let symbol = ecal_core::normalize_symbol(&snapshot.symbol);
    let exists = sqlx::query("SELECT 1 FROM analyst_snapshots WHERE symbol = ?")
        .bind(symbol.as_str())
        .fetch_optional(&mut *conn)
        .await?
        .is_some();
    let sql = format!(
        "INSERT INTO analyst_snapshots ({ANALYST_COLUMNS}) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT (symbol) DO UPDATE SET \
           current_price = excluded.current_price, \
           target_mean = excluded.target_mean, \
           target_high = excluded.target_high, \
           target_low = excluded.target_low, \
           recommendation = excluded.recommendation, \
           analyst_count = excluded.analyst_count, \
           source = excluded.source, \
           source_tier = excluded.source_tier, \
           last_updated = excluded.last_updated"
    );
    sqlx::query(&sql)
        .bind(symbol.as_str())
        .bind(snapshot.current_price)
        .bind(snapshot.target_mean)
        .bind(snapshot.target_high)
        .bind(snapshot.target_low)
        .bind(snapshot.recommendation.as_str())
        .bind(snapshot.analyst_count.map(i64::from))
        .bind(snapshot.source.as_str())
        .bind(snapshot.source_tier.as_str())
        .bind(timestamp_text(snapshot.last_updated))
        .execute(&mut *conn)
        .await?;
    Ok(if exists {
        UpsertOutcome::Updated
    } else {
        UpsertOutcome::Created
    })
}

async fn fetch_earnings<'e, E>(
    executor: E,
    key: &EarningsKey,
) -> Result<Option<EarningsRecord>, StoreError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let sql = format!(
        "SELECT {EARNINGS_COLUMNS} FROM earnings_events WHERE symbol = ? AND earnings_date = ?"
    );
    let row = sqlx::query(&sql)
        .bind(key.symbol.as_str())
        .bind(date_text(key.earnings_date))
        .fetch_optional(executor)
        .await?;
    row.as_ref().map(earnings_from_row).transpose()
}

async fn fetch_analyst<'e, E>(executor: E, symbol: &str) -> Result<Option<AnalystSnapshot>, StoreError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let sql = format!("SELECT {ANALYST_COLUMNS} FROM analyst_snapshots WHERE symbol = ?");
    let row = sqlx::query(&sql)
        .bind(symbol)
        .fetch_optional(executor)
        .await?;
    row.as_ref().map(analyst_from_row).transpose()
}

async fn table_stats(
    pool: &SqlitePool,
    table: &str,
) -> Result<(u64, Option<DateTime<Utc>>), StoreError> {
    let row = sqlx::query(&format!(
        "SELECT COUNT(*) AS n, MAX(last_updated) AS latest FROM {table}"
    ))
    .fetch_one(pool)
    .await?;
    let count: i64 = row.try_get("n")?;
    let latest: Option<String> = row.try_get("latest")?;
    let latest = latest
        .map(|text| parse_timestamp(table, &text))
        .transpose()?;
    Ok((count.max(0) as u64, latest))
}

fn earnings_from_row(row: &SqliteRow) -> Result<EarningsRecord, StoreError> {
    let symbol: String = row.try_get("symbol")?;
    let date_raw: String = row.try_get("earnings_date")?;
    let label = format!("{symbol}@{date_raw}");
    let earnings_date = NaiveDate::parse_from_str(&date_raw, "%Y-%m-%d")
        .map_err(|err| corrupt(&label, err))?;

    let provenance_raw: String = row.try_get("provenance")?;
    let provenance: EarningsProvenance =
        serde_json::from_str(&provenance_raw).map_err(|err| corrupt(&label, err))?;

    let eps_actual: Option<f64> = row.try_get("eps_actual")?;
    let revenue_actual: Option<f64> = row.try_get("revenue_actual")?;
    let beat_estimate: Option<bool> = row.try_get("beat_estimate")?;
    let actuals = match (eps_actual, revenue_actual, provenance.actuals) {
        (Some(eps_actual), Some(revenue_actual), Some(provenance)) => Some(ReportedActuals {
            eps_actual,
            revenue_actual,
            beat_estimate,
            provenance,
        }),
        (None, None, _) => None,
        _ => return Err(corrupt(&label, "partial or unattributed actuals")),
    };

    let earnings_time: Option<String> = row.try_get("earnings_time")?;
    let fiscal_year: Option<i64> = row.try_get("fiscal_year")?;
    let fiscal_year = fiscal_year
        .map(i32::try_from)
        .transpose()
        .map_err(|err| corrupt(&label, err))?;
    let tier_raw: String = row.try_get("source_tier")?;
    let source_tier = TrustTier::from_str(&tier_raw).map_err(|err| corrupt(&label, err))?;
    let last_updated: String = row.try_get("last_updated")?;

    Ok(EarningsRecord {
        company_name: field(row.try_get("company_name")?, provenance.company_name),
        earnings_time: field(
            earnings_time.map(|t| EarningsTime::from_label(&t)),
            provenance.earnings_time,
        ),
        fiscal_quarter: field(row.try_get("fiscal_quarter")?, provenance.fiscal_quarter),
        fiscal_year: field(fiscal_year, provenance.fiscal_year),
        eps_estimate: field(row.try_get("eps_estimate")?, provenance.eps_estimate),
        revenue_estimate: field(row.try_get("revenue_estimate")?, provenance.revenue_estimate),
        actuals,
        source: row.try_get("source")?,
        source_tier,
        needs_review: row.try_get("needs_review")?,
        last_updated: parse_timestamp(&label, &last_updated)?,
        symbol,
        earnings_date,
    })
}

fn analyst_from_row(row: &SqliteRow) -> Result<AnalystSnapshot, StoreError> {
    let symbol: String = row.try_get("symbol")?;
    let tier_raw: String = row.try_get("source_tier")?;
    let source_tier = TrustTier::from_str(&tier_raw).map_err(|err| corrupt(&symbol, err))?;
    let recommendation: String = row.try_get("recommendation")?;
    let analyst_count: Option<i64> = row.try_get("analyst_count")?;
    let analyst_count = analyst_count
        .map(u32::try_from)
        .transpose()
        .map_err(|err| corrupt(&symbol, err))?;
    let last_updated: String = row.try_get("last_updated")?;
    Ok(AnalystSnapshot {
        current_price: row.try_get("current_price")?,
        target_mean: row.try_get("target_mean")?,
        target_high: row.try_get("target_high")?,
        target_low: row.try_get("target_low")?,
        recommendation: Recommendation::from_key(&recommendation),
        analyst_count,
        source: row.try_get("source")?,
        source_tier,
        last_updated: parse_timestamp(&symbol, &last_updated)?,
        symbol,
    })
}

fn field<T>(value: Option<T>, provenance: Option<Provenance>) -> Field<T> {
    match value {
        Some(value) => Field {
            value: Some(value),
            provenance,
        },
        None => Field::empty(),
    }
}

fn corrupt(key: &str, reason: impl std::fmt::Display) -> StoreError {
    StoreError::CorruptRow {
        key: key.to_string(),
        reason: reason.to_string(),
    }
}

fn date_text(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

/// Fixed-width UTC text so lexicographic order matches time order.
fn timestamp_text(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_timestamp(key: &str, text: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(text)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|err| corrupt(key, err))
}
