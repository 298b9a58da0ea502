//! Candidate producer contracts + network-free producer implementations.
//!
//! Every upstream (filings, data platforms, news, heuristics) is modelled as a
//! [`CandidateProducer`] emitting [`SourceCandidate`]s into the single
//! ingestion interface of the cache service.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Datelike, Days, NaiveDate, Utc};
use ecal_core::{
    AnalystDraft, EarningsDraft, EarningsRecord, EarningsTime, Recommendation, SourceCandidate,
    TrustTier,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

pub const SAMPLE_SOURCE: &str = "sample_generator";
pub const PROJECTION_SOURCE: &str = "quarterly_projection";

/// Typical spacing between two quarterly reports of the same issuer.
pub const QUARTER_CADENCE_DAYS: u64 = 91;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProducerContext {
    pub run_id: Uuid,
    pub retrieved_at: DateTime<Utc>,
}

impl ProducerContext {
    pub fn now() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            retrieved_at: Utc::now(),
        }
    }

    pub fn at(retrieved_at: DateTime<Utc>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            retrieved_at,
        }
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

#[async_trait]
pub trait CandidateProducer: Send + Sync {
    fn source_id(&self) -> &str;
    fn tier(&self) -> TrustTier;

    async fn produce(&self, ctx: &ProducerContext) -> Result<Vec<SourceCandidate>, AdapterError>;
}

/// On-disk candidate batch written by an external fetcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateBundle {
    pub source: String,
    pub tier: TrustTier,
    pub retrieved_at: DateTime<Utc>,
    #[serde(default)]
    pub earnings: Vec<EarningsDraft>,
    #[serde(default)]
    pub analysts: Vec<AnalystDraft>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl CandidateBundle {
    pub fn into_candidates(self) -> Vec<SourceCandidate> {
        let Self {
            source,
            tier,
            retrieved_at,
            earnings,
            analysts,
            ..
        } = self;
        earnings
            .into_iter()
            .map(|draft| SourceCandidate::earnings(source.clone(), tier, retrieved_at, draft))
            .chain(
                analysts
                    .into_iter()
                    .map(|draft| SourceCandidate::analyst(source.clone(), tier, retrieved_at, draft)),
            )
            .collect()
    }
}

pub fn load_candidate_bundle(path: impl AsRef<Path>) -> Result<CandidateBundle> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let bundle: CandidateBundle =
        serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))?;
    if bundle.source.trim().is_empty() {
        anyhow::bail!("bundle {} has an empty source tag", path.display());
    }
    Ok(bundle)
}

/// Replays a bundle file. The bundle header decides source and tier.
#[derive(Debug, Clone)]
pub struct BundleProducer {
    path: PathBuf,
    source: String,
    tier: TrustTier,
}

impl BundleProducer {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let bundle = load_candidate_bundle(&path)?;
        Ok(Self {
            path,
            source: bundle.source,
            tier: bundle.tier,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl CandidateProducer for BundleProducer {
    fn source_id(&self) -> &str {
        &self.source
    }

    fn tier(&self) -> TrustTier {
        self.tier
    }

    async fn produce(&self, ctx: &ProducerContext) -> Result<Vec<SourceCandidate>, AdapterError> {
        let bundle = load_candidate_bundle(&self.path)?;
        let candidates = bundle.into_candidates();
        info!(
            run_id = %ctx.run_id,
            source = %self.source,
            path = %self.path.display(),
            count = candidates.len(),
            "bundle replayed"
        );
        Ok(candidates)
    }
}

fn company_name(symbol: &str) -> String {
    match symbol {
        "AAPL" => "Apple Inc.",
        "MSFT" => "Microsoft Corp.",
        "GOOGL" => "Alphabet Inc.",
        "AMZN" => "Amazon.com Inc.",
        "META" => "Meta Platforms Inc.",
        "TSLA" => "Tesla Inc.",
        "NVDA" => "NVIDIA Corp.",
        "NFLX" => "Netflix Inc.",
        "AMD" => "Advanced Micro Devices",
        "INTC" => "Intel Corp.",
        "ORCL" => "Oracle Corp.",
        "CRM" => "Salesforce Inc.",
        other => return format!("{other} Corp."),
    }
    .to_string()
}

pub fn quarter_label(date: NaiveDate) -> String {
    format!("Q{} {}", date.month0() / 3 + 1, date.year())
}

/// Deterministic demo data anchored on the context date: five reported
/// events in the last two weeks, seven upcoming ones and an analyst view per
/// symbol. Backs the mock server variant.
#[derive(Debug, Clone, Default)]
pub struct SampleProducer;

impl SampleProducer {
    pub const REPORTED: [&'static str; 5] = ["AAPL", "MSFT", "GOOGL", "AMZN", "META"];
    pub const UPCOMING: [&'static str; 7] = ["TSLA", "NVDA", "NFLX", "AMD", "INTC", "ORCL", "CRM"];

    pub fn earnings_drafts(anchor: NaiveDate) -> Vec<EarningsDraft> {
        let mut drafts = Vec::new();
        for (i, symbol) in Self::REPORTED.iter().enumerate() {
            let step = i as f64;
            let date = anchor - Days::new(15 - 3 * i as u64);
            let eps_estimate = 1.5 + 0.6 * step;
            let revenue_estimate = (400.0 + 150.0 * step) * 1e8;
            drafts.push(EarningsDraft {
                symbol: Some(symbol.to_string()),
                earnings_date: Some(date),
                company_name: Some(company_name(symbol)),
                earnings_time: Some(if i % 2 == 0 {
                    EarningsTime::AfterMarket
                } else {
                    EarningsTime::BeforeMarket
                }),
                fiscal_quarter: Some(quarter_label(date)),
                fiscal_year: Some(date.year()),
                eps_estimate: Some(eps_estimate),
                eps_actual: Some(eps_estimate + if i % 3 == 0 { -0.08 } else { 0.12 }),
                revenue_estimate: Some(revenue_estimate),
                revenue_actual: Some(revenue_estimate * 1.02),
            });
        }
        for (i, symbol) in Self::UPCOMING.iter().enumerate() {
            let date = anchor + Days::new(5 + 7 * i as u64);
            drafts.push(EarningsDraft {
                symbol: Some(symbol.to_string()),
                earnings_date: Some(date),
                company_name: Some(company_name(symbol)),
                earnings_time: Some(EarningsTime::AfterMarket),
                fiscal_quarter: Some(quarter_label(date)),
                fiscal_year: Some(date.year()),
                eps_estimate: Some(0.8 + 0.45 * i as f64),
                revenue_estimate: Some((300.0 + 90.0 * i as f64) * 1e8),
                ..EarningsDraft::default()
            });
        }
        drafts
    }

    pub fn analyst_drafts() -> Vec<AnalystDraft> {
        Self::REPORTED
            .iter()
            .chain(Self::UPCOMING.iter())
            .enumerate()
            .map(|(i, symbol)| {
                let price = 80.0 + 35.0 * i as f64;
                AnalystDraft {
                    symbol: Some(symbol.to_string()),
                    current_price: Some(price),
                    target_mean: Some(price * 1.12),
                    target_high: Some(price * 1.35),
                    target_low: Some(price * 0.85),
                    recommendation: Some(match i % 3 {
                        0 => Recommendation::Buy,
                        1 => Recommendation::Hold,
                        _ => Recommendation::StrongBuy,
                    }),
                    analyst_count: Some(8 + 2 * i as u32),
                }
            })
            .collect()
    }
}

#[async_trait]
impl CandidateProducer for SampleProducer {
    fn source_id(&self) -> &str {
        SAMPLE_SOURCE
    }

    fn tier(&self) -> TrustTier {
        TrustTier::HeuristicEstimate
    }

    async fn produce(&self, ctx: &ProducerContext) -> Result<Vec<SourceCandidate>, AdapterError> {
        let bundle = CandidateBundle {
            source: SAMPLE_SOURCE.to_string(),
            tier: self.tier(),
            retrieved_at: ctx.retrieved_at,
            earnings: Self::earnings_drafts(ctx.retrieved_at.date_naive()),
            analysts: Self::analyst_drafts(),
            notes: None,
        };
        Ok(bundle.into_candidates())
    }
}

/// Projects the next report dates of symbols whose last known event is
/// already reported, one quarter apart, up to `through`.
#[derive(Debug, Clone)]
pub struct QuarterlyProjectionProducer {
    history: Vec<EarningsRecord>,
    through: NaiveDate,
}

impl QuarterlyProjectionProducer {
    pub fn new(history: Vec<EarningsRecord>, through: NaiveDate) -> Self {
        Self { history, through }
    }

    fn project(&self, today: NaiveDate) -> Vec<EarningsDraft> {
        let mut latest: BTreeMap<&str, &EarningsRecord> = BTreeMap::new();
        for record in &self.history {
            latest
                .entry(record.symbol.as_str())
                .and_modify(|current| {
                    if record.earnings_date > current.earnings_date {
                        *current = record;
                    }
                })
                .or_insert(record);
        }

        let cadence = Days::new(QUARTER_CADENCE_DAYS);
        let mut drafts = Vec::new();
        for (symbol, last) in latest {
            if !last.is_reported() {
                debug!(symbol, date = %last.earnings_date, "next event already known");
                continue;
            }
            let mut next = last.earnings_date + cadence;
            while next < today {
                next = next + cadence;
            }
            while next <= self.through {
                drafts.push(EarningsDraft {
                    symbol: Some(symbol.to_string()),
                    earnings_date: Some(next),
                    company_name: last.company_name.value.clone(),
                    earnings_time: last.earnings_time.value,
                    fiscal_quarter: Some(quarter_label(next)),
                    fiscal_year: Some(next.year()),
                    eps_estimate: last.eps_actual().or(last.eps_estimate.value),
                    revenue_estimate: last.revenue_actual().or(last.revenue_estimate.value),
                    ..EarningsDraft::default()
                });
                next = next + cadence;
            }
        }
        drafts
    }
}

#[async_trait]
impl CandidateProducer for QuarterlyProjectionProducer {
    fn source_id(&self) -> &str {
        PROJECTION_SOURCE
    }

    fn tier(&self) -> TrustTier {
        TrustTier::HeuristicEstimate
    }

    async fn produce(&self, ctx: &ProducerContext) -> Result<Vec<SourceCandidate>, AdapterError> {
        let drafts = self.project(ctx.retrieved_at.date_naive());
        info!(run_id = %ctx.run_id, projected = drafts.len(), through = %self.through, "quarterly projection");
        Ok(drafts
            .into_iter()
            .map(|draft| SourceCandidate::earnings(PROJECTION_SOURCE, self.tier(), ctx.retrieved_at, draft))
            .collect())
    }
}
