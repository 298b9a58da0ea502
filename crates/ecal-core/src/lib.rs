//! Core domain model and provenance types for the earnings calendar cache.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Priority rank of a data origin. Declaration order is the trust order,
/// lowest first, so the derived `Ord` can be used directly for selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustTier {
    HeuristicEstimate,
    NewsSource,
    ProfessionalDataPlatform,
    OfficialFiling,
}

impl TrustTier {
    pub const ALL: [TrustTier; 4] = [
        TrustTier::OfficialFiling,
        TrustTier::ProfessionalDataPlatform,
        TrustTier::NewsSource,
        TrustTier::HeuristicEstimate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TrustTier::HeuristicEstimate => "heuristic_estimate",
            TrustTier::NewsSource => "news_source",
            TrustTier::ProfessionalDataPlatform => "professional_data_platform",
            TrustTier::OfficialFiling => "official_filing",
        }
    }
}

impl fmt::Display for TrustTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TrustTier {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TrustTier::ALL
            .into_iter()
            .find(|tier| tier.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ParseEnumError {
                kind: "trust tier",
                input: s.to_string(),
            })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind}: {input:?}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub input: String,
}

/// Provenance pointer attached to every stored field value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub source: String,
    pub tier: TrustTier,
    pub retrieved_at: DateTime<Utc>,
}

impl Provenance {
    pub fn new(source: impl Into<String>, tier: TrustTier, retrieved_at: DateTime<Utc>) -> Self {
        Self {
            source: source.into(),
            tier,
            retrieved_at,
        }
    }

    /// Higher tier wins; within a tier the more recent retrieval wins.
    pub fn outranks(&self, other: &Provenance) -> bool {
        (self.tier, self.retrieved_at) > (other.tier, other.retrieved_at)
    }
}

/// Field wrapper with optional value + provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field<T> {
    pub value: Option<T>,
    pub provenance: Option<Provenance>,
}

impl<T> Default for Field<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T> Field<T> {
    pub fn empty() -> Self {
        Self {
            value: None,
            provenance: None,
        }
    }

    pub fn with_value_and_provenance(value: T, provenance: Provenance) -> Self {
        Self {
            value: Some(value),
            provenance: Some(provenance),
        }
    }

    pub fn is_set(&self) -> bool {
        self.value.is_some()
    }

    pub fn value(&self) -> Option<&T> {
        self.value.as_ref()
    }
}

pub fn normalize_symbol(input: &str) -> String {
    input.trim().to_ascii_uppercase()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EarningsTime {
    #[serde(alias = "bmo", alias = "BMO")]
    BeforeMarket,
    #[serde(alias = "amc", alias = "AMC")]
    AfterMarket,
    Unknown,
}

impl EarningsTime {
    pub fn as_str(&self) -> &'static str {
        match self {
            EarningsTime::BeforeMarket => "before_market",
            EarningsTime::AfterMarket => "after_market",
            EarningsTime::Unknown => "unknown",
        }
    }

    /// Lenient parse for stored and scraped labels; never fails.
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "before_market" | "bmo" | "before market open" | "pre-market" => {
                EarningsTime::BeforeMarket
            }
            "after_market" | "amc" | "after market close" | "post-market" => {
                EarningsTime::AfterMarket
            }
            _ => EarningsTime::Unknown,
        }
    }
}

/// Analyst consensus. Serialized as a snake_case key; unknown keys decode as `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Recommendation {
    StrongBuy,
    Buy,
    Hold,
    Sell,
    StrongSell,
    Unknown,
}

impl Recommendation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Recommendation::StrongBuy => "strong_buy",
            Recommendation::Buy => "buy",
            Recommendation::Hold => "hold",
            Recommendation::Sell => "sell",
            Recommendation::StrongSell => "strong_sell",
            Recommendation::Unknown => "unknown",
        }
    }

    /// Accepts the key spellings used by data platforms (`strongBuy`,
    /// `strong_buy`, `underperform`, ...).
    pub fn from_key(key: &str) -> Self {
        let normalized = key
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();
        match normalized.as_str() {
            "strongbuy" => Recommendation::StrongBuy,
            "buy" | "outperform" | "overweight" => Recommendation::Buy,
            "hold" | "neutral" => Recommendation::Hold,
            "sell" | "underperform" | "underweight" => Recommendation::Sell,
            "strongsell" => Recommendation::StrongSell,
            _ => Recommendation::Unknown,
        }
    }
}

impl From<String> for Recommendation {
    fn from(value: String) -> Self {
        Recommendation::from_key(&value)
    }
}

impl From<Recommendation> for String {
    fn from(value: Recommendation) -> Self {
        value.as_str().to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EarningsKey {
    pub symbol: String,
    pub earnings_date: NaiveDate,
}

impl EarningsKey {
    pub fn new(symbol: &str, earnings_date: NaiveDate) -> Self {
        Self {
            symbol: normalize_symbol(symbol),
            earnings_date,
        }
    }
}

impl fmt::Display for EarningsKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.symbol, self.earnings_date)
    }
}

/// Reported results. Both values are present or the whole struct is absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportedActuals {
    pub eps_actual: f64,
    pub revenue_actual: f64,
    /// `eps_actual > eps_estimate`. `None` while no estimate is known;
    /// once set it never changes, even if the estimate is later revised.
    pub beat_estimate: Option<bool>,
    pub provenance: Provenance,
}

impl ReportedActuals {
    pub fn assemble(
        eps_actual: f64,
        revenue_actual: f64,
        eps_estimate: Option<f64>,
        provenance: Provenance,
    ) -> Self {
        Self {
            eps_actual,
            revenue_actual,
            beat_estimate: eps_estimate.map(|estimate| eps_actual > estimate),
            provenance,
        }
    }

    /// Fill a pending beat flag from the first estimate that becomes known.
    pub fn settle_beat(&mut self, eps_estimate: Option<f64>) {
        if self.beat_estimate.is_none() {
            self.beat_estimate = eps_estimate.map(|estimate| self.eps_actual > estimate);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EarningsState {
    Future,
    Reported,
}

/// Canonical persisted earnings event with provenance-bearing fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EarningsRecord {
    pub symbol: String,
    pub earnings_date: NaiveDate,
    pub company_name: Field<String>,
    pub earnings_time: Field<EarningsTime>,
    pub fiscal_quarter: Field<String>,
    pub fiscal_year: Field<i32>,
    pub eps_estimate: Field<f64>,
    pub revenue_estimate: Field<f64>,
    pub actuals: Option<ReportedActuals>,
    pub source: String,
    pub source_tier: TrustTier,
    pub needs_review: bool,
    pub last_updated: DateTime<Utc>,
}

impl EarningsRecord {
    pub fn key(&self) -> EarningsKey {
        EarningsKey::new(&self.symbol, self.earnings_date)
    }

    pub fn state(&self) -> EarningsState {
        if self.actuals.is_some() {
            EarningsState::Reported
        } else {
            EarningsState::Future
        }
    }

    pub fn is_reported(&self) -> bool {
        self.state() == EarningsState::Reported
    }

    pub fn eps_actual(&self) -> Option<f64> {
        self.actuals.as_ref().map(|a| a.eps_actual)
    }

    pub fn revenue_actual(&self) -> Option<f64> {
        self.actuals.as_ref().map(|a| a.revenue_actual)
    }

    pub fn beat_estimate(&self) -> Option<bool> {
        self.actuals.as_ref().and_then(|a| a.beat_estimate)
    }
}

/// Current analyst view for one symbol. Replaced wholesale on refresh.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalystSnapshot {
    pub symbol: String,
    pub current_price: f64,
    pub target_mean: Option<f64>,
    pub target_high: Option<f64>,
    pub target_low: Option<f64>,
    pub recommendation: Recommendation,
    pub analyst_count: Option<u32>,
    pub source: String,
    pub source_tier: TrustTier,
    pub last_updated: DateTime<Utc>,
}

impl AnalystSnapshot {
    /// `target_low <= target_mean <= target_high` for whichever bounds are present.
    pub fn targets_consistent(&self) -> bool {
        let ordered = |lo: Option<f64>, hi: Option<f64>| match (lo, hi) {
            (Some(lo), Some(hi)) => lo <= hi,
            _ => true,
        };
        ordered(self.target_low, self.target_mean)
            && ordered(self.target_mean, self.target_high)
            && ordered(self.target_low, self.target_high)
    }
}

/// Partial earnings proposal as emitted by a producer. Every field may be absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EarningsDraft {
    pub symbol: Option<String>,
    pub earnings_date: Option<NaiveDate>,
    pub company_name: Option<String>,
    pub earnings_time: Option<EarningsTime>,
    pub fiscal_quarter: Option<String>,
    pub fiscal_year: Option<i32>,
    pub eps_estimate: Option<f64>,
    pub eps_actual: Option<f64>,
    pub revenue_estimate: Option<f64>,
    pub revenue_actual: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalystDraft {
    pub symbol: Option<String>,
    pub current_price: Option<f64>,
    pub target_mean: Option<f64>,
    pub target_high: Option<f64>,
    pub target_low: Option<f64>,
    pub recommendation: Option<Recommendation>,
    pub analyst_count: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CandidatePayload {
    Earnings(EarningsDraft),
    Analyst(AnalystDraft),
}

/// Parsed/pre-normalized handoff contract from producers into the merge engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceCandidate {
    pub source: String,
    pub tier: TrustTier,
    pub retrieved_at: DateTime<Utc>,
    pub payload: CandidatePayload,
}

impl SourceCandidate {
    pub fn earnings(
        source: impl Into<String>,
        tier: TrustTier,
        retrieved_at: DateTime<Utc>,
        draft: EarningsDraft,
    ) -> Self {
        Self {
            source: source.into(),
            tier,
            retrieved_at,
            payload: CandidatePayload::Earnings(draft),
        }
    }

    pub fn analyst(
        source: impl Into<String>,
        tier: TrustTier,
        retrieved_at: DateTime<Utc>,
        draft: AnalystDraft,
    ) -> Self {
        Self {
            source: source.into(),
            tier,
            retrieved_at,
            payload: CandidatePayload::Analyst(draft),
        }
    }

    pub fn provenance(&self) -> Provenance {
        Provenance::new(self.source.clone(), self.tier, self.retrieved_at)
    }

    /// Normalized symbol, `None` when absent or blank.
    pub fn symbol(&self) -> Option<String> {
        let raw = match &self.payload {
            CandidatePayload::Earnings(draft) => draft.symbol.as_deref(),
            CandidatePayload::Analyst(draft) => draft.symbol.as_deref(),
        }?;
        let symbol = normalize_symbol(raw);
        if symbol.is_empty() {
            None
        } else {
            Some(symbol)
        }
    }
}

/// Why a key's candidate set was rejected. Reported per key, never thrown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RejectReason {
    #[error("incomplete candidate: no candidate supplies {field}")]
    IncompleteCandidate { field: String },
    #[error("analyst targets are not ordered low <= mean <= high")]
    InconsistentTargets,
    #[error("analyst snapshot has no current price")]
    MissingPrice,
}

impl RejectReason {
    pub fn incomplete(field: &str) -> Self {
        RejectReason::IncompleteCandidate {
            field: field.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SubmitStatus {
    Created,
    Updated,
    Rejected { reason: RejectReason },
}

/// Outcome for one logical key of a `submit` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyOutcome {
    pub key: String,
    #[serde(flatten)]
    pub status: SubmitStatus,
}

/// Read-side wrapper: the stored value plus its freshness verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotated<T> {
    #[serde(flatten)]
    pub record: T,
    pub is_stale: bool,
}
