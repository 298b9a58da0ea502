//! Trust-ordered, per-field reconciliation of source candidates.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, TimeDelta, Utc};
use ecal_core::{
    AnalystDraft, AnalystSnapshot, CandidatePayload, EarningsDraft, EarningsKey, EarningsRecord,
    EarningsTime, Field, KeyOutcome, Provenance, Recommendation, RejectReason, ReportedActuals,
    SourceCandidate, SubmitStatus, TrustTier,
};
use serde::Serialize;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct MergeConfig {
    /// Relative spread above which same-tier EPS values count as disagreeing.
    pub eps_disagreement: f64,
    pub revenue_disagreement: f64,
    /// Dates further apart than this for one symbol are separate events.
    pub date_window: TimeDelta,
    /// Origin tag -> tier, applied before any selection.
    pub tier_overrides: BTreeMap<String, TrustTier>,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            eps_disagreement: 0.15,
            revenue_disagreement: 0.30,
            date_window: TimeDelta::days(7),
            tier_overrides: BTreeMap::new(),
        }
    }
}

/// Earnings candidates of one symbol that resolve to a single event.
#[derive(Debug, Clone, PartialEq)]
pub struct EarningsCluster {
    pub symbol: String,
    pub earnings_date: NaiveDate,
    pub members: Vec<SourceCandidate>,
}

impl EarningsCluster {
    pub fn key(&self) -> EarningsKey {
        EarningsKey::new(&self.symbol, self.earnings_date)
    }

    pub fn best_tier(&self) -> TrustTier {
        self.members
            .iter()
            .map(|c| c.tier)
            .max()
            .unwrap_or(TrustTier::HeuristicEstimate)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnalystGroup {
    pub symbol: String,
    pub members: Vec<SourceCandidate>,
}

/// Candidates routed to their logical keys, plus the ones that have no key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergePlan {
    pub earnings: Vec<EarningsCluster>,
    pub analysts: Vec<AnalystGroup>,
    pub rejected: Vec<KeyOutcome>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Disagreement {
    pub field: &'static str,
    pub tier: TrustTier,
    pub spread: f64,
    pub threshold: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergedEarnings {
    pub record: EarningsRecord,
    pub disagreements: Vec<Disagreement>,
    /// Some candidate carried only one of the two actual values.
    pub withheld_partial_actuals: bool,
}

pub struct MergeEngine {
    config: MergeConfig,
}

impl MergeEngine {
    pub fn new(config: MergeConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MergeConfig {
        &self.config
    }

    pub fn effective_tier(&self, candidate: &SourceCandidate) -> TrustTier {
        self.config
            .tier_overrides
            .get(&candidate.source)
            .copied()
            .unwrap_or(candidate.tier)
    }

    /// Route candidates to earnings clusters and analyst groups. Candidates
    /// without a usable key are rejected here and never reach the store.
    pub fn plan(&self, candidates: Vec<SourceCandidate>) -> MergePlan {
        let mut plan = MergePlan::default();
        let mut earnings: BTreeMap<String, Vec<SourceCandidate>> = BTreeMap::new();
        let mut analysts: BTreeMap<String, Vec<SourceCandidate>> = BTreeMap::new();

        for (index, mut candidate) in candidates.into_iter().enumerate() {
            candidate.tier = self.effective_tier(&candidate);
            let Some(symbol) = candidate.symbol() else {
                warn!(source = %candidate.source, index, "candidate without symbol rejected");
                plan.rejected.push(KeyOutcome {
                    key: format!("{}#{index}", candidate.source),
                    status: SubmitStatus::Rejected {
                        reason: RejectReason::incomplete("symbol"),
                    },
                });
                continue;
            };
            if matches!(candidate.payload, CandidatePayload::Earnings(_)) {
                earnings.entry(symbol).or_default().push(candidate);
            } else {
                analysts.entry(symbol).or_default().push(candidate);
            }
        }

        for (symbol, members) in earnings {
            let (clusters, rejected) = self.cluster(&symbol, members);
            plan.earnings.extend(clusters);
            plan.rejected.extend(rejected);
        }
        plan.analysts = analysts
            .into_iter()
            .map(|(symbol, members)| AnalystGroup { symbol, members })
            .collect();
        plan
    }

    /// Split one symbol's candidates into events. A new cluster starts when a
    /// date lies more than the window after the current cluster's first date.
    fn cluster(
        &self,
        symbol: &str,
        members: Vec<SourceCandidate>,
    ) -> (Vec<EarningsCluster>, Vec<KeyOutcome>) {
        let (mut dated, undated): (Vec<_>, Vec<_>) = members
            .into_iter()
            .partition(|c| draft_of(c).and_then(|d| d.earnings_date).is_some());
        dated.sort_by_key(|c| (draft_of(c).and_then(|d| d.earnings_date), c.retrieved_at));

        let mut groups: Vec<(NaiveDate, Vec<SourceCandidate>)> = Vec::new();
        for candidate in dated {
            let Some(date) = draft_of(&candidate).and_then(|d| d.earnings_date) else {
                continue;
            };
            match groups.last_mut() {
                Some((anchor, group)) if date.signed_duration_since(*anchor) <= self.config.date_window => {
                    group.push(candidate)
                }
                _ => groups.push((date, vec![candidate])),
            }
        }

        let mut rejected = Vec::new();
        for candidate in undated {
            let quarter = draft_of(&candidate).and_then(quarter_label);
            let target = quarter
                .and_then(|quarter| {
                    groups.iter().position(|(_, group)| {
                        group
                            .iter()
                            .any(|c| draft_of(c).and_then(quarter_label).as_ref() == Some(&quarter))
                    })
                })
                .or_else(|| (groups.len() == 1).then_some(0));
            match target {
                Some(index) => groups[index].1.push(candidate),
                None => {
                    warn!(symbol, source = %candidate.source, "undated candidate matches no event");
                    rejected.push(KeyOutcome {
                        key: format!("{symbol}@?"),
                        status: SubmitStatus::Rejected {
                            reason: RejectReason::incomplete("earnings_date"),
                        },
                    });
                }
            }
        }

        let clusters = groups
            .into_iter()
            .map(|(anchor, members)| {
                let earnings_date = members
                    .iter()
                    .filter_map(|c| draft_of(c).and_then(|d| d.earnings_date).map(|date| (c.provenance(), date)))
                    .max_by(|a, b| rank_cmp(&a.0, &b.0))
                    .map(|(_, date)| date)
                    .unwrap_or(anchor);
                EarningsCluster {
                    symbol: symbol.to_string(),
                    earnings_date,
                    members,
                }
            })
            .collect();
        (clusters, rejected)
    }

    /// Reconcile one event. `stored` takes part in every field selection with
    /// its persisted provenance.
    pub fn merge_earnings(
        &self,
        key: &EarningsKey,
        stored: Option<&EarningsRecord>,
        members: &[SourceCandidate],
    ) -> MergedEarnings {
        let drafts: Vec<(&EarningsDraft, Provenance)> = members
            .iter()
            .filter_map(|c| draft_of(c).map(|d| (d, c.provenance())))
            .collect();

        let company_name = select_field(
            stored.map(|r| &r.company_name),
            drafts.iter().filter_map(|(d, p)| {
                d.company_name
                    .as_deref()
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .map(|name| (name.to_string(), p.clone()))
            }),
        );
        let earnings_time = select_field(
            stored.map(|r| &r.earnings_time),
            drafts.iter().filter_map(|(d, p)| {
                d.earnings_time
                    .filter(|t| *t != EarningsTime::Unknown)
                    .map(|t| (t, p.clone()))
            }),
        );
        let fiscal_quarter = select_field(
            stored.map(|r| &r.fiscal_quarter),
            drafts
                .iter()
                .filter_map(|(d, p)| quarter_label(d).map(|q| (q, p.clone()))),
        );
        let fiscal_year = select_field(
            stored.map(|r| &r.fiscal_year),
            drafts
                .iter()
                .filter_map(|(d, p)| d.fiscal_year.map(|y| (y, p.clone()))),
        );

        let mut disagreements = Vec::new();

        let eps_supplies = numeric_supplies(&drafts, |d| d.eps_estimate);
        let eps_estimate = select_field(stored.map(|r| &r.eps_estimate), eps_supplies.iter().cloned());
        disagreements.extend(field_disagreement(
            "eps_estimate",
            self.config.eps_disagreement,
            &eps_estimate,
            stored.map(|r| &r.eps_estimate),
            &eps_supplies,
        ));

        let revenue_supplies = numeric_supplies(&drafts, |d| d.revenue_estimate);
        let revenue_estimate = select_field(
            stored.map(|r| &r.revenue_estimate),
            revenue_supplies.iter().cloned(),
        );
        disagreements.extend(field_disagreement(
            "revenue_estimate",
            self.config.revenue_disagreement,
            &revenue_estimate,
            stored.map(|r| &r.revenue_estimate),
            &revenue_supplies,
        ));

        let complete: Vec<(f64, f64, &Provenance)> = drafts
            .iter()
            .filter_map(|(d, p)| match (d.eps_actual, d.revenue_actual) {
                (Some(eps), Some(revenue)) if eps.is_finite() && revenue.is_finite() => {
                    Some((eps, revenue, p))
                }
                _ => None,
            })
            .collect();
        let partial = drafts
            .iter()
            .any(|(d, _)| d.eps_actual.is_some() != d.revenue_actual.is_some());
        let best_complete = complete.iter().copied().max_by(|a, b| rank_cmp(a.2, b.2));

        let mut actuals = match stored.and_then(|r| r.actuals.clone()) {
            Some(existing) => match best_complete {
                // Only a strictly more trusted origin may correct reported results.
                Some((eps, revenue, provenance)) if provenance.tier > existing.provenance.tier => {
                    debug!(key = %key, from = %existing.provenance.source, to = %provenance.source, "actuals corrected");
                    Some(ReportedActuals::assemble(
                        eps,
                        revenue,
                        eps_estimate.value,
                        provenance.clone(),
                    ))
                }
                _ => Some(existing),
            },
            None => best_complete.map(|(eps, revenue, provenance)| {
                ReportedActuals::assemble(eps, revenue, eps_estimate.value, provenance.clone())
            }),
        };

        if let Some(reported) = actuals.as_mut() {
            reported.settle_beat(eps_estimate.value);
        }

        if let Some(final_actuals) = &actuals {
            let tier = final_actuals.provenance.tier;
            let stored_actuals = stored.and_then(|r| r.actuals.as_ref());
            let observe = |pick: fn(f64, f64) -> f64| {
                stored_actuals
                    .map(|a| (pick(a.eps_actual, a.revenue_actual), &a.provenance))
                    .into_iter()
                    .chain(complete.iter().map(|(eps, revenue, p)| (pick(*eps, *revenue), *p)))
                    .collect::<Vec<_>>()
            };
            disagreements.extend(disagreement(
                "eps_actual",
                self.config.eps_disagreement,
                tier,
                observe(|eps, _| eps),
            ));
            disagreements.extend(disagreement(
                "revenue_actual",
                self.config.revenue_disagreement,
                tier,
                observe(|_, revenue| revenue),
            ));
        }

        let withheld_partial_actuals = partial && actuals.is_none();
        let flagged = !disagreements.is_empty() || withheld_partial_actuals;
        let official = drafts
            .iter()
            .any(|(_, p)| p.tier == TrustTier::OfficialFiling);
        let needs_review = flagged || (stored.is_some_and(|r| r.needs_review) && !official);

        let best_member = drafts.iter().map(|(_, p)| p).max_by(|a, b| rank_cmp(a, b));
        let stored_origin =
            stored.map(|r| Provenance::new(r.source.clone(), r.source_tier, r.last_updated));
        let origin = match (stored_origin, best_member) {
            (Some(stored), Some(member)) if stored.outranks(member) => stored,
            (_, Some(member)) => member.clone(),
            (Some(stored), None) => stored,
            (None, None) => Provenance::new("unknown", TrustTier::HeuristicEstimate, DateTime::<Utc>::MIN_UTC),
        };
        let last_updated = drafts
            .iter()
            .map(|(_, p)| p.retrieved_at)
            .chain(stored.map(|r| r.last_updated))
            .max()
            .unwrap_or(origin.retrieved_at);

        MergedEarnings {
            record: EarningsRecord {
                symbol: key.symbol.clone(),
                earnings_date: key.earnings_date,
                company_name,
                earnings_time,
                fiscal_quarter,
                fiscal_year,
                eps_estimate,
                revenue_estimate,
                actuals,
                source: origin.source,
                source_tier: origin.tier,
                needs_review,
                last_updated,
            },
            disagreements,
            withheld_partial_actuals,
        }
    }

    /// Pick the most trusted valid snapshot. Invalid candidates fall through
    /// to the next one; if none is valid the best candidate's reason is returned.
    pub fn merge_analyst(
        &self,
        symbol: &str,
        members: &[SourceCandidate],
    ) -> Result<AnalystSnapshot, RejectReason> {
        let mut ranked: Vec<(&AnalystDraft, Provenance)> = members
            .iter()
            .filter_map(|c| match &c.payload {
                CandidatePayload::Analyst(draft) => Some((draft, c.provenance())),
                CandidatePayload::Earnings(_) => None,
            })
            .collect();
        ranked.sort_by(|a, b| rank_cmp(&b.1, &a.1));

        let mut first_reason = None;
        for (draft, provenance) in ranked {
            match build_snapshot(symbol, draft, provenance) {
                Ok(snapshot) => return Ok(snapshot),
                Err(reason) => {
                    warn!(symbol, %reason, "analyst candidate skipped");
                    first_reason.get_or_insert(reason);
                }
            }
        }
        Err(first_reason.unwrap_or(RejectReason::MissingPrice))
    }
}

fn build_snapshot(
    symbol: &str,
    draft: &AnalystDraft,
    provenance: Provenance,
) -> Result<AnalystSnapshot, RejectReason> {
    let current_price = draft
        .current_price
        .filter(|p| p.is_finite())
        .ok_or(RejectReason::MissingPrice)?;
    let snapshot = AnalystSnapshot {
        symbol: symbol.to_string(),
        current_price,
        target_mean: draft.target_mean,
        target_high: draft.target_high,
        target_low: draft.target_low,
        recommendation: draft.recommendation.unwrap_or(Recommendation::Unknown),
        analyst_count: draft.analyst_count,
        source: provenance.source,
        source_tier: provenance.tier,
        last_updated: provenance.retrieved_at,
    };
    if snapshot.targets_consistent() {
        Ok(snapshot)
    } else {
        Err(RejectReason::InconsistentTargets)
    }
}

fn draft_of(candidate: &SourceCandidate) -> Option<&EarningsDraft> {
    match &candidate.payload {
        CandidatePayload::Earnings(draft) => Some(draft),
        CandidatePayload::Analyst(_) => None,
    }
}

/// `q1 2025` and `Q1  2025` name the same quarter.
fn quarter_label(draft: &EarningsDraft) -> Option<String> {
    let label = draft
        .fiscal_quarter
        .as_deref()?
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_ascii_uppercase();
    (!label.is_empty()).then_some(label)
}

fn numeric_supplies(
    drafts: &[(&EarningsDraft, Provenance)],
    pick: fn(&EarningsDraft) -> Option<f64>,
) -> Vec<(f64, Provenance)> {
    drafts
        .iter()
        .filter_map(|(d, p)| pick(d).filter(|v| v.is_finite()).map(|v| (v, p.clone())))
        .collect()
}

fn rank_cmp(a: &Provenance, b: &Provenance) -> Ordering {
    (a.tier, a.retrieved_at).cmp(&(b.tier, b.retrieved_at))
}

/// Highest rank wins; a candidate equal in rank to the stored value replaces it.
fn select_field<T: Clone>(
    stored: Option<&Field<T>>,
    supplies: impl IntoIterator<Item = (T, Provenance)>,
) -> Field<T> {
    let mut best: Option<(T, Provenance)> =
        stored.and_then(|f| Some((f.value.clone()?, f.provenance.clone()?)));
    for (value, provenance) in supplies {
        let replace = match &best {
            Some((_, current)) => !current.outranks(&provenance),
            None => true,
        };
        if replace {
            best = Some((value, provenance));
        }
    }
    match best {
        Some((value, provenance)) => Field::with_value_and_provenance(value, provenance),
        None => stored.cloned().unwrap_or_default(),
    }
}

fn field_disagreement(
    field: &'static str,
    threshold: f64,
    winner: &Field<f64>,
    stored: Option<&Field<f64>>,
    supplies: &[(f64, Provenance)],
) -> Option<Disagreement> {
    let tier = winner.provenance.as_ref()?.tier;
    let stored = stored.and_then(|f| Some((f.value?, f.provenance.as_ref()?)));
    let observations = stored
        .into_iter()
        .chain(supplies.iter().map(|(v, p)| (*v, p)))
        .collect::<Vec<_>>();
    disagreement(field, threshold, tier, observations)
}

/// Compares the latest value of every origin in `tier`. Revisions from one
/// origin replace each other instead of disagreeing.
fn disagreement(
    field: &'static str,
    threshold: f64,
    tier: TrustTier,
    observations: Vec<(f64, &Provenance)>,
) -> Option<Disagreement> {
    let mut latest: BTreeMap<&str, (f64, DateTime<Utc>)> = BTreeMap::new();
    for (value, provenance) in observations {
        if provenance.tier != tier {
            continue;
        }
        let entry = latest
            .entry(provenance.source.as_str())
            .or_insert((value, provenance.retrieved_at));
        if provenance.retrieved_at >= entry.1 {
            *entry = (value, provenance.retrieved_at);
        }
    }
    let values = latest.values().map(|(v, _)| *v).collect::<Vec<_>>();
    if values.len() < 2 {
        return None;
    }
    let spread = relative_spread(&values);
    if spread > threshold {
        warn!(field, %tier, spread, threshold, "same-tier sources disagree");
        Some(Disagreement {
            field,
            tier,
            spread,
            threshold,
        })
    } else {
        None
    }
}

/// `(max - min) / mean(|v|)`; infinite when values differ around zero.
pub fn relative_spread(values: &[f64]) -> f64 {
    let (min, max) = values
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(*v), hi.max(*v)));
    if values.is_empty() || max == min {
        return 0.0;
    }
    let mean = values.iter().map(|v| v.abs()).sum::<f64>() / values.len() as f64;
    if mean == 0.0 {
        f64::INFINITY
    } else {
        (max - min) / mean
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, day, hour, 0, 0).single().unwrap()
    }

    fn date(m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, m, d).unwrap()
    }

    fn earnings(source: &str, tier: TrustTier, retrieved_at: DateTime<Utc>, draft: EarningsDraft) -> SourceCandidate {
        SourceCandidate::earnings(source, tier, retrieved_at, draft)
    }

    fn draft(symbol: &str, on: NaiveDate) -> EarningsDraft {
        EarningsDraft {
            symbol: Some(symbol.to_string()),
            earnings_date: Some(on),
            ..EarningsDraft::default()
        }
    }

    fn merge_single(engine: &MergeEngine, stored: Option<&EarningsRecord>, members: Vec<SourceCandidate>) -> MergedEarnings {
        let mut plan = engine.plan(members);
        assert!(plan.rejected.is_empty(), "unexpected rejections: {:?}", plan.rejected);
        assert_eq!(plan.earnings.len(), 1);
        let cluster = plan.earnings.remove(0);
        engine.merge_earnings(&cluster.key(), stored, &cluster.members)
    }

    #[test]
    fn higher_tier_estimate_wins() {
        let engine = MergeEngine::new(MergeConfig::default());
        let merged = merge_single(
            &engine,
            None,
            vec![
                earnings("news_cnbc", TrustTier::NewsSource, at(10, 9), EarningsDraft {
                    eps_estimate: Some(2.50),
                    ..draft("AAPL", date(1, 30))
                }),
                earnings("sec_edgar", TrustTier::OfficialFiling, at(9, 9), EarningsDraft {
                    eps_estimate: Some(2.00),
                    ..draft("AAPL", date(1, 30))
                }),
            ],
        );
        assert_eq!(merged.record.eps_estimate.value, Some(2.00));
        assert_eq!(merged.record.source, "sec_edgar");
        assert_eq!(merged.record.source_tier, TrustTier::OfficialFiling);
        assert!(!merged.record.needs_review);
        assert_eq!(merged.record.last_updated, at(10, 9));
    }

    #[test]
    fn same_tier_tie_goes_to_latest_retrieval() {
        let engine = MergeEngine::new(MergeConfig::default());
        let merged = merge_single(
            &engine,
            None,
            vec![
                earnings("yahoo_finance", TrustTier::ProfessionalDataPlatform, at(10, 15), EarningsDraft {
                    company_name: Some("Apple Inc.".into()),
                    ..draft("AAPL", date(1, 30))
                }),
                earnings("finnhub", TrustTier::ProfessionalDataPlatform, at(10, 9), EarningsDraft {
                    company_name: Some("Apple Computer".into()),
                    ..draft("AAPL", date(1, 30))
                }),
            ],
        );
        assert_eq!(merged.record.company_name.value.as_deref(), Some("Apple Inc."));
    }

    #[test]
    fn same_tier_revenue_disagreement_sets_review() {
        let engine = MergeEngine::new(MergeConfig::default());
        let merged = merge_single(
            &engine,
            None,
            vec![
                earnings("news_cnbc", TrustTier::NewsSource, at(10, 9), EarningsDraft {
                    revenue_estimate: Some(100e9),
                    ..draft("AAPL", date(1, 30))
                }),
                earnings("news_reuters", TrustTier::NewsSource, at(10, 10), EarningsDraft {
                    revenue_estimate: Some(140e9),
                    ..draft("AAPL", date(1, 30))
                }),
            ],
        );
        assert!(merged.record.needs_review);
        assert_eq!(merged.disagreements.len(), 1);
        assert_eq!(merged.disagreements[0].field, "revenue_estimate");
        assert_eq!(merged.record.revenue_estimate.value, Some(140e9));
    }

    #[test]
    fn small_spread_or_cross_tier_difference_is_not_flagged() {
        let engine = MergeEngine::new(MergeConfig::default());
        let close = merge_single(
            &engine,
            None,
            vec![
                earnings("news_cnbc", TrustTier::NewsSource, at(10, 9), EarningsDraft {
                    revenue_estimate: Some(100e9),
                    ..draft("AAPL", date(1, 30))
                }),
                earnings("news_reuters", TrustTier::NewsSource, at(10, 10), EarningsDraft {
                    revenue_estimate: Some(120e9),
                    ..draft("AAPL", date(1, 30))
                }),
            ],
        );
        assert!(!close.record.needs_review);

        let cross_tier = merge_single(
            &engine,
            None,
            vec![
                earnings("news_cnbc", TrustTier::NewsSource, at(10, 9), EarningsDraft {
                    eps_estimate: Some(4.0),
                    ..draft("AAPL", date(1, 30))
                }),
                earnings("yahoo_finance", TrustTier::ProfessionalDataPlatform, at(10, 9), EarningsDraft {
                    eps_estimate: Some(2.0),
                    ..draft("AAPL", date(1, 30))
                }),
            ],
        );
        assert!(!cross_tier.record.needs_review);
        assert_eq!(cross_tier.record.eps_estimate.value, Some(2.0));
    }

    #[test]
    fn revisions_from_one_origin_do_not_disagree() {
        let engine = MergeEngine::new(MergeConfig::default());
        let first = merge_single(
            &engine,
            None,
            vec![earnings("news_cnbc", TrustTier::NewsSource, at(10, 9), EarningsDraft {
                eps_estimate: Some(2.0),
                ..draft("AAPL", date(1, 30))
            })],
        );
        let revised = merge_single(
            &engine,
            Some(&first.record),
            vec![earnings("news_cnbc", TrustTier::NewsSource, at(12, 9), EarningsDraft {
                eps_estimate: Some(2.6),
                ..draft("AAPL", date(1, 30))
            })],
        );
        assert!(!revised.record.needs_review);
        assert_eq!(revised.record.eps_estimate.value, Some(2.6));
    }

    #[test]
    fn stored_higher_tier_field_survives_lower_tier_candidate() {
        let engine = MergeEngine::new(MergeConfig::default());
        let official = merge_single(
            &engine,
            None,
            vec![earnings("sec_edgar", TrustTier::OfficialFiling, at(9, 9), EarningsDraft {
                eps_estimate: Some(2.00),
                fiscal_quarter: Some("Q1 2025".into()),
                ..draft("AAPL", date(1, 30))
            })],
        );
        let later = merge_single(
            &engine,
            Some(&official.record),
            vec![earnings("news_cnbc", TrustTier::NewsSource, at(11, 9), EarningsDraft {
                eps_estimate: Some(2.50),
                company_name: Some("Apple Inc.".into()),
                ..draft("AAPL", date(1, 30))
            })],
        );
        assert_eq!(later.record.eps_estimate.value, Some(2.00));
        assert_eq!(later.record.company_name.value.as_deref(), Some("Apple Inc."));
        assert_eq!(later.record.fiscal_quarter.value.as_deref(), Some("Q1 2025"));
        assert_eq!(later.record.source_tier, TrustTier::OfficialFiling);
        assert_eq!(later.record.last_updated, at(11, 9));
    }

    #[test]
    fn dates_beyond_window_become_separate_events() {
        let engine = MergeEngine::new(MergeConfig::default());
        let plan = engine.plan(vec![
            earnings("news_cnbc", TrustTier::NewsSource, at(5, 9), draft("aapl", date(1, 30))),
            earnings("yahoo_finance", TrustTier::ProfessionalDataPlatform, at(5, 9), draft("AAPL", date(2, 2))),
            earnings("news_cnbc", TrustTier::NewsSource, at(5, 9), draft("AAPL", date(4, 30))),
        ]);
        let keys = plan.earnings.iter().map(|c| c.key().to_string()).collect::<Vec<_>>();
        assert_eq!(keys, vec!["AAPL@2025-02-02", "AAPL@2025-04-30"]);
        assert_eq!(plan.earnings[0].members.len(), 2);
    }

    #[test]
    fn undated_candidate_joins_matching_quarter() {
        let engine = MergeEngine::new(MergeConfig::default());
        let plan = engine.plan(vec![
            earnings("sec_edgar", TrustTier::OfficialFiling, at(5, 9), EarningsDraft {
                fiscal_quarter: Some("Q1 2025".into()),
                ..draft("AAPL", date(1, 30))
            }),
            earnings("sec_edgar", TrustTier::OfficialFiling, at(5, 9), EarningsDraft {
                fiscal_quarter: Some("Q2 2025".into()),
                ..draft("AAPL", date(5, 1))
            }),
            earnings("news_cnbc", TrustTier::NewsSource, at(6, 9), EarningsDraft {
                symbol: Some("AAPL".into()),
                fiscal_quarter: Some("q2  2025".into()),
                eps_estimate: Some(1.6),
                ..EarningsDraft::default()
            }),
        ]);
        assert!(plan.rejected.is_empty());
        assert_eq!(plan.earnings[0].members.len(), 1);
        assert_eq!(plan.earnings[1].members.len(), 2);
    }

    #[test]
    fn candidates_without_key_fields_are_rejected() {
        let engine = MergeEngine::new(MergeConfig::default());
        let plan = engine.plan(vec![
            earnings("news_cnbc", TrustTier::NewsSource, at(5, 9), EarningsDraft {
                symbol: None,
                ..draft("", date(1, 30))
            }),
            earnings("news_cnbc", TrustTier::NewsSource, at(5, 9), EarningsDraft {
                symbol: Some("MSFT".into()),
                ..EarningsDraft::default()
            }),
        ]);
        assert!(plan.earnings.is_empty());
        assert_eq!(
            plan.rejected,
            vec![
                KeyOutcome {
                    key: "news_cnbc#0".into(),
                    status: SubmitStatus::Rejected {
                        reason: RejectReason::incomplete("symbol")
                    },
                },
                KeyOutcome {
                    key: "MSFT@?".into(),
                    status: SubmitStatus::Rejected {
                        reason: RejectReason::incomplete("earnings_date")
                    },
                },
            ]
        );
    }

    #[test]
    fn reported_actuals_are_immutable_for_equal_or_lower_tiers() {
        let engine = MergeEngine::new(MergeConfig::default());
        let reported = merge_single(
            &engine,
            None,
            vec![earnings("yahoo_finance", TrustTier::ProfessionalDataPlatform, at(31, 22), EarningsDraft {
                eps_estimate: Some(2.10),
                eps_actual: Some(2.40),
                revenue_actual: Some(124.3e9),
                ..draft("AAPL", date(1, 30))
            })],
        )
        .record;
        assert_eq!(reported.beat_estimate(), Some(true));

        let nulls = merge_single(
            &engine,
            Some(&reported),
            vec![earnings("news_cnbc", TrustTier::NewsSource, at(31, 23), EarningsDraft {
                eps_estimate: Some(2.50),
                ..draft("AAPL", date(1, 30))
            })],
        )
        .record;
        assert_eq!(nulls.actuals, reported.actuals);

        let peer = merge_single(
            &engine,
            Some(&reported),
            vec![earnings("finnhub", TrustTier::ProfessionalDataPlatform, at(31, 23), EarningsDraft {
                eps_actual: Some(2.41),
                revenue_actual: Some(124.0e9),
                ..draft("AAPL", date(1, 30))
            })],
        )
        .record;
        assert_eq!(peer.actuals, reported.actuals);

        let filing = merge_single(
            &engine,
            Some(&reported),
            vec![earnings("sec_edgar", TrustTier::OfficialFiling, at(31, 23), EarningsDraft {
                eps_actual: Some(2.05),
                revenue_actual: Some(124.3e9),
                ..draft("AAPL", date(1, 30))
            })],
        )
        .record;
        assert_eq!(filing.eps_actual(), Some(2.05));
        assert_eq!(filing.beat_estimate(), Some(false));
    }

    #[test]
    fn pending_beat_flag_settles_once_estimate_arrives() {
        let engine = MergeEngine::new(MergeConfig::default());
        let reported = merge_single(
            &engine,
            None,
            vec![earnings("yahoo_finance", TrustTier::ProfessionalDataPlatform, at(31, 22), EarningsDraft {
                eps_actual: Some(2.40),
                revenue_actual: Some(124.3e9),
                ..draft("AAPL", date(1, 30))
            })],
        )
        .record;
        assert!(reported.is_reported());
        assert_eq!(reported.beat_estimate(), None);

        let estimated = merge_single(
            &engine,
            Some(&reported),
            vec![earnings("news_cnbc", TrustTier::NewsSource, at(31, 23), EarningsDraft {
                eps_estimate: Some(2.10),
                ..draft("AAPL", date(1, 30))
            })],
        )
        .record;
        assert_eq!(estimated.beat_estimate(), Some(true));
        assert_eq!(estimated.eps_actual(), Some(2.40));

        let revised = merge_single(
            &engine,
            Some(&estimated),
            vec![earnings("sec_edgar", TrustTier::OfficialFiling, at(31, 23), EarningsDraft {
                eps_estimate: Some(2.60),
                ..draft("AAPL", date(1, 30))
            })],
        )
        .record;
        assert_eq!(revised.beat_estimate(), Some(true));
    }

    #[test]
    fn partial_actuals_are_withheld_and_flagged() {
        let engine = MergeEngine::new(MergeConfig::default());
        let merged = merge_single(
            &engine,
            None,
            vec![earnings("news_cnbc", TrustTier::NewsSource, at(31, 22), EarningsDraft {
                eps_estimate: Some(2.10),
                eps_actual: Some(2.40),
                ..draft("AAPL", date(1, 30))
            })],
        );
        assert!(merged.withheld_partial_actuals);
        assert!(merged.record.actuals.is_none());
        assert!(merged.record.needs_review);
    }

    #[test]
    fn review_flag_clears_only_on_clean_official_merge() {
        let engine = MergeEngine::new(MergeConfig::default());
        let flagged = merge_single(
            &engine,
            None,
            vec![
                earnings("news_cnbc", TrustTier::NewsSource, at(10, 9), EarningsDraft {
                    eps_estimate: Some(2.0),
                    ..draft("AAPL", date(1, 30))
                }),
                earnings("news_reuters", TrustTier::NewsSource, at(10, 9), EarningsDraft {
                    eps_estimate: Some(3.0),
                    ..draft("AAPL", date(1, 30))
                }),
            ],
        )
        .record;
        assert!(flagged.needs_review);

        let platform = merge_single(
            &engine,
            Some(&flagged),
            vec![earnings("yahoo_finance", TrustTier::ProfessionalDataPlatform, at(11, 9), EarningsDraft {
                eps_estimate: Some(2.2),
                ..draft("AAPL", date(1, 30))
            })],
        )
        .record;
        assert!(platform.needs_review);

        let filing = merge_single(
            &engine,
            Some(&platform),
            vec![earnings("sec_edgar", TrustTier::OfficialFiling, at(12, 9), EarningsDraft {
                eps_estimate: Some(2.2),
                ..draft("AAPL", date(1, 30))
            })],
        )
        .record;
        assert!(!filing.needs_review);
    }

    #[test]
    fn tier_overrides_apply_before_selection() {
        let mut config = MergeConfig::default();
        config
            .tier_overrides
            .insert("placeholder".into(), TrustTier::HeuristicEstimate);
        let engine = MergeEngine::new(config);
        let merged = merge_single(
            &engine,
            None,
            vec![
                earnings("placeholder", TrustTier::OfficialFiling, at(10, 9), EarningsDraft {
                    eps_estimate: Some(9.99),
                    ..draft("AAPL", date(1, 30))
                }),
                earnings("news_cnbc", TrustTier::NewsSource, at(9, 9), EarningsDraft {
                    eps_estimate: Some(2.30),
                    ..draft("AAPL", date(1, 30))
                }),
            ],
        );
        assert_eq!(merged.record.eps_estimate.value, Some(2.30));
    }

    #[test]
    fn analyst_merge_prefers_best_valid_snapshot() {
        let engine = MergeEngine::new(MergeConfig::default());
        let valid = AnalystDraft {
            symbol: Some("AAPL".into()),
            current_price: Some(230.5),
            target_mean: Some(250.0),
            target_high: Some(280.0),
            target_low: Some(220.0),
            recommendation: Some(Recommendation::Buy),
            analyst_count: Some(25),
        };
        let inverted = AnalystDraft {
            target_low: Some(300.0),
            ..valid.clone()
        };
        let members = vec![
            SourceCandidate::analyst("news_cnbc", TrustTier::NewsSource, at(10, 9), valid.clone()),
            SourceCandidate::analyst("yahoo_finance", TrustTier::ProfessionalDataPlatform, at(10, 9), inverted.clone()),
        ];
        let snapshot = engine.merge_analyst("AAPL", &members).unwrap();
        assert_eq!(snapshot.source, "news_cnbc");

        let only_bad = vec![
            SourceCandidate::analyst("yahoo_finance", TrustTier::ProfessionalDataPlatform, at(10, 9), inverted),
            SourceCandidate::analyst("news_cnbc", TrustTier::NewsSource, at(10, 9), AnalystDraft {
                current_price: None,
                ..valid
            }),
        ];
        assert_eq!(
            engine.merge_analyst("AAPL", &only_bad),
            Err(RejectReason::InconsistentTargets)
        );
    }

    #[test]
    fn spread_is_relative_to_mean_magnitude() {
        assert!((relative_spread(&[100e9, 140e9]) - 40.0 / 120.0).abs() < 1e-12);
        assert_eq!(relative_spread(&[2.0, 2.0]), 0.0);
        assert_eq!(relative_spread(&[0.0, 0.0]), 0.0);
        assert!(relative_spread(&[-0.1, 0.1]) > 1.0);
    }
}
