use std::path::PathBuf;

use ecal_adapters::{load_candidate_bundle, BundleProducer, CandidateProducer, ProducerContext};
use ecal_core::{CandidatePayload, EarningsTime, TrustTier};

fn fixture(rel: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures")
        .join(rel)
}

#[test]
fn sample_bundle_parses_header_and_drafts() {
    let bundle = load_candidate_bundle(fixture("earnings/sample/bundle.json")).unwrap();
    assert_eq!(bundle.source, "yahoo_finance");
    assert_eq!(bundle.tier, TrustTier::ProfessionalDataPlatform);
    assert_eq!(bundle.earnings.len(), 5);
    assert_eq!(bundle.analysts.len(), 2);

    let aapl = &bundle.earnings[0];
    assert_eq!(aapl.earnings_time, Some(EarningsTime::AfterMarket));
    assert_eq!(bundle.earnings[2].earnings_time, Some(EarningsTime::AfterMarket));
    assert!(bundle.earnings[4].symbol.is_none());
}

#[tokio::test]
async fn bundle_producer_replays_fixture_with_header_provenance() {
    let producer = BundleProducer::open(fixture("earnings/sample/bundle.json")).unwrap();
    assert_eq!(producer.source_id(), "yahoo_finance");

    let candidates = producer.produce(&ProducerContext::now()).await.unwrap();
    assert_eq!(candidates.len(), 7);
    assert!(candidates
        .iter()
        .all(|c| c.source == "yahoo_finance" && c.tier == TrustTier::ProfessionalDataPlatform));

    let symbols = candidates.iter().map(|c| c.symbol()).collect::<Vec<_>>();
    assert_eq!(symbols[1].as_deref(), Some("MSFT"));
    assert_eq!(symbols[4], None);

    let analysts = candidates
        .iter()
        .filter(|c| matches!(c.payload, CandidatePayload::Analyst(_)))
        .count();
    assert_eq!(analysts, 2);
}

#[test]
fn missing_bundle_reports_path() {
    let err = load_candidate_bundle(fixture("earnings/absent/bundle.json")).unwrap_err();
    assert!(format!("{err:#}").contains("absent"));
}
