//! Axum JSON API over the earnings cache service.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use ecal_adapters::{CandidateProducer, ProducerContext, SampleProducer};
use ecal_cache::{
    maybe_build_sweep_scheduler, month_bounds, CacheConfig, CacheError, CacheService, MergeEngine,
    SubmitReport,
};
use ecal_core::{normalize_symbol, Annotated, EarningsRecord, SourceCandidate};
use ecal_storage::RecordStore;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerVariant {
    /// In-memory store seeded with deterministic sample data.
    Mock,
    /// SQLite-backed store from `DATABASE_URL`.
    Cached,
}

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<CacheService>,
    pub variant: ServerVariant,
}

impl AppState {
    pub fn new(service: Arc<CacheService>, variant: ServerVariant) -> Self {
        Self { service, variant }
    }

    pub async fn build(config: &CacheConfig, variant: ServerVariant) -> anyhow::Result<Self> {
        let service = match variant {
            ServerVariant::Cached => CacheService::from_config(config).await?,
            ServerVariant::Mock => {
                let service = CacheService::new(
                    RecordStore::in_memory().await.context("opening in-memory store")?,
                    config.freshness_policy(),
                    MergeEngine::new(config.merge_config()),
                );
                let report = seed_sample(&service).await?;
                info!(created = report.created(), "mock store seeded");
                service
            }
        };
        Ok(Self::new(Arc::new(service), variant))
    }
}

pub async fn seed_sample(service: &CacheService) -> anyhow::Result<SubmitReport> {
    let candidates = SampleProducer
        .produce(&ProducerContext::now())
        .await
        .context("producing sample candidates")?;
    Ok(service.submit(candidates).await?)
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/api/calendar", get(calendar_handler))
        .route("/api/earnings/{symbol}", get(symbol_earnings_handler))
        .route("/api/earnings/{symbol}/{date}", get(earnings_handler))
        .route("/api/analyst/{symbol}", get(analyst_handler))
        .route("/api/stats", get(stats_handler))
        .route("/api/candidates", post(submit_handler))
        .route("/admin/sweep", post(sweep_handler))
        .route("/admin/export", get(export_handler))
        .route("/admin/import", post(import_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env(variant: ServerVariant) -> anyhow::Result<()> {
    let config = CacheConfig::from_env();
    let state = AppState::build(&config, variant).await?;
    let service = Arc::clone(&state.service);

    let scheduler = match variant {
        ServerVariant::Cached => maybe_build_sweep_scheduler(&config, Arc::clone(&service)).await?,
        ServerVariant::Mock => None,
    };
    if let Some(sched) = &scheduler {
        sched.start().await.context("starting sweep scheduler")?;
    }

    let listener = TcpListener::bind(("0.0.0.0", config.web_port))
        .await
        .with_context(|| format!("binding port {}", config.web_port))?;
    info!(port = config.web_port, ?variant, "serving earnings calendar api");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(mut sched) = scheduler {
        sched.shutdown().await.context("stopping sweep scheduler")?;
    }
    service.close().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for shutdown signal");
    }
}

#[derive(Debug)]
enum ApiError {
    Cache(CacheError),
    BadRequest(String),
    NotFound(String),
}

impl From<CacheError> for ApiError {
    fn from(err: CacheError) -> Self {
        ApiError::Cache(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind, message) = match self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, "bad_request", message),
            ApiError::NotFound(message) => (StatusCode::NOT_FOUND, "not_found", message),
            ApiError::Cache(err) => {
                let (status, kind) = match &err {
                    CacheError::InvalidRange { .. } => (StatusCode::BAD_REQUEST, "invalid_range"),
                    CacheError::InvalidMonth { .. } => (StatusCode::BAD_REQUEST, "invalid_month"),
                    CacheError::MalformedSnapshot(_) => {
                        (StatusCode::BAD_REQUEST, "malformed_snapshot")
                    }
                    CacheError::SchemaMismatch { .. } => (StatusCode::CONFLICT, "schema_mismatch"),
                    CacheError::StoreUnavailable(_) => {
                        (StatusCode::SERVICE_UNAVAILABLE, "store_unavailable")
                    }
                    CacheError::Archive(_) => (StatusCode::INTERNAL_SERVER_ERROR, "archive"),
                };
                if status.is_server_error() {
                    error!(error = %err, "request failed");
                }
                (status, kind, err.to_string())
            }
        };
        (status, Json(json!({ "error": kind, "message": message }))).into_response()
    }
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({ "status": "ok", "variant": state.variant }))
}

#[derive(Debug, Deserialize, Default)]
struct CalendarQuery {
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
    /// `YYYY-MM`
    month: Option<String>,
}

#[derive(Debug, Serialize)]
struct CalendarResponse {
    start: NaiveDate,
    end: NaiveDate,
    count: usize,
    stale_count: usize,
    events: Vec<Annotated<EarningsRecord>>,
}

fn parse_month(raw: &str) -> Result<(i32, u32), ApiError> {
    let bad = || ApiError::BadRequest(format!("month must be YYYY-MM, got {raw:?}"));
    let (year, month) = raw.trim().split_once('-').ok_or_else(bad)?;
    Ok((
        year.parse().map_err(|_| bad())?,
        month.parse().map_err(|_| bad())?,
    ))
}

async fn calendar_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CalendarQuery>,
) -> Result<Json<CalendarResponse>, ApiError> {
    let (start, end, events) = match (&query.month, query.start, query.end) {
        (None, Some(start), Some(end)) => {
            (start, end, state.service.get_calendar(start, end).await?)
        }
        (Some(month), None, None) => {
            let (year, month) = parse_month(month)?;
            let (start, end) = month_bounds(year, month)?;
            (start, end, state.service.get_calendar_month(year, month).await?)
        }
        (None, None, None) => {
            let today = Utc::now().date_naive();
            let (start, end) = month_bounds(today.year(), today.month())?;
            (start, end, state.service.get_calendar(start, end).await?)
        }
        _ => {
            return Err(ApiError::BadRequest(
                "pass either month=YYYY-MM or both start and end".to_string(),
            ))
        }
    };
    Ok(Json(CalendarResponse {
        start,
        end,
        count: events.len(),
        stale_count: events.iter().filter(|e| e.is_stale).count(),
        events,
    }))
}

async fn earnings_handler(
    State(state): State<Arc<AppState>>,
    AxumPath((symbol, date)): AxumPath<(String, NaiveDate)>,
) -> Result<Json<Annotated<EarningsRecord>>, ApiError> {
    state
        .service
        .get_earnings(&symbol, date)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("no earnings event for {symbol} on {date}")))
}

async fn symbol_earnings_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(symbol): AxumPath<String>,
) -> Result<Response, ApiError> {
    let events = state.service.get_symbol_earnings(&symbol).await?;
    Ok(Json(json!({
        "symbol": normalize_symbol(&symbol),
        "count": events.len(),
        "events": events,
    }))
    .into_response())
}

async fn analyst_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(symbol): AxumPath<String>,
) -> Result<Response, ApiError> {
    let snapshot = state
        .service
        .get_analyst(&symbol)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("no analyst snapshot for {symbol}")))?;
    Ok(Json(snapshot).into_response())
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    let stats = state.service.stats().await?;
    Ok(Json(json!({ "variant": state.variant, "stats": stats })).into_response())
}

async fn submit_handler(
    State(state): State<Arc<AppState>>,
    Json(candidates): Json<Vec<SourceCandidate>>,
) -> Result<Json<SubmitReport>, ApiError> {
    Ok(Json(state.service.submit(candidates).await?))
}

#[derive(Debug, Deserialize, Default)]
struct SweepQuery {
    as_of: Option<DateTime<Utc>>,
}

async fn sweep_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SweepQuery>,
) -> Result<Response, ApiError> {
    let report = state
        .service
        .sweep_expired(query.as_of.unwrap_or_else(Utc::now))
        .await?;
    Ok(Json(report).into_response())
}

async fn export_handler(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    Ok(Json(state.service.export().await?).into_response())
}

async fn import_handler(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let summary = state.service.import_json(&body).await?;
    Ok(Json(summary).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request};
    use chrono::Days;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    async fn mock_app() -> Router {
        let state = AppState::build(&CacheConfig::default(), ServerVariant::Mock)
            .await
            .unwrap();
        app(state)
    }

    async fn json_body(resp: Response) -> serde_json::Value {
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn handler_smoke_healthz() {
        let resp = mock_app().await.oneshot(get_req("/healthz")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json_body(resp).await["variant"], "mock");
    }

    #[tokio::test]
    async fn handler_smoke_calendar_range_and_errors() {
        let app = mock_app().await;
        let today = Utc::now().date_naive();
        let start = today - Days::new(20);
        let end = today + Days::new(60);

        let resp = app
            .clone()
            .oneshot(get_req(&format!("/api/calendar?start={start}&end={end}")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["count"], 12);
        let dates = body["events"]
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["earnings_date"].as_str().unwrap().to_string())
            .collect::<Vec<_>>();
        let mut sorted = dates.clone();
        sorted.sort();
        assert_eq!(dates, sorted);

        let inverted = app
            .clone()
            .oneshot(get_req(&format!("/api/calendar?start={end}&end={start}")))
            .await
            .unwrap();
        assert_eq!(inverted.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(inverted).await["error"], "invalid_range");

        let bad_month = app
            .clone()
            .oneshot(get_req("/api/calendar?month=2025-13"))
            .await
            .unwrap();
        assert_eq!(bad_month.status(), StatusCode::BAD_REQUEST);

        let month = app
            .oneshot(get_req(&format!("/api/calendar?month={}", today.format("%Y-%m"))))
            .await
            .unwrap();
        assert_eq!(month.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn handler_smoke_point_lookups() {
        let app = mock_app().await;
        let tsla_date = Utc::now().date_naive() + Days::new(5);

        let found = app
            .clone()
            .oneshot(get_req(&format!("/api/earnings/tsla/{tsla_date}")))
            .await
            .unwrap();
        assert_eq!(found.status(), StatusCode::OK);
        let body = json_body(found).await;
        assert_eq!(body["symbol"], "TSLA");
        assert_eq!(body["is_stale"], false);

        let missing = app
            .clone()
            .oneshot(get_req("/api/earnings/ZZZZ/2025-01-30"))
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let analyst = app
            .clone()
            .oneshot(get_req("/api/analyst/AAPL"))
            .await
            .unwrap();
        assert_eq!(analyst.status(), StatusCode::OK);
        assert_eq!(json_body(analyst).await["is_stale"], false);

        let no_analyst = app.oneshot(get_req("/api/analyst/ZZZZ")).await.unwrap();
        assert_eq!(no_analyst.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn handler_smoke_symbol_history() {
        let app = mock_app().await;
        let resp = app
            .clone()
            .oneshot(get_req("/api/earnings/tsla"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["symbol"], "TSLA");
        assert_eq!(body["count"], 1);
        assert_eq!(body["events"][0]["symbol"], "TSLA");

        let unknown = app.oneshot(get_req("/api/earnings/ZZZZ")).await.unwrap();
        assert_eq!(unknown.status(), StatusCode::OK);
        assert_eq!(json_body(unknown).await["count"], 0);
    }

    #[tokio::test]
    async fn closed_store_maps_to_service_unavailable() {
        let state = AppState::build(&CacheConfig::default(), ServerVariant::Mock)
            .await
            .unwrap();
        state.service.close().await;
        let app = app(state);

        let resp = app
            .clone()
            .oneshot(get_req("/api/calendar?start=2025-01-01&end=2025-01-31"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json_body(resp).await["error"], "store_unavailable");

        let submit = app
            .oneshot(post_json(
                "/api/candidates",
                json!([{
                    "source": "news_cnbc",
                    "tier": "news_source",
                    "retrieved_at": "2025-01-31T22:00:00Z",
                    "payload": {"kind": "earnings", "symbol": "ADBE", "earnings_date": "2025-03-12"}
                }]),
            ))
            .await
            .unwrap();
        assert_eq!(submit.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn handler_smoke_submit_candidates() {
        let app = mock_app().await;
        let resp = app
            .clone()
            .oneshot(post_json(
                "/api/candidates",
                json!([
                    {
                        "source": "sec_edgar",
                        "tier": "official_filing",
                        "retrieved_at": "2025-01-31T22:00:00Z",
                        "payload": {
                            "kind": "earnings",
                            "symbol": "ADBE",
                            "earnings_date": "2025-03-12",
                            "eps_estimate": 4.97
                        }
                    },
                    {
                        "source": "news_cnbc",
                        "tier": "news_source",
                        "retrieved_at": "2025-01-31T22:00:00Z",
                        "payload": {"kind": "earnings", "earnings_date": "2025-03-12"}
                    }
                ]),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        let outcomes = body["outcomes"].as_array().unwrap();
        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0]["key"], "ADBE@2025-03-12");
        assert_eq!(outcomes[0]["status"], "created");
        assert_eq!(outcomes[1]["status"], "rejected");
        assert_eq!(outcomes[1]["reason"]["field"], "symbol");

        let lookup = app
            .oneshot(get_req("/api/earnings/ADBE/2025-03-12"))
            .await
            .unwrap();
        assert_eq!(lookup.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn handler_smoke_admin_routes() {
        let app = mock_app().await;

        let export = app.clone().oneshot(get_req("/admin/export")).await.unwrap();
        assert_eq!(export.status(), StatusCode::OK);
        let snapshot = json_body(export).await;
        assert_eq!(snapshot["schema_version"], 1);
        assert_eq!(snapshot["earnings"].as_array().unwrap().len(), 12);

        let reimport = app
            .clone()
            .oneshot(post_json("/admin/import", snapshot.clone()))
            .await
            .unwrap();
        assert_eq!(reimport.status(), StatusCode::OK);
        assert_eq!(json_body(reimport).await["earnings_created"], 0);

        let mut future = snapshot;
        future["schema_version"] = json!(7);
        let mismatch = app
            .clone()
            .oneshot(post_json("/admin/import", future))
            .await
            .unwrap();
        assert_eq!(mismatch.status(), StatusCode::CONFLICT);
        assert_eq!(json_body(mismatch).await["error"], "schema_mismatch");

        let sweep = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/admin/sweep?as_of=2099-01-01T00:00:00Z")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(sweep.status(), StatusCode::OK);
        assert_eq!(json_body(sweep).await["earnings_removed"], 12);

        let stats = app.oneshot(get_req("/api/stats")).await.unwrap();
        assert_eq!(json_body(stats).await["stats"]["earnings_count"], 0);
    }

    #[tokio::test]
    async fn cached_variant_persists_submissions() {
        let dir = tempfile::tempdir().unwrap();
        let config = CacheConfig {
            database_url: format!("sqlite://{}", dir.path().join("cache.db").display()),
            workspace_root: dir.path().to_path_buf(),
            ..CacheConfig::default()
        };
        let state = AppState::build(&config, ServerVariant::Cached).await.unwrap();
        state
            .service
            .submit(vec![SourceCandidate::earnings(
                "news_cnbc",
                ecal_core::TrustTier::NewsSource,
                Utc::now(),
                ecal_core::EarningsDraft {
                    symbol: Some("NFLX".into()),
                    earnings_date: Some(NaiveDate::from_ymd_opt(2025, 1, 21).unwrap()),
                    ..Default::default()
                },
            )])
            .await
            .unwrap();
        state.service.close().await;

        let reopened = AppState::build(&config, ServerVariant::Cached).await.unwrap();
        let resp = app(reopened)
            .oneshot(get_req("/api/stats"))
            .await
            .unwrap();
        let body = json_body(resp).await;
        assert_eq!(body["variant"], "cached");
        assert_eq!(body["stats"]["earnings_count"], 1);
    }
}
