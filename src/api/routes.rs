use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::api::health::{HealthSnapshot, HealthState};
use crate::api::latency::LatencyStats;
use crate::config::DealThresholds;
use crate::error::{AppError, Result};
use crate::normalizer::RejectStats;
use crate::query::{FilterKey, Fingerprint, QueryInput, QuerySpec};
use crate::refresh::{RefreshOrchestrator, RefreshOutcome, RefreshStatus, SweepReport, WatchlistRefresher};
use crate::scorer::{assess, AskingPrice, DealLabel};
use crate::state::valuation_cache::expired;
use crate::state::WatchlistRegistry;
use crate::types::{Currency, EntryId, EstimateRecord, RawListing, Valuation, WatchlistEntry};

#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: Arc<RefreshOrchestrator>,
    pub registry: Arc<WatchlistRegistry>,
    pub refresher: Arc<WatchlistRefresher>,
    pub health: Arc<HealthState>,
    pub latency: Arc<LatencyStats>,
    /// Read-through staleness threshold for GET /valuation.
    pub max_age: Duration,
    pub thresholds: DealThresholds,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(get_health))
        .route("/valuation", get(get_valuation))
        .route("/valuation/diagnostics", get(get_valuation_diagnostics))
        .route("/valuation/refresh", post(post_valuation_refresh))
        .route("/valuation/history", get(get_valuation_history))
        .route("/comps/seed", post(post_seed))
        .route("/owners/:owner/watchlist", get(get_watchlist).post(post_watchlist))
        .route("/owners/:owner/watchlist/:id", delete(delete_watchlist_entry))
        .route("/owners/:owner/watchlist/:id/refresh", post(post_watchlist_entry_refresh))
        .route("/watchlist/refresh-all", post(post_watchlist_refresh_all))
        .route("/stats/latency", get(get_stats_latency))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Request types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ValuationParams {
    #[serde(default)]
    pub q: String,
    pub model: Option<String>,
    pub size: Option<String>,
    pub condition: Option<String>,
    pub color: Option<String>,
    /// Decimal text, e.g. `85.00`.
    pub asking: Option<String>,
    /// ISO code of the asking price; defaults to the valuation currency.
    pub currency: Option<String>,
}

impl ValuationParams {
    fn query(&self) -> Result<QuerySpec> {
        QuerySpec::from_input(&QueryInput {
            q: self.q.clone(),
            model: self.model.clone(),
            size: self.size.clone(),
            condition: self.condition.clone(),
            color: self.color.clone(),
        })
    }

    /// Asking prices are compared in the valuation currency only; anything
    /// else is rejected here, before a valuation is resolved.
    fn asking(&self, valuation_currency: Currency) -> Result<Option<AskingPrice>> {
        let Some(raw) = self.asking.as_deref().map(str::trim).filter(|s| !s.is_empty()) else {
            return Ok(None);
        };
        let amount = Decimal::from_str(raw)
            .map_err(|_| AppError::validation("asking", format!("'{raw}' is not a number")))?;
        if amount.is_sign_negative() {
            return Err(AppError::validation("asking", "must not be negative"));
        }
        let currency = match self.currency.as_deref() {
            Some(code) => Currency::from_code(code)
                .ok_or_else(|| AppError::validation("currency", format!("'{code}' is not supported")))?,
            None => valuation_currency,
        };
        if currency != valuation_currency {
            return Err(AppError::validation(
                "currency",
                format!("asking price is in {currency}, valuations are in {valuation_currency}"),
            ));
        }
        Ok(Some(AskingPrice { amount, currency }))
    }
}

#[derive(Debug, Deserialize)]
pub struct HistoryParams {
    #[serde(default)]
    pub q: String,
    pub model: Option<String>,
    pub size: Option<String>,
    pub condition: Option<String>,
    pub color: Option<String>,
    pub limit: Option<u32>,
}

const DEFAULT_HISTORY_LIMIT: u32 = 20;
const MAX_HISTORY_LIMIT: u32 = 200;

#[derive(Debug, Deserialize)]
pub struct SeedRequest {
    pub query: QueryInput,
    pub listings: Vec<RawListing>,
}

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

/// What callers see of a valuation. Comps, spread and stats stay on the
/// diagnostics surface.
#[derive(Debug, Serialize)]
pub struct ValuationResponse {
    pub casp: Decimal,
    pub currency: Currency,
    pub accuracy_pct: u8,
    pub accuracy_label: &'static str,
    pub sample_size: usize,
    pub stale: bool,
    pub computed_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deal_score: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deal_label: Option<DealLabel>,
}

impl ValuationResponse {
    fn new(v: &Valuation, stale: bool) -> Self {
        Self {
            casp: v.casp,
            currency: v.currency,
            accuracy_pct: v.accuracy_pct,
            accuracy_label: v.accuracy_label(),
            sample_size: v.sample_size,
            stale,
            computed_at: v.computed_at,
            deal_score: None,
            deal_label: None,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SeedResponse {
    #[serde(flatten)]
    pub valuation: ValuationResponse,
    pub rejected: Option<RejectStats>,
}

#[derive(Debug, Serialize)]
pub struct WatchlistEntryResponse {
    pub id: EntryId,
    pub display_text: String,
    pub filters: std::collections::BTreeMap<FilterKey, String>,
    pub fingerprint: Fingerprint,
    pub created_at: DateTime<Utc>,
    pub last_refreshed_at: Option<DateTime<Utc>>,
    pub last_valuation: Option<ValuationResponse>,
}

impl WatchlistEntryResponse {
    fn new(entry: WatchlistEntry, max_age: Duration) -> Self {
        Self {
            last_valuation: entry
                .last_valuation
                .as_ref()
                .map(|v| ValuationResponse::new(v, expired(v, max_age))),
            id: entry.id,
            display_text: entry.display_text,
            filters: entry.filters,
            fingerprint: entry.fingerprint,
            created_at: entry.created_at,
            last_refreshed_at: entry.last_refreshed_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub cached_valuations: usize,
    #[serde(flatten)]
    pub counters: HealthSnapshot,
}

#[derive(Debug, Serialize)]
pub struct LatencyResponse {
    pub p50_ms: Option<u64>,
    pub p95_ms: Option<u64>,
    pub p99_ms: Option<u64>,
    pub sample_count: u64,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn get_health(State(state): State<ApiState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        cached_valuations: state.orchestrator.cache().len(),
        counters: state.health.snapshot(),
    })
}

async fn get_valuation(
    State(state): State<ApiState>,
    Query(params): Query<ValuationParams>,
) -> Result<Json<ValuationResponse>> {
    let query = params.query()?;
    let asking = params.asking(state.orchestrator.settings().currency)?;

    let outcome = state.orchestrator.resolve(&query, state.max_age).await?;
    let mut response = ValuationResponse::new(&outcome.valuation, outcome.is_stale());
    if let Some(deal) = assess(&outcome.valuation, asking, &state.thresholds)? {
        response.deal_score = Some(deal.score);
        response.deal_label = Some(deal.label);
    }
    Ok(Json(response))
}

/// Full artifact for a query, read-through like GET /valuation.
async fn get_valuation_diagnostics(
    State(state): State<ApiState>,
    Query(params): Query<ValuationParams>,
) -> Result<Json<RefreshOutcome>> {
    let query = params.query()?;
    Ok(Json(state.orchestrator.resolve(&query, state.max_age).await?))
}

/// Committed estimates for a query, newest first. Never triggers a refresh.
async fn get_valuation_history(
    State(state): State<ApiState>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<Vec<EstimateRecord>>> {
    let query = QuerySpec::from_input(&QueryInput {
        q: params.q,
        model: params.model,
        size: params.size,
        condition: params.condition,
        color: params.color,
    })?;
    let limit = params.limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
    if limit == 0 || limit > MAX_HISTORY_LIMIT {
        return Err(AppError::validation("limit", format!("must be between 1 and {MAX_HISTORY_LIMIT}")));
    }
    Ok(Json(state.orchestrator.cache().history(&query.fingerprint(), limit).await?))
}

async fn post_valuation_refresh(
    State(state): State<ApiState>,
    Json(input): Json<QueryInput>,
) -> Result<Json<RefreshOutcome>> {
    let query = QuerySpec::from_input(&input)?;
    Ok(Json(state.orchestrator.refresh(&query).await?))
}

async fn post_seed(
    State(state): State<ApiState>,
    Json(req): Json<SeedRequest>,
) -> Result<Json<SeedResponse>> {
    let query = QuerySpec::from_input(&req.query)?;
    let outcome = state.orchestrator.seed(&query, &req.listings).await?;
    Ok(Json(SeedResponse {
        valuation: ValuationResponse::new(&outcome.valuation, false),
        rejected: outcome.rejected,
    }))
}

async fn get_watchlist(
    State(state): State<ApiState>,
    Path(owner): Path<String>,
) -> Result<Json<Vec<WatchlistEntryResponse>>> {
    let entries = state.registry.list(&owner).await?;
    Ok(Json(
        entries
            .into_iter()
            .map(|e| WatchlistEntryResponse::new(e, state.max_age))
            .collect(),
    ))
}

async fn post_watchlist(
    State(state): State<ApiState>,
    Path(owner): Path<String>,
    Json(input): Json<QueryInput>,
) -> Result<(StatusCode, Json<WatchlistEntryResponse>)> {
    let entry = state.registry.add(&owner, &input).await?;
    Ok((StatusCode::CREATED, Json(WatchlistEntryResponse::new(entry, state.max_age))))
}

async fn delete_watchlist_entry(
    State(state): State<ApiState>,
    Path((owner, id)): Path<(String, EntryId)>,
) -> Result<StatusCode> {
    state.registry.remove(&owner, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn post_watchlist_entry_refresh(
    State(state): State<ApiState>,
    Path((owner, id)): Path<(String, EntryId)>,
) -> Result<Json<ValuationResponse>> {
    let outcome = state.refresher.refresh_one(&owner, id).await?;
    let stale = !matches!(outcome.status, RefreshStatus::Refreshed | RefreshStatus::Superseded);
    Ok(Json(ValuationResponse::new(&outcome.valuation, stale)))
}

async fn post_watchlist_refresh_all(State(state): State<ApiState>) -> Result<Json<SweepReport>> {
    Ok(Json(state.refresher.refresh_all().await?))
}

async fn get_stats_latency(State(state): State<ApiState>) -> Json<LatencyResponse> {
    let (p50_ms, p95_ms, p99_ms) = state.latency.percentiles();
    Json(LatencyResponse { p50_ms, p95_ms, p99_ms, sample_count: state.latency.len() })
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;
    use serde_json::{json, Value};

    use super::*;
    use crate::refresh::RefreshSettings;
    use crate::state::ValuationCache;
    use crate::testkit::{memory_store, ScriptedSource};

    struct TestApi {
        base: String,
        http: reqwest::Client,
        source: Arc<ScriptedSource>,
    }

    async fn spawn_api(source: ScriptedSource) -> TestApi {
        let store = memory_store().await;
        let source = Arc::new(source);
        let health = Arc::new(HealthState::new());
        let latency = Arc::new(LatencyStats::new().unwrap());
        let cache = ValuationCache::new(store.clone());
        let registry = WatchlistRegistry::new(store);
        let orchestrator = RefreshOrchestrator::new(
            source.clone(),
            cache,
            RefreshSettings { acquisition_timeout: Duration::from_secs(2), ..RefreshSettings::default() },
            health.clone(),
            latency.clone(),
        );
        let refresher = WatchlistRefresher::new(
            orchestrator.clone(),
            registry.clone(),
            health.clone(),
            Duration::from_secs(900),
            2,
        );
        let state = ApiState {
            orchestrator,
            registry,
            refresher,
            health,
            latency,
            max_age: Duration::from_secs(3_600),
            thresholds: DealThresholds::default(),
        };

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(state)).await.unwrap();
        });
        TestApi { base: format!("http://{addr}"), http: reqwest::Client::new(), source }
    }

    impl TestApi {
        async fn get(&self, path: &str, query: &[(&str, &str)]) -> (StatusCode, Value) {
            let resp = self.http.get(format!("{}{path}", self.base)).query(query).send().await.unwrap();
            read(resp).await
        }

        async fn post(&self, path: &str, body: Value) -> (StatusCode, Value) {
            let resp = self.http.post(format!("{}{path}", self.base)).json(&body).send().await.unwrap();
            read(resp).await
        }

        async fn delete(&self, path: &str) -> StatusCode {
            let resp = self.http.delete(format!("{}{path}", self.base)).send().await.unwrap();
            StatusCode::from_u16(resp.status().as_u16()).unwrap()
        }
    }

    async fn read(resp: reqwest::Response) -> (StatusCode, Value) {
        let status = StatusCode::from_u16(resp.status().as_u16()).unwrap();
        let body = resp.json::<Value>().await.unwrap_or(Value::Null);
        (status, body)
    }

    fn decimal(v: &Value) -> Decimal {
        Decimal::from_str(v.as_str().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn public_valuation_hides_comp_details() {
        let api = spawn_api(ScriptedSource::listings(&["100", "110", "90", "105", "95"])).await;

        let (status, body) = api.get("/valuation", &[("q", "Carhartt J01")]).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(decimal(&body["casp"]), dec!(100));
        assert_eq!(body["currency"], "USD");
        assert_eq!(body["sample_size"], 5);
        assert_eq!(body["stale"], false);
        assert!(body["accuracy_label"].is_string());
        for hidden in ["comps_used", "spread", "stats", "deal_score"] {
            assert!(body.get(hidden).is_none(), "{hidden} leaked");
        }

        // Second read is a cache hit.
        api.get("/valuation", &[("q", "carhartt  j01")]).await;
        assert_eq!(api.source.calls(), 1);
    }

    #[tokio::test]
    async fn asking_price_adds_a_deal_score() {
        let api = spawn_api(ScriptedSource::listings(&["100", "100", "100"])).await;

        let (status, body) = api.get("/valuation", &[("q", "Carhartt J01"), ("asking", "60")]).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["deal_score"], 5);
        assert_eq!(body["deal_label"], "Great");
    }

    #[tokio::test]
    async fn invalid_inputs_are_rejected_before_acquisition() {
        let api = spawn_api(ScriptedSource::listings(&["100"])).await;

        let (status, body) = api.get("/valuation", &[("q", "Carhartt J01"), ("asking", "-5")]).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["field"], "asking");

        let (status, body) =
            api.get("/valuation", &[("q", "Carhartt J01"), ("asking", "50"), ("currency", "JPY")]).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["field"], "currency");

        let (status, body) = api.get("/valuation", &[("q", "   ")]).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["field"], "q");

        assert_eq!(api.source.calls(), 0);
    }

    #[tokio::test]
    async fn asking_in_another_currency_is_a_validation_error() {
        let api = spawn_api(ScriptedSource::listings(&["100"])).await;
        let (status, body) =
            api.get("/valuation", &[("q", "Carhartt J01"), ("asking", "50"), ("currency", "CAD")]).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["field"], "currency");
        // Rejected up front: a cache miss did not trigger an acquisition.
        assert_eq!(api.source.calls(), 0);
    }

    #[tokio::test]
    async fn absurd_asking_price_is_a_bad_request() {
        let api = spawn_api(ScriptedSource::listings(&["0.01", "0.01"])).await;
        let huge = Decimal::MAX.to_string();
        let (status, body) = api.get("/valuation", &[("q", "Carhartt J01"), ("asking", huge.as_str())]).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["field"], "asking");
    }

    #[tokio::test]
    async fn history_lists_each_committed_estimate() {
        let api = spawn_api(ScriptedSource::listings(&["100", "110"])).await;
        api.post("/valuation/refresh", json!({ "q": "Carhartt J01" })).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        let seed = json!({
            "query": { "q": "carhartt j01" },
            "listings": [{ "source": "manual", "listing_id": "s", "title": "Carhartt J01 Jacket", "price": "140" }]
        });
        api.post("/comps/seed", seed).await;

        let (status, history) = api.get("/valuation/history", &[("q", "Carhartt J01")]).await;
        assert_eq!(status, StatusCode::OK);
        let history = history.as_array().unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0]["source"], "seeded");
        assert_eq!(history[0]["comps"].as_array().unwrap().len(), 1);
        assert_eq!(history[1]["source"], "live");
        assert_eq!(history[1]["comps"].as_array().unwrap().len(), 2);

        let (status, body) = api.get("/valuation/history", &[("q", "Carhartt J01"), ("limit", "0")]).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["field"], "limit");
        assert_eq!(api.source.calls(), 1);
    }

    #[tokio::test]
    async fn seeded_comps_serve_without_acquisition() {
        let api = spawn_api(ScriptedSource::listings(&["999"])).await;
        let seed = json!({
            "query": { "q": "Carhartt J01" },
            "listings": [
                { "source": "manual", "listing_id": "a", "title": "Carhartt J01 Jacket", "price": "120" },
                { "source": "manual", "listing_id": "b", "title": "Carhartt J01 Jacket", "price": 130 },
                { "source": "manual", "listing_id": "c", "title": "Carhartt J01 Jacket", "price": "0" }
            ]
        });

        let (status, body) = api.post("/comps/seed", seed).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(decimal(&body["casp"]), dec!(125));
        assert_eq!(body["rejected"]["non_positive_price"], 1);

        let (_, diag) = api.get("/valuation/diagnostics", &[("q", "Carhartt J01")]).await;
        assert_eq!(diag["status"], "cached");
        assert_eq!(diag["valuation"]["source"], "seeded");
        assert_eq!(diag["valuation"]["comps_used"].as_array().unwrap().len(), 2);
        assert_eq!(api.source.calls(), 0);
    }

    #[tokio::test]
    async fn seeding_nothing_is_a_bad_request() {
        let api = spawn_api(ScriptedSource::listings(&["100"])).await;
        let (status, body) = api.post("/comps/seed", json!({ "query": { "q": "x" }, "listings": [] })).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["field"], "listings");
    }

    #[tokio::test]
    async fn watchlist_lifecycle() {
        let api = spawn_api(ScriptedSource::listings(&["100", "110", "90"])).await;

        let (status, entry) =
            api.post("/owners/alice/watchlist", json!({ "q": "Carhartt  J01", "size": "L" })).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(entry["display_text"], "Carhartt  J01");
        assert_eq!(entry["filters"]["size"], "l");
        assert!(entry["last_valuation"].is_null());
        let id = entry["id"].as_i64().unwrap();

        let (_, list) = api.get("/owners/alice/watchlist", &[]).await;
        assert_eq!(list.as_array().unwrap().len(), 1);
        let (_, other) = api.get("/owners/bob/watchlist", &[]).await;
        assert!(other.as_array().unwrap().is_empty());

        let (status, refreshed) = api.post(&format!("/owners/alice/watchlist/{id}/refresh"), json!({})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(decimal(&refreshed["casp"]), dec!(100));
        let (_, list) = api.get("/owners/alice/watchlist", &[]).await;
        assert!(list[0]["last_refreshed_at"].is_string());
        assert_eq!(decimal(&list[0]["last_valuation"]["casp"]), dec!(100));

        assert_eq!(api.delete(&format!("/owners/bob/watchlist/{id}")).await, StatusCode::NOT_FOUND);
        assert_eq!(api.delete(&format!("/owners/alice/watchlist/{id}")).await, StatusCode::NO_CONTENT);
        assert_eq!(api.delete(&format!("/owners/alice/watchlist/{id}")).await, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn refresh_all_reports_and_health_counts() {
        let api = spawn_api(ScriptedSource::listings(&["100", "110"])).await;
        api.post("/owners/alice/watchlist", json!({ "q": "Carhartt J01" })).await;
        api.post("/owners/bob/watchlist", json!({ "q": "Carhartt J97" })).await;

        let (status, report) = api.post("/watchlist/refresh-all", json!({})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(report["entries"], 2);
        // J97 titles do not exist in the scripted comps; every listing is rejected.
        assert_eq!(report["refreshed"], 1);
        assert_eq!(report["failed"], 1);

        let (_, health) = api.get("/health", &[]).await;
        assert_eq!(health["status"], "ok");
        assert_eq!(health["cached_valuations"], 1);
        assert_eq!(health["sweeps_completed"], 1);
        assert_eq!(health["entry_refresh_failures"], 1);

        let (_, latency) = api.get("/stats/latency", &[]).await;
        assert_eq!(latency["sample_count"], 2);
    }
}
