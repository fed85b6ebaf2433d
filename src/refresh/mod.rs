pub mod sweep;

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::future::{BoxFuture, Shared};
use futures_util::FutureExt;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::api::health::HealthState;
use crate::api::latency::LatencyStats;
use crate::config::{Config, ValuationPolicy, ACQUISITION_TIMEOUT_SECS};
use crate::error::{AcquisitionError, AppError, Result};
use crate::fetcher::CompSource;
use crate::normalizer::{normalize, RejectStats};
use crate::query::{Fingerprint, QuerySpec};
use crate::scorer::estimate;
use crate::state::valuation_cache::{expired, CommitOutcome, ValuationCache};
use crate::types::{now_ms, Currency, RawListing, Valuation, ValuationSource};

pub use sweep::{SweepReport, WatchlistRefresher};

/// How a caller's valuation was obtained.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RefreshStatus {
    /// Fresh cache hit, nothing recomputed.
    Cached,
    /// Recomputed and committed.
    Refreshed,
    /// Recomputed, but a fresher artifact was committed first; that one is returned.
    Superseded,
    /// No fresh artifact available; the cached one is returned.
    Stale { reason: String },
    /// Nothing cached and nothing acquired; zero-confidence result.
    Unavailable { reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct RefreshOutcome {
    pub fingerprint: Fingerprint,
    pub valuation: Valuation,
    #[serde(flatten)]
    pub status: RefreshStatus,
    /// Normalizer rejections, when comps were processed.
    pub rejected: Option<RejectStats>,
}

impl RefreshOutcome {
    /// True when the cache now holds an artifact computed by (or after) this refresh.
    pub fn advanced(&self) -> bool {
        matches!(self.status, RefreshStatus::Refreshed | RefreshStatus::Superseded)
    }

    pub fn is_stale(&self) -> bool {
        matches!(self.status, RefreshStatus::Stale { .. })
    }
}

#[derive(Debug, Clone)]
pub struct RefreshSettings {
    pub currency: Currency,
    pub acquisition_timeout: Duration,
    pub policy: ValuationPolicy,
}

impl RefreshSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            currency: cfg.currency,
            acquisition_timeout: cfg.acquisition_timeout,
            policy: cfg.policy.clone(),
        }
    }
}

impl Default for RefreshSettings {
    fn default() -> Self {
        Self {
            currency: Currency::Usd,
            acquisition_timeout: Duration::from_secs(ACQUISITION_TIMEOUT_SECS),
            policy: ValuationPolicy::default(),
        }
    }
}

/// Failure carried to every caller joined on one refresh. The shared output
/// must be `Clone`, which `AppError` is not.
#[derive(Debug, Clone)]
enum RefreshFailure {
    Persistence(String),
    Internal(String),
}

impl From<AppError> for RefreshFailure {
    fn from(e: AppError) -> Self {
        match e {
            AppError::Persistence(msg) => RefreshFailure::Persistence(msg),
            other => RefreshFailure::Internal(other.to_string()),
        }
    }
}

impl From<RefreshFailure> for AppError {
    fn from(f: RefreshFailure) -> Self {
        match f {
            RefreshFailure::Persistence(msg) => AppError::Persistence(msg),
            RefreshFailure::Internal(msg) => AppError::Internal(msg),
        }
    }
}

/// In-flight refresh shared by every caller for the same fingerprint.
type SharedRefresh = Shared<BoxFuture<'static, std::result::Result<RefreshOutcome, RefreshFailure>>>;

/// Held by a running refresh task. Dropping it, on completion or while a
/// panic unwinds, returns the fingerprint to IDLE.
struct InFlightGuard {
    orchestrator: Arc<RefreshOrchestrator>,
    fingerprint: Fingerprint,
}

impl InFlightGuard {
    fn enter(orchestrator: Arc<RefreshOrchestrator>, fingerprint: Fingerprint) -> Self {
        orchestrator.health.refresh_started();
        Self { orchestrator, fingerprint }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.orchestrator.in_flight.remove(&self.fingerprint);
        self.orchestrator.health.refresh_finished();
    }
}

/// Drives recomputation of valuations: on demand, read-through, and for the
/// watchlist sweep.
///
/// Per fingerprint the state is IDLE (no entry in `in_flight`) or REFRESHING
/// (an entry whose task is running). Each refresh runs as its own task, so a
/// caller that goes away never cancels it for the others.
pub struct RefreshOrchestrator {
    source: Arc<dyn CompSource>,
    cache: Arc<ValuationCache>,
    settings: RefreshSettings,
    in_flight: DashMap<Fingerprint, SharedRefresh>,
    health: Arc<HealthState>,
    latency: Arc<LatencyStats>,
}

impl RefreshOrchestrator {
    pub fn new(
        source: Arc<dyn CompSource>,
        cache: Arc<ValuationCache>,
        settings: RefreshSettings,
        health: Arc<HealthState>,
        latency: Arc<LatencyStats>,
    ) -> Arc<Self> {
        Arc::new(Self {
            source,
            cache,
            settings,
            in_flight: DashMap::new(),
            health,
            latency,
        })
    }

    pub fn cache(&self) -> &Arc<ValuationCache> {
        &self.cache
    }

    pub fn settings(&self) -> &RefreshSettings {
        &self.settings
    }

    /// Recompute the valuation for `query`, joining a refresh already running
    /// for the same fingerprint. Acquisition failures degrade to the cached
    /// artifact; a persistence failure, or a task that died, is an error.
    pub async fn refresh(self: &Arc<Self>, query: &QuerySpec) -> Result<RefreshOutcome> {
        let fp = query.fingerprint();

        let shared = match self.in_flight.entry(fp.clone()) {
            Entry::Occupied(o) => {
                self.health.inc_coalesced_joins();
                debug!(fingerprint = %fp, "Joining in-flight refresh");
                o.get().clone()
            }
            Entry::Vacant(v) => {
                let this = Arc::clone(self);
                let task_query = query.clone();
                let task_fp = fp.clone();
                let handle = tokio::spawn(async move {
                    let _guard = InFlightGuard::enter(Arc::clone(&this), task_fp.clone());
                    this.acquire_and_commit(&task_query, &task_fp).await.map_err(RefreshFailure::from)
                });
                let shared = async move {
                    handle.await.unwrap_or_else(|e| {
                        Err(RefreshFailure::Internal(format!("refresh task ended without an outcome: {e}")))
                    })
                }
                .boxed()
                .shared();
                v.insert(shared.clone());
                shared
            }
        };

        shared.await.map_err(AppError::from)
    }

    /// Read-through lookup. A fresh hit is returned as is; a stale hit is
    /// returned immediately while a refresh runs in the background; a miss
    /// waits for a refresh.
    pub async fn resolve(self: &Arc<Self>, query: &QuerySpec, max_age: Duration) -> Result<RefreshOutcome> {
        let fp = query.fingerprint();
        match self.cache.get(&fp) {
            Some(valuation) if !expired(&valuation, max_age) => Ok(RefreshOutcome {
                fingerprint: fp,
                valuation,
                status: RefreshStatus::Cached,
                rejected: None,
            }),
            Some(valuation) => {
                let this = Arc::clone(self);
                let query = query.clone();
                tokio::spawn(async move {
                    if let Err(e) = this.refresh(&query).await {
                        warn!(fingerprint = %query.fingerprint(), "Background refresh failed: {e}");
                    }
                });
                Ok(RefreshOutcome {
                    fingerprint: fp,
                    valuation,
                    status: RefreshStatus::Stale { reason: "expired; refresh scheduled".to_string() },
                    rejected: None,
                })
            }
            None => self.refresh(query).await,
        }
    }

    /// Value a caller-supplied comp set without acquisition and commit it the
    /// same way a refresh would.
    pub async fn seed(&self, query: &QuerySpec, listings: &[RawListing]) -> Result<RefreshOutcome> {
        if listings.is_empty() {
            return Err(AppError::validation("listings", "at least one listing is required"));
        }
        let fp = query.fingerprint();
        let outcome = self.commit_listings(query, &fp, listings, now_ms(), ValuationSource::Seeded).await?;
        match outcome {
            Some(outcome) => Ok(outcome),
            None => Err(AppError::validation(
                "listings",
                format!("none of the {} listings survived normalization", listings.len()),
            )),
        }
    }

    async fn acquire_and_commit(&self, query: &QuerySpec, fp: &Fingerprint) -> Result<RefreshOutcome> {
        // Linearization stamp: the moment acquisition began.
        let started_at = now_ms();
        let t0 = Instant::now();
        let fetched = tokio::time::timeout(self.settings.acquisition_timeout, self.source.fetch_listings(query)).await;
        self.latency.record(t0.elapsed());

        let raws = match fetched {
            Ok(Ok(raws)) => raws,
            Ok(Err(e)) => return Ok(self.fallback(fp, &e.to_string())),
            Err(_) => return Ok(self.fallback(fp, &AcquisitionError::Timeout.to_string())),
        };

        match self.commit_listings(query, fp, &raws, started_at, ValuationSource::Live).await? {
            Some(outcome) => Ok(outcome),
            None => Ok(self.fallback(fp, &format!("all {} acquired listings were rejected", raws.len()))),
        }
    }

    /// Normalize, estimate and commit. `None` when no comp survived normalization;
    /// an empty valuation is never committed over a real one.
    async fn commit_listings(
        &self,
        query: &QuerySpec,
        fp: &Fingerprint,
        raws: &[RawListing],
        computed_at: chrono::DateTime<chrono::Utc>,
        source: ValuationSource,
    ) -> Result<Option<RefreshOutcome>> {
        let policy = &self.settings.policy;
        let normalized = normalize(raws, query, &policy.normalizer, self.settings.currency);
        if normalized.comps.is_empty() {
            return Ok(None);
        }
        let valuation = estimate(&normalized.comps, self.settings.currency, &policy.estimator, computed_at, source);

        let outcome = match self.cache.put(fp, valuation.clone(), &normalized.comps).await? {
            CommitOutcome::Committed => {
                info!(
                    fingerprint = %fp,
                    casp = %valuation.casp,
                    accuracy_pct = valuation.accuracy_pct,
                    sample_size = valuation.sample_size,
                    source = %source,
                    "Valuation committed",
                );
                RefreshOutcome {
                    fingerprint: fp.clone(),
                    valuation,
                    status: RefreshStatus::Refreshed,
                    rejected: Some(normalized.rejected),
                }
            }
            CommitOutcome::Superseded(fresher) => {
                debug!(fingerprint = %fp, "Refresh superseded by a fresher valuation");
                RefreshOutcome {
                    fingerprint: fp.clone(),
                    valuation: fresher,
                    status: RefreshStatus::Superseded,
                    rejected: Some(normalized.rejected),
                }
            }
        };
        Ok(Some(outcome))
    }

    /// Acquisition failed: last known value marked stale, or zero confidence.
    fn fallback(&self, fp: &Fingerprint, reason: &str) -> RefreshOutcome {
        self.health.inc_acquisition_failures();
        warn!(fingerprint = %fp, "Comp acquisition failed, serving cached valuation: {reason}");
        match self.cache.get(fp) {
            Some(valuation) => RefreshOutcome {
                fingerprint: fp.clone(),
                valuation,
                status: RefreshStatus::Stale { reason: reason.to_string() },
                rejected: None,
            },
            None => RefreshOutcome {
                fingerprint: fp.clone(),
                valuation: Valuation::empty(self.settings.currency, now_ms()),
                status: RefreshStatus::Unavailable { reason: reason.to_string() },
                rejected: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use futures_util::future::join_all;
    use rust_decimal_macros::dec;

    use super::*;
    use crate::testkit::{listings, memory_store, query, valuation_at, Script, ScriptedSource};

    struct Harness {
        orchestrator: Arc<RefreshOrchestrator>,
        source: Arc<ScriptedSource>,
        cache: Arc<ValuationCache>,
        health: Arc<HealthState>,
    }

    async fn harness(source: ScriptedSource, timeout: Duration) -> Harness {
        let source = Arc::new(source);
        let cache = ValuationCache::new(memory_store().await);
        let health = Arc::new(HealthState::new());
        let settings = RefreshSettings { acquisition_timeout: timeout, ..RefreshSettings::default() };
        let orchestrator = RefreshOrchestrator::new(
            source.clone(),
            cache.clone(),
            settings,
            health.clone(),
            Arc::new(LatencyStats::new().unwrap()),
        );
        Harness { orchestrator, source, cache, health }
    }

    #[tokio::test]
    async fn refresh_commits_a_live_valuation() {
        let h = harness(ScriptedSource::listings(&["100", "110", "90", "105", "95"]), Duration::from_secs(1)).await;
        let q = query("Carhartt J01");

        let out = h.orchestrator.refresh(&q).await.unwrap();
        assert_eq!(out.status, RefreshStatus::Refreshed);
        assert_eq!(out.valuation.casp, dec!(100));
        assert_eq!(out.valuation.source, ValuationSource::Live);
        assert_eq!(h.cache.get(&q.fingerprint()), Some(out.valuation));
    }

    #[tokio::test]
    async fn concurrent_refreshes_share_one_acquisition() {
        let source = ScriptedSource::listings(&["100", "110", "90", "105", "95"]).with_delay(Duration::from_millis(100));
        let h = harness(source, Duration::from_secs(2)).await;
        let q = query("Carhartt J01");

        let outcomes = join_all((0..5).map(|_| h.orchestrator.refresh(&q))).await;

        assert_eq!(h.source.calls(), 1);
        assert_eq!(h.health.coalesced_joins(), 4);
        let first = outcomes[0].as_ref().unwrap().valuation.clone();
        for out in &outcomes {
            assert_eq!(out.as_ref().unwrap().valuation, first);
        }
        assert_eq!(h.cache.get(&q.fingerprint()), Some(first));

        // Back to IDLE: the next refresh acquires again.
        h.orchestrator.refresh(&q).await.unwrap();
        assert_eq!(h.source.calls(), 2);
    }

    #[tokio::test]
    async fn timeout_serves_cached_artifact_unchanged() {
        let h = harness(ScriptedSource::new(Script::Hang), Duration::from_millis(50)).await;
        let q = query("Carhartt J01");
        let cached = valuation_at(dec!(100), now_ms().timestamp_millis() - 60_000);
        h.cache.put(&q.fingerprint(), cached.clone(), &[]).await.unwrap();

        let out = h.orchestrator.refresh(&q).await.unwrap();
        assert!(out.is_stale());
        assert_eq!(out.valuation, cached);
        assert_eq!(h.cache.get(&q.fingerprint()), Some(cached));
        assert_eq!(h.health.acquisition_failures(), 1);
    }

    #[tokio::test]
    async fn failure_without_cache_is_zero_confidence() {
        let h = harness(ScriptedSource::new(Script::Fail(AcquisitionError::NotFound)), Duration::from_secs(1)).await;
        let q = query("Carhartt J01");

        let out = h.orchestrator.refresh(&q).await.unwrap();
        assert!(matches!(out.status, RefreshStatus::Unavailable { .. }));
        assert_eq!(out.valuation.sample_size, 0);
        assert_eq!(out.valuation.accuracy_pct, 0);
        assert!(h.cache.get(&q.fingerprint()).is_none());
    }

    #[tokio::test]
    async fn fully_rejected_acquisition_keeps_the_cache() {
        let h = harness(ScriptedSource::listings(&["0", "free", "-3"]), Duration::from_secs(1)).await;
        let q = query("Carhartt J01");
        let cached = valuation_at(dec!(100), now_ms().timestamp_millis() - 60_000);
        h.cache.put(&q.fingerprint(), cached.clone(), &[]).await.unwrap();

        let out = h.orchestrator.refresh(&q).await.unwrap();
        assert!(out.is_stale());
        assert_eq!(h.cache.get(&q.fingerprint()), Some(cached));
    }

    #[tokio::test]
    async fn slow_refresh_does_not_clobber_a_newer_commit() {
        let source = ScriptedSource::listings(&["200", "210", "190"]).with_delay(Duration::from_millis(200));
        let h = harness(source, Duration::from_secs(2)).await;
        let q = query("Carhartt J01");

        let slow = {
            let o = h.orchestrator.clone();
            let q = q.clone();
            tokio::spawn(async move { o.refresh(&q).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        // Seeded after the live refresh started: newer computed_at.
        let seeded = h.orchestrator.seed(&q, &listings(&["100", "100", "100"])).await.unwrap();
        assert_eq!(seeded.status, RefreshStatus::Refreshed);

        let late = slow.await.unwrap().unwrap();
        assert_eq!(late.status, RefreshStatus::Superseded);
        assert_eq!(late.valuation.casp, dec!(100));
        assert_eq!(h.cache.get(&q.fingerprint()).unwrap().casp, dec!(100));
    }

    #[tokio::test]
    async fn resolve_serves_fresh_and_stale_hits_from_cache() {
        let source = ScriptedSource::listings(&["150", "150"]);
        let h = harness(source, Duration::from_secs(1)).await;
        let q = query("Carhartt J01");
        let old = valuation_at(dec!(100), now_ms().timestamp_millis() - 120_000);
        h.cache.put(&q.fingerprint(), old.clone(), &[]).await.unwrap();

        let fresh_enough = h.orchestrator.resolve(&q, Duration::from_secs(3_600)).await.unwrap();
        assert_eq!(fresh_enough.status, RefreshStatus::Cached);
        assert_eq!(h.source.calls(), 0);

        let stale = h.orchestrator.resolve(&q, Duration::from_secs(60)).await.unwrap();
        assert!(stale.is_stale());
        assert_eq!(stale.valuation, old);

        // The background refresh lands shortly after.
        for _ in 0..50 {
            if h.cache.get(&q.fingerprint()).map(|v| v.casp) == Some(dec!(150)) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(h.cache.get(&q.fingerprint()).unwrap().casp, dec!(150));
        assert_eq!(h.source.calls(), 1);
    }

    #[tokio::test]
    async fn resolve_miss_waits_for_a_refresh() {
        let h = harness(ScriptedSource::listings(&["80", "90"]), Duration::from_secs(1)).await;
        let out = h.orchestrator.resolve(&query("Carhartt J01"), Duration::from_secs(60)).await.unwrap();
        assert_eq!(out.status, RefreshStatus::Refreshed);
        assert_eq!(out.valuation.casp, dec!(85));
    }

    #[tokio::test]
    async fn seed_requires_usable_listings() {
        let h = harness(ScriptedSource::new(Script::Hang), Duration::from_secs(1)).await;
        let q = query("Carhartt J01");

        assert!(matches!(
            h.orchestrator.seed(&q, &[]).await,
            Err(AppError::Validation { field: "listings", .. })
        ));
        assert!(matches!(
            h.orchestrator.seed(&q, &listings(&["0"])).await,
            Err(AppError::Validation { field: "listings", .. })
        ));

        let out = h.orchestrator.seed(&q, &listings(&["120", "0"])).await.unwrap();
        assert_eq!(out.valuation.source, ValuationSource::Seeded);
        assert_eq!(out.valuation.sample_size, 1);
        assert_eq!(out.rejected.unwrap().non_positive_price, 1);
        assert_eq!(h.source.calls(), 0);
    }

    #[tokio::test]
    async fn crashed_refresh_returns_to_idle() {
        let source = ScriptedSource::new(Script::Panic);
        let h = harness(source, Duration::from_secs(1)).await;
        let q = query("Carhartt J01");

        let err = h.orchestrator.refresh(&q).await.unwrap_err();
        assert!(matches!(err, AppError::Internal(_)), "got {err:?}");
        assert_eq!(h.health.snapshot().refreshes_in_flight, 0);

        h.source.respond("Carhartt J01", Script::Listings(listings(&["100", "110"])));
        let out = h.orchestrator.refresh(&q).await.unwrap();
        assert_eq!(out.status, RefreshStatus::Refreshed);
        assert_eq!(out.valuation.casp, dec!(105));
        assert_eq!(h.source.calls(), 2);
    }

    #[tokio::test]
    async fn persistence_failure_surfaces() {
        let store = memory_store().await;
        let cache = ValuationCache::new(store.clone());
        let orchestrator = RefreshOrchestrator::new(
            Arc::new(ScriptedSource::listings(&["100"])),
            cache.clone(),
            RefreshSettings::default(),
            Arc::new(HealthState::new()),
            Arc::new(LatencyStats::new().unwrap()),
        );
        store.close().await;

        let err = orchestrator.refresh(&query("Carhartt J01")).await.unwrap_err();
        assert!(matches!(err, AppError::Persistence(_)));
        assert_eq!(cache.len(), 0);
    }
}
