//! Shared fakes and builders for unit tests.
//!
//! - [`ScriptedSource`]: a [`CompSource`] with per-query responses, artificial
//!   latency, failure modes and call accounting.
//! - Listing, query and valuation builders.
//! - [`memory_store`]: migrated in-memory SQLite.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::db::models::from_millis;
use crate::db::SqliteStore;
use crate::error::AcquisitionError;
use crate::fetcher::CompSource;
use crate::query::{QueryInput, QuerySpec};
use crate::types::{
    Comp, Currency, EbayListing, ManualListing, Marketplace, RawListing, Valuation, ValuationSource,
};

pub async fn memory_store() -> SqliteStore {
    SqliteStore::in_memory().await.unwrap()
}

pub fn query(q: &str) -> QuerySpec {
    QuerySpec::from_input(&QueryInput::text(q)).unwrap()
}

pub fn ebay(title: &str, price: &str, url: &str) -> RawListing {
    RawListing::Ebay(EbayListing {
        title: title.to_string(),
        price: price.to_string(),
        shipping: None,
        url: url.to_string(),
        ended: None,
    })
}

pub fn manual(id: &str, title: &str, price: &str) -> RawListing {
    RawListing::Manual(ManualListing {
        listing_id: id.to_string(),
        title: title.to_string(),
        price: price.to_string(),
        currency: None,
        shipping: None,
        ended_at: None,
    })
}

/// Manual listings for a Carhartt J01, one per price, ids `m-0`, `m-1`, ...
pub fn listings(prices: &[&str]) -> Vec<RawListing> {
    prices
        .iter()
        .enumerate()
        .map(|(i, p)| manual(&format!("m-{i}"), "Carhartt J01 Detroit Jacket", p))
        .collect()
}

/// Normalized USD manual comp.
pub fn comp(id: &str, price: Decimal) -> Comp {
    Comp {
        id: format!("manual:{id}"),
        price,
        shipping: None,
        currency: Currency::Usd,
        ended_at: None,
        source: Marketplace::Manual,
        model_guess: Some("j01".into()),
        size: None,
        raw_title: "Carhartt J01 Detroit Jacket".into(),
    }
}

/// Live USD valuation with a given CASP computed at `ms` epoch millis.
pub fn valuation_at(casp: Decimal, ms: i64) -> Valuation {
    Valuation {
        casp,
        currency: Currency::Usd,
        accuracy_pct: 50,
        sample_size: 5,
        spread: 0.07,
        computed_at: from_millis(ms),
        comps_used: vec!["manual:m-0".into(), "manual:m-1".into()],
        source: ValuationSource::Live,
        stats: None,
    }
}

// ---------------------------------------------------------------------------
// ScriptedSource
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum Script {
    Listings(Vec<RawListing>),
    Fail(AcquisitionError),
    /// Never answers; only a timeout gets the caller out.
    Hang,
    /// Panics inside the refresh task.
    Panic,
}

/// Fake comp source. Responses are looked up by query fingerprint, falling
/// back to the default script.
pub struct ScriptedSource {
    default: Script,
    per_query: Mutex<HashMap<String, Script>>,
    delay: Duration,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedSource {
    pub fn new(default: Script) -> Self {
        Self {
            default,
            per_query: Mutex::new(HashMap::new()),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn listings(prices: &[&str]) -> Self {
        Self::new(Script::Listings(listings(prices)))
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_response(self, q: &str, script: Script) -> Self {
        self.respond(q, script);
        self
    }

    pub fn respond(&self, q: &str, script: Script) {
        let key = query(q).fingerprint().to_string();
        self.per_query.lock().unwrap().insert(key, script);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CompSource for ScriptedSource {
    async fn fetch_listings(
        &self,
        q: &QuerySpec,
    ) -> std::result::Result<Vec<RawListing>, AcquisitionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let script = {
            let per_query = self.per_query.lock().unwrap();
            match per_query.get(q.fingerprint().as_str()) {
                Some(s) => s.clone(),
                None => self.default.clone(),
            }
        };

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let result = match script {
            Script::Listings(l) => Ok(l),
            Script::Fail(e) => Err(e),
            Script::Hang => {
                tokio::time::sleep(Duration::from_secs(3_600)).await;
                Err(AcquisitionError::Timeout)
            }
            Script::Panic => panic!("comp source blew up"),
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}
