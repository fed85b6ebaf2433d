use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::error::{AppError, Result};
use crate::query::{FilterKey, Fingerprint};
use crate::types::{
    Currency, EstimateRecord, Marketplace, PriceStats, RecordedComp, Valuation, ValuationSource, WatchlistEntry,
};

/// Row types for the schema in `migrations/`. Money is decimal text, times are epoch millis.

#[derive(Debug, sqlx::FromRow)]
pub struct ValuationRow {
    pub fingerprint: String,
    pub casp: String,
    pub currency: String,
    pub accuracy_pct: i64,
    pub sample_size: i64,
    pub spread: f64,
    pub computed_at: i64,
    pub comps_used: String,
    pub stats: Option<String>,
    pub source: String,
}

impl ValuationRow {
    pub fn into_valuation(self) -> Result<(Fingerprint, Valuation)> {
        let casp = Decimal::from_str(&self.casp)
            .map_err(|e| corrupt(&self.fingerprint, format!("casp '{}': {e}", self.casp)))?;
        let currency = Currency::from_code(&self.currency)
            .ok_or_else(|| corrupt(&self.fingerprint, format!("currency '{}'", self.currency)))?;
        let source = ValuationSource::from_str(&self.source).map_err(|e| corrupt(&self.fingerprint, e))?;
        let comps_used: Vec<String> = serde_json::from_str(&self.comps_used)?;
        let stats: Option<PriceStats> = self.stats.as_deref().map(serde_json::from_str).transpose()?;

        let valuation = Valuation {
            casp,
            currency,
            accuracy_pct: u8::try_from(self.accuracy_pct).unwrap_or(0).min(100),
            sample_size: usize::try_from(self.sample_size).unwrap_or(0),
            spread: self.spread,
            computed_at: from_millis(self.computed_at),
            comps_used,
            source,
            stats,
        };
        Ok((Fingerprint::from_stored(self.fingerprint), valuation))
    }
}

#[derive(Debug, sqlx::FromRow)]
pub struct EstimateRow {
    pub id: i64,
    pub fingerprint: String,
    pub casp: String,
    pub currency: String,
    pub accuracy_pct: i64,
    pub sample_size: i64,
    pub spread: f64,
    pub computed_at: i64,
    pub source: String,
    pub recorded_at: i64,
}

impl EstimateRow {
    pub fn into_record(self, comps: Vec<RecordedComp>) -> Result<EstimateRecord> {
        let casp = Decimal::from_str(&self.casp)
            .map_err(|e| corrupt(&self.fingerprint, format!("estimate casp '{}': {e}", self.casp)))?;
        let currency = Currency::from_code(&self.currency)
            .ok_or_else(|| corrupt(&self.fingerprint, format!("estimate currency '{}'", self.currency)))?;
        let source = ValuationSource::from_str(&self.source).map_err(|e| corrupt(&self.fingerprint, e))?;
        Ok(EstimateRecord {
            id: self.id,
            casp,
            currency,
            accuracy_pct: u8::try_from(self.accuracy_pct).unwrap_or(0).min(100),
            sample_size: usize::try_from(self.sample_size).unwrap_or(0),
            spread: self.spread,
            computed_at: from_millis(self.computed_at),
            source,
            recorded_at: from_millis(self.recorded_at),
            comps,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub struct CompRow {
    pub estimate_id: i64,
    pub comp_key: String,
    pub title: String,
    pub price: String,
    pub shipping: Option<String>,
    pub currency: String,
    pub marketplace: String,
    pub ended_at: Option<i64>,
}

impl CompRow {
    pub fn into_comp(self) -> Result<RecordedComp> {
        let key = self.comp_key.clone();
        let bad = |what: &str, value: &str| corrupt(&key, format!("comp {what} '{value}'"));
        let price = Decimal::from_str(&self.price).map_err(|_| bad("price", &self.price))?;
        let shipping = match self.shipping.as_deref() {
            Some(s) => Some(Decimal::from_str(s).map_err(|_| bad("shipping", s))?),
            None => None,
        };
        let currency = Currency::from_code(&self.currency).ok_or_else(|| bad("currency", &self.currency))?;
        let source = Marketplace::from_name(&self.marketplace).ok_or_else(|| bad("marketplace", &self.marketplace))?;
        Ok(RecordedComp {
            id: self.comp_key,
            title: self.title,
            price,
            shipping,
            currency,
            source,
            ended_at: self.ended_at.map(from_millis),
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub struct WatchlistRow {
    pub id: i64,
    pub owner_id: String,
    pub display_text: String,
    pub filters: String,
    pub fingerprint: String,
    pub created_at: i64,
    pub last_refreshed_at: Option<i64>,
    pub last_valuation: Option<String>,
}

impl WatchlistRow {
    pub fn into_entry(self) -> Result<WatchlistEntry> {
        let filters: BTreeMap<FilterKey, String> = serde_json::from_str(&self.filters)?;
        let last_valuation: Option<Valuation> =
            self.last_valuation.as_deref().map(serde_json::from_str).transpose()?;
        Ok(WatchlistEntry {
            id: self.id,
            owner_id: self.owner_id,
            display_text: self.display_text,
            filters,
            fingerprint: Fingerprint::from_stored(self.fingerprint),
            created_at: from_millis(self.created_at),
            last_refreshed_at: self.last_refreshed_at.map(from_millis),
            last_valuation,
        })
    }
}

pub fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn corrupt(fingerprint: &str, detail: impl std::fmt::Display) -> AppError {
    AppError::Persistence(format!("corrupt valuation row for '{fingerprint}': {detail}"))
}
