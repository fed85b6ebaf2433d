use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize};

use crate::query::{FilterKey, Fingerprint};

// ---------------------------------------------------------------------------
// Currency / marketplace
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Currency {
    Usd,
    Cad,
    Aud,
    Gbp,
    Eur,
}

impl Currency {
    pub fn from_code(code: &str) -> Option<Self> {
        match code.trim().to_ascii_uppercase().as_str() {
            "USD" => Some(Currency::Usd),
            "CAD" => Some(Currency::Cad),
            "AUD" => Some(Currency::Aud),
            "GBP" => Some(Currency::Gbp),
            "EUR" => Some(Currency::Eur),
            _ => None,
        }
    }

    pub fn code(self) -> &'static str {
        match self {
            Currency::Usd => "USD",
            Currency::Cad => "CAD",
            Currency::Aud => "AUD",
            Currency::Gbp => "GBP",
            Currency::Eur => "EUR",
        }
    }

    /// Minor-unit precision used when rounding CASP.
    pub fn decimal_places(self) -> u32 {
        2
    }
}

impl std::fmt::Display for Currency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Marketplace {
    Ebay,
    Grailed,
    Depop,
    Poshmark,
    Mercari,
    Manual,
}

impl Marketplace {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "ebay" => Some(Marketplace::Ebay),
            "grailed" => Some(Marketplace::Grailed),
            "depop" => Some(Marketplace::Depop),
            "poshmark" => Some(Marketplace::Poshmark),
            "mercari" => Some(Marketplace::Mercari),
            "manual" => Some(Marketplace::Manual),
            _ => None,
        }
    }
}

impl std::fmt::Display for Marketplace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Marketplace::Ebay => "ebay",
            Marketplace::Grailed => "grailed",
            Marketplace::Depop => "depop",
            Marketplace::Poshmark => "poshmark",
            Marketplace::Mercari => "mercari",
            Marketplace::Manual => "manual",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Size buckets
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum LetterSize {
    #[serde(rename = "XXS")]
    Xxs,
    #[serde(rename = "XS")]
    Xs,
    #[serde(rename = "S")]
    S,
    #[serde(rename = "M")]
    M,
    #[serde(rename = "L")]
    L,
    #[serde(rename = "XL")]
    Xl,
    #[serde(rename = "XXL")]
    Xxl,
    #[serde(rename = "XXXL")]
    Xxxl,
    #[serde(rename = "4XL")]
    Xxxxl,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum SizeBucket {
    Letter(LetterSize),
    /// Waist, shoe or EU size, normalized (`32`, `10.5`).
    Numeric(Decimal),
}

// ---------------------------------------------------------------------------
// Comp
// ---------------------------------------------------------------------------

/// One normalized historical sold transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comp {
    /// Unique identity key within a comp set (listing URL or marketplace-scoped id).
    pub id: String,
    pub price: Decimal,
    pub shipping: Option<Decimal>,
    pub currency: Currency,
    pub ended_at: Option<DateTime<Utc>>,
    pub source: Marketplace,
    pub model_guess: Option<String>,
    pub size: Option<SizeBucket>,
    pub raw_title: String,
}

impl Comp {
    /// Price plus shipping when the shipping cost is known.
    pub fn total(&self) -> Decimal {
        self.price.saturating_add(self.shipping.unwrap_or(Decimal::ZERO))
    }
}

// ---------------------------------------------------------------------------
// Raw listings: one variant per acquisition source
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum RawListing {
    Ebay(EbayListing),
    Marketplace(MarketplaceListing),
    Manual(ManualListing),
}

/// eBay sold-search row. Prices are display text (`"US $100.00"`, `"+$8.50 shipping"`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EbayListing {
    pub title: String,
    pub price: String,
    #[serde(default)]
    pub shipping: Option<String>,
    pub url: String,
    /// e.g. `"Sold  Oct 12, 2025"`
    #[serde(default)]
    pub ended: Option<String>,
}

/// Structured export from a resale marketplace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketplaceListing {
    pub marketplace: Marketplace,
    #[serde(deserialize_with = "lenient_string")]
    pub listing_id: String,
    pub title: String,
    #[serde(deserialize_with = "lenient_string")]
    pub price: String,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default, deserialize_with = "lenient_opt_string")]
    pub shipping: Option<String>,
    /// RFC 3339
    #[serde(default)]
    pub sold_at: Option<String>,
}

/// Caller-supplied comp for manual seeding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManualListing {
    #[serde(deserialize_with = "lenient_string")]
    pub listing_id: String,
    pub title: String,
    #[serde(deserialize_with = "lenient_string")]
    pub price: String,
    /// Defaults to the valuation currency when omitted.
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default, deserialize_with = "lenient_opt_string")]
    pub shipping: Option<String>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
}

/// Accepts a JSON string or number and keeps its textual form, so a bad value
/// rejects one record in the normalizer instead of the whole payload.
fn lenient_string<'de, D>(de: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_json::Value::deserialize(de)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Ok(other.to_string()),
    }
}

fn lenient_opt_string<'de, D>(de: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<serde_json::Value>::deserialize(de)? {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::String(s)) => Ok(Some(s)),
        Some(serde_json::Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Ok(Some(other.to_string())),
    }
}

// ---------------------------------------------------------------------------
// Valuation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValuationSource {
    /// Comps from live acquisition.
    Live,
    /// Comps supplied through manual seeding.
    Seeded,
    /// Zero-confidence placeholder; never written to the cache.
    Empty,
}

impl std::fmt::Display for ValuationSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ValuationSource::Live => "live",
            ValuationSource::Seeded => "seeded",
            ValuationSource::Empty => "empty",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for ValuationSource {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "live" => Ok(ValuationSource::Live),
            "seeded" => Ok(ValuationSource::Seeded),
            "empty" => Ok(ValuationSource::Empty),
            other => Err(format!("unknown valuation source '{other}'")),
        }
    }
}

/// Distribution of comp totals behind a valuation (diagnostic surface only).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceStats {
    pub median: Decimal,
    pub trimmed_mean: Decimal,
    pub p25: Decimal,
    pub p75: Decimal,
    pub min: Decimal,
    pub max: Decimal,
}

/// Computed artifact for a query at a point in time. Superseded, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Valuation {
    pub casp: Decimal,
    pub currency: Currency,
    /// Multiple of 10 in [0, 100]; derived from `sample_size` and `spread` only.
    pub accuracy_pct: u8,
    pub sample_size: usize,
    /// Coefficient of variation of comp totals.
    pub spread: f64,
    pub computed_at: DateTime<Utc>,
    pub comps_used: Vec<String>,
    pub source: ValuationSource,
    pub stats: Option<PriceStats>,
}

impl Valuation {
    /// Zero-confidence result for a query nothing is known about.
    pub fn empty(currency: Currency, computed_at: DateTime<Utc>) -> Self {
        Self {
            casp: Decimal::ZERO,
            currency,
            accuracy_pct: 0,
            sample_size: 0,
            spread: 0.0,
            computed_at,
            comps_used: Vec::new(),
            source: ValuationSource::Empty,
            stats: None,
        }
    }

    pub fn accuracy_label(&self) -> &'static str {
        accuracy_label(self.accuracy_pct)
    }
}

/// Short UI label for an accuracy percentage.
pub fn accuracy_label(pct: u8) -> &'static str {
    match pct {
        80..=u8::MAX => "Very High",
        60..=79 => "High",
        40..=59 => "Medium",
        20..=39 => "Low",
        _ => "Very Low",
    }
}

/// Current time at the millisecond precision the store keeps, so in-memory
/// and persisted `computed_at` comparisons agree.
pub fn now_ms() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
}

// ---------------------------------------------------------------------------
// Estimate history
// ---------------------------------------------------------------------------

/// One committed valuation as recorded in the append-only history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EstimateRecord {
    pub id: i64,
    pub casp: Decimal,
    pub currency: Currency,
    pub accuracy_pct: u8,
    pub sample_size: usize,
    pub spread: f64,
    pub computed_at: DateTime<Utc>,
    pub source: ValuationSource,
    pub recorded_at: DateTime<Utc>,
    pub comps: Vec<RecordedComp>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordedComp {
    pub id: String,
    pub title: String,
    pub price: Decimal,
    pub shipping: Option<Decimal>,
    pub currency: Currency,
    pub source: Marketplace,
    pub ended_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Watchlist
// ---------------------------------------------------------------------------

pub type EntryId = i64;

/// Owner-scoped tracked query. `display_text` is exactly what the owner typed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WatchlistEntry {
    pub id: EntryId,
    pub owner_id: String,
    pub display_text: String,
    pub filters: std::collections::BTreeMap<FilterKey, String>,
    pub fingerprint: Fingerprint,
    pub created_at: DateTime<Utc>,
    pub last_refreshed_at: Option<DateTime<Utc>>,
    /// Denormalized copy of the last committed valuation; may lag the cache.
    pub last_valuation: Option<Valuation>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_listing_tag_selects_variant() {
        let json = r#"[
            {"source":"ebay","title":"Carhartt J01","price":"US $100.00","url":"https://www.ebay.com/itm/1"},
            {"source":"marketplace","marketplace":"grailed","listing_id":4411,"title":"J01","price":95.5,"currency":"USD"},
            {"source":"manual","listing_id":"m-1","title":"J01","price":"120"}
        ]"#;
        let listings: Vec<RawListing> = serde_json::from_str(json).unwrap();
        assert!(matches!(listings[0], RawListing::Ebay(_)));
        match &listings[1] {
            RawListing::Marketplace(m) => {
                assert_eq!(m.listing_id, "4411");
                assert_eq!(m.price, "95.5");
                assert_eq!(m.marketplace, Marketplace::Grailed);
            }
            other => panic!("unexpected variant {other:?}"),
        }
        assert!(matches!(listings[2], RawListing::Manual(_)));
    }

    #[test]
    fn accuracy_labels_follow_bands() {
        assert_eq!(accuracy_label(100), "Very High");
        assert_eq!(accuracy_label(60), "High");
        assert_eq!(accuracy_label(50), "Medium");
        assert_eq!(accuracy_label(20), "Low");
        assert_eq!(accuracy_label(0), "Very Low");
    }

    #[test]
    fn currency_codes_are_case_insensitive() {
        assert_eq!(Currency::from_code(" usd "), Some(Currency::Usd));
        assert_eq!(Currency::from_code("gbp"), Some(Currency::Gbp));
        assert_eq!(Currency::from_code("JPY"), None);
    }
}
