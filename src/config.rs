use std::time::Duration;

use rust_decimal::Decimal;

use crate::error::{AppError, Result};
use crate::types::Currency;

pub const COMPS_API_URL: &str = "http://127.0.0.1:8081";

/// Upper bound on a single comp acquisition call (seconds). Exceeding it is
/// handled exactly like any other acquisition failure.
pub const ACQUISITION_TIMEOUT_SECS: u64 = 8;

/// Watchlist sweep cadence (seconds).
pub const WATCHLIST_REFRESH_INTERVAL_SECS: u64 = 900;

/// Maximum watchlist refreshes in flight during one sweep.
pub const SWEEP_MAX_CONCURRENT: usize = 4;

/// Cached valuations older than this are served as stale and refreshed in the background.
pub const VALUATION_MAX_AGE_SECS: u64 = 6 * 3600;

/// Result pages requested from the comp source per refresh.
pub const COMPS_PAGES: u32 = 1;

/// Waits (milliseconds) before re-requesting a page after a 429 or 5xx.
/// One retry per entry; all of it counts against the acquisition timeout.
pub const COMPS_RETRY_BACKOFF_MS: &[u64] = &[250, 500, 1_000];

/// Estimator tuning. Changing these never changes the pipeline shape.
pub mod valuation_policy {
    /// Fraction dropped from each tail before the trimmed mean (count rounds down).
    pub const TRIM_FRACTION: f64 = 0.10;
    /// Sample size at which the size component reaches half of its weight.
    pub const SIZE_HALF_SATURATION: f64 = 8.0;
    pub const SIZE_WEIGHT: f64 = 0.65;
    pub const SPREAD_WEIGHT: f64 = 0.35;
    /// Coefficient of variation at (or above) which the spread component is zero.
    pub const SPREAD_CEILING: f64 = 1.0;
    /// Below this many comps the dispersion is not evidence of anything.
    pub const MIN_SAMPLES_FOR_SPREAD: usize = 2;
    /// Largest price or shipping amount taken at face value (1,000,000).
    pub const MAX_COMP_AMOUNT: rust_decimal::Decimal = rust_decimal::Decimal::from_parts(1_000_000, 0, 0, false, 0);
}

/// Deal score cut points on asking / CASP. Upper bounds, inclusive.
pub mod deal_thresholds {
    use rust_decimal::Decimal;

    /// 0.7
    pub const GREAT_MAX: Decimal = Decimal::from_parts(7, 0, 0, false, 1);
    /// 0.9
    pub const GOOD_MAX: Decimal = Decimal::from_parts(9, 0, 0, false, 1);
    /// 1.1
    pub const FAIR_MAX: Decimal = Decimal::from_parts(11, 0, 0, false, 1);
    /// 1.3
    pub const BAD_MAX: Decimal = Decimal::from_parts(13, 0, 0, false, 1);
}

/// Title vocabulary used by the normalizer's mismatch heuristics.
pub mod title_terms {
    /// Children's sizing and audience markers.
    pub const EXCLUDED_AUDIENCE: &[&str] = &[
        "kid", "kids", "child", "children", "childrens", "toddler", "toddlers", "youth", "baby",
        "infant", "boy", "boys", "girl", "girls", "2t", "3t", "4t", "5t", "6t",
    ];

    /// Listings that are not the garment itself (accessories, multi-item lots, fakes).
    pub const NON_TARGET: &[&str] = &[
        "patch", "patches", "sticker", "stickers", "pattern", "poster", "keychain", "hanger",
        "lot", "bundle", "replica", "zipper pull", "tags only", "box only",
    ];
}

#[derive(Debug, Clone)]
pub struct EstimatorPolicy {
    pub trim_fraction: f64,
    pub size_half_saturation: f64,
    pub size_weight: f64,
    pub spread_weight: f64,
    pub spread_ceiling: f64,
    pub min_samples_for_spread: usize,
}

impl Default for EstimatorPolicy {
    fn default() -> Self {
        use valuation_policy::*;
        Self {
            trim_fraction: TRIM_FRACTION,
            size_half_saturation: SIZE_HALF_SATURATION,
            size_weight: SIZE_WEIGHT,
            spread_weight: SPREAD_WEIGHT,
            spread_ceiling: SPREAD_CEILING,
            min_samples_for_spread: MIN_SAMPLES_FOR_SPREAD,
        }
    }
}

/// Ratio cut points for the deal score; must be ascending.
#[derive(Debug, Clone, Copy)]
pub struct DealThresholds {
    pub great_max: Decimal,
    pub good_max: Decimal,
    pub fair_max: Decimal,
    pub bad_max: Decimal,
}

impl Default for DealThresholds {
    fn default() -> Self {
        use deal_thresholds::*;
        Self {
            great_max: GREAT_MAX,
            good_max: GOOD_MAX,
            fair_max: FAIR_MAX,
            bad_max: BAD_MAX,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NormalizerPolicy {
    pub excluded_audience: Vec<String>,
    pub non_target: Vec<String>,
    /// Prices above this are rejected; shipping above it is treated as unknown.
    pub max_amount: Decimal,
}

impl Default for NormalizerPolicy {
    fn default() -> Self {
        Self {
            excluded_audience: title_terms::EXCLUDED_AUDIENCE.iter().map(|s| s.to_string()).collect(),
            non_target: title_terms::NON_TARGET.iter().map(|s| s.to_string()).collect(),
            max_amount: valuation_policy::MAX_COMP_AMOUNT,
        }
    }
}

/// Every tunable knob of the valuation pipeline in one place.
#[derive(Debug, Clone, Default)]
pub struct ValuationPolicy {
    pub normalizer: NormalizerPolicy,
    pub estimator: EstimatorPolicy,
    pub deal: DealThresholds,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub db_path: String,
    pub api_port: u16,
    /// Base URL of the sold-listing acquisition service (COMPS_API_URL)
    pub comps_api_url: String,
    /// Pages of sold results requested per refresh (COMPS_PAGES)
    pub comps_pages: u32,
    pub acquisition_timeout: Duration,
    /// Watchlist sweep cadence (WATCHLIST_REFRESH_INTERVAL_SECS)
    pub refresh_interval: Duration,
    /// Bound on concurrent refreshes per sweep (SWEEP_MAX_CONCURRENT)
    pub sweep_max_concurrent: usize,
    /// Staleness threshold for read-through valuation lookups (VALUATION_MAX_AGE_SECS)
    pub valuation_max_age: Duration,
    /// Currency every valuation is computed in (DEFAULT_CURRENCY). No conversion is done.
    pub currency: Currency,
    pub policy: ValuationPolicy,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let currency_code = std::env::var("DEFAULT_CURRENCY").unwrap_or_else(|_| "USD".to_string());
        let currency = Currency::from_code(&currency_code).ok_or_else(|| {
            AppError::Config(format!("DEFAULT_CURRENCY '{currency_code}' is not supported"))
        })?;

        let sweep_max_concurrent = std::env::var("SWEEP_MAX_CONCURRENT")
            .unwrap_or_else(|_| SWEEP_MAX_CONCURRENT.to_string())
            .parse::<usize>()
            .unwrap_or(SWEEP_MAX_CONCURRENT)
            .max(1);

        let mut policy = ValuationPolicy::default();
        if let Ok(raw) = std::env::var("TRIM_FRACTION") {
            let trim = raw
                .parse::<f64>()
                .map_err(|_| AppError::Config("TRIM_FRACTION must be a number".to_string()))?;
            if !(0.0..0.5).contains(&trim) {
                return Err(AppError::Config("TRIM_FRACTION must be in [0, 0.5)".to_string()));
            }
            policy.estimator.trim_fraction = trim;
        }

        Ok(Self {
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            db_path: std::env::var("DB_PATH").unwrap_or_else(|_| "valuator.db".to_string()),
            api_port: std::env::var("API_PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse::<u16>()
                .map_err(|_| AppError::Config("API_PORT must be a valid port number".to_string()))?,
            comps_api_url: std::env::var("COMPS_API_URL")
                .unwrap_or_else(|_| COMPS_API_URL.to_string()),
            comps_pages: std::env::var("COMPS_PAGES")
                .unwrap_or_else(|_| COMPS_PAGES.to_string())
                .parse::<u32>()
                .unwrap_or(COMPS_PAGES)
                .max(1),
            acquisition_timeout: Duration::from_secs(
                std::env::var("ACQUISITION_TIMEOUT_SECS")
                    .unwrap_or_else(|_| ACQUISITION_TIMEOUT_SECS.to_string())
                    .parse::<u64>()
                    .unwrap_or(ACQUISITION_TIMEOUT_SECS),
            ),
            refresh_interval: Duration::from_secs(
                std::env::var("WATCHLIST_REFRESH_INTERVAL_SECS")
                    .unwrap_or_else(|_| WATCHLIST_REFRESH_INTERVAL_SECS.to_string())
                    .parse::<u64>()
                    .unwrap_or(WATCHLIST_REFRESH_INTERVAL_SECS)
                    .max(1),
            ),
            sweep_max_concurrent,
            valuation_max_age: Duration::from_secs(
                std::env::var("VALUATION_MAX_AGE_SECS")
                    .unwrap_or_else(|_| VALUATION_MAX_AGE_SECS.to_string())
                    .parse::<u64>()
                    .unwrap_or(VALUATION_MAX_AGE_SECS),
            ),
            currency,
            policy,
        })
    }
}
