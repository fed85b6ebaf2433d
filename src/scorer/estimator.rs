use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};

use crate::config::EstimatorPolicy;
use crate::types::{Comp, Currency, PriceStats, Valuation, ValuationSource};

/// Compute CASP and Accuracy-of-CASP from a normalized comp set.
///
/// Empty input is valid and yields the zero-confidence valuation.
pub fn estimate(
    comps: &[Comp],
    currency: Currency,
    policy: &EstimatorPolicy,
    computed_at: DateTime<Utc>,
    source: ValuationSource,
) -> Valuation {
    if comps.is_empty() {
        return Valuation::empty(currency, computed_at);
    }

    let mut totals: Vec<Decimal> = comps.iter().map(Comp::total).collect();
    totals.sort();

    let median = median(&totals);
    let trimmed = trimmed_mean(&totals, policy.trim_fraction);
    let min = totals[0];
    let max = totals[totals.len() - 1];

    let casp = midpoint(median, trimmed)
        .round_dp_with_strategy(currency.decimal_places(), RoundingStrategy::MidpointAwayFromZero)
        .clamp(min, max);

    let spread = coefficient_of_variation(&totals);
    let accuracy_pct = accuracy_pct(totals.len(), spread, policy);

    Valuation {
        casp,
        currency,
        accuracy_pct,
        sample_size: totals.len(),
        spread,
        computed_at,
        comps_used: comps.iter().map(|c| c.id.clone()).collect(),
        source,
        stats: Some(PriceStats {
            median: round2(median),
            trimmed_mean: round2(trimmed),
            p25: round2(percentile(&totals, 25)),
            p75: round2(percentile(&totals, 75)),
            min,
            max,
        }),
    }
}

/// Accuracy-of-CASP as a multiple of 10 in [0, 100].
///
/// Raw score = `size_weight * n/(n + half_saturation)`
///           + `spread_weight * (1 - clamp(cv / spread_ceiling, 0, 1))`,
/// with the spread term counted only from `min_samples_for_spread` comps on.
/// Quantized down: the score never overstates.
pub fn accuracy_pct(sample_size: usize, spread: f64, policy: &EstimatorPolicy) -> u8 {
    if sample_size == 0 {
        return 0;
    }
    let n = sample_size as f64;
    let size_score = n / (n + policy.size_half_saturation);

    let spread_score = if sample_size < policy.min_samples_for_spread || !spread.is_finite() {
        0.0
    } else {
        1.0 - (spread.max(0.0) / policy.spread_ceiling).clamp(0.0, 1.0)
    };

    let raw = (policy.size_weight * size_score + policy.spread_weight * spread_score).clamp(0.0, 1.0);
    // 1e-9 absorbs float noise such as 0.6 landing on 0.5999999.
    let tens = (raw * 10.0 + 1e-9).floor().clamp(0.0, 10.0);
    (tens as u8) * 10
}

fn median(sorted: &[Decimal]) -> Decimal {
    let n = sorted.len();
    let mid = n / 2;
    if n % 2 == 1 {
        sorted[mid]
    } else {
        midpoint(sorted[mid - 1], sorted[mid])
    }
}

fn midpoint(a: Decimal, b: Decimal) -> Decimal {
    match a.checked_add(b) {
        Some(sum) => sum / Decimal::TWO,
        None => a + (b - a) / Decimal::TWO,
    }
}

/// Exact sum when it fits; otherwise a running mean, which stays within
/// the range of the values.
fn mean(values: &[Decimal]) -> Decimal {
    match values.iter().try_fold(Decimal::ZERO, |acc, v| acc.checked_add(*v)) {
        Some(sum) => sum / Decimal::from(values.len()),
        None => values.iter().enumerate().fold(Decimal::ZERO, |acc, (i, v)| {
            acc + (*v - acc) / Decimal::from(i + 1)
        }),
    }
}

/// Mean after dropping `floor(n * fraction)` values from each tail.
/// Falls back to the plain mean when nothing would remain.
fn trimmed_mean(sorted: &[Decimal], fraction: f64) -> Decimal {
    let n = sorted.len();
    let k = (n as f64 * fraction).floor() as usize;
    let core = if n > 2 * k { &sorted[k..n - k] } else { sorted };
    mean(core)
}

/// Linear interpolation between closest ranks.
fn percentile(sorted: &[Decimal], p: u32) -> Decimal {
    let last = sorted.len() - 1;
    let rank = Decimal::from(last) * Decimal::from(p) / Decimal::ONE_HUNDRED;
    let lo = rank.floor().to_usize().unwrap_or(0).min(last);
    let hi = (lo + 1).min(last);
    let frac = rank - Decimal::from(lo);
    sorted[lo] + (sorted[hi] - sorted[lo]) * frac
}

/// Population stdev / mean of the comp totals.
fn coefficient_of_variation(values: &[Decimal]) -> f64 {
    let xs: Vec<f64> = values.iter().filter_map(|v| v.to_f64()).collect();
    if xs.is_empty() {
        return 0.0;
    }
    let n = xs.len() as f64;
    let mean = xs.iter().sum::<f64>() / n;
    if mean <= 0.0 {
        return 0.0;
    }
    let variance = xs.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
    variance.sqrt() / mean
}

fn round2(d: Decimal) -> Decimal {
    d.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}
