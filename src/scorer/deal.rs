use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;

use crate::config::DealThresholds;
use crate::error::{AppError, Result};
use crate::types::{Currency, Valuation};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DealLabel {
    Great,
    Good,
    Fair,
    Bad,
    Terrible,
}

/// An asking price rated against a valuation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DealAssessment {
    /// 1 (terrible) ..= 5 (great)
    pub score: u8,
    pub label: DealLabel,
    pub asking: Decimal,
    /// CASP minus asking; positive means below market.
    pub delta: Decimal,
    pub delta_pct: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AskingPrice {
    pub amount: Decimal,
    pub currency: Currency,
}

/// Rate an asking price. `Ok(None)` when there is nothing to rate: no asking
/// price, or a CASP of zero.
pub fn assess(
    valuation: &Valuation,
    asking: Option<AskingPrice>,
    thresholds: &DealThresholds,
) -> Result<Option<DealAssessment>> {
    let Some(asking) = asking else {
        return Ok(None);
    };
    if asking.amount.is_sign_negative() {
        return Err(AppError::validation("asking", "must not be negative"));
    }
    if asking.currency != valuation.currency {
        return Err(AppError::validation(
            "currency",
            format!("asking price is {} but the valuation is {}", asking.currency, valuation.currency),
        ));
    }
    if valuation.casp <= Decimal::ZERO {
        return Ok(None);
    }

    let out_of_range = || AppError::validation("asking", "too large to compare with this valuation");
    let ratio = asking.amount.checked_div(valuation.casp).ok_or_else(out_of_range)?;
    let (score, label) = rate(ratio, thresholds);
    let delta = valuation.casp.checked_sub(asking.amount).ok_or_else(out_of_range)?;
    let delta_pct = delta
        .checked_mul(Decimal::ONE_HUNDRED)
        .and_then(|d| d.checked_div(valuation.casp))
        .ok_or_else(out_of_range)?;

    Ok(Some(DealAssessment {
        score,
        label,
        asking: asking.amount,
        delta: delta.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero),
        delta_pct: delta_pct.round_dp_with_strategy(1, RoundingStrategy::MidpointAwayFromZero),
    }))
}

/// Map asking / CASP onto 1..=5. Thresholds are inclusive upper bounds.
pub fn rate(ratio: Decimal, t: &DealThresholds) -> (u8, DealLabel) {
    if ratio <= t.great_max {
        (5, DealLabel::Great)
    } else if ratio <= t.good_max {
        (4, DealLabel::Good)
    } else if ratio <= t.fair_max {
        (3, DealLabel::Fair)
    } else if ratio <= t.bad_max {
        (2, DealLabel::Bad)
    } else {
        (1, DealLabel::Terrible)
    }
}
