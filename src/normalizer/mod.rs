pub mod classifier;
pub mod money;

use std::collections::HashSet;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::debug;

use crate::config::NormalizerPolicy;
use crate::query::QuerySpec;
use crate::types::{
    Comp, Currency, EbayListing, ManualListing, Marketplace, MarketplaceListing, RawListing,
};

use self::classifier::{QueryTerms, TitleVerdict};

/// Per-reason counts of records dropped during normalization.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RejectStats {
    pub missing_identity: usize,
    pub unparsable_price: usize,
    pub non_positive_price: usize,
    pub implausible_price: usize,
    pub currency_mismatch: usize,
    pub duplicate: usize,
    pub excluded_audience: usize,
    pub non_target: usize,
    pub product_code_mismatch: usize,
    pub size_mismatch: usize,
}

impl RejectStats {
    pub fn total(&self) -> usize {
        self.missing_identity
            + self.unparsable_price
            + self.non_positive_price
            + self.implausible_price
            + self.currency_mismatch
            + self.duplicate
            + self.excluded_audience
            + self.non_target
            + self.product_code_mismatch
            + self.size_mismatch
    }
}

#[derive(Debug, Clone)]
pub struct NormalizeOutput {
    pub comps: Vec<Comp>,
    pub rejected: RejectStats,
}

enum ParseReject {
    MissingIdentity,
    UnparsablePrice,
    NonPositivePrice,
    ImplausiblePrice,
    CurrencyMismatch,
}

/// Listing after price parsing, before heuristics.
struct Parsed {
    id: String,
    price: Decimal,
    shipping: Option<Decimal>,
    currency: Currency,
    ended_at: Option<DateTime<Utc>>,
    source: Marketplace,
    title: String,
}

/// Turn raw listings into comps priced in `currency`.
///
/// Steps run in a fixed order: price/currency parsing, identity dedupe
/// (first occurrence wins), title heuristics, size extraction. Input records
/// are never modified; every dropped record is counted in `rejected`.
pub fn normalize(
    raws: &[RawListing],
    query: &QuerySpec,
    policy: &NormalizerPolicy,
    currency: Currency,
) -> NormalizeOutput {
    let mut rejected = RejectStats::default();

    // 1. price / currency
    let mut parsed = Vec::with_capacity(raws.len());
    for raw in raws {
        match parse_listing(raw, currency, policy.max_amount) {
            Ok(p) => parsed.push(p),
            Err(ParseReject::MissingIdentity) => rejected.missing_identity += 1,
            Err(ParseReject::UnparsablePrice) => rejected.unparsable_price += 1,
            Err(ParseReject::NonPositivePrice) => rejected.non_positive_price += 1,
            Err(ParseReject::ImplausiblePrice) => rejected.implausible_price += 1,
            Err(ParseReject::CurrencyMismatch) => rejected.currency_mismatch += 1,
        }
    }

    // 2. identity dedupe
    let mut seen = HashSet::with_capacity(parsed.len());
    let mut unique = Vec::with_capacity(parsed.len());
    for p in parsed {
        if seen.insert(p.id.clone()) {
            unique.push(p);
        } else {
            rejected.duplicate += 1;
        }
    }

    // 3 + 4. heuristics, then size bucket
    let terms = QueryTerms::from_query(query);
    let mut comps = Vec::with_capacity(unique.len());
    for p in unique {
        let model_guess = match classifier::classify(&p.title, &terms, policy) {
            TitleVerdict::Keep { model_guess } => model_guess,
            TitleVerdict::ExcludedAudience => {
                rejected.excluded_audience += 1;
                continue;
            }
            TitleVerdict::NonTarget => {
                rejected.non_target += 1;
                continue;
            }
            TitleVerdict::ProductCodeMismatch => {
                rejected.product_code_mismatch += 1;
                continue;
            }
        };

        let size = classifier::extract_size(&p.title);
        if let (Some(wanted), Some(found)) = (terms.size, size) {
            if wanted != found {
                rejected.size_mismatch += 1;
                continue;
            }
        }

        comps.push(Comp {
            id: p.id,
            price: p.price,
            shipping: p.shipping,
            currency: p.currency,
            ended_at: p.ended_at,
            source: p.source,
            model_guess,
            size,
            raw_title: p.title,
        });
    }

    if rejected.total() > 0 {
        debug!(
            kept = comps.len(),
            rejected = rejected.total(),
            unparsable = rejected.unparsable_price,
            implausible = rejected.implausible_price,
            duplicate = rejected.duplicate,
            audience = rejected.excluded_audience,
            non_target = rejected.non_target,
            code_mismatch = rejected.product_code_mismatch,
            size_mismatch = rejected.size_mismatch,
            "Normalized {} raw listings for '{}'",
            raws.len(),
            query.text,
        );
    }

    NormalizeOutput { comps, rejected }
}

fn parse_listing(raw: &RawListing, target: Currency, max_amount: Decimal) -> Result<Parsed, ParseReject> {
    let mut parsed = match raw {
        RawListing::Ebay(e) => parse_ebay(e, target)?,
        RawListing::Marketplace(m) => parse_marketplace(m, target)?,
        RawListing::Manual(m) => parse_manual(m, target)?,
    };
    if parsed.price <= Decimal::ZERO {
        return Err(ParseReject::NonPositivePrice);
    }
    if parsed.price > max_amount {
        return Err(ParseReject::ImplausiblePrice);
    }
    parsed.shipping = parsed.shipping.filter(|s| *s <= max_amount);
    if parsed.currency != target {
        return Err(ParseReject::CurrencyMismatch);
    }
    Ok(parsed)
}

fn parse_ebay(e: &EbayListing, target: Currency) -> Result<Parsed, ParseReject> {
    // Tracking parameters differ between impressions of the same listing.
    let id = e.url.split(['?', '#']).next().unwrap_or_default().trim();
    if id.is_empty() {
        return Err(ParseReject::MissingIdentity);
    }
    let price = money::parse_display_price(&e.price).ok_or(ParseReject::UnparsablePrice)?;
    let currency = price.currency.unwrap_or(target);
    let shipping = e
        .shipping
        .as_deref()
        .and_then(money::parse_shipping)
        .filter(|s| s.currency.map_or(true, |c| c == currency))
        .map(|s| s.amount);

    Ok(Parsed {
        id: id.to_string(),
        price: price.amount,
        shipping: non_negative(shipping),
        currency,
        ended_at: e.ended.as_deref().and_then(parse_ebay_ended),
        source: Marketplace::Ebay,
        title: classifier::clean_title(&e.title),
    })
}

fn parse_marketplace(m: &MarketplaceListing, target: Currency) -> Result<Parsed, ParseReject> {
    let listing_id = m.listing_id.trim();
    if listing_id.is_empty() {
        return Err(ParseReject::MissingIdentity);
    }
    let price = money::parse_amount(&m.price).ok_or(ParseReject::UnparsablePrice)?;
    let currency = currency_or(m.currency.as_deref(), target)?;

    Ok(Parsed {
        id: format!("{}:{listing_id}", m.marketplace),
        price,
        shipping: non_negative(m.shipping.as_deref().and_then(money::parse_amount)),
        currency,
        ended_at: m
            .sold_at
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|d| d.with_timezone(&Utc)),
        source: m.marketplace,
        title: m.title.trim().to_string(),
    })
}

fn parse_manual(m: &ManualListing, target: Currency) -> Result<Parsed, ParseReject> {
    let listing_id = m.listing_id.trim();
    if listing_id.is_empty() {
        return Err(ParseReject::MissingIdentity);
    }
    let (price, marker) = match money::parse_amount(&m.price) {
        Some(amount) => (amount, None),
        None => {
            let money = money::parse_display_price(&m.price).ok_or(ParseReject::UnparsablePrice)?;
            (money.amount, money.currency)
        }
    };
    let currency = match (m.currency.as_deref(), marker) {
        (Some(code), _) => currency_or(Some(code), target)?,
        (None, Some(c)) => c,
        (None, None) => target,
    };

    Ok(Parsed {
        id: format!("manual:{listing_id}"),
        price,
        shipping: non_negative(m.shipping.as_deref().and_then(money::parse_amount)),
        currency,
        ended_at: m.ended_at,
        source: Marketplace::Manual,
        title: m.title.trim().to_string(),
    })
}

/// Unknown currency codes reject the record rather than assuming the target.
fn currency_or(code: Option<&str>, target: Currency) -> Result<Currency, ParseReject> {
    match code {
        Some(c) => Currency::from_code(c).ok_or(ParseReject::UnparsablePrice),
        None => Ok(target),
    }
}

fn non_negative(amount: Option<Decimal>) -> Option<Decimal> {
    amount.filter(|a| *a >= Decimal::ZERO)
}

/// `"Sold  Oct 12, 2025"` → midnight UTC of that day.
fn parse_ebay_ended(text: &str) -> Option<DateTime<Utc>> {
    let t = text.trim();
    let t = t.strip_prefix("Sold").unwrap_or(t);
    let t = t.split_whitespace().collect::<Vec<_>>().join(" ");
    let date = NaiveDate::parse_from_str(&t, "%b %d, %Y").ok()?;
    Some(date.and_hms_opt(0, 0, 0)?.and_utc())
}

#[cfg(test)]
mod tests {
    use chrono::Datelike;
    use rust_decimal_macros::dec;

    use super::*;
    use crate::testkit::{ebay, manual, query};
    use crate::types::{LetterSize, SizeBucket};

    fn run(raws: &[RawListing], q: &str) -> NormalizeOutput {
        normalize(raws, &query(q), &NormalizerPolicy::default(), Currency::Usd)
    }

    #[test]
    fn duplicates_count_once_in_any_order() {
        let a = ebay("Carhartt J01 Detroit Jacket", "US $100.00", "https://www.ebay.com/itm/1?hash=abc");
        let b = ebay("Carhartt J01 Detroit Jacket L", "US $110.00", "https://www.ebay.com/itm/2");
        let a_again = ebay("Carhartt J01 Detroit Jacket", "US $95.00", "https://www.ebay.com/itm/1?hash=xyz");

        let forward = run(&[a.clone(), b.clone(), a_again.clone()], "carhartt j01");
        let backward = run(&[a_again, b, a], "carhartt j01");

        assert_eq!(forward.comps.len(), 2);
        assert_eq!(backward.comps.len(), 2);
        assert_eq!(forward.rejected.duplicate, 1);
        assert_eq!(backward.rejected.duplicate, 1);
        // First occurrence wins.
        assert_eq!(forward.comps[0].price, dec!(100.00));
        assert_eq!(backward.comps[0].price, dec!(95.00));
        assert_eq!(forward.comps[0].id, "https://www.ebay.com/itm/1");
    }

    #[test]
    fn bad_prices_are_excluded_not_zeroed() {
        let raws = vec![
            ebay("Carhartt J01", "see description", "https://e/1"),
            ebay("Carhartt J01", "$20.00 to $35.00", "https://e/2"),
            manual("m-0", "Carhartt J01", "0"),
            manual("m-1", "Carhartt J01", "-5"),
            ebay("Carhartt J01", "C $120.00", "https://e/3"),
            ebay("Carhartt J01", "US $80.00", "https://e/4"),
        ];
        let out = run(&raws, "carhartt j01");

        assert_eq!(out.comps.len(), 1);
        assert_eq!(out.rejected.unparsable_price, 2);
        assert_eq!(out.rejected.non_positive_price, 2);
        assert_eq!(out.rejected.currency_mismatch, 1);
        assert_eq!(out.rejected.total(), 5);
        assert!(out.comps.iter().all(|c| c.price > Decimal::ZERO));
    }

    #[test]
    fn shipping_in_another_currency_is_unknown() {
        let RawListing::Ebay(mut listing) = ebay("Carhartt J01", "US $100.00", "https://e/1") else {
            unreachable!()
        };
        listing.shipping = Some("+C $15.00 shipping".into());
        let priced_apart = RawListing::Ebay(listing.clone());
        listing.shipping = Some("Free shipping".into());
        listing.url = "https://e/2".into();
        let free = RawListing::Ebay(listing);

        let out = run(&[priced_apart, free], "carhartt j01");
        assert_eq!(out.comps[0].shipping, None);
        assert_eq!(out.comps[1].shipping, Some(Decimal::ZERO));
    }

    #[test]
    fn heuristics_then_size() {
        let raws = vec![
            ebay("Carhartt J01 Detroit Jacket Size M", "$100", "https://e/1"),
            ebay("Carhartt J01 Detroit Jacket Size XL", "$100", "https://e/2"),
            ebay("Carhartt Youth J01 Jacket", "$40", "https://e/3"),
            ebay("Carhartt J97 Jacket Size M", "$90", "https://e/4"),
            ebay("Carhartt J01 Jacket", "$105", "https://e/5"),
        ];
        let mut q = query("carhartt j01");
        q.filters.insert(crate::query::FilterKey::Size, "m".into());
        let out = normalize(&raws, &q, &NormalizerPolicy::default(), Currency::Usd);

        let ids: Vec<_> = out.comps.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["https://e/1", "https://e/5"]);
        assert_eq!(out.comps[0].size, Some(SizeBucket::Letter(LetterSize::M)));
        assert_eq!(out.comps[1].size, None);
        assert_eq!(out.comps[0].model_guess.as_deref(), Some("J01"));
        assert_eq!(out.rejected.size_mismatch, 1);
        assert_eq!(out.rejected.excluded_audience, 1);
        assert_eq!(out.rejected.product_code_mismatch, 1);
    }

    #[test]
    fn structured_sources_keep_their_metadata() {
        let raws: Vec<RawListing> = serde_json::from_value(serde_json::json!([
            {"source": "marketplace", "marketplace": "grailed", "listing_id": 77, "title": "Carhartt J01",
             "price": "95.50", "currency": "usd", "shipping": 12, "sold_at": "2025-10-12T18:30:00Z"},
            {"source": "marketplace", "marketplace": "depop", "listing_id": "d1", "title": "Carhartt J01",
             "price": 60, "currency": "JPY"},
            {"source": "ebay", "title": "New Listing Carhartt J01", "price": "US $88.00",
             "url": "https://e/9", "ended": "Sold  Oct 12, 2025"}
        ]))
        .unwrap();
        let out = run(&raws, "carhartt j01");

        assert_eq!(out.comps.len(), 2);
        let grailed = &out.comps[0];
        assert_eq!(grailed.id, "grailed:77");
        assert_eq!(grailed.total(), dec!(107.50));
        assert_eq!(grailed.ended_at.map(|d| d.day()), Some(12));
        assert_eq!(out.rejected.unparsable_price, 1);

        let ebay_comp = &out.comps[1];
        assert_eq!(ebay_comp.raw_title, "Carhartt J01");
        assert_eq!(ebay_comp.ended_at.map(|d| (d.year(), d.month(), d.day())), Some((2025, 10, 12)));
    }

    #[test]
    fn inputs_are_left_untouched() {
        let raws = vec![ebay("New Listing Carhartt J01", "US $100.00", "https://e/1?x=1")];
        let before = raws.clone();
        let _ = run(&raws, "carhartt j01");
        assert_eq!(raws, before);
    }

    #[test]
    fn implausible_amounts_never_reach_the_estimator() {
        let huge = rust_decimal::Decimal::MAX.to_string();
        let mut shipped = manual("m-2", "Carhartt J01 Detroit Jacket", "100");
        if let RawListing::Manual(m) = &mut shipped {
            m.shipping = Some(huge.clone());
        }
        let raws = vec![
            manual("m-0", "Carhartt J01 Detroit Jacket", &huge),
            manual("m-1", "Carhartt J01 Detroit Jacket", "1000001"),
            shipped,
        ];
        let out = run(&raws, "carhartt j01");

        assert_eq!(out.rejected.implausible_price, 2);
        assert_eq!(out.comps.len(), 1);
        assert_eq!(out.comps[0].shipping, None);
        assert_eq!(out.comps[0].total(), dec!(100));
    }
}
