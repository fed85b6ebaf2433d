use std::str::FromStr;

use rust_decimal::Decimal;

use crate::types::Currency;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Money {
    pub amount: Decimal,
    /// `None` when the text carries no currency marker.
    pub currency: Option<Currency>,
}

/// Parse marketplace display text such as `"US $1,250.00"`, `"C $45"` or `"£30.00"`.
///
/// Ranges (`"$20.00 to $35.00"`) are not a single sold price and yield `None`.
pub fn parse_display_price(text: &str) -> Option<Money> {
    let t = text.trim();
    if t.is_empty() || is_range(t) {
        return None;
    }
    let amount = first_number(t)?;
    Some(Money { amount, currency: detect_currency(t) })
}

/// Shipping text: "Free shipping" is zero, "+$8.50 shipping" is 8.50,
/// anything without a number is unknown.
pub fn parse_shipping(text: &str) -> Option<Money> {
    let t = text.trim();
    if t.to_ascii_lowercase().contains("free") {
        return Some(Money { amount: Decimal::ZERO, currency: None });
    }
    parse_display_price(t)
}

/// Plain numeric amount from a structured source (`"95.50"`, `"1,200"`).
pub fn parse_amount(text: &str) -> Option<Decimal> {
    let t = text.trim().replace(',', "");
    if t.is_empty() {
        return None;
    }
    Decimal::from_str(&t).ok()
}

fn is_range(t: &str) -> bool {
    t.to_ascii_lowercase().split_whitespace().any(|w| w == "to")
}

fn detect_currency(t: &str) -> Option<Currency> {
    if t.contains("C $") {
        Some(Currency::Cad)
    } else if t.contains("US $") {
        Some(Currency::Usd)
    } else if t.contains("AU $") {
        Some(Currency::Aud)
    } else if t.contains('£') || t.contains("GBP") {
        Some(Currency::Gbp)
    } else if t.contains('€') || t.contains("EUR") {
        Some(Currency::Eur)
    } else if t.contains('$') {
        Some(Currency::Usd)
    } else {
        None
    }
}

/// First `\d[\d,]*(\.\d+)?` run in the text, commas dropped.
fn first_number(t: &str) -> Option<Decimal> {
    let start = t.find(|c: char| c.is_ascii_digit())?;
    let mut digits = String::new();
    let mut chars = t[start..].chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_ascii_digit() {
            digits.push(c);
        } else if c != ',' {
            break;
        }
        chars.next();
    }

    if chars.peek() == Some(&'.') {
        chars.next();
        let frac: String = chars.take_while(|c| c.is_ascii_digit()).collect();
        if !frac.is_empty() {
            digits.push('.');
            digits.push_str(&frac);
        }
    }

    Decimal::from_str(&digits).ok()
}
