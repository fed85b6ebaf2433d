use std::str::FromStr;

use rust_decimal::Decimal;

use crate::config::NormalizerPolicy;
use crate::query::{FilterKey, QuerySpec};
use crate::types::{LetterSize, SizeBucket};

/// Leading 1-3 letter groups that look like product codes but are not
/// (waist/length, seasons, regional size systems).
const NON_CODE_PREFIXES: &[&str] = &["w", "l", "ss", "fw", "aw", "sp", "fa", "us", "eu", "uk", "sz"];

/// Why a title was kept or dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TitleVerdict {
    Keep { model_guess: Option<String> },
    ExcludedAudience,
    NonTarget,
    ProductCodeMismatch,
}

/// Tokens, product codes and size filter derived once per query.
#[derive(Debug, Clone)]
pub struct QueryTerms {
    padded: String,
    codes: Vec<String>,
    pub size: Option<SizeBucket>,
}

impl QueryTerms {
    pub fn from_query(query: &QuerySpec) -> Self {
        let mut tokens = tokenize(&query.text);
        if let Some(model) = query.filter(FilterKey::Model) {
            tokens.extend(tokenize(model));
        }
        let codes = product_codes(&tokens);
        Self {
            padded: pad(&tokens),
            codes,
            size: query.filter(FilterKey::Size).and_then(parse_size_filter),
        }
    }

    fn mentions(&self, term: &str) -> bool {
        self.padded.contains(&format!(" {term} "))
    }
}

/// Drop the "New Listing" badge eBay prepends to fresh titles.
pub fn clean_title(raw: &str) -> String {
    const BADGE: &str = "new listing";
    let t = raw.trim();
    match t.get(..BADGE.len()) {
        Some(prefix) if prefix.eq_ignore_ascii_case(BADGE) => t[BADGE.len()..].trim().to_string(),
        _ => t.to_string(),
    }
}

/// Apply the mismatch heuristics to one title. Exclusion terms the query
/// itself contains never exclude.
pub fn classify(title: &str, terms: &QueryTerms, policy: &NormalizerPolicy) -> TitleVerdict {
    let tokens = tokenize(title);
    let padded = pad(&tokens);
    let hit = |term: &String| padded.contains(&format!(" {term} ")) && !terms.mentions(term);

    if policy.excluded_audience.iter().any(hit) {
        return TitleVerdict::ExcludedAudience;
    }
    if policy.non_target.iter().any(hit) {
        return TitleVerdict::NonTarget;
    }

    let title_codes = product_codes(&tokens);
    if terms.codes.is_empty() {
        return TitleVerdict::Keep { model_guess: title_codes.first().map(|c| c.to_uppercase()) };
    }
    if title_codes.is_empty() {
        return TitleVerdict::Keep { model_guess: None };
    }
    match title_codes.iter().find(|c| terms.codes.contains(c)) {
        Some(code) => TitleVerdict::Keep { model_guess: Some(code.to_uppercase()) },
        None => TitleVerdict::ProductCodeMismatch,
    }
}

/// Best-effort size from a title. Only confident matches are returned:
/// multi-letter sizes anywhere, single letters and size words only after
/// "size"/"sz", waist forms `w32`, `32w`, `32x30`.
pub fn extract_size(title: &str) -> Option<SizeBucket> {
    let tokens = tokenize(title);
    for (i, tok) in tokens.iter().enumerate() {
        if tok == "size" || tok == "sz" {
            if let Some(next) = tokens.get(i + 1) {
                if let Some(size) = explicit_size(next) {
                    return Some(size);
                }
            }
            continue;
        }
        if let Some(rest) = tok.strip_prefix("sz").or_else(|| tok.strip_prefix("size")) {
            if let Some(n) = numeric_size(rest) {
                return Some(SizeBucket::Numeric(n));
            }
        }
        if let Some(letter) = multi_letter_size(tok) {
            return Some(SizeBucket::Letter(letter));
        }
        if let Some(n) = waist_size(tok) {
            return Some(SizeBucket::Numeric(n));
        }
    }
    None
}

/// Interpret a size filter value (`"L"`, `"large"`, `"32"`, `"w32"`, `"10.5"`).
pub fn parse_size_filter(value: &str) -> Option<SizeBucket> {
    let v = value.trim().to_lowercase();
    explicit_size(&v).or_else(|| waist_size(&v).map(SizeBucket::Numeric))
}

fn explicit_size(tok: &str) -> Option<SizeBucket> {
    if let Some(letter) = multi_letter_size(tok).or_else(|| single_letter_size(tok)) {
        return Some(SizeBucket::Letter(letter));
    }
    numeric_size(tok).map(SizeBucket::Numeric)
}

fn multi_letter_size(tok: &str) -> Option<LetterSize> {
    let size = match tok {
        "xxs" | "2xs" => LetterSize::Xxs,
        "xs" | "xsmall" | "x-small" => LetterSize::Xs,
        "xl" | "xlarge" | "x-large" => LetterSize::Xl,
        "xxl" | "2xl" | "xxlarge" | "xx-large" => LetterSize::Xxl,
        "xxxl" | "3xl" => LetterSize::Xxxl,
        "xxxxl" | "4xl" => LetterSize::Xxxxl,
        _ => return None,
    };
    Some(size)
}

fn single_letter_size(tok: &str) -> Option<LetterSize> {
    let size = match tok {
        "s" | "small" => LetterSize::S,
        "m" | "medium" | "med" => LetterSize::M,
        "l" | "large" | "lg" => LetterSize::L,
        _ => return None,
    };
    Some(size)
}

fn numeric_size(tok: &str) -> Option<Decimal> {
    if tok.is_empty() || !tok.chars().all(|c| c.is_ascii_digit() || c == '.') {
        return None;
    }
    let n = Decimal::from_str(tok).ok()?;
    (n > Decimal::ZERO && n <= Decimal::from(60)).then(|| n.normalize())
}

fn waist_size(tok: &str) -> Option<Decimal> {
    if let Some(rest) = tok.strip_prefix('w') {
        return numeric_size(rest);
    }
    if let Some(rest) = tok.strip_suffix('w') {
        return numeric_size(rest);
    }
    let (waist, length) = tok.split_once('x')?;
    numeric_size(length)?;
    numeric_size(waist)
}

/// Lowercased title words with surrounding punctuation and possessive `'s` removed.
fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| c.is_whitespace() || ",/|()[]{}:;!\"+&".contains(c))
        .map(|w| {
            let w = w.trim_matches(|c: char| ".-'*#".contains(c));
            let w = w.strip_suffix("'s").or_else(|| w.strip_suffix("’s")).unwrap_or(w);
            w.trim_matches(|c: char| ".-'*#".contains(c)).to_string()
        })
        .filter(|w| !w.is_empty())
        .collect()
}

fn pad(tokens: &[String]) -> String {
    format!(" {} ", tokens.join(" "))
}

/// Tokens shaped like style numbers: 1-3 letters then 2-4 digits (`j01`, `j140`, `ctk121`).
fn product_codes(tokens: &[String]) -> Vec<String> {
    let mut codes: Vec<String> = Vec::new();
    for tok in tokens {
        let letters: String = tok.chars().take_while(|c| c.is_ascii_lowercase()).collect();
        let digits = &tok[letters.len()..];
        let shaped = (1..=3).contains(&letters.len())
            && (2..=4).contains(&digits.len())
            && digits.chars().all(|c| c.is_ascii_digit());
        if shaped && !NON_CODE_PREFIXES.contains(&letters.as_str()) && !codes.contains(tok) {
            codes.push(tok.clone());
        }
    }
    codes
}
