use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

/// Longest accepted search text or filter value, in characters.
const MAX_TEXT_LEN: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterKey {
    Model,
    Size,
    Condition,
    Color,
}

impl FilterKey {
    pub fn as_str(self) -> &'static str {
        match self {
            FilterKey::Model => "model",
            FilterKey::Size => "size",
            FilterKey::Condition => "condition",
            FilterKey::Color => "color",
        }
    }
}

/// Query as it arrives from a caller: search text plus optional filters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryInput {
    #[serde(default)]
    pub q: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub size: Option<String>,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub color: Option<String>,
}

impl QueryInput {
    pub fn text(q: impl Into<String>) -> Self {
        Self { q: q.into(), ..Self::default() }
    }
}

/// Canonical query key. The value is the normal form itself, so two queries
/// share a fingerprint exactly when their normalized text and filters match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Rehydrate a fingerprint previously produced by [`QuerySpec::fingerprint`].
    pub fn from_stored(raw: String) -> Self {
        Self(raw)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Validated query. `display` keeps the caller's text verbatim; `text` and
/// filter values are lowercased and whitespace-collapsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuerySpec {
    pub display: String,
    pub text: String,
    pub filters: BTreeMap<FilterKey, String>,
}

impl QuerySpec {
    pub fn from_input(input: &QueryInput) -> Result<Self> {
        let mut filters = BTreeMap::new();
        for (key, value) in [
            (FilterKey::Model, &input.model),
            (FilterKey::Size, &input.size),
            (FilterKey::Condition, &input.condition),
            (FilterKey::Color, &input.color),
        ] {
            if let Some(v) = value {
                filters.insert(key, v.clone());
            }
        }
        Self::new(&input.q, filters)
    }

    pub fn new(display: &str, filters: BTreeMap<FilterKey, String>) -> Result<Self> {
        if display.chars().count() > MAX_TEXT_LEN {
            return Err(AppError::validation("q", format!("longer than {MAX_TEXT_LEN} characters")));
        }
        let text = canonical(display);

        let mut normalized = BTreeMap::new();
        for (key, value) in filters {
            if value.chars().count() > MAX_TEXT_LEN {
                return Err(AppError::validation(
                    key.as_str(),
                    format!("longer than {MAX_TEXT_LEN} characters"),
                ));
            }
            let v = canonical(&value);
            // A blank filter is the same as no filter.
            if !v.is_empty() {
                normalized.insert(key, v);
            }
        }

        if text.is_empty() && normalized.is_empty() {
            return Err(AppError::validation("q", "query needs search text or at least one filter"));
        }

        Ok(Self { display: display.to_string(), text, filters: normalized })
    }

    pub fn filter(&self, key: FilterKey) -> Option<&str> {
        self.filters.get(&key).map(String::as_str)
    }

    /// Text sent to comp sources: the search terms followed by any model filter.
    pub fn search_terms(&self) -> String {
        match self.filter(FilterKey::Model) {
            Some(model) if !self.text.split(' ').any(|w| w == model) => {
                if self.text.is_empty() {
                    model.to_string()
                } else {
                    format!("{} {model}", self.text)
                }
            }
            _ => self.text.clone(),
        }
    }

    pub fn fingerprint(&self) -> Fingerprint {
        let mut out = escape(&self.text);
        for (key, value) in &self.filters {
            out.push('|');
            out.push_str(key.as_str());
            out.push('=');
            out.push_str(&escape(value));
        }
        Fingerprint(out)
    }
}

fn canonical(s: &str) -> String {
    s.split_whitespace()
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Percent-escape the separator characters so the joined form stays unambiguous.
fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '%' => out.push_str("%25"),
            '|' => out.push_str("%7C"),
            '=' => out.push_str("%3D"),
            _ => out.push(c),
        }
    }
    out
}
