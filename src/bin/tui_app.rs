use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Deserialize;

// ---------------------------------------------------------------------------
// API response types (mirror routes.rs shapes)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[allow(dead_code)]
pub struct ValuationView {
    pub casp: String,
    pub currency: String,
    pub accuracy_pct: u8,
    pub accuracy_label: String,
    pub sample_size: u64,
    pub stale: bool,
    pub computed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
#[allow(dead_code)]
pub struct EntryView {
    pub id: i64,
    pub display_text: String,
    #[serde(default)]
    pub filters: BTreeMap<String, String>,
    pub fingerprint: String,
    pub created_at: DateTime<Utc>,
    pub last_refreshed_at: Option<DateTime<Utc>>,
    pub last_valuation: Option<ValuationView>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[allow(dead_code)]
pub struct HealthView {
    pub cached_valuations: Option<u64>,
    pub refreshes_in_flight: Option<u64>,
    pub acquisition_failures: Option<u64>,
    pub coalesced_joins: Option<u64>,
    pub entry_refresh_failures: Option<u64>,
    pub sweeps_completed: Option<u64>,
    pub last_sweep_at_ms: Option<i64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LatencyView {
    pub p50_ms: Option<u64>,
    pub p95_ms: Option<u64>,
    pub p99_ms: Option<u64>,
    pub sample_count: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
struct ErrorView {
    error: String,
}

// ---------------------------------------------------------------------------
// App state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionStatus {
    Connected,
    Error(String),
    Connecting,
}

#[derive(Debug, Clone)]
pub struct AppState {
    pub status: ConnectionStatus,
    pub owner: String,
    pub entries: Vec<EntryView>,
    pub health: HealthView,
    pub latency: LatencyView,
    /// Result of the last user action, shown in the footer.
    pub notice: Option<String>,
    pub last_refresh: std::time::Instant,
    pub base_url: String,
}

impl AppState {
    pub fn new(base_url: String, owner: String) -> Self {
        Self {
            status: ConnectionStatus::Connecting,
            owner,
            entries: Vec::new(),
            health: HealthView::default(),
            latency: LatencyView::default(),
            notice: None,
            last_refresh: std::time::Instant::now(),
            base_url,
        }
    }

    pub async fn reload(&mut self, client: &reqwest::Client) {
        let watchlist_url = format!("{}/owners/{}/watchlist", self.base_url, self.owner);
        let health_url = format!("{}/health", self.base_url);
        let latency_url = format!("{}/stats/latency", self.base_url);

        let (watchlist_res, health_res, latency_res) = tokio::join!(
            client.get(&watchlist_url).send(),
            client.get(&health_url).send(),
            client.get(&latency_url).send(),
        );

        let resp = match watchlist_res {
            Ok(resp) => resp,
            Err(e) => {
                self.status = ConnectionStatus::Error(format!("{e}"));
                return;
            }
        };

        match resp.json::<Vec<EntryView>>().await {
            Ok(entries) => {
                self.entries = entries;
                self.status = ConnectionStatus::Connected;
                self.last_refresh = std::time::Instant::now();

                if let Ok(h) = health_res {
                    if let Ok(health) = h.json::<HealthView>().await {
                        self.health = health;
                    }
                }
                if let Ok(l) = latency_res {
                    if let Ok(latency) = l.json::<LatencyView>().await {
                        self.latency = latency;
                    }
                }
            }
            Err(e) => {
                self.status = ConnectionStatus::Error(format!("parse error: {e}"));
            }
        }
    }

    /// Ask the service to refresh one entry now, then reload the list.
    pub async fn refresh_entry(&mut self, client: &reqwest::Client, id: i64) {
        let url = format!("{}/owners/{}/watchlist/{}/refresh", self.base_url, self.owner, id);
        self.notice = Some(match client.post(&url).send().await {
            Ok(resp) if resp.status().is_success() => match resp.json::<ValuationView>().await {
                Ok(v) if v.stale => format!("#{id}: refresh failed, showing last known value"),
                Ok(v) => format!("#{id}: {}", format_casp(Some(&v))),
                Err(e) => format!("#{id}: parse error: {e}"),
            },
            Ok(resp) => {
                let status = resp.status();
                match resp.json::<ErrorView>().await {
                    Ok(body) => format!("#{id}: {status} {}", body.error),
                    Err(_) => format!("#{id}: {status}"),
                }
            }
            Err(e) => format!("#{id}: {e}"),
        });
        self.reload(client).await;
    }
}

// ---------------------------------------------------------------------------
// Formatting helpers
// ---------------------------------------------------------------------------

pub fn format_casp(v: Option<&ValuationView>) -> String {
    match v {
        Some(v) if v.sample_size > 0 => format!("{} {}", v.casp, v.currency),
        _ => "—".to_string(),
    }
}

pub fn format_accuracy(v: Option<&ValuationView>) -> String {
    match v {
        Some(v) => format!("{}% {}", v.accuracy_pct, v.accuracy_label),
        None => "—".to_string(),
    }
}

/// Coarse age ("42s", "7m", "3h", "2d") relative to `now`.
pub fn format_age(at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> String {
    let Some(at) = at else {
        return "never".to_string();
    };
    let secs = (now - at).num_seconds().max(0);
    match secs {
        0..=59 => format!("{secs}s"),
        60..=3_599 => format!("{}m", secs / 60),
        3_600..=86_399 => format!("{}h", secs / 3_600),
        _ => format!("{}d", secs / 86_400),
    }
}

pub fn format_filters(filters: &BTreeMap<String, String>) -> String {
    filters
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let head: String = s.chars().take(max.saturating_sub(1)).collect();
        format!("{head}…")
    }
}

fn main() {
    // Entry point lives in src/bin/tui.rs
}
