use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::config::{Config, COMPS_RETRY_BACKOFF_MS};
use crate::error::{AcquisitionError, Result};
use crate::query::QuerySpec;
use crate::types::RawListing;

/// External sold-listing acquisition. Implementations do no normalization.
#[async_trait]
pub trait CompSource: Send + Sync {
    async fn fetch_listings(
        &self,
        query: &QuerySpec,
    ) -> std::result::Result<Vec<RawListing>, AcquisitionError>;
}

/// REST client for the sold-listing acquisition service.
///
/// `GET {base}/sold?q=<terms>&page=<n>` returns a JSON array of tagged raw
/// listings. Pages are walked from 1 up to `pages`, stopping at the first empty one.
/// Throttled (429) and 5xx responses are retried with growing waits.
pub struct HttpCompSource {
    client: reqwest::Client,
    base_url: String,
    pages: u32,
    backoff: Vec<Duration>,
}

impl HttpCompSource {
    pub fn new(base_url: impl Into<String>, pages: u32, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            pages: pages.max(1),
            backoff: COMPS_RETRY_BACKOFF_MS.iter().map(|ms| Duration::from_millis(*ms)).collect(),
        })
    }

    pub fn with_backoff(mut self, backoff: Vec<Duration>) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn from_config(cfg: &Config) -> Result<Self> {
        Self::new(&cfg.comps_api_url, cfg.comps_pages, cfg.acquisition_timeout)
    }

    async fn fetch_page(
        &self,
        terms: &str,
        page: u32,
    ) -> std::result::Result<Vec<RawListing>, AcquisitionError> {
        let url = format!("{}/sold", self.base_url);
        let page = page.to_string();
        let mut attempt = 0usize;

        let resp = loop {
            let resp = self
                .client
                .get(&url)
                .query(&[("q", terms), ("page", page.as_str())])
                .send()
                .await
                .map_err(transport_error)?;

            let status = resp.status();
            let retryable = status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error();
            match self.backoff.get(attempt) {
                Some(wait) if retryable => {
                    warn!(page = %page, attempt = attempt + 1, "Comp source answered {status}, retrying in {wait:?}");
                    tokio::time::sleep(*wait).await;
                    attempt += 1;
                }
                _ => break resp,
            }
        };

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(AcquisitionError::NotFound);
        }
        let resp = resp.error_for_status().map_err(transport_error)?;
        let body = resp.bytes().await.map_err(transport_error)?;

        serde_json::from_slice::<Vec<RawListing>>(&body)
            .map_err(|e| AcquisitionError::Parse(e.to_string()))
    }
}

#[async_trait]
impl CompSource for HttpCompSource {
    async fn fetch_listings(
        &self,
        query: &QuerySpec,
    ) -> std::result::Result<Vec<RawListing>, AcquisitionError> {
        let terms = query.search_terms();
        let mut listings = Vec::new();

        for page in 1..=self.pages {
            let batch = self.fetch_page(&terms, page).await?;
            debug!(page, count = batch.len(), "Fetched sold listings page for '{terms}'");
            if batch.is_empty() {
                break;
            }
            listings.extend(batch);
        }

        if listings.is_empty() {
            warn!("Comp source returned no sold listings for '{terms}'");
            return Err(AcquisitionError::NotFound);
        }
        Ok(listings)
    }
}

fn transport_error(e: reqwest::Error) -> AcquisitionError {
    if e.is_timeout() {
        AcquisitionError::Timeout
    } else if e.is_decode() {
        AcquisitionError::Parse(e.to_string())
    } else if e.status() == Some(reqwest::StatusCode::NOT_FOUND) {
        AcquisitionError::NotFound
    } else {
        AcquisitionError::Network(e.to_string())
    }
}
