use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use tokio::time::interval;
use tracing::{error, info, warn};

use crate::api::health::HealthState;
use crate::error::Result;
use crate::refresh::{RefreshOrchestrator, RefreshOutcome};
use crate::state::watchlist::{query_for, WatchlistRegistry};
use crate::types::{now_ms, EntryId, WatchlistEntry};

#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    pub entries: usize,
    pub refreshed: usize,
    pub failed: usize,
    /// `entry <id>: <message>` for refreshes that errored outright.
    pub errors: Vec<String>,
}

/// Keeps watchlist valuations current: one entry on demand, or every entry
/// on a fixed cadence with bounded concurrency.
pub struct WatchlistRefresher {
    orchestrator: Arc<RefreshOrchestrator>,
    registry: Arc<WatchlistRegistry>,
    health: Arc<HealthState>,
    interval: Duration,
    max_concurrent: usize,
}

impl WatchlistRefresher {
    pub fn new(
        orchestrator: Arc<RefreshOrchestrator>,
        registry: Arc<WatchlistRegistry>,
        health: Arc<HealthState>,
        interval: Duration,
        max_concurrent: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            orchestrator,
            registry,
            health,
            interval,
            max_concurrent: max_concurrent.max(1),
        })
    }

    pub async fn run(self: Arc<Self>) {
        let mut ticker = interval(self.interval);
        ticker.tick().await; // skip immediate first tick

        loop {
            ticker.tick().await;
            if let Err(e) = self.refresh_all().await {
                error!("Watchlist sweep failed: {e}");
            }
        }
    }

    /// Refresh one owned entry. NotFound if it does not exist or is not the owner's.
    pub async fn refresh_one(&self, owner_id: &str, id: EntryId) -> Result<RefreshOutcome> {
        let entry = self.registry.get(owner_id, id).await?;
        self.refresh_entry(&entry).await
    }

    /// Refresh every entry, at most `max_concurrent` at a time. Entries fail
    /// independently; only failing to read the registry fails the sweep.
    pub async fn refresh_all(&self) -> Result<SweepReport> {
        let entries = self.registry.all().await?;
        let mut report = SweepReport { entries: entries.len(), ..SweepReport::default() };

        let results: Vec<(EntryId, Result<RefreshOutcome>)> = stream::iter(entries)
            .map(|entry| async move {
                let result = self.refresh_entry(&entry).await;
                (entry.id, result)
            })
            .buffer_unordered(self.max_concurrent)
            .collect()
            .await;

        for (id, result) in results {
            match result {
                Ok(outcome) if outcome.advanced() => report.refreshed += 1,
                Ok(_) => report.failed += 1,
                Err(e) => {
                    report.failed += 1;
                    report.errors.push(format!("entry {id}: {e}"));
                }
            }
        }

        self.health.sweep_finished(now_ms().timestamp_millis());
        info!(
            entries = report.entries,
            refreshed = report.refreshed,
            failed = report.failed,
            "Watchlist sweep complete: {}/{} refreshed",
            report.refreshed,
            report.entries,
        );
        Ok(report)
    }

    /// Only a refresh that advanced the cache moves `last_refreshed_at`; a
    /// failed acquisition is counted and logged and leaves the entry as it was.
    async fn refresh_entry(&self, entry: &WatchlistEntry) -> Result<RefreshOutcome> {
        let query = query_for(entry)?;
        let outcome = match self.orchestrator.refresh(&query).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.health.inc_entry_refresh_failures();
                return Err(e);
            }
        };

        if outcome.advanced() {
            self.registry.record_refresh(entry.id, now_ms(), &outcome.valuation).await?;
        } else {
            self.health.inc_entry_refresh_failures();
            warn!(
                id = entry.id,
                owner = %entry.owner_id,
                fingerprint = %entry.fingerprint,
                "Watchlist entry not refreshed: {:?}",
                outcome.status,
            );
        }
        Ok(outcome)
    }
}
