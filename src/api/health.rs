//! Shared health state for the /health endpoint.
//! Updated by the refresh orchestrator and the watchlist sweep.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use serde::Serialize;

/// Refresh and sweep counters. Observability only; nothing reads them to decide behavior.
#[derive(Default)]
pub struct HealthState {
    refreshes_in_flight: AtomicU64,
    refreshes_completed: AtomicU64,
    /// Acquisition errors and timeouts (each one fell back to the cache).
    acquisition_failures: AtomicU64,
    /// Callers that attached to an already running refresh.
    coalesced_joins: AtomicU64,
    /// Watchlist refreshes that did not advance their entry.
    entry_refresh_failures: AtomicU64,
    sweeps_completed: AtomicU64,
    /// Epoch millis of the last finished sweep (0 = none yet).
    last_sweep_at_ms: AtomicI64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub refreshes_in_flight: u64,
    pub refreshes_completed: u64,
    pub acquisition_failures: u64,
    pub coalesced_joins: u64,
    pub entry_refresh_failures: u64,
    pub sweeps_completed: u64,
    pub last_sweep_at_ms: Option<i64>,
}

impl HealthState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn refresh_started(&self) {
        self.refreshes_in_flight.fetch_add(1, Ordering::Relaxed);
    }

    pub fn refresh_finished(&self) {
        self.refreshes_in_flight.fetch_sub(1, Ordering::Relaxed);
        self.refreshes_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_acquisition_failures(&self) {
        self.acquisition_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_coalesced_joins(&self) {
        self.coalesced_joins.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_entry_refresh_failures(&self) {
        self.entry_refresh_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn sweep_finished(&self, at_ms: i64) {
        self.sweeps_completed.fetch_add(1, Ordering::Relaxed);
        self.last_sweep_at_ms.store(at_ms, Ordering::Relaxed);
    }

    pub fn acquisition_failures(&self) -> u64 {
        self.acquisition_failures.load(Ordering::Relaxed)
    }

    pub fn coalesced_joins(&self) -> u64 {
        self.coalesced_joins.load(Ordering::Relaxed)
    }

    pub fn entry_refresh_failures(&self) -> u64 {
        self.entry_refresh_failures.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        let last = self.last_sweep_at_ms.load(Ordering::Relaxed);
        HealthSnapshot {
            refreshes_in_flight: self.refreshes_in_flight.load(Ordering::Relaxed),
            refreshes_completed: self.refreshes_completed.load(Ordering::Relaxed),
            acquisition_failures: self.acquisition_failures(),
            coalesced_joins: self.coalesced_joins(),
            entry_refresh_failures: self.entry_refresh_failures(),
            sweeps_completed: self.sweeps_completed.load(Ordering::Relaxed),
            last_sweep_at_ms: (last > 0).then_some(last),
        }
    }
}
