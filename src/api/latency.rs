//! In-memory latency histogram for comp acquisition calls.
//! The orchestrator records every attempt (timeouts included); the API reads.

use std::sync::Mutex;
use std::time::Duration;

use crate::error::{AppError, Result};

/// Values stored in milliseconds.
pub struct LatencyStats {
    inner: Mutex<hdrhistogram::Histogram<u64>>,
}

impl LatencyStats {
    /// Tracks 1ms to 10min, 3 significant figures.
    pub fn new() -> Result<Self> {
        let histogram = hdrhistogram::Histogram::new_with_bounds(1, 600_000, 3)
            .map_err(|e| AppError::Config(format!("latency histogram: {e}")))?;
        Ok(Self { inner: Mutex::new(histogram) })
    }

    pub fn record(&self, d: Duration) {
        let ms = d.as_millis().clamp(1, 600_000) as u64;
        if let Ok(mut h) = self.inner.lock() {
            let _ = h.record(ms);
        }
    }

    /// (p50_ms, p95_ms, p99_ms). None if no samples.
    pub fn percentiles(&self) -> (Option<u64>, Option<u64>, Option<u64>) {
        let Ok(h) = self.inner.lock() else {
            return (None, None, None);
        };
        if h.len() == 0 {
            return (None, None, None);
        }
        (
            Some(h.value_at_quantile(0.5)),
            Some(h.value_at_quantile(0.95)),
            Some(h.value_at_quantile(0.99)),
        )
    }

    pub fn len(&self) -> u64 {
        self.inner.lock().map(|h| h.len()).unwrap_or(0)
    }
}
