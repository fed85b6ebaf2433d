use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, info};

use crate::db::SqliteStore;
use crate::error::Result;
use crate::query::Fingerprint;
use crate::types::{Comp, EstimateRecord, Valuation};

/// Result of a linearized write.
#[derive(Debug, Clone, PartialEq)]
pub enum CommitOutcome {
    Committed,
    /// A valuation at least as recent was already committed; it is returned
    /// and the offered one was discarded.
    Superseded(Valuation),
}

/// Fingerprint → last committed valuation.
///
/// Reads are served from memory and never compute or block on a refresh.
/// Writes go to the store first; memory only changes after the store has
/// accepted the artifact, so a failed write leaves both untouched.
pub struct ValuationCache {
    entries: DashMap<Fingerprint, Valuation>,
    store: SqliteStore,
}

impl ValuationCache {
    pub fn new(store: SqliteStore) -> Arc<Self> {
        Arc::new(Self { entries: DashMap::new(), store })
    }

    /// Load every persisted valuation into memory. Called once at startup.
    pub async fn hydrate(&self) -> Result<usize> {
        let rows = self.store.load_valuations().await?;
        let count = rows.len();
        for (fp, valuation) in rows {
            self.entries.insert(fp, valuation);
        }
        info!("Valuation cache hydrated with {count} artifacts");
        Ok(count)
    }

    pub fn get(&self, fp: &Fingerprint) -> Option<Valuation> {
        self.entries.get(fp).map(|v| v.value().clone())
    }

    /// Absent entries count as stale.
    pub fn is_stale(&self, fp: &Fingerprint, max_age: Duration) -> bool {
        match self.entries.get(fp) {
            Some(v) => expired(v.value(), max_age),
            None => true,
        }
    }

    /// Last-write-wins by `computed_at`: an artifact older than (or as old as)
    /// the committed one is discarded. `comps` are the comps behind the
    /// artifact; they go to the estimate history along with it.
    pub async fn put(&self, fp: &Fingerprint, valuation: Valuation, comps: &[Comp]) -> Result<CommitOutcome> {
        if let Some(current) = self.fresher_than(fp, &valuation) {
            return Ok(CommitOutcome::Superseded(current));
        }

        if !self.store.upsert_valuation(fp, &valuation, comps).await? {
            // The store holds something newer that memory has not seen.
            let stored = self.store.get_valuation(fp).await?;
            debug!(fingerprint = %fp, "Discarded stale valuation write");
            return Ok(match stored {
                Some(stored) => CommitOutcome::Superseded(self.install(fp, stored)),
                None => CommitOutcome::Superseded(valuation),
            });
        }

        match self.entries.entry(fp.clone()) {
            Entry::Occupied(o) if o.get().computed_at >= valuation.computed_at => {
                Ok(CommitOutcome::Superseded(o.get().clone()))
            }
            Entry::Occupied(mut o) => {
                o.insert(valuation);
                Ok(CommitOutcome::Committed)
            }
            Entry::Vacant(v) => {
                v.insert(valuation);
                Ok(CommitOutcome::Committed)
            }
        }
    }

    /// Committed artifacts for `fp`, newest first, read from the store.
    pub async fn history(&self, fp: &Fingerprint, limit: u32) -> Result<Vec<EstimateRecord>> {
        self.store.estimate_history(fp, limit).await
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    fn fresher_than(&self, fp: &Fingerprint, valuation: &Valuation) -> Option<Valuation> {
        self.entries
            .get(fp)
            .filter(|current| current.computed_at >= valuation.computed_at)
            .map(|current| current.value().clone())
    }

    /// Install `candidate` unless memory already has something at least as new;
    /// returns whichever is newest.
    fn install(&self, fp: &Fingerprint, candidate: Valuation) -> Valuation {
        match self.entries.entry(fp.clone()) {
            Entry::Occupied(o) if o.get().computed_at >= candidate.computed_at => o.get().clone(),
            Entry::Occupied(mut o) => {
                o.insert(candidate.clone());
                candidate
            }
            Entry::Vacant(v) => {
                v.insert(candidate.clone());
                candidate
            }
        }
    }
}

/// `now - computed_at > max_age`. The cache has no TTL of its own.
pub fn expired(valuation: &Valuation, max_age: Duration) -> bool {
    match Utc::now().signed_duration_since(valuation.computed_at).to_std() {
        Ok(age) => age > max_age,
        // computed_at in the future
        Err(_) => false,
    }
}
