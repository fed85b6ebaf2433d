use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::db::SqliteStore;
use crate::error::{AppError, Result};
use crate::query::{QueryInput, QuerySpec};
use crate::types::{now_ms, EntryId, Valuation, WatchlistEntry};

const MAX_OWNER_ID_LEN: usize = 128;

/// Owner-scoped tracked queries. Holds no valuation state of its own.
pub struct WatchlistRegistry {
    store: SqliteStore,
}

impl WatchlistRegistry {
    pub fn new(store: SqliteStore) -> Arc<Self> {
        Arc::new(Self { store })
    }

    /// Store the caller's text verbatim with its derived fingerprint.
    /// Nothing is computed here; the next refresh picks the entry up.
    pub async fn add(&self, owner_id: &str, input: &QueryInput) -> Result<WatchlistEntry> {
        validate_owner(owner_id)?;
        let spec = QuerySpec::from_input(input)?;
        let entry = self
            .store
            .insert_entry(owner_id, &spec.display, &spec.filters, &spec.fingerprint(), now_ms())
            .await?;
        info!(owner = owner_id, id = entry.id, fingerprint = %entry.fingerprint, "Watchlist entry added");
        Ok(entry)
    }

    /// Removing an entry that does not exist, or belongs to someone else, is NotFound.
    pub async fn remove(&self, owner_id: &str, id: EntryId) -> Result<()> {
        if !self.store.delete_entry(owner_id, id).await? {
            return Err(not_found(owner_id, id));
        }
        info!(owner = owner_id, id, "Watchlist entry removed");
        Ok(())
    }

    pub async fn get(&self, owner_id: &str, id: EntryId) -> Result<WatchlistEntry> {
        self.store.get_entry(owner_id, id).await?.ok_or_else(|| not_found(owner_id, id))
    }

    /// Entries in creation order.
    pub async fn list(&self, owner_id: &str) -> Result<Vec<WatchlistEntry>> {
        self.store.list_entries(owner_id).await
    }

    /// Every entry across owners, for the scheduled sweep.
    pub async fn all(&self) -> Result<Vec<WatchlistEntry>> {
        self.store.all_entries().await
    }

    /// Advance `last_refreshed_at` and the denormalized snapshot. A snapshot
    /// older than the one already recorded is ignored.
    pub async fn record_refresh(
        &self,
        id: EntryId,
        refreshed_at: DateTime<Utc>,
        snapshot: &Valuation,
    ) -> Result<()> {
        // Deleted mid-refresh, or overtaken by a newer snapshot: nothing to update.
        if !self.store.record_entry_refresh(id, refreshed_at, snapshot).await? {
            debug!(id, computed_at = %snapshot.computed_at, "Watchlist snapshot not advanced");
        }
        Ok(())
    }
}

/// Rebuild the validated query an entry tracks. The display text is reused
/// as-is, so the fingerprint matches the one stored at creation.
pub fn query_for(entry: &WatchlistEntry) -> Result<QuerySpec> {
    QuerySpec::new(&entry.display_text, entry.filters.clone())
}

fn validate_owner(owner_id: &str) -> Result<()> {
    if owner_id.trim().is_empty() {
        return Err(AppError::validation("owner_id", "must not be empty"));
    }
    if owner_id.len() > MAX_OWNER_ID_LEN {
        return Err(AppError::validation("owner_id", format!("longer than {MAX_OWNER_ID_LEN} bytes")));
    }
    Ok(())
}

fn not_found(owner_id: &str, id: EntryId) -> AppError {
    AppError::NotFound(format!("watchlist entry {id} for owner '{owner_id}'"))
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;
    use crate::state::ValuationCache;
    use crate::testkit::{memory_store, valuation_at};

    #[tokio::test]
    async fn list_keeps_creation_order_and_verbatim_text() {
        let registry = WatchlistRegistry::new(memory_store().await);
        for q in ["Carhartt J01  Detroit", "Levi's 501 W32", "ARC'TERYX beta lt"] {
            registry.add("alice", &QueryInput::text(q)).await.unwrap();
        }
        registry.add("bob", &QueryInput::text("Nike Dunk")).await.unwrap();

        let listed = registry.list("alice").await.unwrap();
        let texts: Vec<_> = listed.iter().map(|e| e.display_text.as_str()).collect();
        assert_eq!(texts, vec!["Carhartt J01  Detroit", "Levi's 501 W32", "ARC'TERYX beta lt"]);
        assert_eq!(listed[0].fingerprint.as_str(), "carhartt j01 detroit");
        assert!(listed.iter().all(|e| e.last_refreshed_at.is_none() && e.last_valuation.is_none()));
        assert_eq!(query_for(&listed[0]).unwrap().fingerprint(), listed[0].fingerprint);
    }

    #[tokio::test]
    async fn removing_missing_entry_is_not_found_and_changes_nothing() {
        let store = memory_store().await;
        let registry = WatchlistRegistry::new(store.clone());
        let cache = ValuationCache::new(store);

        let kept = registry.add("alice", &QueryInput::text("Carhartt J01")).await.unwrap();
        let v = valuation_at(dec!(100), Utc::now().timestamp_millis());
        cache.put(&kept.fingerprint, v.clone(), &[]).await.unwrap();

        let err = registry.remove("alice", kept.id + 100).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
        let err = registry.remove("mallory", kept.id).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));

        assert_eq!(registry.list("alice").await.unwrap().len(), 1);
        assert_eq!(cache.get(&kept.fingerprint), Some(v.clone()));

        // Removing the real entry leaves valuation state alone as well.
        registry.remove("alice", kept.id).await.unwrap();
        assert!(registry.list("alice").await.unwrap().is_empty());
        assert_eq!(cache.get(&kept.fingerprint), Some(v));
    }

    #[tokio::test]
    async fn invalid_input_is_rejected_before_storage() {
        let registry = WatchlistRegistry::new(memory_store().await);
        assert!(matches!(
            registry.add("", &QueryInput::text("j01")).await,
            Err(AppError::Validation { field: "owner_id", .. })
        ));
        assert!(matches!(
            registry.add("alice", &QueryInput::text("  ")).await,
            Err(AppError::Validation { field: "q", .. })
        ));
        assert!(registry.all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn refresh_updates_snapshot() {
        let registry = WatchlistRegistry::new(memory_store().await);
        let e = registry.add("alice", &QueryInput::text("j01")).await.unwrap();
        let v = valuation_at(dec!(88), 5_000);
        registry.record_refresh(e.id, v.computed_at, &v).await.unwrap();

        let loaded = registry.get("alice", e.id).await.unwrap();
        assert_eq!(loaded.last_refreshed_at, Some(v.computed_at));
        assert_eq!(loaded.last_valuation, Some(v));
    }
}
