use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::info;

use crate::db::models::{CompRow, EstimateRow, ValuationRow, WatchlistRow};
use crate::error::{AppError, Result};
use crate::query::{FilterKey, Fingerprint};
use crate::types::{Comp, EntryId, EstimateRecord, Valuation, WatchlistEntry};

/// Durable records behind the valuation cache and the watchlist registry.
/// Cheap to clone; every clone shares one pool.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if missing) the database file and apply migrations.
    pub async fn connect(db_path: &str) -> Result<Self> {
        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{db_path}"))?.create_if_missing(true);
        let pool = SqlitePoolOptions::new().max_connections(5).connect_with(opts).await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        info!("Database ready at {db_path}");
        Ok(Self { pool })
    }

    /// Single-connection in-memory database; the connection must never be
    /// recycled or the data goes with it.
    #[cfg(test)]
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    /// Simulates the store becoming unavailable.
    #[cfg(test)]
    pub async fn close(&self) {
        self.pool.close().await;
    }

    // -----------------------------------------------------------------------
    // Valuations
    // -----------------------------------------------------------------------

    /// Atomic conditional upsert. Returns `false` when the stored artifact is
    /// at least as recent as `valuation` (nothing written). A committed
    /// artifact is appended to the estimate history, with its comps, in the
    /// same transaction.
    pub async fn upsert_valuation(&self, fp: &Fingerprint, valuation: &Valuation, comps: &[Comp]) -> Result<bool> {
        let comps_used = serde_json::to_string(&valuation.comps_used)?;
        let stats = valuation.stats.as_ref().map(serde_json::to_string).transpose()?;

        let mut tx = self.pool.begin().await.map_err(|e| unavailable("begin commit", e))?;

        let result = sqlx::query(
            r#"
            INSERT INTO valuations (
                fingerprint, casp, currency, accuracy_pct, sample_size, spread,
                computed_at, comps_used, stats, source
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(fingerprint) DO UPDATE SET
                casp = excluded.casp,
                currency = excluded.currency,
                accuracy_pct = excluded.accuracy_pct,
                sample_size = excluded.sample_size,
                spread = excluded.spread,
                computed_at = excluded.computed_at,
                comps_used = excluded.comps_used,
                stats = excluded.stats,
                source = excluded.source
            WHERE excluded.computed_at > valuations.computed_at
            "#,
        )
        .bind(fp.as_str())
        .bind(valuation.casp.to_string())
        .bind(valuation.currency.code())
        .bind(i64::from(valuation.accuracy_pct))
        .bind(valuation.sample_size as i64)
        .bind(valuation.spread)
        .bind(valuation.computed_at.timestamp_millis())
        .bind(comps_used)
        .bind(stats)
        .bind(valuation.source.to_string())
        .execute(&mut *tx)
        .await
        .map_err(|e| unavailable("upsert valuation", e))?;

        if result.rows_affected() == 0 {
            tx.rollback().await.map_err(|e| unavailable("rollback commit", e))?;
            return Ok(false);
        }

        let estimate = sqlx::query(
            r#"
            INSERT INTO estimates (
                fingerprint, casp, currency, accuracy_pct, sample_size, spread,
                computed_at, source, recorded_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(fp.as_str())
        .bind(valuation.casp.to_string())
        .bind(valuation.currency.code())
        .bind(i64::from(valuation.accuracy_pct))
        .bind(valuation.sample_size as i64)
        .bind(valuation.spread)
        .bind(valuation.computed_at.timestamp_millis())
        .bind(valuation.source.to_string())
        .bind(Utc::now().timestamp_millis())
        .execute(&mut *tx)
        .await
        .map_err(|e| unavailable("append estimate", e))?;
        let estimate_id = estimate.last_insert_rowid();

        for comp in comps {
            sqlx::query(
                r#"
                INSERT INTO comps (
                    estimate_id, comp_key, title, price, shipping, currency, marketplace, ended_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(estimate_id)
            .bind(&comp.id)
            .bind(&comp.raw_title)
            .bind(comp.price.to_string())
            .bind(comp.shipping.map(|s| s.to_string()))
            .bind(comp.currency.code())
            .bind(comp.source.to_string())
            .bind(comp.ended_at.map(|t| t.timestamp_millis()))
            .execute(&mut *tx)
            .await
            .map_err(|e| unavailable("append comps", e))?;
        }

        tx.commit().await.map_err(|e| unavailable("commit valuation", e))?;
        Ok(true)
    }

    /// Most recent committed estimates for `fp`, newest first, each with its comps.
    pub async fn estimate_history(&self, fp: &Fingerprint, limit: u32) -> Result<Vec<EstimateRecord>> {
        let rows = sqlx::query_as::<_, EstimateRow>(
            "SELECT * FROM estimates WHERE fingerprint = ? ORDER BY computed_at DESC, id DESC LIMIT ?",
        )
        .bind(fp.as_str())
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| unavailable("load estimate history", e))?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let comps = sqlx::query_as::<_, CompRow>("SELECT * FROM comps WHERE estimate_id = ? ORDER BY id ASC")
                .bind(row.id)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| unavailable("load estimate comps", e))?
                .into_iter()
                .map(CompRow::into_comp)
                .collect::<Result<Vec<_>>>()?;
            records.push(row.into_record(comps)?);
        }
        Ok(records)
    }

    pub async fn get_valuation(&self, fp: &Fingerprint) -> Result<Option<Valuation>> {
        let row = sqlx::query_as::<_, ValuationRow>("SELECT * FROM valuations WHERE fingerprint = ?")
            .bind(fp.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| unavailable("load valuation", e))?;
        row.map(|r| r.into_valuation().map(|(_, v)| v)).transpose()
    }

    pub async fn load_valuations(&self) -> Result<Vec<(Fingerprint, Valuation)>> {
        let rows = sqlx::query_as::<_, ValuationRow>("SELECT * FROM valuations")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| unavailable("load valuations", e))?;
        rows.into_iter().map(ValuationRow::into_valuation).collect()
    }

    // -----------------------------------------------------------------------
    // Watchlist
    // -----------------------------------------------------------------------

    pub async fn insert_entry(
        &self,
        owner_id: &str,
        display_text: &str,
        filters: &BTreeMap<FilterKey, String>,
        fp: &Fingerprint,
        created_at: DateTime<Utc>,
    ) -> Result<WatchlistEntry> {
        let filters_json = serde_json::to_string(filters)?;
        let result = sqlx::query(
            r#"
            INSERT INTO watchlist (owner_id, display_text, filters, fingerprint, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(owner_id)
        .bind(display_text)
        .bind(filters_json)
        .bind(fp.as_str())
        .bind(created_at.timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(|e| unavailable("insert watchlist entry", e))?;

        Ok(WatchlistEntry {
            id: result.last_insert_rowid(),
            owner_id: owner_id.to_string(),
            display_text: display_text.to_string(),
            filters: filters.clone(),
            fingerprint: fp.clone(),
            created_at,
            last_refreshed_at: None,
            last_valuation: None,
        })
    }

    /// Deletes only when the entry belongs to `owner_id`. Returns whether a row went away.
    pub async fn delete_entry(&self, owner_id: &str, id: EntryId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM watchlist WHERE id = ? AND owner_id = ?")
            .bind(id)
            .bind(owner_id)
            .execute(&self.pool)
            .await
            .map_err(|e| unavailable("delete watchlist entry", e))?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn get_entry(&self, owner_id: &str, id: EntryId) -> Result<Option<WatchlistEntry>> {
        let row = sqlx::query_as::<_, WatchlistRow>(
            "SELECT * FROM watchlist WHERE id = ? AND owner_id = ?",
        )
        .bind(id)
        .bind(owner_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| unavailable("load watchlist entry", e))?;
        row.map(WatchlistRow::into_entry).transpose()
    }

    /// Creation order.
    pub async fn list_entries(&self, owner_id: &str) -> Result<Vec<WatchlistEntry>> {
        let rows = sqlx::query_as::<_, WatchlistRow>(
            "SELECT * FROM watchlist WHERE owner_id = ? ORDER BY id ASC",
        )
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| unavailable("list watchlist", e))?;
        rows.into_iter().map(WatchlistRow::into_entry).collect()
    }

    pub async fn all_entries(&self) -> Result<Vec<WatchlistEntry>> {
        let rows = sqlx::query_as::<_, WatchlistRow>("SELECT * FROM watchlist ORDER BY id ASC")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| unavailable("list all watchlist entries", e))?;
        rows.into_iter().map(WatchlistRow::into_entry).collect()
    }

    /// Advance the entry's refresh time and snapshot. Returns `false` if the
    /// entry was removed in the meantime or already holds a newer snapshot.
    pub async fn record_entry_refresh(
        &self,
        id: EntryId,
        refreshed_at: DateTime<Utc>,
        snapshot: &Valuation,
    ) -> Result<bool> {
        let snapshot_json = serde_json::to_string(snapshot)?;
        let computed_at = snapshot.computed_at.timestamp_millis();
        let result = sqlx::query(
            r#"
            UPDATE watchlist
            SET last_refreshed_at = ?, last_valuation = ?, last_computed_at = ?
            WHERE id = ? AND (last_computed_at IS NULL OR last_computed_at <= ?)
            "#,
        )
        .bind(refreshed_at.timestamp_millis())
        .bind(snapshot_json)
        .bind(computed_at)
        .bind(id)
        .bind(computed_at)
        .execute(&self.pool)
        .await
        .map_err(|e| unavailable("record watchlist refresh", e))?;
        Ok(result.rows_affected() == 1)
    }
}

fn unavailable(op: &str, e: sqlx::Error) -> AppError {
    AppError::Persistence(format!("{op}: {e}"))
}
