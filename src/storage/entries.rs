use chrono::{DateTime, TimeDelta, Utc};
use sqlx::{QueryBuilder, SqliteConnection};
use std::collections::{HashMap, HashSet};

use super::schema::Database;
use super::types::{
    to_ts, DatabaseError, EntryDbRow, FeedEntry, FeedMeta, Lease, NewEntry, StoreStats,
};

/// Maximum number of entries to return from any single query
const MAX_ENTRIES: i64 = 2000;

/// 6 columns * 100 rows stays well under SQLite's bound-parameter limit
const INSERT_BATCH_SIZE: usize = 100;

impl Database {
    // ========================================================================
    // Entry Operations
    // ========================================================================

    /// Append entries for a feed, returns the number of new entries inserted.
    ///
    /// Entries whose link is already stored for the feed are skipped and the
    /// stored row is left untouched: the first version seen wins. Entries are
    /// inserted in the given order inside one transaction.
    pub async fn append_entries(
        &self,
        feed_id: i64,
        entries: &[NewEntry],
    ) -> Result<usize, DatabaseError> {
        if entries.is_empty() {
            return Ok(0);
        }

        let entries: Vec<&NewEntry> = entries.iter().collect();
        let mut tx = self.pool.begin().await?;
        let inserted = insert_entries(&mut tx, feed_id, &entries, Utc::now()).await?;
        tx.commit().await?;
        Ok(inserted)
    }

    /// Delete entries of a feed that are older than `retention`.
    ///
    /// Age is the publish time, or the first-seen time for entries without one.
    /// Pruned links are remembered so that a later refresh does not store them
    /// again while they are still outside the window.
    pub async fn prune_stale(
        &self,
        feed_id: i64,
        retention: TimeDelta,
    ) -> Result<u64, DatabaseError> {
        let mut conn = self.pool.acquire().await?;
        prune_entries(&mut conn, feed_id, Utc::now() - retention, i64::MAX).await
    }

    /// Store the result of a refresh and release its claim, atomically.
    ///
    /// In one transaction: copy channel metadata onto the feed, append the
    /// entries, prune entries older than `retention` that were stored before
    /// this refresh, clear the claim and schedule the next refresh `cooldown`
    /// from now. Entries inserted by this refresh are never pruned by it, even
    /// if already older than the window; the next refresh prunes them.
    ///
    /// A link that retention already pruned is not stored again while it is
    /// still older than the window, so an old item that stays in the
    /// document is stored once and pruned once. The record of a pruned link
    /// is dropped once the document no longer lists it.
    ///
    /// If the lease is no longer held, nothing is written and
    /// [`DatabaseError::LeaseLost`] is returned.
    pub async fn complete_refresh(
        &self,
        lease: &Lease,
        meta: &FeedMeta,
        entries: &[NewEntry],
        retention: TimeDelta,
        cooldown: TimeDelta,
    ) -> Result<StoreStats, DatabaseError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        // Writing first takes the write lock up front and doubles as the lease check
        let owned = sqlx::query(
            r#"
            UPDATE feeds SET title = ?, link = ?, description = ?
            WHERE id = ? AND lease_epoch = ? AND claimed = 1
        "#,
        )
        .bind(&meta.title)
        .bind(&meta.link)
        .bind(&meta.description)
        .bind(lease.feed_id)
        .bind(lease.epoch)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if owned == 0 {
            // Dropping the transaction rolls it back
            return Err(DatabaseError::LeaseLost {
                feed_id: lease.feed_id,
                epoch: lease.epoch,
            });
        }

        // Rows at or below the watermark existed before this refresh
        let (watermark,): (i64,) = sqlx::query_as("SELECT COALESCE(MAX(id), 0) FROM feed_entries")
            .fetch_one(&mut *tx)
            .await?;

        let cutoff = to_ts(now - retention);
        let tombstones = pruned_links(&mut tx, lease.feed_id).await?;
        let fresh: Vec<&NewEntry> = entries
            .iter()
            .filter(|entry| match tombstones.get(&entry.link) {
                Some(&aged_at) => entry.published.map(to_ts).unwrap_or(aged_at) >= cutoff,
                None => true,
            })
            .collect();

        let inserted = insert_entries(&mut tx, lease.feed_id, &fresh, now).await?;
        let pruned = prune_entries(&mut tx, lease.feed_id, now - retention, watermark).await?;

        let listed: HashSet<&str> = entries.iter().map(|e| e.link.as_str()).collect();
        let unlisted: Vec<String> = pruned_links(&mut tx, lease.feed_id)
            .await?
            .into_keys()
            .filter(|link| !listed.contains(link.as_str()))
            .collect();
        forget_pruned_links(&mut tx, lease.feed_id, &unlisted).await?;

        sqlx::query(
            r#"
            UPDATE feeds
            SET claimed = 0, claim_expires_at = NULL, next_eligible_at = ?,
                last_refreshed_at = ?, last_error = NULL
            WHERE id = ?
        "#,
        )
        .bind(to_ts(now + cooldown))
        .bind(to_ts(now))
        .bind(lease.feed_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(StoreStats { inserted, pruned })
    }

    // ========================================================================
    // Entry Queries
    // ========================================================================

    /// Entries of a feed, newest first, capped at 2000.
    pub async fn get_entries(
        &self,
        feed_id: i64,
        limit: Option<i64>,
    ) -> Result<Vec<FeedEntry>, DatabaseError> {
        let limit = limit.unwrap_or(500).clamp(0, MAX_ENTRIES);
        let rows: Vec<EntryDbRow> = sqlx::query_as(
            r#"
            SELECT id, feed_id, title, link, description, published, fetched_at
            FROM feed_entries
            WHERE feed_id = ?
            ORDER BY COALESCE(published, fetched_at) DESC, id DESC
            LIMIT ?
        "#,
        )
        .bind(feed_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(EntryDbRow::into_entry).collect())
    }

    /// Number of stored entries for a feed.
    pub async fn count_entries(&self, feed_id: i64) -> Result<i64, DatabaseError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM feed_entries WHERE feed_id = ?")
            .bind(feed_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

/// INSERT OR IGNORE keyed by UNIQUE(feed_id, link); duplicates inside the
/// batch also keep their first occurrence.
async fn insert_entries(
    conn: &mut SqliteConnection,
    feed_id: i64,
    entries: &[&NewEntry],
    fetched_at: DateTime<Utc>,
) -> Result<usize, DatabaseError> {
    let fetched_at = to_ts(fetched_at);
    let mut inserted = 0usize;

    for chunk in entries.chunks(INSERT_BATCH_SIZE) {
        let mut builder: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new(
            "INSERT OR IGNORE INTO feed_entries (feed_id, title, link, description, published, fetched_at) ",
        );

        builder.push_values(chunk, |mut b, entry| {
            b.push_bind(feed_id)
                .push_bind(&entry.title)
                .push_bind(&entry.link)
                .push_bind(&entry.description)
                .push_bind(entry.published.map(to_ts))
                .push_bind(fetched_at);
        });

        let result = builder.build().execute(&mut *conn).await?;
        inserted += result.rows_affected() as usize;
    }

    Ok(inserted)
}

async fn prune_entries(
    conn: &mut SqliteConnection,
    feed_id: i64,
    cutoff: DateTime<Utc>,
    max_id: i64,
) -> Result<u64, DatabaseError> {
    sqlx::query(
        r#"
        INSERT INTO pruned_links (feed_id, link, aged_at)
        SELECT feed_id, link, COALESCE(published, fetched_at)
        FROM feed_entries
        WHERE feed_id = ? AND COALESCE(published, fetched_at) < ? AND id <= ?
        ON CONFLICT(feed_id, link) DO UPDATE SET aged_at = excluded.aged_at
    "#,
    )
    .bind(feed_id)
    .bind(to_ts(cutoff))
    .bind(max_id)
    .execute(&mut *conn)
    .await?;

    let result = sqlx::query(
        r#"
        DELETE FROM feed_entries
        WHERE feed_id = ? AND COALESCE(published, fetched_at) < ? AND id <= ?
    "#,
    )
    .bind(feed_id)
    .bind(to_ts(cutoff))
    .bind(max_id)
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected())
}

/// Links of a feed removed by retention, with the age they were pruned at.
async fn pruned_links(
    conn: &mut SqliteConnection,
    feed_id: i64,
) -> Result<HashMap<String, i64>, DatabaseError> {
    let rows: Vec<(String, i64)> =
        sqlx::query_as("SELECT link, aged_at FROM pruned_links WHERE feed_id = ?")
            .bind(feed_id)
            .fetch_all(&mut *conn)
            .await?;
    Ok(rows.into_iter().collect())
}

async fn forget_pruned_links(
    conn: &mut SqliteConnection,
    feed_id: i64,
    links: &[String],
) -> Result<(), DatabaseError> {
    for chunk in links.chunks(INSERT_BATCH_SIZE) {
        let mut builder: QueryBuilder<sqlx::Sqlite> =
            QueryBuilder::new("DELETE FROM pruned_links WHERE feed_id = ");
        builder.push_bind(feed_id).push(" AND link IN (");
        let mut separated = builder.separated(", ");
        for link in chunk {
            separated.push_bind(link);
        }
        separated.push_unseparated(")");
        builder.build().execute(&mut *conn).await?;
    }
    Ok(())
}
