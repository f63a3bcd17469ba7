use chrono::{DateTime, TimeDelta, Utc};

use super::schema::Database;
use super::types::{
    to_ts, Claim, DatabaseError, Feed, FeedDbRow, Lease, Release, FEED_COLUMNS,
};

impl Database {
    // ========================================================================
    // Feed Operations
    // ========================================================================

    /// Insert or update a feed, returning its identity.
    ///
    /// An unsaved feed (`id == 0`) is inserted. If its URL is already stored the
    /// existing row's title, link and description are updated instead, so
    /// re-adding a feed never creates a twin and never changes its visibility.
    /// A persisted feed has its mutable attributes (url, title, link,
    /// description, hidden) updated in place. Claim state is never touched here.
    pub async fn upsert_feed(&self, feed: &Feed) -> Result<i64, DatabaseError> {
        if !feed.is_persisted() {
            let (id,): (i64,) = sqlx::query_as(
                r#"
                INSERT INTO feeds (url, title, link, description, hidden)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT(url) DO UPDATE SET
                    title = excluded.title,
                    link = excluded.link,
                    description = excluded.description
                RETURNING id
            "#,
            )
            .bind(&feed.url)
            .bind(&feed.title)
            .bind(&feed.link)
            .bind(&feed.description)
            .bind(feed.hidden)
            .fetch_one(&self.pool)
            .await?;
            return Ok(id);
        }

        let result = sqlx::query(
            "UPDATE feeds SET url = ?, title = ?, link = ?, description = ?, hidden = ? WHERE id = ?",
        )
        .bind(&feed.url)
        .bind(&feed.title)
        .bind(&feed.link)
        .bind(&feed.description)
        .bind(feed.hidden)
        .bind(feed.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound(feed.id));
        }
        Ok(feed.id)
    }

    /// Get a single feed by id.
    pub async fn get_feed(&self, feed_id: i64) -> Result<Option<Feed>, DatabaseError> {
        let row: Option<FeedDbRow> =
            sqlx::query_as(&format!("SELECT {FEED_COLUMNS} FROM feeds WHERE id = ?"))
                .bind(feed_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(FeedDbRow::into_feed))
    }

    /// All feeds ordered by id, hidden ones only when asked for.
    pub async fn list_feeds(&self, include_hidden: bool) -> Result<Vec<Feed>, DatabaseError> {
        let rows: Vec<FeedDbRow> = sqlx::query_as(&format!(
            "SELECT {FEED_COLUMNS} FROM feeds WHERE hidden = 0 OR ? ORDER BY id"
        ))
        .bind(include_hidden)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(FeedDbRow::into_feed).collect())
    }

    /// Feeds currently held by a refresh (lease not yet expired at `now`).
    pub async fn list_claimed_feeds(&self, now: DateTime<Utc>) -> Result<Vec<Feed>, DatabaseError> {
        let rows: Vec<FeedDbRow> = sqlx::query_as(&format!(
            "SELECT {FEED_COLUMNS} FROM feeds WHERE claimed = 1 AND claim_expires_at > ? ORDER BY id"
        ))
        .bind(to_ts(now))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(FeedDbRow::into_feed).collect())
    }

    /// Feeds the scheduler would claim at `now`, ignoring the batch size.
    pub async fn list_due_feeds(&self, now: DateTime<Utc>) -> Result<Vec<Feed>, DatabaseError> {
        let now = to_ts(now);
        let rows: Vec<FeedDbRow> = sqlx::query_as(&format!(
            r#"
            SELECT {FEED_COLUMNS} FROM feeds
            WHERE next_eligible_at <= ?
              AND (claimed = 0 OR claim_expires_at IS NULL OR claim_expires_at <= ?)
            ORDER BY id
        "#
        ))
        .bind(now)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(FeedDbRow::into_feed).collect())
    }

    /// Delete a feed and, by cascade, all of its entries.
    /// Returns the number of entries removed.
    pub async fn delete_feed(&self, feed_id: i64) -> Result<u64, DatabaseError> {
        let mut tx = self.pool.begin().await?;

        let removed = sqlx::query("DELETE FROM feed_entries WHERE feed_id = ?")
            .bind(feed_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        let deleted = sqlx::query("DELETE FROM feeds WHERE id = ?")
            .bind(feed_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        tx.commit().await?;

        if deleted == 0 {
            return Err(DatabaseError::NotFound(feed_id));
        }
        Ok(removed)
    }

    // ========================================================================
    // Claim Operations
    // ========================================================================

    /// Atomically claim up to `batch_size` due feeds, lowest id first.
    ///
    /// A feed is due when `next_eligible_at <= now` and it is either unclaimed
    /// or its lease has expired. Selection and claim happen in a single
    /// statement, so two concurrent callers can never claim the same feed.
    pub async fn claim_due(
        &self,
        now: DateTime<Utc>,
        batch_size: u32,
        lease: TimeDelta,
    ) -> Result<Vec<Claim>, DatabaseError> {
        let now_ts = to_ts(now);
        let mut rows: Vec<FeedDbRow> = sqlx::query_as(&format!(
            r#"
            UPDATE feeds
            SET claimed = 1, claim_expires_at = ?, lease_epoch = lease_epoch + 1
            WHERE id IN (
                SELECT id FROM feeds
                WHERE next_eligible_at <= ?
                  AND (claimed = 0 OR claim_expires_at IS NULL OR claim_expires_at <= ?)
                ORDER BY id
                LIMIT ?
            )
            RETURNING {FEED_COLUMNS}
        "#
        ))
        .bind(to_ts(now + lease))
        .bind(now_ts)
        .bind(now_ts)
        .bind(i64::from(batch_size))
        .fetch_all(&self.pool)
        .await?;

        // RETURNING order is unspecified
        rows.sort_by_key(|row| row.id);
        Ok(rows.into_iter().map(FeedDbRow::into_claim).collect())
    }

    /// Claim one feed regardless of its cooldown, for on-demand refreshes.
    ///
    /// Returns `None` when another refresh currently holds the lease.
    pub async fn try_claim(
        &self,
        feed_id: i64,
        now: DateTime<Utc>,
        lease: TimeDelta,
    ) -> Result<Option<Lease>, DatabaseError> {
        let row: Option<FeedDbRow> = sqlx::query_as(&format!(
            r#"
            UPDATE feeds
            SET claimed = 1, claim_expires_at = ?, lease_epoch = lease_epoch + 1
            WHERE id = ?
              AND (claimed = 0 OR claim_expires_at IS NULL OR claim_expires_at <= ?)
            RETURNING {FEED_COLUMNS}
        "#
        ))
        .bind(to_ts(now + lease))
        .bind(feed_id)
        .bind(to_ts(now))
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| row.into_claim().lease))
    }

    /// Release a claim without storing a refresh.
    ///
    /// Returns false if the lease was no longer held (it expired and another
    /// refresh claimed the feed), in which case nothing is changed.
    pub async fn release_claim(
        &self,
        lease: &Lease,
        release: Release<'_>,
    ) -> Result<bool, DatabaseError> {
        let result = match release {
            Release::Deferred {
                last_error,
                next_eligible_at,
            } => {
                sqlx::query(
                    r#"
                    UPDATE feeds
                    SET claimed = 0, claim_expires_at = NULL, next_eligible_at = ?, last_error = ?
                    WHERE id = ? AND lease_epoch = ? AND claimed = 1
                "#,
                )
                .bind(to_ts(next_eligible_at))
                .bind(last_error)
                .bind(lease.feed_id)
                .bind(lease.epoch)
                .execute(&self.pool)
                .await?
            }
            Release::Cancelled => {
                sqlx::query(
                    r#"
                    UPDATE feeds
                    SET claimed = 0, claim_expires_at = NULL
                    WHERE id = ? AND lease_epoch = ? AND claimed = 1
                "#,
                )
                .bind(lease.feed_id)
                .bind(lease.epoch)
                .execute(&self.pool)
                .await?
            }
        };

        let released = result.rows_affected() > 0;
        if !released {
            tracing::warn!(
                feed_id = lease.feed_id,
                epoch = lease.epoch,
                "Claim was already released or taken over"
            );
        }
        Ok(released)
    }
}

#[cfg(test)]
mod tests {
    use crate::storage::{Database, Feed, Release};
    use chrono::{TimeDelta, Utc};

    async fn test_db() -> Database {
        Database::open(":memory:").await.unwrap()
    }

    async fn seed(db: &Database, n: usize) -> Vec<i64> {
        let mut ids = Vec::new();
        for i in 0..n {
            let feed = Feed::new(format!("https://feed{}.example.com/rss", i));
            ids.push(db.upsert_feed(&feed).await.unwrap());
        }
        ids
    }

    #[tokio::test]
    async fn test_upsert_feed_assigns_identity() {
        let db = test_db().await;
        let mut feed = Feed::new("https://example.com/rss");
        feed.title = "Example".into();

        let id = db.upsert_feed(&feed).await.unwrap();
        assert!(id > 0);

        let stored = db.get_feed(id).await.unwrap().unwrap();
        assert_eq!(stored.title, "Example");
        assert!(!stored.claimed);
    }

    #[tokio::test]
    async fn test_upsert_feed_updates_in_place() {
        let db = test_db().await;
        let id = db.upsert_feed(&Feed::new("https://example.com/rss")).await.unwrap();

        let mut feed = db.get_feed(id).await.unwrap().unwrap();
        feed.title = "Renamed".into();
        feed.hidden = true;
        assert_eq!(db.upsert_feed(&feed).await.unwrap(), id);

        let stored = db.get_feed(id).await.unwrap().unwrap();
        assert_eq!(stored.title, "Renamed");
        assert!(stored.hidden);
    }

    #[tokio::test]
    async fn test_upsert_same_url_twice_returns_same_id() {
        let db = test_db().await;
        let first = db.upsert_feed(&Feed::new("https://example.com/rss")).await.unwrap();
        let second = db.upsert_feed(&Feed::new("https://example.com/rss")).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(db.list_feeds(true).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_readding_hidden_feed_keeps_it_hidden() {
        let db = test_db().await;
        let mut hidden = Feed::new("https://example.com/rss");
        hidden.hidden = true;
        let id = db.upsert_feed(&hidden).await.unwrap();

        let readded = db.upsert_feed(&Feed::new("https://example.com/rss")).await.unwrap();
        assert_eq!(readded, id);
        assert!(db.get_feed(id).await.unwrap().unwrap().hidden);
        assert!(db.list_feeds(false).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_upsert_unknown_id_is_not_found() {
        let db = test_db().await;
        let mut feed = Feed::new("https://example.com/rss");
        feed.id = 42;
        assert!(db.upsert_feed(&feed).await.is_err());
    }

    #[tokio::test]
    async fn test_list_feeds_hides_hidden() {
        let db = test_db().await;
        let mut hidden = Feed::new("https://hidden.example.com/rss");
        hidden.hidden = true;
        db.upsert_feed(&hidden).await.unwrap();
        db.upsert_feed(&Feed::new("https://shown.example.com/rss")).await.unwrap();

        assert_eq!(db.list_feeds(false).await.unwrap().len(), 1);
        assert_eq!(db.list_feeds(true).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_claim_due_respects_batch_size_and_order() {
        let db = test_db().await;
        let ids = seed(&db, 7).await;

        let claims = db
            .claim_due(Utc::now(), 5, TimeDelta::minutes(15))
            .await
            .unwrap();
        let claimed: Vec<i64> = claims.iter().map(|c| c.feed.id).collect();
        assert_eq!(claimed, ids[..5].to_vec());
        assert!(claims.iter().all(|c| c.feed.claimed));

        // The remaining two are the only ones left to claim
        let rest = db
            .claim_due(Utc::now(), 5, TimeDelta::minutes(15))
            .await
            .unwrap();
        assert_eq!(rest.len(), 2);
    }

    #[tokio::test]
    async fn test_claim_due_skips_feeds_in_cooldown() {
        let db = test_db().await;
        seed(&db, 1).await;
        let now = Utc::now();

        let claim = db.claim_due(now, 5, TimeDelta::minutes(15)).await.unwrap().remove(0);
        db.release_claim(
            &claim.lease,
            Release::Deferred {
                last_error: None,
                next_eligible_at: now + TimeDelta::minutes(10),
            },
        )
        .await
        .unwrap();

        assert!(db.claim_due(now, 5, TimeDelta::minutes(15)).await.unwrap().is_empty());
        let later = now + TimeDelta::minutes(11);
        assert_eq!(db.claim_due(later, 5, TimeDelta::minutes(15)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_expired_lease_is_reclaimable() {
        let db = test_db().await;
        seed(&db, 1).await;
        let now = Utc::now();

        let first = db.claim_due(now, 5, TimeDelta::minutes(15)).await.unwrap().remove(0);
        assert!(db.claim_due(now, 5, TimeDelta::minutes(15)).await.unwrap().is_empty());

        let after_expiry = now + TimeDelta::minutes(16);
        let second = db
            .claim_due(after_expiry, 5, TimeDelta::minutes(15))
            .await
            .unwrap()
            .remove(0);
        assert!(second.lease.epoch > first.lease.epoch);

        // The stale holder can no longer release
        assert!(!db.release_claim(&first.lease, Release::Cancelled).await.unwrap());
        assert!(db.release_claim(&second.lease, Release::Cancelled).await.unwrap());
    }

    #[tokio::test]
    async fn test_try_claim_ignores_cooldown_but_not_claims() {
        let db = test_db().await;
        let id = seed(&db, 1).await[0];
        let now = Utc::now();

        let lease = db.try_claim(id, now, TimeDelta::minutes(15)).await.unwrap().unwrap();
        assert!(db.try_claim(id, now, TimeDelta::minutes(15)).await.unwrap().is_none());

        db.release_claim(
            &lease,
            Release::Deferred {
                last_error: Some("HTTP 404"),
                next_eligible_at: now + TimeDelta::hours(1),
            },
        )
        .await
        .unwrap();

        let feed = db.get_feed(id).await.unwrap().unwrap();
        assert!(!feed.claimed);
        assert_eq!(feed.last_error.as_deref(), Some("HTTP 404"));
        assert!(db.try_claim(id, now, TimeDelta::minutes(15)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_cancelled_release_keeps_feed_due() {
        let db = test_db().await;
        seed(&db, 1).await;
        let now = Utc::now();

        let claim = db.claim_due(now, 5, TimeDelta::minutes(15)).await.unwrap().remove(0);
        db.release_claim(&claim.lease, Release::Cancelled).await.unwrap();

        assert_eq!(db.list_due_feeds(now).await.unwrap().len(), 1);
        assert!(db.list_claimed_feeds(now).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_feed_missing_is_not_found() {
        let db = test_db().await;
        assert!(db.delete_feed(99999).await.is_err());
    }
}
