use anyhow::Result;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
    SqlitePool,
};
use std::str::FromStr;
use std::time::Duration;

use super::types::DatabaseError;

// ============================================================================
// Database
// ============================================================================

/// Handle to the entry store. Cheap to clone; all clones share one pool.
#[derive(Debug, Clone)]
pub struct Database {
    pub(crate) pool: SqlitePool,
}

impl Database {
    /// Open a database connection and run migrations.
    ///
    /// `":memory:"` opens a private in-memory database shared by the pool's
    /// connections.
    pub async fn open(path: &str) -> Result<Self, DatabaseError> {
        let in_memory = path == ":memory:";
        let url = if in_memory {
            "sqlite::memory:".to_string()
        } else {
            format!("sqlite:{}?mode=rwc", path)
        };

        // busy_timeout=5000: writers wait up to 5 seconds for the lock instead of
        // failing with SQLITE_BUSY. Claims, releases and refresh batches from
        // concurrent tasks contend here.
        let mut options = SqliteConnectOptions::from_str(&url)?
            .foreign_keys(true)
            .pragma("busy_timeout", "5000");
        if !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.migrate()
            .await
            .map_err(|e| DatabaseError::Migration(e.to_string()))?;
        tracing::debug!(path = %path, "Database opened");
        Ok(db)
    }

    /// Run database migrations atomically within a transaction.
    ///
    /// All statements use `IF NOT EXISTS`, so re-running on an existing
    /// database is a no-op.
    async fn migrate(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        // next_eligible_at / claim_expires_at / *_at columns are unix seconds.
        // lease_epoch is bumped on every claim and acts as the lease token.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS feeds (
                id INTEGER PRIMARY KEY,
                url TEXT UNIQUE NOT NULL,
                title TEXT NOT NULL DEFAULT '',
                link TEXT NOT NULL DEFAULT '',
                description TEXT NOT NULL DEFAULT '',
                hidden INTEGER NOT NULL DEFAULT 0,
                claimed INTEGER NOT NULL DEFAULT 0,
                claim_expires_at INTEGER,
                lease_epoch INTEGER NOT NULL DEFAULT 0,
                next_eligible_at INTEGER NOT NULL DEFAULT 0,
                last_refreshed_at INTEGER,
                last_error TEXT
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS feed_entries (
                id INTEGER PRIMARY KEY,
                feed_id INTEGER NOT NULL REFERENCES feeds(id) ON DELETE CASCADE,
                title TEXT NOT NULL,
                link TEXT NOT NULL,
                description TEXT NOT NULL,
                published INTEGER,
                fetched_at INTEGER NOT NULL,
                UNIQUE(feed_id, link)
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        // Links pruned by retention while still listed upstream. aged_at is the
        // pruned row's COALESCE(published, fetched_at).
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS pruned_links (
                feed_id INTEGER NOT NULL REFERENCES feeds(id) ON DELETE CASCADE,
                link TEXT NOT NULL,
                aged_at INTEGER NOT NULL,
                PRIMARY KEY(feed_id, link)
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        // Claim predicate scans by (claimed, next_eligible_at)
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_feeds_due ON feeds(claimed, next_eligible_at)")
            .execute(&mut *tx)
            .await?;

        // Entry listing and retention both filter by feed and order/compare by date
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_entries_feed_published ON feed_entries(feed_id, published DESC)",
        )
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(())
    }
}
