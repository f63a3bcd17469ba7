use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Storage errors. Every failure of the entry store surfaces as one of these.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Schema creation failed while opening the database
    #[error("Database migration failed: {0}")]
    Migration(String),

    /// No feed row with this id
    #[error("Feed {0} not found")]
    NotFound(i64),

    /// The claim on this feed expired and was taken by another refresh.
    /// Nothing from the refresh holding the stale lease was written.
    #[error("Lease on feed {feed_id} was lost (epoch {epoch})")]
    LeaseLost { feed_id: i64, epoch: i64 },

    /// Generic database error
    #[error("Database error: {0}")]
    Other(#[from] sqlx::Error),
}

// ============================================================================
// Timestamp helpers
// ============================================================================

/// Timestamps are stored as unix seconds.
pub(crate) fn to_ts(at: DateTime<Utc>) -> i64 {
    at.timestamp()
}

pub(crate) fn from_ts(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

// ============================================================================
// Row Types
// ============================================================================

/// Column list shared by every query that materializes a [`Feed`].
pub(crate) const FEED_COLUMNS: &str = "id, url, title, link, description, hidden, claimed, \
     claim_expires_at, lease_epoch, next_eligible_at, last_refreshed_at, last_error";

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct FeedDbRow {
    pub id: i64,
    pub url: String,
    pub title: String,
    pub link: String,
    pub description: String,
    pub hidden: bool,
    pub claimed: bool,
    pub claim_expires_at: Option<i64>,
    pub lease_epoch: i64,
    pub next_eligible_at: i64,
    pub last_refreshed_at: Option<i64>,
    pub last_error: Option<String>,
}

impl FeedDbRow {
    pub(crate) fn into_feed(self) -> Feed {
        Feed {
            id: self.id,
            url: self.url,
            title: self.title,
            link: self.link,
            description: self.description,
            hidden: self.hidden,
            claimed: self.claimed,
            claim_expires_at: self.claim_expires_at.map(from_ts),
            next_eligible_at: from_ts(self.next_eligible_at),
            last_refreshed_at: self.last_refreshed_at.map(from_ts),
            last_error: self.last_error,
        }
    }

    /// Splits a freshly claimed row into the feed and the lease that now guards it.
    pub(crate) fn into_claim(self) -> Claim {
        let lease = Lease {
            feed_id: self.id,
            epoch: self.lease_epoch,
            expires_at: self.claim_expires_at.map(from_ts).unwrap_or_default(),
        };
        Claim {
            feed: self.into_feed(),
            lease,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct EntryDbRow {
    pub id: i64,
    pub feed_id: i64,
    pub title: String,
    pub link: String,
    pub description: String,
    pub published: Option<i64>,
    pub fetched_at: i64,
}

impl EntryDbRow {
    pub(crate) fn into_entry(self) -> FeedEntry {
        FeedEntry {
            id: self.id,
            feed_id: self.feed_id,
            title: self.title,
            link: self.link,
            description: self.description,
            published: self.published.map(from_ts),
            fetched_at: from_ts(self.fetched_at),
        }
    }
}

// ============================================================================
// Data Structures
// ============================================================================

/// A subscribed feed.
///
/// `id == 0` means the feed has not been persisted yet; [`Database::upsert_feed`]
/// assigns the identity.
///
/// [`Database::upsert_feed`]: super::Database::upsert_feed
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Feed {
    pub id: i64,
    pub url: String,
    pub title: String,
    pub link: String,
    pub description: String,
    pub hidden: bool,
    /// True while a refresh holds the lease on this feed
    pub claimed: bool,
    pub claim_expires_at: Option<DateTime<Utc>>,
    /// The scheduler will not claim the feed before this instant
    pub next_eligible_at: DateTime<Utc>,
    pub last_refreshed_at: Option<DateTime<Utc>>,
    /// Why the last refresh did not update the feed, cleared on success
    pub last_error: Option<String>,
}

impl Feed {
    /// An unsaved feed pointing at `url`, due immediately.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            id: 0,
            url: url.into(),
            title: String::new(),
            link: String::new(),
            description: String::new(),
            hidden: false,
            claimed: false,
            claim_expires_at: None,
            next_eligible_at: DateTime::<Utc>::UNIX_EPOCH,
            last_refreshed_at: None,
            last_error: None,
        }
    }

    pub fn is_persisted(&self) -> bool {
        self.id != 0
    }
}

/// One stored entry. Never mutated after insertion.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeedEntry {
    pub id: i64,
    pub feed_id: i64,
    pub title: String,
    pub link: String,
    /// Sanitized HTML
    pub description: String,
    pub published: Option<DateTime<Utc>>,
    /// First time this link was seen for the feed
    pub fetched_at: DateTime<Utc>,
}

/// An entry ready to be stored, as produced by the normalizer.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEntry {
    pub title: String,
    pub link: String,
    pub description: String,
    pub published: Option<DateTime<Utc>>,
}

/// Channel-level metadata copied onto the feed row on each successful refresh.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeedMeta {
    pub title: String,
    pub link: String,
    pub description: String,
}

/// Proof of an exclusive, time-bounded claim on a feed.
///
/// Releasing or completing a refresh requires the epoch to still match the
/// row, so a holder whose lease expired cannot clobber the next holder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub feed_id: i64,
    pub epoch: i64,
    pub expires_at: DateTime<Utc>,
}

/// A feed together with the lease acquired on it.
#[derive(Debug, Clone)]
pub struct Claim {
    pub feed: Feed,
    pub lease: Lease,
}

/// How a claim ends when the refresh did not store anything.
#[derive(Debug, Clone, Copy)]
pub enum Release<'a> {
    /// The refresh finished without an update (failure or nothing to fetch).
    /// The feed waits until `next_eligible_at`; `last_error` is recorded as given.
    Deferred {
        last_error: Option<&'a str>,
        next_eligible_at: DateTime<Utc>,
    },
    /// The refresh was cancelled; the feed stays due as it was.
    Cancelled,
}

/// Counts from one atomic refresh write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Entries inserted (links not previously stored for the feed)
    pub inserted: usize,
    /// Entries removed by retention
    pub pruned: u64,
}
