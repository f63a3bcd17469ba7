use chrono::{TimeDelta, Utc};
use thiserror::Error;
use tokio::sync::watch;

use super::fetcher::{FetchError, FetchOutcome, Fetcher};
use super::parser::{parse_document, Channel, DecodeError, ParsedFeed};
use crate::config::Config;
use crate::storage::{Database, DatabaseError, Feed, FeedMeta, Lease, NewEntry, Release};

// ============================================================================
// Errors
// ============================================================================

/// Why a refresh did not complete.
#[derive(Debug, Error)]
pub enum RefreshError {
    #[error(transparent)]
    Transport(#[from] FetchError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Persistence(#[from] DatabaseError),

    /// Another refresh currently holds the lease on this feed
    #[error("Feed {0} is already being refreshed")]
    Busy(i64),

    #[error("Refresh cancelled by shutdown")]
    Cancelled,

    /// The refresh task panicked
    #[error("Refresh task aborted: {0}")]
    Aborted(String),
}

impl RefreshError {
    /// Stable label for log fields and CLI output.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transport(_) => "transport",
            Self::Decode(_) => "decode",
            Self::Persistence(_) => "persistence",
            Self::Busy(_) => "busy",
            Self::Cancelled => "cancelled",
            Self::Aborted(_) => "aborted",
        }
    }

    /// Whether the same refresh could succeed on a later cycle.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Decode(_))
    }
}

// ============================================================================
// Context and results
// ============================================================================

/// Timing rules applied to every refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshPolicy {
    /// Entries older than this are pruned
    pub retention: TimeDelta,
    /// Delay before a refreshed feed is due again
    pub cooldown: TimeDelta,
    /// How long a claim stays valid
    pub lease: TimeDelta,
}

impl RefreshPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            retention: secs(u64::from(config.retention_days) * 86_400),
            cooldown: secs(config.cooldown_secs),
            lease: secs(config.lease_secs),
        }
    }
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Capped at 100 years so timestamp arithmetic stays in range.
fn secs(value: u64) -> TimeDelta {
    const CAP: i64 = 100 * 365 * 86_400;
    TimeDelta::seconds(i64::try_from(value).unwrap_or(CAP).min(CAP))
}

/// Everything a refresh needs. Shared by the scheduler's tasks behind an `Arc`.
#[derive(Debug, Clone)]
pub struct RefreshContext {
    pub db: Database,
    pub fetcher: Fetcher,
    pub policy: RefreshPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// Entries stored and the feed rescheduled
    Updated {
        inserted: usize,
        pruned: u64,
        /// Items left out by the normalizer
        rejected: usize,
    },
    /// The source answered with a non-success status
    Unavailable { status: u16 },
    /// The document was valid RSS without a channel
    NoChannel,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshReport {
    /// 0 when a new feed was not stored because there was nothing to ingest
    pub feed_id: i64,
    pub outcome: RefreshOutcome,
}

/// A fetched document before anything is written.
enum Fetched {
    Parsed(ParsedFeed),
    Unavailable(u16),
    NoChannel,
}

// ============================================================================
// Refresh
// ============================================================================

async fn fetch_and_parse(fetcher: &Fetcher, url: &str) -> Result<Fetched, RefreshError> {
    let bytes = match fetcher.fetch(url).await? {
        FetchOutcome::Body(bytes) => bytes,
        FetchOutcome::Unavailable(status) => return Ok(Fetched::Unavailable(status.as_u16())),
    };

    Ok(match parse_document(&bytes)? {
        Some(parsed) => Fetched::Parsed(parsed),
        None => Fetched::NoChannel,
    })
}

fn split_channel(channel: Channel) -> (FeedMeta, Vec<NewEntry>) {
    let entries = channel
        .items
        .into_iter()
        .map(|item| NewEntry {
            title: item.title,
            link: item.link,
            description: item.description,
            published: item.published,
        })
        .collect();
    let meta = FeedMeta {
        title: channel.title,
        link: channel.link,
        description: channel.description,
    };
    (meta, entries)
}

async fn store(
    ctx: &RefreshContext,
    lease: &Lease,
    parsed: ParsedFeed,
) -> Result<RefreshOutcome, RefreshError> {
    for rejected in &parsed.rejected {
        tracing::debug!(
            feed_id = lease.feed_id,
            position = rejected.position,
            link = %rejected.link,
            error = %rejected.error,
            "Item rejected"
        );
    }

    let rejected = parsed.rejected.len();
    let (meta, entries) = split_channel(parsed.channel);
    let stats = ctx
        .db
        .complete_refresh(
            lease,
            &meta,
            &entries,
            ctx.policy.retention,
            ctx.policy.cooldown,
        )
        .await?;

    Ok(RefreshOutcome::Updated {
        inserted: stats.inserted,
        pruned: stats.pruned,
        rejected,
    })
}

async fn run_refresh(
    ctx: &RefreshContext,
    feed: &Feed,
    lease: &Lease,
) -> Result<RefreshOutcome, RefreshError> {
    match fetch_and_parse(&ctx.fetcher, &feed.url).await? {
        Fetched::Parsed(parsed) => store(ctx, lease, parsed).await,
        Fetched::Unavailable(status) => Ok(RefreshOutcome::Unavailable { status }),
        Fetched::NoChannel => Ok(RefreshOutcome::NoChannel),
    }
}

/// Resolves once shutdown is signalled. A dropped sender never signals.
pub(crate) async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Release the claim unless the refresh already did it while storing.
async fn settle(
    ctx: &RefreshContext,
    lease: &Lease,
    result: &Result<RefreshOutcome, RefreshError>,
) -> Result<(), DatabaseError> {
    let next_eligible_at = Utc::now() + ctx.policy.cooldown;
    let message;
    let release = match result {
        Ok(RefreshOutcome::Updated { .. }) => return Ok(()),
        // Held by someone else now; nothing of ours to release
        Err(RefreshError::Persistence(DatabaseError::LeaseLost { .. })) => return Ok(()),
        Err(RefreshError::Cancelled) => Release::Cancelled,
        Ok(RefreshOutcome::Unavailable { status }) => {
            message = format!("HTTP status {}", status);
            Release::Deferred {
                last_error: Some(&message),
                next_eligible_at,
            }
        }
        Ok(RefreshOutcome::NoChannel) => Release::Deferred {
            last_error: Some("document has no channel"),
            next_eligible_at,
        },
        Err(e) => {
            message = e.to_string();
            Release::Deferred {
                last_error: Some(&message),
                next_eligible_at,
            }
        }
    };

    ctx.db.release_claim(lease, release).await.map(|_| ())
}

fn log_result(feed: &Feed, result: &Result<RefreshOutcome, RefreshError>) {
    match result {
        Ok(RefreshOutcome::Updated {
            inserted,
            pruned,
            rejected,
        }) => tracing::info!(
            feed_id = feed.id,
            url = %feed.url,
            inserted,
            pruned,
            rejected,
            "Feed refreshed"
        ),
        Ok(RefreshOutcome::Unavailable { status }) => tracing::warn!(
            feed_id = feed.id,
            url = %feed.url,
            status,
            "Feed unavailable, retrying after cooldown"
        ),
        Ok(RefreshOutcome::NoChannel) => tracing::info!(
            feed_id = feed.id,
            url = %feed.url,
            "Feed document has no channel"
        ),
        Err(e) => tracing::warn!(
            feed_id = feed.id,
            url = %feed.url,
            kind = e.kind(),
            error = %e,
            "Feed refresh failed"
        ),
    }
}

/// Refresh a feed whose lease the caller holds, then end the claim.
///
/// On success the claim is released by the same transaction that stores the
/// entries. On any other result it is released here: failures and
/// unavailable sources record `last_error` and wait out the cooldown, while
/// a shutdown leaves the feed due for the next run.
pub async fn refresh_claimed(
    ctx: &RefreshContext,
    feed: &Feed,
    lease: &Lease,
    mut shutdown: watch::Receiver<bool>,
) -> Result<RefreshReport, RefreshError> {
    let result = tokio::select! {
        biased;
        _ = wait_for_shutdown(&mut shutdown) => Err(RefreshError::Cancelled),
        result = run_refresh(ctx, feed, lease) => result,
    };

    log_result(feed, &result);
    if let Err(e) = settle(ctx, lease, &result).await {
        tracing::error!(feed_id = feed.id, error = %e, "Failed to release claim");
    }

    result.map(|outcome| RefreshReport {
        feed_id: feed.id,
        outcome,
    })
}

/// On-demand refresh, outside the scheduler.
///
/// A feed with id 0 is fetched first and only stored once its document
/// parses; the channel metadata becomes the new feed's title, link and
/// description. An existing feed has its editable fields saved first.
/// Either way the refresh runs under the same lease the scheduler uses, so
/// it never overlaps a scheduled refresh of the same feed.
///
/// # Errors
///
/// [`RefreshError::Busy`] if another refresh holds the lease; otherwise the
/// error of the failing stage.
pub async fn refresh_feed(
    ctx: &RefreshContext,
    feed: &Feed,
) -> Result<RefreshReport, RefreshError> {
    // Never signalled: on-demand refreshes run to completion
    let (_keep, shutdown) = watch::channel(false);

    if feed.is_persisted() {
        ctx.db.upsert_feed(feed).await?;
        let lease = ctx
            .db
            .try_claim(feed.id, Utc::now(), ctx.policy.lease)
            .await?
            .ok_or(RefreshError::Busy(feed.id))?;
        return refresh_claimed(ctx, feed, &lease, shutdown).await;
    }

    let parsed = match fetch_and_parse(&ctx.fetcher, &feed.url).await? {
        Fetched::Parsed(parsed) => parsed,
        Fetched::Unavailable(status) => {
            tracing::warn!(url = %feed.url, status, "New feed unavailable, not stored");
            return Ok(RefreshReport {
                feed_id: 0,
                outcome: RefreshOutcome::Unavailable { status },
            });
        }
        Fetched::NoChannel => {
            return Ok(RefreshReport {
                feed_id: 0,
                outcome: RefreshOutcome::NoChannel,
            });
        }
    };

    let mut stored = feed.clone();
    stored.title = parsed.channel.title.clone();
    stored.link = parsed.channel.link.clone();
    stored.description = parsed.channel.description.clone();
    stored.id = ctx.db.upsert_feed(&stored).await?;

    let lease = ctx
        .db
        .try_claim(stored.id, Utc::now(), ctx.policy.lease)
        .await?
        .ok_or(RefreshError::Busy(stored.id))?;

    let result = store(ctx, &lease, parsed).await;
    log_result(&stored, &result);
    if let Err(e) = settle(ctx, &lease, &result).await {
        tracing::error!(feed_id = stored.id, error = %e, "Failed to release claim");
    }

    result.map(|outcome| RefreshReport {
        feed_id: stored.id,
        outcome,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const VALID_RSS: &str = r#"<?xml version="1.0"?>
<rss version="2.0"><channel>
    <title>Example</title>
    <link>https://example.com/</link>
    <item><title>One</title><link>https://example.com/1</link></item>
    <item><title>Two</title><link>https://example.com/2</link></item>
    <item><title>No link</title></item>
</channel></rss>"#;

    async fn test_ctx() -> RefreshContext {
        RefreshContext {
            db: Database::open(":memory:").await.unwrap(),
            fetcher: Fetcher::with_client(
                reqwest::Client::new(),
                Duration::from_secs(5),
                1024 * 1024,
            ),
            policy: RefreshPolicy::default(),
        }
    }

    async fn serve(template: ResponseTemplate) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(template)
            .mount(&server)
            .await;
        server
    }

    #[test]
    fn test_policy_from_config() {
        let policy = RefreshPolicy::default();
        assert_eq!(policy.retention, TimeDelta::days(30));
        assert_eq!(policy.cooldown, TimeDelta::minutes(10));
        assert_eq!(policy.lease, TimeDelta::minutes(15));
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(RefreshError::Busy(1).kind(), "busy");
        assert_eq!(RefreshError::Cancelled.kind(), "cancelled");
        assert!(RefreshError::Cancelled.is_retryable());
        assert!(!RefreshError::Decode(DecodeError::Empty).is_retryable());
    }

    #[tokio::test]
    async fn test_new_feed_is_stored_after_parse() {
        let server = serve(ResponseTemplate::new(200).set_body_string(VALID_RSS)).await;
        let ctx = test_ctx().await;

        let report = refresh_feed(&ctx, &Feed::new(format!("{}/rss", server.uri())))
            .await
            .unwrap();
        assert_eq!(
            report.outcome,
            RefreshOutcome::Updated {
                inserted: 2,
                pruned: 0,
                rejected: 1
            }
        );

        let feed = ctx.db.get_feed(report.feed_id).await.unwrap().unwrap();
        assert_eq!(feed.title, "Example");
        assert_eq!(feed.link, "https://example.com/");
        assert!(!feed.claimed);
        assert!(feed.last_refreshed_at.is_some());
        assert_eq!(ctx.db.count_entries(feed.id).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_new_feed_not_stored_when_unavailable() {
        let server = serve(ResponseTemplate::new(404)).await;
        let ctx = test_ctx().await;

        let report = refresh_feed(&ctx, &Feed::new(server.uri())).await.unwrap();
        assert_eq!(report.feed_id, 0);
        assert_eq!(report.outcome, RefreshOutcome::Unavailable { status: 404 });
        assert!(ctx.db.list_feeds(true).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_new_feed_not_stored_on_decode_error() {
        let server = serve(ResponseTemplate::new(200).set_body_string("<not valid xml")).await;
        let ctx = test_ctx().await;

        let err = refresh_feed(&ctx, &Feed::new(server.uri())).await.unwrap_err();
        assert_eq!(err.kind(), "decode");
        assert!(ctx.db.list_feeds(true).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_existing_feed_unavailable_records_error() {
        let server = serve(ResponseTemplate::new(503)).await;
        let ctx = test_ctx().await;
        let id = ctx.db.upsert_feed(&Feed::new(server.uri())).await.unwrap();
        let feed = ctx.db.get_feed(id).await.unwrap().unwrap();

        let report = refresh_feed(&ctx, &feed).await.unwrap();
        assert_eq!(report.outcome, RefreshOutcome::Unavailable { status: 503 });

        let feed = ctx.db.get_feed(id).await.unwrap().unwrap();
        assert!(!feed.claimed);
        assert_eq!(feed.last_error.as_deref(), Some("HTTP status 503"));
        assert!(feed.next_eligible_at > Utc::now());
    }

    #[tokio::test]
    async fn test_busy_when_lease_held() {
        let ctx = test_ctx().await;
        let id = ctx
            .db
            .upsert_feed(&Feed::new("https://example.com/rss"))
            .await
            .unwrap();
        ctx.db
            .try_claim(id, Utc::now(), ctx.policy.lease)
            .await
            .unwrap()
            .unwrap();

        let feed = ctx.db.get_feed(id).await.unwrap().unwrap();
        let err = refresh_feed(&ctx, &feed).await.unwrap_err();
        assert!(matches!(err, RefreshError::Busy(busy) if busy == id));
    }

    #[tokio::test]
    async fn test_shutdown_cancels_and_keeps_feed_due() {
        let server = serve(
            ResponseTemplate::new(200)
                .set_body_string(VALID_RSS)
                .set_delay(Duration::from_secs(5)),
        )
        .await;
        let ctx = test_ctx().await;
        let id = ctx.db.upsert_feed(&Feed::new(server.uri())).await.unwrap();
        let feed = ctx.db.get_feed(id).await.unwrap().unwrap();
        let lease = ctx
            .db
            .try_claim(id, Utc::now(), ctx.policy.lease)
            .await
            .unwrap()
            .unwrap();

        let (tx, rx) = watch::channel(false);
        let refresh = refresh_claimed(&ctx, &feed, &lease, rx);
        let stop = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            tx.send(true).unwrap();
        };
        let (result, ()) = tokio::join!(refresh, stop);

        assert!(matches!(result, Err(RefreshError::Cancelled)));
        let feed = ctx.db.get_feed(id).await.unwrap().unwrap();
        assert!(!feed.claimed);
        assert!(feed.next_eligible_at <= Utc::now());
        assert_eq!(ctx.db.count_entries(id).await.unwrap(), 0);
    }
}
