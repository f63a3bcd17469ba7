//! Integration tests for the feed lifecycle: subscribe, refresh, dedup,
//! retention, delete.
//!
//! Each test serves its documents from a wiremock server and stores into its
//! own SQLite database. These tests exercise the pipeline end-to-end through
//! the public API, the same way the CLI drives it.

use chrono::{TimeDelta, Utc};
use feedsync::feed::{refresh_feed, Fetcher, RefreshContext, RefreshOutcome, RefreshPolicy};
use feedsync::scheduler::Scheduler;
use feedsync::storage::{Database, Feed};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn test_ctx() -> RefreshContext {
    RefreshContext {
        db: Database::open(":memory:").await.unwrap(),
        fetcher: Fetcher::with_client(reqwest::Client::new(), Duration::from_secs(5), 1 << 20),
        policy: RefreshPolicy::default(),
    }
}

struct Item<'a> {
    title: &'a str,
    link: &'a str,
    description: &'a str,
    age_days: Option<i64>,
}

fn rss(title: &str, items: &[Item<'_>]) -> String {
    let items: String = items
        .iter()
        .map(|item| {
            let pub_date = item
                .age_days
                .map(|d| {
                    format!(
                        "<pubDate>{}</pubDate>",
                        (Utc::now() - TimeDelta::days(d)).to_rfc2822()
                    )
                })
                .unwrap_or_default();
            format!(
                "<item><title>{}</title><link>{}</link><description><![CDATA[{}]]></description>{}</item>",
                item.title, item.link, item.description, pub_date
            )
        })
        .collect();
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0"><channel>
<title>{}</title><link>https://example.com/</link><description>Test feed</description>
{}
</channel></rss>"#,
        title, items
    )
}

async fn serve(server: &MockServer, body: String) {
    server.reset().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(body)
                .insert_header("Content-Type", "application/rss+xml"),
        )
        .mount(server)
        .await;
}

// ============================================================================
// Subscribe
// ============================================================================

#[tokio::test]
async fn test_subscribe_stores_feed_and_sanitized_entries() {
    let server = MockServer::start().await;
    serve(
        &server,
        rss(
            "Example Feed",
            &[
                Item {
                    title: "  Scripted  ",
                    link: "https://example.com/scripted",
                    description: "<p>Hi</p><script>alert('x')</script>",
                    age_days: Some(1),
                },
                Item {
                    title: "Bold",
                    link: "https://example.com/bold",
                    description: "<p>Hi <b>bold</b></p>",
                    age_days: Some(2),
                },
            ],
        ),
    )
    .await;
    let ctx = test_ctx().await;

    let report = refresh_feed(&ctx, &Feed::new(server.uri())).await.unwrap();
    assert!(report.feed_id > 0);

    let feeds = ctx.db.list_feeds(false).await.unwrap();
    assert_eq!(feeds.len(), 1);
    assert_eq!(feeds[0].title, "Example Feed");
    assert_eq!(feeds[0].url, server.uri());

    let entries = ctx.db.get_entries(report.feed_id, None).await.unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].title, "Scripted");
    assert_eq!(entries[0].description, "<p>Hi</p>");
    assert!(!entries[0].description.contains("alert"));
    assert_eq!(entries[1].description, "<p>Hi <b>bold</b></p>");
    assert!(entries.iter().all(|e| e.published.is_some()));

    // Unchanged upstream: still exactly one row per item
    let feed = ctx.db.get_feed(report.feed_id).await.unwrap().unwrap();
    refresh_feed(&ctx, &feed).await.unwrap();
    assert_eq!(ctx.db.count_entries(feed.id).await.unwrap(), 2);
}

#[tokio::test]
async fn test_subscribe_same_url_twice_is_one_feed() {
    let server = MockServer::start().await;
    serve(&server, rss("Example", &[])).await;
    let ctx = test_ctx().await;

    let first = refresh_feed(&ctx, &Feed::new(server.uri())).await.unwrap();
    let second = refresh_feed(&ctx, &Feed::new(server.uri())).await.unwrap();

    assert_eq!(first.feed_id, second.feed_id);
    assert_eq!(ctx.db.list_feeds(true).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_hidden_feed_excluded_from_default_listing() {
    let server = MockServer::start().await;
    serve(&server, rss("Hidden", &[])).await;
    let ctx = test_ctx().await;

    let mut feed = Feed::new(server.uri());
    feed.hidden = true;
    refresh_feed(&ctx, &feed).await.unwrap();

    assert!(ctx.db.list_feeds(false).await.unwrap().is_empty());
    assert_eq!(ctx.db.list_feeds(true).await.unwrap().len(), 1);
}

// ============================================================================
// Refresh: dedup and first-seen-wins
// ============================================================================

#[tokio::test]
async fn test_refresh_twice_adds_nothing() {
    let server = MockServer::start().await;
    let items = [
        Item {
            title: "One",
            link: "https://example.com/1",
            description: "<p>1</p>",
            age_days: Some(1),
        },
        Item {
            title: "Two",
            link: "https://example.com/2",
            description: "<p>2</p>",
            age_days: Some(2),
        },
    ];
    serve(&server, rss("Example", &items)).await;
    let ctx = test_ctx().await;

    let first = refresh_feed(&ctx, &Feed::new(server.uri())).await.unwrap();
    let feed = ctx.db.get_feed(first.feed_id).await.unwrap().unwrap();
    let second = refresh_feed(&ctx, &feed).await.unwrap();

    assert_eq!(
        second.outcome,
        RefreshOutcome::Updated {
            inserted: 0,
            pruned: 0,
            rejected: 0
        }
    );
    assert_eq!(ctx.db.count_entries(feed.id).await.unwrap(), 2);
}

#[tokio::test]
async fn test_changed_entry_keeps_first_version() {
    let server = MockServer::start().await;
    serve(
        &server,
        rss(
            "Example",
            &[Item {
                title: "Original",
                link: "https://example.com/1",
                description: "<p>first</p>",
                age_days: Some(1),
            }],
        ),
    )
    .await;
    let ctx = test_ctx().await;
    let report = refresh_feed(&ctx, &Feed::new(server.uri())).await.unwrap();

    serve(
        &server,
        rss(
            "Example",
            &[
                Item {
                    title: "Edited",
                    link: "https://example.com/1",
                    description: "<p>second</p>",
                    age_days: Some(1),
                },
                Item {
                    title: "New",
                    link: "https://example.com/2",
                    description: "",
                    age_days: None,
                },
            ],
        ),
    )
    .await;
    let feed = ctx.db.get_feed(report.feed_id).await.unwrap().unwrap();
    refresh_feed(&ctx, &feed).await.unwrap();

    let entries = ctx.db.get_entries(feed.id, None).await.unwrap();
    let original = entries
        .iter()
        .find(|e| e.link == "https://example.com/1")
        .unwrap();
    assert_eq!(original.title, "Original");
    assert_eq!(original.description, "<p>first</p>");
    assert_eq!(entries.len(), 2);
}

// ============================================================================
// Retention
// ============================================================================

#[tokio::test]
async fn test_retention_window_applies_from_second_cycle() {
    let server = MockServer::start().await;
    let items: Vec<Item<'_>> = [
        ("10", 10),
        ("29", 29),
        ("31", 31),
        ("40", 40),
    ]
    .iter()
    .map(|(name, age)| Item {
        title: name,
        link: name,
        description: "",
        age_days: Some(*age),
    })
    .collect();
    serve(&server, rss("Example", &items)).await;
    let ctx = test_ctx().await;

    // Entries stored by a refresh are not pruned by that same refresh
    let first = refresh_feed(&ctx, &Feed::new(server.uri())).await.unwrap();
    assert_eq!(
        first.outcome,
        RefreshOutcome::Updated {
            inserted: 4,
            pruned: 0,
            rejected: 0
        }
    );

    let feed = ctx.db.get_feed(first.feed_id).await.unwrap().unwrap();
    let second = refresh_feed(&ctx, &feed).await.unwrap();
    assert_eq!(
        second.outcome,
        RefreshOutcome::Updated {
            inserted: 0,
            pruned: 2,
            rejected: 0
        }
    );

    let mut kept: Vec<String> = ctx
        .db
        .get_entries(feed.id, None)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.title)
        .collect();
    kept.sort();
    assert_eq!(kept, vec!["10", "29"]);

    // The expired items are still listed upstream but stay pruned
    for _ in 0..2 {
        let again = refresh_feed(&ctx, &feed).await.unwrap();
        assert_eq!(
            again.outcome,
            RefreshOutcome::Updated {
                inserted: 0,
                pruned: 0,
                rejected: 0
            }
        );
        assert_eq!(ctx.db.count_entries(feed.id).await.unwrap(), 2);
    }
}

// ============================================================================
// Scheduler
// ============================================================================

#[tokio::test]
async fn test_scheduled_tick_refreshes_subscribed_feed() {
    let server = MockServer::start().await;
    serve(
        &server,
        rss(
            "Example",
            &[Item {
                title: "One",
                link: "https://example.com/1",
                description: "",
                age_days: Some(1),
            }],
        ),
    )
    .await;
    let ctx = Arc::new(test_ctx().await);
    let feed_id = ctx.db.upsert_feed(&Feed::new(server.uri())).await.unwrap();

    let scheduler = Scheduler::new(Arc::clone(&ctx), Duration::from_secs(300), 5);
    let results = scheduler.tick().await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].feed_id, feed_id);

    let feed = ctx.db.get_feed(feed_id).await.unwrap().unwrap();
    assert_eq!(feed.title, "Example");
    assert!(!feed.claimed);
    assert!(feed.last_error.is_none());
    assert!(feed.next_eligible_at > Utc::now() + TimeDelta::minutes(9));
}

// ============================================================================
// Delete
// ============================================================================

#[tokio::test]
async fn test_delete_removes_feed_and_entries() {
    let server = MockServer::start().await;
    serve(
        &server,
        rss(
            "Example",
            &[Item {
                title: "One",
                link: "https://example.com/1",
                description: "",
                age_days: Some(1),
            }],
        ),
    )
    .await;
    let ctx = test_ctx().await;
    let report = refresh_feed(&ctx, &Feed::new(server.uri())).await.unwrap();

    assert_eq!(ctx.db.delete_feed(report.feed_id).await.unwrap(), 1);
    assert!(ctx.db.get_feed(report.feed_id).await.unwrap().is_none());
    assert!(ctx.db.get_entries(report.feed_id, None).await.unwrap().is_empty());
}
