use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;

use feedsync::config::Config;
use feedsync::feed::{refresh_feed, Fetcher, RefreshContext, RefreshOutcome, RefreshPolicy, RefreshReport};
use feedsync::scheduler::{RefreshResult, Scheduler};
use feedsync::storage::{Database, Feed};
use feedsync::util::validate_url;

/// Default config file path (~/.config/feedsync/config.toml)
fn default_config_path() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    Ok(PathBuf::from(home)
        .join(".config")
        .join("feedsync")
        .join("config.toml"))
}

#[derive(Parser, Debug)]
#[command(name = "feedsync", version, about = "Periodic RSS ingestion into SQLite")]
struct Args {
    /// Config file (default: ~/.config/feedsync/config.toml)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the scheduler until interrupted
    Run,
    /// Run one scheduler tick and wait for its refreshes
    Tick,
    /// Subscribe to a feed and fetch it now
    Add {
        url: String,
        /// Exclude the feed from the default listing
        #[arg(long)]
        hidden: bool,
    },
    /// Refresh one feed now
    Refresh { id: i64 },
    /// List feeds with their schedule and claim state
    Feeds {
        /// Include hidden feeds
        #[arg(long)]
        all: bool,
        #[arg(long)]
        json: bool,
    },
    /// List stored entries of a feed, newest first
    Entries {
        id: i64,
        #[arg(long, default_value_t = 20)]
        limit: i64,
        #[arg(long)]
        json: bool,
    },
    /// Delete a feed and all of its entries
    Delete { id: i64 },
    /// Hide a feed from the default listing
    Hide { id: i64 },
    /// Show a hidden feed again
    Show { id: i64 },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("feedsync=info")),
        )
        .init();

    let args = Args::parse();

    let config_path = match args.config {
        Some(path) => path,
        None => default_config_path()?,
    };
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    let db = Database::open(&config.database_path)
        .await
        .with_context(|| format!("Failed to open database {}", config.database_path))?;

    let ctx = Arc::new(RefreshContext {
        db: db.clone(),
        fetcher: Fetcher::from_config(&config).context("Failed to build HTTP client")?,
        policy: RefreshPolicy::from_config(&config),
    });

    match args.command {
        Command::Run => {
            let scheduler = Scheduler::from_config(Arc::clone(&ctx), &config);
            let (shutdown_tx, shutdown_rx) = watch::channel(false);

            tokio::spawn(async move {
                match tokio::signal::ctrl_c().await {
                    Ok(()) => tracing::info!("Interrupt received, shutting down"),
                    Err(e) => tracing::error!(error = %e, "Failed to listen for Ctrl-C"),
                }
                let _ = shutdown_tx.send(true);
            });

            scheduler.run(shutdown_rx).await;
        }
        Command::Tick => {
            let scheduler = Scheduler::from_config(Arc::clone(&ctx), &config);
            let results = scheduler.tick().await.context("Failed to claim due feeds")?;
            if results.is_empty() {
                println!("No feeds due.");
            }
            for RefreshResult { feed_id, result } in &results {
                match result {
                    Ok(report) => println!("feed {}: {}", feed_id, describe(report)),
                    Err(e) => println!("feed {}: {} error: {}", feed_id, e.kind(), e),
                }
            }
        }
        Command::Add { url, hidden } => {
            let url = validate_url(&url, config.allow_private_hosts)
                .with_context(|| format!("Refusing feed URL {}", url))?;
            let mut feed = Feed::new(url.as_str());
            feed.hidden = hidden;

            let report = refresh_feed(&ctx, &feed).await?;
            if report.feed_id == 0 {
                anyhow::bail!("Feed not added: {}", describe(&report));
            }
            println!("Added feed {}: {}", report.feed_id, describe(&report));
        }
        Command::Refresh { id } => {
            let feed = find_feed(&db, id).await?;
            let report = refresh_feed(&ctx, &feed).await?;
            println!("feed {}: {}", id, describe(&report));
        }
        Command::Feeds { all, json } => {
            let feeds = db.list_feeds(all).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&feeds)?);
            } else {
                for feed in &feeds {
                    print_feed(feed);
                }
            }
        }
        Command::Entries { id, limit, json } => {
            find_feed(&db, id).await?;
            let entries = db.get_entries(id, Some(limit)).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else {
                for entry in &entries {
                    let when = entry.published.unwrap_or(entry.fetched_at);
                    println!("{}  {}\n    {}", when.format("%Y-%m-%d %H:%M"), entry.title, entry.link);
                }
            }
        }
        Command::Delete { id } => {
            let removed = db.delete_feed(id).await?;
            println!("Deleted feed {} and {} entries", id, removed);
        }
        Command::Hide { id } => {
            set_hidden(&db, id, true).await?;
            println!("Feed {} hidden", id);
        }
        Command::Show { id } => {
            set_hidden(&db, id, false).await?;
            println!("Feed {} shown", id);
        }
    }

    Ok(())
}

async fn find_feed(db: &Database, id: i64) -> Result<Feed> {
    db.get_feed(id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("No feed with id {}", id))
}

async fn set_hidden(db: &Database, id: i64, hidden: bool) -> Result<()> {
    let mut feed = find_feed(db, id).await?;
    feed.hidden = hidden;
    db.upsert_feed(&feed).await?;
    Ok(())
}

fn describe(report: &RefreshReport) -> String {
    match &report.outcome {
        RefreshOutcome::Updated {
            inserted,
            pruned,
            rejected,
        } => format!(
            "{} new, {} pruned, {} rejected",
            inserted, pruned, rejected
        ),
        RefreshOutcome::Unavailable { status } => format!("source answered HTTP {}", status),
        RefreshOutcome::NoChannel => "document has no channel".to_string(),
    }
}

fn print_feed(feed: &Feed) {
    let state = if feed.claimed { "refreshing" } else { "idle" };
    let title: &str = if feed.title.is_empty() { "(untitled)" } else { &feed.title };
    println!(
        "{:>4}  {:<10}  next {}  {}{}",
        feed.id,
        state,
        feed.next_eligible_at.format("%Y-%m-%d %H:%M"),
        title,
        if feed.hidden { "  [hidden]" } else { "" }
    );
    println!("      {}", feed.url);
    if let Some(error) = &feed.last_error {
        println!("      last error: {}", error);
    }
}
