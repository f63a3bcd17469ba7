//! Feed ingestion: fetching, parsing and refreshing RSS feeds.
//!
//! - [`fetcher`] - one bounded HTTP GET per feed
//! - [`parser`] - RSS 2.0 decoding into a declarative tag→field record, then
//!   normalization (text joining, HTML sanitizing, date parsing)
//! - [`refresh`] - fetch → parse → store for one feed under its lease
//!
//! # Example
//!
//! ```ignore
//! use feedsync::feed::{refresh_feed, RefreshContext};
//! use feedsync::storage::Feed;
//!
//! let report = refresh_feed(&ctx, &Feed::new("https://example.com/rss")).await?;
//! ```

mod date;
mod fetcher;
mod parser;
mod refresh;
mod sanitize;

pub use date::{parse_pub_date, DateParseError};
pub use fetcher::{FetchError, FetchOutcome, Fetcher};
pub use parser::{parse_document, Channel, DecodeError, Item, ItemError, ParsedFeed, RejectedItem};
pub(crate) use refresh::wait_for_shutdown;
pub use refresh::{
    refresh_claimed, refresh_feed, RefreshContext, RefreshError, RefreshOutcome, RefreshPolicy,
    RefreshReport,
};
pub use sanitize::sanitize_html;
