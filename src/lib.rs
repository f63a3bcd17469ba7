//! feedsync: periodic RSS ingestion into SQLite.
//!
//! A [`scheduler::Scheduler`] claims due feeds in batches and refreshes each
//! one in its own task: fetch ([`feed::Fetcher`]), parse and normalize
//! ([`feed::parse_document`]), then store new entries and prune old ones
//! ([`storage::Database::complete_refresh`]) in one transaction.

pub mod config;
pub mod feed;
pub mod scheduler;
pub mod storage;
pub mod util;
