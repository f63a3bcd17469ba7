//! Entry store: subscribed feeds, their entries, and the claim/lease state the
//! scheduler coordinates through.

mod entries;
mod feeds;
mod schema;
mod types;

pub use schema::Database;
pub use types::{
    Claim, DatabaseError, Feed, FeedEntry, FeedMeta, Lease, NewEntry, Release, StoreStats,
};
