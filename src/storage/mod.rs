//! SQLite persistence layer.
//!
//! [`Database`] wraps a connection pool; its operations are grouped by
//! concern across the submodules (feed registry, entries, settings), all
//! implemented as inherent methods so callers see a single surface.

mod entries;
mod feeds;
mod schema;
mod settings;
mod types;

pub use schema::Database;
pub use settings::FEED_ORDER_KEY;
pub use types::{
    AggregateSummary, DatabaseError, Entry, Feed, FeedOrder, FeedScope, FeedSummary, NewEntry,
    NewFeed,
};
