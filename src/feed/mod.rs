//! Feed ingestion pipeline: fetch, normalize, store.
//!
//! [`client`] talks HTTP and parses documents, [`normalize`] turns raw
//! entries into storable records, [`refresh`] orchestrates concurrent
//! refreshes, [`subscribe`] handles new subscriptions, and [`favicon`]
//! resolves site icons.

pub mod client;
pub mod favicon;
pub mod normalize;
pub mod refresh;
pub mod subscribe;

pub use client::{fetch_feed, FetchError, FetchedFeed, RawEntry};
pub use favicon::{refresh_all_favicons, resolve_favicon, Favicon};
pub use normalize::normalize_entry;
pub use refresh::{
    refresh_all, refresh_feed, RefreshAll, RefreshGuard, RefreshOutcome, RefreshScope,
    RefreshStatus, DEFAULT_WORKERS,
};
pub use subscribe::{subscribe, SubscribeError};
