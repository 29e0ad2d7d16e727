use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Database-specific errors with user-friendly messages
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Migration failed
    #[error("Database migration failed: {0}")]
    Migration(String),

    /// Generic database error
    #[error("Database error: {0}")]
    Other(#[from] sqlx::Error),
}

// ============================================================================
// Query Scopes
// ============================================================================

/// Which feeds a read operation targets: one feed, or the synthesized
/// "all feeds" aggregate. The aggregate is computed at read time and is
/// never a persisted row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedScope {
    All,
    Feed(i64),
}

/// Global feed list ordering preference (settings key `feeds.order`).
/// Pinned feeds float to the top under either ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FeedOrder {
    #[default]
    Title,
    Recent,
}

impl FeedOrder {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "title" => Some(FeedOrder::Title),
            "recent" => Some(FeedOrder::Recent),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FeedOrder::Title => "title",
            FeedOrder::Recent => "recent",
        }
    }
}

// ============================================================================
// Write Models
// ============================================================================

/// Feed metadata captured at subscribe time, before storage assigns an id.
#[derive(Debug, Clone)]
pub struct NewFeed {
    pub url: String,
    pub title: String,
    pub link: Option<String>,
    pub description: Option<String>,
    /// Feed-level publication date, unix seconds
    pub published: Option<i64>,
}

/// A normalized entry ready for insertion. Produced by the entry normalizer;
/// `link` is never empty (it is the dedup key), string fields default to `""`
/// rather than NULL so display logic stays simple.
#[derive(Debug, Clone)]
pub struct NewEntry {
    pub title: String,
    pub link: String,
    pub summary: Option<String>,
    pub content: String,
    /// Unix seconds; ingestion time when the source date was absent or unparseable
    pub published: i64,
    pub author: String,
    pub guid: String,
}

// ============================================================================
// Data Structures
// ============================================================================

/// Feed row as stored. The favicon blob is deliberately not part of this
/// struct; it is fetched separately via `Database::favicon` so list queries
/// never haul image bytes.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Feed {
    pub id: i64,
    pub url: String,
    pub title: String,
    pub link: Option<String>,
    pub description: Option<String>,
    pub published: Option<i64>,
    pub favicon_mime: Option<String>,
    pub last_updated: Option<i64>,
    pub last_fetch_attempt: Option<i64>,
    pub last_error: Option<String>,
    pub pinned: bool,
}

/// A feed plus its read-time derived attributes. Never persisted.
#[derive(Debug, Clone)]
pub struct FeedSummary {
    pub feed: Feed,
    pub unread_count: i64,
    /// Published date of the newest stored entry, unix seconds
    pub last_new_entry: Option<i64>,
    /// Fraction of stored entries that have been read (0.0 for an empty feed)
    pub read_frequency: f64,
}

/// The synthesized "all feeds" pseudo-feed: aggregate unread count and
/// newest entry date across every feed.
#[derive(Debug, Clone, Copy)]
pub struct AggregateSummary {
    pub unread_count: i64,
    pub last_new_entry: Option<i64>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Entry {
    pub id: i64,
    pub feed_id: i64,
    pub title: String,
    pub link: String,
    pub summary: Option<String>,
    pub content: String,
    pub published: i64,
    pub author: String,
    pub guid: String,
    pub read: bool,
}

/// Internal row type for the feed summary aggregate query.
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct FeedSummaryRow {
    #[sqlx(flatten)]
    pub feed: Feed,
    pub unread_count: i64,
    pub last_new_entry: Option<i64>,
    pub entry_count: i64,
    pub read_count: i64,
}

impl FeedSummaryRow {
    pub(crate) fn into_summary(self) -> FeedSummary {
        let read_frequency = if self.entry_count > 0 {
            self.read_count as f64 / self.entry_count as f64
        } else {
            0.0
        };
        FeedSummary {
            feed: self.feed,
            unread_count: self.unread_count,
            last_new_entry: self.last_new_entry,
            read_frequency,
        }
    }
}
