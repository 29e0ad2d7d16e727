use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use futures::stream::{self, StreamExt};

use crate::feed::client::{fetch_feed, FetchedFeed};
use crate::feed::normalize::normalize_entry;
use crate::storage::{Database, DatabaseError, NewEntry};

/// Default bound on concurrent feed fetches during a full refresh.
pub const DEFAULT_WORKERS: usize = 10;

/// Stored error messages are capped so one pathological response cannot
/// bloat the feeds table.
const MAX_ERROR_LEN: usize = 300;

// ============================================================================
// Re-entrancy Guard
// ============================================================================

/// What a refresh task covers: one feed, or the whole subscription list.
///
/// Scopes are independent: a single-feed refresh may run while a full
/// refresh of a *different* feed is in flight, but two tasks with the same
/// scope never overlap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RefreshScope {
    All,
    Feed(i64),
}

/// Tracks in-flight refresh scopes so duplicate requests are declined
/// instead of queued.
///
/// Shared via `Arc`; [`RefreshGuard::begin`] hands out an RAII permit that
/// releases the scope when dropped, including on panic or early return.
#[derive(Debug, Default)]
pub struct RefreshGuard {
    in_flight: Mutex<HashSet<RefreshScope>>,
}

impl RefreshGuard {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Claim a scope. Returns `None` if a task with this scope is already
    /// running, in which case the caller reports "already running" and
    /// does no work.
    pub fn begin(self: &Arc<Self>, scope: RefreshScope) -> Option<RefreshPermit> {
        let mut in_flight = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !in_flight.insert(scope) {
            return None;
        }
        Some(RefreshPermit {
            guard: Arc::clone(self),
            scope,
        })
    }
}

/// RAII claim on a [`RefreshScope`], released on drop.
#[derive(Debug)]
pub struct RefreshPermit {
    guard: Arc<RefreshGuard>,
    scope: RefreshScope,
}

impl Drop for RefreshPermit {
    fn drop(&mut self) {
        let mut in_flight = self
            .guard
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        in_flight.remove(&self.scope);
    }
}

// ============================================================================
// Outcomes
// ============================================================================

/// How one feed's refresh ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshStatus {
    /// Fetch, parse, and store all succeeded. `warning` is set when the
    /// document only parsed after truncation recovery.
    Success {
        new_entries: usize,
        warning: Option<String>,
    },
    /// The refresh failed; the message is also recorded on the feed row.
    Failed(String),
    /// A refresh for the same scope was already running.
    Declined,
}

impl RefreshStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, RefreshStatus::Success { .. })
    }

    /// Human-readable one-liner for CLI output and logs.
    pub fn message(&self) -> String {
        match self {
            RefreshStatus::Success { new_entries, .. } => {
                format!("added {} new entries", new_entries)
            }
            RefreshStatus::Failed(reason) => reason.clone(),
            RefreshStatus::Declined => "refresh already running".to_string(),
        }
    }
}

/// Result of refreshing a single feed, tagged with the feed id so callers
/// can correlate outcomes from an unordered batch.
#[derive(Debug, Clone)]
pub struct RefreshOutcome {
    pub feed_id: i64,
    pub status: RefreshStatus,
}

/// Result of a full-subscription refresh.
#[derive(Debug)]
pub enum RefreshAll {
    /// Per-feed outcomes, in completion order.
    Completed(Vec<RefreshOutcome>),
    /// Another full refresh was already in flight; nothing was fetched.
    AlreadyRunning,
}

// ============================================================================
// Orchestration
// ============================================================================

/// Refresh a single feed, declining if one is already in flight for it.
pub async fn refresh_feed(
    db: &Database,
    client: &reqwest::Client,
    guard: &Arc<RefreshGuard>,
    feed_id: i64,
) -> RefreshOutcome {
    let Some(_permit) = guard.begin(RefreshScope::Feed(feed_id)) else {
        return RefreshOutcome {
            feed_id,
            status: RefreshStatus::Declined,
        };
    };

    let status = ingest(db, client, feed_id).await;
    RefreshOutcome { feed_id, status }
}

/// Refresh every subscribed feed with a bounded worker pool.
///
/// Fan-out is capped at `max_workers` concurrent fetches; outcomes arrive
/// in completion order, not subscription order. One feed's failure never
/// stops the rest, and a worker panic is converted into a `Failed` outcome
/// for that feed alone.
///
/// The whole operation holds the [`RefreshScope::All`] permit, and each
/// worker additionally claims its feed's scope, so a manual single-feed
/// refresh racing the batch is declined rather than duplicated.
pub async fn refresh_all(
    db: &Database,
    client: &reqwest::Client,
    guard: &Arc<RefreshGuard>,
    max_workers: usize,
) -> Result<RefreshAll, DatabaseError> {
    let Some(_permit) = guard.begin(RefreshScope::All) else {
        return Ok(RefreshAll::AlreadyRunning);
    };

    // Snapshot the subscription list; feeds added mid-refresh wait for the
    // next run
    let feed_ids = db.feed_ids().await?;
    if feed_ids.is_empty() {
        return Ok(RefreshAll::Completed(Vec::new()));
    }

    let total = feed_ids.len();
    let max_workers = max_workers.max(1);

    let outcomes: Vec<RefreshOutcome> = stream::iter(feed_ids)
        .map(|feed_id| {
            let db = db.clone();
            let client = client.clone();
            let guard = Arc::clone(guard);

            async move {
                // Spawned so a panic inside one feed's pipeline is isolated
                // from its siblings
                let handle = tokio::spawn(async move {
                    refresh_feed(&db, &client, &guard, feed_id).await
                });
                match handle.await {
                    Ok(outcome) => outcome,
                    Err(join_err) => {
                        tracing::error!(feed_id = feed_id, error = %join_err, "Refresh task panicked");
                        RefreshOutcome {
                            feed_id,
                            status: RefreshStatus::Failed("internal error during refresh".to_string()),
                        }
                    }
                }
            }
        })
        .buffer_unordered(max_workers)
        .collect()
        .await;

    let succeeded = outcomes.iter().filter(|o| o.status.is_success()).count();
    tracing::info!(
        total = total,
        succeeded = succeeded,
        failed = total - succeeded,
        "Refresh complete"
    );

    Ok(RefreshAll::Completed(outcomes))
}

// ============================================================================
// Single-feed Ingestion
// ============================================================================

/// Fetch one feed and store its new entries.
///
/// Failures split two ways: a fetch or parse failure is fatal for the feed
/// (recorded on its row and reported), while a bad individual entry is
/// skipped with a warning so one malformed item cannot block its siblings.
async fn ingest(db: &Database, client: &reqwest::Client, feed_id: i64) -> RefreshStatus {
    let feed = match db.get_feed(feed_id).await {
        Ok(Some(feed)) => feed,
        Ok(None) => return RefreshStatus::Failed(format!("feed {} not found", feed_id)),
        Err(e) => return RefreshStatus::Failed(truncate_error(&e.to_string())),
    };

    // Best-effort attempt stamp; the refresh proceeds even if it fails
    if let Err(e) = db.record_fetch_attempt(feed_id).await {
        tracing::warn!(feed_id = feed_id, error = %e, "Failed to record fetch attempt");
    }

    let fetched = match fetch_feed(client, &feed.url).await {
        Ok(fetched) => fetched,
        Err(e) => {
            let reason = truncate_error(&e.to_string());
            tracing::warn!(feed = %feed.url, error = %reason, "Feed fetch failed");
            if let Err(db_err) = db.record_fetch_error(feed_id, &reason).await {
                tracing::warn!(feed_id = feed_id, error = %db_err, "Failed to record fetch error");
            }
            return RefreshStatus::Failed(reason);
        }
    };

    let entries = collect_new_entries(db, feed_id, &feed.url, &fetched).await;
    let warning = fetched.warning;

    let result = db.finish_refresh(feed_id, &entries, warning.as_deref()).await;
    match result {
        Ok(inserted) => RefreshStatus::Success {
            new_entries: inserted,
            warning,
        },
        Err(e) => {
            let reason = truncate_error(&e.to_string());
            tracing::warn!(feed_id = feed_id, error = %reason, "Failed to store entries");
            RefreshStatus::Failed(reason)
        }
    }
}

/// Normalize the fetched entries, dropping duplicates and unusable items.
///
/// Deduplicates against both the current batch (a document repeating a
/// link) and the database, so `finish_refresh` mostly inserts fresh rows.
/// The `INSERT OR IGNORE` there still backstops races between workers.
async fn collect_new_entries(
    db: &Database,
    feed_id: i64,
    feed_url: &str,
    fetched: &FetchedFeed,
) -> Vec<NewEntry> {
    let now = Utc::now();
    let mut seen_links: HashSet<String> = HashSet::new();
    let mut entries: Vec<NewEntry> = Vec::new();
    let mut skipped = 0usize;

    for raw in &fetched.entries {
        let Some(entry) = normalize_entry(raw.clone(), now) else {
            skipped += 1;
            continue;
        };

        if !seen_links.insert(entry.link.clone()) {
            continue;
        }

        match db.entry_exists(feed_id, &entry.link).await {
            Ok(true) => continue,
            Ok(false) => entries.push(entry),
            Err(e) => {
                // Keep the entry; the unique index resolves it at insert time
                tracing::warn!(feed = %feed_url, error = %e, "Duplicate check failed");
                entries.push(entry);
            }
        }
    }

    if skipped > 0 {
        tracing::warn!(feed = %feed_url, skipped = skipped, "Entries without links skipped");
    }

    entries
}

fn truncate_error(message: &str) -> String {
    if message.len() <= MAX_ERROR_LEN {
        return message.to_string();
    }
    let mut end = MAX_ERROR_LEN;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &message[..end])
}
