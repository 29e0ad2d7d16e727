use chrono::{DateTime, Utc};

use crate::feed::client::RawEntry;
use crate::storage::NewEntry;

/// Convert a raw wire entry into a storable record.
///
/// Returns `None` for entries with no usable link; every stored entry is
/// keyed by `(feed_id, link)`, so a linkless entry has no identity.
///
/// Missing fields get deterministic fallbacks:
/// - content falls back to the summary, then to the link itself
/// - the published date falls back to the updated date, then to `now`
/// - title and author default to the empty string
pub fn normalize_entry(raw: RawEntry, now: DateTime<Utc>) -> Option<NewEntry> {
    let link = raw.link.as_deref().map(str::trim).filter(|l| !l.is_empty())?;

    let content = raw
        .content
        .clone()
        .filter(|c| !c.trim().is_empty())
        .or_else(|| raw.summary.clone().filter(|s| !s.trim().is_empty()))
        .unwrap_or_else(|| link.to_string());

    let published = raw.published.or(raw.updated).unwrap_or(now).timestamp();

    Some(NewEntry {
        title: raw.title.unwrap_or_default(),
        link: link.to_string(),
        summary: raw.summary,
        content,
        published,
        author: raw.author.unwrap_or_default(),
        guid: raw.guid,
    })
}
