use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use thiserror::Error;

/// Per-request fetch timeout.
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

const MAX_FEED_SIZE: usize = 10 * 1024 * 1024; // 10MB

/// Errors that can occur while fetching and parsing a feed document.
///
/// A single fetch attempt either succeeds or fails with exactly one of
/// these; there is no retrying inside an attempt. Callers decide whether
/// the failure is worth reporting or retrying on a later refresh.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network-level error (DNS, connection, TLS, etc.)
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// HTTP response with non-2xx status code
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// Request exceeded the 30-second timeout
    #[error("Request timed out")]
    Timeout,
    /// Response body exceeded the 10MB size limit
    #[error("Response too large")]
    ResponseTooLarge,
    /// Document could not be parsed as RSS or Atom, even after recovery
    #[error("Parse error: {0}")]
    Parse(String),
}

/// A fetched and parsed feed document, before normalization.
///
/// Fields mirror what the wire format actually carried: anything the
/// document omitted stays `None` here, and the normalizer decides on
/// fallbacks.
#[derive(Debug, Clone)]
pub struct FetchedFeed {
    pub title: Option<String>,
    /// The feed's own site link, excluding self-referential links back to
    /// the feed document.
    pub site_url: Option<String>,
    pub description: Option<String>,
    pub published: Option<DateTime<Utc>>,
    /// Icon URL declared inside the feed itself, when present.
    pub icon_url: Option<String>,
    pub entries: Vec<RawEntry>,
    /// Set when the document only parsed after truncation recovery.
    pub warning: Option<String>,
}

/// A single entry as the feed document described it.
#[derive(Debug, Clone)]
pub struct RawEntry {
    pub title: Option<String>,
    pub link: Option<String>,
    pub summary: Option<String>,
    pub content: Option<String>,
    pub author: Option<String>,
    pub published: Option<DateTime<Utc>>,
    pub updated: Option<DateTime<Utc>>,
    pub guid: String,
}

/// Fetch a feed URL and parse the response body.
///
/// The request runs under a 30-second timeout and the body is read in
/// chunks against a 10MB cap. Non-2xx statuses fail immediately; there is
/// no backoff loop, the next scheduled refresh is the retry.
pub async fn fetch_feed(client: &reqwest::Client, url: &str) -> Result<FetchedFeed, FetchError> {
    let response = tokio::time::timeout(FETCH_TIMEOUT, client.get(url).send())
        .await
        .map_err(|_| FetchError::Timeout)?
        .map_err(FetchError::Network)?;

    if !response.status().is_success() {
        return Err(FetchError::HttpStatus(response.status().as_u16()));
    }

    let bytes = read_limited_bytes(response, MAX_FEED_SIZE).await?;
    parse_document(&bytes, url)
}

async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, FetchError> {
    // Fast path: check Content-Length header
    if let Some(len) = response.content_length() {
        if len as usize > limit {
            return Err(FetchError::ResponseTooLarge);
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(FetchError::Network)?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(FetchError::ResponseTooLarge);
        }
        bytes.extend_from_slice(&chunk);
    }

    Ok(bytes)
}

/// Parse a feed document, recovering from truncated or trailing-garbage
/// XML when possible.
///
/// If a strict parse fails, the document is cut back to its last complete
/// item and re-parsed. A successful salvage yields the recovered entries
/// plus a warning; a salvage that recovers nothing is a hard parse error.
fn parse_document(bytes: &[u8], feed_url: &str) -> Result<FetchedFeed, FetchError> {
    match feed_rs::parser::parse(bytes) {
        Ok(feed) => Ok(convert_feed(feed, feed_url, None)),
        Err(err) => {
            let salvaged = salvage_entries(bytes)
                .ok_or_else(|| FetchError::Parse(err.to_string()))?;
            let warning = format!(
                "recovered {} entries from malformed document",
                salvaged.entries.len()
            );
            Ok(convert_feed(salvaged, feed_url, Some(warning)))
        }
    }
}

/// Re-parse a malformed document truncated at its last complete entry.
///
/// Handles the common real-world failure where a server cuts the response
/// off mid-entry or appends garbage after the closing tag. Returns `None`
/// unless the retry parses AND yields at least one entry.
fn salvage_entries(bytes: &[u8]) -> Option<feed_rs::model::Feed> {
    let text = String::from_utf8_lossy(bytes);

    let truncated = if let Some(pos) = text.rfind("</item>") {
        format!("{}</channel></rss>", &text[..pos + "</item>".len()])
    } else if let Some(pos) = text.rfind("</entry>") {
        format!("{}</feed>", &text[..pos + "</entry>".len()])
    } else {
        return None;
    };

    let feed = feed_rs::parser::parse(truncated.as_bytes()).ok()?;
    if feed.entries.is_empty() {
        return None;
    }
    Some(feed)
}

fn convert_feed(feed: feed_rs::model::Feed, feed_url: &str, warning: Option<String>) -> FetchedFeed {
    // Prefer the first link that is not the feed document itself
    let site_url = feed
        .links
        .iter()
        .find(|l| l.href != feed_url)
        .or_else(|| feed.links.first())
        .map(|l| l.href.clone());

    let icon_url = feed
        .icon
        .as_ref()
        .map(|i| i.uri.clone())
        .or_else(|| feed.logo.as_ref().map(|l| l.uri.clone()));

    let entries = feed.entries.into_iter().map(convert_entry).collect();

    FetchedFeed {
        title: feed.title.map(|t| t.content),
        site_url,
        description: feed.description.map(|d| d.content),
        published: feed.published,
        icon_url,
        entries,
        warning,
    }
}

fn convert_entry(entry: feed_rs::model::Entry) -> RawEntry {
    RawEntry {
        title: entry.title.map(|t| t.content),
        link: entry.links.first().map(|l| l.href.clone()),
        summary: entry.summary.map(|s| s.content),
        content: entry.content.and_then(|c| c.body),
        author: entry
            .authors
            .first()
            .map(|p| p.name.clone())
            .filter(|name| !name.trim().is_empty()),
        published: entry.published,
        updated: entry.updated,
        guid: entry.id,
    }
}
