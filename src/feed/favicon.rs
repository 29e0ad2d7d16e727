use std::time::Duration;

use futures::StreamExt;

use crate::storage::Database;

const ICON_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_ICON_SIZE: usize = 1024 * 1024; // 1MB

/// A downloaded favicon, ready to store.
#[derive(Debug, Clone)]
pub struct Favicon {
    pub data: Vec<u8>,
    pub mime_type: String,
}

/// Resolve and download the favicon for a site.
///
/// Fetches the site's HTML and scans it for an icon `<link>` tag; when none
/// is declared, falls back to the conventional `/favicon.ico` path. Favicon
/// resolution is strictly best-effort: every failure along the way collapses
/// to `None`, and a feed without an icon is not an error.
pub async fn resolve_favicon(client: &reqwest::Client, site_url: &str) -> Option<Favicon> {
    let html = fetch_site_html(client, site_url).await?;

    let icon_url = match find_icon_link(&html) {
        Some(href) => resolve_icon_url(&href, site_url)?,
        None => default_icon_url(site_url)?,
    };

    download_icon(client, &icon_url).await
}

/// Refresh favicons for every feed that has a site link.
///
/// Runs sequentially; favicon churn is rare and this is an explicit
/// maintenance operation, not part of the refresh hot path. Returns
/// `(updated, attempted)`.
pub async fn refresh_all_favicons(db: &Database, client: &reqwest::Client) -> (usize, usize) {
    let feeds = match db.feeds_with_site_link().await {
        Ok(feeds) => feeds,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to list feeds for favicon refresh");
            return (0, 0);
        }
    };

    let attempted = feeds.len();
    let mut updated = 0;

    for (feed_id, site_url) in feeds {
        let Some(icon) = resolve_favicon(client, &site_url).await else {
            tracing::debug!(feed_id = feed_id, site = %site_url, "No favicon found");
            continue;
        };

        match db.set_favicon(feed_id, &icon.data, &icon.mime_type).await {
            Ok(()) => updated += 1,
            Err(e) => {
                tracing::warn!(feed_id = feed_id, error = %e, "Failed to store favicon");
            }
        }
    }

    (updated, attempted)
}

async fn fetch_site_html(client: &reqwest::Client, site_url: &str) -> Option<String> {
    let response = tokio::time::timeout(ICON_TIMEOUT, client.get(site_url).send())
        .await
        .ok()?
        .ok()?;

    if !response.status().is_success() {
        return None;
    }

    let bytes = read_icon_bytes(response).await?;
    Some(String::from_utf8_lossy(&bytes).into_owned())
}

/// Download an icon URL and classify its MIME type.
///
/// The Content-Type header wins when present; otherwise the type is guessed
/// from the URL's extension, defaulting to `image/x-icon`. A response whose
/// Content-Type says it is not an image (a soft-404 HTML page at
/// `/favicon.ico`, typically) is rejected outright.
pub async fn download_icon(client: &reqwest::Client, icon_url: &str) -> Option<Favicon> {
    let response = tokio::time::timeout(ICON_TIMEOUT, client.get(icon_url).send())
        .await
        .ok()?
        .ok()?;

    if !response.status().is_success() {
        return None;
    }

    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(';').next().unwrap_or(v).trim().to_lowercase());

    let header_mime = match content_type {
        Some(ct) if ct.starts_with("image/") => Some(ct),
        Some(_) => return None,
        None => None,
    };

    let data = read_icon_bytes(response).await?;
    if data.is_empty() {
        return None;
    }

    let mime_type = header_mime.unwrap_or_else(|| guess_mime_type(icon_url).to_string());
    Some(Favicon { data, mime_type })
}

async fn read_icon_bytes(response: reqwest::Response) -> Option<Vec<u8>> {
    if let Some(len) = response.content_length() {
        if len as usize > MAX_ICON_SIZE {
            return None;
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.ok()?;
        if bytes.len().saturating_add(chunk.len()) > MAX_ICON_SIZE {
            return None;
        }
        bytes.extend_from_slice(&chunk);
    }

    Some(bytes)
}

/// Scan HTML for an icon `<link>` tag.
///
/// Matches `rel="icon"` and `rel="shortcut icon"` (either quote style, any
/// attribute order) via plain string scanning rather than a full HTML
/// parser. Returns the href as written in the document.
fn find_icon_link(html: &str) -> Option<String> {
    let html_lower = html.to_lowercase();
    let mut search_from = 0;

    while let Some(link_start) = html_lower[search_from..].find("<link") {
        let abs_start = search_from + link_start;
        let remaining = &html_lower[abs_start..];

        let tag_end = match remaining.find('>') {
            Some(pos) => pos,
            None => break,
        };

        let tag = &remaining[..=tag_end];

        if is_icon_rel(tag) {
            // Extract href from the original (non-lowered) HTML to preserve URL case
            let original_tag = &html[abs_start..abs_start + tag_end + 1];
            if let Some(href) = extract_attr_value(original_tag, "href") {
                if !href.trim().is_empty() {
                    return Some(href.to_owned());
                }
            }
        }

        search_from = abs_start + tag_end + 1;
    }

    None
}

fn is_icon_rel(tag: &str) -> bool {
    contains_attr(tag, "rel", "icon") || contains_attr(tag, "rel", "shortcut icon")
}

/// Checks if a lowercased tag contains an attribute with the given value.
fn contains_attr(tag: &str, attr_name: &str, attr_value: &str) -> bool {
    let pattern_double = format!("{attr_name}=\"{attr_value}\"");
    let pattern_single = format!("{attr_name}='{attr_value}'");
    tag.contains(&pattern_double) || tag.contains(&pattern_single)
}

/// Extracts the value of an attribute from a tag string (case-preserving).
fn extract_attr_value<'a>(tag: &'a str, attr_name: &str) -> Option<&'a str> {
    let tag_lower = tag.to_lowercase();
    let attr_prefix = format!("{attr_name}=");

    let attr_start = tag_lower.find(&attr_prefix)?;
    let value_start = attr_start + attr_prefix.len();

    if value_start >= tag.len() {
        return None;
    }

    let rest = &tag[value_start..];
    let quote = rest.as_bytes().first()?;

    if *quote != b'"' && *quote != b'\'' {
        return None;
    }

    let quote_char = *quote as char;
    let inner = &rest[1..];
    let end = inner.find(quote_char)?;

    Some(&inner[..end])
}

/// Resolves an icon href against the site base URL.
fn resolve_icon_url(href: &str, base_url: &str) -> Option<String> {
    if href.starts_with("http://") || href.starts_with("https://") {
        return Some(href.to_owned());
    }

    // Protocol-relative: normalize through the URL parser
    if href.starts_with("//") {
        let with_scheme = format!("https:{}", href);
        return url::Url::parse(&with_scheme).ok().map(|u| u.to_string());
    }

    let base = url::Url::parse(base_url).ok()?;
    base.join(href).ok().map(|u| u.to_string())
}

/// The conventional `/favicon.ico` at the site root.
fn default_icon_url(site_url: &str) -> Option<String> {
    let base = url::Url::parse(site_url).ok()?;
    base.join("/favicon.ico").ok().map(|u| u.to_string())
}

fn guess_mime_type(icon_url: &str) -> &'static str {
    let path = icon_url.split(['?', '#']).next().unwrap_or(icon_url);
    let extension = path.rsplit('.').next().unwrap_or("").to_lowercase();
    match extension.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "svg" => "image/svg+xml",
        "gif" => "image/gif",
        _ => "image/x-icon",
    }
}
