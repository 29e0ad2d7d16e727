use thiserror::Error;

use crate::feed::client::{fetch_feed, FetchError};
use crate::feed::favicon::{download_icon, resolve_favicon};
use crate::storage::{Database, DatabaseError, NewFeed};

/// Errors that can occur when subscribing to a new feed.
#[derive(Debug, Error)]
pub enum SubscribeError {
    /// The URL is already in the subscription list
    #[error("already subscribed to {0}")]
    AlreadySubscribed(String),
    /// The feed could not be fetched or parsed
    #[error(transparent)]
    Fetch(#[from] FetchError),
    /// The feed could not be stored
    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// Subscribe to a feed URL: fetch it once to capture its metadata, store
/// the feed row, and try to resolve a favicon for it.
///
/// The first fetch validates the URL before anything is written, so a typo
/// never leaves a dead feed behind. The favicon step is best-effort; the
/// subscription succeeds without one. Returns the new feed's id.
pub async fn subscribe(
    db: &Database,
    client: &reqwest::Client,
    url: &str,
) -> Result<i64, SubscribeError> {
    if db.find_feed_by_url(url).await?.is_some() {
        return Err(SubscribeError::AlreadySubscribed(url.to_string()));
    }

    let fetched = fetch_feed(client, url).await?;

    let title = fetched
        .title
        .clone()
        .filter(|t| !t.trim().is_empty())
        .or_else(|| fetched.site_url.clone())
        .unwrap_or_else(|| url.to_string());

    let feed_id = db
        .insert_feed(&NewFeed {
            url: url.to_string(),
            title,
            link: fetched.site_url.clone(),
            description: fetched.description.clone(),
            published: fetched.published.map(|dt| dt.timestamp()),
        })
        .await?;

    // Favicon: prefer the icon the feed itself declares, then fall back to
    // scanning the site's HTML
    let icon = match &fetched.icon_url {
        Some(icon_url) => download_icon(client, icon_url).await,
        None => None,
    };
    let icon = match (icon, &fetched.site_url) {
        (Some(icon), _) => Some(icon),
        (None, Some(site_url)) => resolve_favicon(client, site_url).await,
        (None, None) => None,
    };

    if let Some(icon) = icon {
        if let Err(e) = db.set_favicon(feed_id, &icon.data, &icon.mime_type).await {
            tracing::warn!(feed_id = feed_id, error = %e, "Failed to store favicon");
        }
    }

    Ok(feed_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    // Site link points back at the mock server so favicon resolution never
    // leaves the test
    fn rss_body(site: &str) -> String {
        format!(
            r#"<?xml version="1.0"?>
<rss version="2.0"><channel>
    <title>Example Blog</title>
    <link>{site}/</link>
    <description>Posts about things</description>
    <item><guid>1</guid><title>First</title><link>{site}/1</link></item>
</channel></rss>"#
        )
    }

    async fn mount_site(mock_server: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(r#"<html><head><link rel="icon" href="/fav.png"></head></html>"#)
                    .insert_header("Content-Type", "text/html"),
            )
            .mount(mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path("/fav.png"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(vec![0x89, 0x50])
                    .insert_header("Content-Type", "image/png"),
            )
            .mount(mock_server)
            .await;
    }

    async fn test_db() -> Database {
        Database::open(":memory:").await.unwrap()
    }

    #[tokio::test]
    async fn test_subscribe_stores_feed_metadata_and_favicon() {
        let mock_server = MockServer::start().await;
        let site = mock_server.uri();
        Mock::given(method("GET"))
            .and(path("/rss"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(rss_body(&site))
                    .insert_header("Content-Type", "application/xml"),
            )
            .mount(&mock_server)
            .await;
        mount_site(&mock_server).await;

        let db = test_db().await;
        let client = reqwest::Client::new();
        let url = format!("{}/rss", site);

        let feed_id = subscribe(&db, &client, &url).await.unwrap();

        let feed = db.get_feed(feed_id).await.unwrap().unwrap();
        assert_eq!(feed.title, "Example Blog");
        assert_eq!(feed.url, url);
        assert_eq!(feed.link.as_deref(), Some(format!("{site}/").as_str()));
        assert_eq!(feed.description.as_deref(), Some("Posts about things"));

        let (data, mime) = db.favicon(feed_id).await.unwrap().unwrap();
        assert_eq!(mime, "image/png");
        assert_eq!(data, vec![0x89, 0x50]);
    }

    #[tokio::test]
    async fn test_subscribe_duplicate_url_rejected() {
        let mock_server = MockServer::start().await;
        let site = mock_server.uri();
        Mock::given(method("GET"))
            .and(path("/rss"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(rss_body(&site))
                    .insert_header("Content-Type", "application/xml"),
            )
            .mount(&mock_server)
            .await;
        mount_site(&mock_server).await;

        let db = test_db().await;
        let client = reqwest::Client::new();
        let url = format!("{}/rss", site);

        subscribe(&db, &client, &url).await.unwrap();
        match subscribe(&db, &client, &url).await {
            Err(SubscribeError::AlreadySubscribed(u)) => assert_eq!(u, url),
            other => panic!("Expected AlreadySubscribed, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_subscribe_unreachable_url_writes_nothing() {
        let db = test_db().await;
        let client = reqwest::Client::new();

        let result = subscribe(&db, &client, "http://127.0.0.1:1/rss").await;
        assert!(matches!(result, Err(SubscribeError::Fetch(_))));
        assert!(db
            .find_feed_by_url("http://127.0.0.1:1/rss")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_subscribe_untitled_feed_falls_back_to_url() {
        let untitled = r#"<?xml version="1.0"?>
<rss version="2.0"><channel>
    <item><guid>1</guid><title>Post</title><link>https://example.com/1</link></item>
</channel></rss>"#;

        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rss"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(untitled)
                    .insert_header("Content-Type", "application/xml"),
            )
            .mount(&mock_server)
            .await;

        let db = test_db().await;
        let client = reqwest::Client::new();
        let url = format!("{}/rss", mock_server.uri());

        let feed_id = subscribe(&db, &client, &url).await.unwrap();
        let feed = db.get_feed(feed_id).await.unwrap().unwrap();
        assert_eq!(feed.title, url);
    }
}
