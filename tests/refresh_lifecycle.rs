//! End-to-end refresh lifecycle tests against a mock feed server.

use dispatch::feed::{
    refresh_all, refresh_all_favicons, refresh_feed, RefreshAll, RefreshGuard, RefreshScope,
    RefreshStatus,
};
use dispatch::storage::{Database, FeedScope, NewFeed};
use pretty_assertions::assert_eq;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn rss_with_items(items: &str) -> String {
    format!(
        r#"<?xml version="1.0"?>
<rss version="2.0"><channel>
    <title>Test Feed</title>
{items}
</channel></rss>"#
    )
}

async fn add_feed(db: &Database, url: &str) -> i64 {
    db.insert_feed(&NewFeed {
        url: url.to_string(),
        title: "Test Feed".to_string(),
        link: None,
        description: None,
        published: None,
    })
    .await
    .unwrap()
}

#[tokio::test]
async fn test_refresh_ingests_then_noops_on_rerun() {
    let mock_server = MockServer::start().await;
    let body = rss_with_items(
        r#"    <item><guid>1</guid><title>One</title><link>https://example.com/1</link></item>
    <item><guid>2</guid><title>Two</title><link>https://example.com/2</link></item>"#,
    );
    Mock::given(method("GET"))
        .and(path("/rss"))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .mount(&mock_server)
        .await;

    let db = Database::open(":memory:").await.unwrap();
    let client = reqwest::Client::new();
    let guard = RefreshGuard::new();
    let feed_id = add_feed(&db, &format!("{}/rss", mock_server.uri())).await;

    let outcome = refresh_feed(&db, &client, &guard, feed_id).await;
    assert_eq!(outcome.status.message(), "added 2 new entries");

    // Unchanged document: nothing new, nothing duplicated
    let outcome = refresh_feed(&db, &client, &guard, feed_id).await;
    assert_eq!(outcome.status.message(), "added 0 new entries");

    let entries = db
        .entries_for_scope(FeedScope::Feed(feed_id), 1, 50)
        .await
        .unwrap();
    assert_eq!(entries.len(), 2);

    let feed = db.get_feed(feed_id).await.unwrap().unwrap();
    assert!(feed.last_updated.is_some());
    assert!(feed.last_error.is_none());
}

#[tokio::test]
async fn test_refresh_all_isolates_failures() {
    let mock_server = MockServer::start().await;
    for i in 0..4 {
        let body = rss_with_items(&format!(
            "    <item><guid>{i}</guid><title>Post</title><link>https://example.com/f{i}</link></item>"
        ));
        Mock::given(method("GET"))
            .and(path(format!("/feed{i}")))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&mock_server)
            .await;
    }

    let db = Database::open(":memory:").await.unwrap();
    let client = reqwest::Client::new();
    let guard = RefreshGuard::new();

    let mut ids = Vec::new();
    for i in 0..4 {
        ids.push(add_feed(&db, &format!("{}/feed{i}", mock_server.uri())).await);
    }
    // Nothing listens on port 1; this one must fail without sinking the rest
    let dead_id = add_feed(&db, "http://127.0.0.1:1/rss").await;

    let result = refresh_all(&db, &client, &guard, 3).await.unwrap();
    let outcomes = match result {
        RefreshAll::Completed(outcomes) => outcomes,
        RefreshAll::AlreadyRunning => panic!("refresh unexpectedly declined"),
    };

    assert_eq!(outcomes.len(), 5);
    let succeeded = outcomes.iter().filter(|o| o.status.is_success()).count();
    assert_eq!(succeeded, 4);

    let failed = outcomes
        .iter()
        .find(|o| !o.status.is_success())
        .expect("one outcome should have failed");
    assert_eq!(failed.feed_id, dead_id);

    // The failure is recorded on the feed row, not just reported
    let dead = db.get_feed(dead_id).await.unwrap().unwrap();
    assert!(dead.last_error.is_some());
    assert!(dead.last_fetch_attempt.is_some());

    let all = db.entries_for_scope(FeedScope::All, 1, 50).await.unwrap();
    assert_eq!(all.len(), 4);
}

#[tokio::test]
async fn test_refresh_skips_bad_entries_keeps_good_ones() {
    let mock_server = MockServer::start().await;
    // Two linkless items and one duplicated link among the good ones
    let body = rss_with_items(
        r#"    <item><guid>a</guid><title>No link at all</title></item>
    <item><guid>b</guid><title>Good 1</title><link>https://example.com/1</link></item>
    <item><guid>c</guid><title>Blank link</title><link></link></item>
    <item><guid>d</guid><title>Good 2</title><link>https://example.com/2</link></item>
    <item><guid>e</guid><title>Repeat of 1</title><link>https://example.com/1</link></item>"#,
    );
    Mock::given(method("GET"))
        .and(path("/rss"))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .mount(&mock_server)
        .await;

    let db = Database::open(":memory:").await.unwrap();
    let client = reqwest::Client::new();
    let guard = RefreshGuard::new();
    let feed_id = add_feed(&db, &format!("{}/rss", mock_server.uri())).await;

    let outcome = refresh_feed(&db, &client, &guard, feed_id).await;
    match outcome.status {
        RefreshStatus::Success { new_entries, .. } => assert_eq!(new_entries, 2),
        other => panic!("Expected success, got {:?}", other),
    }
}

#[tokio::test]
async fn test_entries_without_dates_get_ingestion_time() {
    let mock_server = MockServer::start().await;
    let body = rss_with_items(
        r#"    <item><guid>1</guid><title>Undated</title><link>https://example.com/1</link></item>"#,
    );
    Mock::given(method("GET"))
        .and(path("/rss"))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .mount(&mock_server)
        .await;

    let db = Database::open(":memory:").await.unwrap();
    let client = reqwest::Client::new();
    let guard = RefreshGuard::new();
    let feed_id = add_feed(&db, &format!("{}/rss", mock_server.uri())).await;

    let before = chrono::Utc::now().timestamp();
    refresh_feed(&db, &client, &guard, feed_id).await;
    let after = chrono::Utc::now().timestamp();

    let entries = db
        .entries_for_scope(FeedScope::Feed(feed_id), 1, 10)
        .await
        .unwrap();
    assert_eq!(entries.len(), 1);
    assert!(entries[0].published >= before && entries[0].published <= after);
}

#[tokio::test]
async fn test_unparseable_date_falls_back_without_blocking_siblings() {
    let mock_server = MockServer::start().await;
    let body = rss_with_items(
        r#"    <item><guid>1</guid><title>Garbled</title><link>https://example.com/1</link>
        <pubDate>definitely not a date</pubDate></item>
    <item><guid>2</guid><title>Dated</title><link>https://example.com/2</link>
        <pubDate>Mon, 01 Jan 2024 00:00:00 GMT</pubDate></item>"#,
    );
    Mock::given(method("GET"))
        .and(path("/rss"))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .mount(&mock_server)
        .await;

    let db = Database::open(":memory:").await.unwrap();
    let client = reqwest::Client::new();
    let guard = RefreshGuard::new();
    let feed_id = add_feed(&db, &format!("{}/rss", mock_server.uri())).await;

    let before = chrono::Utc::now().timestamp();
    let outcome = refresh_feed(&db, &client, &guard, feed_id).await;
    let after = chrono::Utc::now().timestamp();
    assert_eq!(outcome.status.message(), "added 2 new entries");

    let entries = db
        .entries_for_scope(FeedScope::Feed(feed_id), 1, 10)
        .await
        .unwrap();
    let garbled = entries.iter().find(|e| e.title == "Garbled").unwrap();
    assert!(
        garbled.published >= before && garbled.published <= after,
        "garbage date should be stamped with ingestion time"
    );
    let dated = entries.iter().find(|e| e.title == "Dated").unwrap();
    assert_eq!(dated.published, 1704067200);
}

#[tokio::test]
async fn test_content_prefers_full_body_over_summary() {
    let mock_server = MockServer::start().await;
    let body = r#"<?xml version="1.0"?>
<feed xmlns="http://www.w3.org/2005/Atom">
    <title>Atom Feed</title>
    <id>urn:feed</id>
    <updated>2024-01-01T00:00:00Z</updated>
    <entry>
        <id>urn:1</id>
        <title>Rich</title>
        <link href="https://example.com/rich"/>
        <updated>2024-01-01T00:00:00Z</updated>
        <summary>short form</summary>
        <content type="html">long form body</content>
    </entry>
    <entry>
        <id>urn:2</id>
        <title>Sparse</title>
        <link href="https://example.com/sparse"/>
        <updated>2024-01-02T00:00:00Z</updated>
        <summary>only a summary</summary>
    </entry>
</feed>"#;
    Mock::given(method("GET"))
        .and(path("/atom"))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .mount(&mock_server)
        .await;

    let db = Database::open(":memory:").await.unwrap();
    let client = reqwest::Client::new();
    let guard = RefreshGuard::new();
    let feed_id = add_feed(&db, &format!("{}/atom", mock_server.uri())).await;

    refresh_feed(&db, &client, &guard, feed_id).await;

    let entries = db
        .entries_for_scope(FeedScope::Feed(feed_id), 1, 10)
        .await
        .unwrap();
    let rich = entries.iter().find(|e| e.title == "Rich").unwrap();
    assert_eq!(rich.content, "long form body");
    assert_eq!(rich.summary.as_deref(), Some("short form"));

    let sparse = entries.iter().find(|e| e.title == "Sparse").unwrap();
    assert_eq!(sparse.content, "only a summary");
}

#[tokio::test]
async fn test_malformed_document_salvaged_with_warning_then_cleared() {
    let mock_server = MockServer::start().await;
    let truncated = r#"<?xml version="1.0"?>
<rss version="2.0"><channel>
    <title>Cut Off</title>
    <item><guid>1</guid><title>Whole</title><link>https://example.com/1</link></item>
    <item><guid>2</guid><title>Torn in hal"#;
    Mock::given(method("GET"))
        .and(path("/rss"))
        .respond_with(ResponseTemplate::new(200).set_body_string(truncated))
        .up_to_n_times(1)
        .mount(&mock_server)
        .await;

    let clean = rss_with_items(
        r#"    <item><guid>1</guid><title>Whole</title><link>https://example.com/1</link></item>
    <item><guid>2</guid><title>Mended</title><link>https://example.com/2</link></item>"#,
    );
    Mock::given(method("GET"))
        .and(path("/rss"))
        .respond_with(ResponseTemplate::new(200).set_body_string(clean))
        .mount(&mock_server)
        .await;

    let db = Database::open(":memory:").await.unwrap();
    let client = reqwest::Client::new();
    let guard = RefreshGuard::new();
    let feed_id = add_feed(&db, &format!("{}/rss", mock_server.uri())).await;

    // First fetch: truncated document, one entry salvaged, warning recorded
    let outcome = refresh_feed(&db, &client, &guard, feed_id).await;
    match &outcome.status {
        RefreshStatus::Success {
            new_entries,
            warning,
        } => {
            assert_eq!(*new_entries, 1);
            assert!(warning.as_deref().unwrap().contains("recovered"));
        }
        other => panic!("Expected salvage success, got {:?}", other),
    }
    let feed = db.get_feed(feed_id).await.unwrap().unwrap();
    assert!(feed.last_error.as_deref().unwrap().contains("recovered"));

    // Second fetch: clean document, new entry lands and the warning clears
    let outcome = refresh_feed(&db, &client, &guard, feed_id).await;
    assert_eq!(outcome.status.message(), "added 1 new entries");
    let feed = db.get_feed(feed_id).await.unwrap().unwrap();
    assert!(feed.last_error.is_none());
}

#[tokio::test]
async fn test_duplicate_refresh_scopes_declined() {
    let db = Database::open(":memory:").await.unwrap();
    let client = reqwest::Client::new();
    let guard = RefreshGuard::new();
    let feed_id = add_feed(&db, "http://127.0.0.1:1/rss").await;

    // Simulate an in-flight full refresh
    let permit = guard.begin(RefreshScope::All).unwrap();
    match refresh_all(&db, &client, &guard, 2).await.unwrap() {
        RefreshAll::AlreadyRunning => {}
        RefreshAll::Completed(_) => panic!("second full refresh should have been declined"),
    }

    // Single-feed refreshes use their own scope and still run
    let held = guard.begin(RefreshScope::Feed(feed_id)).unwrap();
    let outcome = refresh_feed(&db, &client, &guard, feed_id).await;
    assert_eq!(outcome.status, RefreshStatus::Declined);
    drop(held);

    drop(permit);
    match refresh_all(&db, &client, &guard, 2).await.unwrap() {
        RefreshAll::Completed(outcomes) => assert_eq!(outcomes.len(), 1),
        RefreshAll::AlreadyRunning => panic!("guard should have been released"),
    }
}

#[tokio::test]
async fn test_refresh_all_with_no_feeds_is_empty() {
    let db = Database::open(":memory:").await.unwrap();
    let client = reqwest::Client::new();
    let guard = RefreshGuard::new();

    match refresh_all(&db, &client, &guard, 10).await.unwrap() {
        RefreshAll::Completed(outcomes) => assert!(outcomes.is_empty()),
        RefreshAll::AlreadyRunning => panic!("nothing should be running"),
    }
}

#[tokio::test]
async fn test_favicon_bulk_refresh_counts() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/with-icon/"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(r#"<html><head><link rel="icon" href="/icon.png"></head></html>"#)
                .insert_header("Content-Type", "text/html"),
        )
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/icon.png"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(vec![1, 2, 3, 4])
                .insert_header("Content-Type", "image/png"),
        )
        .mount(&mock_server)
        .await;
    // Second site: no icon tag and a 404 favicon.ico
    Mock::given(method("GET"))
        .and(path("/no-icon/"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("<html><head></head></html>")
                .insert_header("Content-Type", "text/html"),
        )
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/favicon.ico"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&mock_server)
        .await;

    let db = Database::open(":memory:").await.unwrap();
    let client = reqwest::Client::new();

    let with_icon = db
        .insert_feed(&NewFeed {
            url: "https://one.example.com/rss".to_string(),
            title: "One".to_string(),
            link: Some(format!("{}/with-icon/", mock_server.uri())),
            description: None,
            published: None,
        })
        .await
        .unwrap();
    db.insert_feed(&NewFeed {
        url: "https://two.example.com/rss".to_string(),
        title: "Two".to_string(),
        link: Some(format!("{}/no-icon/", mock_server.uri())),
        description: None,
        published: None,
    })
    .await
    .unwrap();

    let (updated, attempted) = refresh_all_favicons(&db, &client).await;
    assert_eq!((updated, attempted), (1, 2));

    let (data, mime) = db.favicon(with_icon).await.unwrap().unwrap();
    assert_eq!(mime, "image/png");
    assert_eq!(data, vec![1, 2, 3, 4]);
}
