use chrono::Utc;

use super::schema::Database;
use super::types::{
    AggregateSummary, DatabaseError, Feed, FeedOrder, FeedSummary, FeedSummaryRow, NewEntry,
    NewFeed,
};

/// Column list shared by single-feed lookups (favicon blob excluded).
const FEED_COLUMNS: &str = "id, url, title, link, description, published, favicon_mime, \
     last_updated, last_fetch_attempt, last_error, pinned";

impl Database {
    // ========================================================================
    // Feed Registry
    // ========================================================================

    /// Insert a feed, or refresh its metadata if the URL is already
    /// subscribed. Returns the feed id either way; the source URL stays
    /// unique across all feeds.
    pub async fn insert_feed(&self, feed: &NewFeed) -> Result<i64, DatabaseError> {
        let row: (i64,) = sqlx::query_as(
            r#"
            INSERT INTO feeds (url, title, link, description, published)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(url) DO UPDATE SET
                title = excluded.title,
                link = excluded.link,
                description = excluded.description
            RETURNING id
        "#,
        )
        .bind(&feed.url)
        .bind(&feed.title)
        .bind(&feed.link)
        .bind(&feed.description)
        .bind(feed.published)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.0)
    }

    pub async fn get_feed(&self, feed_id: i64) -> Result<Option<Feed>, DatabaseError> {
        let feed = sqlx::query_as::<_, Feed>(&format!(
            "SELECT {FEED_COLUMNS} FROM feeds WHERE id = ?"
        ))
        .bind(feed_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(feed)
    }

    pub async fn find_feed_by_url(&self, url: &str) -> Result<Option<Feed>, DatabaseError> {
        let feed = sqlx::query_as::<_, Feed>(&format!(
            "SELECT {FEED_COLUMNS} FROM feeds WHERE url = ?"
        ))
        .bind(url)
        .fetch_optional(&self.pool)
        .await?;

        Ok(feed)
    }

    /// Delete a feed and cascade-delete its entries.
    /// Returns the number of entries removed with it.
    pub async fn delete_feed(&self, feed_id: i64) -> Result<u64, DatabaseError> {
        let mut tx = self.pool.begin().await?;

        let entry_count: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM entries WHERE feed_id = ?")
                .bind(feed_id)
                .fetch_one(&mut *tx)
                .await?;

        sqlx::query("DELETE FROM feeds WHERE id = ?")
            .bind(feed_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(entry_count.0 as u64)
    }

    /// Snapshot of all feed ids, used by the refresh orchestrator to fan out.
    pub async fn feed_ids(&self) -> Result<Vec<i64>, DatabaseError> {
        let rows: Vec<(i64,)> = sqlx::query_as("SELECT id FROM feeds ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    pub async fn set_pinned(&self, feed_id: i64, pinned: bool) -> Result<(), DatabaseError> {
        sqlx::query("UPDATE feeds SET pinned = ? WHERE id = ?")
            .bind(pinned)
            .bind(feed_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ========================================================================
    // Ingestion Bookkeeping
    // ========================================================================

    /// Stamp the fetch attempt before the network call, so status views
    /// reflect in-flight work.
    pub async fn record_fetch_attempt(&self, feed_id: i64) -> Result<(), DatabaseError> {
        let now = Utc::now().timestamp();
        sqlx::query("UPDATE feeds SET last_fetch_attempt = ? WHERE id = ?")
            .bind(now)
            .bind(feed_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn record_fetch_error(&self, feed_id: i64, error: &str) -> Result<(), DatabaseError> {
        sqlx::query("UPDATE feeds SET last_error = ? WHERE id = ?")
            .bind(error)
            .bind(feed_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Commit one feed's refresh atomically: insert the new entries, update
    /// the last-updated timestamp, and set the error state to the parse
    /// warning (or clear it on a clean run). If any step fails the whole
    /// batch rolls back, so a feed is never left half-written.
    ///
    /// Returns the number of entries actually inserted. Rows whose
    /// `(feed_id, link)` already exists are skipped, never updated, which
    /// makes a re-run against an unchanged document a no-op.
    pub async fn finish_refresh(
        &self,
        feed_id: i64,
        entries: &[NewEntry],
        warning: Option<&str>,
    ) -> Result<usize, DatabaseError> {
        let now = Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0usize;

        for entry in entries {
            let result = sqlx::query(
                r#"
                INSERT OR IGNORE INTO entries
                    (feed_id, title, link, summary, content, published, author, guid)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            )
            .bind(feed_id)
            .bind(&entry.title)
            .bind(&entry.link)
            .bind(&entry.summary)
            .bind(&entry.content)
            .bind(entry.published)
            .bind(&entry.author)
            .bind(&entry.guid)
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() > 0 {
                inserted += 1;
            }
        }

        sqlx::query("UPDATE feeds SET last_updated = ?, last_error = ? WHERE id = ?")
            .bind(now)
            .bind(warning)
            .bind(feed_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(inserted)
    }

    // ========================================================================
    // Favicons
    // ========================================================================

    pub async fn set_favicon(
        &self,
        feed_id: i64,
        data: &[u8],
        mime_type: &str,
    ) -> Result<(), DatabaseError> {
        sqlx::query("UPDATE feeds SET favicon = ?, favicon_mime = ? WHERE id = ?")
            .bind(data)
            .bind(mime_type)
            .bind(feed_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Favicon blob and MIME type for one feed, if one has been stored.
    pub async fn favicon(&self, feed_id: i64) -> Result<Option<(Vec<u8>, String)>, DatabaseError> {
        let row: Option<(Option<Vec<u8>>, Option<String>)> =
            sqlx::query_as("SELECT favicon, favicon_mime FROM feeds WHERE id = ?")
                .bind(feed_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.and_then(|(data, mime)| Some((data?, mime?))))
    }

    /// Feeds eligible for a bulk favicon refresh: those with a site link.
    pub async fn feeds_with_site_link(&self) -> Result<Vec<(i64, String)>, DatabaseError> {
        let rows: Vec<(i64, String)> = sqlx::query_as(
            "SELECT id, link FROM feeds WHERE link IS NOT NULL AND link != '' ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    // ========================================================================
    // Read Paths
    // ========================================================================

    /// All feeds with their derived attributes: unread count, newest entry
    /// published date, read frequency. One aggregate query; pinned feeds
    /// sort first under either ordering.
    pub async fn list_feed_summaries(
        &self,
        order: FeedOrder,
    ) -> Result<Vec<FeedSummary>, DatabaseError> {
        let order_clause = match order {
            FeedOrder::Title => "f.pinned DESC, f.title COLLATE NOCASE ASC",
            FeedOrder::Recent => "f.pinned DESC, last_new_entry DESC",
        };

        let rows: Vec<FeedSummaryRow> = sqlx::query_as(&format!(
            r#"
                SELECT
                    f.id, f.url, f.title, f.link, f.description, f.published,
                    f.favicon_mime, f.last_updated, f.last_fetch_attempt,
                    f.last_error, f.pinned,
                    COUNT(CASE WHEN e.read = 0 THEN 1 END) AS unread_count,
                    MAX(e.published) AS last_new_entry,
                    COUNT(e.id) AS entry_count,
                    COUNT(CASE WHEN e.read = 1 THEN 1 END) AS read_count
                FROM feeds f
                LEFT JOIN entries e ON e.feed_id = f.id
                GROUP BY f.id
                ORDER BY {order_clause}
            "#
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(FeedSummaryRow::into_summary).collect())
    }

    /// The "all feeds" pseudo-feed, synthesized at read time. Counts every
    /// entry row, including legacy orphans whose feed is gone.
    pub async fn aggregate_summary(&self) -> Result<AggregateSummary, DatabaseError> {
        let row: (i64, Option<i64>) = sqlx::query_as(
            "SELECT COUNT(CASE WHEN read = 0 THEN 1 END), MAX(published) FROM entries",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(AggregateSummary {
            unread_count: row.0,
            last_new_entry: row.1,
        })
    }
}
