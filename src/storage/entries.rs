use super::schema::Database;
use super::types::{DatabaseError, Entry, FeedScope};

/// Upper bound on a single page of entries, regardless of what the caller
/// asks for.
const MAX_PAGE_SIZE: u32 = 200;

const ENTRY_COLUMNS: &str =
    "id, feed_id, title, link, summary, content, published, author, guid, read";

impl Database {
    /// Whether an entry with this link already exists under the feed.
    /// Ingestion uses this to skip work before normalizing a full payload.
    pub async fn entry_exists(&self, feed_id: i64, link: &str) -> Result<bool, DatabaseError> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT 1 FROM entries WHERE feed_id = ? AND link = ?")
                .bind(feed_id)
                .bind(link)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.is_some())
    }

    /// One page of entries for a feed, or across all feeds, newest first.
    /// Pages are 1-based; a zero or oversized page size is clamped.
    pub async fn entries_for_scope(
        &self,
        scope: FeedScope,
        page: u32,
        per_page: u32,
    ) -> Result<Vec<Entry>, DatabaseError> {
        let per_page = per_page.clamp(1, MAX_PAGE_SIZE);
        let offset = page.saturating_sub(1).saturating_mul(per_page);

        let entries = match scope {
            FeedScope::All => {
                sqlx::query_as::<_, Entry>(&format!(
                    "SELECT {ENTRY_COLUMNS} FROM entries \
                     ORDER BY published DESC, id DESC LIMIT ? OFFSET ?"
                ))
                .bind(per_page)
                .bind(offset)
                .fetch_all(&self.pool)
                .await?
            }
            FeedScope::Feed(feed_id) => {
                sqlx::query_as::<_, Entry>(&format!(
                    "SELECT {ENTRY_COLUMNS} FROM entries WHERE feed_id = ? \
                     ORDER BY published DESC, id DESC LIMIT ? OFFSET ?"
                ))
                .bind(feed_id)
                .bind(per_page)
                .bind(offset)
                .fetch_all(&self.pool)
                .await?
            }
        };

        Ok(entries)
    }

    pub async fn get_entry(&self, entry_id: i64) -> Result<Option<Entry>, DatabaseError> {
        let entry = sqlx::query_as::<_, Entry>(&format!(
            "SELECT {ENTRY_COLUMNS} FROM entries WHERE id = ?"
        ))
        .bind(entry_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(entry)
    }

    pub async fn set_entry_read(&self, entry_id: i64, read: bool) -> Result<(), DatabaseError> {
        sqlx::query("UPDATE entries SET read = ? WHERE id = ?")
            .bind(read)
            .bind(entry_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Mark every entry in a scope read or unread. Returns the number of
    /// rows whose state actually changed.
    pub async fn mark_scope_read(
        &self,
        scope: FeedScope,
        read: bool,
    ) -> Result<u64, DatabaseError> {
        let result = match scope {
            FeedScope::All => {
                sqlx::query("UPDATE entries SET read = ? WHERE read != ?")
                    .bind(read)
                    .bind(read)
                    .execute(&self.pool)
                    .await?
            }
            FeedScope::Feed(feed_id) => {
                sqlx::query("UPDATE entries SET read = ? WHERE feed_id = ? AND read != ?")
                    .bind(read)
                    .bind(feed_id)
                    .bind(read)
                    .execute(&self.pool)
                    .await?
            }
        };
        Ok(result.rows_affected())
    }

    /// Replace an entry's content after the fact, e.g. with a fuller article
    /// body fetched separately. The author is only backfilled when the feed
    /// never provided one.
    pub async fn set_entry_content(
        &self,
        entry_id: i64,
        content: &str,
        author: Option<&str>,
    ) -> Result<(), DatabaseError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("UPDATE entries SET content = ? WHERE id = ?")
            .bind(content)
            .bind(entry_id)
            .execute(&mut *tx)
            .await?;

        if let Some(author) = author {
            sqlx::query("UPDATE entries SET author = ? WHERE id = ? AND author = ''")
                .bind(author)
                .bind(entry_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}
