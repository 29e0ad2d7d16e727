use super::schema::Database;
use super::types::{DatabaseError, FeedOrder};

/// Settings key controlling how the feed list is ordered.
pub const FEED_ORDER_KEY: &str = "feeds.order";

impl Database {
    pub async fn get_setting(&self, key: &str) -> Result<Option<String>, DatabaseError> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT value FROM settings WHERE key = ?")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(value,)| value))
    }

    pub async fn set_setting(&self, key: &str, value: &str) -> Result<(), DatabaseError> {
        sqlx::query(
            "INSERT INTO settings (key, value) VALUES (?, ?) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// The stored feed ordering, falling back to the default when the
    /// setting is absent or holds an unrecognized value.
    pub async fn feed_order(&self) -> Result<FeedOrder, DatabaseError> {
        let stored = self.get_setting(FEED_ORDER_KEY).await?;
        Ok(stored
            .as_deref()
            .and_then(FeedOrder::parse)
            .unwrap_or_default())
    }
}
