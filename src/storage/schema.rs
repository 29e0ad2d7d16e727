use std::str::FromStr;
use std::time::Duration;

use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    SqlitePool,
};

use super::types::DatabaseError;

// ============================================================================
// Database
// ============================================================================

#[derive(Clone)]
pub struct Database {
    pub(crate) pool: SqlitePool,
}

impl Database {
    /// Open a database connection pool and run migrations.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError::Migration` if the schema could not be created,
    /// `DatabaseError::Other` for connection failures.
    pub async fn open(path: &str) -> Result<Self, DatabaseError> {
        let url = format!("sqlite:{}?mode=rwc", path);

        // busy_timeout=5000: SQLite waits up to 5 seconds for locks to release
        // before returning SQLITE_BUSY. Handles transient contention between
        // concurrent ingestion transactions automatically.
        let options = SqliteConnectOptions::from_str(&url)?
            .foreign_keys(true)
            .pragma("busy_timeout", "5000");

        // An in-memory SQLite database is private to its connection, so the
        // pool must stay at a single connection or each one would see its own
        // empty database. On disk, SQLite is single-writer; 5 connections
        // covers peak concurrent readers during a refresh-all.
        let max_connections = if path == ":memory:" { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.migrate()
            .await
            .map_err(|e| DatabaseError::Migration(e.to_string()))?;
        Ok(db)
    }

    /// Run schema migrations atomically within one transaction.
    ///
    /// All statements use `IF NOT EXISTS` so re-running on an existing
    /// database is a no-op; late-added columns go through `ALTER TABLE`
    /// with the duplicate-column error ignored.
    async fn migrate(&self) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS feeds (
                id INTEGER PRIMARY KEY,
                url TEXT UNIQUE NOT NULL,
                title TEXT NOT NULL,
                link TEXT,
                description TEXT,
                published INTEGER,
                favicon BLOB,
                favicon_mime TEXT,
                last_updated INTEGER,
                last_fetch_attempt INTEGER,
                last_error TEXT
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS entries (
                id INTEGER PRIMARY KEY,
                feed_id INTEGER NOT NULL REFERENCES feeds(id) ON DELETE CASCADE,
                title TEXT NOT NULL DEFAULT '',
                link TEXT NOT NULL,
                summary TEXT,
                content TEXT NOT NULL,
                published INTEGER NOT NULL,
                author TEXT NOT NULL DEFAULT '',
                guid TEXT NOT NULL DEFAULT '',
                read INTEGER NOT NULL DEFAULT 0,
                UNIQUE(feed_id, link)
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        // Composite index for the unread count aggregation in list_feed_summaries
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_entries_feed_read ON entries(feed_id, read)")
            .execute(&mut *tx)
            .await?;

        // Entry listings filter by feed_id and sort by published DESC
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_entries_feed_published ON entries(feed_id, published DESC)",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_entries_published ON entries(published DESC)")
            .execute(&mut *tx)
            .await?;

        // Pinned flag arrived after the first schema version
        sqlx::query("ALTER TABLE feeds ADD COLUMN pinned INTEGER NOT NULL DEFAULT 0")
            .execute(&mut *tx)
            .await
            .ok(); // Ignore error if column already exists

        tx.commit().await?;

        Ok(())
    }
}
