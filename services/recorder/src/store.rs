//! SQLite persistence for the identity cache and broadcast history.

use crate::config::DatabaseConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::FromRow;
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, info, instrument};

/// Errors raised by the persistent store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

/// A capture dispatch, written once and never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastRecord {
    pub user_id: String,
    pub user_name: String,
    pub stream_id: String,
    pub recording_start: DateTime<Utc>,
    pub title: String,
    pub file_path: String,
}

/// Broadcast history row as stored.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct StoredBroadcast {
    pub id: i64,
    pub user_id: String,
    pub user_name: String,
    pub stream_id: String,
    pub recording_start: DateTime<Utc>,
    pub title: String,
    pub file_path: String,
    pub created_at: DateTime<Utc>,
}

/// Pooled SQLite store
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if missing) the database described by `config`.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(&config.url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(config.busy_timeout());

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await?;

        info!(url = %config.url, "Connected to SQLite database");

        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations").run(&self.pool).await?;

        info!("Database migrations completed");
        Ok(())
    }

    /// Canonical ID cached for a lower-cased login name.
    pub async fn cached_user_id(&self, login: &str) -> Result<Option<String>, StoreError> {
        let row: Option<(String,)> = sqlx::query_as(
            r#"
            SELECT user_id
            FROM user_name_to_id_mapping
            WHERE user_name = ?1
            "#,
        )
        .bind(login)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(id,)| id))
    }

    /// Insert or replace the cached ID for a login name.
    #[instrument(skip(self))]
    pub async fn save_user_id(&self, login: &str, user_id: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO user_name_to_id_mapping (user_name, user_id, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT (user_name) DO UPDATE SET
                user_id = excluded.user_id,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(login)
        .bind(user_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        debug!("Cached user id");
        Ok(())
    }

    /// Append a broadcast record; returns false if it was already present.
    #[instrument(skip(self, record), fields(user_id = %record.user_id, stream_id = %record.stream_id))]
    pub async fn insert_broadcast(&self, record: &BroadcastRecord) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO live_broadcast (
                user_id, user_name, stream_id, recording_start,
                title, file_path, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT (stream_id, recording_start) DO NOTHING
            "#,
        )
        .bind(&record.user_id)
        .bind(&record.user_name)
        .bind(&record.stream_id)
        .bind(record.recording_start)
        .bind(&record.title)
        .bind(&record.file_path)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        metrics::counter!("recorder.broadcasts.persisted").increment(result.rows_affected());

        Ok(result.rows_affected() == 1)
    }

    /// Most recent broadcasts, newest first.
    pub async fn recent_broadcasts(&self, limit: i64) -> Result<Vec<StoredBroadcast>, StoreError> {
        let rows = sqlx::query_as::<_, StoredBroadcast>(
            r#"
            SELECT id, user_id, user_name, stream_id, recording_start,
                   title, file_path, created_at
            FROM live_broadcast
            ORDER BY id DESC
            LIMIT ?1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    /// All broadcasts recorded for one account, oldest first.
    pub async fn broadcasts_for_user(&self, user_id: &str) -> Result<Vec<StoredBroadcast>, StoreError> {
        let rows = sqlx::query_as::<_, StoredBroadcast>(
            r#"
            SELECT id, user_id, user_name, stream_id, recording_start,
                   title, file_path, created_at
            FROM live_broadcast
            WHERE user_id = ?1
            ORDER BY id ASC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    /// Get the connection pool (for health checks)
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[cfg(test)]
pub(crate) async fn in_memory_store() -> SqliteStore {
    // A single connection keeps every query on the same in-memory database
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    let store = SqliteStore::from_pool(pool);
    store.run_migrations().await.unwrap();
    store
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record(stream_id: &str, minute: u32) -> BroadcastRecord {
        BroadcastRecord {
            user_id: "42".to_string(),
            user_name: "foo".to_string(),
            stream_id: stream_id.to_string(),
            recording_start: Utc.with_ymd_and_hms(2024, 5, 1, 12, minute, 0).unwrap(),
            title: "hello".to_string(),
            file_path: "/srv/foo/file.mp4".to_string(),
        }
    }

    #[tokio::test]
    async fn test_user_id_cache_roundtrip() {
        let store = in_memory_store().await;

        assert_eq!(store.cached_user_id("foo").await.unwrap(), None);

        store.save_user_id("foo", "42").await.unwrap();
        assert_eq!(store.cached_user_id("foo").await.unwrap(), Some("42".to_string()));
    }

    #[tokio::test]
    async fn test_save_user_id_upserts() {
        let store = in_memory_store().await;

        store.save_user_id("foo", "42").await.unwrap();
        store.save_user_id("foo", "43").await.unwrap();

        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM user_name_to_id_mapping")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(count.0, 1);
        assert_eq!(store.cached_user_id("foo").await.unwrap(), Some("43".to_string()));
    }

    #[tokio::test]
    async fn test_insert_broadcast_is_idempotent() {
        let store = in_memory_store().await;

        assert!(store.insert_broadcast(&record("123", 0)).await.unwrap());
        assert!(!store.insert_broadcast(&record("123", 0)).await.unwrap());
        // Same stream re-dispatched later is a separate capture
        assert!(store.insert_broadcast(&record("123", 30)).await.unwrap());

        let rows = store.broadcasts_for_user("42").await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].stream_id, "123");
        assert_eq!(rows[0].recording_start, record("123", 0).recording_start);
        assert_eq!(rows[0].file_path, "/srv/foo/file.mp4");
    }

    #[tokio::test]
    async fn test_recent_broadcasts_newest_first() {
        let store = in_memory_store().await;

        store.insert_broadcast(&record("1", 0)).await.unwrap();
        store.insert_broadcast(&record("2", 1)).await.unwrap();
        store.insert_broadcast(&record("3", 2)).await.unwrap();

        let rows = store.recent_broadcasts(2).await.unwrap();
        let ids: Vec<_> = rows.iter().map(|r| r.stream_id.as_str()).collect();
        assert_eq!(ids, vec!["3", "2"]);
    }
}
