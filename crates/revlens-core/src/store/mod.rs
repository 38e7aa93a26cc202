//! Durable cache tier backed by SQLite.
//!
//! Three collections survive process restarts:
//!
//! - `reviews`: one archived review set per app id (plus territory).
//! - `metadata`: a denormalized summary of each review set, written in the
//!   same transaction as the set itself so the two never diverge.
//! - `analysis`: opaque cache key → JSON payload, optionally owned by an app
//!   id for bulk eviction.
//!
//! `rusqlite` is blocking, so every operation runs on the blocking pool
//! against a single connection behind a mutex. [`DurableStore::init`] opens
//! the connection exactly once no matter how many callers race on it.

mod schema;

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::OnceCell;

use crate::Review;

pub use schema::SCHEMA_VERSION;

const MILLIS_PER_DAY: i64 = 24 * 60 * 60 * 1000;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("durable store used before init()")]
    NotInitialized,
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("blocking task failed: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),
    #[error("store connection lock poisoned")]
    Poisoned,
}

/// Where the durable tier keeps its data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreLocation {
    /// SQLite file; parent directories are created on init.
    File(PathBuf),
    /// Private in-memory database, lost when the store is dropped.
    Memory,
}

/// Denormalized summary of an archived review set.
#[derive(Debug, Clone, PartialEq)]
pub struct ReviewSetMetadata {
    pub app_id: String,
    pub territory: String,
    pub last_updated: DateTime<Utc>,
    pub review_count: usize,
    pub oldest_review: Option<DateTime<Utc>>,
    pub newest_review: Option<DateTime<Utc>>,
    pub schema_version: i32,
}

/// A review set read back from the store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredReviews {
    pub reviews: Vec<Review>,
    pub metadata: ReviewSetMetadata,
}

/// One row of the `analysis` collection.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisRecord {
    pub key: String,
    pub app_id: Option<String>,
    pub data: Value,
    pub created_at: DateTime<Utc>,
}

/// Rows removed by [`DurableStore::cleanup_old_data`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub reviews_removed: usize,
    pub analyses_removed: usize,
}

/// Best-effort storage usage estimate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StorageInfo {
    pub usage_bytes: u64,
    pub quota_bytes: u64,
    /// `false` when the numbers could not be determined (all zero).
    pub supported: bool,
}

impl StorageInfo {
    fn unsupported() -> Self {
        Self::default()
    }
}

/// Row counts per collection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreCounts {
    pub review_sets: usize,
    pub metadata: usize,
    pub analyses: usize,
}

/// Persistent record store for review sets and analysis results.
pub struct DurableStore {
    location: StoreLocation,
    conn: OnceCell<Arc<Mutex<Connection>>>,
    opens: AtomicUsize,
}

impl DurableStore {
    /// Create an uninitialized store. Call [`init`](Self::init) before use.
    pub fn new(location: StoreLocation) -> Self {
        Self {
            location,
            conn: OnceCell::new(),
            opens: AtomicUsize::new(0),
        }
    }

    /// Create and initialize a store in one step.
    pub async fn open(location: StoreLocation) -> Result<Self, StoreError> {
        let store = Self::new(location);
        store.init().await?;
        Ok(store)
    }

    /// Open the connection and create the schema on first run.
    ///
    /// Idempotent: concurrent callers all wait on the same initialization and
    /// end up sharing one connection. A failed attempt leaves the store
    /// uninitialized.
    pub async fn init(&self) -> Result<(), StoreError> {
        self.conn
            .get_or_try_init(|| async {
                let location = self.location.clone();
                self.opens.fetch_add(1, Ordering::SeqCst);
                let conn = tokio::task::spawn_blocking(move || open_connection(&location)).await??;
                match &self.location {
                    StoreLocation::File(path) => {
                        tracing::info!(path = %path.display(), "opened durable store");
                    }
                    StoreLocation::Memory => tracing::debug!("opened in-memory durable store"),
                }
                Ok::<_, StoreError>(Arc::new(Mutex::new(conn)))
            })
            .await?;
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.conn.initialized()
    }

    pub fn location(&self) -> &StoreLocation {
        &self.location
    }

    /// Run `f` on the blocking pool with exclusive access to the connection.
    async fn with_conn<R, F>(&self, f: F) -> Result<R, StoreError>
    where
        R: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<R, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(self.conn.get().ok_or(StoreError::NotInitialized)?);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|_| StoreError::Poisoned)?;
            f(&mut *guard)
        })
        .await?
    }

    /// Archive a review set, replacing any previous set for `app_id`.
    ///
    /// The `reviews` and `metadata` rows are written in one transaction.
    pub async fn store_reviews(
        &self,
        app_id: &str,
        reviews: &[Review],
        territory: &str,
    ) -> Result<ReviewSetMetadata, StoreError> {
        self.store_reviews_at(app_id, reviews, territory, Utc::now())
            .await
    }

    async fn store_reviews_at(
        &self,
        app_id: &str,
        reviews: &[Review],
        territory: &str,
        updated_at: DateTime<Utc>,
    ) -> Result<ReviewSetMetadata, StoreError> {
        let json = serde_json::to_string(reviews)?;
        let metadata = ReviewSetMetadata {
            app_id: app_id.to_string(),
            territory: territory.to_string(),
            last_updated: from_millis(updated_at.timestamp_millis()),
            review_count: reviews.len(),
            oldest_review: reviews.iter().filter_map(|r| r.date).min(),
            newest_review: reviews.iter().filter_map(|r| r.date).max(),
            schema_version: SCHEMA_VERSION,
        };

        let row = metadata.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let updated = row.last_updated.timestamp_millis();
            tx.execute(
                "INSERT OR REPLACE INTO reviews
                     (app_id, territory, reviews, last_updated, review_count)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![row.app_id, row.territory, json, updated, row.review_count as i64],
            )?;
            tx.execute(
                "INSERT OR REPLACE INTO metadata
                     (app_id, territory, last_updated, review_count,
                      oldest_review, newest_review, schema_version)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    row.app_id,
                    row.territory,
                    updated,
                    row.review_count as i64,
                    row.oldest_review.map(|d| d.timestamp_millis()),
                    row.newest_review.map(|d| d.timestamp_millis()),
                    row.schema_version,
                ],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await?;

        tracing::debug!(app_id, territory, count = metadata.review_count, "stored review set");
        Ok(metadata)
    }

    /// Read back the review set for `app_id`. A set archived under a
    /// different territory is reported as not found.
    pub async fn get_reviews(
        &self,
        app_id: &str,
        territory: &str,
    ) -> Result<Option<StoredReviews>, StoreError> {
        let app_id = app_id.to_string();
        let territory = territory.to_string();
        self.with_conn(move |conn| {
            let row: Option<(String, String, i64, i64)> = conn
                .query_row(
                    "SELECT territory, reviews, last_updated, review_count
                     FROM reviews WHERE app_id = ?1",
                    [&app_id],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
                )
                .optional()?;

            let Some((stored_territory, json, last_updated, count)) = row else {
                return Ok(None);
            };
            if stored_territory != territory {
                return Ok(None);
            }

            let reviews: Vec<Review> = serde_json::from_str(&json)?;
            let metadata = match query_metadata(conn, &app_id)? {
                Some(m) => m,
                None => ReviewSetMetadata {
                    app_id: app_id.clone(),
                    territory: stored_territory,
                    last_updated: from_millis(last_updated),
                    review_count: count.max(0) as usize,
                    oldest_review: reviews.iter().filter_map(|r| r.date).min(),
                    newest_review: reviews.iter().filter_map(|r| r.date).max(),
                    schema_version: SCHEMA_VERSION,
                },
            };
            Ok(Some(StoredReviews { reviews, metadata }))
        })
        .await
    }

    /// Summary of the archived set for `app_id` without loading the reviews.
    pub async fn get_metadata(&self, app_id: &str) -> Result<Option<ReviewSetMetadata>, StoreError> {
        let app_id = app_id.to_string();
        self.with_conn(move |conn| query_metadata(conn, &app_id)).await
    }

    /// Insert or replace an analysis payload under `key`.
    pub async fn store_analysis(
        &self,
        key: &str,
        data: &Value,
        app_id: Option<&str>,
    ) -> Result<(), StoreError> {
        let key = key.to_string();
        let json = serde_json::to_string(data)?;
        let app_id = app_id.map(str::to_string);
        let created_at = Utc::now().timestamp_millis();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO analysis (key, app_id, data, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![key, app_id, json, created_at],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get_analysis(&self, key: &str) -> Result<Option<AnalysisRecord>, StoreError> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            let row: Option<(Option<String>, String, i64)> = conn
                .query_row(
                    "SELECT app_id, data, created_at FROM analysis WHERE key = ?1",
                    [&key],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()?;
            let Some((app_id, json, created_at)) = row else {
                return Ok(None);
            };
            Ok(Some(AnalysisRecord {
                key,
                app_id,
                data: serde_json::from_str(&json)?,
                created_at: from_millis(created_at),
            }))
        })
        .await
    }

    /// Delete the review set, its metadata, and every analysis owned by
    /// `app_id`. Returns the number of analysis rows removed.
    pub async fn clear_app_data(&self, app_id: &str) -> Result<usize, StoreError> {
        let app_id = app_id.to_string();
        let removed = self
            .with_conn({
                let app_id = app_id.clone();
                move |conn| {
                    let tx = conn.transaction()?;
                    tx.execute("DELETE FROM reviews WHERE app_id = ?1", [&app_id])?;
                    tx.execute("DELETE FROM metadata WHERE app_id = ?1", [&app_id])?;
                    let analyses = tx.execute("DELETE FROM analysis WHERE app_id = ?1", [&app_id])?;
                    tx.commit()?;
                    Ok(analyses)
                }
            })
            .await?;
        tracing::info!(app_id = %app_id, analyses = removed, "cleared durable app data");
        Ok(removed)
    }

    /// Wipe all three collections.
    pub async fn clear_all(&self) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM reviews", [])?;
            tx.execute("DELETE FROM metadata", [])?;
            tx.execute("DELETE FROM analysis", [])?;
            tx.commit()?;
            // Best effort.
            let _ = conn.execute_batch("VACUUM");
            Ok(())
        })
        .await?;
        tracing::info!("cleared durable store");
        Ok(())
    }

    /// Remove review sets last updated, and analyses created, more than
    /// `days_to_keep` days ago. Removing a review set also removes its
    /// metadata and the analyses owned by the same app.
    pub async fn cleanup_old_data(&self, days_to_keep: u32) -> Result<CleanupReport, StoreError> {
        let cutoff = Utc::now().timestamp_millis() - i64::from(days_to_keep) * MILLIS_PER_DAY;
        let report = self
            .with_conn(move |conn| {
                let tx = conn.transaction()?;
                let analyses_removed = tx.execute(
                    "DELETE FROM analysis WHERE created_at < ?1
                        OR app_id IN (SELECT app_id FROM reviews WHERE last_updated < ?1)",
                    [cutoff],
                )?;
                tx.execute(
                    "DELETE FROM metadata
                     WHERE app_id IN (SELECT app_id FROM reviews WHERE last_updated < ?1)",
                    [cutoff],
                )?;
                let reviews_removed =
                    tx.execute("DELETE FROM reviews WHERE last_updated < ?1", [cutoff])?;
                tx.commit()?;
                Ok(CleanupReport {
                    reviews_removed,
                    analyses_removed,
                })
            })
            .await?;
        tracing::info!(
            days_to_keep,
            reviews = report.reviews_removed,
            analyses = report.analyses_removed,
            "cleaned up old durable data"
        );
        Ok(report)
    }

    /// Usage and quota estimate from SQLite page accounting. Never fails:
    /// returns zeros with `supported = false` when it cannot tell.
    pub async fn storage_info(&self) -> StorageInfo {
        let result = self
            .with_conn(|conn| {
                let page_size: i64 = conn.query_row("PRAGMA page_size", [], |r| r.get(0))?;
                let page_count: i64 = conn.query_row("PRAGMA page_count", [], |r| r.get(0))?;
                let max_pages: i64 = conn.query_row("PRAGMA max_page_count", [], |r| r.get(0))?;
                Ok(StorageInfo {
                    usage_bytes: (page_size.max(0) as u64).saturating_mul(page_count.max(0) as u64),
                    quota_bytes: (page_size.max(0) as u64).saturating_mul(max_pages.max(0) as u64),
                    supported: true,
                })
            })
            .await;
        match result {
            Ok(info) => info,
            Err(e) => {
                tracing::debug!(error = %e, "storage info unavailable");
                StorageInfo::unsupported()
            }
        }
    }

    pub async fn counts(&self) -> Result<StoreCounts, StoreError> {
        self.with_conn(|conn| {
            let count = |table: &str| -> Result<usize, rusqlite::Error> {
                conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |r| {
                    r.get::<_, i64>(0)
                })
                .map(|n| n.max(0) as usize)
            };
            Ok(StoreCounts {
                review_sets: count("reviews")?,
                metadata: count("metadata")?,
                analyses: count("analysis")?,
            })
        })
        .await
    }
}

impl std::fmt::Debug for DurableStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableStore")
            .field("location", &self.location)
            .field("initialized", &self.is_initialized())
            .finish()
    }
}

fn open_connection(location: &StoreLocation) -> Result<Connection, StoreError> {
    let conn = match location {
        StoreLocation::File(path) => {
            if let Some(parent) = path.parent()
                && !parent.as_os_str().is_empty()
            {
                std::fs::create_dir_all(parent)?;
            }
            Connection::open(path)?
        }
        StoreLocation::Memory => Connection::open_in_memory()?,
    };
    schema::init_schema(&conn)?;
    Ok(conn)
}

fn query_metadata(conn: &Connection, app_id: &str) -> Result<Option<ReviewSetMetadata>, StoreError> {
    let row = conn
        .query_row(
            "SELECT territory, last_updated, review_count, oldest_review, newest_review, schema_version
             FROM metadata WHERE app_id = ?1",
            [app_id],
            |row| {
                Ok(ReviewSetMetadata {
                    app_id: app_id.to_string(),
                    territory: row.get(0)?,
                    last_updated: from_millis(row.get(1)?),
                    review_count: row.get::<_, i64>(2)?.max(0) as usize,
                    oldest_review: row.get::<_, Option<i64>>(3)?.map(from_millis),
                    newest_review: row.get::<_, Option<i64>>(4)?.map(from_millis),
                    schema_version: row.get(5)?,
                })
            },
        )
        .optional()?;
    Ok(row)
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use serde_json::json;
    use tempfile::TempDir;

    /// A fresh directory and a database path inside it. The directory is
    /// removed when the guard drops.
    fn temp_store_path() -> (TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");
        (dir, path)
    }

    async fn memory_store() -> DurableStore {
        DurableStore::open(StoreLocation::Memory).await.unwrap()
    }

    fn sample_reviews() -> Vec<Review> {
        let base = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        vec![
            Review::new("1", "Love the new widgets").with_date(base + ChronoDuration::days(3)),
            Review::new("2", "Crashes on launch").with_date(base),
            Review::new("3", "Needs dark mode"),
        ]
    }

    #[tokio::test]
    async fn operations_before_init_fail() {
        let store = DurableStore::new(StoreLocation::Memory);
        assert!(!store.is_initialized());
        let err = store.get_analysis("k").await.unwrap_err();
        assert!(matches!(err, StoreError::NotInitialized));
        let info = store.storage_info().await;
        assert!(!info.supported);
        assert_eq!(info.usage_bytes, 0);
    }

    #[tokio::test]
    async fn concurrent_init_opens_once() {
        let store = Arc::new(DurableStore::new(StoreLocation::Memory));
        let mut handles = vec![];
        for _ in 0..8 {
            let s = store.clone();
            handles.push(tokio::spawn(async move { s.init().await }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert!(store.is_initialized());
        assert_eq!(store.opens.load(Ordering::SeqCst), 1);

        store.init().await.unwrap();
        assert_eq!(store.opens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn reviews_round_trip_with_metadata() {
        let store = memory_store().await;
        let reviews = sample_reviews();
        let meta = store.store_reviews("123", &reviews, "us").await.unwrap();
        assert_eq!(meta.review_count, 3);
        assert_eq!(meta.oldest_review, reviews[1].date);
        assert_eq!(meta.newest_review, reviews[0].date);
        assert_eq!(meta.schema_version, SCHEMA_VERSION);

        let stored = store.get_reviews("123", "us").await.unwrap().unwrap();
        assert_eq!(stored.reviews, reviews);
        assert_eq!(stored.metadata, meta);

        let only_meta = store.get_metadata("123").await.unwrap().unwrap();
        assert_eq!(only_meta, meta);
    }

    #[tokio::test]
    async fn territory_mismatch_is_not_found() {
        let store = memory_store().await;
        store.store_reviews("123", &sample_reviews(), "us").await.unwrap();
        assert!(store.get_reviews("123", "gb").await.unwrap().is_none());
        assert!(store.get_reviews("456", "us").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn store_reviews_replaces_previous_set() {
        let store = memory_store().await;
        store.store_reviews("123", &sample_reviews(), "us").await.unwrap();
        store
            .store_reviews("123", &[Review::new("9", "Only one")], "gb")
            .await
            .unwrap();
        let counts = store.counts().await.unwrap();
        assert_eq!(counts.review_sets, 1);
        assert_eq!(counts.metadata, 1);
        let stored = store.get_reviews("123", "gb").await.unwrap().unwrap();
        assert_eq!(stored.metadata.review_count, 1);
        assert!(stored.metadata.oldest_review.is_none());
    }

    #[tokio::test]
    async fn analysis_round_trip() {
        let store = memory_store().await;
        let data = json!({"summary": "Users want dark mode", "score": 0.4});
        store.store_analysis("key-1", &data, Some("123")).await.unwrap();

        let record = store.get_analysis("key-1").await.unwrap().unwrap();
        assert_eq!(record.key, "key-1");
        assert_eq!(record.app_id.as_deref(), Some("123"));
        assert_eq!(record.data, data);
        assert!(store.get_analysis("key-2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn clear_app_data_cascades_only_to_owner() {
        let store = memory_store().await;
        store.store_reviews("X", &sample_reviews(), "us").await.unwrap();
        store.store_reviews("Y", &sample_reviews(), "us").await.unwrap();
        store.store_analysis("x1", &json!(1), Some("X")).await.unwrap();
        store.store_analysis("x2", &json!(2), Some("X")).await.unwrap();
        store.store_analysis("y1", &json!(3), Some("Y")).await.unwrap();
        store.store_analysis("free", &json!(4), None).await.unwrap();

        let removed = store.clear_app_data("X").await.unwrap();
        assert_eq!(removed, 2);

        assert!(store.get_reviews("X", "us").await.unwrap().is_none());
        assert!(store.get_metadata("X").await.unwrap().is_none());
        assert!(store.get_analysis("x1").await.unwrap().is_none());
        assert!(store.get_analysis("x2").await.unwrap().is_none());

        assert!(store.get_reviews("Y", "us").await.unwrap().is_some());
        assert!(store.get_metadata("Y").await.unwrap().is_some());
        assert!(store.get_analysis("y1").await.unwrap().is_some());
        assert!(store.get_analysis("free").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn clear_all_wipes_every_collection() {
        let store = memory_store().await;
        store.store_reviews("X", &sample_reviews(), "us").await.unwrap();
        store.store_analysis("x1", &json!(1), Some("X")).await.unwrap();
        store.clear_all().await.unwrap();
        assert_eq!(store.counts().await.unwrap(), StoreCounts::default());
    }

    #[tokio::test]
    async fn cleanup_removes_only_old_review_sets() {
        let store = memory_store().await;
        let now = Utc::now();
        store
            .store_reviews_at("old", &sample_reviews(), "us", now - ChronoDuration::days(40))
            .await
            .unwrap();
        store
            .store_reviews_at("new", &sample_reviews(), "us", now - ChronoDuration::days(5))
            .await
            .unwrap();
        store.store_analysis("old-a", &json!(1), Some("old")).await.unwrap();
        store.store_analysis("new-a", &json!(2), Some("new")).await.unwrap();

        let report = store.cleanup_old_data(30).await.unwrap();
        assert_eq!(report.reviews_removed, 1);
        assert_eq!(report.analyses_removed, 1);

        assert!(store.get_reviews("old", "us").await.unwrap().is_none());
        assert!(store.get_metadata("old").await.unwrap().is_none());
        assert!(store.get_analysis("old-a").await.unwrap().is_none());
        assert!(store.get_reviews("new", "us").await.unwrap().is_some());
        assert!(store.get_analysis("new-a").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn cleanup_removes_old_analyses() {
        let store = memory_store().await;
        store.store_analysis("stale", &json!(1), None).await.unwrap();
        store.store_analysis("fresh", &json!(2), None).await.unwrap();
        let backdated = (Utc::now() - ChronoDuration::days(10)).timestamp_millis();
        store
            .with_conn(move |conn| {
                conn.execute(
                    "UPDATE analysis SET created_at = ?1 WHERE key = 'stale'",
                    [backdated],
                )?;
                Ok(())
            })
            .await
            .unwrap();

        let report = store.cleanup_old_data(7).await.unwrap();
        assert_eq!(report.analyses_removed, 1);
        assert!(store.get_analysis("stale").await.unwrap().is_none());
        assert!(store.get_analysis("fresh").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn persists_across_reopen() {
        let (_dir, path) = temp_store_path();
        {
            let store = DurableStore::open(StoreLocation::File(path.clone()))
                .await
                .unwrap();
            store.store_reviews("123", &sample_reviews(), "us").await.unwrap();
            store.store_analysis("k", &json!({"ok": true}), Some("123")).await.unwrap();
        }

        let reopened = DurableStore::open(StoreLocation::File(path.clone()))
            .await
            .unwrap();
        assert!(reopened.get_reviews("123", "us").await.unwrap().is_some());
        assert_eq!(
            reopened.get_analysis("k").await.unwrap().unwrap().data,
            json!({"ok": true})
        );

        let info = reopened.storage_info().await;
        assert!(info.supported);
        assert!(info.usage_bytes > 0);
        assert!(info.quota_bytes >= info.usage_bytes);
    }

    #[tokio::test]
    async fn corrupted_payload_is_an_error_not_a_panic() {
        let (_dir, path) = temp_store_path();
        let store = DurableStore::open(StoreLocation::File(path.clone()))
            .await
            .unwrap();
        store.store_analysis("k", &json!([1, 2]), None).await.unwrap();

        // Corrupt the payload through a second connection.
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute("UPDATE analysis SET data = '{not json' WHERE key = 'k'", [])
                .unwrap();
        }

        let err = store.get_analysis("k").await.unwrap_err();
        assert!(matches!(err, StoreError::Serialization(_)));
    }

    #[tokio::test]
    async fn init_fails_when_parent_is_a_file() {
        let (_dir, blocker) = temp_store_path();
        std::fs::write(&blocker, b"not a directory").unwrap();
        let store = DurableStore::new(StoreLocation::File(blocker.join("nested").join("db")));
        assert!(store.init().await.is_err());
        assert!(!store.is_initialized());
    }
}
