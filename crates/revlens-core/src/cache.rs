//! Two-tier cache for review-analysis results.
//!
//! **Memory** – [`MemoryCache`] over a `DashMap`, per-entry TTL.
//! **Durable** – optional [`DurableStore`] (SQLite), persists across restarts.
//!
//! On [`get`](TieredCache::get): check memory first; on miss, fall through to
//! the durable tier and promote a hit back into memory. On
//! [`set`](TieredCache::set): write memory, then best-effort durable. Durable
//! failures never reach the caller; they are logged and reported through
//! [`WriteOutcome`]. Only successful results are cached.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config_file::default_store_path;
use crate::governor::{Governor, GovernorError, TaskError};
use crate::keys::{self, CacheKey};
use crate::memory::{CacheStats, DEFAULT_TTL, MemoryCache};
use crate::store::{CleanupReport, DurableStore, StorageInfo, StoreLocation};
use crate::Review;

/// Whole-review-set analyses (summaries, sentiment, themes): 30 minutes.
pub const ANALYSIS_TTL: Duration = Duration::from_secs(30 * 60);

/// Single-review categorization: 1 hour.
pub const CATEGORY_TTL: Duration = Duration::from_secs(60 * 60);

/// Bulk review imports: 2 hours.
pub const IMPORT_TTL: Duration = Duration::from_secs(2 * 60 * 60);

/// Age past which durable entries are ignored on read: 24 hours.
pub const DEFAULT_DURABLE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    /// TTL for memory entries written without an explicit one, including
    /// promotions from the durable tier.
    pub default_ttl: Duration,
    pub durable_ttl: Duration,
    /// `None` runs memory-only.
    pub store: Option<StoreLocation>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: DEFAULT_TTL,
            durable_ttl: DEFAULT_DURABLE_TTL,
            store: default_store_path().map(StoreLocation::File),
        }
    }
}

impl CacheConfig {
    pub fn memory_only() -> Self {
        Self {
            store: None,
            ..Default::default()
        }
    }
}

/// Where a [`TieredCache::set`] landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Written to memory and the durable tier.
    Persisted,
    /// Written to memory; there is no durable tier.
    MemoryOnly,
    /// Written to memory; the durable write failed (logged).
    DurableFailed,
}

/// Inputs identifying a whole-review-set analysis.
#[derive(Debug, Clone, Copy)]
pub struct AnalysisRequest<'a> {
    /// Analysis flavour, e.g. `"summary"` or `"sentiment"`.
    pub kind: &'a str,
    pub app_id: Option<&'a str>,
    pub reviews: &'a [Review],
    /// Caller-supplied key that overrides the review fingerprint.
    pub precomputed_key: Option<&'a str>,
}

impl<'a> AnalysisRequest<'a> {
    pub fn new(kind: &'a str, reviews: &'a [Review]) -> Self {
        Self {
            kind,
            app_id: None,
            reviews,
            precomputed_key: None,
        }
    }

    pub fn for_app(mut self, app_id: &'a str) -> Self {
        self.app_id = Some(app_id);
        self
    }

    pub fn with_precomputed_key(mut self, key: &'a str) -> Self {
        self.precomputed_key = Some(key);
        self
    }

    pub fn key(&self) -> CacheKey {
        keys::review_set_analysis(self.kind, self.app_id, self.reviews, self.precomputed_key)
    }
}

/// What one janitor pass removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JanitorReport {
    pub memory_expired: usize,
    /// `None` when memory-only or when the durable cleanup failed.
    pub durable: Option<CleanupReport>,
}

/// Memory + durable cache facade.
pub struct TieredCache {
    memory: MemoryCache<Value>,
    durable: Option<DurableStore>,
    /// app id → memory keys written on its behalf, for [`clear_app`](Self::clear_app).
    owners: DashMap<String, HashSet<String>>,
    config: CacheConfig,
}

impl TieredCache {
    /// Memory-only cache; `config.store` is ignored.
    pub fn memory_only(config: CacheConfig) -> Self {
        Self {
            memory: MemoryCache::new(config.default_ttl),
            durable: None,
            owners: DashMap::new(),
            config,
        }
    }

    /// Open the cache, initializing the durable tier if one is configured.
    ///
    /// An unusable durable tier is logged and the cache runs memory-only for
    /// its whole lifetime. This never fails.
    pub async fn open(config: CacheConfig) -> Self {
        let durable = match &config.store {
            Some(location) => {
                let store = DurableStore::new(location.clone());
                match store.init().await {
                    Ok(()) => Some(store),
                    Err(e) => {
                        tracing::warn!(
                            error = %e,
                            location = ?location,
                            "durable cache unavailable, continuing memory-only"
                        );
                        None
                    }
                }
            }
            None => None,
        };
        Self {
            memory: MemoryCache::new(config.default_ttl),
            durable,
            owners: DashMap::new(),
            config,
        }
    }

    pub fn has_persistence(&self) -> bool {
        self.durable.is_some()
    }

    pub fn memory(&self) -> &MemoryCache<Value> {
        &self.memory
    }

    pub fn durable(&self) -> Option<&DurableStore> {
        self.durable.as_ref()
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn stats(&self) -> CacheStats {
        self.memory.stats()
    }

    pub async fn storage_info(&self) -> StorageInfo {
        match &self.durable {
            Some(store) => store.storage_info().await,
            None => StorageInfo::default(),
        }
    }

    // ── Generic access ─────────────────────────────────────────────────

    pub async fn get(&self, key: &CacheKey) -> Option<Value> {
        if let Some(value) = self.memory.get(key.as_str()) {
            tracing::trace!(key = %key, "cache memory hit");
            return Some(value);
        }

        let store = self.durable.as_ref()?;
        let record = match store.get_analysis(key.as_str()).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                tracing::trace!(key = %key, "cache miss");
                return None;
            }
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "durable cache read failed");
                return None;
            }
        };

        if !self.is_fresh(record.created_at) {
            tracing::trace!(key = %key, "durable entry past TTL, treating as miss");
            return None;
        }

        tracing::trace!(key = %key, "cache durable hit, promoting to memory");
        self.memory
            .set(key.as_str(), record.data.clone(), self.config.default_ttl);
        if let Some(owner) = record.app_id.as_deref() {
            self.register_owner(owner, key.as_str());
        }
        Some(record.data)
    }

    /// Store `value` under `key`. `owner` ties the entry to an app id so
    /// [`clear_app`](Self::clear_app) can evict it.
    ///
    /// The memory tier is written before the durable write starts, so the
    /// value is readable even if this future is dropped part way.
    pub async fn set(
        &self,
        key: &CacheKey,
        value: Value,
        ttl: Duration,
        owner: Option<&str>,
    ) -> WriteOutcome {
        let Some(store) = &self.durable else {
            self.set_memory(key.as_str(), value, ttl, owner);
            return WriteOutcome::MemoryOnly;
        };

        self.set_memory(key.as_str(), value.clone(), ttl, owner);
        match store.store_analysis(key.as_str(), &value, owner).await {
            Ok(()) => WriteOutcome::Persisted,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "durable cache write failed");
                WriteOutcome::DurableFailed
            }
        }
    }

    /// Typed [`get`](Self::get). A stored value that does not deserialize
    /// into `T` is a miss.
    pub async fn get_as<T: DeserializeOwned>(&self, key: &CacheKey) -> Option<T> {
        let value = self.get(key).await?;
        match serde_json::from_value(value) {
            Ok(typed) => Some(typed),
            Err(e) => {
                tracing::debug!(key = %key, error = %e, "cached value has unexpected shape");
                None
            }
        }
    }

    pub async fn set_as<T: Serialize + ?Sized>(
        &self,
        key: &CacheKey,
        value: &T,
        ttl: Duration,
        owner: Option<&str>,
    ) -> Result<WriteOutcome, serde_json::Error> {
        let value = serde_json::to_value(value)?;
        Ok(self.set(key, value, ttl, owner).await)
    }

    fn set_memory(&self, key: &str, value: Value, ttl: Duration, owner: Option<&str>) {
        self.memory.set(key, value, ttl);
        if let Some(owner) = owner {
            self.register_owner(owner, key);
        }
    }

    fn register_owner(&self, owner: &str, key: &str) {
        self.owners
            .entry(owner.to_string())
            .or_default()
            .insert(key.to_string());
    }

    fn is_fresh(&self, written_at: DateTime<Utc>) -> bool {
        match (Utc::now() - written_at).to_std() {
            Ok(age) => age < self.config.durable_ttl,
            // Written "in the future" (clock skew): fresh unless reads are off.
            Err(_) => !self.config.durable_ttl.is_zero(),
        }
    }

    // ── Domain helpers ─────────────────────────────────────────────────

    pub async fn get_review_analysis(&self, request: &AnalysisRequest<'_>) -> Option<Value> {
        self.get(&request.key()).await
    }

    pub async fn set_review_analysis(
        &self,
        request: &AnalysisRequest<'_>,
        analysis: Value,
    ) -> WriteOutcome {
        self.set(&request.key(), analysis, ANALYSIS_TTL, request.app_id)
            .await
    }

    pub async fn get_review_category(
        &self,
        review: &Review,
        precomputed_key: Option<&str>,
    ) -> Option<Value> {
        self.get(&keys::review_category(review, precomputed_key))
            .await
    }

    pub async fn set_review_category(
        &self,
        review: &Review,
        precomputed_key: Option<&str>,
        category: Value,
        app_id: Option<&str>,
    ) -> WriteOutcome {
        let key = keys::review_category(review, precomputed_key);
        self.set(&key, category, CATEGORY_TTL, app_id).await
    }

    /// Imported review set for `app_id` in `territory`, from memory or from
    /// the durable `reviews` collection.
    pub async fn get_imported_reviews(&self, app_id: &str, territory: &str) -> Option<Vec<Review>> {
        let key = keys::review_import(app_id, territory);
        if let Some(value) = self.memory.get(key.as_str()) {
            match serde_json::from_value(value) {
                Ok(reviews) => {
                    tracing::trace!(key = %key, "import cache memory hit");
                    return Some(reviews);
                }
                Err(e) => {
                    tracing::debug!(key = %key, error = %e, "cached import has unexpected shape");
                    self.memory.remove(key.as_str());
                }
            }
        }

        let store = self.durable.as_ref()?;
        let stored = match store.get_reviews(app_id, territory).await {
            Ok(Some(stored)) => stored,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(app_id, territory, error = %e, "durable review read failed");
                return None;
            }
        };
        if !self.is_fresh(stored.metadata.last_updated) {
            tracing::trace!(app_id, territory, "durable review set past TTL");
            return None;
        }

        if let Ok(value) = serde_json::to_value(&stored.reviews) {
            self.set_memory(key.as_str(), value, IMPORT_TTL, Some(app_id));
        }
        Some(stored.reviews)
    }

    pub async fn set_imported_reviews(
        &self,
        app_id: &str,
        territory: &str,
        reviews: &[Review],
    ) -> WriteOutcome {
        let key = keys::review_import(app_id, territory);
        match serde_json::to_value(reviews) {
            Ok(value) => self.set_memory(key.as_str(), value, IMPORT_TTL, Some(app_id)),
            Err(e) => tracing::warn!(key = %key, error = %e, "could not encode review set"),
        }

        let Some(store) = &self.durable else {
            return WriteOutcome::MemoryOnly;
        };
        match store.store_reviews(app_id, reviews, territory).await {
            Ok(_) => WriteOutcome::Persisted,
            Err(e) => {
                tracing::warn!(app_id, territory, error = %e, "durable review write failed");
                WriteOutcome::DurableFailed
            }
        }
    }

    // ── Eviction and maintenance ───────────────────────────────────────

    /// Evict everything owned by `app_id` from both tiers. Returns the
    /// number of memory entries removed.
    pub async fn clear_app(&self, app_id: &str) -> usize {
        let removed = match self.owners.remove(app_id) {
            Some((_, keys)) => keys
                .iter()
                .filter(|k| self.memory.remove(k).is_some())
                .count(),
            None => 0,
        };

        if let Some(store) = &self.durable
            && let Err(e) = store.clear_app_data(app_id).await
        {
            tracing::warn!(app_id, error = %e, "durable app eviction failed");
        }
        tracing::debug!(app_id, memory_removed = removed, "cleared app from cache");
        removed
    }

    /// Sweep expired memory entries and drop durable data older than
    /// `days_to_keep` days.
    pub async fn run_janitor(&self, days_to_keep: u32) -> JanitorReport {
        let memory_expired = self.memory.clear_expired();
        self.owners.retain(|_, keys| {
            keys.retain(|k| self.memory.has(k));
            !keys.is_empty()
        });

        let durable = match &self.durable {
            Some(store) => match store.cleanup_old_data(days_to_keep).await {
                Ok(report) => Some(report),
                Err(e) => {
                    tracing::warn!(error = %e, "durable cleanup failed");
                    None
                }
            },
            None => None,
        };

        tracing::info!(
            memory_expired,
            reviews_removed = durable.map(|r| r.reviews_removed).unwrap_or(0),
            analyses_removed = durable.map(|r| r.analyses_removed).unwrap_or(0),
            "cache janitor pass"
        );
        JanitorReport {
            memory_expired,
            durable,
        }
    }

    /// Run [`run_janitor`](Self::run_janitor) every `every` until `cancel`
    /// fires. The first pass runs immediately.
    pub fn spawn_janitor(
        self: &Arc<Self>,
        every: Duration,
        days_to_keep: u32,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        cache.run_janitor(days_to_keep).await;
                    }
                }
            }
            tracing::debug!("cache janitor stopped");
        })
    }

    pub async fn clear_all(&self) {
        self.memory.clear();
        self.owners.clear();
        if let Some(store) = &self.durable
            && let Err(e) = store.clear_all().await
        {
            tracing::warn!(error = %e, "durable clear failed");
        }
    }

    /// Return the cached value for `key`, or run `task` through `governor`
    /// and cache its result. Failures are returned as-is and never cached.
    pub async fn get_or_fetch<T, F, Fut>(
        &self,
        governor: &Governor,
        key: &CacheKey,
        ttl: Duration,
        owner: Option<&str>,
        task: F,
    ) -> Result<T, GovernorError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, TaskError>> + Send + 'static,
    {
        if let Some(cached) = self.get_as::<T>(key).await {
            return Ok(cached);
        }

        let value = governor.submit(task).await?;
        if let Err(e) = self.set_as(key, &value, ttl, owner).await {
            tracing::warn!(key = %key, error = %e, "could not encode fetched value");
        }
        Ok(value)
    }
}

impl std::fmt::Debug for TieredCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TieredCache")
            .field("memory_entries", &self.memory.len())
            .field("has_persistence", &self.has_persistence())
            .field("owners", &self.owners.len())
            .finish()
    }
}
