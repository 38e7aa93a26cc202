use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod cache;
pub mod config_file;
pub mod governor;
pub mod keys;
pub mod memory;
pub mod store;

// Re-export for convenience
pub use cache::{
    ANALYSIS_TTL, AnalysisRequest, CATEGORY_TTL, CacheConfig, DEFAULT_DURABLE_TTL, IMPORT_TTL,
    JanitorReport, TieredCache, WriteOutcome,
};
pub use self::governor::{
    BoxError, Governor, GovernorConfig, GovernorError, GovernorStatus, TaskError, ThrottleNotice,
};
pub use keys::CacheKey;
pub use memory::{CacheStats, DEFAULT_TTL, EntryStats, MemoryCache};
pub use store::{
    AnalysisRecord, CleanupReport, DurableStore, ReviewSetMetadata, StorageInfo, StoreCounts,
    StoreError, StoreLocation, StoredReviews,
};

/// A single app-store or social-media review, as archived in a review set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Review {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub content: String,
    /// Star rating, 1-5 where the source has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rating: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<DateTime<Utc>>,
    /// App version the review was written against.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Where the review came from (e.g. "app_store", "reddit").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl Review {
    pub fn new(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            author: None,
            title: None,
            content: content.into(),
            rating: None,
            date: None,
            version: None,
            source: None,
        }
    }

    pub fn with_date(mut self, date: DateTime<Utc>) -> Self {
        self.date = Some(date);
        self
    }

    pub fn with_rating(mut self, rating: u8) -> Self {
        self.rating = Some(rating);
        self
    }
}

/// Resolved runtime configuration for the governor and the cache.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub governor: GovernorConfig,
    pub cache: CacheConfig,
}

impl Config {
    /// Resolve a (possibly partial) on-disk config against the defaults.
    pub fn from_file(file: &config_file::ConfigFile) -> Self {
        let mut config = Config::default();

        if let Some(g) = &file.governor {
            let gc = &mut config.governor;
            if let Some(ms) = g.min_interval_ms {
                gc.min_interval = Duration::from_millis(ms);
            }
            if let Some(n) = g.max_retries {
                gc.max_retries = n.max(1);
            }
            if let Some(ms) = g.backoff_base_ms {
                gc.backoff_base = Duration::from_millis(ms);
            }
            if let Some(secs) = g.max_backoff_secs {
                gc.max_backoff = Duration::from_secs(secs);
            }
            if let Some(j) = g.jitter {
                gc.jitter = j.clamp(0.0, 1.0);
            }
            if let Some(secs) = g.task_timeout_secs {
                gc.task_timeout = (secs > 0).then(|| Duration::from_secs(secs));
            }
        }

        if let Some(c) = &file.cache {
            if let Some(secs) = c.default_ttl_secs {
                config.cache.default_ttl = Duration::from_secs(secs);
            }
            if let Some(secs) = c.durable_ttl_secs {
                config.cache.durable_ttl = Duration::from_secs(secs);
            }
        }

        if let Some(s) = &file.storage {
            if s.disabled == Some(true) {
                config.cache.store = None;
            } else if let Some(path) = &s.path {
                config.cache.store = Some(StoreLocation::File(path.into()));
            }
        }

        config
    }
}

#[cfg(test)]
mod config_tests {
    use super::*;
    use crate::config_file::{CacheSection, ConfigFile, GovernorSection, StorageSection};

    #[test]
    fn empty_file_yields_defaults() {
        let config = Config::from_file(&ConfigFile::default());
        assert_eq!(config.governor.min_interval, Duration::from_secs(1));
        assert_eq!(config.governor.max_retries, 3);
        assert_eq!(config.governor.task_timeout, None);
        assert_eq!(config.cache.default_ttl, DEFAULT_TTL);
        assert_eq!(config.cache.durable_ttl, DEFAULT_DURABLE_TTL);
    }

    #[test]
    fn file_values_override_defaults() {
        let file = ConfigFile {
            governor: Some(GovernorSection {
                min_interval_ms: Some(250),
                max_retries: Some(5),
                jitter: Some(3.0),
                task_timeout_secs: Some(30),
                ..Default::default()
            }),
            cache: Some(CacheSection {
                default_ttl_secs: Some(60),
                ..Default::default()
            }),
            storage: Some(StorageSection {
                path: Some("/tmp/revlens.db".into()),
                disabled: None,
            }),
        };
        let config = Config::from_file(&file);
        assert_eq!(config.governor.min_interval, Duration::from_millis(250));
        assert_eq!(config.governor.max_retries, 5);
        assert_eq!(config.governor.jitter, 1.0);
        assert_eq!(config.governor.task_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.cache.default_ttl, Duration::from_secs(60));
        assert_eq!(
            config.cache.store,
            Some(StoreLocation::File("/tmp/revlens.db".into()))
        );
    }

    #[test]
    fn zero_retries_clamped_to_one_attempt() {
        let file = ConfigFile {
            governor: Some(GovernorSection {
                max_retries: Some(0),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(Config::from_file(&file).governor.max_retries, 1);
    }

    #[test]
    fn storage_can_be_disabled() {
        let file = ConfigFile {
            storage: Some(StorageSection {
                path: Some("/tmp/ignored.db".into()),
                disabled: Some(true),
            }),
            ..Default::default()
        };
        assert!(Config::from_file(&file).cache.store.is_none());
    }
}
