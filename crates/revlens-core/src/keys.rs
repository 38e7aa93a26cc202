//! Cache key builders.
//!
//! Every key has the shape `<logical name>_<JSON-encoded arguments>`. The
//! logical name namespaces the key so two different operations can never
//! produce the same string, and `serde_json` gives a deterministic encoding
//! for the argument tuple (object keys are emitted in sorted order).
//!
//! Each call site gets its own builder so the fingerprint it relies on is
//! visible here rather than implied by whatever happens to be serialized.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::Review;

/// Logical name for a whole-review-set analysis (summary, sentiment, ...).
pub const REVIEW_ANALYSIS: &str = "review_analysis";
/// Logical name for a caller-supplied analysis key.
pub const REVIEW_ANALYSIS_PRECOMPUTED: &str = "review_analysis_precomputed";
/// Logical name for a single-review categorization.
pub const REVIEW_CATEGORY: &str = "review_category";
/// Logical name for a caller-supplied categorization key.
pub const REVIEW_CATEGORY_PRECOMPUTED: &str = "review_category_precomputed";
/// Logical name for a bulk review import.
pub const REVIEW_IMPORT: &str = "review_import";

/// Opaque cache key.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    /// Wrap an already-derived key string (e.g. one read back from storage).
    pub fn from_raw(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<CacheKey> for String {
    fn from(key: CacheKey) -> Self {
        key.0
    }
}

/// Build a key from a logical name and any serializable argument tuple.
///
/// Fails only if `args` cannot be represented as JSON (e.g. a map with
/// non-string keys).
pub fn build<A: Serialize + ?Sized>(name: &str, args: &A) -> Result<CacheKey, serde_json::Error> {
    let args = serde_json::to_value(args)?;
    Ok(from_value(name, &args))
}

fn from_value(name: &str, args: &Value) -> CacheKey {
    CacheKey(format!("{name}_{args}"))
}

/// Key for an analysis over a whole review set.
///
/// Fingerprint: `(kind, app id, review count, first review content)`. This
/// avoids encoding the entire set; two sets of equal length sharing their
/// first review collide, which callers accept in exchange for cheap keys.
/// A `precomputed` key takes precedence over the fingerprint.
pub fn review_set_analysis(
    kind: &str,
    app_id: Option<&str>,
    reviews: &[Review],
    precomputed: Option<&str>,
) -> CacheKey {
    if let Some(key) = precomputed {
        return from_value(REVIEW_ANALYSIS_PRECOMPUTED, &json!([kind, key]));
    }
    let first = reviews.first().map(|r| r.content.as_str());
    from_value(
        REVIEW_ANALYSIS,
        &json!([kind, app_id, reviews.len(), first]),
    )
}

/// Key for categorizing a single review: `(review id, content)`.
pub fn review_category(review: &Review, precomputed: Option<&str>) -> CacheKey {
    if let Some(key) = precomputed {
        return from_value(REVIEW_CATEGORY_PRECOMPUTED, &json!([key]));
    }
    from_value(REVIEW_CATEGORY, &json!([review.id, review.content]))
}

/// Key for a bulk review import of one app in one territory.
pub fn review_import(app_id: &str, territory: &str) -> CacheKey {
    from_value(REVIEW_IMPORT, &json!([app_id, territory]))
}
