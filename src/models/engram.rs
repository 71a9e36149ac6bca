//! The engram: a short, reusable lesson with provenance and prerequisites.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::Prerequisites;
use crate::{Error, Result};

/// Opaque stable identity for an engram.
///
/// Backed by the SQLite row id; never reused, even after a row is
/// deprecated or merged away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EngramId(i64);

impl EngramId {
    /// Wraps a raw row id.
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// Returns the raw row id.
    #[must_use]
    pub const fn as_i64(self) -> i64 {
        self.0
    }
}

impl fmt::Display for EngramId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for EngramId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// How an engram entered the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    /// Added directly by a user or tool.
    Manual,
    /// Produced by the extractor from a transcript.
    AutoExtracted,
    /// Produced from explicit feedback on a shown engram.
    Feedback,
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Manual => "manual",
            Self::AutoExtracted => "auto-extracted",
            Self::Feedback => "feedback",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for Source {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "manual" => Ok(Self::Manual),
            "auto-extracted" | "auto_extracted" => Ok(Self::AutoExtracted),
            "feedback" => Ok(Self::Feedback),
            other => Err(Error::InvalidInput(format!("unknown engram source: {other}"))),
        }
    }
}

/// One lesson, with the identity, content, provenance, policy flags,
/// prerequisites, and statistics described in the data model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Engram {
    /// Stable identity.
    pub id: EngramId,
    /// One to two sentences, actionable.
    pub text: String,
    /// Primary slash-delimited category path.
    pub category: String,
    /// First path segment of `category`, materialised for cheap filtering.
    pub category_level1: Option<String>,
    /// Second path segment of `category`.
    pub category_level2: Option<String>,
    /// Third path segment of `category`.
    pub category_level3: Option<String>,
    /// Additional category paths beyond the primary one.
    pub extra_categories: Vec<String>,
    /// How this engram was produced.
    pub source: Source,
    /// Ordered set of session identifiers that contributed to this engram.
    pub source_sessions: Vec<String>,
    /// Monotone non-decreasing occurrence count.
    pub occurrence_count: u32,
    /// Soft-delete flag; a deprecated engram never appears in retrieval.
    pub deprecated: bool,
    /// Whether this engram is always injected when its prerequisites match.
    pub pinned: bool,
    /// True once the dedup engine has considered this engram in an
    /// incremental pass and not merged it away.
    pub dedup_verified: bool,
    /// Structured environment gate.
    pub prerequisites: Prerequisites,
    /// Global match counter.
    pub times_matched: u64,
    /// Timestamp of the most recent match, across any environment.
    pub last_matched: Option<DateTime<Utc>>,
    /// Set when this row was absorbed by a dedup merge.
    pub merged_into: Option<EngramId>,
    /// Last dedup failure reason recorded against this engram, if any.
    pub dedup_error: Option<String>,
    /// Merge provenance recorded when this row was absorbed into a
    /// survivor: `run_id`, `confidence`, and `reason` (§4.B, §4.G step 7).
    pub merge_metadata: Option<String>,
    /// Row creation time.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
}

impl Engram {
    /// Whether this engram is eligible to ever be returned by retrieval.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        !self.deprecated
    }

    /// Whether `category` or any extra category starts with `prefix`.
    #[must_use]
    pub fn matches_category_prefix(&self, prefix: &str) -> bool {
        if prefix.is_empty() {
            return true;
        }
        self.category.starts_with(prefix)
            || self.extra_categories.iter().any(|c| c.starts_with(prefix))
    }
}

/// Normalizes a category path: strips leading/trailing separators and
/// collapses consecutive ones, per the data model's category parsing rule.
///
/// Idempotent: `normalize_category(&normalize_category(c)?)? == normalize_category(c)?`.
///
/// # Errors
///
/// Returns [`Error::InvalidInput`] if the result is empty after normalization.
pub fn normalize_category(raw: &str) -> Result<String> {
    let normalized = raw
        .split('/')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("/");

    if normalized.is_empty() {
        return Err(Error::InvalidInput("category is empty after normalization".to_string()));
    }

    Ok(normalized)
}

/// Splits a normalized category into its first three levels, for the
/// materialised `category_level{1,2,3}` columns.
#[must_use]
pub fn parse_category_levels(normalized: &str) -> (Option<String>, Option<String>, Option<String>) {
    let mut parts = normalized.split('/');
    (
        parts.next().map(str::to_string),
        parts.next().map(str::to_string),
        parts.next().map(str::to_string),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_and_collapses() {
        assert_eq!(normalize_category("/git//branch/naming/").unwrap(), "git/branch/naming");
        assert_eq!(normalize_category("git").unwrap(), "git");
    }

    #[test]
    fn normalize_rejects_empty() {
        assert!(normalize_category("///").is_err());
        assert!(normalize_category("").is_err());
    }

    #[test]
    fn normalize_is_idempotent() {
        let once = normalize_category("//a/b//c/").unwrap();
        let twice = normalize_category(&once).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn levels_split_up_to_three() {
        let (l1, l2, l3) = parse_category_levels("a/b/c/d");
        assert_eq!(l1.as_deref(), Some("a"));
        assert_eq!(l2.as_deref(), Some("b"));
        assert_eq!(l3.as_deref(), Some("c"));
    }

    #[test]
    fn source_round_trips_through_display_and_parse() {
        use std::str::FromStr;
        for s in [Source::Manual, Source::AutoExtracted, Source::Feedback] {
            assert_eq!(Source::from_str(&s.to_string()).unwrap(), s);
        }
    }
}
