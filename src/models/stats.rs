//! Per-repo and per-tag-set match statistics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::EngramId;

/// `(engram, repo) -> (count, last_matched)`. Monotone non-decreasing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoStat {
    /// The engram this row counts matches for.
    pub engram_id: EngramId,
    /// Repository identifier, as produced by the environment probe.
    pub repo: String,
    /// Number of times this engram matched while `repo` was active.
    pub count: u32,
    /// Timestamp of the most recent match.
    pub last_matched: DateTime<Utc>,
}

/// `(engram, sorted-tag-list) -> (count, last_matched)`. The tag list is
/// the exact multiset (deduplicated, sorted) of environment tags present
/// at match time, serialized as a comma-joined string for the table key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagSetStat {
    /// The engram this row counts matches for.
    pub engram_id: EngramId,
    /// Sorted, comma-joined tag set.
    pub tag_set: String,
    /// Number of times this engram matched under exactly this tag set.
    pub count: u32,
    /// Timestamp of the most recent match.
    pub last_matched: DateTime<Utc>,
}

/// Serializes a set of environment tags into the canonical `tag_set` key:
/// sorted, deduplicated, comma-joined.
#[must_use]
pub fn serialize_tag_set(tags: &[String]) -> String {
    let mut sorted: Vec<&str> = tags.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    sorted.dedup();
    sorted.join(",")
}

/// Inverse of [`serialize_tag_set`], used when reconstructing the tag
/// multiset `U` for minimal-common-subset computation.
#[must_use]
pub fn deserialize_tag_set(key: &str) -> Vec<String> {
    if key.is_empty() {
        Vec::new()
    } else {
        key.split(',').map(str::to_string).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_set_key_is_sorted_and_deduplicated() {
        let key = serialize_tag_set(&[
            "react".to_string(),
            "frontend".to_string(),
            "react".to_string(),
        ]);
        assert_eq!(key, "frontend,react");
        assert_eq!(deserialize_tag_set(&key), vec!["frontend", "react"]);
    }

    #[test]
    fn empty_tag_set_round_trips() {
        assert_eq!(serialize_tag_set(&[]), "");
        assert!(deserialize_tag_set("").is_empty());
    }
}
