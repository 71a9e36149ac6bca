//! The engram store capability (component B of the system overview).

use chrono::{DateTime, Utc};
use std::collections::HashMap;

use crate::Result;
use crate::models::{
    Engram, EngramId, Prerequisites, ProcessedSessionMarker, RepoStat, SessionAudit,
    SessionStatus, Source, TagRelevance, TagSetStat,
};

/// Durable table of engrams, categories, per-repo/per-tag-set counters,
/// the tag-relevance EMA table, the session-audit ledger, and the
/// processed-session markers. See §4.B for the public contract this trait
/// mirrors.
pub trait EngramStore: Send + Sync {
    /// Inserts a new engram. `category` must already be normalized by the
    /// caller (see [`crate::models::normalize_category`]).
    ///
    /// # Errors
    /// Returns an error on a storage failure.
    fn add(
        &self,
        text: &str,
        category: &str,
        extra_categories: &[String],
        source: Source,
        source_session: Option<&str>,
        prerequisites: Prerequisites,
        now: DateTime<Utc>,
    ) -> Result<EngramId>;

    /// Fetches a single engram by id, including deprecated ones.
    ///
    /// # Errors
    /// Returns an error on a storage failure.
    fn get(&self, id: EngramId) -> Result<Option<Engram>>;

    /// Fetches several engrams by id in one round trip, silently skipping
    /// ids that no longer exist (the inconsistent-store error class).
    ///
    /// # Errors
    /// Returns an error on a storage failure.
    fn get_many(&self, ids: &[EngramId]) -> Result<Vec<Engram>>;

    /// All non-deprecated engrams, for the retriever's candidate pool.
    ///
    /// # Errors
    /// Returns an error on a storage failure.
    fn list_active(&self) -> Result<Vec<Engram>>;

    /// All pinned, non-deprecated engrams.
    ///
    /// # Errors
    /// Returns an error on a storage failure.
    fn list_pinned(&self) -> Result<Vec<Engram>>;

    /// Soft-deletes an engram. Idempotent.
    ///
    /// # Errors
    /// Returns an error on a storage failure.
    fn deprecate(&self, id: EngramId, now: DateTime<Utc>) -> Result<()>;

    /// Updates text, category, and/or prerequisites. On a category change
    /// the category junction is re-synced (old primary removed, new one
    /// added).
    ///
    /// # Errors
    /// Returns an error on a storage failure or if `id` does not exist.
    fn update(
        &self,
        id: EngramId,
        text: Option<&str>,
        category: Option<&str>,
        prerequisites: Option<Prerequisites>,
        now: DateTime<Utc>,
    ) -> Result<()>;

    /// Increments the global counter and, in the same transaction, the
    /// per-repo (if `repo` is `Some`) and per-tag-set (if `tags` is
    /// non-empty) counters. May trigger an auto-pin decision; the caller
    /// (the auto-pin engine) re-reads the updated counters afterward.
    ///
    /// # Errors
    /// Returns an error on a storage failure.
    fn update_match_stats(
        &self,
        id: EngramId,
        repo: Option<&str>,
        tags: &[String],
        now: DateTime<Utc>,
    ) -> Result<()>;

    /// Folds `raw_scores` (tag -> raw score in `[-1, 1]`) into the EMA
    /// table with the given evaluation weight.
    ///
    /// # Errors
    /// Returns an error on a storage failure.
    fn update_tag_relevance(
        &self,
        id: EngramId,
        raw_scores: &HashMap<String, f32>,
        weight: f32,
        now: DateTime<Utc>,
    ) -> Result<()>;

    /// Records that `id` was shown in `session_id` by `hook_event`.
    /// Deduplicates repeated calls for the same `(session, id)` pair.
    ///
    /// # Errors
    /// Returns an error on a storage failure.
    fn record_shown(&self, session_id: &str, id: EngramId, hook_event: &str) -> Result<()>;

    /// Returns the engram ids shown so far in `session_id`.
    ///
    /// # Errors
    /// Returns an error on a storage failure.
    fn shown_in_session(&self, session_id: &str) -> Result<Vec<EngramId>>;

    /// Clears the shown-lesson log for `session_id`, after the audit row
    /// has been written.
    ///
    /// # Errors
    /// Returns an error on a storage failure.
    fn clear_shown(&self, session_id: &str) -> Result<()>;

    /// Writes the write-once session-audit row. Returns `false` without
    /// mutating anything if the key already existed.
    ///
    /// # Errors
    /// Returns an error on a storage failure.
    fn write_session_audit(&self, audit: &SessionAudit) -> Result<bool>;

    /// Atomically merges `absorbed` into `survivor`: survivor's text is
    /// replaced with `canonical_text`, occurrence counts and source
    /// sessions are unioned, absorbed rows are deprecated with
    /// `merged_into` set and dedup metadata recorded.
    ///
    /// # Errors
    /// Returns an error on a storage failure or if any id does not exist.
    #[allow(clippy::too_many_arguments)]
    fn merge_group(
        &self,
        survivor: EngramId,
        absorbed: &[EngramId],
        canonical_text: &str,
        run_id: &str,
        confidence: f32,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<()>;

    /// Pins an engram, replacing its prerequisites with `prerequisites`
    /// and setting `auto_pinned` accordingly.
    ///
    /// # Errors
    /// Returns an error on a storage failure.
    fn pin(&self, id: EngramId, prerequisites: Prerequisites, now: DateTime<Utc>) -> Result<()>;

    /// Clears the pinned flag. Callers must have already verified the
    /// manual-pin protection invariant.
    ///
    /// # Errors
    /// Returns an error on a storage failure.
    fn unpin(&self, id: EngramId, now: DateTime<Utc>) -> Result<()>;

    /// Returns the per-repo counter row for `(id, repo)`, if any.
    ///
    /// # Errors
    /// Returns an error on a storage failure.
    fn repo_stat(&self, id: EngramId, repo: &str) -> Result<Option<RepoStat>>;

    /// Returns all per-tag-set counter rows for `id`.
    ///
    /// # Errors
    /// Returns an error on a storage failure.
    fn tag_set_stats(&self, id: EngramId) -> Result<Vec<TagSetStat>>;

    /// Returns all tag-relevance rows for `id`.
    ///
    /// # Errors
    /// Returns an error on a storage failure.
    fn tag_relevance_rows(&self, id: EngramId) -> Result<Vec<TagRelevance>>;

    /// Returns tag-relevance rows for `id` restricted to `tags`.
    ///
    /// # Errors
    /// Returns an error on a storage failure.
    fn tag_relevance_for_tags(&self, id: EngramId, tags: &[String]) -> Result<Vec<TagRelevance>>;

    /// Returns session-audit rows eligible for evaluator processing:
    /// those with no `completed` marker and `retry_count < 3`, in
    /// creation order.
    ///
    /// # Errors
    /// Returns an error on a storage failure.
    fn unprocessed_session_audits(&self) -> Result<Vec<(SessionAudit, ProcessedSessionMarker)>>;

    /// Upserts the processed-session marker for `session_id`, incrementing
    /// `retry_count` on a `Failed` status.
    ///
    /// # Errors
    /// Returns an error on a storage failure.
    fn mark_session_processed(
        &self,
        session_id: &str,
        status: SessionStatus,
        now: DateTime<Utc>,
    ) -> Result<()>;

    /// Unverified engrams (dedup state), optionally limited, ascending by
    /// id for deterministic batch construction.
    ///
    /// # Errors
    /// Returns an error on a storage failure.
    fn list_unverified(&self, limit: Option<usize>) -> Result<Vec<Engram>>;

    /// Verified, non-deprecated engrams (the dedup candidate pool).
    ///
    /// # Errors
    /// Returns an error on a storage failure.
    fn list_verified(&self) -> Result<Vec<Engram>>;

    /// Marks an engram verified without merging it.
    ///
    /// # Errors
    /// Returns an error on a storage failure.
    fn mark_verified(&self, id: EngramId) -> Result<()>;

    /// Records a dedup failure reason against `id` (error-handling §7,
    /// invariant-violation class).
    ///
    /// # Errors
    /// Returns an error on a storage failure.
    fn record_dedup_error(&self, id: EngramId, reason: &str) -> Result<()>;

    /// Whether the extractor has already considered `session_id`
    /// (distinct from the evaluator's session-audit ledger: a session
    /// can be extracted from without ever being shown an engram).
    ///
    /// # Errors
    /// Returns an error on a storage failure.
    fn is_extraction_processed(&self, session_id: &str) -> Result<bool>;

    /// Marks `session_id` as considered by the extractor, recording
    /// whether it carried friction and how many lessons it produced.
    ///
    /// # Errors
    /// Returns an error on a storage failure.
    fn mark_extraction_processed(
        &self,
        session_id: &str,
        had_friction: bool,
        lessons_extracted: u32,
        now: DateTime<Utc>,
    ) -> Result<()>;

    /// Returns the session-audit row for `session_id`, if one was ever
    /// written, regardless of its processed status. Used by the extractor
    /// to enrich a newly-inferred engram's prerequisites with the
    /// environment tags already recorded for one of its source sessions.
    ///
    /// # Errors
    /// Returns an error on a storage failure.
    fn session_audit(&self, session_id: &str) -> Result<Option<SessionAudit>>;

    /// Folds `new_sessions` into `id`'s source-session list (skipping any
    /// already present) and resets `occurrence_count` to the resulting
    /// list's length, matching the extractor's lexical-dedup merge path:
    /// a merge tracks how many distinct sessions produced the lesson, not
    /// how many merges have happened.
    ///
    /// # Errors
    /// Returns an error on a storage failure or if `id` does not exist.
    fn fold_duplicate_sessions(
        &self,
        id: EngramId,
        new_sessions: &[String],
        now: DateTime<Utc>,
    ) -> Result<()>;

    /// Session-audit rows recorded with an empty `env_tags` list, for the
    /// `backfill-tags` maintenance command. Does not violate the
    /// session-audit write-once invariant: the row identity and
    /// shown-engram set are untouched, only `env_tags` is ever
    /// rewritten, and only by [`Self::backfill_session_tags`].
    ///
    /// # Errors
    /// Returns an error on a storage failure.
    fn session_audits_missing_tags(&self) -> Result<Vec<SessionAudit>>;

    /// Overwrites `env_tags` for an existing session-audit row whose
    /// `repo` matches `repo` (re-probing a historical session's tags
    /// requires the operator to be standing in that repository now;
    /// the repo check guards against applying the wrong environment's
    /// tags to an unrelated session).
    ///
    /// # Errors
    /// Returns an error on a storage failure.
    fn backfill_session_tags(&self, session_id: &str, repo: Option<&str>, tags: &[String]) -> Result<bool>;
}
