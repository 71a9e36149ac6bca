//! `SQLite`-backed [`EngramStore`].

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::collections::HashMap;
use std::sync::Mutex;

use crate::models::{
    Engram, EngramId, Prerequisites, ProcessedSessionMarker, RepoStat, SessionAudit,
    SessionStatus, Source, TagRelevance, TagSetStat, normalize_category, parse_category_levels,
    stats::{deserialize_tag_set, serialize_tag_set},
};
use crate::storage::sqlite::connection::acquire_lock;
use crate::storage::traits::EngramStore;
use crate::{Error, Result};

fn op_err(operation: &str, e: impl std::fmt::Display) -> Error {
    Error::OperationFailed { operation: operation.to_string(), cause: e.to_string() }
}

fn ensure_category(conn: &Connection, category: &str) -> rusqlite::Result<()> {
    let parts: Vec<&str> = category.split('/').collect();
    for i in 0..parts.len() {
        let path = parts[..=i].join("/");
        conn.execute("INSERT OR IGNORE INTO categories (path) VALUES (?1)", params![path])?;
    }
    Ok(())
}

fn row_to_engram(row: &Row<'_>) -> rusqlite::Result<Engram> {
    let id: i64 = row.get("id")?;
    let source_sessions_json: String = row.get("source_sessions")?;
    let prerequisites_json: Option<String> = row.get("prerequisites")?;
    let last_matched: Option<String> = row.get("last_matched")?;
    let merged_into: Option<i64> = row.get("merged_into")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;
    let source: String = row.get("source")?;

    let prerequisites = prerequisites_json
        .as_deref()
        .map(|s| serde_json::from_str::<serde_json::Value>(s).ok())
        .and_then(|v| v)
        .map_or_else(Prerequisites::default, |v| Prerequisites::from_json_lenient(Some(&v)));

    Ok(Engram {
        id: EngramId::new(id),
        text: row.get("text")?,
        category: row.get("category")?,
        category_level1: row.get("category_level1")?,
        category_level2: row.get("category_level2")?,
        category_level3: row.get("category_level3")?,
        extra_categories: Vec::new(),
        source: source.parse().unwrap_or(Source::Manual),
        source_sessions: serde_json::from_str(&source_sessions_json).unwrap_or_default(),
        occurrence_count: row.get::<_, i64>("occurrence_count")? as u32,
        deprecated: row.get::<_, i64>("deprecated")? != 0,
        pinned: row.get::<_, i64>("pinned")? != 0,
        dedup_verified: row.get::<_, i64>("dedup_verified")? != 0,
        prerequisites,
        times_matched: row.get::<_, i64>("times_matched")? as u64,
        last_matched: last_matched.and_then(|s| parse_timestamp(&s)),
        merged_into: merged_into.map(EngramId::new),
        dedup_error: row.get("dedup_error")?,
        merge_metadata: row.get("merge_metadata")?,
        created_at: parse_timestamp(&created_at).unwrap_or_else(Utc::now),
        updated_at: parse_timestamp(&updated_at).unwrap_or_else(Utc::now),
    })
}

fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.with_timezone(&Utc))
}

fn load_extra_categories(conn: &Connection, id: EngramId, primary: &str) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn
        .prepare("SELECT category_path FROM engram_categories WHERE engram_id = ?1 AND category_path != ?2")?;
    let rows = stmt.query_map(params![id.as_i64(), primary], |r| r.get::<_, String>(0))?;
    rows.collect()
}

/// `SQLite`-backed implementation of [`EngramStore`], serializing access
/// through a single connection behind a mutex (§5 concurrency model).
pub struct SqliteEngramStore {
    conn: Mutex<Connection>,
}

impl SqliteEngramStore {
    /// Wraps an already-migrated connection.
    #[must_use]
    pub const fn new(conn: Mutex<Connection>) -> Self {
        Self { conn }
    }

    fn fetch_one(conn: &Connection, id: EngramId) -> rusqlite::Result<Option<Engram>> {
        let mut stmt = conn.prepare("SELECT * FROM engrams WHERE id = ?1")?;
        let engram = stmt.query_row(params![id.as_i64()], row_to_engram).optional()?;
        match engram {
            Some(mut e) => {
                e.extra_categories = load_extra_categories(conn, id, &e.category)?;
                Ok(Some(e))
            }
            None => Ok(None),
        }
    }

    fn check_auto_pin_on_repo(
        conn: &Connection,
        id: EngramId,
        repo: &str,
        now: DateTime<Utc>,
    ) -> rusqlite::Result<()> {
        const T_REPO: i64 = 15;
        let count: i64 = conn.query_row(
            "SELECT count FROM engram_repo_stats WHERE engram_id = ?1 AND repo = ?2",
            params![id.as_i64(), repo],
            |r| r.get(0),
        )?;
        if count < T_REPO {
            return Ok(());
        }
        let pinned: i64 =
            conn.query_row("SELECT pinned FROM engrams WHERE id = ?1", params![id.as_i64()], |r| r.get(0))?;
        if pinned != 0 {
            return Ok(());
        }
        let existing: Option<String> =
            conn.query_row("SELECT prerequisites FROM engrams WHERE id = ?1", params![id.as_i64()], |r| r.get(0))?;
        let mut prereqs = Prerequisites::from_json_lenient(
            existing.as_deref().and_then(|s| serde_json::from_str(s).ok()).as_ref(),
        );
        let mut repos = prereqs.repos.take().unwrap_or_default();
        if !repos.iter().any(|r| r == repo) {
            repos.push(repo.to_string());
        }
        prereqs.repos = Some(repos);
        prereqs.auto_pinned = true;
        let prereqs_json = serde_json::to_string(&prereqs).unwrap_or_default();
        conn.execute(
            "UPDATE engrams SET pinned = 1, prerequisites = ?1, updated_at = ?2 WHERE id = ?3",
            params![prereqs_json, now.to_rfc3339(), id.as_i64()],
        )?;
        Ok(())
    }

    fn check_auto_pin_on_tag_subset(
        conn: &Connection,
        id: EngramId,
        now: DateTime<Utc>,
    ) -> rusqlite::Result<()> {
        const T_TAG: u32 = 15;
        let mut stmt =
            conn.prepare("SELECT tag_set, count FROM engram_tag_set_stats WHERE engram_id = ?1")?;
        let tag_sets: Vec<(Vec<String>, u32)> = stmt
            .query_map(params![id.as_i64()], |r| {
                Ok((deserialize_tag_set(&r.get::<_, String>(0)?), r.get::<_, i64>(1)? as u32))
            })?
            .collect::<rusqlite::Result<_>>()?;

        let Some(subset) = crate::services::auto_pin::minimal_common_tag_subset(&tag_sets, T_TAG)
        else {
            return Ok(());
        };

        let pinned: i64 =
            conn.query_row("SELECT pinned FROM engrams WHERE id = ?1", params![id.as_i64()], |r| r.get(0))?;
        if pinned != 0 {
            return Ok(());
        }
        let existing: Option<String> =
            conn.query_row("SELECT prerequisites FROM engrams WHERE id = ?1", params![id.as_i64()], |r| r.get(0))?;
        let mut prereqs = Prerequisites::from_json_lenient(
            existing.as_deref().and_then(|s| serde_json::from_str(s).ok()).as_ref(),
        );
        prereqs.tags = Some(subset);
        prereqs.auto_pinned = true;
        let prereqs_json = serde_json::to_string(&prereqs).unwrap_or_default();
        conn.execute(
            "UPDATE engrams SET pinned = 1, prerequisites = ?1, updated_at = ?2 WHERE id = ?3",
            params![prereqs_json, now.to_rfc3339(), id.as_i64()],
        )?;
        Ok(())
    }
}

impl EngramStore for SqliteEngramStore {
    fn add(
        &self,
        text: &str,
        category: &str,
        extra_categories: &[String],
        source: Source,
        source_session: Option<&str>,
        prerequisites: Prerequisites,
        now: DateTime<Utc>,
    ) -> Result<EngramId> {
        if text.trim().is_empty() {
            return Err(Error::InvalidInput("engram text must not be empty".to_string()));
        }
        let category = normalize_category(category)?;
        let (l1, l2, l3) = parse_category_levels(&category);
        let sessions = source_session.map(|s| vec![s.to_string()]).unwrap_or_default();
        let sessions_json = serde_json::to_string(&sessions).unwrap_or_default();
        let prereq_json = if prerequisites.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&prerequisites).unwrap_or_default())
        };

        let guard = acquire_lock(&self.conn);
        ensure_category(&guard, &category).map_err(|e| op_err("add", e))?;
        guard
            .execute(
                "INSERT INTO engrams (text, category, category_level1, category_level2,
                    category_level3, source, source_sessions, occurrence_count,
                    prerequisites, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, ?8, ?9, ?9)",
                params![text, category, l1, l2, l3, source.to_string(), sessions_json, prereq_json, now.to_rfc3339()],
            )
            .map_err(|e| op_err("add", e))?;
        let id = EngramId::new(guard.last_insert_rowid());

        guard
            .execute(
                "INSERT OR IGNORE INTO engram_categories (engram_id, category_path) VALUES (?1, ?2)",
                params![id.as_i64(), category],
            )
            .map_err(|e| op_err("add", e))?;

        for extra in extra_categories {
            let normalized = normalize_category(extra)?;
            ensure_category(&guard, &normalized).map_err(|e| op_err("add", e))?;
            guard
                .execute(
                    "INSERT OR IGNORE INTO engram_categories (engram_id, category_path) VALUES (?1, ?2)",
                    params![id.as_i64(), normalized],
                )
                .map_err(|e| op_err("add", e))?;
        }

        Ok(id)
    }

    fn get(&self, id: EngramId) -> Result<Option<Engram>> {
        let guard = acquire_lock(&self.conn);
        Self::fetch_one(&guard, id).map_err(|e| op_err("get", e))
    }

    fn get_many(&self, ids: &[EngramId]) -> Result<Vec<Engram>> {
        let guard = acquire_lock(&self.conn);
        let mut out = Vec::with_capacity(ids.len());
        for &id in ids {
            if let Some(e) = Self::fetch_one(&guard, id).map_err(|e| op_err("get_many", e))? {
                out.push(e);
            }
        }
        Ok(out)
    }

    fn list_active(&self) -> Result<Vec<Engram>> {
        let guard = acquire_lock(&self.conn);
        let mut stmt = guard
            .prepare("SELECT * FROM engrams WHERE deprecated = 0 ORDER BY id")
            .map_err(|e| op_err("list_active", e))?;
        let rows: Vec<Engram> = stmt
            .query_map([], row_to_engram)
            .and_then(Iterator::collect)
            .map_err(|e| op_err("list_active", e))?;
        rows.into_iter()
            .map(|mut e| {
                e.extra_categories = load_extra_categories(&guard, e.id, &e.category)
                    .map_err(|e| op_err("list_active", e))?;
                Ok(e)
            })
            .collect()
    }

    fn list_pinned(&self) -> Result<Vec<Engram>> {
        let guard = acquire_lock(&self.conn);
        let mut stmt = guard
            .prepare("SELECT * FROM engrams WHERE deprecated = 0 AND pinned = 1 ORDER BY id")
            .map_err(|e| op_err("list_pinned", e))?;
        let rows: Vec<Engram> = stmt
            .query_map([], row_to_engram)
            .and_then(Iterator::collect)
            .map_err(|e| op_err("list_pinned", e))?;
        Ok(rows)
    }

    fn deprecate(&self, id: EngramId, now: DateTime<Utc>) -> Result<()> {
        let guard = acquire_lock(&self.conn);
        guard
            .execute(
                "UPDATE engrams SET deprecated = 1, updated_at = ?1 WHERE id = ?2",
                params![now.to_rfc3339(), id.as_i64()],
            )
            .map_err(|e| op_err("deprecate", e))?;
        Ok(())
    }

    fn update(
        &self,
        id: EngramId,
        text: Option<&str>,
        category: Option<&str>,
        prerequisites: Option<Prerequisites>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let guard = acquire_lock(&self.conn);
        let existing = Self::fetch_one(&guard, id).map_err(|e| op_err("update", e))?;
        let Some(existing) = existing else {
            return Err(Error::InvalidInput(format!("engram {id} does not exist")));
        };

        if let Some(text) = text {
            guard
                .execute(
                    "UPDATE engrams SET text = ?1, updated_at = ?2 WHERE id = ?3",
                    params![text, now.to_rfc3339(), id.as_i64()],
                )
                .map_err(|e| op_err("update", e))?;
        }

        if let Some(category) = category {
            let normalized = normalize_category(category)?;
            let (l1, l2, l3) = parse_category_levels(&normalized);
            ensure_category(&guard, &normalized).map_err(|e| op_err("update", e))?;
            guard
                .execute(
                    "UPDATE engrams SET category = ?1, category_level1 = ?2, category_level2 = ?3,
                        category_level3 = ?4, updated_at = ?5 WHERE id = ?6",
                    params![normalized, l1, l2, l3, now.to_rfc3339(), id.as_i64()],
                )
                .map_err(|e| op_err("update", e))?;
            guard
                .execute(
                    "DELETE FROM engram_categories WHERE engram_id = ?1 AND category_path = ?2",
                    params![id.as_i64(), existing.category],
                )
                .map_err(|e| op_err("update", e))?;
            guard
                .execute(
                    "INSERT OR IGNORE INTO engram_categories (engram_id, category_path) VALUES (?1, ?2)",
                    params![id.as_i64(), normalized],
                )
                .map_err(|e| op_err("update", e))?;
        }

        if let Some(prerequisites) = prerequisites {
            let json = serde_json::to_string(&prerequisites).unwrap_or_default();
            guard
                .execute(
                    "UPDATE engrams SET prerequisites = ?1, updated_at = ?2 WHERE id = ?3",
                    params![json, now.to_rfc3339(), id.as_i64()],
                )
                .map_err(|e| op_err("update", e))?;
        }

        Ok(())
    }

    fn update_match_stats(
        &self,
        id: EngramId,
        repo: Option<&str>,
        tags: &[String],
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut guard = acquire_lock(&self.conn);
        let tx = guard.transaction().map_err(|e| op_err("update_match_stats", e))?;

        tx.execute(
            "UPDATE engrams SET times_matched = times_matched + 1, last_matched = ?1,
                updated_at = ?1 WHERE id = ?2",
            params![now.to_rfc3339(), id.as_i64()],
        )
        .map_err(|e| op_err("update_match_stats", e))?;

        if let Some(repo) = repo {
            tx.execute(
                "INSERT INTO engram_repo_stats (engram_id, repo, count, last_matched)
                 VALUES (?1, ?2, 1, ?3)
                 ON CONFLICT(engram_id, repo) DO UPDATE SET count = count + 1, last_matched = ?3",
                params![id.as_i64(), repo, now.to_rfc3339()],
            )
            .map_err(|e| op_err("update_match_stats", e))?;
            Self::check_auto_pin_on_repo(&tx, id, repo, now).map_err(|e| op_err("update_match_stats", e))?;
        }

        if !tags.is_empty() {
            let tag_set = serialize_tag_set(tags);
            tx.execute(
                "INSERT INTO engram_tag_set_stats (engram_id, tag_set, count, last_matched)
                 VALUES (?1, ?2, 1, ?3)
                 ON CONFLICT(engram_id, tag_set) DO UPDATE SET count = count + 1, last_matched = ?3",
                params![id.as_i64(), tag_set, now.to_rfc3339()],
            )
            .map_err(|e| op_err("update_match_stats", e))?;
            Self::check_auto_pin_on_tag_subset(&tx, id, now)
                .map_err(|e| op_err("update_match_stats", e))?;
        }

        tx.commit().map_err(|e| op_err("update_match_stats", e))
    }

    fn update_tag_relevance(
        &self,
        id: EngramId,
        raw_scores: &HashMap<String, f32>,
        weight: f32,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut guard = acquire_lock(&self.conn);
        let tx = guard.transaction().map_err(|e| op_err("update_tag_relevance", e))?;

        for (tag, raw) in raw_scores {
            let existing = tx
                .query_row(
                    "SELECT ema, positive_evals, negative_evals FROM engram_tag_relevance
                     WHERE engram_id = ?1 AND tag = ?2",
                    params![id.as_i64(), tag],
                    |r| Ok((r.get::<_, f64>(0)? as f32, r.get::<_, i64>(1)? as u32, r.get::<_, i64>(2)? as u32)),
                )
                .optional()
                .map_err(|e| op_err("update_tag_relevance", e))?;

            let mut relevance = existing.map_or_else(
                || TagRelevance::new(id, tag.clone(), now),
                |(ema, positive_evals, negative_evals)| TagRelevance {
                    engram_id: id,
                    tag: tag.clone(),
                    ema,
                    positive_evals,
                    negative_evals,
                    last_updated: now,
                },
            );
            relevance.fold(*raw, weight, now);

            tx.execute(
                "INSERT INTO engram_tag_relevance (engram_id, tag, ema, positive_evals, negative_evals, last_updated)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(engram_id, tag) DO UPDATE SET
                    ema = ?3, positive_evals = ?4, negative_evals = ?5, last_updated = ?6",
                params![
                    id.as_i64(),
                    tag,
                    f64::from(relevance.ema),
                    relevance.positive_evals,
                    relevance.negative_evals,
                    now.to_rfc3339(),
                ],
            )
            .map_err(|e| op_err("update_tag_relevance", e))?;
        }

        crate::services::auto_pin::apply_ema_pin_decision(&tx, id, now)
            .map_err(|e| op_err("update_tag_relevance", e))?;

        tx.commit().map_err(|e| op_err("update_tag_relevance", e))
    }

    fn record_shown(&self, session_id: &str, id: EngramId, hook_event: &str) -> Result<()> {
        let guard = acquire_lock(&self.conn);
        guard
            .execute(
                "INSERT OR IGNORE INTO shown_lessons (session_id, engram_id, source_hook_event)
                 VALUES (?1, ?2, ?3)",
                params![session_id, id.as_i64(), hook_event],
            )
            .map_err(|e| op_err("record_shown", e))?;
        Ok(())
    }

    fn shown_in_session(&self, session_id: &str) -> Result<Vec<EngramId>> {
        let guard = acquire_lock(&self.conn);
        let mut stmt = guard
            .prepare("SELECT engram_id FROM shown_lessons WHERE session_id = ?1")
            .map_err(|e| op_err("shown_in_session", e))?;
        let rows: Vec<i64> = stmt
            .query_map(params![session_id], |r| r.get(0))
            .and_then(Iterator::collect)
            .map_err(|e| op_err("shown_in_session", e))?;
        Ok(rows.into_iter().map(EngramId::new).collect())
    }

    fn clear_shown(&self, session_id: &str) -> Result<()> {
        let guard = acquire_lock(&self.conn);
        guard
            .execute("DELETE FROM shown_lessons WHERE session_id = ?1", params![session_id])
            .map_err(|e| op_err("clear_shown", e))?;
        Ok(())
    }

    fn write_session_audit(&self, audit: &SessionAudit) -> Result<bool> {
        let guard = acquire_lock(&self.conn);
        let ids_json = serde_json::to_string(&audit.shown_engram_ids).unwrap_or_default();
        let tags_json = serde_json::to_string(&audit.env_tags).unwrap_or_default();
        let changed = guard
            .execute(
                "INSERT OR IGNORE INTO session_audit
                    (session_id, shown_engram_ids, env_tags, repo, transcript_path, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    audit.session_id,
                    ids_json,
                    tags_json,
                    audit.repo,
                    audit.transcript_path,
                    audit.created_at.to_rfc3339(),
                ],
            )
            .map_err(|e| op_err("write_session_audit", e))?;
        Ok(changed > 0)
    }

    fn merge_group(
        &self,
        survivor: EngramId,
        absorbed: &[EngramId],
        canonical_text: &str,
        run_id: &str,
        confidence: f32,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if absorbed.contains(&survivor) {
            return Err(Error::InvalidInput("survivor cannot be among absorbed ids".to_string()));
        }

        let mut guard = acquire_lock(&self.conn);
        let tx = guard.transaction().map_err(|e| op_err("merge_group", e))?;

        let survivor_row = tx
            .query_row("SELECT * FROM engrams WHERE id = ?1", params![survivor.as_i64()], row_to_engram)
            .map_err(|e| op_err("merge_group", e))?;

        let mut sessions = survivor_row.source_sessions;
        let mut occurrence = survivor_row.occurrence_count;

        for &absorbed_id in absorbed {
            let absorbed_row = tx
                .query_row("SELECT * FROM engrams WHERE id = ?1", params![absorbed_id.as_i64()], row_to_engram)
                .map_err(|e| op_err("merge_group", e))?;

            for session in absorbed_row.source_sessions {
                if !sessions.contains(&session) {
                    sessions.push(session);
                }
            }
            occurrence += absorbed_row.occurrence_count;

            let merge_metadata =
                format!("run_id={run_id} confidence={confidence:.2} reason={reason}");
            tx.execute(
                "UPDATE engrams SET deprecated = 1, merged_into = ?1, dedup_error = NULL,
                    merge_metadata = ?2, dedup_verified = 1, updated_at = ?3 WHERE id = ?4",
                params![survivor.as_i64(), merge_metadata, now.to_rfc3339(), absorbed_id.as_i64()],
            )
            .map_err(|e| op_err("merge_group", e))?;
        }

        let sessions_json = serde_json::to_string(&sessions).unwrap_or_default();
        tx.execute(
            "UPDATE engrams SET text = ?1, source_sessions = ?2, occurrence_count = ?3,
                dedup_verified = 1, updated_at = ?4 WHERE id = ?5",
            params![canonical_text, sessions_json, occurrence, now.to_rfc3339(), survivor.as_i64()],
        )
        .map_err(|e| op_err("merge_group", e))?;

        tx.commit().map_err(|e| op_err("merge_group", e))
    }

    fn pin(&self, id: EngramId, prerequisites: Prerequisites, now: DateTime<Utc>) -> Result<()> {
        let json = serde_json::to_string(&prerequisites).unwrap_or_default();
        let guard = acquire_lock(&self.conn);
        guard
            .execute(
                "UPDATE engrams SET pinned = 1, prerequisites = ?1, updated_at = ?2 WHERE id = ?3",
                params![json, now.to_rfc3339(), id.as_i64()],
            )
            .map_err(|e| op_err("pin", e))?;
        Ok(())
    }

    fn unpin(&self, id: EngramId, now: DateTime<Utc>) -> Result<()> {
        let guard = acquire_lock(&self.conn);
        guard
            .execute(
                "UPDATE engrams SET pinned = 0, updated_at = ?1 WHERE id = ?2",
                params![now.to_rfc3339(), id.as_i64()],
            )
            .map_err(|e| op_err("unpin", e))?;
        Ok(())
    }

    fn repo_stat(&self, id: EngramId, repo: &str) -> Result<Option<RepoStat>> {
        let guard = acquire_lock(&self.conn);
        guard
            .query_row(
                "SELECT count, last_matched FROM engram_repo_stats WHERE engram_id = ?1 AND repo = ?2",
                params![id.as_i64(), repo],
                |r| {
                    let last_matched: String = r.get(1)?;
                    Ok(RepoStat {
                        engram_id: id,
                        repo: repo.to_string(),
                        count: r.get::<_, i64>(0)? as u32,
                        last_matched: parse_timestamp(&last_matched).unwrap_or_else(Utc::now),
                    })
                },
            )
            .optional()
            .map_err(|e| op_err("repo_stat", e))
    }

    fn tag_set_stats(&self, id: EngramId) -> Result<Vec<TagSetStat>> {
        let guard = acquire_lock(&self.conn);
        let mut stmt = guard
            .prepare("SELECT tag_set, count, last_matched FROM engram_tag_set_stats WHERE engram_id = ?1")
            .map_err(|e| op_err("tag_set_stats", e))?;
        let rows = stmt
            .query_map(params![id.as_i64()], |r| {
                let last_matched: String = r.get(2)?;
                Ok(TagSetStat {
                    engram_id: id,
                    tag_set: r.get(0)?,
                    count: r.get::<_, i64>(1)? as u32,
                    last_matched: parse_timestamp(&last_matched).unwrap_or_else(Utc::now),
                })
            })
            .and_then(Iterator::collect)
            .map_err(|e| op_err("tag_set_stats", e))?;
        Ok(rows)
    }

    fn tag_relevance_rows(&self, id: EngramId) -> Result<Vec<TagRelevance>> {
        let guard = acquire_lock(&self.conn);
        let mut stmt = guard
            .prepare(
                "SELECT tag, ema, positive_evals, negative_evals, last_updated
                 FROM engram_tag_relevance WHERE engram_id = ?1",
            )
            .map_err(|e| op_err("tag_relevance_rows", e))?;
        let rows = stmt
            .query_map(params![id.as_i64()], |r| {
                let last_updated: String = r.get(4)?;
                Ok(TagRelevance {
                    engram_id: id,
                    tag: r.get(0)?,
                    ema: r.get::<_, f64>(1)? as f32,
                    positive_evals: r.get::<_, i64>(2)? as u32,
                    negative_evals: r.get::<_, i64>(3)? as u32,
                    last_updated: parse_timestamp(&last_updated).unwrap_or_else(Utc::now),
                })
            })
            .and_then(Iterator::collect)
            .map_err(|e| op_err("tag_relevance_rows", e))?;
        Ok(rows)
    }

    fn tag_relevance_for_tags(&self, id: EngramId, tags: &[String]) -> Result<Vec<TagRelevance>> {
        Ok(self
            .tag_relevance_rows(id)?
            .into_iter()
            .filter(|r| tags.iter().any(|t| t == &r.tag))
            .collect())
    }

    fn unprocessed_session_audits(&self) -> Result<Vec<(SessionAudit, ProcessedSessionMarker)>> {
        let guard = acquire_lock(&self.conn);
        let mut stmt = guard
            .prepare(
                "SELECT a.session_id, a.shown_engram_ids, a.env_tags, a.repo, a.transcript_path,
                        a.created_at, p.status, p.retry_count, p.processed_at
                 FROM session_audit a
                 LEFT JOIN processed_sessions p ON p.session_id = a.session_id
                 ORDER BY a.created_at",
            )
            .map_err(|e| op_err("unprocessed_session_audits", e))?;

        let rows: Vec<(SessionAudit, ProcessedSessionMarker)> = stmt
            .query_map([], |r| {
                let session_id: String = r.get(0)?;
                let ids_json: String = r.get(1)?;
                let tags_json: String = r.get(2)?;
                let created_at: String = r.get(5)?;
                let status: Option<String> = r.get(6)?;
                let retry_count: Option<i64> = r.get(7)?;
                let processed_at: Option<String> = r.get(8)?;

                let audit = SessionAudit {
                    session_id: session_id.clone(),
                    shown_engram_ids: serde_json::from_str::<Vec<i64>>(&ids_json)
                        .unwrap_or_default()
                        .into_iter()
                        .map(EngramId::new)
                        .collect(),
                    env_tags: serde_json::from_str(&tags_json).unwrap_or_default(),
                    repo: r.get(3)?,
                    transcript_path: r.get(4)?,
                    created_at: parse_timestamp(&created_at).unwrap_or_else(Utc::now),
                };

                let marker = ProcessedSessionMarker {
                    session_id,
                    status: status
                        .as_deref()
                        .map(|s| if s == "completed" { SessionStatus::Completed } else { SessionStatus::Failed })
                        .unwrap_or(SessionStatus::Failed),
                    retry_count: retry_count.unwrap_or(0) as u32,
                    processed_at: processed_at
                        .as_deref()
                        .and_then(parse_timestamp)
                        .unwrap_or_else(Utc::now),
                };

                Ok((audit, marker))
            })
            .and_then(Iterator::collect)
            .map_err(|e| op_err("unprocessed_session_audits", e))?;

        Ok(rows
            .into_iter()
            .filter(|(_, marker)| marker.is_retryable())
            .collect())
    }

    fn mark_session_processed(&self, session_id: &str, status: SessionStatus, now: DateTime<Utc>) -> Result<()> {
        let guard = acquire_lock(&self.conn);
        let status_str = match status {
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
        };
        guard
            .execute(
                "INSERT INTO processed_sessions (session_id, status, retry_count, processed_at)
                 VALUES (?1, ?2, 0, ?3)
                 ON CONFLICT(session_id) DO UPDATE SET
                    status = ?2,
                    retry_count = retry_count + CASE WHEN ?2 = 'failed' THEN 1 ELSE 0 END,
                    processed_at = ?3",
                params![session_id, status_str, now.to_rfc3339()],
            )
            .map_err(|e| op_err("mark_session_processed", e))?;
        Ok(())
    }

    fn list_unverified(&self, limit: Option<usize>) -> Result<Vec<Engram>> {
        let guard = acquire_lock(&self.conn);
        let sql = match limit {
            Some(n) => format!(
                "SELECT * FROM engrams WHERE deprecated = 0 AND dedup_verified = 0 ORDER BY id LIMIT {n}"
            ),
            None => "SELECT * FROM engrams WHERE deprecated = 0 AND dedup_verified = 0 ORDER BY id".to_string(),
        };
        let mut stmt = guard.prepare(&sql).map_err(|e| op_err("list_unverified", e))?;
        let rows: Vec<Engram> = stmt
            .query_map([], row_to_engram)
            .and_then(Iterator::collect)
            .map_err(|e| op_err("list_unverified", e))?;
        Ok(rows)
    }

    fn list_verified(&self) -> Result<Vec<Engram>> {
        let guard = acquire_lock(&self.conn);
        let mut stmt = guard
            .prepare("SELECT * FROM engrams WHERE deprecated = 0 AND dedup_verified = 1 ORDER BY id")
            .map_err(|e| op_err("list_verified", e))?;
        let rows: Vec<Engram> = stmt
            .query_map([], row_to_engram)
            .and_then(Iterator::collect)
            .map_err(|e| op_err("list_verified", e))?;
        Ok(rows)
    }

    fn mark_verified(&self, id: EngramId) -> Result<()> {
        let guard = acquire_lock(&self.conn);
        guard
            .execute("UPDATE engrams SET dedup_verified = 1 WHERE id = ?1", params![id.as_i64()])
            .map_err(|e| op_err("mark_verified", e))?;
        Ok(())
    }

    fn record_dedup_error(&self, id: EngramId, reason: &str) -> Result<()> {
        let guard = acquire_lock(&self.conn);
        guard
            .execute("UPDATE engrams SET dedup_error = ?1 WHERE id = ?2", params![reason, id.as_i64()])
            .map_err(|e| op_err("record_dedup_error", e))?;
        Ok(())
    }

    fn is_extraction_processed(&self, session_id: &str) -> Result<bool> {
        let guard = acquire_lock(&self.conn);
        let found: Option<i64> = guard
            .query_row(
                "SELECT 1 FROM extraction_sessions WHERE session_id = ?1",
                params![session_id],
                |r| r.get(0),
            )
            .optional()
            .map_err(|e| op_err("is_extraction_processed", e))?;
        Ok(found.is_some())
    }

    fn mark_extraction_processed(
        &self,
        session_id: &str,
        had_friction: bool,
        lessons_extracted: u32,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let guard = acquire_lock(&self.conn);
        guard
            .execute(
                "INSERT INTO extraction_sessions (session_id, had_friction, lessons_extracted, processed_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(session_id) DO UPDATE SET
                    had_friction = excluded.had_friction,
                    lessons_extracted = excluded.lessons_extracted,
                    processed_at = excluded.processed_at",
                params![session_id, i64::from(had_friction), lessons_extracted, now.to_rfc3339()],
            )
            .map_err(|e| op_err("mark_extraction_processed", e))?;
        Ok(())
    }

    fn session_audit(&self, session_id: &str) -> Result<Option<SessionAudit>> {
        let guard = acquire_lock(&self.conn);
        guard
            .query_row(
                "SELECT shown_engram_ids, env_tags, repo, transcript_path, created_at
                 FROM session_audit WHERE session_id = ?1",
                params![session_id],
                |r| {
                    let ids_json: String = r.get(0)?;
                    let tags_json: String = r.get(1)?;
                    let created_at: String = r.get(4)?;
                    Ok(SessionAudit {
                        session_id: session_id.to_string(),
                        shown_engram_ids: serde_json::from_str::<Vec<i64>>(&ids_json)
                            .unwrap_or_default()
                            .into_iter()
                            .map(EngramId::new)
                            .collect(),
                        env_tags: serde_json::from_str(&tags_json).unwrap_or_default(),
                        repo: r.get(2)?,
                        transcript_path: r.get(3)?,
                        created_at: parse_timestamp(&created_at).unwrap_or_else(Utc::now),
                    })
                },
            )
            .optional()
            .map_err(|e| op_err("session_audit", e))
    }

    fn session_audits_missing_tags(&self) -> Result<Vec<SessionAudit>> {
        let guard = acquire_lock(&self.conn);
        let mut stmt = guard
            .prepare(
                "SELECT session_id, shown_engram_ids, env_tags, repo, transcript_path, created_at
                 FROM session_audit WHERE env_tags = '[]' ORDER BY created_at ASC",
            )
            .map_err(|e| op_err("session_audits_missing_tags", e))?;
        let rows = stmt
            .query_map([], |r| {
                let session_id: String = r.get(0)?;
                let ids_json: String = r.get(1)?;
                let created_at: String = r.get(5)?;
                Ok(SessionAudit {
                    session_id,
                    shown_engram_ids: serde_json::from_str::<Vec<i64>>(&ids_json)
                        .unwrap_or_default()
                        .into_iter()
                        .map(EngramId::new)
                        .collect(),
                    env_tags: Vec::new(),
                    repo: r.get(3)?,
                    transcript_path: r.get(4)?,
                    created_at: parse_timestamp(&created_at).unwrap_or_else(Utc::now),
                })
            })
            .map_err(|e| op_err("session_audits_missing_tags", e))?;
        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(|e| op_err("session_audits_missing_tags", e))
    }

    fn backfill_session_tags(&self, session_id: &str, repo: Option<&str>, tags: &[String]) -> Result<bool> {
        let guard = acquire_lock(&self.conn);
        let tags_json = serde_json::to_string(tags).unwrap_or_default();
        let changed = match repo {
            Some(repo) => guard
                .execute(
                    "UPDATE session_audit SET env_tags = ?1
                     WHERE session_id = ?2 AND repo = ?3",
                    params![tags_json, session_id, repo],
                )
                .map_err(|e| op_err("backfill_session_tags", e))?,
            None => guard
                .execute(
                    "UPDATE session_audit SET env_tags = ?1
                     WHERE session_id = ?2 AND repo IS NULL",
                    params![tags_json, session_id],
                )
                .map_err(|e| op_err("backfill_session_tags", e))?,
        };
        Ok(changed > 0)
    }

    fn fold_duplicate_sessions(&self, id: EngramId, new_sessions: &[String], now: DateTime<Utc>) -> Result<()> {
        let guard = acquire_lock(&self.conn);
        let existing = Self::fetch_one(&guard, id).map_err(|e| op_err("fold_duplicate_sessions", e))?;
        let Some(existing) = existing else {
            return Err(Error::InvalidInput(format!("engram {id} does not exist")));
        };

        let mut sessions = existing.source_sessions;
        for session in new_sessions {
            if !sessions.contains(session) {
                sessions.push(session.clone());
            }
        }
        let sessions_json = serde_json::to_string(&sessions).unwrap_or_default();
        let occurrence = sessions.len() as i64;

        guard
            .execute(
                "UPDATE engrams SET source_sessions = ?1, occurrence_count = ?2, updated_at = ?3 WHERE id = ?4",
                params![sessions_json, occurrence, now.to_rfc3339(), id.as_i64()],
            )
            .map_err(|e| op_err("fold_duplicate_sessions", e))?;
        Ok(())
    }
}
