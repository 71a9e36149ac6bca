//! Table and FTS5 index creation.
//!
//! Mirrors the original lessons/categories/stats tables, extended with the
//! session-audit ledger, processed-session markers, shown-lesson log, and
//! tag-relevance table the data model adds on top of them.

use crate::Result;
use crate::storage::sqlite::connection::acquire_lock;
use rusqlite::Connection;
use std::sync::Mutex;

const SCHEMA_SQL: &str = r"
CREATE TABLE IF NOT EXISTS engrams (
    id INTEGER PRIMARY KEY,
    text TEXT NOT NULL,
    category TEXT NOT NULL,
    category_level1 TEXT,
    category_level2 TEXT,
    category_level3 TEXT,
    source TEXT NOT NULL DEFAULT 'manual',
    source_sessions TEXT NOT NULL DEFAULT '[]',
    occurrence_count INTEGER NOT NULL DEFAULT 1,
    deprecated INTEGER NOT NULL DEFAULT 0,
    pinned INTEGER NOT NULL DEFAULT 0,
    dedup_verified INTEGER NOT NULL DEFAULT 0,
    prerequisites TEXT,
    times_matched INTEGER NOT NULL DEFAULT 0,
    last_matched TEXT,
    merged_into INTEGER,
    dedup_error TEXT,
    merge_metadata TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_engrams_category ON engrams(category);
CREATE INDEX IF NOT EXISTS idx_engrams_level1 ON engrams(category_level1);
CREATE INDEX IF NOT EXISTS idx_engrams_deprecated ON engrams(deprecated);
CREATE INDEX IF NOT EXISTS idx_engrams_pinned ON engrams(pinned);

CREATE TABLE IF NOT EXISTS categories (
    path TEXT PRIMARY KEY
);

CREATE TABLE IF NOT EXISTS engram_categories (
    engram_id INTEGER NOT NULL REFERENCES engrams(id),
    category_path TEXT NOT NULL,
    PRIMARY KEY (engram_id, category_path)
);

CREATE TABLE IF NOT EXISTS engram_repo_stats (
    engram_id INTEGER NOT NULL REFERENCES engrams(id),
    repo TEXT NOT NULL,
    count INTEGER NOT NULL DEFAULT 0,
    last_matched TEXT,
    PRIMARY KEY (engram_id, repo)
);

CREATE TABLE IF NOT EXISTS engram_tag_set_stats (
    engram_id INTEGER NOT NULL REFERENCES engrams(id),
    tag_set TEXT NOT NULL,
    count INTEGER NOT NULL DEFAULT 0,
    last_matched TEXT,
    PRIMARY KEY (engram_id, tag_set)
);

CREATE TABLE IF NOT EXISTS engram_tag_relevance (
    engram_id INTEGER NOT NULL REFERENCES engrams(id),
    tag TEXT NOT NULL,
    ema REAL NOT NULL DEFAULT 0.0,
    positive_evals INTEGER NOT NULL DEFAULT 0,
    negative_evals INTEGER NOT NULL DEFAULT 0,
    last_updated TEXT NOT NULL,
    PRIMARY KEY (engram_id, tag)
);

CREATE TABLE IF NOT EXISTS session_audit (
    session_id TEXT PRIMARY KEY,
    shown_engram_ids TEXT NOT NULL DEFAULT '[]',
    env_tags TEXT NOT NULL DEFAULT '[]',
    repo TEXT,
    transcript_path TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS processed_sessions (
    session_id TEXT PRIMARY KEY,
    status TEXT NOT NULL,
    retry_count INTEGER NOT NULL DEFAULT 0,
    processed_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS shown_lessons (
    session_id TEXT NOT NULL,
    engram_id INTEGER NOT NULL REFERENCES engrams(id),
    source_hook_event TEXT NOT NULL,
    PRIMARY KEY (session_id, engram_id)
);

CREATE TABLE IF NOT EXISTS extraction_sessions (
    session_id TEXT PRIMARY KEY,
    had_friction INTEGER NOT NULL DEFAULT 0,
    lessons_extracted INTEGER NOT NULL DEFAULT 0,
    processed_at TEXT NOT NULL
);

CREATE VIRTUAL TABLE IF NOT EXISTS engrams_fts USING fts5(
    text,
    category,
    content='engrams',
    content_rowid='id'
);

CREATE TRIGGER IF NOT EXISTS engrams_fts_insert AFTER INSERT ON engrams BEGIN
    INSERT INTO engrams_fts(rowid, text, category) VALUES (new.id, new.text, new.category);
END;

CREATE TRIGGER IF NOT EXISTS engrams_fts_delete AFTER DELETE ON engrams BEGIN
    INSERT INTO engrams_fts(engrams_fts, rowid, text, category) VALUES ('delete', old.id, old.text, old.category);
END;

CREATE TRIGGER IF NOT EXISTS engrams_fts_update AFTER UPDATE ON engrams BEGIN
    INSERT INTO engrams_fts(engrams_fts, rowid, text, category) VALUES ('delete', old.id, old.text, old.category);
    INSERT INTO engrams_fts(rowid, text, category) VALUES (new.id, new.text, new.category);
END;
";

/// Creates all tables, indices, and the FTS5 shadow table if they do not
/// already exist. Safe to call on every process start.
///
/// # Errors
/// Returns an error if the DDL batch fails.
pub fn migrate(conn: &Mutex<Connection>) -> Result<()> {
    let guard = acquire_lock(conn);
    guard.execute_batch(SCHEMA_SQL).map_err(|e| crate::Error::OperationFailed {
        operation: "schema_migrate".to_string(),
        cause: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrate_is_idempotent() {
        let conn = Mutex::new(Connection::open_in_memory().unwrap());
        migrate(&conn).unwrap();
        migrate(&conn).unwrap();

        let guard = conn.lock().unwrap();
        let count: i64 = guard
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='engrams'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn fts_table_stays_in_sync_with_inserts() {
        let conn = Mutex::new(Connection::open_in_memory().unwrap());
        migrate(&conn).unwrap();
        let guard = conn.lock().unwrap();
        guard
            .execute(
                "INSERT INTO engrams (text, category, created_at, updated_at) VALUES (?, ?, ?, ?)",
                rusqlite::params!["use rebase not merge", "git/workflow", "now", "now"],
            )
            .unwrap();
        let matched: i64 = guard
            .query_row(
                "SELECT COUNT(*) FROM engrams_fts WHERE engrams_fts MATCH 'rebase'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(matched, 1);
    }
}
