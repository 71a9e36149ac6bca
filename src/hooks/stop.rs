//! Stop hook handler.

use std::sync::Arc;

use chrono::Utc;

use super::{HookContext, HookHandler};
use crate::Result;
use crate::models::SessionAudit;

/// Handles `Stop` hook events: writes the write-once session-audit row
/// from the shown-lesson log accumulated over the session, then clears
/// that log (§5 ordering guarantee — `record_shown -> write_session_audit
/// -> clear_shown` in end-of-session order). Never errors out of turn:
/// a session with nothing shown still gets an (empty) audit row, so the
/// evaluator has a stable population of sessions to consider.
pub struct StopHandler {
    context: Arc<HookContext>,
}

impl StopHandler {
    /// Creates a new handler over the shared hook capabilities.
    #[must_use]
    pub const fn new(context: Arc<HookContext>) -> Self {
        Self { context }
    }
}

impl HookHandler for StopHandler {
    fn event_type(&self) -> &'static str {
        "Stop"
    }

    fn handle(&self, input: &serde_json::Value) -> Result<serde_json::Value> {
        let session_id = input.get("session_id").and_then(serde_json::Value::as_str).unwrap_or("");
        if session_id.is_empty() {
            return Ok(serde_json::json!({}));
        }

        let shown_engram_ids = self.context.store.shown_in_session(session_id)?;
        let env = self.context.environment.probe();
        let transcript_path = input
            .get("transcript_path")
            .and_then(serde_json::Value::as_str)
            .map(str::to_string);

        let audit = SessionAudit {
            session_id: session_id.to_string(),
            shown_engram_ids,
            env_tags: env.tags,
            repo: env.repo,
            transcript_path,
            created_at: Utc::now(),
        };

        if self.context.store.write_session_audit(&audit)? {
            self.context.store.clear_shown(session_id)?;
        }

        Ok(serde_json::json!({}))
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::Mutex as StdMutex;

    use rusqlite::Connection;

    use super::*;
    use crate::context::{Environment, EnvironmentProbe};
    use crate::embedding::FallbackEmbedder;
    use crate::models::{EngramId, Prerequisites, Source};
    use crate::services::HybridRetriever;
    use crate::storage::sqlite::schema;
    use crate::storage::{EngramStore, SqliteEngramStore, VectorIndex};

    struct FixedEnvironment(Environment);

    impl EnvironmentProbe for FixedEnvironment {
        fn probe(&self) -> Environment {
            self.0.clone()
        }
    }

    struct EmptyVectorIndex;

    impl VectorIndex for EmptyVectorIndex {
        fn dimensions(&self) -> usize {
            FallbackEmbedder::DEFAULT_DIMENSIONS
        }
        fn len(&self) -> usize {
            0
        }
        fn build(&self, _items: &[(EngramId, Vec<f32>)]) -> Result<()> {
            Ok(())
        }
        fn search(&self, _query: &[f32], _k: usize) -> Result<Vec<(EngramId, f32)>> {
            Ok(Vec::new())
        }
    }

    fn context() -> (Arc<dyn EngramStore>, Arc<HookContext>) {
        let conn = StdMutex::new(Connection::open_in_memory().unwrap());
        schema::migrate(&conn).unwrap();
        let store: Arc<dyn EngramStore> = Arc::new(SqliteEngramStore::new(conn));

        let environment: Arc<dyn EnvironmentProbe> = Arc::new(FixedEnvironment(Environment {
            os: "linux".to_string(),
            repo: Some("my-repo".to_string()),
            cwd: PathBuf::from("/home/user/project"),
            mcp_servers: vec![],
            tags: vec!["rust".to_string()],
        }));
        let retriever = Arc::new(HybridRetriever::new(
            Arc::clone(&store),
            Arc::new(EmptyVectorIndex),
            Arc::new(FallbackEmbedder::new()),
            Arc::clone(&environment),
        ));
        let context = Arc::new(HookContext {
            store: Arc::clone(&store),
            retriever,
            environment,
            config: crate::config::EngrammarConfig::default(),
        });
        (store, context)
    }

    #[test]
    fn writes_audit_and_clears_shown_log() {
        let (store, context) = context();
        let id = store
            .add(
                "some lesson",
                "rust/errors",
                &[],
                Source::Manual,
                None,
                Prerequisites::default(),
                chrono::Utc::now(),
            )
            .unwrap();
        store.record_shown("s1", id, "UserPromptSubmit").unwrap();

        let handler = StopHandler::new(context);
        handler.handle(&serde_json::json!({"session_id": "s1"})).unwrap();

        let audit = store.session_audit("s1").unwrap().unwrap();
        assert_eq!(audit.shown_engram_ids, vec![id]);
        assert_eq!(audit.repo.as_deref(), Some("my-repo"));
        assert_eq!(audit.env_tags, vec!["rust".to_string()]);
        assert!(store.shown_in_session("s1").unwrap().is_empty());
    }

    #[test]
    fn second_call_is_write_once_and_does_not_reclear() {
        let (store, context) = context();
        let handler = StopHandler::new(context);
        handler.handle(&serde_json::json!({"session_id": "s1"})).unwrap();
        let first = store.session_audit("s1").unwrap().unwrap();

        // A later Stop for the same session id (e.g. a retry) must not
        // overwrite the first audit row.
        store.record_shown("s1", EngramId::new(999), "UserPromptSubmit").unwrap();
        handler.handle(&serde_json::json!({"session_id": "s1"})).unwrap();
        let second = store.session_audit("s1").unwrap().unwrap();
        assert_eq!(first.created_at, second.created_at);
        assert_eq!(second.shown_engram_ids, first.shown_engram_ids);
    }

    #[test]
    fn missing_session_id_is_a_noop() {
        let (_, context) = context();
        let handler = StopHandler::new(context);
        let out = handler.handle(&serde_json::json!({})).unwrap();
        assert_eq!(out, serde_json::json!({}));
    }
}
