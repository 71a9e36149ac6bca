//! User prompt submit hook handler.

use std::sync::Arc;

use super::{HookContext, HookHandler, additional_context_response, format_injection_block};
use crate::Result;
use crate::models::SearchFilter;

/// Handles `UserPromptSubmit` hook events: runs the hybrid retriever
/// against the prompt text and injects the top results (§4.D, gated by
/// `hooks.prompt_enabled` and capped by `display.max_engrams_per_prompt`).
pub struct UserPromptHandler {
    context: Arc<HookContext>,
}

impl UserPromptHandler {
    /// Creates a new handler over the shared hook capabilities.
    #[must_use]
    pub const fn new(context: Arc<HookContext>) -> Self {
        Self { context }
    }
}

impl HookHandler for UserPromptHandler {
    fn event_type(&self) -> &'static str {
        "UserPromptSubmit"
    }

    fn handle(&self, input: &serde_json::Value) -> Result<serde_json::Value> {
        if !self.context.config.hooks.prompt_enabled {
            return Ok(serde_json::json!({}));
        }

        let prompt = input.get("prompt").and_then(serde_json::Value::as_str).unwrap_or("");
        if prompt.trim().is_empty() {
            return Ok(serde_json::json!({}));
        }
        let session_id = input.get("session_id").and_then(serde_json::Value::as_str).unwrap_or("");

        let hits = self.context.retriever.search(
            prompt,
            &SearchFilter::default(),
            self.context.config.prompt_result_cap(),
            session_id,
            self.event_type(),
        )?;
        if hits.is_empty() {
            return Ok(serde_json::json!({}));
        }

        let ids: Vec<_> = hits.iter().map(|h| h.engram_id).collect();
        let engrams = self.context.store.get_many(&ids)?;
        let lines: Vec<_> =
            engrams.iter().map(|e| (e.id, e.category.as_str(), e.text.as_str())).collect();
        let block = format_injection_block(&lines, self.context.config.display.show_categories);
        Ok(additional_context_response(block))
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
            repo: None,
            cwd: PathBuf::from("/home/user/project"),
            mcp_servers: vec![],
            tags: vec![],
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
    fn injects_lexical_match_for_prompt() {
        let (store, context) = context();
        store
            .add(
                "use rebase instead of merge for feature branches",
                "git/workflow",
                &[],
                Source::Manual,
                None,
                Prerequisites::default(),
                chrono::Utc::now(),
            )
            .unwrap();

        let handler = UserPromptHandler::new(context);
        let out = handler
            .handle(&serde_json::json!({"session_id": "s1", "prompt": "how do I rebase a branch?"}))
            .unwrap();
        let text = out["hookSpecificOutput"]["additionalContext"].as_str().unwrap();
        assert!(text.contains("rebase instead of merge"));
    }

    #[test]
    fn empty_prompt_returns_empty_object() {
        let (_, context) = context();
        let handler = UserPromptHandler::new(context);
        let out = handler.handle(&serde_json::json!({"session_id": "s1", "prompt": "  "})).unwrap();
        assert_eq!(out, serde_json::json!({}));
    }

    #[test]
    fn disabled_hook_returns_empty_object() {
        let (store, enabled_context) = context();
        let mut config = crate::config::EngrammarConfig::default();
        config.hooks.prompt_enabled = false;
        let context = Arc::new(HookContext {
            store,
            retriever: Arc::clone(&enabled_context.retriever),
            environment: Arc::clone(&enabled_context.environment),
            config,
        });
        let handler = UserPromptHandler::new(context);
        let out = handler
            .handle(&serde_json::json!({"session_id": "s1", "prompt": "how do I rebase?"}))
            .unwrap();
        assert_eq!(out, serde_json::json!({}));
    }
}
