//! Pre-tool-use hook handler.

use std::sync::Arc;

use super::{HookContext, HookHandler, additional_context_response, format_injection_block};
use crate::Result;
use crate::models::SearchFilter;
use crate::services::build_tool_query;

/// Handles `PreToolUse` hook events: builds a query from the tool name
/// and its well-known input fields (§4.D closing paragraph) and injects
/// the top results, gated by `hooks.tool_use_enabled` and
/// `hooks.skip_tools`, capped by `display.max_engrams_per_tool`.
pub struct PreToolUseHandler {
    context: Arc<HookContext>,
}

impl PreToolUseHandler {
    /// Creates a new handler over the shared hook capabilities.
    #[must_use]
    pub const fn new(context: Arc<HookContext>) -> Self {
        Self { context }
    }
}

impl HookHandler for PreToolUseHandler {
    fn event_type(&self) -> &'static str {
        "PreToolUse"
    }

    fn handle(&self, input: &serde_json::Value) -> Result<serde_json::Value> {
        if !self.context.config.hooks.tool_use_enabled {
            return Ok(serde_json::json!({}));
        }

        let tool_name = input.get("tool_name").and_then(serde_json::Value::as_str).unwrap_or("");
        if tool_name.is_empty() || self.context.config.hooks.skip_tools.iter().any(|t| t == tool_name) {
            return Ok(serde_json::json!({}));
        }

        let empty_input = serde_json::json!({});
        let tool_input = input.get("tool_input").unwrap_or(&empty_input);
        let query = build_tool_query(tool_name, tool_input);
        let session_id = input.get("session_id").and_then(serde_json::Value::as_str).unwrap_or("");

        let hits = self.context.retriever.search(
            &query,
            &SearchFilter::default(),
            self.context.config.tool_result_cap(),
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
    fn injects_match_for_tool_input() {
        let (store, context) = context();
        store
            .add(
                "grep before editing to find all call sites",
                "workflow/search",
                &[],
                Source::Manual,
                None,
                Prerequisites::default(),
                chrono::Utc::now(),
            )
            .unwrap();

        let handler = PreToolUseHandler::new(context);
        let out = handler
            .handle(&serde_json::json!({
                "session_id": "s1",
                "tool_name": "Grep",
                "tool_input": {"pattern": "call sites"},
            }))
            .unwrap();
        let text = out["hookSpecificOutput"]["additionalContext"].as_str().unwrap();
        assert!(text.contains("call sites"));
    }

    #[test]
    fn skipped_tool_returns_empty_object() {
        let (_, context) = context();
        let handler = PreToolUseHandler::new(context);
        let out = handler
            .handle(&serde_json::json!({"session_id": "s1", "tool_name": "TodoWrite", "tool_input": {}}))
            .unwrap();
        assert_eq!(out, serde_json::json!({}));
    }

    #[test]
    fn disabled_hook_returns_empty_object() {
        let (store, enabled_context) = context();
        let mut config = crate::config::EngrammarConfig::default();
        config.hooks.tool_use_enabled = false;
        let context = Arc::new(HookContext {
            store,
            retriever: Arc::clone(&enabled_context.retriever),
            environment: Arc::clone(&enabled_context.environment),
            config,
        });
        let handler = PreToolUseHandler::new(context);
        let out = handler
            .handle(&serde_json::json!({"session_id": "s1", "tool_name": "Grep", "tool_input": {}}))
            .unwrap();
        assert_eq!(out, serde_json::json!({}));
    }
}
