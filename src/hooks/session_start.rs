//! Session start hook handler.

use std::sync::Arc;

use super::{HookContext, HookHandler, additional_context_response, format_injection_block};
use crate::Result;

/// Handles `SessionStart` hook events: injects every pinned engram whose
/// prerequisites match the current environment (§4.D `pinned()`). Pinned
/// engrams bypass ranking entirely, so this runs before any query text
/// even exists.
pub struct SessionStartHandler {
    context: Arc<HookContext>,
}

impl SessionStartHandler {
    /// Creates a new handler over the shared hook capabilities.
    #[must_use]
    pub const fn new(context: Arc<HookContext>) -> Self {
        Self { context }
    }
}

impl HookHandler for SessionStartHandler {
    fn event_type(&self) -> &'static str {
        "SessionStart"
    }

    fn handle(&self, _input: &serde_json::Value) -> Result<serde_json::Value> {
        let pinned = self.context.retriever.pinned()?;
        let lines: Vec<_> =
            pinned.iter().map(|e| (e.id, e.category.as_str(), e.text.as_str())).collect();
        let block = format_injection_block(&lines, self.context.config.display.show_categories);
        Ok(additional_context_response(block))
    }
}
